//! Routes manifest: the routes directory compiled into routable pages and
//! endpoints.
//!
//! ```text
//! src/routes/
//!   $layout.mod          root layout
//!   $error.mod           error page
//!   index.mod            /
//!   about.mod            /about
//!   blog/
//!     $layout.mod        layout for everything under /blog
//!     index.mod          /blog
//!     [slug].mod         /blog/:slug
//!     [slug].api.mod     endpoint for /blog/:slug
//!   docs/[...path].mod   /docs/*
//!   _components/         ignored
//! ```

pub mod pattern;

pub use pattern::{ParamValue, Params, Part, RoutePattern, Segment, SegmentRank};

use crate::config::KitConfig;
use crate::error::Error;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

const MODULE_EXT: &str = ".mod";
const ENDPOINT_SUFFIX: &str = ".api";
const LAYOUT: &str = "$layout";
const ERROR: &str = "$error";

/// A module file under the routes directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    /// Path relative to the routes directory, `/`-separated.
    pub file: String,
    /// URL the module is loaded from.
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PageData {
    /// Route path, e.g. `/blog/[slug]`.
    pub path: String,
    pub pattern: RoutePattern,
    pub params: Vec<String>,
    /// Nested layouts, outermost first, followed by the page itself.
    pub parts: Vec<Component>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointData {
    pub path: String,
    pub pattern: RoutePattern,
    pub params: Vec<String>,
    pub file: String,
    pub url: String,
}

/// A static asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Asset {
    /// Path relative to the assets directory, `/`-separated.
    pub file: String,
    pub size: u64,
    pub mime_type: Option<&'static str>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ManifestData {
    pub assets: Vec<Asset>,
    pub layout: Option<Component>,
    pub error: Option<Component>,
    pub pages: Vec<PageData>,
    pub endpoints: Vec<EndpointData>,
}

/// Build the manifest for the project at `root`.
pub fn create_manifest_data(config: &KitConfig, root: &Path) -> Result<ManifestData, Error> {
    let files = config.resolve_files(root);
    let mut manifest = scan_routes(&files.routes, &config.routes_url())?;
    manifest.assets = scan_assets(&files.assets)?;
    debug!(
        pages = manifest.pages.len(),
        endpoints = manifest.endpoints.len(),
        assets = manifest.assets.len(),
        "Built routes manifest"
    );
    Ok(manifest)
}

/// Route being built, with its sort key.
struct Route {
    segments: Vec<Segment>,
    path: String,
    component: Component,
}

impl Route {
    fn sort_key(&self) -> (bool, Vec<SegmentRank>, &str) {
        let ranks: Vec<SegmentRank> = self.segments.iter().map(Segment::rank).collect();
        let has_rest = ranks.contains(&SegmentRank::Rest);
        (has_rest, ranks, &self.path)
    }

    fn dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.component.file.split('/').map(str::to_string).collect();
        dirs.pop();
        dirs
    }
}

/// Scan `dir` into pages, endpoints, root layout and error component.
///
/// A missing directory yields an empty manifest.
pub fn scan_routes(dir: &Path, url_prefix: &str) -> Result<ManifestData, Error> {
    let mut manifest = ManifestData::default();
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "Routes directory does not exist");
        return Ok(manifest);
    }

    let url_prefix = url_prefix.trim_end_matches('/');
    let mut pages = Vec::new();
    let mut endpoints = Vec::new();
    let mut layouts: HashMap<Vec<String>, Component> = HashMap::new();

    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_ignored(e));

    for entry in walker {
        let entry = entry.map_err(|e| Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file) = relative_file(dir, entry.path()) else {
            continue;
        };
        let Some(stem) = file.rsplit('/').next().and_then(|n| n.strip_suffix(MODULE_EXT)) else {
            continue;
        };
        let stem = stem.to_string();

        let component = Component {
            url: format!("{url_prefix}/{file}"),
            file: file.clone(),
        };
        let mut dirs: Vec<String> = file.split('/').map(str::to_string).collect();
        dirs.pop();

        if stem == LAYOUT {
            layouts.insert(dirs, component);
            continue;
        }
        if stem == ERROR {
            if dirs.is_empty() {
                manifest.error = Some(component);
            } else {
                debug!(file = %file, "Nested error components are not supported; ignoring");
            }
            continue;
        }

        let (name, is_endpoint) = match stem.strip_suffix(ENDPOINT_SUFFIX) {
            Some(name) => (name.to_string(), true),
            None => (stem.clone(), false),
        };

        let mut names = dirs;
        if name != "index" {
            names.push(name);
        }
        let segments = names
            .iter()
            .map(|n| Segment::parse(n))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|message| Error::InvalidRoute {
                file: file.clone(),
                message,
            })?;

        let route = Route {
            path: format!("/{}", names.join("/")),
            segments,
            component,
        };
        if is_endpoint {
            endpoints.push(route);
        } else {
            pages.push(route);
        }
    }

    manifest.layout = layouts.remove(&Vec::<String>::new());

    pages.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    endpoints.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));

    let mut seen = HashMap::new();
    for route in pages {
        let pattern = build_pattern(&route)?;
        check_conflict(&mut seen, &pattern, &route.component.file)?;

        let mut parts = Vec::new();
        let dirs = route.dirs();
        for depth in 1..=dirs.len() {
            if let Some(layout) = layouts.get(&dirs[..depth]) {
                parts.push(layout.clone());
            }
        }
        parts.push(route.component);

        manifest.pages.push(PageData {
            params: pattern.param_names().map(str::to_string).collect(),
            path: route.path,
            pattern,
            parts,
        });
    }

    let mut seen = HashMap::new();
    for route in endpoints {
        let pattern = build_pattern(&route)?;
        check_conflict(&mut seen, &pattern, &route.component.file)?;
        manifest.endpoints.push(EndpointData {
            params: pattern.param_names().map(str::to_string).collect(),
            path: route.path,
            pattern,
            file: route.component.file,
            url: route.component.url,
        });
    }

    Ok(manifest)
}

/// List every file under the assets directory.
pub fn scan_assets(dir: &Path) -> Result<Vec<Asset>, Error> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut assets = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file) = relative_file(dir, entry.path()) else {
            continue;
        };
        let size = entry
            .metadata()
            .map_err(|e| Error::other(e.to_string()))?
            .len();
        assets.push(Asset {
            mime_type: mime_type(&file),
            file,
            size,
        });
    }
    Ok(assets)
}

fn build_pattern(route: &Route) -> Result<RoutePattern, Error> {
    RoutePattern::new(&route.segments).map_err(|message| Error::InvalidRoute {
        file: route.component.file.clone(),
        message,
    })
}

fn check_conflict(seen: &mut HashMap<String, String>, pattern: &RoutePattern, file: &str) -> Result<(), Error> {
    if let Some(first) = seen.get(pattern.as_str()) {
        return Err(Error::RouteConflict {
            first: first.clone(),
            second: file.to_string(),
            pattern: pattern.as_str().to_string(),
        });
    }
    seen.insert(pattern.as_str().to_string(), file.to_string());
    Ok(())
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('_') || name.starts_with('.'))
}

fn relative_file(root: &Path, path: &Path) -> Option<String> {
    let relative: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
    let parts: Option<Vec<&str>> = relative.iter().map(|c| c.to_str()).collect();
    Some(parts?.join("/"))
}

fn mime_type(file: &str) -> Option<&'static str> {
    let ext = file.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn touch(root: &Path, file: &str) {
        let path = root.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    fn page_paths(manifest: &ManifestData) -> Vec<&str> {
        manifest.pages.iter().map(|p| p.path.as_str()).collect()
    }

    #[test]
    fn test_scan_pages_and_endpoints() {
        let dir = tempdir().unwrap();
        for file in [
            "$layout.mod",
            "$error.mod",
            "index.mod",
            "about.mod",
            "blog/index.mod",
            "blog/[slug].mod",
            "blog/[slug].api.mod",
            "docs/[...path].mod",
            "_components/button.mod",
            ".hidden.mod",
            "notes.txt",
        ] {
            touch(dir.path(), file);
        }

        let manifest = scan_routes(dir.path(), "/_app/routes").unwrap();

        assert_eq!(
            page_paths(&manifest),
            vec!["/", "/about", "/blog", "/blog/[slug]", "/docs/[...path]"]
        );
        assert_eq!(
            manifest.layout.as_ref().map(|c| c.url.as_str()),
            Some("/_app/routes/$layout.mod")
        );
        assert_eq!(
            manifest.error.as_ref().map(|c| c.file.as_str()),
            Some("$error.mod")
        );

        assert_eq!(manifest.endpoints.len(), 1);
        assert_eq!(manifest.endpoints[0].path, "/blog/[slug]");
        assert_eq!(manifest.endpoints[0].params, vec!["slug"]);
        assert_eq!(manifest.endpoints[0].url, "/_app/routes/blog/[slug].api.mod");
    }

    #[test]
    fn test_static_before_dynamic_before_rest() {
        let dir = tempdir().unwrap();
        for file in ["[...all].mod", "[id].mod", "post-[id].mod", "new.mod"] {
            touch(dir.path(), file);
        }
        let manifest = scan_routes(dir.path(), "/r").unwrap();
        assert_eq!(
            page_paths(&manifest),
            vec!["/new", "/post-[id]", "/[id]", "/[...all]"]
        );
    }

    #[test]
    fn test_nested_layouts_become_parts() {
        let dir = tempdir().unwrap();
        for file in ["$layout.mod", "blog/$layout.mod", "blog/[slug].mod"] {
            touch(dir.path(), file);
        }
        let manifest = scan_routes(dir.path(), "/r").unwrap();
        let parts: Vec<&str> = manifest.pages[0]
            .parts
            .iter()
            .map(|c| c.url.as_str())
            .collect();
        assert_eq!(parts, vec!["/r/blog/$layout.mod", "/r/blog/[slug].mod"]);
    }

    #[test]
    fn test_conflicting_routes() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "about.mod");
        touch(dir.path(), "about/index.mod");
        let err = scan_routes(dir.path(), "/r").unwrap_err();
        assert!(matches!(err, Error::RouteConflict { .. }));
    }

    #[test]
    fn test_invalid_route_names_file() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "[broken.mod");
        let err = scan_routes(dir.path(), "/r").unwrap_err();
        match err {
            Error::InvalidRoute { file, .. } => assert_eq!(file, "[broken.mod"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let manifest = scan_routes(&dir.path().join("nope"), "/r").unwrap();
        assert!(manifest.pages.is_empty());
        assert!(manifest.layout.is_none());
    }

    #[test]
    fn test_create_manifest_data_includes_assets() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src/routes/index.mod");
        fs::create_dir_all(dir.path().join("static")).unwrap();
        fs::write(dir.path().join("static/logo.svg"), "<svg/>").unwrap();

        let manifest = create_manifest_data(&KitConfig::default(), dir.path()).unwrap();
        assert_eq!(page_paths(&manifest), vec!["/"]);
        assert_eq!(
            manifest.assets,
            vec![Asset {
                file: "logo.svg".to_string(),
                size: 6,
                mime_type: Some("image/svg+xml"),
            }]
        );
    }

    #[test]
    fn test_manifest_serializes_patterns_as_strings() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "about.mod");
        let manifest = scan_routes(dir.path(), "/r").unwrap();
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["pages"][0]["pattern"], "^/about/?$");
    }
}
