use super::project_config;
use miette::{IntoDiagnostic, Result};
use ssrkit_core::{create_manifest_data, ManifestData};
use std::fmt::Write as _;
use std::path::Path;

/// Print the routes manifest for the project at `cwd`.
///
/// When `json` is true, outputs the manifest as a single JSON object.
pub fn run(cwd: &Path, config: Option<&Path>, json: bool) -> Result<()> {
    let config = project_config(cwd, config)?;
    let manifest = create_manifest_data(&config, cwd).into_diagnostic()?;

    if json {
        let json = serde_json::to_string_pretty(&manifest).into_diagnostic()?;
        println!("{json}");
    } else {
        print!("{}", format_manifest(&manifest));
    }
    Ok(())
}

fn format_manifest(manifest: &ManifestData) -> String {
    let mut out = String::new();
    let width = manifest
        .pages
        .iter()
        .map(|p| p.path.len())
        .chain(manifest.endpoints.iter().map(|e| e.path.len()))
        .max()
        .unwrap_or(0);

    if let Some(layout) = &manifest.layout {
        let _ = writeln!(out, "layout    {}", layout.file);
    }
    if let Some(error) = &manifest.error {
        let _ = writeln!(out, "error     {}", error.file);
    }

    for page in &manifest.pages {
        let files: Vec<&str> = page.parts.iter().map(|c| c.file.as_str()).collect();
        let _ = writeln!(out, "page      {:width$}  {}", page.path, files.join(" > "));
    }
    for endpoint in &manifest.endpoints {
        let _ = writeln!(out, "endpoint  {:width$}  {}", endpoint.path, endpoint.file);
    }

    let _ = writeln!(
        out,
        "\n{} pages, {} endpoints, {} assets",
        manifest.pages.len(),
        manifest.endpoints.len(),
        manifest.assets.len()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssrkit_core::KitConfig;
    use std::fs;

    #[test]
    fn test_format_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let routes = dir.path().join("src/routes");
        fs::create_dir_all(routes.join("blog")).unwrap();
        fs::write(routes.join("$layout.mod"), "").unwrap();
        fs::write(routes.join("index.mod"), "").unwrap();
        fs::write(routes.join("blog/[slug].mod"), "").unwrap();
        fs::write(routes.join("blog/[slug].api.mod"), "").unwrap();

        let manifest = create_manifest_data(&KitConfig::default(), dir.path()).unwrap();
        let out = format_manifest(&manifest);

        assert!(out.contains("layout    $layout.mod"));
        assert!(out.contains("page      /             index.mod"));
        assert!(out.contains("page      /blog/[slug]  blog/[slug].mod"));
        assert!(out.contains("endpoint  /blog/[slug]  blog/[slug].api.mod"));
        assert!(out.ends_with("2 pages, 1 endpoints, 0 assets\n"));
    }
}
