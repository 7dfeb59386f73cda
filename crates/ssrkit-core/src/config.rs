//! Project configuration (`ssrkit.config.json`).
//!
//! ```json
//! {
//!   "appDir": "_app",
//!   "files": { "routes": "src/routes", "lib": "src/lib", "setup": "src/setup", "assets": "static" },
//!   "paths": { "base": "", "assets": "/." },
//!   "server": { "host": "localhost", "port": 3000 },
//!   "amp": false
//! }
//! ```
//!
//! Every field is optional.

use crate::error::Error;
use crate::source::Mount;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file looked up in the project root.
pub const CONFIG_FILE: &str = "ssrkit.config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KitConfig {
    /// URL segment module sources are served under.
    pub app_dir: String,
    pub files: FilesConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
    /// Exposed to modules through `$app/env`.
    pub amp: bool,
}

/// Project directories, relative to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub routes: PathBuf,
    pub lib: PathBuf,
    pub setup: PathBuf,
    pub assets: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Prefix stripped from request paths before routing.
    pub base: String,
    pub assets: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            app_dir: "_app".to_string(),
            files: FilesConfig::default(),
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            amp: false,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            routes: PathBuf::from("src/routes"),
            lib: PathBuf::from("src/lib"),
            setup: PathBuf::from("src/setup"),
            assets: PathBuf::from("static"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            base: String::new(),
            assets: "/.".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
        }
    }
}

impl KitConfig {
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.server.host = host.into();
        self
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<(), Error> {
        if self.app_dir.is_empty() {
            return Err(Error::InvalidConfig("appDir cannot be empty".to_string()));
        }
        if self.app_dir.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "appDir cannot contain slashes (got '{}')",
                self.app_dir
            )));
        }
        if !self.paths.base.is_empty() && !self.paths.base.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "paths.base must start with '/' (got '{}')",
                self.paths.base
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn routes_url(&self) -> String {
        format!("/{}/routes", self.app_dir)
    }

    #[must_use]
    pub fn lib_url(&self) -> String {
        format!("/{}/lib", self.app_dir)
    }

    #[must_use]
    pub fn setup_url(&self) -> String {
        format!("/{}/setup", self.app_dir)
    }

    /// URL of the setup module, which may not exist.
    #[must_use]
    pub fn setup_entry(&self) -> String {
        format!("{}/index.mod", self.setup_url())
    }

    /// The `files` section with every path made absolute against `root`.
    #[must_use]
    pub fn resolve_files(&self, root: &Path) -> FilesConfig {
        FilesConfig {
            routes: root.join(&self.files.routes),
            lib: root.join(&self.files.lib),
            setup: root.join(&self.files.setup),
            assets: root.join(&self.files.assets),
        }
    }

    /// Source server mounts for the project at `root`.
    #[must_use]
    pub fn mounts(&self, root: &Path) -> Vec<Mount> {
        let files = self.resolve_files(root);
        vec![
            Mount::new(files.routes, &self.routes_url()),
            Mount::new(files.lib, &self.lib_url()),
            Mount::new(files.setup, &self.setup_url()),
        ]
    }
}

/// Find the config file in `root`.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    let path = root.join(CONFIG_FILE);
    path.is_file().then_some(path)
}

/// Load configuration for the project at `root`.
///
/// If `config_path` is `Some`, that file must exist; otherwise the default
/// file is used when present. Returns `Ok(None)` when there is nothing to load.
pub fn load_config(root: &Path, config_path: Option<&Path>) -> Result<Option<(PathBuf, KitConfig)>, Error> {
    let path = match config_path {
        Some(p) => {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if !abs.is_file() {
                return Err(Error::ConfigNotFound(abs));
            }
            abs
        }
        None => match find_config_file(root) {
            Some(p) => p,
            None => return Ok(None),
        },
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;
    let config: KitConfig = serde_json::from_str(&contents).map_err(|source| Error::ConfigParse {
        path: path.clone(),
        source,
    })?;
    config.validate()?;

    Ok(Some((path, config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = KitConfig::default();
        assert_eq!(config.app_dir, "_app");
        assert_eq!(config.files.routes, PathBuf::from("src/routes"));
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.setup_entry(), "/_app/setup/index.mod");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "appDir": "app", "server": { "port": 4000 }, "amp": true }"#,
        )
        .unwrap();

        let (path, config) = load_config(dir.path(), None).unwrap().unwrap();
        assert_eq!(path, dir.path().join(CONFIG_FILE));
        assert_eq!(config.app_dir, "app");
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "localhost");
        assert!(config.amp);
        assert_eq!(config.routes_url(), "/app/routes");
    }

    #[test]
    fn test_missing_default_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(load_config(dir.path(), None).unwrap().is_none());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempdir().unwrap();
        let err = load_config(dir.path(), Some(Path::new("custom.json"))).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        let err = load_config(dir.path(), None).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn test_app_dir_validation() {
        let mut config = KitConfig {
            app_dir: "a/b".to_string(),
            ..KitConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
        config.app_dir = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mounts() {
        let root = Path::new("/project");
        let mounts = KitConfig::default().mounts(root);
        assert_eq!(mounts[0].url, "/_app/routes");
        assert_eq!(mounts[0].dir, PathBuf::from("/project/src/routes"));
        assert_eq!(mounts[2].url, "/_app/setup");
    }
}
