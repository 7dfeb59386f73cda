//! Bare-specifier ("package") resolution.
//!
//! Package results bypass the module cache and the dependency graph: they are
//! owned by the host, not by the source server.

use super::exports::ModuleExports;
use futures::future::{self, BoxFuture};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Host mechanism for importing external packages.
pub trait PackageResolver: Send + Sync {
    /// Exports for `specifier` as imported by `importer`, or `None` when the
    /// package is unknown.
    fn resolve<'a>(&'a self, specifier: &'a str, importer: &'a str) -> BoxFuture<'a, Option<ModuleExports>>;
}

/// In-memory package table.
#[derive(Debug, Default)]
pub struct PackageRegistry {
    packages: HashMap<String, ModuleExports>,
}

impl PackageRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `$app/env` built-in.
    #[must_use]
    pub fn with_app_env(amp: bool) -> Self {
        let mut registry = Self::new();
        registry.register_values(
            "$app/env",
            json!({ "browser": false, "dev": true, "amp": amp }),
        );
        registry
    }

    pub fn register(&mut self, specifier: impl Into<String>, exports: ModuleExports) {
        self.packages.insert(specifier.into(), exports);
    }

    /// Register a package from a JSON object; non-objects export `default`.
    pub fn register_values(&mut self, specifier: impl Into<String>, values: Value) {
        let values = match values {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("default".to_string(), other);
                map
            }
        };
        self.register(specifier, ModuleExports::from_values(values));
    }
}

impl PackageResolver for PackageRegistry {
    fn resolve<'a>(&'a self, specifier: &'a str, _importer: &'a str) -> BoxFuture<'a, Option<ModuleExports>> {
        Box::pin(future::ready(self.packages.get(specifier).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_app_env_builtin() {
        let registry = PackageRegistry::with_app_env(true);
        let env = registry.resolve("$app/env", "/a.mod").await.unwrap();

        assert_eq!(env.read("browser").unwrap(), json!(false));
        assert_eq!(env.read("dev").unwrap(), json!(true));
        assert_eq!(env.read("amp").unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_unknown_package() {
        let registry = PackageRegistry::new();
        assert!(registry.resolve("left-pad", "/a.mod").await.is_none());
    }

    #[tokio::test]
    async fn test_scalar_package_is_default_export() {
        let mut registry = PackageRegistry::new();
        registry.register_values("version", json!("1.0.0"));
        let pkg = registry.resolve("version", "/a.mod").await.unwrap();
        assert_eq!(pkg.read("default").unwrap(), json!("1.0.0"));
    }
}
