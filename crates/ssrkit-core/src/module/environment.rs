//! The scope a module body executes in.

use super::executor::ExecutionError;
use super::exports::{Binding, ModuleExports};
use super::loader::Importer;
use super::transform::BindingNames;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Everything an [`Executor`](super::Executor) may touch while running a
/// module body: its export object, the export helpers, `import.meta`,
/// `require`, the static dependency bindings and a handle for dynamic imports.
#[derive(Debug)]
pub struct ModuleEnvironment {
    url: String,
    names: BindingNames,
    exports: ModuleExports,
    bindings: HashMap<String, ModuleExports>,
    importer: Option<Importer>,
}

impl ModuleEnvironment {
    #[must_use]
    pub fn new(url: impl Into<String>, names: BindingNames, exports: ModuleExports) -> Self {
        Self {
            url: url.into(),
            names,
            exports,
            bindings: HashMap::new(),
            importer: None,
        }
    }

    /// Bind a static dependency's exports to its synthetic name.
    pub fn insert_binding(&mut self, name: impl Into<String>, exports: ModuleExports) {
        self.bindings.insert(name.into(), exports);
    }

    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, exports: ModuleExports) -> Self {
        self.insert_binding(name, exports);
        self
    }

    #[must_use]
    pub fn with_importer(mut self, importer: Importer) -> Self {
        self.importer = Some(importer);
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn names(&self) -> &BindingNames {
        &self.names
    }

    #[must_use]
    pub fn exports(&self) -> &ModuleExports {
        &self.exports
    }

    /// `__export(name, binding)`
    pub fn define_export(&self, name: &str, binding: Binding) {
        self.exports.define(name, binding);
    }

    /// `__export_all(dep)`
    pub fn export_all(&self, other: &ModuleExports) {
        self.exports.export_all(other);
    }

    /// Exports bound to a dependency's synthetic name.
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<&ModuleExports> {
        self.bindings.get(name)
    }

    #[must_use]
    pub fn import_meta(&self) -> Value {
        json!({ "url": self.url })
    }

    /// CommonJS `require` is not available to modules.
    pub fn require(&self, id: &str) -> Result<Value, ExecutionError> {
        Err(ExecutionError::new(format!(
            "Use import instead of require (attempted to load '{id}' from '{}')",
            self.url
        )))
    }

    /// Handle for dynamic `import()` relative to this module.
    #[must_use]
    pub fn importer(&self) -> Option<&Importer> {
        self.importer.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_always_fails() {
        let env = ModuleEnvironment::new(
            "/_app/routes/index.mod",
            BindingNames::default(),
            ModuleExports::new(),
        );
        let err = env.require("fs").unwrap_err();
        assert_eq!(
            err.message,
            "Use import instead of require (attempted to load 'fs' from '/_app/routes/index.mod')"
        );
    }

    #[test]
    fn test_import_meta_carries_url() {
        let env = ModuleEnvironment::new("/a.mod", BindingNames::default(), ModuleExports::new());
        assert_eq!(env.import_meta(), json!({ "url": "/a.mod" }));
        assert!(env.importer().is_none());
    }

    #[test]
    fn test_bindings_are_looked_up_by_name() {
        let dep = ModuleExports::new();
        let env = ModuleEnvironment::new("/a.mod", BindingNames::default(), ModuleExports::new())
            .with_binding("__dep0", dep.clone());

        assert!(env.binding("__dep0").is_some_and(|b| b.ptr_eq(&dep)));
        assert!(env.binding("__dep1").is_none());
    }
}
