//! Live export bindings.
//!
//! A module's exports are not a snapshot: every name maps to a [`Binding`]
//! that is resolved when it is read. Importers therefore observe values that
//! are assigned after they linked against the module, and a re-export keeps
//! following the module it came from.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Maximum number of modules a single read may forward through.
const MAX_FORWARD_DEPTH: usize = 64;

/// Failure to read a binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    /// The binding exists but its value has not been assigned yet.
    #[error("Cannot access '{name}' before initialization")]
    Uninitialized { name: String },

    /// Re-exports chained through more modules than we are willing to follow.
    #[error("Export '{name}' is re-exported through too many modules")]
    TooDeep { name: String },
}

/// A mutable slot holding one exported value.
///
/// Cloning the cell clones the handle, not the value.
#[derive(Clone, Default)]
pub struct ExportCell(Arc<RwLock<Option<Value>>>);

impl ExportCell {
    /// Create an unassigned cell.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cell that already holds `value`.
    #[must_use]
    pub fn with_value(value: Value) -> Self {
        Self(Arc::new(RwLock::new(Some(value))))
    }

    /// Assign the cell.
    pub fn set(&self, value: Value) {
        *self.0.write() = Some(value);
    }

    /// Read the cell. `name` is only used for the error message.
    pub fn get(&self, name: &str) -> Result<Value, BindingError> {
        self.0
            .read()
            .clone()
            .ok_or_else(|| BindingError::Uninitialized {
                name: name.to_string(),
            })
    }
}

impl fmt::Debug for ExportCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.read() {
            Some(value) => write!(f, "ExportCell({value})"),
            None => f.write_str("ExportCell(<uninitialized>)"),
        }
    }
}

/// What an export name points at.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A value owned by the exporting module.
    Cell(ExportCell),
    /// A name exported by another module, looked up on every read.
    Forward { from: ModuleExports, name: String },
    /// Another module's whole namespace, read as an object.
    Namespace(ModuleExports),
}

/// The export object of a module.
///
/// Cheap to clone; all clones share the same bindings.
#[derive(Clone, Default)]
pub struct ModuleExports {
    bindings: Arc<RwLock<BTreeMap<String, Binding>>>,
}

impl ModuleExports {
    /// Create an empty export object.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an export object from plain values.
    #[must_use]
    pub fn from_values(values: Map<String, Value>) -> Self {
        let exports = Self::new();
        for (name, value) in values {
            exports.define(name, Binding::Cell(ExportCell::with_value(value)));
        }
        exports
    }

    /// Define (or redefine) a single export.
    pub fn define(&self, name: impl Into<String>, binding: Binding) {
        self.bindings.write().insert(name.into(), binding);
    }

    /// Re-export every name currently exported by `other`.
    ///
    /// Names this module already defines are kept.
    pub fn export_all(&self, other: &ModuleExports) {
        if self.ptr_eq(other) {
            return;
        }
        let names = other.names();
        let mut bindings = self.bindings.write();
        for name in names {
            bindings
                .entry(name.clone())
                .or_insert_with(|| Binding::Forward {
                    from: other.clone(),
                    name,
                });
        }
    }

    /// Read an export. Returns `Ok(None)` when the name is not exported.
    pub fn get(&self, name: &str) -> Result<Option<Value>, BindingError> {
        self.get_with_depth(name, 0)
    }

    /// Read an export, treating a missing name as `null`.
    pub fn read(&self, name: &str) -> Result<Value, BindingError> {
        Ok(self.get(name)?.unwrap_or(Value::Null))
    }

    fn get_with_depth(&self, name: &str, depth: usize) -> Result<Option<Value>, BindingError> {
        if depth > MAX_FORWARD_DEPTH {
            return Err(BindingError::TooDeep {
                name: name.to_string(),
            });
        }
        // Clone the binding out so no lock is held while following it.
        let binding = self.bindings.read().get(name).cloned();
        match binding {
            None => Ok(None),
            Some(Binding::Cell(cell)) => cell.get(name).map(Some),
            Some(Binding::Forward { from, name }) => from.get_with_depth(&name, depth + 1),
            Some(Binding::Namespace(ns)) => ns.snapshot_with_depth(depth + 1).map(|m| Some(Value::Object(m))),
        }
    }

    /// Read every export into a plain JSON object.
    pub fn snapshot(&self) -> Result<Map<String, Value>, BindingError> {
        self.snapshot_with_depth(0)
    }

    fn snapshot_with_depth(&self, depth: usize) -> Result<Map<String, Value>, BindingError> {
        let mut map = Map::new();
        for name in self.names() {
            if let Some(value) = self.get_with_depth(&name, depth)? {
                map.insert(name, value);
            }
        }
        Ok(map)
    }

    /// Exported names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.bindings.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Whether both handles refer to the same export object.
    #[must_use]
    pub fn ptr_eq(&self, other: &ModuleExports) -> bool {
        Arc::ptr_eq(&self.bindings, &other.bindings)
    }
}

impl fmt::Debug for ModuleExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleExports")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_read_before_assignment_fails() {
        let exports = ModuleExports::new();
        let cell = ExportCell::new();
        exports.define("answer", Binding::Cell(cell.clone()));

        assert_eq!(
            exports.get("answer"),
            Err(BindingError::Uninitialized {
                name: "answer".to_string()
            })
        );

        cell.set(json!(42));
        assert_eq!(exports.get("answer"), Ok(Some(json!(42))));
    }

    #[test]
    fn test_forward_sees_late_assignment() {
        let upstream = ModuleExports::new();
        let cell = ExportCell::new();
        upstream.define("value", Binding::Cell(cell.clone()));

        let downstream = ModuleExports::new();
        downstream.define(
            "renamed",
            Binding::Forward {
                from: upstream.clone(),
                name: "value".to_string(),
            },
        );

        cell.set(json!("late"));
        assert_eq!(downstream.read("renamed").unwrap(), json!("late"));
    }

    #[test]
    fn test_missing_name_reads_as_null() {
        let exports = ModuleExports::new();
        assert_eq!(exports.get("nope"), Ok(None));
        assert_eq!(exports.read("nope"), Ok(Value::Null));
    }

    #[test]
    fn test_export_all_keeps_own_names() {
        let upstream = ModuleExports::from_values(
            json!({ "a": 1, "b": 2 }).as_object().unwrap().clone(),
        );
        let own = ModuleExports::from_values(json!({ "a": "mine" }).as_object().unwrap().clone());

        own.export_all(&upstream);

        assert_eq!(own.read("a").unwrap(), json!("mine"));
        assert_eq!(own.read("b").unwrap(), json!(2));
        assert_eq!(own.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_namespace_binding_reads_as_object() {
        let upstream = ModuleExports::from_values(json!({ "x": true }).as_object().unwrap().clone());
        let exports = ModuleExports::new();
        exports.define("ns", Binding::Namespace(upstream));

        assert_eq!(exports.read("ns").unwrap(), json!({ "x": true }));
    }

    #[test]
    fn test_forward_loop_is_bounded() {
        let a = ModuleExports::new();
        let b = ModuleExports::new();
        a.define(
            "x",
            Binding::Forward {
                from: b.clone(),
                name: "x".to_string(),
            },
        );
        b.define(
            "x",
            Binding::Forward {
                from: a.clone(),
                name: "x".to_string(),
            },
        );

        assert!(matches!(a.get("x"), Err(BindingError::TooDeep { .. })));
    }

    #[test]
    fn test_clones_share_bindings() {
        let exports = ModuleExports::new();
        let clone = exports.clone();
        clone.define("k", Binding::Cell(ExportCell::with_value(json!(1))));

        assert!(exports.ptr_eq(&clone));
        assert_eq!(exports.len(), 1);
        assert!(!ModuleExports::new().ptr_eq(&exports));
    }
}
