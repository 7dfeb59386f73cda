//! Execution stage: runs transformed code against a [`ModuleEnvironment`].

use super::environment::ModuleEnvironment;
use super::exports::{Binding, BindingError, ExportCell, ModuleExports};
use super::transform::is_identifier;
use serde_json::Value;
use std::collections::HashMap;

/// Failure raised by module code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<BindingError> for ExecutionError {
    fn from(err: BindingError) -> Self {
        Self::new(err.to_string())
    }
}

/// The execution stage contract. The body runs exactly once per load.
pub trait Executor: Send + Sync {
    fn execute(&self, code: &str, env: &mut ModuleEnvironment) -> Result<(), ExecutionError>;
}

/// Interpreter for the code emitted by [`ModTransform`](super::ModTransform).
#[derive(Debug, Clone, Copy, Default)]
pub struct ModExecutor;

impl Executor for ModExecutor {
    fn execute(&self, code: &str, env: &mut ModuleEnvironment) -> Result<(), ExecutionError> {
        let mut scope = Scope {
            env,
            locals: HashMap::new(),
        };
        for line in code.lines() {
            let line = line.trim();
            if !line.is_empty() {
                scope.run(line)?;
            }
        }
        Ok(())
    }
}

enum Local {
    Cell(ExportCell),
    Alias { from: ModuleExports, name: String },
    Namespace(ModuleExports),
}

struct Scope<'a> {
    env: &'a ModuleEnvironment,
    locals: HashMap<String, Local>,
}

impl Scope<'_> {
    fn run(&mut self, line: &str) -> Result<(), ExecutionError> {
        if let Some(rest) = line.strip_prefix("alias ") {
            let (local, target) = split_assignment(rest)?;
            let binding = match target.split_once('.') {
                Some((dep, name)) => Local::Alias {
                    from: self.dep(dep)?.clone(),
                    name: name.to_string(),
                },
                None => Local::Namespace(self.dep(target)?.clone()),
            };
            self.locals.insert(local.to_string(), binding);
            return Ok(());
        }

        if let Some(rest) = line.strip_prefix("let ") {
            let (local, expr) = split_assignment(rest)?;
            let value = self.eval(expr)?;
            return match self.locals.get(local) {
                Some(Local::Cell(cell)) => {
                    cell.set(value);
                    Ok(())
                }
                Some(_) => Err(ExecutionError::new(format!(
                    "Assignment to constant variable '{local}'"
                ))),
                None => {
                    self.locals
                        .insert(local.to_string(), Local::Cell(ExportCell::with_value(value)));
                    Ok(())
                }
            };
        }

        if let Some(expr) = line.strip_prefix("throw ") {
            let value = self.eval(expr)?;
            let message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(ExecutionError::new(message));
        }

        let env = self.env;
        let names = env.names();
        if let Some(args) = call_args(line, &names.export_all) {
            let dep = self.dep(args)?.clone();
            env.export_all(&dep);
            return Ok(());
        }

        if let Some(args) = call_args(line, &names.export) {
            let (exported, target) = args
                .split_once(',')
                .ok_or_else(|| malformed(line))?;
            let exported: String =
                serde_json::from_str(exported.trim()).map_err(|_| malformed(line))?;
            let binding = self.export_target(target.trim())?;
            env.define_export(&exported, binding);
            return Ok(());
        }

        Err(malformed(line))
    }

    /// Resolve the target of an export definition to a live binding.
    ///
    /// Locals that are not declared yet get their cell now, so reading the
    /// export before the declaration runs reports it as uninitialized.
    fn export_target(&mut self, target: &str) -> Result<Binding, ExecutionError> {
        if let Some((dep, name)) = target.split_once('.') {
            return Ok(Binding::Forward {
                from: self.dep(dep)?.clone(),
                name: name.to_string(),
            });
        }
        let local = self
            .locals
            .entry(target.to_string())
            .or_insert_with(|| Local::Cell(ExportCell::new()));
        Ok(match local {
            Local::Cell(cell) => Binding::Cell(cell.clone()),
            Local::Alias { from, name } => Binding::Forward {
                from: from.clone(),
                name: name.clone(),
            },
            Local::Namespace(ns) => Binding::Namespace(ns.clone()),
        })
    }

    fn eval(&self, expr: &str) -> Result<Value, ExecutionError> {
        let expr = expr.trim();
        if let Some(args) = expr.strip_prefix("require(").and_then(|s| s.strip_suffix(')')) {
            let id: String = serde_json::from_str(args).map_err(|_| malformed(expr))?;
            return self.env.require(&id);
        }
        if let Ok(value) = serde_json::from_str::<Value>(expr) {
            return Ok(value);
        }

        let (head, member) = match expr.split_once('.') {
            Some((head, member)) => (head, Some(member)),
            None => (expr, None),
        };
        if !is_identifier(head) {
            return Err(malformed(expr));
        }

        if head == self.env.names().import_meta {
            let meta = self.env.import_meta();
            return Ok(match member {
                Some(member) => meta.get(member).cloned().unwrap_or(Value::Null),
                None => meta,
            });
        }

        match (self.locals.get(head), member) {
            (Some(Local::Namespace(ns)), Some(member)) => Ok(ns.read(member)?),
            (Some(local), member) => {
                let value = match local {
                    Local::Cell(cell) => cell.get(head)?,
                    Local::Alias { from, name } => from.read(name)?,
                    Local::Namespace(ns) => Value::Object(ns.snapshot()?),
                };
                Ok(match member {
                    Some(member) => value.get(member).cloned().unwrap_or(Value::Null),
                    None => value,
                })
            }
            (None, _) => Err(ExecutionError::new(format!("{head} is not defined"))),
        }
    }

    fn dep(&self, name: &str) -> Result<&ModuleExports, ExecutionError> {
        self.env
            .binding(name.trim())
            .ok_or_else(|| ExecutionError::new(format!("{} is not defined", name.trim())))
    }
}

fn split_assignment(rest: &str) -> Result<(&str, &str), ExecutionError> {
    rest.split_once(" = ")
        .map(|(l, r)| (l.trim(), r.trim()))
        .ok_or_else(|| malformed(rest))
}

/// `name(args)` → `args`
fn call_args<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn malformed(line: &str) -> ExecutionError {
    ExecutionError::new(format!("Malformed instruction: {line}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::transform::{ModTransform, Transform};
    use serde_json::json;

    fn run(source: &str, deps: &[(&str, ModuleExports)]) -> Result<ModuleExports, ExecutionError> {
        let out = ModTransform.transform(source).unwrap();
        let exports = ModuleExports::new();
        let mut env = ModuleEnvironment::new("/test.mod", out.names, exports.clone());
        for (specifier, dep_exports) in deps {
            let dep = out.deps.iter().find(|d| d.source == *specifier).unwrap();
            env.insert_binding(dep.name.clone(), dep_exports.clone());
        }
        ModExecutor.execute(&out.code, &mut env)?;
        Ok(exports)
    }

    fn values(v: Value) -> ModuleExports {
        ModuleExports::from_values(v.as_object().unwrap().clone())
    }

    #[test]
    fn test_exports_and_default() {
        let exports = run(
            "const greeting = \"hi\"\nexport const html = \"<h1>hi</h1>\"\nexport default greeting",
            &[],
        )
        .unwrap();

        assert_eq!(
            exports.snapshot().unwrap(),
            json!({ "html": "<h1>hi</h1>", "default": "hi" })
                .as_object()
                .unwrap()
                .clone()
        );
    }

    #[test]
    fn test_named_and_namespace_imports() {
        let dep = values(json!({ "title": "Home", "n": 3 }));
        let exports = run(
            "import { title as t } from './meta.mod'\nimport * as meta from './meta.mod'\nexport const a = t\nexport const b = meta.n",
            &[("./meta.mod", dep)],
        )
        .unwrap();

        assert_eq!(exports.read("a").unwrap(), json!("Home"));
        assert_eq!(exports.read("b").unwrap(), json!(3));
    }

    #[test]
    fn test_reexport_is_live() {
        let dep = ModuleExports::new();
        let cell = ExportCell::new();
        dep.define("label", Binding::Cell(cell.clone()));

        let exports = run("export { label } from './label.mod'", &[("./label.mod", dep)]).unwrap();
        assert!(exports.get("label").is_err());

        cell.set(json!("ready"));
        assert_eq!(exports.read("label").unwrap(), json!("ready"));
    }

    #[test]
    fn test_throw_stops_execution_after_exports_exist() {
        let out = ModTransform
            .transform("throw \"not ready\"\nexport const late = 1")
            .unwrap();
        let exports = ModuleExports::new();
        let mut env = ModuleEnvironment::new("/t.mod", out.names, exports.clone());

        let err = ModExecutor.execute(&out.code, &mut env).unwrap_err();
        assert_eq!(err.message, "not ready");
        assert_eq!(
            exports.get("late").unwrap_err().to_string(),
            "Cannot access 'late' before initialization"
        );
    }

    #[test]
    fn test_undefined_identifier() {
        let err = run("export const a = nope", &[]).unwrap_err();
        assert_eq!(err.message, "nope is not defined");
    }

    #[test]
    fn test_require_is_rejected() {
        let err = run("const fs = require('fs')", &[]).unwrap_err();
        assert!(err.message.starts_with("Use import instead of require"));
    }

    #[test]
    fn test_import_meta_url() {
        let exports = run("export const here = import.meta.url", &[]).unwrap();
        assert_eq!(exports.read("here").unwrap(), json!("/test.mod"));
    }

    #[test]
    fn test_export_all_does_not_override_own_exports() {
        let dep = values(json!({ "a": "theirs", "b": "theirs" }));
        let exports = run(
            "export * from './dep.mod'\nexport const a = \"mine\"",
            &[("./dep.mod", dep)],
        )
        .unwrap();

        assert_eq!(exports.read("a").unwrap(), json!("mine"));
        assert_eq!(exports.read("b").unwrap(), json!("theirs"));
    }
}
