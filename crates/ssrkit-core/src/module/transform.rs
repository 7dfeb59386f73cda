//! Transform stage: raw module source → executable code plus metadata.
//!
//! The loader only relies on the [`Transform`] contract. [`ModTransform`]
//! implements it for the line-oriented `.mod` format:
//!
//! ```text
//! import './button.css'
//! import { title, slug as id } from './meta.mod'
//! import * as util from '../lib/util.mod'
//! import env from '$app/env'
//! const greeting = "hello"
//! export const html = "<h1>hi</h1>"
//! export default greeting
//! export { greeting, id as key }
//! export { label } from './label.mod'
//! export * from './shared.mod'
//! throw "not ready"
//! ```
//!
//! The emitted code is one instruction per line. Imports become `alias`
//! lines, every export definition is hoisted ahead of the body, and the body
//! keeps its order as `let` / `throw` lines. All synthetic names are chosen so
//! they never collide with identifiers in the source.

use serde::Serialize;
use std::collections::HashSet;

/// A dependency declared by a module, bound to a synthetic name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclaredDep {
    /// Identifier the executor uses to reach the dependency's exports.
    pub name: String,
    /// Specifier exactly as written in the source.
    pub source: String,
}

/// Synthetic identifiers used to wire the module into its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingNames {
    pub exports: String,
    pub export: String,
    pub export_all: String,
    pub import: String,
    pub import_meta: String,
}

impl Default for BindingNames {
    fn default() -> Self {
        Self {
            exports: "exports".to_string(),
            export: "__export".to_string(),
            export_all: "__export_all".to_string(),
            import: "__import".to_string(),
            import_meta: "__import_meta".to_string(),
        }
    }
}

/// Output of the transform stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub code: String,
    pub deps: Vec<DeclaredDep>,
    /// Stylesheet specifiers, relative to the module.
    pub css: Vec<String>,
    pub names: BindingNames,
}

/// Compile failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct TransformError {
    /// 1-indexed source line.
    pub line: usize,
    pub message: String,
}

impl TransformError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// The transform stage contract.
pub trait Transform: Send + Sync {
    fn transform(&self, source: &str) -> Result<TransformOutput, TransformError>;
}

/// Transform for the `.mod` source format.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModTransform;

impl Transform for ModTransform {
    fn transform(&self, source: &str) -> Result<TransformOutput, TransformError> {
        Compiler::new(source).compile(source)
    }
}

/// What an `export { ... }` entry points at.
enum ExportTarget {
    Local(String),
    Dep { dep: String, name: String },
}

struct Compiler {
    names: BindingNames,
    used: HashSet<String>,
    dep_prefix: String,
    deps: Vec<DeclaredDep>,
    css: Vec<String>,
    aliases: Vec<String>,
    exports: Vec<String>,
    body: Vec<String>,
    /// Locals declared anywhere in the module (hoisted), with their line.
    declared: HashSet<String>,
    /// Local exports to validate once every declaration is known.
    exported_locals: Vec<(usize, String)>,
}

impl Compiler {
    fn new(source: &str) -> Self {
        let used = collect_identifiers(source);
        let mut compiler = Self {
            names: BindingNames::default(),
            used,
            dep_prefix: String::new(),
            deps: Vec::new(),
            css: Vec::new(),
            aliases: Vec::new(),
            exports: Vec::new(),
            body: Vec::new(),
            declared: HashSet::new(),
            exported_locals: Vec::new(),
        };
        let defaults = BindingNames::default();
        compiler.names = BindingNames {
            exports: compiler.fresh(&defaults.exports),
            export: compiler.fresh(&defaults.export),
            export_all: compiler.fresh(&defaults.export_all),
            import: compiler.fresh(&defaults.import),
            import_meta: compiler.fresh(&defaults.import_meta),
        };
        compiler.dep_prefix = compiler.fresh("__dep");
        compiler
    }

    /// Pick `base`, or `base$N`, whichever is not used yet.
    fn fresh(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 1;
        while self.used.contains(&candidate) {
            candidate = format!("{base}${n}");
            n += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }

    fn compile(mut self, source: &str) -> Result<TransformOutput, TransformError> {
        for (index, raw) in source.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let line = line.strip_suffix(';').unwrap_or(line).trim_end();
            self.statement(line_no, line)?;
        }

        for (line_no, local) in &self.exported_locals {
            if !self.declared.contains(local) {
                return Err(TransformError::new(
                    *line_no,
                    format!("Export '{local}' is not defined"),
                ));
            }
        }

        let mut code = String::new();
        for line in self.aliases.iter().chain(&self.exports).chain(&self.body) {
            code.push_str(line);
            code.push('\n');
        }

        Ok(TransformOutput {
            code,
            deps: self.deps,
            css: self.css,
            names: self.names,
        })
    }

    fn statement(&mut self, line_no: usize, line: &str) -> Result<(), TransformError> {
        if let Some(rest) = strip_keyword(line, "import") {
            return self.import(line_no, rest);
        }
        if let Some(rest) = strip_keyword(line, "export") {
            return self.export(line_no, rest);
        }
        if let Some(rest) = strip_declaration(line) {
            let (local, expr) = self.declaration(line_no, rest)?;
            self.body.push(format!("let {local} = {expr}"));
            return Ok(());
        }
        if let Some(rest) = strip_keyword(line, "throw") {
            let expr = self.expression(line_no, rest)?;
            self.body.push(format!("throw {expr}"));
            return Ok(());
        }
        Err(TransformError::new(
            line_no,
            format!("Unexpected statement: {line}"),
        ))
    }

    fn import(&mut self, line_no: usize, rest: &str) -> Result<(), TransformError> {
        // Side-effect import: `import './x.css'` / `import './setup.mod'`
        if let Some(specifier) = parse_string_literal(rest) {
            if is_stylesheet(&specifier) {
                if !self.css.contains(&specifier) {
                    self.css.push(specifier);
                }
            } else {
                self.dep(&specifier);
            }
            return Ok(());
        }

        let (clause, specifier) = split_from(rest)
            .ok_or_else(|| TransformError::new(line_no, "Expected `from '<specifier>'`"))?;
        let dep = self.dep(&specifier);

        let clause = clause.trim();
        let (default, rest) = if clause.starts_with('{') || clause.starts_with('*') {
            (None, Some(clause))
        } else {
            match clause.split_once(',') {
                Some((default, rest)) => (Some(default.trim()), Some(rest.trim())),
                None => (Some(clause), None),
            }
        };

        if let Some(local) = default {
            self.declare(line_no, local)?;
            self.aliases.push(format!("alias {local} = {dep}.default"));
        }

        if let Some(rest) = rest {
            if let Some(ns) = rest.strip_prefix('*') {
                let local = strip_keyword(ns.trim(), "as")
                    .ok_or_else(|| TransformError::new(line_no, "Expected `* as <name>`"))?;
                self.declare(line_no, local)?;
                self.aliases.push(format!("alias {local} = {dep}"));
            } else {
                for (imported, local) in parse_specifier_list(line_no, rest)? {
                    self.declare(line_no, &local)?;
                    self.aliases.push(format!("alias {local} = {dep}.{imported}"));
                }
            }
        }

        Ok(())
    }

    fn export(&mut self, line_no: usize, rest: &str) -> Result<(), TransformError> {
        if let Some(from_all) = rest.strip_prefix('*') {
            let specifier = strip_keyword(from_all.trim(), "from")
                .and_then(parse_string_literal)
                .ok_or_else(|| TransformError::new(line_no, "Expected `export * from '<specifier>'`"))?;
            let dep = self.dep(&specifier);
            self.exports.push(format!("{}({dep})", self.names.export_all));
            return Ok(());
        }

        if rest.starts_with('{') {
            let (list, dep) = match split_from(rest) {
                Some((list, specifier)) => (list, Some(self.dep(&specifier))),
                None => (rest, None),
            };
            for (local, exported) in parse_specifier_list(line_no, list)? {
                let target = match &dep {
                    Some(dep) => ExportTarget::Dep {
                        dep: dep.clone(),
                        name: local,
                    },
                    None => ExportTarget::Local(local),
                };
                self.export_binding(line_no, &exported, target);
            }
            return Ok(());
        }

        if let Some(expr) = strip_keyword(rest, "default") {
            let local = self.fresh("__default");
            let expr = self.expression(line_no, expr)?;
            self.declared.insert(local.clone());
            self.body.push(format!("let {local} = {expr}"));
            self.export_binding(line_no, "default", ExportTarget::Local(local));
            return Ok(());
        }

        if let Some(decl) = strip_declaration(rest) {
            let (local, expr) = self.declaration(line_no, decl)?;
            self.body.push(format!("let {local} = {expr}"));
            let exported = local.clone();
            self.export_binding(line_no, &exported, ExportTarget::Local(local));
            return Ok(());
        }

        Err(TransformError::new(
            line_no,
            format!("Unsupported export: export {rest}"),
        ))
    }

    fn export_binding(&mut self, line_no: usize, exported: &str, target: ExportTarget) {
        let target = match target {
            ExportTarget::Local(local) => {
                self.exported_locals.push((line_no, local.clone()));
                local
            }
            ExportTarget::Dep { dep, name } => format!("{dep}.{name}"),
        };
        self.exports
            .push(format!("{}(\"{exported}\", {target})", self.names.export));
    }

    /// `name = expr` → (name, compiled expr)
    fn declaration(&mut self, line_no: usize, rest: &str) -> Result<(String, String), TransformError> {
        let (local, expr) = rest
            .split_once('=')
            .ok_or_else(|| TransformError::new(line_no, "Expected `<name> = <expression>`"))?;
        let local = local.trim();
        self.declare(line_no, local)?;
        let expr = self.expression(line_no, expr.trim())?;
        Ok((local.to_string(), expr))
    }

    fn declare(&mut self, line_no: usize, local: &str) -> Result<(), TransformError> {
        if !is_identifier(local) {
            return Err(TransformError::new(
                line_no,
                format!("Invalid identifier: {local}"),
            ));
        }
        if !self.declared.insert(local.to_string()) {
            return Err(TransformError::new(
                line_no,
                format!("Identifier '{local}' has already been declared"),
            ));
        }
        Ok(())
    }

    /// Validate an expression and rewrite `import.meta` to its synthetic name.
    fn expression(&self, line_no: usize, expr: &str) -> Result<String, TransformError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(TransformError::new(line_no, "Missing expression"));
        }
        if let Some(member) = expr.strip_prefix("import.meta") {
            return match member {
                "" => Ok(self.names.import_meta.clone()),
                ".url" => Ok(format!("{}.url", self.names.import_meta)),
                _ => Err(TransformError::new(
                    line_no,
                    format!("Unsupported import.meta property: {expr}"),
                )),
            };
        }
        if let Some(args) = expr.strip_prefix("require(") {
            let id = args
                .strip_suffix(')')
                .and_then(parse_string_literal)
                .ok_or_else(|| TransformError::new(line_no, "Expected `require('<id>')`"))?;
            return Ok(format!("require({})", serde_json::Value::String(id)));
        }
        if serde_json::from_str::<serde_json::Value>(expr).is_ok() {
            return Ok(expr.to_string());
        }
        let mut parts = expr.splitn(2, '.');
        let head = parts.next().unwrap_or_default();
        let tail_ok = parts.next().map_or(true, is_identifier);
        if is_identifier(head) && tail_ok {
            return Ok(expr.to_string());
        }
        Err(TransformError::new(
            line_no,
            format!("Unsupported expression: {expr}"),
        ))
    }

    /// Register a dependency (once per specifier) and return its binding name.
    fn dep(&mut self, specifier: &str) -> String {
        if let Some(existing) = self.deps.iter().find(|d| d.source == specifier) {
            return existing.name.clone();
        }
        let base = format!("{}{}", self.dep_prefix, self.deps.len());
        let name = self.fresh(&base);
        self.deps.push(DeclaredDep {
            name: name.clone(),
            source: specifier.to_string(),
        });
        name
    }
}

/// Strip a leading keyword followed by whitespace (or end of input).
fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(keyword)?;
    if rest.is_empty() {
        return Some(rest);
    }
    if rest.starts_with(char::is_whitespace) {
        return Some(rest.trim_start());
    }
    // `import{a}` / `export*` are fine too.
    if rest.starts_with(['{', '*', '\'', '"']) {
        return Some(rest);
    }
    None
}

fn strip_declaration(line: &str) -> Option<&str> {
    ["const", "let", "var"]
        .iter()
        .find_map(|kw| strip_keyword(line, kw))
}

/// Split `<clause> from '<specifier>'`.
fn split_from(rest: &str) -> Option<(&str, String)> {
    let (clause, specifier) = rest.rsplit_once(" from ")?;
    let specifier = parse_string_literal(specifier.trim())?;
    Some((clause.trim(), specifier))
}

/// Parse a single- or double-quoted string without escapes.
fn parse_string_literal(s: &str) -> Option<String> {
    let s = s.trim();
    let quote = s.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = s.strip_prefix(quote)?.strip_suffix(quote)?;
    if inner.contains(quote) {
        return None;
    }
    Some(inner.to_string())
}

/// Parse `{ a, b as c }` into `(a, a)`, `(b, c)`.
fn parse_specifier_list(line_no: usize, list: &str) -> Result<Vec<(String, String)>, TransformError> {
    let inner = list
        .trim()
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| TransformError::new(line_no, "Expected `{ ... }`"))?;

    let mut pairs = Vec::new();
    for item in inner.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (from, to) = match item.split_once(" as ") {
            Some((from, to)) => (from.trim(), to.trim()),
            None => (item, item),
        };
        if !is_identifier(from) || !is_identifier(to) {
            return Err(TransformError::new(
                line_no,
                format!("Invalid specifier: {item}"),
            ));
        }
        pairs.push((from.to_string(), to.to_string()));
    }
    Ok(pairs)
}

fn is_stylesheet(specifier: &str) -> bool {
    let path = specifier.split(['?', '#']).next().unwrap_or(specifier);
    path.ends_with(".css")
}

#[must_use]
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Every identifier-like token in the source, quoted text included.
fn collect_identifiers(source: &str) -> HashSet<String> {
    let mut found = HashSet::new();
    let mut current = String::new();
    for c in source.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
            current.push(c);
        } else if !current.is_empty() {
            found.insert(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        found.insert(current);
    }
    found
}
