//! Request rendering against a routes manifest.
//!
//! The renderer only needs a way to load modules by URL ([`LoadModule`]);
//! in the dev server that is the [`IncrementalLoader`](crate::IncrementalLoader).

pub mod hmr;

pub use hmr::{HmrMessage, HmrOptions, HMR_CLIENT_PATH, HMR_CLIENT_RUNTIME, HMR_PATH};

use crate::config::PathsConfig;
use crate::module::{BindingError, LoadError, LoadedModule, ModuleExports};
use crate::routes::{Component, EndpointData, ManifestData, PageData};
use futures::future::{self, BoxFuture};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

const HTML: &str = "text/html; charset=utf-8";

/// Load a module by URL.
pub trait LoadModule: Send + Sync {
    fn load<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Arc<LoadedModule>, LoadError>>;
}

/// An incoming request.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: String,
    /// Path without query string.
    pub path: String,
    pub query: String,
    /// Header names lower-cased.
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
}

/// A rendered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl Rendered {
    fn html(status: u16, mut headers: BTreeMap<String, String>, body: String) -> Self {
        headers.insert("content-type".to_string(), HTML.to_string());
        Self {
            status,
            headers,
            body,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    pub paths: PathsConfig,
    pub hmr: Option<HmrOptions>,
    /// Exports of the setup module; `headers` is added to every page.
    pub setup: ModuleExports,
}

/// Render `request`. Returns `None` when nothing matches.
pub async fn render(
    loader: &dyn LoadModule,
    manifest: &ManifestData,
    request: &Request,
    options: &RenderOptions,
) -> Option<Rendered> {
    let path = strip_base(&request.path, &options.paths.base)?;

    if let Some((page, params)) = manifest.pages.iter().find_map(|p| Some((p, p.pattern.exec(path)?))) {
        debug!(path, route = %page.path, ?params, "Rendering page");
        return Some(render_page(loader, manifest, page, options).await);
    }

    if let Some((endpoint, params)) = manifest
        .endpoints
        .iter()
        .find_map(|e| Some((e, e.pattern.exec(path)?)))
    {
        debug!(path, route = %endpoint.path, ?params, "Calling endpoint");
        return render_endpoint(loader, endpoint, request).await;
    }

    None
}

fn strip_base<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return Some(path);
    }
    match path.strip_prefix(base)? {
        "" => Some("/"),
        rest if rest.starts_with('/') => Some(rest),
        _ => None,
    }
}

async fn render_page(
    loader: &dyn LoadModule,
    manifest: &ManifestData,
    page: &PageData,
    options: &RenderOptions,
) -> Rendered {
    let components: Vec<&Component> = manifest.layout.iter().chain(&page.parts).collect();
    let loaded = future::join_all(components.iter().map(|c| loader.load(&c.url))).await;

    let result = loaded
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .and_then(|modules| compose_page(&modules, options));

    match result {
        Ok(rendered) => rendered,
        Err(err) => {
            // Only a missing part of the route itself is a 404
            let missing_part = err.is_not_found() && components.iter().any(|c| err.url() == c.url);
            let status = if missing_part { 404 } else { 500 };
            error!(route = %page.path, status, error = %err, "Failed to render page");
            render_error(loader, manifest, &err, status, options).await
        }
    }
}

/// Wrap the page (last module) in its layouts and collect head markup.
fn compose_page(modules: &[Arc<LoadedModule>], options: &RenderOptions) -> Result<Rendered, LoadError> {
    let Some((page, layouts)) = modules.split_last() else {
        return Ok(Rendered::html(200, BTreeMap::new(), String::new()));
    };

    let mut body = read_string(page, "html")?;
    for layout in layouts.iter().rev() {
        body = wrap(&read_string(layout, "html")?, &body);
    }

    let mut stylesheets: Vec<&str> = Vec::new();
    for module in modules {
        for css in &module.stylesheets {
            if !stylesheets.contains(&css.as_str()) {
                stylesheets.push(css);
            }
        }
    }

    let mut head = String::new();
    for css in &stylesheets {
        head.push_str(&format!("<link rel=\"stylesheet\" href=\"{}\">\n", escape_html(css)));
    }
    for module in modules {
        let extra = read_string(module, "head")?;
        if !extra.is_empty() {
            head.push_str(&extra);
            head.push('\n');
        }
    }

    let status = page
        .exports
        .read("status")
        .map_err(|e| binding_error(&page.url, e))?
        .as_u64()
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(200);

    let headers = setup_headers(&options.setup);
    Ok(Rendered::html(status, headers, document(&head, &body, options)))
}

async fn render_error(
    loader: &dyn LoadModule,
    manifest: &ManifestData,
    err: &LoadError,
    status: u16,
    options: &RenderOptions,
) -> Rendered {
    let trace = format!("<pre>{}</pre>", escape_html(&err.trace()));

    let component = match &manifest.error {
        Some(component) => loader.load(&component.url).await.ok(),
        None => None,
    };

    let (head, body) = match component {
        Some(module) => match read_string(&module, "html") {
            Ok(html) => {
                let head: String = module
                    .stylesheets
                    .iter()
                    .map(|css| format!("<link rel=\"stylesheet\" href=\"{}\">\n", escape_html(css)))
                    .collect();
                (head, wrap(&html, &trace))
            }
            Err(_) => (String::new(), trace),
        },
        None => (String::new(), trace),
    };

    Rendered::html(status, BTreeMap::new(), document(&head, &body, options))
}

async fn render_endpoint(loader: &dyn LoadModule, endpoint: &EndpointData, request: &Request) -> Option<Rendered> {
    let module = match loader.load(&endpoint.url).await {
        Ok(module) => module,
        Err(err) => {
            error!(route = %endpoint.path, error = %err, "Failed to load endpoint");
            return Some(plain(500, err.trace()));
        }
    };

    let method = request.method.to_ascii_lowercase();
    let handler = if method == "delete" { "del" } else { method.as_str() };

    match module.exports.get(handler) {
        Ok(Some(value)) => Some(endpoint_response(value)),
        Ok(None) => None,
        Err(err) => Some(plain(500, binding_error(&module.url, err).trace())),
    }
}

fn endpoint_response(value: Value) -> Rendered {
    let (status, mut headers, body) = match value {
        Value::Object(map) if ["status", "headers", "body"].iter().any(|k| map.contains_key(*k)) => {
            let status = map
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(200);
            let headers = map.get("headers").map(header_map).unwrap_or_default();
            (status, headers, map.get("body").cloned().unwrap_or(Value::Null))
        }
        other => (200, BTreeMap::new(), other),
    };

    let body = match body {
        Value::String(s) => s,
        Value::Null => String::new(),
        json => {
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
            json.to_string()
        }
    };

    Rendered {
        status,
        headers,
        body,
    }
}

fn setup_headers(setup: &ModuleExports) -> BTreeMap<String, String> {
    match setup.read("headers") {
        Ok(value) => header_map(&value),
        Err(err) => {
            debug!(error = %err, "Ignoring setup headers");
            BTreeMap::new()
        }
    }
}

fn header_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.to_ascii_lowercase(), v)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn plain(status: u16, body: String) -> Rendered {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "text/plain; charset=utf-8".to_string());
    Rendered {
        status,
        headers,
        body,
    }
}

fn document(head: &str, body: &str, options: &RenderOptions) -> String {
    let html = format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n{head}</head>\n<body>\n{body}\n</body>\n</html>\n"
    );
    match &options.hmr {
        Some(hmr) => inject_before_head_end(&html, &hmr.head_scripts()),
        None => html,
    }
}

fn inject_before_head_end(html: &str, markup: &str) -> String {
    match html.find("</head>") {
        Some(i) => format!("{}{markup}{}", &html[..i], &html[i..]),
        None => format!("{markup}{html}"),
    }
}

/// Put `inner` at the layout's slot. A layout without a slot drops `inner`.
fn wrap(layout: &str, inner: &str) -> String {
    for slot in ["<slot/>", "<slot />", "<slot></slot>"] {
        if let Some(i) = layout.find(slot) {
            return format!("{}{inner}{}", &layout[..i], &layout[i + slot.len()..]);
        }
    }
    layout.to_string()
}

fn read_string(module: &LoadedModule, name: &str) -> Result<String, LoadError> {
    let value = module
        .exports
        .read(name)
        .map_err(|e| binding_error(&module.url, e))?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn binding_error(url: &str, err: BindingError) -> LoadError {
    LoadError::Execution {
        url: url.to_string(),
        message: err.to_string(),
        stack: vec![url.to_string()],
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
