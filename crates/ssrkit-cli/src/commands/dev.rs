//! Development server.
//!
//! Serves static assets, raw module sources under the app directory and
//! server-rendered routes. Module changes on disk invalidate the loader and
//! push a reload to connected browsers over a websocket.

use super::project_config;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use miette::{IntoDiagnostic, Result};
use parking_lot::{Mutex, RwLock};
use ssrkit_core::config::FilesConfig;
use ssrkit_core::module::PackageRegistry;
use ssrkit_core::render::{HmrMessage, HmrOptions, HMR_CLIENT_PATH, HMR_CLIENT_RUNTIME, HMR_PATH};
use ssrkit_core::source::{LoadOptions, SourceError};
use ssrkit_core::{
    create_manifest_data, render, FileChangeKind, FsSourceServer, IncrementalLoader, KitConfig, ManifestData,
    ModuleExports, RenderOptions, Rendered, Request, SourceServer,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tracing::{debug, error, info, warn};

/// Dev server action configuration.
#[derive(Debug)]
pub struct DevAction {
    pub cwd: PathBuf,
    /// Port from the command line; overrides the config file.
    pub port: Option<u16>,
    pub host: Option<String>,
    pub config: Option<PathBuf>,
}

/// Shared dev server state.
pub struct DevState {
    config: KitConfig,
    files: FilesConfig,
    source: Arc<FsSourceServer>,
    loader: IncrementalLoader,
    manifest: RwLock<Arc<ManifestData>>,
    hmr_tx: broadcast::Sender<HmrMessage>,
    /// Port browsers connect back to for reloads.
    port: u16,
    root: PathBuf,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DevState {
    pub fn new(root: PathBuf, config: KitConfig, port: u16) -> Result<Arc<Self>, ssrkit_core::Error> {
        let files = config.resolve_files(&root);
        let source = Arc::new(FsSourceServer::new(config.mounts(&root)));
        let loader = IncrementalLoader::builder(source.clone())
            .with_packages(Arc::new(PackageRegistry::with_app_env(config.amp)))
            .build();
        let manifest = create_manifest_data(&config, &root)?;
        let (hmr_tx, _) = broadcast::channel(16);

        Ok(Arc::new(Self {
            config,
            files,
            source,
            loader,
            manifest: RwLock::new(Arc::new(manifest)),
            hmr_tx,
            port,
            root,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start watching sources and forwarding invalidations to browsers.
    pub fn start(self: &Arc<Self>) -> Result<(), ssrkit_core::Error> {
        self.source.watch()?;
        self.loader.start();

        let mut invalidations = self.loader.subscribe();
        let state = Arc::clone(self);
        let reload = tokio::spawn(async move {
            loop {
                match invalidations.recv().await {
                    Ok(event) => {
                        info!(urls = ?event.urls, "Modules changed, reloading");
                        let _ = state.hmr_tx.send(HmrMessage::Reload { urls: event.urls });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let _ = state.hmr_tx.send(HmrMessage::Reload { urls: Vec::new() });
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut changes = self.source.subscribe();
        let state = Arc::clone(self);
        let routes = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        let structural = matches!(change.kind, FileChangeKind::Create | FileChangeKind::Remove);
                        if structural && change.path.starts_with(&state.files.routes) {
                            state.rebuild_manifest();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => state.rebuild_manifest(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.tasks.lock().extend([reload, routes]);
        Ok(())
    }

    /// Stop background work and drop every cached module.
    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.loader.shutdown();
        self.source.unwatch();
    }

    fn manifest(&self) -> Arc<ManifestData> {
        self.manifest.read().clone()
    }

    fn rebuild_manifest(&self) {
        match create_manifest_data(&self.config, &self.root) {
            Ok(manifest) => {
                debug!(pages = manifest.pages.len(), "Routes changed");
                *self.manifest.write() = Arc::new(manifest);
                let _ = self.hmr_tx.send(HmrMessage::Reload { urls: Vec::new() });
            }
            Err(err) => {
                error!(error = %err, "Failed to rebuild routes manifest");
                let _ = self.hmr_tx.send(HmrMessage::Error {
                    message: err.to_string(),
                });
            }
        }
    }
}

/// Run the dev server until ctrl-c.
pub async fn run(action: DevAction) -> Result<()> {
    let root = dunce::canonicalize(&action.cwd).into_diagnostic()?;
    let mut config = project_config(&root, action.config.as_deref())?;

    // CLI flags override config file values
    if let Some(port) = action.port {
        config = config.with_port(port);
    }
    if let Some(host) = action.host {
        config = config.with_host(host);
    }

    let host = if config.server.host == "localhost" {
        "127.0.0.1"
    } else {
        config.server.host.as_str()
    };
    let addr: SocketAddr = format!("{}:{}", host, config.server.port).parse().into_diagnostic()?;
    let listener = TcpListener::bind(addr).await.into_diagnostic()?;
    let local = listener.local_addr().into_diagnostic()?;

    let state = DevState::new(root, config, local.port()).into_diagnostic()?;
    state.start().into_diagnostic()?;

    let manifest = state.manifest();
    println!();
    println!("  ssrkit dev server");
    println!();
    println!("  Local:   http://{}:{}/", state.config.server.host, local.port());
    println!(
        "  Routes:  {} pages, {} endpoints",
        manifest.pages.len(),
        manifest.endpoints.len()
    );
    println!();

    info!(addr = %local, "Dev server listening");

    axum::serve(listener, router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .into_diagnostic()?;

    state.close();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

/// Routes for the dev server. Static assets are tried first, everything else
/// falls through to [`handle_request`].
pub fn router(state: Arc<DevState>) -> Router {
    let fallback = any(handle_request).with_state(Arc::clone(&state));
    let assets = ServeDir::new(&state.files.assets)
        .call_fallback_on_method_not_allowed(true)
        .fallback(fallback);

    Router::new()
        .route(HMR_PATH, get(hmr_websocket))
        .route(HMR_CLIENT_PATH, get(serve_hmr_client))
        .fallback_service(assets)
        .with_state(state)
}

async fn hmr_websocket(ws: WebSocketUpgrade, State(state): State<Arc<DevState>>) -> Response {
    ws.on_upgrade(move |socket| handle_hmr_socket(socket, state))
}

async fn handle_hmr_socket(mut socket: WebSocket, state: Arc<DevState>) {
    let mut rx = state.hmr_tx.subscribe();

    if socket
        .send(Message::Text(HmrMessage::Connected.to_json()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            Ok(msg) = rx.recv() => {
                if socket.send(Message::Text(msg.to_json())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                // Clients never send anything we act on
                if !matches!(incoming, Some(Ok(_))) {
                    break;
                }
            }
            else => break,
        }
    }
}

async fn serve_hmr_client() -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "application/javascript"),
            (CACHE_CONTROL, "no-cache"),
        ],
        HMR_CLIENT_RUNTIME,
    )
}

async fn handle_request(
    State(state): State<Arc<DevState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path();

    if path.starts_with(&format!("/{}/", state.config.app_dir)) {
        match state.source.load_url(path, LoadOptions { ssr: false }).await {
            Ok(source) => {
                let content_type = if path.ends_with(".css") {
                    "text/css; charset=utf-8"
                } else {
                    "text/plain; charset=utf-8"
                };
                return ([(CONTENT_TYPE, content_type)], source.contents).into_response();
            }
            Err(SourceError::NotFound) => {}
            Err(SourceError::Io(message)) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, message).into_response();
            }
        }
    }

    if path == "/favicon.ico" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let setup = match state.loader.load(&state.config.setup_entry()).await {
        Ok(module) => module.exports.clone(),
        Err(err) if err.is_not_found() => ModuleExports::new(),
        Err(err) => {
            error!(error = %err, "Failed to load setup module");
            return (StatusCode::INTERNAL_SERVER_ERROR, err.trace()).into_response();
        }
    };

    let request = Request {
        method: method.as_str().to_string(),
        path: path.to_string(),
        query: uri.query().unwrap_or_default().to_string(),
        headers: headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str().to_string(), value.to_str().ok()?.to_string())))
            .collect(),
        body: (!body.is_empty()).then_some(body),
    };
    let options = RenderOptions {
        paths: state.config.paths.clone(),
        hmr: Some(HmrOptions { port: state.port }),
        setup,
    };

    let manifest = state.manifest();
    match render(&state.loader, &manifest, &request, &options).await {
        Some(rendered) => into_response(rendered),
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

fn into_response(rendered: Rendered) -> Response {
    let status = StatusCode::from_u16(rendered.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut headers = HeaderMap::new();
    for (name, value) in &rendered.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header"),
        }
    }
    (status, headers, rendered.body).into_response()
}
