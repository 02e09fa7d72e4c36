//! Request handler
//!
//! Parses `/<session>/<path…>/<chunk>` URLs, owns the manager registry and
//! the side channels (`test`, `create`, `config`), gates on the client
//! version, and drives graceful shutdown with an exit code.

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::manager::{free_if_temp, Manager, TEMP_FILE_MARKER};

/// Build version, reported by the `test` endpoint and checked against the
/// client's version header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const VERSION_HEADER: &str = "x-go-vod-version";

/// Exit code asking the supervisor to restart us with a matching build.
const EXIT_VERSION_MISMATCH: i32 = 12;

pub struct Handler {
    config: RwLock<Arc<Config>>,
    managers: DashMap<String, Arc<Manager>>,
    close_tx: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
    exit_code: AtomicI32,
}

impl Handler {
    pub fn new(config: Config) -> Arc<Handler> {
        // recreate the temp dir so no stale segments survive a restart
        let _ = std::fs::remove_dir_all(&config.temp_dir);
        let _ = std::fs::create_dir_all(&config.temp_dir);

        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Handler {
            config: RwLock::new(Arc::new(config)),
            managers: DashMap::new(),
            close_tx,
            shutdown: CancellationToken::new(),
            exit_code: AtomicI32::new(0),
        });

        tokio::spawn(handler.clone().watch_close(close_rx));
        handler
    }

    /// Serve until shutdown; returns the process exit code.
    pub async fn start(self: Arc<Self>, router: axum::Router) -> Result<i32> {
        let addr = self.config.read().socket_addr();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(self.exit_code.load(Ordering::SeqCst))
    }

    /// Initiate graceful shutdown with the given exit code. Idempotent.
    pub fn close(&self, exit_code: i32) {
        self.exit_code.store(exit_code, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// Drain manager teardown notifications and drop registry entries.
    async fn watch_close(self: Arc<Self>, mut close_rx: mpsc::UnboundedReceiver<String>) {
        while let Some(id) = close_rx.recv().await {
            tracing::info!(%id, "closing manager");
            self.managers.remove(&id);
        }
    }

    /// Entry point for every request under the wildcard route.
    pub async fn handle(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Response {
        let config = self.config.read().clone();

        if config.version_monitor && !self.version_ok(headers) {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 3 {
            tracing::warn!(%path, "invalid URL");
            return StatusCode::BAD_REQUEST.into_response();
        }

        let streamid = parts[0];
        let source_path = format!("/{}", parts[1..parts.len() - 1].join("/"));
        let chunk = parts[parts.len() - 1];

        // temp upload side channel; the returned path supplants the path
        // portion in subsequent requests
        if method == Method::POST && parts[1] == "create" {
            return self.create_temp_file(&config, streamid, body);
        }

        // liveness probe; also reports whether the source is readable
        if chunk == "test" {
            let size = std::fs::metadata(&source_path).map(|m| m.len()).unwrap_or(0);
            return Json(serde_json::json!({ "version": VERSION, "size": size }))
                .into_response();
        }

        if method == Method::POST && chunk == "config" {
            return self.update_config(&config, body);
        }

        if !config.configured {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }

        let manager = match self.get_manager(streamid, &source_path) {
            Some(manager) => manager,
            None => match self.create_manager(config, &source_path, streamid).await {
                Ok(manager) => manager,
                Err(err) => {
                    tracing::error!(%streamid, path = %source_path, %err,
                        "error creating manager");
                    free_if_temp(&source_path);
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
            },
        };

        if chunk == "ignore" {
            return StatusCode::OK.into_response();
        }

        manager.serve(chunk, &query_suffix(query)).await
    }

    /// False when the client reports a different build; the 503 tells it to
    /// retry after our supervisor restarts us.
    fn version_ok(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = headers.get(VERSION_HEADER).and_then(|v| v.to_str().ok()) else {
            return true;
        };
        if !expected.is_empty() && expected != VERSION {
            tracing::warn!(%expected, current = VERSION, "version mismatch, shutting down");
            self.close(EXIT_VERSION_MISMATCH);
            return false;
        }
        true
    }

    fn get_manager(&self, streamid: &str, path: &str) -> Option<Arc<Manager>> {
        let manager = self.managers.get(streamid)?;
        if manager.path() != path {
            return None;
        }
        Some(manager.clone())
    }

    async fn create_manager(
        &self,
        config: Arc<Config>,
        path: &str,
        streamid: &str,
    ) -> Result<Arc<Manager>> {
        let manager = Manager::new(config, path, streamid, self.close_tx.clone()).await?;

        if let Some(old) = self.managers.insert(streamid.to_string(), manager.clone()) {
            old.destroy();
        }
        Ok(manager)
    }

    /// Write the request body to a fresh temp file and return its path.
    fn create_temp_file(&self, config: &Config, streamid: &str, body: &Bytes) -> Response {
        let name = format!("{}{}{}", streamid, TEMP_FILE_MARKER, Uuid::new_v4().simple());
        let path = Path::new(&config.temp_dir).join(name);

        if let Err(err) = std::fs::write(&path, body) {
            tracing::error!(%err, "error writing temp file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        Json(serde_json::json!({ "path": path.to_string_lossy() })).into_response()
    }

    /// Merge a JSON body into the running configuration. The whole config
    /// is swapped atomically; managers keep the snapshot they were built
    /// with.
    fn update_config(&self, current: &Config, body: &Bytes) -> Response {
        match current.merge_json(body) {
            Ok(merged) => {
                tracing::info!(config = ?merged, "configuration updated");
                *self.config.write() = Arc::new(merged);
                StatusCode::OK.into_response()
            }
            Err(err) => {
                tracing::error!(%err, "error unmarshaling config");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Render a query string back into the `?`-prefixed form segment URIs carry.
pub fn query_suffix(raw: Option<&str>) -> String {
    match raw {
        Some(query) if !query.is_empty() => format!("?{}", query),
        _ => String::new(),
    }
}
