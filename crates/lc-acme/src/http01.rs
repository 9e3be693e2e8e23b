//! Temporary HTTP-01 challenge responder

use crate::types::{AcmeError, AcmeResult};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves one key authorization at `/.well-known/acme-challenge/<token>`.
///
/// Every other path answers 404. The listener is released by [`stop`](Self::stop)
/// or, failing that, when the responder is dropped.
pub struct Http01Responder {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct Challenge {
    token: Arc<str>,
    key_authorization: Arc<str>,
}

async fn serve_key_authorization(
    State(challenge): State<Challenge>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    if token != *challenge.token {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain")],
        challenge.key_authorization.to_string(),
    )
        .into_response()
}

/// Listen on `[::]:<port>`, which also accepts IPv4 on a dual-stack host.
/// Hosts without IPv6 fall back to `0.0.0.0:<port>`.
async fn bind(port: u16) -> std::io::Result<tokio::net::TcpListener> {
    match tokio::net::TcpListener::bind(("::", port)).await {
        Ok(listener) => Ok(listener),
        Err(e) if matches!(e.kind(), ErrorKind::AddrInUse | ErrorKind::PermissionDenied) => Err(e),
        Err(e) => {
            debug!(port, error = %e, "IPv6 bind failed, falling back to IPv4");
            tokio::net::TcpListener::bind(("0.0.0.0", port)).await
        }
    }
}

impl Http01Responder {
    /// Bind `[::]:<port>` and start answering. Port 0 picks a free port.
    ///
    /// The token is matched as a path parameter, so tokens containing
    /// characters with routing meaning (`*`, `:`, braces) are served verbatim.
    pub async fn start(port: u16, token: &str, key_authorization: &str) -> AcmeResult<Self> {
        let listener = bind(port)
            .await
            .map_err(|e| {
                AcmeError::Config(format!("Failed to bind HTTP-01 responder on port {}: {}", port, e))
            })?;
        let addr = listener.local_addr()?;

        let router = Router::new()
            .route("/.well-known/acme-challenge/{token}", get(serve_key_authorization))
            .with_state(Challenge {
                token: Arc::from(token),
                key_authorization: Arc::from(key_authorization),
            });

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = rx.await;
            });
            if let Err(e) = server.await {
                warn!(error = %e, "HTTP-01 responder stopped with error");
            }
        });

        info!(addr = %addr, token = %token, "HTTP-01 responder listening");
        Ok(Self {
            addr,
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shut down and wait for the listener to close
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await.is_err() {
                warn!(addr = %self.addr, "HTTP-01 responder did not stop in time, aborting");
                handle.abort();
            }
        }
        debug!(addr = %self.addr, "HTTP-01 responder stopped");
    }
}

impl Drop for Http01Responder {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
