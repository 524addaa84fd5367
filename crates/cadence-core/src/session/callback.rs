//! Completion callback listener.
//!
//! Each run that uses interactive steps owns one `CallbackServer`, bound to
//! loopback on the first free port at or above the configured default. The
//! external tool's lifecycle hook reports back with:
//!
//! ```text
//! POST http://127.0.0.1:<port>/complete   pane_id=%12&token=<run token>
//! POST http://127.0.0.1:<port>/exited     pane_id=%12&token=<run token>
//! ```
//!
//! Callbacks carrying the wrong token are rejected with 401. Callbacks that
//! arrive before anyone waits on their pane are buffered.
//! Callbacks for a pane whose session already ended get 410 and are dropped.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tower_http::trace::TraceLayer;

use crate::error::EngineError;

/// Which hook fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    Complete,
    Exited,
}

#[derive(Default)]
struct Pending {
    waiters: HashMap<String, oneshot::Sender<CompletionSignal>>,
    early: HashMap<String, CompletionSignal>,
    /// Panes whose session already ended; late signals for them are dropped
    closed: HashSet<String>,
}

struct CallbackState {
    token: String,
    pending: Mutex<Pending>,
}

#[derive(Debug, Deserialize)]
struct CallbackForm {
    pane_id: String,
    #[serde(default)]
    token: String,
}

/// Loopback HTTP listener that turns hook callbacks into completion signals.
pub struct CallbackServer {
    addr: SocketAddr,
    state: Arc<CallbackState>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CallbackServer {
    /// Bind to the first free port in `start..start+span` and start serving.
    pub async fn start(start: u16, span: u16) -> Result<Self, EngineError> {
        let listener = bind_free_port(start, span).await?;
        let addr = listener
            .local_addr()
            .map_err(|e| EngineError::Session(format!("Failed to get local address: {}", e)))?;

        let state = Arc::new(CallbackState {
            token: uuid::Uuid::new_v4().to_string(),
            pending: Mutex::new(Pending::default()),
        });

        let app = Router::new()
            .route("/complete", post(handle_complete))
            .route("/exited", post(handle_exited))
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                tracing::error!("[Callback] Server error: {}", e);
            }
        });

        tracing::info!("[Callback] Listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Per-run secret the hook must echo back.
    pub fn token(&self) -> &str {
        &self.state.token
    }

    /// Wait for the next signal for `pane_id`. A signal that already
    /// arrived resolves the receiver immediately.
    pub async fn register(&self, pane_id: &str) -> oneshot::Receiver<CompletionSignal> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.state.pending.lock().await;
        pending.closed.remove(pane_id);
        match pending.early.remove(pane_id) {
            Some(signal) => {
                let _ = tx.send(signal);
            }
            None => {
                pending.waiters.insert(pane_id.to_string(), tx);
            }
        }
        rx
    }

    pub async fn unregister(&self, pane_id: &str) {
        let mut pending = self.state.pending.lock().await;
        pending.waiters.remove(pane_id);
        pending.early.remove(pane_id);
        pending.closed.insert(pane_id.to_string());
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Probe upward from `start` for a bindable loopback port. Port 0 asks the
/// OS for any free port.
pub async fn bind_free_port(start: u16, span: u16) -> Result<TcpListener, EngineError> {
    if start == 0 {
        return TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|_| EngineError::PortExhausted { start: 0, end: 0 });
    }

    let end = start.saturating_add(span.saturating_sub(1));
    for port in start..=end {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!("[Callback] Port {} unavailable: {}", port, e),
        }
    }
    Err(EngineError::PortExhausted { start, end })
}

async fn handle_complete(
    State(state): State<Arc<CallbackState>>,
    Form(form): Form<CallbackForm>,
) -> (StatusCode, Json<serde_json::Value>) {
    deliver(&state, form, CompletionSignal::Complete).await
}

async fn handle_exited(
    State(state): State<Arc<CallbackState>>,
    Form(form): Form<CallbackForm>,
) -> (StatusCode, Json<serde_json::Value>) {
    deliver(&state, form, CompletionSignal::Exited).await
}

async fn deliver(
    state: &CallbackState,
    form: CallbackForm,
    signal: CompletionSignal,
) -> (StatusCode, Json<serde_json::Value>) {
    if form.token != state.token {
        tracing::warn!("[Callback] Rejected {:?} for pane {}: bad token", signal, form.pane_id);
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid token" })),
        );
    }

    let mut pending = state.pending.lock().await;
    if pending.closed.contains(&form.pane_id) {
        tracing::debug!("[Callback] Dropped {:?} for finished pane {}", signal, form.pane_id);
        return (
            StatusCode::GONE,
            Json(serde_json::json!({ "ok": false, "delivered": false })),
        );
    }
    let delivered = match pending.waiters.remove(&form.pane_id) {
        Some(tx) => tx.send(signal).is_ok(),
        None => {
            pending.early.insert(form.pane_id.clone(), signal);
            false
        }
    };

    tracing::info!(
        "[Callback] {:?} for pane {} (delivered: {})",
        signal,
        form.pane_id,
        delivered
    );
    (
        if delivered { StatusCode::OK } else { StatusCode::ACCEPTED },
        Json(serde_json::json!({ "ok": true, "delivered": delivered })),
    )
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "server": "cadence-callback",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn post_form(url: &str, body: String) -> u16 {
        reqwest::Client::new()
            .post(url)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .unwrap()
            .status()
            .as_u16()
    }

    #[tokio::test]
    async fn test_complete_callback_resolves_waiter() {
        let server = CallbackServer::start(0, 1).await.unwrap();
        let rx = server.register("%3").await;

        let status = post_form(
            &format!("{}/complete", server.url()),
            format!("pane_id=%253&token={}", server.token()),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(rx.await.unwrap(), CompletionSignal::Complete);
    }

    #[tokio::test]
    async fn test_bad_token_rejected() {
        let server = CallbackServer::start(0, 1).await.unwrap();
        let mut rx = server.register("%4").await;

        let status = post_form(
            &format!("{}/exited", server.url()),
            "pane_id=%254&token=wrong".to_string(),
        )
        .await;
        assert_eq!(status, 401);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_early_signal_is_buffered() {
        let server = CallbackServer::start(0, 1).await.unwrap();
        let status = post_form(
            &format!("{}/exited", server.url()),
            format!("pane_id=%255&token={}", server.token()),
        )
        .await;
        assert_eq!(status, 202);

        let rx = server.register("%5").await;
        assert_eq!(rx.await.unwrap(), CompletionSignal::Exited);
    }

    #[tokio::test]
    async fn test_signal_after_unregister_is_dropped() {
        let server = CallbackServer::start(0, 1).await.unwrap();
        let _rx = server.register("%6").await;
        server.unregister("%6").await;

        let status = post_form(
            &format!("{}/complete", server.url()),
            format!("pane_id=%256&token={}", server.token()),
        )
        .await;
        assert_eq!(status, 410);
        assert!(server.state.pending.lock().await.early.is_empty());
    }

    #[tokio::test]
    async fn test_port_probing_skips_taken_port() {
        let taken = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        if port == u16::MAX {
            return;
        }
        match bind_free_port(port, 2).await {
            Ok(listener) => assert_eq!(listener.local_addr().unwrap().port(), port + 1),
            // the next port happened to be in use too
            Err(e) => assert!(matches!(e, EngineError::PortExhausted { .. })),
        }
        assert!(matches!(
            bind_free_port(port, 1).await,
            Err(EngineError::PortExhausted { .. })
        ));
    }
}
