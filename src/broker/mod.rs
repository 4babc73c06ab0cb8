//! Reload broker: fans `BuildResult`s out to connected browser clients over
//! WebSocket (`spec.md` §4.5).
//!
//! A `TcpListener` accept loop spawns one task per connection, with a shared
//! broadcast surface for admitted clients — connection admission (origin
//! allowlist, global/per-remote caps), per-client inbound rate limiting, and
//! a bounded drop-oldest send queue sit in front of that broadcast surface so
//! one slow or over-quota client never affects the rest.

mod client;
mod limits;

pub use client::{ConnectionState, DropOldestQueue};
pub use limits::{ConnectionLimiter, OriginAllowlist, RateLimiter};

use crate::config::BrokerConfig;
use crate::types::BuildResult;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::{Message, WebSocketConfig};
use tracing::{info, warn};

struct ClientHandle {
    id: u64,
    remote: SocketAddr,
    queue: DropOldestQueue<String>,
    state: std::sync::Mutex<ConnectionState>,
}

impl ClientHandle {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("client state poisoned") = state;
    }
}

struct Inner {
    config: BrokerConfig,
    origins: OriginAllowlist,
    connections: ConnectionLimiter,
    clients: RwLock<Vec<Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
}

/// Accepts WebSocket connections and fans out successful `BuildResult`s as
/// reload notifications.
pub struct Broker {
    inner: Arc<Inner>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let origins = OriginAllowlist::new(config.allowed_origins.clone());
        let connections = ConnectionLimiter::new(config.max_global_connections, config.max_connections_per_remote);
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                origins,
                connections,
                clients: RwLock::new(Vec::new()),
                next_client_id: AtomicU64::new(1),
            }),
            shutdown_tx,
            shutdown_rx,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Bind `addr` and start accepting connections. Returns the address
    /// actually bound (useful when `addr`'s port is `0`).
    pub async fn start(&self, addr: SocketAddr) -> crate::error::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await.map_err(crate::error::Error::Io)?;
        let bound = listener.local_addr().map_err(crate::error::Error::Io)?;
        info!(addr = %bound, "reload broker listening");

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let inner = Arc::clone(&inner);
                                tokio::spawn(serve_connection(inner, stream, remote));
                            }
                            Err(err) => warn!(error = %err, "accept failed"),
                        }
                    }
                }
            }
        });
        *self.task.lock().expect("broker task poisoned") = Some(handle);
        Ok(bound)
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().expect("broker task poisoned").take() {
            handle.abort();
        }
    }

    /// Connected client count, for metrics/tests.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.global_count()
    }

    /// Feed one build outcome into the broker. Successful builds become a
    /// `{"type":"reload"}` notification; failed builds become a
    /// `{"type":"error"}` notification carrying the toolchain's message, per
    /// the reload protocol's wire format.
    pub fn notify_build_result(&self, result: &BuildResult) {
        let message = if result.success {
            let ts = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            serde_json::json!({
                "type": "reload",
                "component": result.component_name,
                "ts": ts,
            })
            .to_string()
        } else {
            let text = if result.stderr.is_empty() { &result.stdout } else { &result.stderr };
            serde_json::json!({
                "type": "error",
                "message": text,
            })
            .to_string()
        };

        let clients = self.inner.clients.read().expect("clients poisoned").clone();
        for client in clients {
            client.queue.push(message.clone());
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(inner: Arc<Inner>, stream: TcpStream, remote: SocketAddr) {
    if !inner.connections.try_admit(remote.ip()) {
        warn!(%remote, "rejecting connection: over capacity");
        return;
    }

    let origins_check = Arc::clone(&inner);
    let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let origin = req.headers().get("origin").and_then(|v| v.to_str().ok());
        if origins_check.origins.is_allowed(origin) {
            Ok(response)
        } else {
            let rejection = Response::builder()
                .status(tokio_tungstenite::tungstenite::http::StatusCode::FORBIDDEN)
                .body(Some("origin not allowed".to_string()))
                .expect("valid rejection response");
            Err(rejection)
        }
    };

    // Per spec.md §4.5: a 512 B per-message read-limit is installed at
    // admission time, not enforced after the fact.
    let ws_config = WebSocketConfig {
        max_message_size: Some(inner.config.max_message_bytes),
        max_frame_size: Some(inner.config.max_message_bytes),
        ..Default::default()
    };
    let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!(%remote, error = %err, "websocket handshake rejected");
            inner.connections.release(remote.ip());
            return;
        }
    };

    let client_id = inner.next_client_id.fetch_add(1, Ordering::Relaxed);
    let handle = Arc::new(ClientHandle {
        id: client_id,
        remote,
        queue: DropOldestQueue::new(inner.config.send_queue_capacity),
        state: std::sync::Mutex::new(ConnectionState::Open),
    });
    inner.clients.write().expect("clients poisoned").push(Arc::clone(&handle));
    info!(client_id, %remote, "client connected");

    let rate_limiter = Arc::new(RateLimiter::new(inner.config.rate_limit_max_messages, inner.config.rate_limit_window));
    let (mut write, mut read) = ws_stream.split();

    let writer = {
        let handle = Arc::clone(&handle);
        let rate_limiter = Arc::clone(&rate_limiter);
        async move {
            loop {
                let message = handle.queue.pop().await;
                // Per `spec.md` §4.5, the 60-messages-per-minute budget is
                // shared by both directions — an outbound burst can close
                // the connection exactly like an inbound one.
                if !rate_limiter.try_acquire() {
                    warn!(client_id, "client exceeded message rate, closing");
                    break;
                }
                if write.send(Message::Text(message)).await.is_err() {
                    break;
                }
            }
        }
    };
    tokio::pin!(writer);

    let idle_timeout = inner.config.idle_timeout;
    loop {
        tokio::select! {
            _ = &mut writer => break,
            received = tokio::time::timeout(idle_timeout, read.next()) => {
                match received {
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {
                        if !rate_limiter.try_acquire() {
                            warn!(client_id, "client exceeded message rate, closing");
                            break;
                        }
                    }
                    Ok(Some(Err(err))) => {
                        warn!(client_id, error = %err, "read error, closing");
                        break;
                    }
                    Err(_elapsed) => {
                        info!(client_id, "client idle timeout, closing");
                        break;
                    }
                }
            }
        }
    }

    handle.set_state(ConnectionState::Draining);
    let _ = tokio::time::timeout(inner.config.drain_timeout, async {
        while handle.queue.len() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await;

    handle.set_state(ConnectionState::Closed);
    inner
        .clients
        .write()
        .expect("clients poisoned")
        .retain(|c| c.id != handle.id);
    inner.connections.release(remote.ip());
    info!(client_id, %remote, "client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_broker_starts_with_no_connections() {
        let broker = Broker::new(BrokerConfig::default());
        assert_eq!(broker.connection_count(), 0);
    }

    #[test]
    fn notify_build_result_handles_failed_builds_with_no_clients_connected() {
        let broker = Broker::new(BrokerConfig::default());
        let result = BuildResult {
            component_name: "Button".to_string(),
            success: false,
            cached: false,
            duration: std::time::Duration::ZERO,
            stdout: String::new(),
            stderr: "boom".to_string(),
            error_kind: Some(crate::types::BuildErrorKind::CompileError),
            artifact_hash: None,
        };
        // No clients connected; this just exercises the no-op fan-out path.
        broker.notify_build_result(&result);
    }
}
