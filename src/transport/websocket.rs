//! WebSocket upstream: one JSON-RPC message per text frame

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{PendingReplies, UpstreamTransport, route_reply};
use crate::protocol::{JsonRpcRequest, RequestId};
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket upstream
pub struct WebSocketUpstream {
    url: String,
    sink: Mutex<Option<WsSink>>,
    pending: Arc<PendingReplies>,
    request_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl WebSocketUpstream {
    /// Create a new, unconnected websocket upstream
    #[must_use]
    pub fn new(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            sink: Mutex::new(None),
            pending: Arc::new(PendingReplies::new()),
            request_id: AtomicU64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn send_frame(&self, message: &Value) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let mut sink = self.sink.lock().await;
        let sink = sink
            .as_mut()
            .ok_or_else(|| Error::Transport("Not connected".to_string()))?;
        sink.send(Message::text(text))
            .await
            .map_err(|e| Error::Transport(format!("WebSocket send failed: {e}")))
    }

    async fn round_trip(&self, mut message: Value) -> Result<Value> {
        let Some(original_id) = message.get("id").cloned() else {
            self.send_frame(&message).await?;
            return Ok(Value::Null);
        };

        let internal = format!("gw-{}", self.request_id.fetch_add(1, Ordering::Relaxed));
        message["id"] = Value::String(internal.clone());

        let (tx, rx) = oneshot::channel();
        self.pending.insert(internal.clone(), tx);
        if let Err(e) = self.send_frame(&message).await {
            self.pending.remove(&internal);
            return Err(e);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(mut reply)) => {
                reply["id"] = original_id;
                Ok(reply)
            }
            Ok(Err(_)) => Err(Error::Transport("Response channel closed".to_string())),
            Err(_) => {
                self.pending.remove(&internal);
                Err(Error::Transport("Request timed out".to_string()))
            }
        }
    }
}

#[async_trait]
impl UpstreamTransport for WebSocketUpstream {
    async fn connect(&self) -> Result<()> {
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("WebSocket handshake failed: {e}")))?;
        let (sink, mut frames) = stream.split();
        *self.sink.lock().await = Some(sink);
        self.connected.store(true, Ordering::Relaxed);

        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                        let routed = msg
                            .to_text()
                            .map_err(|e| Error::Protocol(e.to_string()))
                            .and_then(|text| route_reply(&pending, text));
                        if let Err(e) = routed {
                            warn!(error = %e, "Dropping undecodable websocket frame");
                        }
                    }
                    Ok(_) => {}
                }
            }
            connected.store(false, Ordering::Relaxed);
            pending.clear();
            debug!("WebSocket reader task ended");
        });

        let init = serde_json::to_value(JsonRpcRequest::initialize(RequestId::Number(0)))?;
        let reply = self.round_trip(init).await?;
        if reply.get("error").is_some() {
            return Err(Error::Protocol("Initialize failed".to_string()));
        }
        self.send_frame(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;

        debug!(url = %self.url, "WebSocket upstream connected");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn request(&self, message: Value) -> Result<Value> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(Error::Transport("Not connected".to_string()));
        }
        self.round_trip(message).await
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.pending.clear();
        Ok(())
    }
}
