//! HTTP upstream (Streamable HTTP or SSE handshake)
//!
//! Streamable mode POSTs straight to the configured URL. SSE mode first opens
//! the event stream, waits for the `endpoint` event and POSTs there.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response, StatusCode, Url};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::UpstreamTransport;
use crate::protocol::{JsonRpcRequest, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

const PING_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_HEADER: &str = "mcp-session-id";
const VERSION_HEADER: &str = "mcp-protocol-version";
const ACCEPT_STREAM: &str = "text/event-stream";
const ACCEPT_EITHER: &str = "application/json, text/event-stream";

fn transport_err(context: &str, e: impl std::fmt::Display) -> Error {
    Error::Transport(format!("{context}: {e}"))
}

/// Scan complete SSE lines in `buffer` for the data of an `endpoint` event.
///
/// Consumed lines are removed; a trailing partial line is left for the next chunk.
fn take_endpoint_event(buffer: &mut String, current_event: &mut Option<String>) -> Option<String> {
    while let Some(end) = buffer.find('\n') {
        let line: String = buffer.drain(..=end).collect();
        let line = line.trim();
        if line.is_empty() {
            *current_event = None;
            continue;
        }
        if let Some(name) = line.strip_prefix("event:") {
            *current_event = Some(name.trim().to_owned());
            continue;
        }
        if current_event.as_deref() != Some("endpoint") {
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            return Some(data.trim().to_owned());
        }
    }
    None
}

/// Decode a POST reply that is either a JSON body or a single SSE event
async fn decode_reply(response: Response) -> Result<Value> {
    let streamed = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with(ACCEPT_STREAM));

    if !streamed {
        return response
            .json()
            .await
            .map_err(|e| transport_err("undecodable reply", e));
    }

    let text = response
        .text()
        .await
        .map_err(|e| transport_err("unreadable event reply", e))?;
    let Some(data) = text.lines().find_map(|l| l.strip_prefix("data:")) else {
        return Err(Error::Transport("event reply carried no data".to_owned()));
    };
    Ok(serde_json::from_str(data.trim())?)
}

/// One logical connection to an HTTP upstream
pub struct HttpUpstream {
    client: Client,
    /// URL from configuration
    configured_url: String,
    /// Where messages are POSTed, set by `connect`
    post_url: RwLock<Option<String>>,
    extra_headers: HashMap<String, String>,
    /// Session id assigned by the upstream
    upstream_session: RwLock<Option<String>>,
    /// Ids for requests the gateway itself originates
    own_ids: AtomicU64,
    ready: AtomicBool,
    streamable: bool,
}

impl HttpUpstream {
    /// Unconnected upstream; nothing is sent until `connect`
    pub fn new(
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
        streamable_http: bool,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .timeout(timeout)
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| transport_err("http client", e))?;

        Ok(Arc::new(Self {
            client,
            configured_url: url.to_owned(),
            post_url: RwLock::new(None),
            extra_headers: headers,
            upstream_session: RwLock::new(None),
            own_ids: AtomicU64::new(1),
            ready: AtomicBool::new(false),
            streamable: streamable_http,
        }))
    }

    fn headers_for(&self, accept: &'static str) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(3 + self.extra_headers.len());
        map.insert(header::ACCEPT, HeaderValue::from_static(accept));
        map.insert(VERSION_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));
        let session = self.upstream_session.read().clone();
        if let Some(value) = session.and_then(|s| HeaderValue::from_str(&s).ok()) {
            map.insert(SESSION_HEADER, value);
        }
        let extra = self
            .extra_headers
            .iter()
            .filter_map(|(k, v)| Some((k.parse::<HeaderName>().ok()?, v.parse::<HeaderValue>().ok()?)));
        map.extend(extra);
        map
    }

    /// Open the SSE stream and return the advertised message endpoint
    async fn discover_endpoint(&self) -> Result<String> {
        let mut stream = self
            .client
            .get(&self.configured_url)
            .headers(self.headers_for(ACCEPT_STREAM))
            .send()
            .await
            .map_err(|e| transport_err("SSE connect", e))?;
        if !stream.status().is_success() {
            return Err(Error::Transport(format!(
                "SSE endpoint answered {}",
                stream.status()
            )));
        }

        let mut pending = String::new();
        let mut event = None;
        while let Some(bytes) = stream
            .chunk()
            .await
            .map_err(|e| transport_err("SSE read", e))?
        {
            pending.push_str(&String::from_utf8_lossy(&bytes));
            if let Some(endpoint) = take_endpoint_event(&mut pending, &mut event) {
                return Ok(endpoint);
            }
        }
        Err(Error::Transport("SSE stream closed before an endpoint event".to_owned()))
    }

    /// Absolute POST URL for an advertised endpoint; adopts its `session_id` query
    fn absolute_endpoint(&self, endpoint: &str) -> Result<String> {
        let joined = Url::parse(&self.configured_url)
            .and_then(|base| base.join(endpoint))
            .map_err(|e| transport_err("bad endpoint URL", e))?;
        let session = joined
            .query_pairs()
            .find_map(|(k, v)| (k == "session_id").then(|| v.into_owned()));
        if session.is_some() {
            *self.upstream_session.write() = session;
        }
        Ok(joined.into())
    }

    fn post_target(&self) -> String {
        match self.post_url.read().as_ref() {
            Some(url) => url.clone(),
            None => self.configured_url.clone(),
        }
    }

    /// First session id seen in a reply becomes this connection's upstream session
    fn adopt_session(&self, response: &Response, target: &str) {
        if self.upstream_session.read().is_some() {
            return;
        }
        let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        info!(session_id = %id, url = %target, "Upstream assigned a session");
        *self.upstream_session.write() = Some(id.to_owned());
    }

    /// POST one message; `202 Accepted` yields `Value::Null`
    async fn post(&self, body: &Value) -> Result<Value> {
        let target = self.post_target();
        let response = self
            .client
            .post(&target)
            .headers(self.headers_for(ACCEPT_EITHER))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_err("POST", e))?;
        self.adopt_session(&response, &target);

        match response.status() {
            StatusCode::ACCEPTED => Ok(Value::Null),
            status if status.is_success() => decode_reply(response).await,
            status => {
                let detail = response.text().await.unwrap_or_default();
                Err(Error::Transport(format!("HTTP {status}: {detail}")))
            }
        }
    }

    fn own_id(&self) -> RequestId {
        let n = self.own_ids.fetch_add(1, Ordering::Relaxed);
        RequestId::String(format!("gw-{n}"))
    }
}

#[async_trait]
impl UpstreamTransport for HttpUpstream {
    async fn connect(&self) -> Result<()> {
        let target = if self.streamable {
            let base = self.configured_url.trim_end_matches('/');
            format!("{base}/")
        } else {
            let endpoint = self.discover_endpoint().await?;
            self.absolute_endpoint(&endpoint)?
        };
        *self.post_url.write() = Some(target.clone());

        let handshake = serde_json::to_value(JsonRpcRequest::initialize(self.own_id()))?;
        if self.post(&handshake).await?.get("error").is_some() {
            return Err(Error::Protocol("upstream rejected initialize".to_owned()));
        }
        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        self.post(&initialized).await?;

        self.ready.store(true, Ordering::Relaxed);
        debug!(url = %target, streamable = self.streamable, "HTTP upstream ready");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        if !self.ready.load(Ordering::Relaxed) {
            return false;
        }
        let Ok(ping) = serde_json::to_value(JsonRpcRequest::new(self.own_id(), "ping", None)) else {
            return false;
        };
        tokio::time::timeout(PING_TIMEOUT, self.post(&ping))
            .await
            .is_ok_and(|reply| reply.is_ok())
    }

    async fn request(&self, message: Value) -> Result<Value> {
        if self.ready.load(Ordering::Relaxed) {
            self.post(&message).await
        } else {
            Err(Error::Transport("upstream not connected".to_owned()))
        }
    }

    async fn close(&self) -> Result<()> {
        self.ready.store(false, Ordering::Relaxed);
        let session = self.upstream_session.read().clone();
        if let Some(id) = session {
            // Best effort: the upstream may already have dropped the session
            let _ = self
                .client
                .delete(self.post_target())
                .header(SESSION_HEADER, id)
                .send()
                .await;
        }
        Ok(())
    }
}
