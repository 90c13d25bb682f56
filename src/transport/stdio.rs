//! Subprocess upstream speaking newline-delimited JSON-RPC over stdio
//!
//! Requests are multiplexed: each outbound id is replaced with a gateway id
//! and the caller's id is put back on the reply.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::{PendingReplies, UpstreamTransport, route_reply};
use crate::protocol::{JsonRpcRequest, RequestId};
use crate::{Error, Result};

const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Running child plus the pipe we write requests into
struct Process {
    child: Child,
    stdin: ChildStdin,
}

/// Subprocess upstream
pub struct StdioUpstream {
    command: String,
    env: HashMap<String, String>,
    cwd: Option<String>,
    process: Mutex<Option<Process>>,
    pending: Arc<PendingReplies>,
    next_tag: AtomicU64,
    /// Cleared by the reader task when stdout closes
    alive: Arc<AtomicBool>,
}

impl StdioUpstream {
    /// Upstream for `command`; the process starts on `connect`
    #[must_use]
    pub fn new(command: &str, env: HashMap<String, String>, cwd: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            command: command.to_owned(),
            env,
            cwd,
            process: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_tag: AtomicU64::new(1),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    fn start(&self) -> Result<(Process, ChildStdout)> {
        let mut words = self.command.split_whitespace();
        let Some(program) = words.next() else {
            return Err(Error::Config("stdio backend has an empty command".to_owned()));
        };

        let mut command = Command::new(program);
        command
            .args(words)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = self.cwd.as_deref() {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Transport(format!("spawn {program}: {e}")))?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::Transport(format!("{program} started without piped stdio")));
        };
        Ok((Process { child, stdin }, stdout))
    }

    /// Drain stdout into the pending reply table until the child exits
    fn spawn_reader(&self, stdout: ChildStdout) {
        let pending = Arc::clone(&self.pending);
        let alive = Arc::clone(&self.alive);
        let command = self.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(e) = route_reply(&pending, &line) {
                    warn!(command = %command, error = %e, "Unparseable line from subprocess");
                }
            }
            alive.store(false, Ordering::Relaxed);
            debug!(command = %command, "Subprocess stdout closed");
        });
    }

    async fn send_line(&self, message: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(message)?;
        bytes.push(b'\n');
        let mut guard = self.process.lock().await;
        let Some(process) = guard.as_mut() else {
            return Err(Error::Transport("subprocess not running".to_owned()));
        };
        process.stdin.write_all(&bytes).await?;
        process.stdin.flush().await?;
        Ok(())
    }

    /// Notifications are written and return `Value::Null`; requests wait for
    /// the reply carrying their gateway tag.
    async fn exchange(&self, mut message: Value) -> Result<Value> {
        let Some(caller_id) = message.get("id").cloned() else {
            self.send_line(&message).await?;
            return Ok(Value::Null);
        };

        let tag = format!("gw-{}", self.next_tag.fetch_add(1, Ordering::Relaxed));
        message["id"] = json!(tag);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(tag.clone(), tx);

        let outcome = match self.send_line(&message).await {
            Ok(()) => tokio::time::timeout(REPLY_TIMEOUT, rx).await,
            Err(e) => {
                self.pending.remove(&tag);
                return Err(e);
            }
        };
        match outcome {
            Ok(Ok(mut reply)) => {
                reply["id"] = caller_id;
                Ok(reply)
            }
            Ok(Err(_)) => Err(Error::Transport("subprocess exited before replying".to_owned())),
            Err(_) => {
                self.pending.remove(&tag);
                Err(Error::Transport(format!(
                    "no reply within {}s",
                    REPLY_TIMEOUT.as_secs()
                )))
            }
        }
    }
}

#[async_trait]
impl UpstreamTransport for StdioUpstream {
    async fn connect(&self) -> Result<()> {
        let (process, stdout) = self.start()?;
        *self.process.lock().await = Some(process);
        self.alive.store(true, Ordering::Relaxed);
        self.spawn_reader(stdout);

        let handshake = serde_json::to_value(JsonRpcRequest::initialize(RequestId::Number(0)))?;
        if self.exchange(handshake).await?.get("error").is_some() {
            return Err(Error::Protocol("subprocess rejected initialize".to_owned()));
        }
        self.send_line(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;

        debug!(command = %self.command, "Stdio upstream ready");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        if !self.alive.load(Ordering::Relaxed) {
            return false;
        }
        let mut guard = self.process.lock().await;
        let running = guard
            .as_mut()
            .is_some_and(|p| matches!(p.child.try_wait(), Ok(None)));
        if !running {
            self.alive.store(false, Ordering::Relaxed);
        }
        running
    }

    async fn request(&self, message: Value) -> Result<Value> {
        self.exchange(message).await
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            drop(process.stdin);
            let _ = process.child.kill().await;
        }
        self.pending.clear();
        Ok(())
    }
}
