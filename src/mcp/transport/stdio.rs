//! Line-delimited JSON-RPC over a spawned child process.

use super::{Transport, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

const STDIO_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type PendingReplies = Arc<StdMutex<HashMap<String, oneshot::Sender<String>>>>;

pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    request_timeout: Duration,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: PendingReplies,
    inbound_tx: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl StdioTransport {
    pub fn new(command: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            request_timeout: STDIO_REQUEST_TIMEOUT,
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            inbound_tx: StdMutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn spawn_stdout_reader(&self, stdout: ChildStdout) -> Result<(), TransportError> {
        let pending = Arc::clone(&self.pending);
        let inbound = self
            .inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let command = self.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match reply_key(&line) {
                    Some(key) => {
                        let waiter = pending
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&key);
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(line);
                            }
                            None => {
                                debug!(command = %command, id = %key, "reply for unknown request");
                            }
                        }
                    }
                    None => {
                        let _ = inbound.send(line);
                    }
                }
            }
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            debug!(command = %command, "stdio server closed stdout");
        });
        Ok(())
    }

    fn spawn_stderr_drain(&self, stderr: tokio::process::ChildStderr) {
        let command = self.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(command = %command, "stderr: {line}");
            }
        });
    }

    async fn write_line(&self, message: &str) -> Result<(), TransportError> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(TransportError::NotConnected)?;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

/// Correlation key of a response line: its `id`, when the line carries a
/// `result` or `error`. Requests and notifications from the server yield `None`.
fn reply_key(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("result") && !object.contains_key("error") {
        return None;
    }
    object.get("id").filter(|id| !id.is_null()).map(Value::to_string)
}

fn request_key(message: &str) -> Option<String> {
    let value: Value = serde_json::from_str(message).ok()?;
    value
        .get("id")
        .filter(|id| !id.is_null())
        .map(Value::to_string)
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), TransportError> {
        debug!(command = %self.command, args = ?self.args, "starting stdio server");
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Config("unable to capture stdin of stdio server".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Config("unable to capture stdout of stdio server".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_drain(stderr);
        }
        self.spawn_stdout_reader(stdout)?;

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        info!(command = %self.command, "stdio transport ready");
        Ok(())
    }

    async fn send(&self, message: String) -> Result<Option<String>, TransportError> {
        let Some(key) = request_key(&message) else {
            self.write_line(&message).await?;
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), tx);

        if let Err(err) = self.write_line(&message).await {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdio server exited before replying",
            ))),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                Err(TransportError::Timeout(self.request_timeout))
            }
        }
    }

    async fn receive(&self) -> Option<String> {
        self.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(err) = child.start_kill() {
                warn!(command = %self.command, error = %err, "failed to stop stdio server");
            }
            let _ = child.wait().await;
        }
        self.inbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(command = %self.command, "stdio transport closed");
    }
}
