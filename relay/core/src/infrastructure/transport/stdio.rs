// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Stdio transport: spawn the upstream as a subprocess and speak JSON-RPC
//! over its stdin/stdout. Stderr is streamed to the per-server log.
//!
//! Shutdown is graceful-then-force: stdin is closed and SIGTERM delivered,
//! then after a bounded grace period the child is hard-killed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::error::{RelayError, Result};
use crate::domain::server::ServerConfig;
use crate::infrastructure::logs::LogSink;
use crate::infrastructure::protocol::{
    read_json_line, write_json_line, JsonRpcRequest, JsonRpcResponse,
};
use crate::infrastructure::transport::{await_response, PendingMap, Transport};

/// Grace period between SIGTERM and a hard kill.
const KILL_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct StdioTransport {
    server_name: String,
    pending: Arc<PendingMap>,
    outbound: mpsc::Sender<Value>,
    child: Mutex<Option<Child>>,
    closed: CancellationToken,
}

impl StdioTransport {
    pub async fn spawn(config: &ServerConfig, log: Arc<LogSink>) -> Result<Self> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| RelayError::invalid_input(format!(
                "stdio server '{}' has no command",
                config.name
            )))?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RelayError::Transport(format!("failed to spawn '{command}': {e}"))
        })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(RelayError::Transport(format!(
                "spawned '{command}' without piped stdio"
            )));
        };

        let pending = Arc::new(PendingMap::new());
        let closed = CancellationToken::new();
        let (outbound, mut outbound_rx) = mpsc::channel::<Value>(64);

        // Writer: serialize frames onto the child's stdin.
        {
            let closed = closed.clone();
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut stdin = stdin;
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = outbound_rx.recv() => {
                            let Some(frame) = frame else { break };
                            if let Err(err) = write_json_line(&mut stdin, &frame).await {
                                debug!(server, %err, "stdin write failed");
                                break;
                            }
                        }
                    }
                }
            });
        }

        // Reader: route responses to waiting callers; cancel on EOF.
        {
            let pending = Arc::clone(&pending);
            let closed = closed.clone();
            let server = config.name.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout);
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        frame = read_json_line(&mut reader) => {
                            match frame {
                                Ok(Some(value)) => dispatch_frame(&server, &pending, value),
                                Ok(None) => break,
                                Err(err) => {
                                    debug!(server, %err, "stdout read failed");
                                    break;
                                }
                            }
                        }
                    }
                }
                pending.fail_all();
                closed.cancel();
            });
        }

        // Stderr: stream to the per-server log.
        {
            let server = config.name.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = closed.cancelled() => break,
                        line = lines.next_line() => {
                            match line {
                                Ok(Some(line)) => log.append(&server, &line),
                                _ => break,
                            }
                        }
                    }
                }
            });
        }

        Ok(Self {
            server_name: config.name.clone(),
            pending,
            outbound,
            child: Mutex::new(Some(child)),
            closed,
        })
    }

    async fn send_frame(&self, frame: Value) -> Result<()> {
        self.outbound.send(frame).await.map_err(|_| {
            RelayError::Transport(format!("connection to '{}' is closed", self.server_name))
        })
    }
}

fn dispatch_frame(server: &str, pending: &PendingMap, value: Value) {
    // Responses have an id plus result/error; anything else (server-side
    // notifications or requests) is outside the relay's contract and is
    // logged at trace.
    let is_response = value.get("result").is_some() || value.get("error").is_some();
    if is_response {
        if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value.clone()) {
            if let Some(id) = response.id.clone() {
                if pending.complete(&id, response) {
                    return;
                }
            }
        }
    }
    trace!(server, frame = %value, "ignoring unsolicited frame");
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (id, rx) = self.pending.register();
        let request = JsonRpcRequest::new(id, method, params);
        if let Err(err) = self.send_frame(serde_json::to_value(&request)?).await {
            self.pending.forget(id);
            return Err(err);
        }
        // Race the response against transport death: a registration that
        // slips in after the reader's final fail_all would otherwise wait
        // forever.
        tokio::select! {
            _ = self.closed.cancelled() => {
                self.pending.forget(id);
                Err(RelayError::Transport(format!(
                    "connection to '{}' is closed",
                    self.server_name
                )))
            }
            result = await_response(&self.server_name, rx) => result,
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let notification = JsonRpcRequest::notification(method, params);
        self.send_frame(serde_json::to_value(&notification)?).await
    }

    async fn close(&self) {
        self.closed.cancel();
        self.pending.fail_all();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SIGTERM first; the hard kill below is the bounded fallback.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(server = %self.server_name, %status, "upstream process exited");
            }
            _ => {
                warn!(server = %self.server_name, "upstream ignored SIGTERM; killing");
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sink() -> Arc<LogSink> {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(LogSink::open(dir.path()).unwrap());
        // Leak the tempdir so the sink outlives this helper in tests.
        std::mem::forget(dir);
        sink
    }

    #[tokio::test]
    async fn spawn_failure_is_a_transport_error() {
        let config = ServerConfig::stdio("ghost", "/nonexistent/definitely-not-a-binary", &[]);
        let err = StdioTransport::spawn(&config, sink()).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn echo_server_round_trip() {
        // A minimal MCP-ish echo: reads one JSON line, answers it by id.
        let script = r#"
import sys, json
for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    req = json.loads(line)
    if req.get("id") is not None:
        print(json.dumps({"jsonrpc": "2.0", "id": req["id"], "result": {"echo": req["method"]}}), flush=True)
"#;
        if !Path::new("/usr/bin/python3").exists() {
            return; // environment without python; covered by integration tests
        }
        let mut config = ServerConfig::stdio("echo", "/usr/bin/python3", &["-c"]);
        config.args.push(script.to_string());

        let transport = StdioTransport::spawn(&config, sink()).await.unwrap();
        let result = transport.request("tools/list", serde_json::json!({})).await.unwrap();
        assert_eq!(result["echo"], "tools/list");
        transport.close().await;
        assert!(transport.closed().is_cancelled());
    }

    #[tokio::test]
    async fn process_exit_fails_pending_requests() {
        let config = ServerConfig::stdio("quick-exit", "true", &[]);
        let transport = StdioTransport::spawn(&config, sink()).await.unwrap();
        // The process exits immediately; the request must not hang.
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            transport.request("tools/list", serde_json::json!({})),
        )
        .await
        .expect("request resolved");
        assert!(result.is_err());
        transport.close().await;
    }
}
