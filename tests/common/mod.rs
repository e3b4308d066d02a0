//! Shared integration-test harness: an in-memory client that speaks
//! Content-Length framed JSON-RPC to a `ProtocolHost`, and a wrapper that
//! spawns the `toolhost` binary over stdio.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::process::{Child, Command};
use tokio_util::codec::FramedRead;

use toolhost::ProtocolHost;
use toolhost::config::{HostConfig, TransportConfig};
use toolhost::transport::{ContentLengthCodec, StreamTransport, encode_frame};

/// Default timeout for reading a single message from the host.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Host configuration with a short drain so tests end quickly.
#[must_use]
pub fn test_config() -> HostConfig {
    HostConfig {
        drain_timeout: Duration::from_millis(500),
        ..HostConfig::default()
    }
}

/// In-memory client type used by the integration tests.
pub type MemoryClient = TestClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// Builds an unstarted host wired to an in-memory client.
#[must_use]
pub fn host_pair(config: HostConfig) -> (ProtocolHost, MemoryClient) {
    host_pair_with(TransportConfig::default(), config)
}

/// Like [`host_pair`] with custom transport limits.
#[must_use]
pub fn host_pair_with(transport: TransportConfig, config: HostConfig) -> (ProtocolHost, MemoryClient) {
    let (host_side, client_side) = tokio::io::duplex(64 * 1024);
    let (host_read, host_write) = tokio::io::split(host_side);
    let transport = StreamTransport::new(host_read, host_write, transport);
    let host = ProtocolHost::new(Arc::new(transport), config);

    let (client_read, client_write) = tokio::io::split(client_side);
    (host, TestClient::new(client_read, client_write))
}

/// Client end of a Content-Length framed JSON-RPC stream.
///
/// Messages that arrive while waiting for something else are buffered
/// and handed out by later `expect_*` calls.
pub struct TestClient<R, W> {
    frames: FramedRead<R, ContentLengthCodec>,
    writer: Option<W>,
    next_id: i64,
    buffered: Vec<Value>,
}

#[allow(clippy::missing_panics_doc)]
impl<R, W> TestClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps a reader/writer pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            frames: FramedRead::new(reader, ContentLengthCodec::default()),
            writer: Some(writer),
            next_id: 1,
            buffered: Vec::new(),
        }
    }

    /// Writes raw bytes with no framing applied.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let writer = self.writer.as_mut().expect("client writer already closed");
        writer.write_all(bytes).await.expect("failed to write");
        writer.flush().await.expect("failed to flush");
    }

    /// Frames and writes one JSON value.
    pub async fn send_json(&mut self, message: &Value) {
        let payload = serde_json::to_vec(message).expect("failed to serialize message");
        let mut frame = BytesMut::new();
        encode_frame(&payload, &mut frame);
        self.send_raw(&frame).await;
    }

    /// Sends a request and returns its id without waiting for the response.
    pub async fn send_request(&mut self, method: &str, params: Option<Value>) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut request = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if let Some(params) = params {
            request["params"] = params;
        }
        self.send_json(&request).await;
        id
    }

    /// Sends a request and waits for the matching response.
    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Value {
        let id = self.send_request(method, params).await;
        self.expect_response(id).await
    }

    /// Sends a notification.
    pub async fn notify(&mut self, method: &str, params: Option<Value>) {
        let mut notification = json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            notification["params"] = params;
        }
        self.send_json(&notification).await;
    }

    /// Answers a host-initiated request.
    pub async fn respond(&mut self, id: &Value, result: Value) {
        self.send_json(&json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await;
    }

    /// Sends `initialize` with typical client params.
    pub async fn initialize(&mut self) -> Value {
        self.request(
            "initialize",
            Some(json!({
                "processId": 4242,
                "clientInfo": { "name": "integration-test", "version": "0.0.1" },
                "capabilities": {}
            })),
        )
        .await
    }

    /// Closes the client's write half (the host sees EOF).
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Reads the next message, or `None` once the host closed the stream.
    pub async fn next_message(&mut self, timeout: Duration) -> Option<Value> {
        let next = tokio::time::timeout(timeout, self.frames.next())
            .await
            .expect("timed out waiting for message from host")?;
        let frame = next.expect("frame decode error");
        Some(serde_json::from_slice(&frame).expect("host sent invalid JSON"))
    }

    /// Reads the next message, panicking on EOF.
    pub async fn read_message(&mut self) -> Value {
        self.next_message(DEFAULT_TIMEOUT)
            .await
            .expect("unexpected EOF from host")
    }

    /// Waits for the response to request `id`.
    pub async fn expect_response(&mut self, id: i64) -> Value {
        self.expect(|m| m.get("id").and_then(Value::as_i64) == Some(id) && m.get("method").is_none())
            .await
    }

    /// Waits for a notification with `method`.
    pub async fn expect_notification(&mut self, method: &str) -> Value {
        self.expect(|m| m.get("id").is_none() && m.get("method").and_then(Value::as_str) == Some(method))
            .await
    }

    /// Waits for a host-initiated request with `method`.
    pub async fn expect_request(&mut self, method: &str) -> Value {
        self.expect(|m| m.get("id").is_some() && m.get("method").and_then(Value::as_str) == Some(method))
            .await
    }

    /// Asserts the host closes the stream without sending anything else.
    pub async fn expect_eof(&mut self) {
        if let Some(message) = self.next_message(DEFAULT_TIMEOUT).await {
            panic!("expected EOF, got {message}");
        }
    }

    async fn expect(&mut self, matches: impl Fn(&Value) -> bool) -> Value {
        if let Some(idx) = self.buffered.iter().position(&matches) {
            return self.buffered.remove(idx);
        }
        loop {
            let message = self.read_message().await;
            if matches(&message) {
                return message;
            }
            self.buffered.push(message);
        }
    }
}

/// A running `toolhost serve` process speaking over its stdio.
///
/// The child process is killed on drop via `kill_on_drop(true)`.
pub struct ToolhostProcess {
    child: Child,
    pub client: TestClient<tokio::process::ChildStdout, tokio::process::ChildStdin>,
}

#[allow(clippy::missing_panics_doc)]
impl ToolhostProcess {
    /// Spawns `toolhost serve` with extra arguments.
    pub fn spawn(extra_args: &[&str]) -> Self {
        let bin = env!("CARGO_BIN_EXE_toolhost");
        let mut child = Command::new(bin)
            .arg("--quiet")
            .arg("serve")
            .args(extra_args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .expect("failed to spawn toolhost");

        let stdin = child.stdin.take().expect("stdin not captured");
        let stdout = child.stdout.take().expect("stdout not captured");
        Self {
            child,
            client: TestClient::new(stdout, stdin),
        }
    }

    /// Runs `toolhost` with `args` to completion and captures its output.
    pub fn spawn_command(args: &[&str]) -> std::process::Output {
        std::process::Command::new(env!("CARGO_BIN_EXE_toolhost"))
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .expect("failed to run toolhost")
    }

    /// Waits for the process to exit and returns its exit code.
    pub async fn wait(mut self) -> i32 {
        self.client.close().await;
        let status = tokio::time::timeout(Duration::from_secs(10), self.child.wait())
            .await
            .expect("toolhost did not exit in time")
            .expect("failed to wait for toolhost");
        status.code().expect("toolhost terminated by signal")
    }

    /// Sends a signal to the child.
    pub fn signal(&self, signal: &str) {
        let pid = self.child.id().expect("child already exited");
        let status = std::process::Command::new("kill")
            .args([&format!("-{signal}"), &pid.to_string()])
            .status()
            .expect("failed to run kill");
        assert!(status.success());
    }
}
