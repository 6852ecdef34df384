//! Shared test helpers for tether-core integration tests.
//!
//! Provides a programmable mock device for exercising the host dispatcher,
//! an in-process agent (real connection manager and router) for exercising
//! the device side, and raw frame helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::connection::{ConnectionManager, ServerConfig, ServerError};
use tether_core::context::{AsyncHandler, SpawnedContext};
use tether_core::dispatcher::{DispatcherConfig, RequestDispatcher};
use tether_core::envelope::{Operation, PROTOCOL_VERSION};
use tether_core::handler::{HandlerError, HandlerOutput, HandlerResult, MemoryRegistry};
use tether_core::recent_logs::RecentLogs;
use tether_core::router::RequestRouter;
use tether_core::wire::{encode_frame, read_frame, Frame, FrameLimits};

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

/// Encode a request frame the way the host would.
pub fn request_frame(id: &str, kind: &str, args: Value, binary: &[u8]) -> Vec<u8> {
    let text = json!({
        "id": id,
        "type": kind,
        "args": args,
        "settings": {"logLevel": "debug"},
        "callbackAddress": "127.0.0.1:1",
        "version": PROTOCOL_VERSION,
    });
    encode_frame(&text.to_string(), binary).unwrap()
}

/// Read one frame and parse its text as JSON.
pub async fn read_json(stream: &mut TcpStream) -> (Value, Vec<u8>) {
    let frame = read_frame(stream, &FrameLimits::default()).await.unwrap();
    (serde_json::from_str(&frame.text).unwrap(), frame.binary)
}

/// Read frames until `count` non-ack responses arrived, returning them.
pub async fn read_responses(stream: &mut TcpStream, count: usize) -> Vec<(Value, Vec<u8>)> {
    let mut responses = Vec::new();
    while responses.len() < count {
        let (body, binary) = read_json(stream).await;
        if body.get("ack").is_none() {
            responses.push((body, binary));
        }
    }
    responses
}

/// An address nothing is listening on (yet).
pub fn free_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// A dispatcher for `addr` with small timings and no diagnostics probe.
pub fn quick_dispatcher(addr: SocketAddr) -> RequestDispatcher {
    let mut config = DispatcherConfig::new(addr.to_string());
    config.global_default_timeout = Duration::from_secs(2);
    RequestDispatcher::new(config).without_diagnostics()
}

// ---------------------------------------------------------------------------
// Programmable mock device
// ---------------------------------------------------------------------------

/// What the mock device does with one incoming request frame.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Acknowledge, then respond successfully with these fields.
    Respond(Value),
    /// Acknowledge, then respond with `success: false` and this message.
    Reject(String),
    /// Acknowledge, wait, then respond successfully with these fields.
    Delay(Duration, Value),
    /// Acknowledge and never respond.
    AckOnly,
    /// Acknowledge, then close the connection.
    AckThenClose,
    /// Read the frame and do nothing.
    Ignore,
    /// Read the frame and close the connection.
    Drop,
    /// Acknowledge, then send the same successful response twice.
    RespondTwice(Value),
    /// Acknowledge, then respond with the request's binary payload.
    EchoBinary,
}

/// A scripted stand-in for the device listener.
///
/// Every accepted connection shares one behavior script; each request frame
/// consumes the next entry, and frames beyond the script are ignored.
/// `getRecentLogs` requests are answered with the configured log lines
/// without consuming the script.
pub struct MockDevice {
    pub addr: SocketAddr,
    /// Every request envelope received, in arrival order.
    pub received: Arc<Mutex<Vec<Value>>>,
    accept: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start(behaviors: Vec<MockBehavior>) -> Self {
        Self::start_with_logs("127.0.0.1:0".parse().unwrap(), behaviors, Vec::new()).await
    }

    pub async fn start_at(addr: SocketAddr, behaviors: Vec<MockBehavior>) -> Self {
        Self::start_with_logs(addr, behaviors, Vec::new()).await
    }

    pub async fn start_with_logs(
        addr: SocketAddr,
        behaviors: Vec<MockBehavior>,
        logs: Vec<String>,
    ) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(Mutex::new(VecDeque::from(behaviors)));
        let received = Arc::new(Mutex::new(Vec::new()));
        let logs = Arc::new(logs);

        let accept = {
            let received = received.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        return;
                    };
                    tokio::spawn(serve_mock_connection(
                        stream,
                        script.clone(),
                        received.clone(),
                        logs.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            received,
            accept,
        }
    }

    /// Received envelopes with the given id.
    pub fn received_with_id(&self, id: &str) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v["id"] == id)
            .count()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn send_json(stream: &mut TcpStream, body: Value, binary: &[u8]) -> bool {
    let bytes = encode_frame(&body.to_string(), binary).unwrap();
    stream.write_all(&bytes).await.is_ok()
}

async fn serve_mock_connection(
    mut stream: TcpStream,
    script: Arc<Mutex<VecDeque<MockBehavior>>>,
    received: Arc<Mutex<Vec<Value>>>,
    logs: Arc<Vec<String>>,
) {
    loop {
        let Ok(Frame { text, binary }) = read_frame(&mut stream, &FrameLimits::default()).await
        else {
            return;
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        let id = request["id"].as_str().unwrap_or_default().to_string();
        let ack = json!({"id": id, "ack": true});

        if request["type"] == "getRecentLogs" {
            send_json(&mut stream, ack, &[]).await;
            let body = json!({"id": id, "success": true, "lines": logs.as_slice()});
            send_json(&mut stream, body, &[]).await;
            continue;
        }

        received.lock().unwrap().push(request);
        let behavior = script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MockBehavior::Ignore);

        let success = |fields: Value| {
            let mut body = json!({"id": id, "success": true, "timeTaken": 1});
            if let (Some(body), Value::Object(fields)) = (body.as_object_mut(), fields) {
                body.extend(fields);
            }
            body
        };

        match behavior {
            MockBehavior::Respond(fields) => {
                send_json(&mut stream, ack, &[]).await;
                send_json(&mut stream, success(fields), &[]).await;
            }
            MockBehavior::Reject(message) => {
                send_json(&mut stream, ack, &[]).await;
                let body = json!({"id": id, "success": false, "error": {"message": message}});
                send_json(&mut stream, body, &[]).await;
            }
            MockBehavior::Delay(delay, fields) => {
                send_json(&mut stream, ack, &[]).await;
                tokio::time::sleep(delay).await;
                send_json(&mut stream, success(fields), &[]).await;
            }
            MockBehavior::AckOnly => {
                send_json(&mut stream, ack, &[]).await;
            }
            MockBehavior::AckThenClose => {
                send_json(&mut stream, ack, &[]).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                return;
            }
            MockBehavior::Ignore => {}
            MockBehavior::Drop => return,
            MockBehavior::RespondTwice(fields) => {
                send_json(&mut stream, ack, &[]).await;
                send_json(&mut stream, success(fields.clone()), &[]).await;
                send_json(&mut stream, success(fields), &[]).await;
            }
            MockBehavior::EchoBinary => {
                send_json(&mut stream, ack, &[]).await;
                let body = success(json!({"echoed": binary.len()}));
                send_json(&mut stream, body, &binary).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-process agent
// ---------------------------------------------------------------------------

/// Stand-in for the device application's render-thread context.
///
/// - `getValue` returns the key path as `value`; field `"blob"` returns a
///   200 KiB binary payload, and any request binary is reported as
///   `binaryLength`.
/// - `callFunc` named `"fail"` fails with `"boom"`; others return `"ok"`.
/// - `onFieldChangeOnce` never observes a change and gives up after its
///   `retryTimeout`.
/// - everything else succeeds after a short delay.
pub struct ScriptedScene;

pub const BLOB_LEN: usize = 200 * 1024;

#[async_trait]
impl AsyncHandler for ScriptedScene {
    async fn handle(&self, operation: Operation, binary: Vec<u8>) -> HandlerResult {
        match operation {
            Operation::GetValue(args) if args.field.as_deref() == Some("blob") => {
                let blob: Vec<u8> = (0..BLOB_LEN).map(|i| (i % 253) as u8).collect();
                Ok(HandlerOutput::new()
                    .with("size", BLOB_LEN)
                    .with_binary(blob))
            }
            Operation::GetValue(args) => Ok(HandlerOutput::new()
                .with("value", args.node.key_path)
                .with("binaryLength", binary.len())),
            Operation::CallFunc(args) if args.func_name == "fail" => {
                Err(HandlerError::new("boom"))
            }
            Operation::CallFunc(args) if args.func_name == "crash" => {
                panic!("crashed in {}", args.func_name)
            }
            Operation::CallFunc(_) => Ok(HandlerOutput::new().with("result", "ok")),
            Operation::OnFieldChangeOnce(args) => {
                let budget = args.retry_timeout.unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(budget)).await;
                Err(HandlerError::new(format!(
                    "gave up waiting for {} to change after {budget}ms",
                    args.field
                )))
            }
            _ => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(HandlerOutput::new())
            }
        }
    }
}

/// A real connection manager and router serving on an ephemeral port.
pub struct AgentHarness {
    pub addr: SocketAddr,
    pub logs: RecentLogs,
    /// Live connection count published by the manager.
    pub connections: watch::Receiver<usize>,
    token: CancellationToken,
    handle: Option<JoinHandle<Result<(), ServerError>>>,
}

impl AgentHarness {
    pub async fn start() -> Self {
        let manager = ConnectionManager::bind(ServerConfig::new("127.0.0.1:0".parse().unwrap()))
            .await
            .unwrap();
        let addr = manager.local_addr();
        let connections = manager.connection_watch();
        let logs = RecentLogs::new(100);
        let context = SpawnedContext::new(ScriptedScene, manager.completion_sender());
        let router = RequestRouter::new(MemoryRegistry::new(), context)
            .with_recent_logs(logs.clone())
            .with_agent_version("test");

        let token = CancellationToken::new();
        let handle = tokio::spawn(manager.run(router, token.clone()));
        Self {
            addr,
            logs,
            connections,
            token,
            handle: Some(handle),
        }
    }

    pub async fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        stream
    }

    /// Wait up to 2s for the live connection count to reach `n`.
    pub async fn wait_for_connections(&mut self, n: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(2), self.connections.wait_for(|c| *c == n))
            .await
            .is_ok()
    }

    /// Cancel the loop and wait for it to exit cleanly.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap().unwrap();
        }
    }
}

impl Drop for AgentHarness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
