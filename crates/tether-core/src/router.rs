//! Request validation and dispatch on the device.
//!
//! The [`RequestRouter`] receives each completed frame from the connection
//! manager and:
//!
//! 1. parses the text payload as JSON ([`RouteError::MalformedRequest`] if
//!    that fails; nothing can be sent back without an id),
//! 2. requires a non-empty `id`,
//! 3. drops duplicates of active or recently completed ids after re-sending
//!    the acknowledgment,
//! 4. requires a recognized `type` and a compatible `version`,
//! 5. acknowledges receipt,
//! 6. validates `args` into a typed [`Operation`] (failures become
//!    application-level error responses),
//! 7. runs local operations inline under a timer, or records the request as
//!    active and forwards it to the [`ExecutionContext`].
//!
//! Completions from the execution context come back through
//! [`complete`](RequestRouter::complete).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionId;
use crate::context::{ContextCompletion, ExecutionContext};
use crate::emitter::{self, OutboundFrame};
use crate::envelope::{
    is_compatible_version, LogLevel, Operation, OperationType, RecentLogsArgs, RequestEnvelope,
    Settings, PROTOCOL_VERSION,
};
use crate::handler::{HandlerError, HandlerOutput, HandlerResult, LocalHandler};
use crate::recent_logs::RecentLogs;

/// Number of completed ids remembered for duplicate suppression.
pub const RECENT_ID_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Reasons an inbound frame was not dispatched.
#[derive(Error, Debug)]
pub enum RouteError {
    /// The text payload is not a JSON object.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// The request lacks a usable id, type or version.
    #[error("invalid request {}: {reason}", .id.as_deref().unwrap_or("<no id>"))]
    InvalidRequest { id: Option<String>, reason: String },

    /// The id matches a request that is active or already answered.
    #[error("duplicate request {0}")]
    DuplicateRequest(String),
}

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Where the router writes acknowledgments and responses.
pub trait ResponseSink {
    /// Queue an acknowledgment for `id` on `conn`.
    fn send_ack(&mut self, conn: ConnectionId, id: &str);

    /// Queue a response on `conn`. Returns `false` if the connection is gone.
    fn send_response(&mut self, conn: ConnectionId, frame: OutboundFrame) -> bool;
}

/// Applies `setSettings` log-level changes.
pub trait LogLevelControl: Send {
    fn set_level(&mut self, level: LogLevel) -> Result<(), String>;
    fn level(&self) -> LogLevel;
}

/// A [`LogLevelControl`] that only records the requested level.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticLogLevel(pub LogLevel);

impl LogLevelControl for StaticLogLevel {
    fn set_level(&mut self, level: LogLevel) -> Result<(), String> {
        self.0 = level;
        Ok(())
    }

    fn level(&self) -> LogLevel {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

/// A request handed to the execution context and awaiting completion.
#[derive(Debug)]
struct ActiveRequest {
    conn: ConnectionId,
    kind: OperationType,
    started: Instant,
}

/// Bounded set of recently completed ids, evicted oldest first.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RequestRouter
// ---------------------------------------------------------------------------

/// Validates and dispatches requests. Owned by the device loop.
pub struct RequestRouter {
    local: Box<dyn LocalHandler>,
    context: Box<dyn ExecutionContext>,
    log_level: Box<dyn LogLevelControl>,
    recent_logs: RecentLogs,
    active: HashMap<String, ActiveRequest>,
    completed: RecentIds,
    agent_version: String,
    started_at: DateTime<Utc>,
}

impl RequestRouter {
    pub fn new(local: impl LocalHandler + 'static, context: impl ExecutionContext + 'static) -> Self {
        Self {
            local: Box::new(local),
            context: Box::new(context),
            log_level: Box::new(StaticLogLevel::default()),
            recent_logs: RecentLogs::default(),
            active: HashMap::new(),
            completed: RecentIds::new(RECENT_ID_CAPACITY),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        }
    }

    /// Route `setSettings` through `control`.
    pub fn with_log_level_control(mut self, control: impl LogLevelControl + 'static) -> Self {
        self.log_level = Box::new(control);
        self
    }

    /// Serve `getRecentLogs` from `logs`.
    pub fn with_recent_logs(mut self, logs: RecentLogs) -> Self {
        self.recent_logs = logs;
        self
    }

    /// Version reported by `handshake`.
    pub fn with_agent_version(mut self, version: impl Into<String>) -> Self {
        self.agent_version = version.into();
        self
    }

    /// Number of requests awaiting an execution-context completion.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Validate and dispatch one frame received on `conn`.
    pub fn route(
        &mut self,
        conn: ConnectionId,
        text: &str,
        binary: Vec<u8>,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), RouteError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| RouteError::MalformedRequest(e.to_string()))?;
        if !value.is_object() {
            return Err(RouteError::MalformedRequest("not a JSON object".into()));
        }

        let id = match value.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                return Err(RouteError::InvalidRequest {
                    id: None,
                    reason: "missing id".into(),
                })
            }
        };

        if self.active.contains_key(&id) || self.completed.contains(&id) {
            sink.send_ack(conn, &id);
            return Err(RouteError::DuplicateRequest(id));
        }

        let kind = match value.get("type").and_then(Value::as_str) {
            Some(name) => name.parse::<OperationType>(),
            None => Err("missing type".to_string()),
        };
        let kind = match kind {
            Ok(kind) => kind,
            Err(reason) => return Err(self.reject(conn, id, None, reason, sink)),
        };

        match value.get("version").and_then(Value::as_str) {
            Some(version) if is_compatible_version(version) => {}
            Some(version) => {
                let reason = format!(
                    "incompatible protocol version {version}, agent speaks {PROTOCOL_VERSION}"
                );
                return Err(self.reject(conn, id, Some(kind), reason, sink));
            }
            None => return Err(self.reject(conn, id, Some(kind), "missing version".into(), sink)),
        }

        sink.send_ack(conn, &id);

        let envelope: RequestEnvelope = match serde_json::from_value(value) {
            Ok(envelope) => envelope,
            Err(e) => return Err(self.reject(conn, id, Some(kind), e.to_string(), sink)),
        };
        debug!(
            id = %id,
            op = kind.as_str(),
            callback = %envelope.callback_address,
            log_level = %envelope.settings.log_level,
            "request"
        );

        let operation = match Operation::parse(kind, Some(envelope.args)) {
            Ok(operation) => operation,
            Err(e) => {
                // Application-level failure: answered, not a framing error.
                debug!(id = %id, error = %e, "argument validation failed");
                self.respond(conn, &id, kind, Err(HandlerError::new(e.to_string())), None, sink);
                return Ok(());
            }
        };

        if kind.is_local() {
            let started = Instant::now();
            let result = self.handle_local(&operation, &binary);
            self.respond(conn, &id, kind, result, Some(started), sink);
        } else {
            self.active.insert(
                id.clone(),
                ActiveRequest {
                    conn,
                    kind,
                    started: Instant::now(),
                },
            );
            trace!(id = %id, op = kind.as_str(), "forwarded to execution context");
            self.context.submit(id, operation, binary);
        }
        Ok(())
    }

    /// Correlate an execution-context completion with its active request and
    /// emit the response.
    pub fn complete(&mut self, completion: ContextCompletion, sink: &mut dyn ResponseSink) {
        let ContextCompletion { id, result } = completion;
        let Some(active) = self.active.remove(&id) else {
            warn!(id = %id, "completion for unknown request");
            return;
        };
        self.respond(active.conn, &id, active.kind, result, Some(active.started), sink);
    }

    fn handle_local(&mut self, operation: &Operation, binary: &[u8]) -> HandlerResult {
        match operation {
            Operation::Handshake => Ok(HandlerOutput::new()
                .with("protocolVersion", PROTOCOL_VERSION)
                .with("agentVersion", self.agent_version.clone())
                .with("startedAt", self.started_at.to_rfc3339())),
            Operation::SetSettings(Settings { log_level }) => {
                self.log_level
                    .set_level(*log_level)
                    .map_err(HandlerError::new)?;
                debug!(level = %log_level, "log level changed");
                Ok(HandlerOutput::new().with("logLevel", self.log_level.level().as_str()))
            }
            Operation::GetRecentLogs(RecentLogsArgs { max_lines }) => {
                Ok(HandlerOutput::new().with("lines", self.recent_logs.lines(*max_lines)))
            }
            Operation::GetApplicationStartTime => {
                let uptime = Utc::now() - self.started_at;
                Ok(HandlerOutput::new()
                    .with("startTime", self.started_at.to_rfc3339())
                    .with("uptimeMs", uptime.num_milliseconds().max(0)))
            }
            other => self.local.handle(other, binary),
        }
    }

    fn respond(
        &mut self,
        conn: ConnectionId,
        id: &str,
        kind: OperationType,
        result: HandlerResult,
        started: Option<Instant>,
        sink: &mut dyn ResponseSink,
    ) {
        self.completed.insert(id.to_string());
        let frame = match emitter::build_response(id, Some(kind), result, started) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(id, error = %e, "response could not be encoded");
                let fallback = Err(HandlerError::new(format!("response could not be encoded: {e}")));
                match emitter::build_response(id, Some(kind), fallback, started) {
                    Ok(frame) => frame,
                    Err(_) => return,
                }
            }
        };
        if !sink.send_response(conn, frame) {
            debug!(id, conn = %conn, "connection gone; response dropped");
        }
    }

    /// Best-effort error response for a request with a known id.
    fn reject(
        &mut self,
        conn: ConnectionId,
        id: String,
        kind: Option<OperationType>,
        reason: String,
        sink: &mut dyn ResponseSink,
    ) -> RouteError {
        self.completed.insert(id.clone());
        let result = Err(HandlerError::new(reason.clone()));
        match emitter::build_response(&id, kind, result, None) {
            Ok(frame) => {
                sink.send_response(conn, frame);
            }
            Err(e) => warn!(id = %id, error = %e, "error response could not be encoded"),
        }
        RouteError::InvalidRequest {
            id: Some(id),
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::MemoryRegistry;
    use crate::reassembler::{FrameReassembler, Progress};
    use crate::wire::{ByteBuffer, FrameLimits};
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        acks: Vec<(ConnectionId, String)>,
        responses: Vec<(ConnectionId, Value, Vec<u8>)>,
        closed: Vec<ConnectionId>,
    }

    impl ResponseSink for RecordingSink {
        fn send_ack(&mut self, conn: ConnectionId, id: &str) {
            self.acks.push((conn, id.to_string()));
        }

        fn send_response(&mut self, conn: ConnectionId, frame: OutboundFrame) -> bool {
            if self.closed.contains(&conn) {
                return false;
            }
            let mut buffer = ByteBuffer::new();
            buffer.append(&frame.bytes);
            let mut r = FrameReassembler::new(FrameLimits::default());
            match r.process(&mut buffer).unwrap() {
                Progress::Complete { frame, .. } => {
                    let body = serde_json::from_str(&frame.text).unwrap();
                    self.responses.push((conn, body, frame.binary));
                }
                Progress::NeedMore => panic!("partial frame"),
            }
            true
        }
    }

    #[derive(Default)]
    struct QueuedContext {
        submitted: std::sync::Arc<std::sync::Mutex<Vec<(String, OperationType)>>>,
    }

    impl ExecutionContext for QueuedContext {
        fn submit(&mut self, id: String, operation: Operation, _binary: Vec<u8>) {
            self.submitted.lock().unwrap().push((id, operation.kind()));
        }
    }

    const C1: ConnectionId = ConnectionId(1);

    fn router() -> RequestRouter {
        RequestRouter::new(MemoryRegistry::new(), QueuedContext::default())
    }

    fn request(id: &str, kind: &str, args: Value) -> String {
        json!({
            "id": id,
            "type": kind,
            "args": args,
            "settings": {"logLevel": "info"},
            "callbackAddress": "127.0.0.1:1",
            "version": PROTOCOL_VERSION,
        })
        .to_string()
    }

    #[test]
    fn local_operation_acks_then_responds() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        let text = request("r1", "writeRegistry", json!({"values": {"s": {"k": "v"}}}));
        router.route(C1, &text, vec![], &mut sink).unwrap();

        assert_eq!(sink.acks, vec![(C1, "r1".to_string())]);
        assert_eq!(sink.responses.len(), 1);
        let (conn, body, _) = &sink.responses[0];
        assert_eq!(*conn, C1);
        assert_eq!(body["id"], "r1");
        assert_eq!(body["success"], true);
        assert!(body["timeTaken"].is_u64());
    }

    #[test]
    fn malformed_json_sends_nothing() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        let err = router.route(C1, "{not json", vec![], &mut sink).unwrap_err();
        assert!(matches!(err, RouteError::MalformedRequest(_)));
        assert!(sink.acks.is_empty());
        assert!(sink.responses.is_empty());
    }

    #[test]
    fn missing_id_is_invalid_without_response() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        let text = json!({"type": "handshake", "version": PROTOCOL_VERSION}).to_string();
        let err = router.route(C1, &text, vec![], &mut sink).unwrap_err();
        assert!(matches!(err, RouteError::InvalidRequest { id: None, .. }));
        assert!(sink.responses.is_empty());
    }

    #[test]
    fn unknown_type_gets_best_effort_error() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        let err = router
            .route(C1, &request("r2", "teleport", json!({})), vec![], &mut sink)
            .unwrap_err();
        assert!(matches!(err, RouteError::InvalidRequest { id: Some(_), .. }));
        assert!(sink.acks.is_empty());
        let (_, body, _) = &sink.responses[0];
        assert_eq!(body["success"], false);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unknown operation type"));
    }

    #[test]
    fn incompatible_version_is_rejected() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        let text = json!({"id": "r3", "type": "handshake", "args": {}, "version": "2.0.0"})
            .to_string();
        let err = router.route(C1, &text, vec![], &mut sink).unwrap_err();
        assert!(err.to_string().contains("incompatible protocol version"));
        assert_eq!(sink.responses[0].1["success"], false);
    }

    #[test]
    fn bad_args_are_an_application_error() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        router
            .route(C1, &request("r4", "statPath", json!({"path": 7})), vec![], &mut sink)
            .unwrap();
        assert_eq!(sink.acks.len(), 1);
        let (_, body, _) = &sink.responses[0];
        assert_eq!(body["success"], false);
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .starts_with("invalid args for statPath"));
    }

    #[test]
    fn async_operation_is_forwarded_and_completed() {
        let context = QueuedContext::default();
        let submitted = context.submitted.clone();
        let mut router = RequestRouter::new(MemoryRegistry::new(), context);
        let mut sink = RecordingSink::default();

        router
            .route(C1, &request("a1", "getValue", json!({"keyPath": "x"})), vec![], &mut sink)
            .unwrap();
        assert_eq!(router.active_count(), 1);
        assert!(sink.responses.is_empty());
        assert_eq!(
            submitted.lock().unwrap().as_slice(),
            &[("a1".to_string(), OperationType::GetValue)]
        );

        let completion = ContextCompletion {
            id: "a1".into(),
            result: Ok(HandlerOutput::new().with("value", "hello")),
        };
        router.complete(completion, &mut sink);
        assert_eq!(router.active_count(), 0);
        let (_, body, _) = &sink.responses[0];
        assert_eq!(body["value"], "hello");
        assert!(body["timeTaken"].is_u64());
    }

    #[test]
    fn duplicate_of_active_request_is_reacked_and_dropped() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        let text = request("d1", "callFunc", json!({"keyPath": "x", "funcName": "f"}));
        router.route(C1, &text, vec![], &mut sink).unwrap();
        let err = router.route(C1, &text, vec![], &mut sink).unwrap_err();
        assert!(matches!(err, RouteError::DuplicateRequest(ref id) if id == "d1"));
        assert_eq!(sink.acks.len(), 2);
        assert_eq!(router.active_count(), 1);

        router.complete(
            ContextCompletion {
                id: "d1".into(),
                result: Ok(HandlerOutput::new()),
            },
            &mut sink,
        );
        // A late retry after completion is still suppressed.
        assert!(router.route(C1, &text, vec![], &mut sink).is_err());
        assert_eq!(sink.responses.len(), 1);
    }

    #[test]
    fn retried_local_request_answers_once() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        let text = request("l1", "handshake", json!({}));
        router.route(C1, &text, vec![], &mut sink).unwrap();
        assert!(router.route(ConnectionId(2), &text, vec![], &mut sink).is_err());
        assert_eq!(sink.responses.len(), 1);
        assert_eq!(sink.acks.len(), 2);
    }

    #[test]
    fn completion_for_unknown_id_is_ignored() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        router.complete(
            ContextCompletion {
                id: "ghost".into(),
                result: Ok(HandlerOutput::new()),
            },
            &mut sink,
        );
        assert!(sink.responses.is_empty());
    }

    #[test]
    fn completion_for_closed_connection_is_dropped() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        router
            .route(C1, &request("g1", "getFocusedNode", json!({})), vec![], &mut sink)
            .unwrap();
        sink.closed.push(C1);
        router.complete(
            ContextCompletion {
                id: "g1".into(),
                result: Ok(HandlerOutput::new()),
            },
            &mut sink,
        );
        assert!(sink.responses.is_empty());
        assert_eq!(router.active_count(), 0);
    }

    #[test]
    fn set_settings_changes_level() {
        let mut router = router();
        let mut sink = RecordingSink::default();
        router
            .route(C1, &request("s1", "setSettings", json!({"logLevel": "verbose"})), vec![], &mut sink)
            .unwrap();
        assert_eq!(sink.responses[0].1["logLevel"], "verbose");
    }

    #[test]
    fn recent_logs_are_served() {
        let logs = RecentLogs::new(10);
        logs.push("one");
        logs.push("two");
        logs.push("three");
        let mut router = router().with_recent_logs(logs);
        let mut sink = RecordingSink::default();
        router
            .route(C1, &request("g2", "getRecentLogs", json!({"maxLines": 2})), vec![], &mut sink)
            .unwrap();
        assert_eq!(sink.responses[0].1["lines"], json!(["two", "three"]));
    }

    #[test]
    fn handshake_reports_versions() {
        let mut router = router().with_agent_version("9.9.9");
        let mut sink = RecordingSink::default();
        router
            .route(C1, &request("h1", "handshake", json!({})), vec![], &mut sink)
            .unwrap();
        let body = &sink.responses[0].1;
        assert_eq!(body["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(body["agentVersion"], "9.9.9");
        assert!(body["startedAt"].is_string());
    }

    #[test]
    fn recent_ids_evict_oldest() {
        let mut ids = RecentIds::new(2);
        ids.insert("a".into());
        ids.insert("b".into());
        ids.insert("c".into());
        assert!(!ids.contains("a"));
        assert!(ids.contains("b"));
        assert!(ids.contains("c"));
    }
}
