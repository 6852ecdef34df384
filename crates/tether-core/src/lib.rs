//! # tether-core
//!
//! Request transport and framing for driving an application on a remote
//! device from a test-automation host.
//!
//! Both sides speak length-prefixed frames (an 8-byte header, a JSON
//! envelope and an optional binary payload) over TCP.
//!
//! ## Host side
//!
//! - [`dispatcher`] - `send(operation) -> reply`, with retry-until-acknowledged
//!   submission, device-scaled timeouts and diagnostic-rich failures
//! - [`correlator`] - pending operations keyed by request id
//! - [`fire_channel`] - the per-call submission connection
//! - [`diagnostics`] - recent device logs for timeout messages
//! - [`config`] - `~/.tether/config.json` device profiles
//!
//! ## Device side
//!
//! - [`connection`] - single-loop listener, connection map and frame backlog
//! - [`reassembler`] - per-connection frame reconstruction
//! - [`router`] - validation, dedup, local dispatch, active-request tracking
//! - [`emitter`] - response frames and the chunked write loop
//! - [`context`] - the asynchronous execution-context boundary
//! - [`handler`] - local handler seam and an in-memory registry
//! - [`recent_logs`] - ring buffer behind `getRecentLogs`
//!
//! ## Shared
//!
//! - [`wire`] - frame header, byte buffer cursor, frame encode/read
//! - [`envelope`] - request/response envelopes and the typed operation union

pub mod config;
pub mod connection;
pub mod context;
pub mod correlator;
pub mod diagnostics;
pub mod dispatcher;
pub mod emitter;
pub mod envelope;
pub mod fire_channel;
pub mod handler;
pub mod reassembler;
pub mod recent_logs;
pub mod router;
pub mod wire;
