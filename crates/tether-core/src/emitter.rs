//! Response construction and the backpressure-aware write loop.
//!
//! [`build_response`] turns a [`HandlerResult`] into a complete encoded
//! frame: header, JSON text and optional binary payload concatenated into a
//! single buffer. [`write_chunked`] pushes such a buffer onto a stream in
//! bounded chunks, yielding to the scheduler whenever a high-water mark of
//! unflushed bytes is reached.

use std::io;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::envelope::OperationType;
use crate::handler::HandlerResult;
use crate::wire::{encode_frame, WireError};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest single write handed to the transport.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Unflushed bytes after which the writer flushes and yields.
pub const HIGH_WATER_MARK: usize = 64 * 1024;

/// Response bodies longer than this are logged as a summary only.
pub const LOG_BODY_LIMIT: usize = 1024;

/// Error message for a handler that reported failure without one.
pub const DEFAULT_FAILURE_MESSAGE: &str = "operation failed";

// ---------------------------------------------------------------------------
// Response frames
// ---------------------------------------------------------------------------

/// An encoded response ready to be queued on a connection.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub id: String,
    pub kind: Option<OperationType>,
    pub success: bool,
    pub time_taken: Option<u64>,
    /// Header + text + binary.
    pub bytes: Vec<u8>,
}

/// Build the response frame for `id`.
///
/// `success` defaults to `true` unless the handler set it; `id` is always
/// present; `timeTaken` is included when `started` is given.
pub fn build_response(
    id: &str,
    kind: Option<OperationType>,
    result: HandlerResult,
    started: Option<Instant>,
) -> Result<OutboundFrame, WireError> {
    let (mut body, binary) = match result {
        Ok(output) => (output.fields, output.binary.unwrap_or_default()),
        Err(error) => {
            let mut body = Map::new();
            body.insert("success".into(), Value::Bool(false));
            body.insert("error".into(), json!({ "message": error.message }));
            (body, Vec::new())
        }
    };

    body.insert("id".into(), Value::String(id.to_string()));
    let success = match body.get("success") {
        Some(Value::Bool(success)) => *success,
        _ => {
            body.insert("success".into(), Value::Bool(true));
            true
        }
    };
    // `error` is present exactly when `success` is false.
    if success {
        body.remove("error");
    } else if !body.contains_key("error") {
        body.insert("error".into(), json!({ "message": DEFAULT_FAILURE_MESSAGE }));
    }
    let time_taken = started.map(|started| started.elapsed().as_millis() as u64);
    if let Some(ms) = time_taken {
        body.insert("timeTaken".into(), Value::from(ms));
    }

    let text = Value::Object(body).to_string();
    let op = kind.map_or("unknown", |k| k.as_str());
    if text.len() > LOG_BODY_LIMIT {
        debug!(
            id,
            op,
            success,
            time_taken,
            text_len = text.len(),
            binary_len = binary.len(),
            "response"
        );
    } else {
        debug!(id, op, body = %text, binary_len = binary.len(), "response");
    }

    let bytes = encode_frame(&text, &binary)?;
    Ok(OutboundFrame {
        id: id.to_string(),
        kind,
        success,
        time_taken,
        bytes,
    })
}

/// Encode the acknowledgment frame for `id`.
pub fn ack_frame(id: &str) -> Result<Vec<u8>, WireError> {
    let text = json!({ "id": id, "ack": true }).to_string();
    encode_frame(&text, &[])
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

/// Write `bytes` to `writer` in [`CHUNK_SIZE`] pieces.
///
/// After every [`HIGH_WATER_MARK`] bytes the writer is flushed and the task
/// yields, so one large response cannot monopolize the runtime. A transport
/// that accepts zero bytes yields [`io::ErrorKind::WriteZero`].
pub async fn write_chunked<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut offset = 0;
    let mut unflushed = 0;
    while offset < bytes.len() {
        let end = (offset + CHUNK_SIZE).min(bytes.len());
        let n = writer.write(&bytes[offset..end]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "transport accepted no bytes",
            ));
        }
        offset += n;
        unflushed += n;
        if unflushed >= HIGH_WATER_MARK {
            trace!(written = offset, remaining = bytes.len() - offset, "draining");
            writer.flush().await?;
            tokio::task::yield_now().await;
            unflushed = 0;
        }
    }
    writer.flush().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
