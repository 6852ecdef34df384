//! Device log retrieval used to enrich timeout failures.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::envelope::{
    CallbackAddress, DeviceMessage, Operation, RecentLogsArgs, RequestEnvelope, Settings,
};
use crate::wire::{encode_frame, read_frame, FrameLimits};

/// Lines requested from the device when probing.
pub const PROBE_LINES: usize = 50;

/// Supplies recent device-side log output.
#[async_trait]
pub trait DiagnosticsSource: Send + Sync {
    /// Fetch recent log output, giving up after `budget`.
    async fn recent_logs(&self, budget: Duration) -> Option<String>;
}

/// Asks the device for its recent log lines over a fresh connection.
#[derive(Debug, Clone)]
pub struct DeviceLogProbe {
    address: String,
    max_lines: usize,
}

impl DeviceLogProbe {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_lines: PROBE_LINES,
        }
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    async fn fetch(&self) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
        let mut stream = TcpStream::connect(&self.address).await?;
        let operation = Operation::GetRecentLogs(RecentLogsArgs {
            max_lines: Some(self.max_lines),
        });
        let callback = CallbackAddress::Address(stream.local_addr()?.to_string());
        let envelope = RequestEnvelope::new(&operation, Settings::default(), callback)?;
        let text = serde_json::to_string(&envelope)?;
        stream.write_all(&encode_frame(&text, &[])?).await?;

        let limits = FrameLimits::default();
        loop {
            let frame = read_frame(&mut stream, &limits).await?;
            match DeviceMessage::from_frame(frame)? {
                DeviceMessage::Ack { .. } => continue,
                DeviceMessage::Response { envelope: reply, .. } if reply.id == envelope.id => {
                    if !reply.success {
                        let message = reply.error_message().unwrap_or("getRecentLogs failed");
                        return Err(message.to_string().into());
                    }
                    let lines = reply
                        .fields
                        .get("lines")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    return Ok(lines);
                }
                DeviceMessage::Response { .. } => continue,
            }
        }
    }
}

#[async_trait]
impl DiagnosticsSource for DeviceLogProbe {
    async fn recent_logs(&self, budget: Duration) -> Option<String> {
        match timeout(budget, self.fetch()).await {
            Ok(Ok(lines)) if !lines.is_empty() => Some(lines.join("\n")),
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                debug!(address = %self.address, error = %e, "device log probe failed");
                None
            }
            Err(_) => {
                debug!(address = %self.address, "device log probe timed out");
                None
            }
        }
    }
}
