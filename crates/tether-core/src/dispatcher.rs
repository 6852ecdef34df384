//! Host-side request dispatch with retry-until-acknowledged submission.
//!
//! [`RequestDispatcher::send`] is the single generic entry point: build an
//! envelope with a fresh id, register the pending operation, then keep
//! writing the request frame on a [`FireChannel`] every retry interval until
//! the device acknowledges that id. Acknowledgment only stops the retries.
//! The call resolves when the response frame arrives through the
//! [`CallbackCorrelator`], or fails once the (multiplier-scaled) timeout
//! elapses.
//!
//! # Example
//!
//! ```no_run
//! use tether_core::dispatcher::{DispatcherConfig, RequestDispatcher, SendOptions};
//! use tether_core::envelope::{GetValueArgs, NodeRef, Operation};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let dispatcher = RequestDispatcher::new(DispatcherConfig::new("192.168.1.40:9000"));
//!
//! let op = Operation::GetValue(GetValueArgs {
//!     node: NodeRef::global("AuthManager"),
//!     field: Some("isLoggedIn".into()),
//! });
//! let reply = dispatcher.send(op, SendOptions::default()).await?;
//! println!("{:?}", reply.envelope.fields);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, debug_span, trace, Instrument};

use crate::config::{DeviceProfile, TetherConfig};
use crate::correlator::{CallbackCorrelator, CorrelatorError, DeviceReply};
use crate::diagnostics::{DeviceLogProbe, DiagnosticsSource};
use crate::envelope::{
    CallbackAddress, LogLevel, Operation, OperationType, RequestEnvelope, Settings,
};
use crate::fire_channel::{ChannelEvent, FireChannel};
use crate::wire::{encode_frame, FrameLimits};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Interval between submission attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(300);

/// Extra host-side wait for observe operations, so the device's own give-up
/// error arrives before the host times out.
pub const OBSERVE_MARGIN: Duration = Duration::from_millis(200);

/// Timeout used when neither the call nor the device profile sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the diagnostics probe after a timeout.
pub const DIAGNOSTICS_BUDGET: Duration = Duration::from_secs(1);

/// Floor for the retry interval. tokio rejects a zero period.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

fn diagnostics_suffix(diagnostics: &Option<String>) -> String {
    match diagnostics {
        Some(logs) => format!("\nrecent device logs:\n{logs}"),
        None => String::new(),
    }
}

fn ack_state(acked: &bool) -> &'static str {
    if *acked {
        "acknowledged, no response"
    } else {
        "never acknowledged"
    }
}

/// Why a call did not produce a successful reply.
#[derive(Error, Debug)]
pub enum RequestFailure {
    /// No response arrived before the deadline.
    #[error(
        "{op} request {id} timed out after {}ms ({}){}\n  called at {location}",
        .timeout.as_millis(),
        ack_state(.acked),
        diagnostics_suffix(.diagnostics)
    )]
    Timeout {
        id: String,
        op: OperationType,
        timeout: Duration,
        acked: bool,
        diagnostics: Option<String>,
        location: &'static Location<'static>,
    },

    /// The device reported failure.
    #[error("{op} request {id} failed: {message}\n  called at {location}")]
    Rejected {
        id: String,
        op: OperationType,
        message: String,
        location: &'static Location<'static>,
    },

    /// The submission connection failed after acknowledgment.
    #[error("{op} request {id} lost its connection: {reason}\n  called at {location}")]
    Transport {
        id: String,
        op: OperationType,
        reason: String,
        location: &'static Location<'static>,
    },

    /// The request could not be serialized.
    #[error("failed to encode {op} request: {message}")]
    Encode { op: OperationType, message: String },

    #[error(transparent)]
    DuplicateId(#[from] CorrelatorError),
}

impl RequestFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RequestFailure::Timeout { .. })
    }

    /// The device-supplied message of a rejection.
    pub fn device_message(&self) -> Option<&str> {
        match self {
            RequestFailure::Rejected { message, .. } => Some(message),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-device dispatch settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Device listener `host:port`.
    pub address: String,
    pub global_default_timeout: Duration,
    pub device_default_timeout: Option<Duration>,
    pub timeout_multiplier: f64,
    pub retry_interval: Duration,
    /// Settings sent with every request unless overridden per call.
    pub settings: Settings,
    pub limits: FrameLimits,
}

impl DispatcherConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            global_default_timeout: DEFAULT_TIMEOUT,
            device_default_timeout: None,
            timeout_multiplier: 1.0,
            retry_interval: RETRY_INTERVAL,
            settings: Settings::default(),
            limits: FrameLimits::default(),
        }
    }

    /// Build from a stored device profile and the global defaults.
    pub fn from_profile(profile: &DeviceProfile, config: &TetherConfig) -> Self {
        Self {
            address: profile.address(),
            global_default_timeout: config.default_timeout(),
            device_default_timeout: profile.default_timeout(),
            timeout_multiplier: profile.timeout_multiplier,
            retry_interval: config.retry_interval(),
            settings: Settings {
                log_level: profile.log_level,
            },
            limits: FrameLimits::default(),
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Overrides the device and global default timeouts.
    pub timeout: Option<Duration>,
    /// Sent as the request frame's binary payload.
    pub binary: Vec<u8>,
    /// Overrides the configured log level for this request.
    pub log_level: Option<LogLevel>,
}

impl SendOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_binary(mut self, binary: Vec<u8>) -> Self {
        self.binary = binary;
        self
    }
}

// ---------------------------------------------------------------------------
// RequestDispatcher
// ---------------------------------------------------------------------------

/// Removes the pending entry on every exit path, including cancellation of
/// the caller's future.
struct PendingGuard<'a> {
    correlator: &'a CallbackCorrelator,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.correlator.cancel(self.id) {
            trace!(id = self.id, "pending operation released");
        }
    }
}

/// Sends typed operations to one device.
pub struct RequestDispatcher {
    config: DispatcherConfig,
    correlator: CallbackCorrelator,
    diagnostics: Option<Arc<dyn DiagnosticsSource>>,
}

impl RequestDispatcher {
    /// Create a dispatcher that probes the device's recent logs on timeout.
    pub fn new(config: DispatcherConfig) -> Self {
        let probe = DeviceLogProbe::new(config.address.clone());
        Self {
            config,
            correlator: CallbackCorrelator::new(),
            diagnostics: Some(Arc::new(probe)),
        }
    }

    pub fn with_diagnostics(mut self, source: Arc<dyn DiagnosticsSource>) -> Self {
        self.diagnostics = Some(source);
        self
    }

    pub fn without_diagnostics(mut self) -> Self {
        self.diagnostics = None;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn correlator(&self) -> &CallbackCorrelator {
        &self.correlator
    }

    /// `options.timeout ?? device default ?? global default`, scaled by the
    /// device multiplier.
    pub fn effective_timeout(&self, options: &SendOptions) -> Duration {
        let base = options
            .timeout
            .or(self.config.device_default_timeout)
            .unwrap_or(self.config.global_default_timeout);
        let multiplier = self.config.timeout_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return base;
        }
        Duration::try_from_secs_f64(base.as_secs_f64() * multiplier).unwrap_or(base)
    }

    /// Send `operation` and wait for its response.
    ///
    /// The call site is captured here, so failure messages point at the
    /// caller rather than into the runtime.
    #[track_caller]
    pub fn send(
        &self,
        operation: Operation,
        options: SendOptions,
    ) -> impl Future<Output = Result<DeviceReply, RequestFailure>> + '_ {
        let location = Location::caller();
        async move { self.dispatch(operation, options, location).await }
    }

    async fn dispatch(
        &self,
        mut operation: Operation,
        options: SendOptions,
        location: &'static Location<'static>,
    ) -> Result<DeviceReply, RequestFailure> {
        let op = operation.kind();
        let mut wait = self.effective_timeout(&options);
        if let Operation::OnFieldChangeOnce(args) = &mut operation {
            let budget = *args
                .retry_timeout
                .get_or_insert(wait.as_millis().min(u64::MAX as u128) as u64);
            wait = Duration::from_millis(budget) + OBSERVE_MARGIN;
        }

        let envelope = RequestEnvelope::new(
            &operation,
            Settings {
                log_level: options.log_level.unwrap_or(self.config.settings.log_level),
            },
            CallbackAddress::default(),
        )
        .map_err(|e| RequestFailure::Encode {
            op,
            message: e.to_string(),
        })?;
        let id = envelope.id.clone();

        let span = debug_span!("dispatch", id = %id, op = op.as_str());
        async {
            let reply = self.correlator.register(&id)?;
            let _guard = PendingGuard {
                correlator: &self.correlator,
                id: &id,
            };
            self.drive(envelope, options.binary, reply, wait, location)
                .await
        }
        .instrument(span)
        .await
    }

    /// Run the retry/ack/deadline loop for one registered request.
    async fn drive(
        &self,
        mut envelope: RequestEnvelope,
        binary: Vec<u8>,
        mut reply: tokio::sync::oneshot::Receiver<DeviceReply>,
        wait: Duration,
        location: &'static Location<'static>,
    ) -> Result<DeviceReply, RequestFailure> {
        let id = envelope.id.clone();
        let op = envelope.kind;
        let deadline = Instant::now() + wait;
        let deadline_sleep = sleep_until(deadline);
        tokio::pin!(deadline_sleep);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut channel: Option<FireChannel> = None;
        let mut frame: Option<Vec<u8>> = None;
        let mut generation = 0u64;
        let mut acked = false;
        let mut attempts = 0u32;

        let retry = self.config.retry_interval.max(MIN_RETRY_INTERVAL);
        let mut ticker = tokio::time::interval(retry);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(timeout_ms = wait.as_millis() as u64, "sending");
        loop {
            tokio::select! {
                biased;

                result = &mut reply => {
                    return match result {
                        Ok(reply) if reply.envelope.success => {
                            debug!(attempts, time_taken = reply.envelope.time_taken, "completed");
                            Ok(reply)
                        }
                        Ok(reply) => {
                            let message = reply
                                .envelope
                                .error_message()
                                .unwrap_or("device reported failure without a message")
                                .to_string();
                            debug!(%message, "rejected");
                            Err(RequestFailure::Rejected { id, op, message, location })
                        }
                        Err(_) => Err(RequestFailure::Transport {
                            id,
                            op,
                            reason: "pending operation was dropped".into(),
                            location,
                        }),
                    };
                }

                _ = &mut deadline_sleep => {
                    drop(channel.take());
                    debug!(attempts, acked, "timed out");
                    let diagnostics = self.collect_diagnostics(deadline + retry).await;
                    return Err(RequestFailure::Timeout {
                        id,
                        op,
                        timeout: wait,
                        acked,
                        diagnostics,
                        location,
                    });
                }

                Some(event) = events_rx.recv() => match event {
                    ChannelEvent::Acked { id: acked_id, .. } if acked_id == id => {
                        if !acked {
                            debug!(attempts, "acknowledged");
                        }
                        acked = true;
                    }
                    ChannelEvent::Acked { id: other, .. } => trace!(other = %other, "foreign ack"),
                    ChannelEvent::Closed { generation: closed, reason } if closed == generation => {
                        channel = None;
                        if acked {
                            return Err(RequestFailure::Transport { id, op, reason, location });
                        }
                        debug!(%reason, "fire channel closed before ack; will reopen");
                    }
                    ChannelEvent::Closed { .. } => {}
                },

                _ = ticker.tick(), if !acked => {
                    attempts += 1;
                    if channel.is_none() {
                        generation += 1;
                        // A stalled connect must not hold the loop past the deadline.
                        let connect_by = deadline.min(Instant::now() + retry);
                        let connect = timeout_at(
                            connect_by,
                            FireChannel::open(
                                &self.config.address,
                                generation,
                                retry,
                                self.config.limits,
                                self.correlator.clone(),
                                events_tx.clone(),
                            ),
                        )
                        .await;
                        match connect {
                            Ok(Ok(opened)) => channel = Some(opened),
                            Ok(Err(e)) => {
                                trace!(attempt = attempts, error = %e, "device unreachable");
                                continue;
                            }
                            Err(_) => {
                                trace!(attempt = attempts, "connect timed out");
                                continue;
                            }
                        }
                    }

                    let Some(open) = channel.as_mut() else { continue };
                    if frame.is_none() {
                        envelope.callback_address =
                            CallbackAddress::Address(open.local_addr().to_string());
                        let encoded = serde_json::to_string(&envelope)
                            .map_err(|e| e.to_string())
                            .and_then(|text| encode_frame(&text, &binary).map_err(|e| e.to_string()));
                        match encoded {
                            Ok(bytes) => frame = Some(bytes),
                            Err(message) => return Err(RequestFailure::Encode { op, message }),
                        }
                    }
                    let Some(bytes) = frame.as_deref() else { continue };

                    trace!(attempt = attempts, generation = open.generation(), "submitting");
                    match timeout_at(deadline, open.send(bytes)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            trace!(error = %e, "submission failed; will reopen");
                            channel = None;
                        }
                        Err(_) => {}
                    }
                }
            }
        }
    }

    /// Ask for device logs, finishing no later than `give_up_at`.
    async fn collect_diagnostics(&self, give_up_at: Instant) -> Option<String> {
        let source = self.diagnostics.as_ref()?;
        let budget = DIAGNOSTICS_BUDGET
            .min(self.config.retry_interval)
            .min(give_up_at.saturating_duration_since(Instant::now()));
        if budget.is_zero() {
            trace!("no time left for diagnostics");
            return None;
        }
        source.recent_logs(budget).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{NodeRef, ObserveFieldArgs};

    /// An address nothing listens on.
    fn closed_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn dispatcher(multiplier: f64, device: Option<u64>) -> RequestDispatcher {
        let mut config = DispatcherConfig::new(closed_address());
        config.timeout_multiplier = multiplier;
        config.device_default_timeout = device.map(Duration::from_millis);
        RequestDispatcher::new(config).without_diagnostics()
    }

    #[test]
    fn timeout_precedence_and_scaling() {
        let d = dispatcher(1.0, None);
        assert_eq!(d.effective_timeout(&SendOptions::default()), DEFAULT_TIMEOUT);

        let d = dispatcher(1.0, Some(4000));
        assert_eq!(
            d.effective_timeout(&SendOptions::default()),
            Duration::from_millis(4000)
        );
        let options = SendOptions::default().with_timeout(Duration::from_millis(500));
        assert_eq!(d.effective_timeout(&options), Duration::from_millis(500));

        let d = dispatcher(2.5, Some(4000));
        assert_eq!(
            d.effective_timeout(&SendOptions::default()),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn invalid_multiplier_is_ignored() {
        let d = dispatcher(f64::NAN, Some(1000));
        assert_eq!(
            d.effective_timeout(&SendOptions::default()),
            Duration::from_millis(1000)
        );
        let d = dispatcher(-1.0, Some(1000));
        assert_eq!(
            d.effective_timeout(&SendOptions::default()),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn from_profile_carries_device_settings() {
        let mut profile = DeviceProfile::new("10.1.1.1");
        profile.port = 9100;
        profile.timeout_multiplier = 3.0;
        profile.log_level = LogLevel::Debug;
        let config = DispatcherConfig::from_profile(&profile, &TetherConfig::default());
        assert_eq!(config.address, "10.1.1.1:9100");
        assert_eq!(config.timeout_multiplier, 3.0);
        assert_eq!(config.settings.log_level, LogLevel::Debug);
        assert_eq!(config.retry_interval, RETRY_INTERVAL);
    }

    #[test]
    fn failure_messages() {
        let location = Location::caller();
        let timeout = RequestFailure::Timeout {
            id: "abc".into(),
            op: OperationType::GetValue,
            timeout: Duration::from_millis(1500),
            acked: false,
            diagnostics: Some("line one".into()),
            location,
        };
        let text = timeout.to_string();
        assert!(text.contains("timed out after 1500ms"));
        assert!(text.contains("line one"));
        assert!(text.contains(file!()));
        assert!(timeout.is_timeout());

        let rejected = RequestFailure::Rejected {
            id: "abc".into(),
            op: OperationType::CallFunc,
            message: "boom".into(),
            location,
        };
        assert!(rejected.to_string().contains("boom"));
        assert_eq!(rejected.device_message(), Some("boom"));
    }

    #[tokio::test]
    async fn unreachable_device_times_out_with_call_site() {
        let d = dispatcher(1.0, None);
        let options = SendOptions::default().with_timeout(Duration::from_millis(400));
        let started = std::time::Instant::now();
        let err = d.send(Operation::Handshake, options).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout(), "{err}");
        assert!(err.to_string().contains("timed out"));
        assert!(err.to_string().contains(file!()));
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(400) + RETRY_INTERVAL + Duration::from_millis(300));
        assert_eq!(d.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn zero_retry_interval_is_clamped() {
        let mut config = DispatcherConfig::new(closed_address());
        config.retry_interval = Duration::ZERO;
        let d = RequestDispatcher::new(config).without_diagnostics();
        let options = SendOptions::default().with_timeout(Duration::from_millis(150));
        let err = d.send(Operation::Handshake, options).await.unwrap_err();
        assert!(err.is_timeout(), "{err}");
    }

    #[tokio::test]
    async fn observe_timeout_includes_margin() {
        let d = dispatcher(2.0, None);
        let op = Operation::OnFieldChangeOnce(ObserveFieldArgs {
            node: NodeRef::global("player"),
            field: "state".into(),
            match_value: None,
            retry_timeout: None,
        });
        let options = SendOptions::default().with_timeout(Duration::from_millis(100));
        let err = d.send(op, options).await.unwrap_err();
        match err {
            RequestFailure::Timeout { timeout, .. } => {
                assert_eq!(timeout, Duration::from_millis(200) + OBSERVE_MARGIN);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }
}
