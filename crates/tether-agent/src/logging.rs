//! Agent log pipeline.
//!
//! One registry, one reloadable filter, up to three sinks: the log file, the
//! in-memory [`RecentLogs`] ring served by `getRecentLogs`, and optionally
//! stderr. `setSettings` swaps the filter through [`FilterControl`].

use std::io;
use std::path::Path;

use tether_core::envelope::LogLevel;
use tether_core::recent_logs::RecentLogs;
use tether_core::router::LogLevelControl;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const LOG_FILENAME: &str = "tether-agent.log";

/// The level `filter` enables, judged by its most verbose directive.
fn level_of(filter: &EnvFilter) -> Option<LogLevel> {
    let hint = filter.max_level_hint()?;
    let level = if hint == LevelFilter::OFF {
        LogLevel::Off
    } else if hint == LevelFilter::ERROR {
        LogLevel::Error
    } else if hint == LevelFilter::WARN {
        LogLevel::Warn
    } else if hint == LevelFilter::INFO {
        LogLevel::Info
    } else if hint == LevelFilter::DEBUG {
        LogLevel::Debug
    } else {
        LogLevel::Verbose
    };
    Some(level)
}

/// Reloads the global filter when a request changes the log level.
pub struct FilterControl {
    handle: reload::Handle<EnvFilter, Registry>,
    level: LogLevel,
}

impl LogLevelControl for FilterControl {
    fn set_level(&mut self, level: LogLevel) -> Result<(), String> {
        self.handle
            .reload(EnvFilter::new(level.as_directive()))
            .map_err(|e| e.to_string())?;
        self.level = level;
        Ok(())
    }

    fn level(&self) -> LogLevel {
        self.level
    }
}

/// [`MakeWriter`] that appends each formatted event to a [`RecentLogs`].
#[derive(Clone)]
pub struct RecentLogsWriter {
    logs: RecentLogs,
}

impl RecentLogsWriter {
    pub fn new(logs: RecentLogs) -> Self {
        Self { logs }
    }
}

impl<'a> MakeWriter<'a> for RecentLogsWriter {
    type Writer = EventBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        EventBuffer {
            logs: self.logs.clone(),
            buf: Vec::new(),
        }
    }
}

/// Collects one event's bytes and hands them to the ring on drop.
pub struct EventBuffer {
    logs: RecentLogs,
    buf: Vec<u8>,
}

impl io::Write for EventBuffer {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for EventBuffer {
    fn drop(&mut self) {
        if !self.buf.is_empty() {
            self.logs.push_text(&String::from_utf8_lossy(&self.buf));
        }
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level` at startup. The returned guard must outlive
/// the process's logging.
pub fn init(
    log_dir: &Path,
    level: LogLevel,
    recent: RecentLogs,
    stderr: bool,
) -> io::Result<(FilterControl, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILENAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let (filter, level) = match EnvFilter::try_from_default_env() {
        Ok(filter) => {
            let effective = level_of(&filter).unwrap_or(level);
            (filter, effective)
        }
        Err(_) => (EnvFilter::new(level.as_directive()), level),
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .with(
            fmt::layer()
                .with_writer(RecentLogsWriter::new(recent))
                .with_ansi(false)
                .with_target(false),
        )
        .with(stderr.then(|| fmt::layer().with_writer(io::stderr)))
        .try_init()
        .map_err(io::Error::other)?;

    Ok((FilterControl { handle, level }, guard))
}
