//! On-device request server for tether.
//!
//! Binds the device listener, installs logging, and serves requests until
//! SIGINT or SIGTERM. Registry operations run inline on the loop;
//! scene-graph operations run against a JSON node tree on spawned tasks.
//!
//! # Usage
//!
//! ```bash
//! # Listen on all interfaces, port 9000
//! tether-agent
//!
//! # Seed the node tree and mirror logs to the console
//! tether-agent --scene scene.json --log-stderr --log-level debug
//! ```

mod logging;
mod scene;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use serde_json::Value;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use scene::Scene;
use tether_core::config::tether_dir;
use tether_core::connection::{ConnectionManager, ServerConfig, DEFAULT_PORT};
use tether_core::context::SpawnedContext;
use tether_core::envelope::LogLevel;
use tether_core::handler::MemoryRegistry;
use tether_core::recent_logs::{RecentLogs, DEFAULT_CAPACITY};
use tether_core::router::RequestRouter;

#[derive(Parser)]
#[command(name = "tether-agent")]
#[command(about = "Serve tether requests on this device")]
#[command(version)]
struct Args {
    /// Interface to listen on
    #[arg(long, default_value = "0.0.0.0", env = "TETHER_HOST")]
    host: IpAddr,

    /// Listener port
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "TETHER_PORT")]
    port: u16,

    /// Directory for tether-agent.log (default: ~/.tether/logs)
    #[arg(long, env = "TETHER_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Initial log level: off, error, warn, info, debug or verbose
    #[arg(long, default_value = "info")]
    log_level: LogLevel,

    /// Also write logs to stderr
    #[arg(long)]
    log_stderr: bool,

    /// Lines kept for getRecentLogs
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    recent_lines: usize,

    /// JSON file seeding the node tree
    #[arg(long)]
    scene: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let recent = RecentLogs::new(args.recent_lines);
    let log_dir = args.log_dir.unwrap_or_else(|| tether_dir().join("logs"));
    let (filter, _log_guard) =
        logging::init(&log_dir, args.log_level, recent.clone(), args.log_stderr)?;

    let root = match &args.scene {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Value::Object(Default::default()),
    };

    let addr = SocketAddr::new(args.host, args.port);
    let manager = ConnectionManager::bind(ServerConfig::new(addr)).await?;
    info!(
        addr = %manager.local_addr(),
        log_dir = %log_dir.display(),
        recent_lines = recent.capacity(),
        "Listening"
    );

    let context = SpawnedContext::new(Scene::new(root), manager.completion_sender());
    let router = RequestRouter::new(MemoryRegistry::new(), context)
        .with_log_level_control(filter)
        .with_recent_logs(recent)
        .with_agent_version(env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate())?;
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
            shutdown.cancel();
        });
    }

    manager.run(router, shutdown).await?;
    info!("Agent stopped");
    Ok(())
}
