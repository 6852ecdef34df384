//! CLI for sending tether requests to a device.
//!
//! Every command goes through the same dispatcher the test harnesses use:
//! retry until acknowledged, wait for the response, fail with the device's
//! recent logs on timeout.
//!
//! # Usage
//!
//! ```bash
//! # Check the agent is up
//! tether -a 192.168.1.40:9000 handshake
//!
//! # Use a device profile from ~/.tether/config.json
//! tether -d living-room send getValue --args '{"keyPath": "player", "field": "state"}'
//!
//! # Upload a file (binary payload) and fetch it back
//! tether -d living-room send writeFile --args '{"path": "tmp:/a.bin"}' --binary-file a.bin
//! tether -d living-room send readFile --args '{"path": "tmp:/a.bin"}' -o copy.bin
//!
//! # Tail the agent's recent logs
//! tether -d living-room logs -n 20
//! ```

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use base64::Engine;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::{json, Map, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use tether_core::config::TetherConfig;
use tether_core::correlator::DeviceReply;
use tether_core::dispatcher::{DispatcherConfig, RequestDispatcher, RequestFailure, SendOptions};
use tether_core::envelope::{LogLevel, Operation, OperationType, RecentLogsArgs, Settings};

/// CLI for sending tether requests to a device.
#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Send requests to a tether agent running on a device")]
#[command(version)]
struct Cli {
    /// Device profile name from the config file
    #[arg(short, long, env = "TETHER_DEVICE")]
    device: Option<String>,

    /// Device address (host:port), overrides --device
    #[arg(short, long, env = "TETHER_ADDRESS")]
    address: Option<String>,

    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Request timeout in milliseconds
    #[arg(short, long, env = "TETHER_TIMEOUT")]
    timeout: Option<u64>,

    /// Config file (default: ~/.tether/config.json)
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Send any operation
    Send {
        /// Operation type, e.g. getValue
        kind: OperationType,
        /// Operation arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
        /// File sent as the request's binary payload
        #[arg(long)]
        binary_file: Option<PathBuf>,
        /// Write the response's binary payload here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check the agent is reachable and report its versions
    Handshake,

    /// Print the agent's recent log lines
    Logs {
        /// Number of newest lines
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },

    /// Change the agent's log level
    SetLogLevel {
        /// off, error, warn, info, debug or verbose
        level: LogLevel,
    },

    /// List device profiles from the config file
    Devices,

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    /// The device could not be reached or did not answer in time.
    Connection(String),
    /// The device answered with `success: false`.
    Rejected(String),
    /// Bad arguments, configuration or encoding.
    Usage(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Rejected(_) => ExitCode::from(1),
            CliError::Connection(_) => ExitCode::from(2),
            CliError::Usage(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::Rejected(msg) => write!(f, "Request failed: {}", msg),
            CliError::Usage(msg) => write!(f, "{}", msg),
        }
    }
}

impl From<RequestFailure> for CliError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::Rejected { .. } => CliError::Rejected(failure.to_string()),
            RequestFailure::Timeout { .. } | RequestFailure::Transport { .. } => {
                CliError::Connection(failure.to_string())
            }
            RequestFailure::Encode { .. } | RequestFailure::DuplicateId(_) => {
                CliError::Usage(failure.to_string())
            }
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TetherConfig, CliError> {
    match path {
        Some(path) => TetherConfig::load_from(path).map_err(|e| CliError::Usage(e.to_string())),
        None => Ok(TetherConfig::load()),
    }
}

fn dispatcher(cli: &Cli, config: &TetherConfig) -> Result<RequestDispatcher, CliError> {
    let dispatch = match (&cli.address, &cli.device) {
        (Some(address), _) => DispatcherConfig {
            global_default_timeout: config.default_timeout(),
            retry_interval: config.retry_interval(),
            ..DispatcherConfig::new(address.clone())
        },
        (None, Some(name)) => {
            let profile = config.devices.get(name).ok_or_else(|| {
                CliError::Usage(format!(
                    "unknown device '{}' (see `tether devices`)",
                    name
                ))
            })?;
            DispatcherConfig::from_profile(profile, config)
        }
        (None, None) => {
            return Err(CliError::Usage(
                "no device selected: pass --device or --address".into(),
            ))
        }
    };
    let dispatcher = RequestDispatcher::new(dispatch);
    debug!(address = %dispatcher.config().address, "dispatching");
    Ok(dispatcher)
}

fn send_options(cli: &Cli) -> SendOptions {
    SendOptions {
        timeout: cli.timeout.map(Duration::from_millis),
        ..SendOptions::default()
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    // Commands that don't talk to a device
    match &cli.command {
        Command::Completions { shell } => {
            clap_complete::generate(*shell, &mut Cli::command(), "tether", &mut io::stdout());
            return Ok(());
        }
        Command::Devices => {
            let config = load_config(cli.config.as_ref())?;
            print_devices(&config, cli.format);
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(cli.config.as_ref())?;
    let dispatcher = dispatcher(&cli, &config)?;
    let options = send_options(&cli);

    match &cli.command {
        Command::Send {
            kind,
            args,
            binary_file,
            output,
        } => {
            let args = args
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()
                .map_err(|e| CliError::Usage(format!("--args is not valid JSON: {}", e)))?;
            let operation =
                Operation::parse(*kind, args).map_err(|e| CliError::Usage(e.to_string()))?;
            let mut options = options;
            if let Some(path) = binary_file {
                let bytes = std::fs::read(path).map_err(|e| {
                    CliError::Usage(format!("failed to read {}: {}", path.display(), e))
                })?;
                options = options.with_binary(bytes);
            }

            let reply = dispatcher.send(operation, options).await?;
            if let Some(path) = output {
                std::fs::write(path, &reply.binary).map_err(|e| {
                    CliError::Usage(format!("failed to write {}: {}", path.display(), e))
                })?;
                eprintln!("wrote {} bytes to {}", reply.binary.len(), path.display());
                print_reply(&reply, cli.format, false);
            } else {
                print_reply(&reply, cli.format, true);
            }
        }
        Command::Handshake => {
            let reply = dispatcher.send(Operation::Handshake, options).await?;
            match cli.format {
                OutputFormat::Json => print_reply(&reply, cli.format, false),
                OutputFormat::Text => {
                    let fields = &reply.envelope.fields;
                    println!(
                        "protocol {}, agent {}, started {}",
                        text_of(fields.get("protocolVersion")),
                        text_of(fields.get("agentVersion")),
                        text_of(fields.get("startedAt")),
                    );
                }
            }
        }
        Command::Logs { lines } => {
            let op = Operation::GetRecentLogs(RecentLogsArgs { max_lines: *lines });
            let reply = dispatcher.send(op, options).await?;
            match cli.format {
                OutputFormat::Json => print_reply(&reply, cli.format, false),
                OutputFormat::Text => {
                    let lines = reply.envelope.fields.get("lines").and_then(Value::as_array);
                    for line in lines.into_iter().flatten() {
                        println!("{}", text_of(Some(line)));
                    }
                }
            }
        }
        Command::SetLogLevel { level } => {
            let op = Operation::SetSettings(Settings { log_level: *level });
            let reply = dispatcher.send(op, options).await?;
            match cli.format {
                OutputFormat::Json => print_reply(&reply, cli.format, false),
                OutputFormat::Text => println!(
                    "log level: {}",
                    text_of(reply.envelope.fields.get("logLevel"))
                ),
            }
        }
        Command::Devices | Command::Completions { .. } => {}
    }
    Ok(())
}

/// Strings print bare, everything else as JSON.
fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "-".into(),
    }
}

fn print_reply(reply: &DeviceReply, format: OutputFormat, include_binary: bool) {
    let binary = (include_binary && !reply.binary.is_empty())
        .then(|| base64::engine::general_purpose::STANDARD.encode(&reply.binary));

    match format {
        OutputFormat::Json => {
            let mut body = serde_json::to_value(&reply.envelope).unwrap_or(Value::Null);
            if let (Some(body), Some(binary)) = (body.as_object_mut(), binary) {
                body.insert("binary".into(), Value::String(binary));
            }
            println!("{}", body);
        }
        OutputFormat::Text => {
            for (key, value) in &reply.envelope.fields {
                println!("{}: {}", key, text_of(Some(value)));
            }
            if let Some(ms) = reply.envelope.time_taken {
                println!("timeTaken: {}ms", ms);
            }
            if let Some(binary) = binary {
                println!("binary ({} bytes, base64): {}", reply.binary.len(), binary);
            }
        }
    }
}

fn print_devices(config: &TetherConfig, format: OutputFormat) {
    if format == OutputFormat::Json {
        let devices: Map<String, Value> = config
            .devices
            .iter()
            .map(|(name, profile)| {
                let entry = json!({
                    "address": profile.address(),
                    "timeoutMultiplier": profile.timeout_multiplier,
                    "logLevel": profile.log_level,
                });
                (name.clone(), entry)
            })
            .collect();
        println!("{}", json!({ "devices": devices }));
    } else if config.devices.is_empty() {
        eprintln!("No devices configured");
    } else {
        for (name, profile) in &config.devices {
            println!(
                "{}\t{}\tx{}",
                name,
                profile.address(),
                profile.timeout_multiplier
            );
        }
    }
}
