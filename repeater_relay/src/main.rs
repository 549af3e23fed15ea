// CLI entry point for the client repeater.
//
// Starts a standalone repeater that clients connect to over TCP (and UDP).
// Every message a client sends is relayed to all other clients; joins and
// leaves are announced on the session channel. See `repeater.rs` for how the
// pieces fit together.
//
// Usage:
//   client_repeater [-q] [-l LEVEL] [-v]... [-m PKTSIZE] [-s CHANNEL]
//                   [-T SECONDS] [-c FILE] [PORT]
//
// Settings are layered: defaults, then the JSON config file (`-c`), then the
// flags. Bad flags or a non-positive port print usage to stdout and exit
// without opening any socket.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, CommandFactory, Parser};
use repeater_relay::{ConfigError, Repeater, RepeaterConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "client_repeater",
    about = "Relays every client's messages to all other connected clients"
)]
struct Cli {
    /// Be very quiet: no logging at all
    #[arg(short = 'q', overrides_with = "level")]
    quiet: bool,

    /// Log at the given level (off, error, warn, info, debug, trace). When
    /// combined with -q, whichever comes last wins
    #[arg(short = 'l', value_name = "LEVEL", overrides_with = "quiet")]
    level: Option<String>,

    /// Increase verbosity (default 1): 0 warnings/errors only, 1 clients
    /// joining and leaving, 2 transport details, 3 every message
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Maximum packet size in bytes (0 keeps each transport's default)
    #[arg(short = 'm', value_name = "PKTSIZE")]
    max_packet_size: Option<u32>,

    /// Channel for session announcements (negative disables them)
    #[arg(short = 's', value_name = "CHANNEL", allow_negative_numbers = true)]
    session_channel: Option<i32>,

    /// Drop connexions inactive for this many seconds (0 or less disables)
    #[arg(short = 'T', value_name = "SECONDS", allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// JSON configuration file, applied before the other flags
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on [default: 9999]
    #[arg(value_name = "PORT", allow_negative_numbers = true)]
    port: Option<i64>,
}

/// Why the command line could not be turned into a configuration.
#[derive(Debug)]
enum CliError {
    Usage(String),
    Config(ConfigError),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Config(err)
    }
}

fn build_config(cli: &Cli) -> Result<RepeaterConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => RepeaterConfig::from_json_file(path)?,
        None => RepeaterConfig::default(),
    };

    if let Some(port) = cli.port {
        if port <= 0 {
            return Err(ConfigError::InvalidPort.into());
        }
        config.port = u16::try_from(port)
            .map_err(|_| CliError::Usage(format!("error: port {port} is out of range")))?;
    }
    config.verbosity = config.verbosity.saturating_add(cli.verbose);
    if let Some(size) = cli.max_packet_size {
        config.max_packet_size = size;
    }
    if let Some(channel) = cli.session_channel {
        config.session_channel = if channel < 0 {
            None
        } else {
            Some(u8::try_from(channel).map_err(|_| {
                CliError::Usage(format!("error: session channel {channel} is out of range"))
            })?)
        };
    }
    if let Some(seconds) = cli.timeout {
        config.inactive_timeout_secs = u64::try_from(seconds).unwrap_or(0);
        // A configured ping interval may no longer fit under the new timeout.
        if config.validate().is_err() {
            config.ping_interval_ms = None;
        }
    }
    config.validate()?;
    Ok(config)
}

/// Map a level name to a filter directive. `all` and `fatal` are accepted
/// alongside tracing's own names.
fn level_directive(level: &str) -> String {
    match level.to_ascii_lowercase().as_str() {
        "all" => "trace".into(),
        "fatal" => "error".into(),
        other => other.into(),
    }
}

fn init_logging(cli: &Cli) -> Result<(), String> {
    if cli.quiet {
        return Ok(());
    }
    let filter = match &cli.level {
        Some(level) => EnvFilter::try_new(level_directive(level))
            .map_err(|e| format!("error: invalid log level {level:?}: {e}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn usage() {
    println!("{}", Cli::command().render_help());
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if !err.use_stderr() => {
            // --help
            println!("{}", err.render());
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            println!("{}", err.render());
            usage();
            return ExitCode::from(2);
        }
    };

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(CliError::Config(ConfigError::InvalidPort)) => {
            println!("error: port must be greater than 0");
            usage();
            return ExitCode::from(2);
        }
        Err(CliError::Usage(message)) => {
            println!("{message}");
            usage();
            return ExitCode::from(2);
        }
        Err(CliError::Config(err)) => {
            println!("error: {err}");
            return ExitCode::from(2);
        }
    };

    if let Err(message) = init_logging(&cli) {
        println!("{message}");
        usage();
        return ExitCode::from(2);
    }

    if config.verbosity > 0 {
        info!("Starting server on port {}", config.port);
    }
    let verbosity = config.verbosity;
    let mut repeater = Repeater::new(config);
    match repeater.run() {
        Ok(()) => {
            if verbosity > 0 {
                info!("Server stopped");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
