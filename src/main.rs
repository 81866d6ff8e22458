use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use hostlink::{supervise, CallbackServer, CancelSignal, HostlinkConfig, Managed};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hostlink")]
#[command(about = "Token-authenticated callback server for host-spawned commands")]
#[command(version)]
#[command(long_about = "Runs a local callback server that commands spawned by the host can \
connect back to. Each command receives a short-lived token bound to its command id. \
Runs until interrupted, then shuts down gracefully.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "hostlink.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the server")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Log output format
    #[arg(long, value_enum, value_name = "FORMAT", default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Issue a token once running and print the connection info as JSON
    #[arg(long, value_name = "COMMAND_ID", num_args = 0..=1, default_missing_value = "")]
    issue_token: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    /// One JSON object per event, with thread ids and source locations
    Json,
    /// Single-line events without targets
    Compact,
    /// Multi-line human output; `--debug` adds thread ids and locations
    Pretty,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting hostlink v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match HostlinkConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let server = CallbackServer::builder()
        .config(config)
        .build()
        .context("invalid configuration")?;

    let stop = CancelSignal::new();
    server.start(&stop).await.map_err(|e| {
        error!("Failed to start server: {}", e);
        e
    })?;

    if let Some(command_id) = args.issue_token.as_deref() {
        let command_id = if command_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            command_id.to_string()
        };
        let info = server.connection_info(&command_id)?;
        println!("{}", serde_json::to_string_pretty(&info)?);
    }

    let interrupt = stop.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        interrupt.cancel();
    });

    let outcome = supervise(&server, stop).await;
    info!(state = %server.state(), "hostlink exited");
    outcome.context("server stopped with an error")
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hostlink={}", log_level)));

    let fmt_layer = match args.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .context("failed to install log subscriber")
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# hostlink configuration file");
    println!("# Every key is optional; HOSTLINK__<SECTION>__<KEY> environment variables override it");
    println!();
    let rendered = toml::to_string_pretty(&HostlinkConfig::default())
        .context("failed to render default configuration")?;
    println!("{}", rendered);
    Ok(())
}
