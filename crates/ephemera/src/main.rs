use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info};
use tokio::net::TcpListener;

use ephemera::api::{self, AppState};
use ephemera::config::{self, ServerConfig};
use ephemera::ws::hub::Hub;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = config::load(cli.common.config.as_deref())?;
    debug!("resolved configuration: {config:#?}");

    match cli.command {
        Command::Serve(cmd) => async_serve(config, cmd),
        Command::Config { command } => handle_config(&config, command),
    }
}

#[tokio::main]
async fn async_serve(config: ServerConfig, cmd: ServeCommand) -> Result<()> {
    serve(config, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Ephemera - real-time presence and typing relay.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -v)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the relay server
    Serve(ServeCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Override the listen port
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the default config file path
    Path,
}

async fn serve(mut config: ServerConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(port) = cmd.port {
        config.port = port;
    }

    let hub = Hub::new();
    let state = AppState::new(hub, config.allowed_origins.clone());
    let router = api::create_router(state);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        "listening on {addr} ({} allowed origin(s))",
        config.allowed_origins.len()
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}

fn handle_config(config: &ServerConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = toml::to_string_pretty(config).context("rendering configuration")?;
            print!("{rendered}");
        }
        ConfigCommand::Path => match config::default_config_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("(no user config directory)"),
        },
    }
    Ok(())
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    if common.quiet {
        log::set_max_level(LevelFilter::Off);
        return;
    }

    let level = effective_log_level(common);
    let level_str = match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("ephemera={level_str},tower_http={level_str}"))
    });

    // try_init also installs the log-crate bridge, which is what carries
    // the relay core's log macros into these layers.
    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
            .try_init()
            .ok();
    }
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.trace {
        LevelFilter::Trace
    } else if common.debug || common.verbose == 1 {
        LevelFilter::Debug
    } else if common.verbose >= 2 {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    }
}
