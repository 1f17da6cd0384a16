use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use tokio::net::TcpListener;

use tetherd::agent::AgentSupervisor;
use tetherd::api::{AppState, create_router};
use tetherd::config::{self, TetherConfig};
use tetherd::pairing::{PairingGuard, TokenStore};
use tetherd::ws;

const APP_NAME: &str = "tetherd";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = TetherConfig::load(cli.common.config.as_deref())
        .context("loading configuration")?;
    debug!("resolved config: {config:#?}");

    match cli.command {
        Command::Serve(cmd) => async_serve(config, cmd),
        Command::Init(cmd) => handle_init(&cli.common, cmd),
        Command::Config { command } => handle_config(&config, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[tokio::main]
async fn async_serve(config: TetherConfig, cmd: ServeCommand) -> Result<()> {
    handle_serve(config, cmd).await
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tether - pairing-gated bridge for a local agent process.",
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
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON logs
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the bridge daemon
    Serve(ServeCommand),
    /// Create config directories and a default config file
    Init(InitCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Override the bind address from the config file
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,
    /// Override the agent binary from the config file
    #[arg(long, value_name = "PATH")]
    agent: Option<String>,
    /// Disable pairing (all routes unauthenticated)
    #[arg(long)]
    no_pairing: bool,
}

#[derive(Debug, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file path
    Path,
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

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tetherd={level_str},tower_http={level_str}")));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let disable_color = common.no_color
            || std::env::var_os("NO_COLOR").is_some()
            || !io::stderr().is_terminal();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

fn effective_log_level(common: &CommonOpts) -> LevelFilter {
    if common.trace || common.verbose >= 2 {
        LevelFilter::Trace
    } else if common.debug || common.verbose == 1 {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}

async fn handle_serve(mut config: TetherConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(bind) = cmd.bind {
        config.server.bind = bind;
    }
    if let Some(agent) = cmd.agent {
        config.agent.binary = agent;
    }
    if cmd.no_pairing {
        config.pairing.required = false;
    }

    info!("starting tether bridge...");

    let supervisor = AgentSupervisor::new(config.supervisor_config());
    let store = TokenStore::new(config.token_store_path());
    info!("token store: {:?}", store.path());
    let pairing = PairingGuard::new(config.pairing.required, store);
    if !config.pairing.required {
        warn!("pairing disabled: all routes are unauthenticated");
    }

    let state = AppState::new(supervisor, pairing);

    // Forward supervisor notifications to streaming subscribers.
    ws::spawn_event_pump(state.supervisor.clone(), state.hub.clone());

    // Print the pairing code (if any) at startup so the operator can read
    // it from the console.
    let pairing_status = state.pairing.status().await;
    if let Some(code) = pairing_status.pairing_code {
        info!("waiting for pairing, code: {code}");
    }

    // Bring the agent up eagerly; a failure here is not fatal, the first
    // call retries the spawn.
    if let Err(err) = state.supervisor.ensure_started().await {
        warn!("agent did not start: {err:#}");
    }

    let app = create_router(state.clone());

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;

    info!("listening on http://{addr}");

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    // Set up graceful shutdown
    let supervisor_for_shutdown = state.supervisor.clone();
    let shutdown_signal = async move {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("shutdown signal received, stopping agent...");
        supervisor_for_shutdown.dispose().await;
        info!("shutdown complete");
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("running server")?;

    Ok(())
}

fn handle_init(common: &CommonOpts, cmd: InitCommand) -> Result<()> {
    let path = common
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);

    if path.exists() && !cmd.force {
        anyhow::bail!("config file {path:?} already exists (use --force to overwrite)");
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }
    std::fs::write(&path, TetherConfig::default_toml())
        .with_context(|| format!("writing config file {path:?}"))?;

    info!("wrote default config to {path:?}");
    Ok(())
}

fn handle_config(config: &TetherConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let text = toml::to_string_pretty(config).context("serializing config")?;
            print!("{text}");
        }
        ConfigCommand::Path => {
            println!("{}", config::default_config_path().display());
        }
    }
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
