use std::fs;
use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, ColorChoice, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;

use nurselink::api;
use nurselink::auth::{AuthState, Role};
use nurselink::chat::ChatHub;
use nurselink::db::Database;
use nurselink::history::{HistoryStore, SqliteHistoryStore};

mod settings;

use settings::{APP_NAME, LoggingSettings, Settings, settings_path};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Nurselink - real-time patient and nurse chat server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct GlobalArgs {
    /// Settings file, or a directory containing config.toml
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    /// When to color log output
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto, global = true)]
    color: ColorChoice,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the chat server
    Serve(ServeArgs),
    /// Write a settings file with defaults
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Inspect settings
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Mint a signed access token for a participant
    Token(TokenArgs),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeArgs {
    /// Address to bind (overrides server.host)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective settings
    Show {
        #[arg(long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },
    /// Print the settings file path
    Path,
}

#[derive(Debug, Clone, Args)]
struct TokenArgs {
    /// Subject of the token
    #[arg(long)]
    user_id: String,
    /// Display name shown to other participants
    #[arg(long)]
    name: String,
    /// Participant role (nurse, patient, admin)
    #[arg(long)]
    role: Role,
    /// Print the token with its metadata instead of the bare token
    #[arg(long, value_enum)]
    format: Option<Format>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Toml,
    Json,
    Yaml,
}

impl Format {
    fn render<T: Serialize>(self, value: &T) -> Result<String> {
        Ok(match self {
            Format::Toml => toml::to_string_pretty(value)?,
            Format::Json => serde_json::to_string_pretty(value)? + "\n",
            Format::Yaml => serde_yaml::to_string(value)?,
        })
    }
}

#[derive(Debug, Serialize)]
struct IssuedToken<'a> {
    user_id: &'a str,
    role: Role,
    expires_in_secs: i64,
    token: &'a str,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = settings_path(cli.global.config.as_deref())?;

    match cli.command {
        Command::Serve(args) => {
            let settings = Settings::load(&path)?;
            init_logging(&cli.global, &settings.logging)?;
            info!("Settings: {}", path.display());
            serve(settings, args)
        }
        Command::Init { force } => init_settings(&path, force),
        Command::Config {
            command: ConfigCommand::Show { format },
        } => {
            print!("{}", format.render(&Settings::load(&path)?)?);
            Ok(())
        }
        Command::Config {
            command: ConfigCommand::Path,
        } => {
            println!("{}", path.display());
            Ok(())
        }
        Command::Token(args) => issue_token(&Settings::load(&path)?, args),
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

fn init_settings(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Settings::write_default(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn issue_token(settings: &Settings, args: TokenArgs) -> Result<()> {
    settings
        .auth
        .validate()
        .context("invalid auth settings")?;
    let token = AuthState::new(settings.auth.clone())
        .generate_token(&args.user_id, &args.name, args.role)
        .context("minting token")?;

    match args.format {
        None => println!("{token}"),
        Some(format) => print!(
            "{}",
            format.render(&IssuedToken {
                user_id: &args.user_id,
                role: args.role,
                expires_in_secs: settings.auth.token_ttl_secs,
                token: &token,
            })?
        ),
    }
    Ok(())
}

fn log_level(global: &GlobalArgs, logging: &LoggingSettings) -> LevelFilter {
    match (global.quiet, global.verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => logging.level.parse().unwrap_or(LevelFilter::Info),
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

/// tracing for our spans and tower-http, env_logger for `log` records.
fn init_logging(global: &GlobalArgs, logging: &LoggingSettings) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let level = log_level(global, logging);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.as_str().to_lowercase();
        EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}"))
    });

    let file_layer = match logging.file {
        Some(ref path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {path}"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if global.log_json {
        registry.with(fmt::layer().json()).try_init().ok();
    } else {
        let ansi = match global.color {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => {
                std::env::var_os("NO_COLOR").is_none() && io::stderr().is_terminal()
            }
        };
        registry.with(fmt::layer().with_ansi(ansi)).try_init().ok();
    }

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .try_init()
        .ok();
    Ok(())
}

#[tokio::main]
async fn serve(settings: Settings, args: ServeArgs) -> Result<()> {
    settings
        .auth
        .validate()
        .context("invalid auth settings")?;
    if settings.auth.dev_mode {
        warn!("Auth dev mode is on: dev:<user_id> tokens are accepted");
    }

    let data_dir = settings.data_dir()?;
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("chat.db");
    info!("Message history: {}", db_path.display());
    let database = Database::new(&db_path).await?;
    let history: Arc<dyn HistoryStore> =
        Arc::new(SqliteHistoryStore::new(database.pool().clone()));

    let hub = ChatHub::spawn(settings.chat.hub_buffer);
    info!(
        "Chat hub started (command buffer {}, per-connection buffer {})",
        settings.chat.hub_buffer, settings.chat.outbound_buffer
    );

    let state = api::AppState::new(
        AuthState::new(settings.auth.clone()),
        hub,
        history,
        settings.chat.clone(),
    );
    let app = api::create_router(state);

    let host = args.host.unwrap_or(settings.server.host);
    let port = args.port.unwrap_or(settings.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, closing chat connections...");
}
