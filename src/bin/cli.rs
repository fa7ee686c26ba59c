use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use discofy as lib;
use lib::config::Config;
use lib::models::ProviderRole;
use lib::{TransferError, TransferSession};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::io::AsyncBufReadExt;
use tracing::subscriber as tracing_subscriber_global;
use tracing::{info, warn};
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "discofy", version, about = "Copy a Discogs collection folder into a Spotify playlist")]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show whether each provider is authorized
    Status,
    /// Authorize a provider (source/discogs or destination/spotify), interactive
    Auth {
        role: ProviderRole,
    },
    /// Hand a redirect URL or verifier code to a pending authorization
    Callback {
        role: ProviderRole,
        /// Redirect URL, or the verifier code Discogs displayed
        input: String,
    },
    /// Forget a provider's credentials
    Logout {
        role: ProviderRole,
    },
    /// List the collection folders
    Folders,
    /// List the items of a folder
    Items {
        /// Folder index as printed by `folders`
        #[arg(long)]
        folder: usize,
    },
    /// Match a folder against Spotify, create the playlist and write the report
    Transfer {
        #[arg(long)]
        folder: usize,
        /// Playlist name; defaults to playlist_name_template
        #[arg(long)]
        name: Option<String>,
        /// Report file; defaults to report_path
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
    /// Validate config file and exit
    ConfigValidate,
}

/// --config, then the user's config dir, then the repository example.
fn resolve_config_path(explicit: &Option<PathBuf>) -> PathBuf {
    if let Some(p) = explicit {
        return p.clone();
    }
    if let Some(user) = dirs::config_dir().map(|d| d.join("discofy").join("config.toml")) {
        if user.exists() {
            return user;
        }
    }
    PathBuf::from("config/example-config.toml")
}

fn load_config(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        return Config::from_toml_str("").context("loading default config");
    }
    Config::from_path(path).with_context(|| format!("loading config from {}", path.display()))
}

fn init_logging(cfg: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    // Providers log through the `log` facade; route it into tracing.
    let _ = LogTracer::init();
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "discofy.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Honor RUST_LOG if set, otherwise default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer);

    tracing_subscriber_global::set_global_default(subscriber).context("failed to set global tracing subscriber")?;
    Ok(guard)
}

/// What the user should do about an error.
fn hint(e: &TransferError) -> Option<String> {
    match e {
        TransferError::Unauthorized(role) => Some(format!("run `discofy auth {}` and try again", role)),
        TransferError::UpstreamUnavailable { .. } => Some("the service is unreachable; try again later".into()),
        TransferError::InvalidFolder(_) => Some("run `discofy folders` to see valid folder indices".into()),
        TransferError::AuthorizationTimedOut(role) => Some(format!("run `discofy auth {}` again", role)),
        _ => None,
    }
}

fn report_failure(e: TransferError) -> anyhow::Error {
    if let Some(h) = hint(&e) {
        eprintln!("{}", h);
    }
    anyhow::Error::new(e)
}

async fn discover(session: &TransferSession) {
    if let Err(e) = session.discover().await {
        warn!("Could not determine authorization state: {}", e);
    }
}

/// Exit status for a Ctrl-C during `auth`.
const CANCELLED: u8 = 130;

async fn run_auth(session: &TransferSession, role: ProviderRole) -> Result<ExitCode> {
    discover(session).await;
    let request = session.begin_authorization(role).await.map_err(report_failure)?;
    println!("Open this URL in your browser and approve access:\n\n  {}\n", request.url);
    println!("Then paste the redirect URL or verifier code here (or run `discofy callback {} <input>`).", role);

    let paste = async {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    match session.complete_authorization(role, line.trim()).await {
                        Ok(()) => break,
                        Err(e) => eprintln!("{}; paste again", e),
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        // The poll loop reports the outcome.
        futures::future::pending::<()>().await
    };

    tokio::select! {
        res = session.poll_until_authorized(role) => {
            let status = res.map_err(report_failure)?;
            println!(
                "{} authorized{}",
                role,
                status.username.map(|u| format!(" as {}", u)).unwrap_or_default()
            );
        }
        _ = paste => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Authorization cancelled");
            return Ok(ExitCode::from(CANCELLED));
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_transfer(
    session: &TransferSession,
    folder: usize,
    name: Option<String>,
    report: Option<PathBuf>,
) -> Result<()> {
    discover(session).await;
    session.list_folders().await.map_err(report_failure)?;
    let items = session.load_folder(folder).await.map_err(report_failure)?;
    info!("Matching {} items", items.len());
    session.match_collection().await.map_err(report_failure)?;
    let summary = match session.create_playlist(name.as_deref()).await {
        Ok(summary) => summary,
        Err(e) => {
            if let Some(p) = session.reconciler().playlists().await.last() {
                eprintln!("Playlist '{}' was created but is incomplete: {}", p.name, p.destination_url);
            }
            return Err(report_failure(e));
        }
    };

    let bytes = session.export_report().await.map_err(report_failure)?;
    let report_path = report.unwrap_or_else(|| session.config().report_path.clone());
    std::fs::write(&report_path, bytes).with_context(|| format!("writing report to {}", report_path.display()))?;

    println!(
        "Created '{}' with {} tracks: {}",
        summary.playlist.name, summary.tracks_added, summary.playlist.destination_url
    );
    println!(
        "{} matched, {} not found; report written to {}",
        summary.matched,
        summary.not_found,
        report_path.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(&cli.config);

    if let Commands::ConfigValidate = cli.command {
        match Config::from_path(&config_path) {
            Ok(_) => println!("OK"),
            Err(e) => {
                eprintln!("Config validation failed: {:#}", e);
                return Ok(ExitCode::from(2));
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let cfg = load_config(&config_path, cli.config.is_some())?;
    let _guard = init_logging(&cfg)?;
    let session = TransferSession::from_config(cfg);

    match cli.command {
        Commands::Status => {
            let status = session.status().await.map_err(report_failure)?;
            for (role, s) in [
                (ProviderRole::Source, status.source),
                (ProviderRole::Destination, status.destination),
            ] {
                match (s.authorized, s.username) {
                    (true, Some(u)) => println!("{}: authorized as {}", role, u),
                    (true, None) => println!("{}: authorized", role),
                    (false, _) => println!("{}: not authorized", role),
                }
            }
        }
        Commands::Auth { role } => return run_auth(&session, role).await,
        Commands::Callback { role, input } => {
            session
                .complete_authorization(role, &input)
                .await
                .map_err(report_failure)?;
            println!("{} token stored; a waiting `discofy auth` will pick it up", role);
        }
        Commands::Logout { role } => {
            discover(&session).await;
            match session.logout(role).await {
                Ok(()) => println!("Logged out of {}", role),
                Err(TransferError::NotSupported(_)) => {
                    eprintln!("No session found for {}", role);
                    return Ok(ExitCode::FAILURE);
                }
                Err(e) => return Err(report_failure(e)),
            }
        }
        Commands::Folders => {
            discover(&session).await;
            let folders = session.list_folders().await.map_err(report_failure)?;
            for f in folders {
                println!("[{}] {} ({} items)", f.ordinal_index, f.name, f.item_count);
            }
        }
        Commands::Items { folder } => {
            discover(&session).await;
            session.list_folders().await.map_err(report_failure)?;
            let items = session.load_folder(folder).await.map_err(report_failure)?;
            for (i, item) in items.iter().enumerate() {
                match item.year {
                    Some(y) => println!("{:>4}. {} ({})", i + 1, item.display_name(), y),
                    None => println!("{:>4}. {}", i + 1, item.display_name()),
                }
            }
        }
        Commands::Transfer { folder, name, report } => run_transfer(&session, folder, name, report).await?,
        Commands::ConfigValidate => {}
    }

    Ok(ExitCode::SUCCESS)
}
