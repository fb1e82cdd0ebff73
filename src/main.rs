//! Pupil Screen CLI
//!
//! Real-time pupil and gaze screening server and tools.

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use pupil_screen::{
    config::Config,
    core::{decide, FrameAnalysis, FrameAnalyzer, HistorySignals},
    logging::init_logging,
    server::{run_with_state, ServerState},
    store::{RecordStore, SqliteStore},
    UserId, SCREENING_DISCLAIMER, VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pupil-screen")]
#[command(version = VERSION)]
#[command(about = "Real-time pupil and gaze screening pipeline", long_about = None)]
struct Cli {
    /// Override the database path from the config file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the screening server until Ctrl+C
    Serve {
        /// Interface to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },

    /// Issue a bearer token for a user
    IssueToken {
        /// User identity the token resolves to
        #[arg(long)]
        user: String,

        /// Hours until the token expires (never, if omitted)
        #[arg(long)]
        ttl_hours: Option<i64>,
    },

    /// Revoke a bearer token
    RevokeToken {
        token: String,
    },

    /// Show a user's records and verdict
    Report {
        #[arg(long)]
        user: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run the frame analyzer on an image file
    Analyze {
        image: PathBuf,
    },

    /// Show configuration
    Config,

    /// Display the screening notice
    Disclaimer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config, using defaults: {e}");
        Config::default()
    });
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    match cli.command {
        Commands::Serve { host, port } => cmd_serve(config, host, port).await,
        Commands::IssueToken { user, ttl_hours } => cmd_issue_token(&config, &user, ttl_hours),
        Commands::RevokeToken { token } => cmd_revoke_token(&config, &token),
        Commands::Report { user, json } => cmd_report(&config, &user, json),
        Commands::Analyze { image } => cmd_analyze(&config, &image),
        Commands::Config => cmd_config(&config),
        Commands::Disclaimer => {
            println!("{SCREENING_DISCLAIMER}");
            Ok(())
        }
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    config
        .ensure_directories()
        .context("failed to create data directory")?;
    SqliteStore::open(&config.database_path).with_context(|| {
        format!(
            "failed to open record store at {}",
            config.database_path.display()
        )
    })
}

async fn cmd_serve(mut config: Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    init_logging(&config.logging);

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let analyzer = FrameAnalyzer::new(config.analyzer.clone());
    let store = Arc::new(open_store(&config)?);
    let state = Arc::new(ServerState::with_sqlite(store, analyzer));
    let stats = state.stats();

    let (addr, shutdown_tx) =
        run_with_state(&config.server.host, config.server.port, state).await?;

    println!("Pupil Screen v{VERSION}");
    println!("  Listening on: http://{addr}");
    println!("  Stream endpoint: ws://{addr}/ws/screening");
    println!("  Database: {}", config.database_path.display());
    println!();
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    println!();
    println!("Stopping server...");
    let _ = shutdown_tx.send(());

    println!();
    println!("{}", stats.summary());
    Ok(())
}

fn cmd_issue_token(config: &Config, user: &str, ttl_hours: Option<i64>) -> Result<()> {
    let store = open_store(config)?;
    let token = store.issue_token(&UserId::new(user), ttl_hours.map(Duration::hours))?;
    println!("{token}");
    Ok(())
}

fn cmd_revoke_token(config: &Config, token: &str) -> Result<()> {
    let store = open_store(config)?;
    if store.revoke_token(token)? {
        println!("Token revoked.");
    } else {
        println!("No such token.");
    }
    Ok(())
}

fn cmd_report(config: &Config, user: &str, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let records = store.list_by_user(&UserId::new(user))?;
    let signals = HistorySignals::from_records(&records);
    let verdict = decide(records);

    if json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
        return Ok(());
    }

    println!("Screening report for user {user}");
    println!("================================");
    println!();
    if verdict.sessions.is_empty() {
        println!("No records.");
    } else {
        println!(
            "{:<32} {:<20} {:<8} {:>8} {:>8} {:<5}",
            "Timestamp", "Stimulus", "Gaze", "Left", "Right", "ASD"
        );
        for record in &verdict.sessions {
            println!(
                "{:<32} {:<20} {:<8} {:>8.3} {:>8.3} {:<5}",
                record.timestamp.to_rfc3339(),
                record.stimulus,
                record.gaze_direction.as_str(),
                record.left_pupil_size,
                record.right_pupil_size,
                record.asd_flag.as_str()
            );
        }
        println!();
        println!("Average pupil diameter: {:.3}", signals.average_pupil);
        println!("Gaze consistency: {:.1}%", signals.gaze_consistency * 100.0);
    }
    println!();
    println!("Decision: {}", verdict.decision);
    Ok(())
}

fn cmd_analyze(config: &Config, image: &Path) -> Result<()> {
    let bytes =
        std::fs::read(image).with_context(|| format!("failed to read {}", image.display()))?;
    let analyzer = FrameAnalyzer::new(config.analyzer.clone());

    match analyzer.analyze(&bytes) {
        FrameAnalysis::Measured(sample) => {
            println!("Gaze: {}", sample.gaze);
            println!("Left diameter: {:.3}", sample.left);
            println!("Right diameter: {:.3}", sample.right);
        }
        FrameAnalysis::Undecodable => {
            println!("Image could not be decoded (treated as gaze=unknown, 0.0/0.0)");
        }
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    println!("Configuration file: {}", Config::config_path().display());
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
