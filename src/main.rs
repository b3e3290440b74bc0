use std::path::PathBuf;

use clap::Parser;

use parley_server::ServerConfig;
use parley_store::Database;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Shared turn-based conversation relay")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 7171)]
    port: u16,

    /// Database file path; defaults to ~/.parley/parley.db
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log filter, e.g. "info" or "parley_server=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log)),
        )
        .init();

    tracing::info!("Starting parley relay");

    let db_path = match cli.db {
        Some(path) => path,
        None => {
            let dir = dirs_home().join(".parley");
            if let Err(e) = std::fs::create_dir_all(&dir) {
                tracing::error!(path = %dir.display(), error = %e, "failed to create data directory");
                std::process::exit(1);
            }
            dir.join("parley.db")
        }
    };

    let db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(path = %db_path.display(), error = %e, "failed to open database");
            std::process::exit(1);
        }
    };
    tracing::info!(path = %db_path.display(), "Database opened");

    let config = ServerConfig {
        port: cli.port,
        ..ServerConfig::default()
    };
    let handle = match parley_server::start(config, db).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    tracing::info!(port = handle.port, "Parley relay ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    }
    tracing::info!("Shutting down");
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
