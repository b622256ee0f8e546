use clap::Parser;
use log::{error, info};
use server::{Server, ServerConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; command-line values override it
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Server IP address to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Server port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Tick rate (updates per second)
    #[arg(short, long)]
    tick_rate: Option<u32>,

    /// Maximum number of connected peers
    #[arg(short, long)]
    max_peers: Option<usize>,

    /// SQLite database file
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Database worker threads
    #[arg(short, long)]
    workers: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, server::error::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers;
        }
        if let Some(path) = self.database {
            config.database.path = path;
        }
        if let Some(workers) = self.workers {
            config.database.workers = workers;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config()?;
    info!(
        "Starting server on {}:{} at {}Hz, database {}",
        config.host,
        config.port,
        config.tick_rate,
        config.database.path.display()
    );

    // The tick loop owns all game state on one blocking thread
    let running = Arc::new(AtomicBool::new(true));
    let mut server_task = {
        let running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || -> Result<(), server::ServerError> {
            let mut server = Server::start(&config)?;
            server.run(&running);
            server.shutdown();
            Ok(())
        })
    };

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut server_task => {
            if let Err(e) = result? {
                error!("Server failed: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
            running.store(false, Ordering::Relaxed);
            server_task.await??;
        }
    }

    Ok(())
}
