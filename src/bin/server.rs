use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use chatwire::auth::MemoryIdentityStore;
use chatwire::config::ServerConfig;
use chatwire::core::ConnectionRegistry;
use chatwire::handlers::{handle_client, SessionContext};
use chatwire::storage::create_message_store_with_capacity;

#[tokio::main]
async fn main() {
    // Initialize env
    if let Err(e) = dotenvy::dotenv() {
        // Logger is not up yet
        eprintln!("No .env file loaded: {}", e);
    }

    // Initialize logging
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Configuration: address={}, idle_timeout={:?}, channel={}",
        config.bind_address(),
        config.idle_timeout,
        config.default_channel
    );

    let registry = Arc::new(ConnectionRegistry::with_write_timeout(config.write_timeout));
    let history = create_message_store_with_capacity(config.history_capacity);
    let identity = Arc::new(MemoryIdentityStore::with_channel(&config.default_channel));

    let ctx = SessionContext {
        registry: registry.clone(),
        identity,
        history: history.clone(),
        config: config.clone(),
    };

    let listener = match TcpListener::bind(config.bind_address()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.bind_address(), e);
            std::process::exit(1);
        }
    };

    info!("Starting chatwire server on {}", config.bind_address());

    let mut sessions: Vec<JoinHandle<()>> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    sessions.retain(|task| !task.is_finished());
                    let ctx = ctx.clone();
                    sessions.push(tokio::spawn(handle_client(stream, peer.to_string(), ctx)));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let closed = registry.shutdown_all().await;
    info!("Closing {} connections", closed);

    // Let every session remove itself and send its leave notice
    for result in futures_util::future::join_all(sessions).await {
        if let Err(e) = result {
            debug!("Session task ended abnormally: {}", e);
        }
    }

    if let Some(path) = &config.history_dump_path {
        match history.export_json() {
            Ok(json) => match tokio::fs::write(path, json).await {
                Ok(()) => info!("History written to {}", path),
                Err(e) => error!("Failed to write history to {}: {}", path, e),
            },
            Err(e) => error!("{}", e),
        }
    }
}
