//! `ydurable-server` — CRDT sync server with a durable update log.
//!
//! ```text
//! ydurable-server [serve]   run the WebSocket server
//! ydurable-server keys      print persisted storage keys as JSON
//! ydurable-server docs      print persisted document names as JSON
//! ydurable-server clear     delete every persisted key
//! ```
//!
//! Configuration comes from `YDURABLE_*` environment variables or `.env`.

use std::process::ExitCode;

use log::{error, info};
use ydurable_sync::storage::DEFAULT_KEY_PAGE;
use ydurable_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let command = std::env::args().nth(1).unwrap_or_else(|| "serve".to_string());
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    match command.as_str() {
        "serve" => {
            info!("Starting ydurable-server...");
            if let Err(e) = server.run().await {
                error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        "keys" => {
            let Some(keys) = server.store().list_keys(DEFAULT_KEY_PAGE).await else {
                return ExitCode::FAILURE;
            };
            match serde_json::to_string_pretty(&keys) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    error!("Failed to encode keys: {e}");
                    return ExitCode::FAILURE;
                }
            }
        }
        "docs" => {
            let Some(docs) = server.store().list_documents(DEFAULT_KEY_PAGE).await else {
                return ExitCode::FAILURE;
            };
            println!("{}", serde_json::Value::from(docs));
        }
        "clear" => {
            if server.store().clear_all().await.is_none() {
                return ExitCode::FAILURE;
            }
            info!("Cleared all persisted documents");
        }
        other => {
            error!("Unknown command {other:?}; expected serve, keys, docs or clear");
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}
