//! `mcp-hub [CONFIG_PATH]`
//!
//! Connects every enabled server from the config, prints a JSON summary of
//! what came up, then holds the connections until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use mcp_hub::mcp_client::SqliteStatusStore;
use mcp_hub::{ClientOptions, McpClient, McpConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = mcp_hub::data_dir();
    mcp_hub::init_tracing(&data_dir).context("failed to initialise logging")?;

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(McpConfigFile::default_path);
    let config = McpConfigFile::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let db_path = mcp_hub::status_db_path().context("failed to create the data directory")?;
    let store = SqliteStatusStore::open(&db_path.to_string_lossy())
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    let client = McpClient::with_status_store(ClientOptions::default(), Arc::new(store));

    let failures = client.connect_all(&config).await;
    for (name, err) in &failures {
        tracing::warn!(server = %name, error = %err, "server unavailable");
    }

    let servers: Vec<serde_json::Value> = client
        .connected_servers()
        .into_iter()
        .map(|name| {
            let tools: Vec<String> = client
                .get_server_tools(&name)
                .into_iter()
                .map(|t| t.name)
                .collect();
            serde_json::json!({
                "name": name,
                "tools": tools,
                "resources": client.get_server_resources(&name).len(),
            })
        })
        .collect();
    let failed: Vec<serde_json::Value> = failures
        .iter()
        .map(|(name, err)| serde_json::json!({ "name": name, "error": err.to_string() }))
        .collect();
    let summary = serde_json::json!({ "connected": servers, "failed": failed });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutting down");
    client.cleanup().await;
    Ok(())
}
