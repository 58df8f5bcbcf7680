use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use fuel_order_sync_lib::logging::{init_logging, prune_old_logs, MAX_LOG_FILES};
use fuel_order_sync_lib::{
    build_info, spawn_sync_loop, CredentialSource, HttpOrderApi, KeyringCredentials,
    ReplayBuffer, StaticCredential, SyncConfig, SyncEngine, TcpPushChannel,
};

const ENV_TOKEN: &str = "FUEL_SYNC_TOKEN";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    prune_old_logs(&config.log_dir, MAX_LOG_FILES);
    let _log_guard = init_logging(&config.log_dir);
    info!("Starting fuel-sync {}", build_info());

    let operator_id = config.require_operator_id()?;
    let credentials: Arc<dyn CredentialSource> = match std::env::var(ENV_TOKEN) {
        Ok(token) if !token.trim().is_empty() => Arc::new(StaticCredential::new(token)),
        _ => Arc::new(KeyringCredentials::default()),
    };

    let api = HttpOrderApi::new(
        &config.api_base_url,
        Arc::clone(&credentials),
        config.request_timeout(),
    )
    .context("Failed to build HTTP client")?;
    let mut engine = SyncEngine::new(Arc::new(api), operator_id, config.retry_limit());
    if let Some(path) = config.replay_buffer_path.as_deref() {
        let replay = ReplayBuffer::open(path).context("Failed to open replay buffer")?;
        engine = engine.with_replay(replay);
    }

    let loaded = engine
        .bootstrap()
        .await
        .context("Initial order load failed")?;
    info!(orders = loaded, api = %config.api_base_url, "orders loaded");

    let channel = TcpPushChannel::new(&config.push_addr, config.connect_timeout());
    let handle = spawn_sync_loop(engine, channel, credentials, &config);

    let mut snapshots = handle.subscribe();
    let mut last_label = String::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!("sync loop exited");
                    break;
                }
                let label = snapshots.borrow_and_update().banner.label();
                if label != last_label {
                    info!(banner = %label, "connection banner");
                    last_label = label;
                }
            }
            signal = &mut ctrl_c => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutting down");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
