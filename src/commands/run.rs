//! Run Command
//!
//! Starts the monitoring engine: builds the per-account exchange clients,
//! recovers state from the snapshot, and drives the scheduler until a
//! shutdown signal arrives. Engine events are drained into the structured
//! log; the alert dispatcher attaches to the same channel in the full
//! deployment.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use tpsl_engine::bybit::{BybitClient, ClientConfig, ExchangeApi};
use tpsl_engine::engine::Engine;
use tpsl_engine::events::{EngineEvent, EventSender};
use tpsl_engine::scheduler::Scheduler;
use tpsl_engine::types::Account;
use tpsl_engine::Config;

pub fn run() -> Result<()> {
    let config = Config::from_env().context("failed to build configuration")?;
    config.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<()> {
    let config = Arc::new(config);

    info!("╔══════════════════════════════════════════════════════╗");
    info!("║        ENHANCED TP/SL MONITORING ENGINE              ║");
    info!("╠══════════════════════════════════════════════════════╣");
    info!("║ Mirror trading: {:<37}║", config.mirror_enabled);
    info!("║ Cancel limits on TP1: {:<31}║", config.cancel_limits_on_tp1);
    info!(
        "║ External order protection: {:<26}║",
        config.external_order_protection
    );
    info!(
        "║ Max concurrent passes: {:<30}║",
        config.max_concurrent_monitors
    );
    info!("║ Snapshot: {:<43}║", config.persistence_path.display());
    info!("╚══════════════════════════════════════════════════════╝");

    let client_config = ClientConfig {
        timeout: config.exchange_timeout,
        requests_per_second: config.max_exchange_requests,
        ..ClientConfig::default()
    };

    let main_credentials = config
        .main_credentials
        .as_ref()
        .expect("validated: main credentials present");
    let main_client = BybitClient::new(
        Account::Main,
        main_credentials.api_key.clone(),
        main_credentials.api_secret.clone(),
        config.api_base_url.clone(),
        client_config.clone(),
    );
    let mut limiters = vec![main_client.limiter()];

    let mirror_client = if config.mirror_enabled {
        let credentials = config
            .mirror_credentials
            .as_ref()
            .expect("validated: mirror credentials present");
        let client = BybitClient::new(
            Account::Mirror,
            credentials.api_key.clone(),
            credentials.api_secret.clone(),
            config.api_base_url.clone(),
            client_config,
        );
        limiters.push(client.limiter());
        Some(Arc::new(client) as Arc<dyn ExchangeApi>)
    } else {
        None
    };

    // Engine events stream to the alert dispatcher; until one attaches we
    // drain them into the log so nothing backs up.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<EngineEvent>();
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            info!(
                monitor = %event.monitor_key,
                account = %event.account,
                chat_id = ?event.chat_id,
                event = event.kind.name(),
                "dispatching alert"
            );
        }
    });

    let engine = Arc::new(Engine::new(
        Arc::clone(&config),
        Arc::new(main_client) as Arc<dyn ExchangeApi>,
        mirror_client,
        EventSender::new(event_tx, config.default_alert_chat_id),
        limiters,
    ));

    let restored = engine.load_state().await?;
    info!("engine ready ({} monitors recovered)", restored);
    if engine.persistence_degraded() {
        warn!("persistence is degraded; state is held in memory only");
    }

    // Shutdown plumbing: ctrl-c feeds the scheduler's stop channel.
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received ctrl-c, shutting down...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => error!("failed to install signal handler: {}", e),
        }
    });

    Scheduler::new(engine).run(shutdown_rx).await;
    info!("monitoring session ended");
    Ok(())
}
