mod agent;
mod command;
mod config;
mod error;
mod outputs;
mod policy;
mod publisher;
mod sensors;
mod state;
mod transport;

use anyhow::{Context, Result};
use rumqttc::AsyncClient;
use std::{env, sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent::Agent;
use command::PendingCommand;
use outputs::OutputBoard;
use publisher::MqttSink;
use state::SystemState;

/// How long the transport task gets to flush the final publish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    if !cfg.policy.dosing_enabled {
        warn!("dosing disabled by config: fresh-water and nutrient pumps held OFF");
    }

    // ── Output board ────────────────────────────────────────────────
    let mut outputs = OutputBoard::new(&cfg.outputs).context("initialising output board")?;
    outputs.all_off();

    let shared = SystemState::shared();

    // ── MQTT ────────────────────────────────────────────────────────
    let (client, eventloop) =
        AsyncClient::new(transport::mqtt_options(&cfg.mqtt), cfg.mqtt.queue_capacity);
    let pending = PendingCommand::new();

    let transport = tokio::spawn(transport::run(
        eventloop,
        client.clone(),
        cfg.mqtt.clone(),
        Arc::clone(&pending),
        Arc::clone(&shared),
    ));
    info!(
        host = %cfg.mqtt.host,
        port = cfg.mqtt.port,
        commands = %cfg.mqtt.command_topic,
        broadcast = %cfg.mqtt.broadcast_topic,
        "hydro-agent started"
    );

    // ── Control loop ────────────────────────────────────────────────
    let sink = MqttSink::new(client.clone(), &cfg.mqtt.broadcast_topic);
    let mut agent = Agent::new(&cfg, Arc::clone(&shared), outputs, sink, pending);
    agent.run(shutdown_signal()).await;

    // ── Shutdown ────────────────────────────────────────────────────
    if let Err(e) = client.try_disconnect() {
        warn!("mqtt disconnect request failed: {e}");
    }
    match timeout(SHUTDOWN_GRACE, transport).await {
        Ok(Ok(())) => info!("transport stopped"),
        Ok(Err(e)) => warn!("transport task failed: {e}"),
        Err(_) => warn!(
            grace_ms = SHUTDOWN_GRACE.as_millis() as u64,
            "transport did not stop in time, exiting anyway"
        ),
    }

    let uptime = shared.read().await.started_at.elapsed();
    info!(uptime_sec = uptime.as_secs(), "hydro-agent stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown requested");
}
