mod config;
mod dispatcher;
mod engine;
mod error;
mod history;
mod model;
mod reconciler;
mod simulator;
mod store;
mod transport;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use dispatcher::Dispatcher;
use reconciler::{Reconciler, Seed};
use store::{LastKnown, Store};
use transport::{PollTransport, PushTransport, Transport};

/// Starting state: last-known-good rows from the store where present,
/// config defaults (and a generated demo history) otherwise.
fn seed_from(cfg: &Config, last: LastKnown, now: OffsetDateTime) -> Seed {
    let fresh = last.reading.is_none();
    let reading = last.reading.unwrap_or_else(|| cfg.initial_reading(now));
    let history = if fresh {
        simulator::demo_history(&reading, now, &mut fastrand::Rng::new())
    } else {
        last.history
    };
    let profiles = if last.profiles.is_empty() {
        cfg.seed_profiles()
    } else {
        last.profiles
    };

    Seed {
        reading,
        relays: last.relays.unwrap_or(cfg.relays),
        auto_mode: last.auto_mode.unwrap_or(cfg.auto_mode),
        status: last.status.unwrap_or_else(|| cfg.initial_status()),
        profiles,
        history,
        at: last.recorded_at.unwrap_or(now),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "hub.toml".to_string());
    let cfg = config::load(&config_path)?;
    let device_id = cfg.device_id.clone();

    // ── Store ───────────────────────────────────────────────────────
    let store = Store::connect(&cfg.db_url).await?;
    store.migrate().await?;
    let last = store.load_last_known(&device_id, cfg.history.capacity).await?;
    match last.recorded_at {
        Some(at) => info!(%device_id, last_seen = %at, "seeding from last-known-good data"),
        None => info!(%device_id, "store empty; seeding from config defaults"),
    }
    let seed = seed_from(&cfg, last, OffsetDateTime::now_utc());

    let (store_tx, store_rx) = mpsc::channel(engine::QUEUE_DEPTH);
    tokio::spawn(store::run_writer(store, device_id.clone(), store_rx));

    // ── Engine ──────────────────────────────────────────────────────
    let reconciler = Reconciler::new(device_id.clone(), seed, cfg.history.capacity);
    let (engine, engine_task) = engine::spawn(reconciler, Some(store_tx));

    // ── Transports ──────────────────────────────────────────────────
    let mut transports: Vec<Arc<dyn Transport>> = Vec::new();
    if cfg.mqtt.enabled {
        transports.push(Arc::new(PushTransport::new(
            device_id.clone(),
            cfg.mqtt_settings(),
            engine.clone(),
        )));
    }
    if let Some(settings) = cfg.poll_settings() {
        transports.push(Arc::new(PollTransport::new(
            device_id.clone(),
            settings,
            engine.clone(),
        )?));
    }
    if transports.is_empty() {
        warn!("no backend url and mqtt disabled; running on simulated data only");
    }
    for t in &transports {
        if let Err(e) = t.connect().await {
            warn!(transport = t.name(), error = %e, "initial connect failed");
        }
    }

    // ── Simulator ───────────────────────────────────────────────────
    if cfg.simulator.enabled {
        tokio::spawn(simulator::run(
            engine.clone(),
            cfg.simulator_interval(),
            fastrand::Rng::new(),
        ));
    }

    // ── Operator API ────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(engine.clone(), transports.clone(), cfg.command_timeout());
    let state = web::AppState {
        engine: engine.clone(),
        dispatcher: Arc::new(dispatcher),
    };

    tokio::select! {
        res = web::serve(state, cfg.web_port) => res?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    for t in &transports {
        t.disconnect().await;
    }
    engine_task.abort();
    info!("hub stopped");
    Ok(())
}
