// =============================================================================
// Meridian Flow Sentinel — Main Entry Point
// =============================================================================
//
// Run modes, selected by the first CLI argument (or MERIDIAN_MODE):
//   default  serve the admin API and run the full signal loop
//   record   capture raw depth + tape for one symbol
//   replay   drive the coordinator from recorded files, deterministically
//   report   aggregate a decision journal into a rollup
//
// Exit codes: 0 success, 1 config error, 2 broker connect failure,
// 3 invalid mode.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod feed;
mod journal;
mod market_data;
mod metrics;
mod notify;
mod recorder;
mod replay;
mod report;
mod runtime_config;
mod signals;
mod subscription;
mod types;
mod universe;

use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::feed::{FeedDispatcher, FeedEvent, SharedBroker};
use crate::journal::Journal;
use crate::market_data::{BookDirectory, BookParams};
use crate::metrics::MetricsEngine;
use crate::notify::{DiscordWebhook, NullSink, SignalSink};
use crate::runtime_config::RuntimeConfig;
use crate::signals::{DecisionIds, SignalCoordinator};
use crate::subscription::{EvaluationController, SubscriptionManager, SubscriptionRegistry};
use crate::types::{now_ms, RunMode};
use crate::universe::UniverseService;

/// Reconnect backoff bounds (exponential with jitter).
const BACKOFF_INITIAL_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 60_000;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Flow Sentinel — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mode_raw = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MERIDIAN_MODE").ok())
        .unwrap_or_default();
    let Some(mode) = RunMode::parse(&mode_raw) else {
        eprintln!("invalid mode '{mode_raw}' (expected default|record|replay|report)");
        return 3;
    };

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "runtime_config.json".into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Env overrides for the most operationally fluid settings.
    if let Ok(symbols) = std::env::var("MERIDIAN_SYMBOLS") {
        config.universe.static_symbols = symbols
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(addr) = std::env::var("MERIDIAN_BRIDGE_ADDR") {
        config.feed.bridge_addr = addr;
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "configuration invalid");
        return 1;
    }

    info!(mode = %mode, "run mode selected");

    // ── 2. Shutdown signal ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    match mode {
        RunMode::Default => run_default(config, shutdown_rx).await,
        RunMode::Record => recorder::run(config, shutdown_rx).await,
        RunMode::Replay => replay::run(config),
        RunMode::Report => report::run(&config.journal.file_path),
    }
}

async fn run_default(config: RuntimeConfig, mut shutdown: watch::Receiver<bool>) -> i32 {
    let session_id = uuid::Uuid::new_v4().to_string();

    // ── 3. Build shared state ────────────────────────────────────────────
    let journal = match Journal::open(&config.journal.file_path, session_id) {
        Ok(journal) => Arc::new(journal),
        Err(e) => {
            error!(error = %e, "failed to open journal");
            return 1;
        }
    };

    let broker = Arc::new(SharedBroker::new());
    let registry = Arc::new(SubscriptionRegistry::new());
    let sm = Arc::new(SubscriptionManager::new(
        config.clone(),
        registry,
        broker.clone(),
    ));
    let books = Arc::new(BookDirectory::new(BookParams {
        max_depth: config.market_data.depth_rows,
        stale_window_ms: config.book.stale_window_ms,
        tape_window_ms: config.tape.window_ms,
    }));
    let metrics = Arc::new(MetricsEngine::new(config.signals.imbalance_levels));
    let coordinator = Arc::new(SignalCoordinator::new(
        config.clone(),
        books.clone(),
        metrics.clone(),
        journal.clone(),
        DecisionIds::wall(),
    ));
    let controller = Arc::new(EvaluationController::new(
        config.clone(),
        sm.clone(),
        books.clone(),
        journal.clone(),
    ));

    let sink: Arc<dyn SignalSink> = match &config.notify.discord_webhook_url {
        Some(url) if !url.is_empty() => DiscordWebhook::new(url.clone()),
        _ => Arc::new(NullSink),
    };

    let dispatcher = Arc::new(FeedDispatcher::new(
        config.clone(),
        sm.clone(),
        books.clone(),
        coordinator.clone(),
        controller.clone(),
        sink,
    ));

    let universe = Arc::new(UniverseService::new(
        config.clone(),
        sm.clone(),
        books.clone(),
        coordinator.clone(),
        journal.clone(),
    ));

    let state = Arc::new(AppState::new(
        config.clone(),
        sm.clone(),
        books.clone(),
        metrics,
        coordinator.clone(),
        journal.clone(),
    ));

    // ── 4. Admin API server ──────────────────────────────────────────────
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3002".into());
    {
        let app = api::router(state.clone());
        let bind = bind_addr.clone();
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(&bind).await {
                Ok(listener) => {
                    info!(addr = %bind, "admin API listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "admin API server failed");
                    }
                }
                Err(e) => error!(addr = %bind, error = %e, "admin API bind failed"),
            }
        });
    }

    // ── 5. First bridge connection (startup failure is fatal, exit 2) ────
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<FeedEvent>();
    match feed::bridge::connect(&config.feed.bridge_addr, events_tx).await {
        Ok(client) => broker.set(Arc::new(client)),
        Err(e) => {
            error!(error = %e, addr = %config.feed.bridge_addr, "broker bridge connect failed");
            return 2;
        }
    }

    universe.refresh(now_ms()).await;
    controller.fill_slots(now_ms()).await;

    // ── 6. Control plane ─────────────────────────────────────────────────
    // Heartbeat.
    tokio::spawn(journal::run_heartbeat(
        journal.clone(),
        state.clone(),
        config.journal.heartbeat_seconds,
        shutdown.clone(),
    ));

    // Universe refresh timer.
    tokio::spawn(universe.clone().run(shutdown.clone()));

    // Evaluation-window timer.
    {
        let controller = controller.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => controller.tick(now_ms()).await,
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
            }
        });
    }

    // Fallback monitor.
    {
        let sm = sm.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => sm.run_fallback_pass(now_ms()).await,
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
            }
        });
    }

    // Rank-window poll.
    {
        let coordinator = coordinator.clone();
        let dispatcher = dispatcher.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = now_ms();
                        let events = coordinator.poll_rank_window(now);
                        dispatcher.handle_coordinator_events(events, now).await;
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { return },
                }
            }
        });
    }

    info!("all subsystems running");

    // ── 7. Broker reader loop with reconnect ─────────────────────────────
    'outer: loop {
        let connection_lost = loop {
            tokio::select! {
                maybe_event = events_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            if !dispatcher.handle_event(event).await {
                                break true;
                            }
                        }
                        None => break true,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break false;
                    }
                }
            }
        };

        if !connection_lost {
            break 'outer;
        }

        // Connection lost: pause, clear, reconnect with backoff, then
        // re-apply the universe from scratch.
        warn!("broker connection lost, entering reconnect");
        broker.clear();
        controller.abort_all(now_ms()).await;
        sm.clear_all();

        let mut backoff_ms = BACKOFF_INITIAL_MS;
        loop {
            let jitter = rand::thread_rng().gen_range(0..500);
            let delay = std::time::Duration::from_millis(backoff_ms + jitter);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break 'outer;
                    }
                }
            }

            let (events_tx, new_rx) = mpsc::unbounded_channel::<FeedEvent>();
            match feed::bridge::connect(&config.feed.bridge_addr, events_tx).await {
                Ok(client) => {
                    broker.set(Arc::new(client));
                    events_rx = new_rx;
                    universe.refresh(now_ms()).await;
                    controller.fill_slots(now_ms()).await;
                    info!("bridge reconnected, universe re-applied");
                    continue 'outer;
                }
                Err(e) => {
                    backoff_ms = (backoff_ms * 2).min(BACKOFF_CAP_MS);
                    warn!(error = %e, next_backoff_ms = backoff_ms, "reconnect failed");
                }
            }
        }
    }

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    controller.abort_all(now_ms()).await;
    sm.apply_universe(&[], now_ms()).await;
    info!("Meridian Flow Sentinel shut down complete.");
    0
}
