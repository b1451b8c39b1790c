//! Tesseract Coordinator daemon
//!
//! Hosts the shard participants, the cross-shard transaction coordinator
//! and the channel manager in one process, with the status API and
//! Prometheus metrics alongside.

use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

use tesseract_coordinator::anchor::LedgerAnchor;
use tesseract_coordinator::api::{self, AppState};
use tesseract_coordinator::channel::{ChannelManager, DigestKeyring, DisputeResolver};
use tesseract_coordinator::config::Settings;
use tesseract_coordinator::coordination::{DecisionLog, TransactionCoordinator};
use tesseract_coordinator::events::EventBus;
use tesseract_coordinator::metrics::MetricsServer;
use tesseract_coordinator::registry::ShardRegistry;
use tesseract_coordinator::shard::{LocalTransport, ShardParticipant};
use tesseract_coordinator::state::{MemoryStore, StateManager};

/// Terminal transactions are dropped from memory after this long
const TRANSACTION_RETENTION_SECS: i64 = 3600;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Tesseract Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} shards",
        settings.enabled_shards().len()
    );

    // Decision log and ledger anchor
    let (decision_log, anchor, state_manager): (
        Arc<dyn DecisionLog>,
        Arc<dyn LedgerAnchor>,
        Option<Arc<StateManager>>,
    ) = if settings.database.is_memory() {
        warn!("Using the in-memory store; decisions will not survive a restart");
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store, None)
    } else {
        let manager = Arc::new(StateManager::new(&settings.database).await?);
        info!("Database connection established");
        manager.run_migrations().await?;
        info!("Database migrations complete");
        (manager.clone(), manager.clone(), Some(manager))
    };

    // Shard registry and locally hosted participants
    let registry = Arc::new(ShardRegistry::from_settings(&settings)?);
    let transport = Arc::new(LocalTransport::new());
    for (_, shard) in settings.enabled_shards() {
        transport.attach(Arc::new(ShardParticipant::new(
            shard.shard_id,
            shard.lock_max_duration(),
        )));
    }
    info!("Shard participants attached: {:?}", registry.active_shards());

    let events = EventBus::default();

    // Coordinator, re-driving anything a previous run left undelivered
    let coordinator = Arc::new(TransactionCoordinator::new(
        registry.clone(),
        transport.clone(),
        decision_log,
        anchor.clone(),
        events.clone(),
        settings.coordinator.clone(),
    ));
    let redriven = coordinator.recover().await?;
    info!("Coordinator recovered, {} decisions re-driven", redriven);

    // Channel manager
    let keyring = Arc::new(DigestKeyring::new());
    for (identity, secret) in &settings.channels.keys {
        keyring.insert(identity.clone(), secret.as_bytes().to_vec());
    }
    let channels = Arc::new(ChannelManager::new(
        anchor,
        keyring,
        DisputeResolver::new(settings.channels.challenge_window()),
        events.clone(),
    ));
    info!(
        "Channel manager initialized (challenge window {:?})",
        settings.channels.challenge_window()
    );

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            state_manager: state_manager.clone(),
            coordinator: coordinator.clone(),
            channels: channels.clone(),
            started_at: Instant::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Event log
    let events_handle = tokio::spawn({
        let mut subscription = events.subscribe();
        async move {
            while let Some(event) = subscription.recv().await {
                info!(event = event.name(), key = %event.key(), "Protocol event");
            }
        }
    });

    // Maintenance loop: lock expiry, dispute finalization, cleanup
    let maintenance_handle = tokio::spawn({
        let transport = transport.clone();
        let coordinator = coordinator.clone();
        let channels = channels.clone();
        let state_manager = state_manager.clone();
        let interval = Duration::from_millis(settings.coordinator.maintenance_interval_ms);
        async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;

                for participant in transport.participants() {
                    let expired = participant.expire_stale_locks();
                    if !expired.is_empty() {
                        warn!(
                            "Shard {} released locks of {} expired transactions",
                            participant.shard_id(),
                            expired.len()
                        );
                    }
                    participant.prune_finished();
                }

                for channel_id in channels.finalize_expired_disputes().await {
                    info!("Dispute finalized for channel {}", hex::encode(channel_id));
                }

                coordinator.cleanup(TRANSACTION_RETENTION_SECS).await;

                if let Some(manager) = &state_manager {
                    if let Err(e) = manager.health_check().await {
                        warn!("Database health check failed: {}", e);
                    }
                }
            }
        }
    });

    info!("Tesseract Coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    api_handle.abort();
    events_handle.abort();
    maintenance_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Tesseract Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tesseract_coordinator=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
