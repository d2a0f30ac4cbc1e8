//! Conveyor - Main Entry Point
//! Composition root: configuration, logging, stores, dispatchers, RPC server

mod config;
mod logging;
mod telemetry;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{DaemonConfig, HandlerConfig};
use conveyor_api_rpc::{RpcHandler, RpcServer, RpcServerConfig};
use conveyor_core::application::{
    shutdown_channel, BudgetGovernor, Dispatcher, DispatcherDeps, EnqueueService,
    EscalationRouter, JobDefinition, JobRegistry, LockReaper, RetryPlanner,
};
use conveyor_core::domain::Queue;
use conveyor_core::port::id_provider::UuidProvider;
use conveyor_core::port::notifier::LogNotifier;
use conveyor_core::port::telemetry::TracingTelemetry;
use conveyor_core::port::time_provider::SystemTimeProvider;
use conveyor_core::port::{JobStore, TimeProvider};
use conveyor_infra_sqlite::{create_pool, run_migrations, SqliteBudgetStore, SqliteJobStore};
use conveyor_infra_system::CommandHandler;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extra wait on top of the handler grace for release writes to land
const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Logging (must outlive everything else)
    let _log_guard = logging::init()?;
    info!("Conveyor v{} starting...", VERSION);
    telemetry::report();

    // 2. Configuration
    let config = DaemonConfig::load()?;
    let registry = Arc::new(build_registry(&config.handlers)?);
    config.validate(registry.longest_timeout())?;

    if registry.is_empty() {
        warn!("No job handlers configured; dispatchers will not start");
    }

    let worker_id = config.worker_id(&UuidProvider);
    let database_url = config.database_url()?;
    info!(database_url = %database_url, worker_id = %worker_id, "Initializing database...");

    // 3. Database
    let pool = create_pool(&database_url)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    // 4. Dependencies (DI wiring)
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(pool.clone(), time_provider.clone())
            .with_stale_lock_timeout(config.stale_lock_timeout()),
    );
    let budget_store = Arc::new(SqliteBudgetStore::new(pool.clone(), time_provider.clone()));
    let telemetry = Arc::new(TracingTelemetry::new());
    let notifier = Arc::new(LogNotifier);

    let governor = Arc::new(BudgetGovernor::new(
        budget_store,
        notifier.clone(),
        telemetry.clone(),
        time_provider.clone(),
        config.budget_config(),
    ));

    let escalation = Arc::new(EscalationRouter::new(notifier));

    let deps = DispatcherDeps {
        store: store.clone(),
        registry: registry.clone(),
        planner: RetryPlanner::new(),
        escalation: escalation.clone(),
        telemetry: telemetry.clone(),
        time_provider: time_provider.clone(),
    };

    // 5. Return abandoned claims of a previous run
    let reaper = LockReaper::new(
        store.clone(),
        escalation,
        telemetry.clone(),
        config.reaper_interval(),
    );
    match reaper.sweep().await {
        Ok(reclaimed) => info!(reclaimed = reclaimed.len(), "Startup lock sweep completed"),
        Err(e) => error!(error = %e, "Startup lock sweep failed"),
    }

    // 6. Dispatchers, one per queue with registered job types
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let dispatcher_config = config.dispatcher_config(&worker_id);
    let queues = registry.queues();
    let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(queues.len() + 1);

    for queue in &queues {
        let queue_config = config.queue_config(*queue);
        let budget_gated = queue_config.budget_gated;
        let mut dispatcher = Dispatcher::new(queue_config, dispatcher_config.clone(), deps.clone());
        if budget_gated {
            dispatcher = dispatcher.with_governor(governor.clone());
        }

        let token = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = dispatcher.run(token).await {
                error!(queue = %dispatcher.queue().queue, error = %e, "Dispatcher failed");
            }
        }));
    }

    tasks.push(tokio::spawn(async move {
        reaper.run(shutdown_rx).await;
    }));

    // 7. JSON-RPC server
    let enqueue = Arc::new(EnqueueService::new(
        store.clone(),
        registry.clone(),
        time_provider.clone(),
    ));
    let rpc_handler = RpcHandler::new(enqueue, store, Some(governor), telemetry, queues);
    let rpc_config = RpcServerConfig {
        host: config.rpc_host.clone(),
        port: config.rpc_port,
    };
    let (rpc_addr, rpc_handle) = RpcServer::new(rpc_config, rpc_handler)
        .start()
        .await
        .context("RPC server start failed")?;

    info!(rpc_addr = %rpc_addr, "System ready. Press Ctrl+C to shutdown");

    // 8. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Draining in-flight jobs...");

    // 9. Graceful shutdown: stop accepting work, then let handlers finish
    shutdown_tx.shutdown();
    if let Err(e) = rpc_handle.stop() {
        warn!(error = %e, "RPC server already stopped");
    }

    let drain = async {
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task panicked");
            }
        }
    };
    if tokio::time::timeout(config.shutdown_grace() + SHUTDOWN_MARGIN, drain)
        .await
        .is_err()
    {
        warn!("Shutdown grace period exceeded; remaining claims will go stale");
    }

    telemetry::shutdown();
    info!("Shutdown complete.");

    Ok(())
}

/// Resolve every configured job type to a command handler
fn build_registry(handlers: &[HandlerConfig]) -> Result<JobRegistry> {
    let mut registry = JobRegistry::new();

    for h in handlers {
        let queue = h
            .queue
            .parse::<Queue>()
            .with_context(|| format!("handler {}: unknown queue {}", h.job_type, h.queue))?;

        let mut handler = CommandHandler::new(&h.command, h.args.clone())
            .timeout(Duration::from_secs(h.timeout_secs));
        if let Some(allowlist) = &h.env_allowlist {
            handler = handler.env_allowlist(allowlist.clone());
        }
        if let Some(dir) = &h.working_dir {
            handler = handler.working_dir(shellexpand::tilde(dir).into_owned());
        }

        // The dispatcher bound covers the child's kill grace as well
        let definition = JobDefinition::new(&h.job_type, queue)
            .priority(h.priority)
            .max_attempts(h.max_attempts)
            .base_delay(Duration::from_secs(h.base_delay_secs))
            .timeout(handler.total_timeout());

        registry
            .register(definition, Arc::new(handler))
            .with_context(|| format!("handler {}", h.job_type))?;
        info!(job_type = %h.job_type, queue = %h.queue, command = %h.command, "Registered handler");
    }

    Ok(registry)
}
