use distribution_indexer::{
    init_tracing, DistributionWorker, IndexerConfig, NodeRpcClient, RebuildScheduler, Result,
    SnapshotStore, TriggerOutcome, WeeklySchedule,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    println!("🚀 Distribution Indexer Starting...");

    // Load configuration
    let config = match IndexerConfig::load() {
        Ok(config) => {
            println!("✅ Configuration loaded successfully");
            config
        }
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {}", e);
            print_config_help();
            return Err(e);
        }
    };

    // Initialize logging
    if let Err(e) = init_tracing(&config) {
        eprintln!("❌ Failed to initialize logging: {}", e);
        return Err(e);
    }

    info!("🎯 Distribution Indexer v{}", env!("CARGO_PKG_VERSION"));
    info!("🔧 Configuration:");
    info!("   Node RPC: {}", config.node.rpc_url);
    info!("   Data Dir: {}", config.storage.data_dir);
    info!("   Page Size: {}", config.enumeration.page_size);
    info!(
        "   Batches: {} accounts, {}ms apart",
        config.classification.batch_size, config.classification.batch_delay_ms
    );
    info!(
        "   Schedule: {} at {:02}:{:02} (UTC{:+}min){}",
        config.schedule.weekdays.join(","),
        config.schedule.hour,
        config.schedule.minute,
        config.schedule.utc_offset_minutes,
        if config.is_production() { "" } else { " - disabled outside production" }
    );

    let rpc = match NodeRpcClient::new(&config.node) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("❌ Failed to create node client: {}", e);
            return Err(e);
        }
    };

    let store = match SnapshotStore::from_config(&config.storage) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("❌ Failed to open snapshot store: {}", e);
            return Err(e);
        }
    };

    let schedule = WeeklySchedule::from_config(&config.schedule)?;
    let worker = Arc::new(DistributionWorker::new(&config, rpc, Arc::clone(&store)));
    let scheduler = Arc::new(RebuildScheduler::new(
        Arc::clone(&worker),
        schedule,
        config.is_production(),
    ));
    info!("✅ Distribution worker created");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Bootstrap rebuild when artifacts are missing
    let bootstrap_handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if let Some(TriggerOutcome::Failed(reason)) = scheduler.bootstrap().await {
                error!("❌ Bootstrap rebuild failed: {}", reason);
            }
        })
    };

    // Calendar loop
    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler.run(shutdown_rx).await;
        })
    };

    // Status reporting task
    let status_handle = {
        let worker = Arc::clone(&worker);
        let store = Arc::clone(&store);
        let scheduler = Arc::clone(&scheduler);
        let period = tokio::time::Duration::from_secs(config.status_report_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                let status = worker.get_status().await;
                info!("📊 Distribution Status Report:");
                if status.is_running {
                    info!("   Phase: {:?}", status.phase);
                    info!(
                        "   Enumerated: {} / {} accounts ({} pages)",
                        status.accounts_enumerated, status.expected_accounts, status.pages_fetched
                    );
                    info!(
                        "   Batches: {} / {} ({} counted, {} skipped)",
                        status.batches_completed,
                        status.batches_total,
                        status.accounts_counted,
                        status.accounts_skipped
                    );
                } else {
                    info!("   Idle, {} rebuild(s) completed", status.rebuilds_completed);
                }

                if let Some(last) = store.run_status() {
                    info!("   Last snapshot: {} ({:.1}s)", last.generated_at, last.execution_time);
                }
                info!("   Scheduler: {:?}", scheduler.state());
                if let Some(next) = scheduler.next_fire() {
                    info!("   Next rebuild: {}", next);
                }

                if status.errors_count > 0 {
                    warn!("   Errors: {} total", status.errors_count);
                    if let Some(last_error) = &status.last_error {
                        warn!("   Last Error: {}", last_error);
                    }
                }
            }
        })
    };

    info!("✅ Distribution Indexer is now running");
    info!("💡 Press Ctrl+C to gracefully shutdown");

    setup_shutdown_handler().await;

    // Graceful shutdown
    info!("🛑 Initiating graceful shutdown...");

    worker.request_exit("shutdown signal").await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler_handle.await {
        error!("❌ Scheduler task failed: {}", e);
    } else {
        info!("✅ Scheduler stopped");
    }

    if let Err(e) = bootstrap_handle.await {
        error!("❌ Bootstrap task failed: {}", e);
    }

    status_handle.abort();

    info!("🏁 Distribution Indexer shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn setup_shutdown_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

/// Print configuration help
fn print_config_help() {
    println!("🔧 Configuration Help:");
    println!();
    println!("Environment Variables:");
    println!("  DISTRIBUTION_NODE__RPC_URL                     - Ledger node RPC endpoint");
    println!("  DISTRIBUTION_STORAGE__DATA_DIR                 - Directory for snapshot artifacts");
    println!("  DISTRIBUTION_CLASSIFICATION__BATCH_SIZE        - Accounts per balance request");
    println!("  DISTRIBUTION_SCHEDULE__WEEKDAYS                - Comma separated, e.g. tue,fri");
    println!("  DISTRIBUTION_ENV                               - 'production' enables scheduled rebuilds");
    println!("  DISTRIBUTION_LOG_LEVEL                         - debug, info, warn, error");
    println!();
    println!("Examples:");
    println!("  export DISTRIBUTION_NODE__RPC_URL=http://127.0.0.1:7076");
    println!("  export DISTRIBUTION_ENV=production");
    println!();
    println!("Config Files (optional):");
    println!("  $DISTRIBUTION_CONFIG_FILE");
    println!("  ./distribution.toml");
    println!("  ./config/distribution.toml");
    println!("  /etc/distribution-indexer/config.toml");
    println!();
}
