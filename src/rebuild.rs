use crate::classifier::BalanceClassifier;
use crate::enumerator::AccountEnumerator;
use crate::error::{DistributionError, Result};
use crate::retry::RetryPolicy;
use crate::rpc::LedgerRpc;
use crate::store::SnapshotStore;
use crate::types::*;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Optional channel for progress events
pub type EventSender = Option<mpsc::UnboundedSender<RebuildEvent>>;

pub(crate) fn emit(events: &EventSender, event: RebuildEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Cooperative cancellation checked between pages and batches
#[derive(Debug, Clone, Default)]
pub struct ExitFlag {
    reason: Arc<RwLock<Option<String>>>,
}

impl ExitFlag {
    pub async fn request(&self, reason: &str) {
        *self.reason.write().await = Some(reason.to_string());
    }

    pub async fn check(&self) -> Result<()> {
        match self.reason.read().await.as_ref() {
            Some(reason) => Err(DistributionError::Cancelled {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Runs one full rebuild: enumerate, classify, persist.
pub struct DistributionWorker {
    store: Arc<SnapshotStore>,
    enumerator: AccountEnumerator,
    classifier: BalanceClassifier,
    status: Arc<RwLock<RebuildStatus>>,
    exit: ExitFlag,
    event_tx: mpsc::UnboundedSender<RebuildEvent>,
}

impl DistributionWorker {
    /// Create a worker. Must be called inside a tokio runtime; progress events
    /// are folded into the status by a background task.
    pub fn new(config: &IndexerConfig, rpc: Arc<dyn LedgerRpc>, store: Arc<SnapshotStore>) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        let enumerator = AccountEnumerator::new(Arc::clone(&rpc), &config.enumeration, retry.clone());
        let classifier = BalanceClassifier::new(rpc, &config.classification, retry);

        let status = Arc::new(RwLock::new(RebuildStatus::default()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let event_status = Arc::clone(&status);
        tokio::spawn(async move {
            Self::event_processing_task(event_rx, event_status).await;
        });

        Self {
            store,
            enumerator,
            classifier,
            status,
            exit: ExitFlag::default(),
            event_tx,
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Current rebuild status
    pub async fn get_status(&self) -> RebuildStatus {
        self.status.read().await.clone()
    }

    /// Ask the running rebuild (and any later one) to stop at the next checkpoint
    pub async fn request_exit(&self, reason: &str) {
        info!("Exit requested: {}", reason);
        self.exit.request(reason).await;
    }

    /// Full rebuild. On failure nothing is written and the previous generation
    /// stays in place.
    pub async fn run_rebuild(&self) -> Result<RunStatus> {
        self.exit.check().await?;

        let started = std::time::Instant::now();
        info!("🚀 Distribution rebuild started");
        {
            let mut status = self.status.write().await;
            let completed = status.rebuilds_completed;
            let errors = status.errors_count;
            let last_error = status.last_error.take();
            let last_completed_at = status.last_completed_at;
            let last_execution = status.last_execution_time_secs;
            *status = RebuildStatus {
                phase: RebuildPhase::Enumerating,
                is_running: true,
                started_at: Some(Utc::now()),
                rebuilds_completed: completed,
                errors_count: errors,
                last_error,
                last_completed_at,
                last_execution_time_secs: last_execution,
                ..RebuildStatus::default()
            };
        }

        let result = self.rebuild_generation(started).await;

        {
            let mut status = self.status.write().await;
            status.phase = RebuildPhase::Idle;
            status.is_running = false;
            match &result {
                Ok(run_status) => {
                    status.rebuilds_completed += 1;
                    status.last_completed_at = Some(run_status.generated_at);
                    status.last_execution_time_secs = Some(run_status.execution_time);
                }
                Err(e) => {
                    status.errors_count += 1;
                    status.last_error = Some(e.to_string());
                }
            }
        }

        match &result {
            Ok(run_status) => info!(
                "🏁 Distribution rebuild finished in {:.1}s",
                run_status.execution_time
            ),
            Err(e) => error!("❌ Distribution rebuild failed: {}", e),
        }
        result
    }

    async fn rebuild_generation(&self, started: std::time::Instant) -> Result<RunStatus> {
        let events = Some(self.event_tx.clone());

        let accounts = self.enumerator.enumerate(&self.exit, &events).await?;

        let store = Arc::clone(&self.store);
        let snapshot = accounts.clone();
        match tokio::task::spawn_blocking(move || store.save_accounts(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to cache account list: {}", e),
            Err(e) => warn!("Account list cache task failed: {}", e),
        }

        self.set_phase(RebuildPhase::Classifying).await;
        let outcome = self.classifier.classify(&accounts, &self.exit, &events).await?;
        debug!(
            "Histogram holds {} accounts, {} dormant-fund years",
            outcome.data.distribution.total_accounts(),
            outcome.data.dormant_funds.years().count()
        );

        self.set_phase(RebuildPhase::Persisting).await;
        let run_status = RunStatus {
            execution_time: started.elapsed().as_secs_f64(),
            generated_at: Utc::now(),
        };

        let store = Arc::clone(&self.store);
        let data = outcome.data;
        let persisted = run_status.clone();
        tokio::task::spawn_blocking(move || store.persist_generation(&data, &persisted))
            .await
            .map_err(|e| DistributionError::Other(format!("Persist task failed: {}", e)))??;

        Ok(run_status)
    }

    async fn set_phase(&self, phase: RebuildPhase) {
        self.status.write().await.phase = phase;
    }

    async fn event_processing_task(
        mut event_rx: mpsc::UnboundedReceiver<RebuildEvent>,
        status: Arc<RwLock<RebuildStatus>>,
    ) {
        while let Some(event) = event_rx.recv().await {
            let mut status = status.write().await;
            match event {
                RebuildEvent::EnumerationStarted { expected } => {
                    status.expected_accounts = expected;
                }
                RebuildEvent::PageFetched { page, collected, .. } => {
                    status.pages_fetched = page;
                    status.accounts_enumerated = collected;
                }
                RebuildEvent::ClassificationStarted { batches } => {
                    status.batches_total = batches;
                }
                RebuildEvent::BatchClassified {
                    batch,
                    total_batches,
                    counted,
                    skipped,
                } => {
                    status.batches_completed = batch;
                    status.batches_total = total_batches;
                    status.accounts_counted += counted;
                    status.accounts_skipped += skipped;
                }
                RebuildEvent::AccountSkipped { account, reason } => {
                    debug!("Account {} skipped: {}", account, reason);
                }
            }
        }
    }
}
