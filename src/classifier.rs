use crate::amount::AmountUtils;
use crate::error::Result;
use crate::rebuild::{emit, EventSender, ExitFlag};
use crate::retry::RetryPolicy;
use crate::rpc::LedgerRpc;
use crate::types::{
    AccountBalance, ClassificationConfig, DistributionData, DistributionHistogram, DormantFunds,
    HistoryEntry, RebuildEvent,
};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use futures::{stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timestamps inside this interval belong to a network-wide mass-timestamp
/// anomaly and do not count as activity. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExclusionWindow {
    pub start: i64,
    pub end: i64,
}

impl ExclusionWindow {
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

/// Time of the first history entry that is real activity, if any
pub fn last_genuine_activity(history: &[HistoryEntry], window: &ExclusionWindow) -> Option<DateTime<Utc>> {
    history
        .iter()
        .filter_map(|entry| entry.local_timestamp)
        .find(|ts| !window.contains(*ts))
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

/// In-memory accumulation for one rebuild
#[derive(Debug, Default)]
pub struct DistributionAccumulator {
    histogram: DistributionHistogram,
    dormant_funds: DormantFunds,
    accounts_counted: u64,
    below_threshold: u64,
    no_genuine_activity: u64,
    accounts_skipped: u64,
}

impl DistributionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one account. Returns false when the account was left out: its
    /// total is below the minimum, or it has no activity outside the window.
    pub fn record(&mut self, total: &BigDecimal, last_activity: Option<DateTime<Utc>>) -> bool {
        if *total < AmountUtils::min_total() {
            self.below_threshold += 1;
            return false;
        }

        let Some(activity) = last_activity else {
            self.no_genuine_activity += 1;
            return false;
        };

        self.dormant_funds.add(activity.year(), activity.month0(), total);
        self.histogram.record(total);
        self.accounts_counted += 1;
        true
    }

    /// An account whose lookup failed and which contributes nowhere
    pub fn skip(&mut self) {
        self.accounts_skipped += 1;
    }

    pub fn histogram(&self) -> &DistributionHistogram {
        &self.histogram
    }

    pub fn dormant_funds(&self) -> &DormantFunds {
        &self.dormant_funds
    }

    pub fn accounts_counted(&self) -> u64 {
        self.accounts_counted
    }

    pub fn accounts_skipped(&self) -> u64 {
        self.accounts_skipped
    }

    pub fn finish(self) -> ClassificationOutcome {
        ClassificationOutcome {
            data: DistributionData {
                distribution: self.histogram,
                dormant_funds: self.dormant_funds,
            },
            accounts_counted: self.accounts_counted,
            below_threshold: self.below_threshold,
            no_genuine_activity: self.no_genuine_activity,
            accounts_skipped: self.accounts_skipped,
        }
    }
}

/// Result of classifying a full account list
#[derive(Debug, Clone)]
pub struct ClassificationOutcome {
    pub data: DistributionData,
    pub accounts_counted: u64,
    pub below_threshold: u64,
    pub no_genuine_activity: u64,
    pub accounts_skipped: u64,
}

/// Fetches balances and history in throttled batches and builds the histogram
/// and dormant funds map.
pub struct BalanceClassifier {
    rpc: Arc<dyn LedgerRpc>,
    retry: RetryPolicy,
    batch_size: usize,
    batch_delay: Duration,
    history_count: u32,
    max_concurrent_history: usize,
    window: ExclusionWindow,
}

impl BalanceClassifier {
    pub fn new(rpc: Arc<dyn LedgerRpc>, config: &ClassificationConfig, retry: RetryPolicy) -> Self {
        Self {
            rpc,
            retry,
            batch_size: config.batch_size.max(1),
            batch_delay: Duration::from_millis(config.batch_delay_ms),
            history_count: config.history_count,
            max_concurrent_history: config.max_concurrent_history.max(1),
            window: ExclusionWindow {
                start: config.excluded_window_start,
                end: config.excluded_window_end,
            },
        }
    }

    pub async fn classify(
        &self,
        accounts: &[String],
        exit: &ExitFlag,
        events: &EventSender,
    ) -> Result<ClassificationOutcome> {
        let total_batches = accounts.len().div_ceil(self.batch_size) as u64;
        info!(
            "💰 Classifying {} accounts in {} batch(es) of {}",
            accounts.len(),
            total_batches,
            self.batch_size
        );
        emit(events, RebuildEvent::ClassificationStarted { batches: total_batches });

        let mut accumulator = DistributionAccumulator::new();

        for (index, batch) in accounts.chunks(self.batch_size).enumerate() {
            exit.check().await?;

            let batch_number = index as u64 + 1;
            let counted_before = accumulator.accounts_counted();
            let skipped_before = accumulator.accounts_skipped();

            // A failed balance fetch aborts the rebuild
            let balances = self
                .retry
                .retry_async("accounts_balances", || self.rpc.balances(batch))
                .await?;

            debug!(
                "Processing balances batch {} of {} ({} balances)",
                batch_number,
                total_batches,
                balances.len()
            );

            self.classify_batch(balances, &mut accumulator, events).await;

            emit(
                events,
                RebuildEvent::BatchClassified {
                    batch: batch_number,
                    total_batches,
                    counted: accumulator.accounts_counted() - counted_before,
                    skipped: accumulator.accounts_skipped() - skipped_before,
                },
            );

            if batch_number < total_batches && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        let outcome = accumulator.finish();
        info!(
            "✅ Classification complete: {} counted, {} below minimum, {} without genuine activity, {} skipped",
            outcome.accounts_counted,
            outcome.below_threshold,
            outcome.no_genuine_activity,
            outcome.accounts_skipped
        );
        Ok(outcome)
    }

    async fn classify_batch(
        &self,
        balances: Vec<AccountBalance>,
        accumulator: &mut DistributionAccumulator,
        events: &EventSender,
    ) {
        let min_total = AmountUtils::min_total();
        let mut candidates = Vec::with_capacity(balances.len());
        for balance in balances {
            let total = balance.total();
            if total < min_total {
                accumulator.record(&total, None);
            } else {
                candidates.push((balance.account, total));
            }
        }

        let results: Vec<_> = stream::iter(candidates)
            .map(|(account, total)| async move {
                let history = self
                    .retry
                    .retry_async("account_history", || {
                        self.rpc.recent_history(&account, self.history_count)
                    })
                    .await;
                (account, total, history)
            })
            .buffer_unordered(self.max_concurrent_history)
            .collect()
            .await;

        for (account, total, history) in results {
            match history {
                Ok(history) => {
                    let activity = last_genuine_activity(&history, &self.window);
                    if activity.is_none() {
                        debug!("No genuine activity for {}, left out of the snapshot", account);
                    }
                    accumulator.record(&total, activity);
                }
                Err(e) => {
                    warn!("Skipping account {}: history lookup failed: {}", account, e);
                    accumulator.skip();
                    emit(
                        events,
                        RebuildEvent::AccountSkipped {
                            account,
                            reason: e.to_string(),
                        },
                    );
                }
            }
        }
    }
}
