use crate::amount::{decimal_string, AmountUtils, HISTOGRAM_BUCKETS};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Configuration for the distribution indexer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    pub node: NodeConfig,
    pub enumeration: EnumerationConfig,
    pub classification: ClassificationConfig,
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub retry: RetryConfig,
    pub status_report_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub rpc_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnumerationConfig {
    /// Lexical predecessor of the frontier chain, used as the first cursor
    pub anchor_account: String,
    pub page_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub history_count: u32,
    pub max_concurrent_history: usize,
    /// Inclusive bounds (unix seconds) of the mass-timestamp anomaly
    pub excluded_window_start: i64,
    pub excluded_window_end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Weekday names, e.g. `["tue", "fri"]`
    pub weekdays: Vec<String>,
    pub hour: u32,
    pub minute: u32,
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

/// One entry of a `frontiers` page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontierEntry {
    pub account: String,
    pub frontier: String,
}

/// Raw balance of one account as reported by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountBalance {
    pub account: String,
    pub balance: BigInt,
    pub pending: BigInt,
}

impl AccountBalance {
    /// Balance plus pending, in display units
    pub fn total(&self) -> BigDecimal {
        AmountUtils::raw_to_display(&(&self.balance + &self.pending))
    }
}

/// One entry of an account's recent history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Node-local arrival time in unix seconds; `None` when absent or zero
    pub local_timestamp: Option<i64>,
}

/// One wealth bucket of the distribution histogram
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub accounts: u64,
    #[serde(with = "decimal_string")]
    pub balance: BigDecimal,
}

/// Account counts and balance sums per order of magnitude
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionHistogram {
    buckets: Vec<HistogramBucket>,
}

impl Default for DistributionHistogram {
    fn default() -> Self {
        Self {
            buckets: vec![HistogramBucket::default(); HISTOGRAM_BUCKETS],
        }
    }
}

impl DistributionHistogram {
    pub fn buckets(&self) -> &[HistogramBucket] {
        &self.buckets
    }

    /// Add one account with the given display total to its bucket
    pub fn record(&mut self, total: &BigDecimal) -> usize {
        let index = AmountUtils::bucket_index(total);
        let bucket = &mut self.buckets[index];
        bucket.accounts += 1;
        bucket.balance = &bucket.balance + total;
        index
    }

    pub fn total_accounts(&self) -> u64 {
        self.buckets.iter().map(|bucket| bucket.accounts).sum()
    }

    pub fn total_balance(&self) -> BigDecimal {
        self.buckets
            .iter()
            .fold(BigDecimal::default(), |sum, bucket| sum + &bucket.balance)
    }

    /// Histograms loaded from disk must have the fixed bucket layout
    pub fn is_well_formed(&self) -> bool {
        self.buckets.len() == HISTOGRAM_BUCKETS
    }
}

/// Balance sums for one year, indexed by month (0-11). Untouched months are `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MonthlyFunds(Vec<Option<BigDecimal>>);

impl MonthlyFunds {
    pub fn add(&mut self, month0: usize, amount: &BigDecimal) {
        if self.0.len() <= month0 {
            self.0.resize(month0 + 1, None);
        }
        let cell = &mut self.0[month0];
        *cell = Some(match cell.take() {
            Some(existing) => existing + amount,
            None => amount.clone(),
        });
    }

    pub fn get(&self, month0: usize) -> Option<&BigDecimal> {
        self.0.get(month0).and_then(|cell| cell.as_ref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for MonthlyFunds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(
            self.0
                .iter()
                .map(|cell| cell.as_ref().map(AmountUtils::format_decimal)),
        )
    }
}

impl<'de> Deserialize<'de> for MonthlyFunds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
        if raw.len() > 12 {
            return Err(de::Error::custom("more than 12 months in a year"));
        }

        raw.iter()
            .map(|value| match value {
                serde_json::Value::Null => Ok(None),
                other => decimal_string::from_json(other)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid dormant amount: {}", other))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(MonthlyFunds)
    }
}

/// Balances keyed by the calendar month of their last genuine activity
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DormantFunds {
    years: BTreeMap<i32, MonthlyFunds>,
}

impl DormantFunds {
    pub fn add(&mut self, year: i32, month0: u32, amount: &BigDecimal) {
        self.years
            .entry(year)
            .or_default()
            .add(month0 as usize, amount);
    }

    pub fn get(&self, year: i32, month0: u32) -> Option<&BigDecimal> {
        self.years.get(&year)?.get(month0 as usize)
    }

    pub fn years(&self) -> impl Iterator<Item = (&i32, &MonthlyFunds)> {
        self.years.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }
}

/// What readers of the snapshot get back
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionData {
    pub distribution: DistributionHistogram,
    pub dormant_funds: DormantFunds,
}

/// Metadata about the last successful rebuild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    /// Wall-clock duration of the rebuild in seconds
    pub execution_time: f64,
    #[serde(rename = "date")]
    pub generated_at: DateTime<Utc>,
}

/// Phase of the rebuild currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildPhase {
    Idle,
    Enumerating,
    Classifying,
    Persisting,
}

/// Rebuild progress and health for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildStatus {
    pub phase: RebuildPhase,
    pub is_running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub expected_accounts: u64,
    pub accounts_enumerated: u64,
    pub pages_fetched: u64,
    pub batches_total: u64,
    pub batches_completed: u64,
    pub accounts_counted: u64,
    pub accounts_skipped: u64,
    pub rebuilds_completed: u64,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_execution_time_secs: Option<f64>,
    pub errors_count: u32,
    pub last_error: Option<String>,
}

impl Default for RebuildStatus {
    fn default() -> Self {
        Self {
            phase: RebuildPhase::Idle,
            is_running: false,
            started_at: None,
            expected_accounts: 0,
            accounts_enumerated: 0,
            pages_fetched: 0,
            batches_total: 0,
            batches_completed: 0,
            accounts_counted: 0,
            accounts_skipped: 0,
            rebuilds_completed: 0,
            last_completed_at: None,
            last_execution_time_secs: None,
            errors_count: 0,
            last_error: None,
        }
    }
}

/// Progress events emitted while a rebuild runs
#[derive(Debug, Clone)]
pub enum RebuildEvent {
    EnumerationStarted {
        expected: u64,
    },
    PageFetched {
        page: u64,
        collected: u64,
        expected: u64,
    },
    ClassificationStarted {
        batches: u64,
    },
    BatchClassified {
        batch: u64,
        total_batches: u64,
        counted: u64,
        skipped: u64,
    },
    AccountSkipped {
        account: String,
        reason: String,
    },
}
