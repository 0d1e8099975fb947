use async_trait::async_trait;
use distribution_indexer::{
    AccountBalance, DistributionError, FrontierEntry, HistoryEntry, IndexerConfig, LedgerRpc, Result,
};
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

pub const ANCHOR: &str = "nano_0";

/// Raw units for a display amount with up to 30 fractional digits
pub fn raw(display: &str) -> String {
    let (int, frac) = display.split_once('.').unwrap_or((display, ""));
    let digits = format!("{}{:0<30}", int, frac);
    BigInt::from_str(&digits).unwrap().to_string()
}

struct Account {
    balance: BigInt,
    pending: BigInt,
    history: Vec<i64>,
}

/// Ledger held in a sorted map, so frontier pages follow lexical order
#[derive(Default)]
pub struct InMemoryLedger {
    accounts: BTreeMap<String, Account>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, id: &str, balance_display: &str, history: &[i64]) -> Self {
        self.accounts.insert(
            id.to_string(),
            Account {
                balance: BigInt::from_str(&raw(balance_display)).unwrap(),
                pending: BigInt::from(0),
                history: history.to_vec(),
            },
        );
        self
    }

    pub fn with_pending(mut self, id: &str, pending_display: &str) -> Self {
        if let Some(account) = self.accounts.get_mut(id) {
            account.pending = BigInt::from_str(&raw(pending_display)).unwrap();
        }
        self
    }

    /// Every call fails as if the node were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self, action: &str) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DistributionError::unavailable(action, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerRpc for InMemoryLedger {
    async fn count(&self) -> Result<u64> {
        self.check("frontier_count")?;
        Ok(self.accounts.len() as u64)
    }

    async fn frontiers_page(&self, start: &str, limit: u64) -> Result<Vec<FrontierEntry>> {
        self.check("frontiers")?;
        Ok(self
            .accounts
            .range(start.to_string()..)
            .take(limit as usize)
            .map(|(id, _)| FrontierEntry {
                account: id.clone(),
                frontier: format!("{}-head", id),
            })
            .collect())
    }

    async fn balances(&self, accounts: &[String]) -> Result<Vec<AccountBalance>> {
        self.check("accounts_balances")?;
        Ok(accounts
            .iter()
            .filter_map(|id| {
                self.accounts.get(id).map(|account| AccountBalance {
                    account: id.clone(),
                    balance: account.balance.clone(),
                    pending: account.pending.clone(),
                })
            })
            .collect())
    }

    async fn recent_history(&self, account: &str, limit: u32) -> Result<Vec<HistoryEntry>> {
        self.check("account_history")?;
        let entry = self
            .accounts
            .get(account)
            .ok_or_else(|| DistributionError::protocol("account_history", "Account not found"))?;
        Ok(entry
            .history
            .iter()
            .take(limit as usize)
            .map(|ts| HistoryEntry {
                local_timestamp: if *ts == 0 { None } else { Some(*ts) },
            })
            .collect())
    }
}

/// Config pointed at `data_dir` with no throttling and no retries
pub fn test_config(data_dir: &Path) -> IndexerConfig {
    let mut config = IndexerConfig::default();
    config.storage.data_dir = data_dir.to_string_lossy().to_string();
    config.enumeration.anchor_account = ANCHOR.to_string();
    config.enumeration.page_size = 2;
    config.classification.batch_size = 2;
    config.classification.batch_delay_ms = 0;
    config.retry.max_attempts = 1;
    config
}
