use crate::error::{DistributionError, Result};
use crate::rpc::LedgerRpc;
use crate::types::{AccountBalance, FrontierEntry, HistoryEntry};
use async_trait::async_trait;
use num_bigint::BigInt;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct MockAccount {
    id: String,
    balance: BigInt,
    pending: BigInt,
    history: Vec<i64>,
}

/// In-memory ledger with accounts kept in lexical order
#[derive(Default)]
pub struct MockLedger {
    accounts: Vec<MockAccount>,
    extra_count: u64,
    stall_after: Option<usize>,
    fail_balances: bool,
    failing_history: HashSet<String>,
    count_gate: Option<Arc<Notify>>,
    frontier_requests: Arc<Mutex<Vec<(String, u64)>>>,
}

impl MockLedger {
    /// Sorts before every generated account id
    pub const ANCHOR: &'static str = "nano_0000000000";

    pub fn new() -> Self {
        Self::default()
    }

    /// `n` accounts holding one display unit each, last active 2020-01-01
    pub fn with_accounts(n: usize) -> Self {
        (1..=n).fold(Self::new(), |ledger, i| {
            ledger.account(
                &format!("nano_{:010}", i),
                "1000000000000000000000000000000",
                "0",
                vec![1_577_836_800],
            )
        })
    }

    pub fn account(mut self, id: &str, balance: &str, pending: &str, history: Vec<i64>) -> Self {
        self.accounts.push(MockAccount {
            id: id.to_string(),
            balance: BigInt::from_str(balance).unwrap(),
            pending: BigInt::from_str(pending).unwrap(),
            history,
        });
        self.accounts.sort_by(|a, b| a.id.cmp(&b.id));
        self
    }

    /// Report more accounts than the chain holds
    pub fn overstate_count(mut self, extra: u64) -> Self {
        self.extra_count = extra;
        self
    }

    /// Once `served` accounts have been handed out, pages only echo the cursor
    pub fn stall_after(mut self, served: usize) -> Self {
        self.stall_after = Some(served);
        self
    }

    pub fn fail_balances(mut self) -> Self {
        self.fail_balances = true;
        self
    }

    pub fn fail_history_for(mut self, id: &str) -> Self {
        self.failing_history.insert(id.to_string());
        self
    }

    /// `count()` waits for this to be notified
    pub fn gate_count(mut self, gate: Arc<Notify>) -> Self {
        self.count_gate = Some(gate);
        self
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.id.clone()).collect()
    }

    pub fn frontier_requests(&self) -> Arc<Mutex<Vec<(String, u64)>>> {
        Arc::clone(&self.frontier_requests)
    }
}

#[async_trait]
impl LedgerRpc for MockLedger {
    async fn count(&self) -> Result<u64> {
        if let Some(gate) = &self.count_gate {
            gate.notified().await;
        }
        Ok(self.accounts.len() as u64 + self.extra_count)
    }

    async fn frontiers_page(&self, start: &str, limit: u64) -> Result<Vec<FrontierEntry>> {
        self.frontier_requests
            .lock()
            .unwrap()
            .push((start.to_string(), limit));

        let position = self.accounts.partition_point(|a| a.id.as_str() < start);
        if let Some(served) = self.stall_after {
            if position >= served {
                return Ok(self.accounts[position..]
                    .iter()
                    .take(1)
                    .map(|a| FrontierEntry {
                        account: a.id.clone(),
                        frontier: format!("{}_frontier", a.id),
                    })
                    .collect());
            }
        }

        Ok(self.accounts[position..]
            .iter()
            .take(limit as usize)
            .map(|a| FrontierEntry {
                account: a.id.clone(),
                frontier: format!("{}_frontier", a.id),
            })
            .collect())
    }

    async fn balances(&self, accounts: &[String]) -> Result<Vec<AccountBalance>> {
        if self.fail_balances {
            return Err(DistributionError::unavailable("accounts_balances", "connection reset"));
        }
        Ok(accounts
            .iter()
            .filter_map(|id| self.accounts.iter().find(|a| &a.id == id))
            .map(|a| AccountBalance {
                account: a.id.clone(),
                balance: a.balance.clone(),
                pending: a.pending.clone(),
            })
            .collect())
    }

    async fn recent_history(&self, account: &str, limit: u32) -> Result<Vec<HistoryEntry>> {
        if self.failing_history.contains(account) {
            return Err(DistributionError::protocol("account_history", "Account not found"));
        }
        let entry = self
            .accounts
            .iter()
            .find(|a| a.id == account)
            .ok_or_else(|| DistributionError::protocol("account_history", "Account not found"))?;
        Ok(entry
            .history
            .iter()
            .take(limit as usize)
            .map(|ts| HistoryEntry {
                local_timestamp: Some(*ts),
            })
            .collect())
    }
}
