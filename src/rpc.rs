use crate::amount::AmountUtils;
use crate::error::{DistributionError, Result};
use crate::types::{AccountBalance, FrontierEntry, HistoryEntry, NodeConfig};
use async_trait::async_trait;
use num_bigint::BigInt;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

/// Request/response view of the ledger node. Implementations do not retry;
/// retry policy belongs to callers.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Total number of accounts with a frontier
    async fn count(&self) -> Result<u64>;

    /// Up to `limit` frontier entries starting at `start`, in chain order
    async fn frontiers_page(&self, start: &str, limit: u64) -> Result<Vec<FrontierEntry>>;

    /// Balance and pending amounts for a batch of accounts
    async fn balances(&self, accounts: &[String]) -> Result<Vec<AccountBalance>>;

    /// Up to `limit` most recent history entries, newest first
    async fn recent_history(&self, account: &str, limit: u32) -> Result<Vec<HistoryEntry>>;
}

/// JSON-over-HTTP client for the node RPC endpoint
pub struct NodeRpcClient {
    http_client: reqwest::Client,
    rpc_url: String,
}

impl NodeRpcClient {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("distribution-indexer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DistributionError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            rpc_url: config.rpc_url.clone(),
        })
    }

    async fn call(&self, action: &str, mut params: Map<String, Value>) -> Result<Map<String, Value>> {
        params.insert("action".to_string(), Value::String(action.to_string()));
        debug!("RPC {} -> {}", action, self.rpc_url);

        let response = self
            .http_client
            .post(&self.rpc_url)
            .json(&params)
            .send()
            .await
            .map_err(|e| DistributionError::unavailable(action, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DistributionError::protocol(action, format!("HTTP status {}", status)));
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                DistributionError::unavailable(action, e)
            } else {
                DistributionError::protocol(action, format!("Failed to read response: {}", e))
            }
        })?;

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| DistributionError::protocol(action, format!("Invalid JSON: {}", e)))?;

        let Value::Object(body) = body else {
            return Err(DistributionError::protocol(action, "response is not a JSON object"));
        };

        if let Some(error) = body.get("error") {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(DistributionError::protocol(action, message));
        }

        Ok(body)
    }
}

#[async_trait]
impl LedgerRpc for NodeRpcClient {
    async fn count(&self) -> Result<u64> {
        let body = self.call("frontier_count", Map::new()).await?;
        parse_count(&body)
    }

    async fn frontiers_page(&self, start: &str, limit: u64) -> Result<Vec<FrontierEntry>> {
        let params = object(json!({ "account": start, "count": limit.to_string() }));
        let body = self.call("frontiers", params).await?;
        parse_frontiers(&body)
    }

    async fn balances(&self, accounts: &[String]) -> Result<Vec<AccountBalance>> {
        let params = object(json!({ "accounts": accounts }));
        let body = self.call("accounts_balances", params).await?;
        parse_balances(&body)
    }

    async fn recent_history(&self, account: &str, limit: u32) -> Result<Vec<HistoryEntry>> {
        let params = object(json!({ "account": account, "count": limit.to_string() }));
        let body = self.call("account_history", params).await?;
        parse_history(&body)
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn field<'a>(action: &str, body: &'a Map<String, Value>, name: &str) -> Result<&'a Value> {
    body.get(name)
        .ok_or_else(|| DistributionError::protocol(action, format!("missing field `{}`", name)))
}

/// The node encodes most integers as strings; accept both.
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn raw_amount(action: &str, account: &str, value: Option<&Value>) -> Result<BigInt> {
    let parsed = match value {
        Some(Value::String(s)) => AmountUtils::parse_raw(s),
        Some(Value::Number(n)) => AmountUtils::parse_raw(&n.to_string()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DistributionError::protocol(action, format!("invalid or missing amount for {}", account))
    })
}

fn parse_count(body: &Map<String, Value>) -> Result<u64> {
    let count = field("frontier_count", body, "count")?;
    as_u64(count).ok_or_else(|| DistributionError::protocol("frontier_count", format!("invalid count: {}", count)))
}

fn parse_frontiers(body: &Map<String, Value>) -> Result<Vec<FrontierEntry>> {
    match field("frontiers", body, "frontiers")? {
        Value::Object(frontiers) => frontiers
            .iter()
            .map(|(account, frontier)| {
                let frontier = frontier.as_str().ok_or_else(|| {
                    DistributionError::protocol("frontiers", format!("invalid frontier for {}", account))
                })?;
                Ok(FrontierEntry {
                    account: account.clone(),
                    frontier: frontier.to_string(),
                })
            })
            .collect(),
        // An empty page comes back as an empty string
        Value::String(s) if s.is_empty() => Ok(Vec::new()),
        other => Err(DistributionError::protocol(
            "frontiers",
            format!("unexpected frontiers payload: {}", other),
        )),
    }
}

fn parse_balances(body: &Map<String, Value>) -> Result<Vec<AccountBalance>> {
    const ACTION: &str = "accounts_balances";

    let Value::Object(balances) = field(ACTION, body, "balances")? else {
        return Err(DistributionError::protocol(ACTION, "`balances` is not an object"));
    };

    balances
        .iter()
        .map(|(account, entry)| {
            let balance = raw_amount(ACTION, account, entry.get("balance"))?;
            // Newer nodes renamed pending to receivable
            let pending = raw_amount(
                ACTION,
                account,
                entry.get("pending").or_else(|| entry.get("receivable")),
            )?;
            Ok(AccountBalance {
                account: account.clone(),
                balance,
                pending,
            })
        })
        .collect()
}

fn parse_history(body: &Map<String, Value>) -> Result<Vec<HistoryEntry>> {
    let history = match field("account_history", body, "history")? {
        // An account without blocks comes back as an empty string
        Value::String(s) if s.is_empty() => return Ok(Vec::new()),
        Value::Array(entries) => entries,
        other => {
            return Err(DistributionError::protocol(
                "account_history",
                format!("unexpected history payload: {}", other),
            ))
        }
    };

    Ok(history
        .iter()
        .map(|entry| HistoryEntry {
            local_timestamp: entry
                .get("local_timestamp")
                .and_then(as_u64)
                .filter(|ts| *ts > 0)
                .and_then(|ts| i64::try_from(ts).ok()),
        })
        .collect())
}
