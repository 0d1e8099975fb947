use crate::error::{DistributionError, Result};
use crate::rebuild::{emit, EventSender, ExitFlag};
use crate::retry::RetryPolicy;
use crate::rpc::LedgerRpc;
use crate::types::{EnumerationConfig, RebuildEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Walks the frontier chain from the anchor account and collects every account.
pub struct AccountEnumerator {
    rpc: Arc<dyn LedgerRpc>,
    retry: RetryPolicy,
    anchor_account: String,
    page_size: u64,
}

impl AccountEnumerator {
    pub fn new(rpc: Arc<dyn LedgerRpc>, config: &EnumerationConfig, retry: RetryPolicy) -> Self {
        Self {
            rpc,
            retry,
            anchor_account: config.anchor_account.clone(),
            page_size: config.page_size.max(1),
        }
    }

    /// Collect all accounts, deduplicated, in frontier-chain order.
    ///
    /// Fails with `EnumerationStalled` when a page makes no progress or the
    /// page budget for the expected count is exhausted.
    pub async fn enumerate(&self, exit: &ExitFlag, events: &EventSender) -> Result<Vec<String>> {
        let expected = self
            .retry
            .retry_async("frontier_count", || self.rpc.count())
            .await?;

        info!("🔍 Enumerating {} accounts (page size {})", expected, self.page_size);
        emit(events, RebuildEvent::EnumerationStarted { expected });

        let max_pages = Self::max_pages(expected, self.page_size);
        let mut accounts: Vec<String> = Vec::with_capacity(expected.min(10_000_000) as usize);
        let mut seen: HashSet<String> = HashSet::with_capacity(accounts.capacity());
        let mut cursor = self.anchor_account.clone();
        let mut pages = 0u64;

        while (accounts.len() as u64) < expected {
            exit.check().await?;

            if pages >= max_pages {
                warn!("Page budget of {} exhausted at cursor {}", max_pages, cursor);
                return Err(self.stalled(&cursor, accounts.len(), expected));
            }

            let remaining = expected - accounts.len() as u64;
            // One extra entry because the page starts with the cursor itself
            let requested = remaining.min(self.page_size) + 1;

            let page = self
                .retry
                .retry_async("frontiers", || self.rpc.frontiers_page(&cursor, requested))
                .await?;
            pages += 1;

            let returned = page.len() as u64;
            let last_entry = page.last().cloned();
            let mut added = 0u64;
            for (index, entry) in page.into_iter().enumerate() {
                if index == 0 && entry.account == cursor {
                    continue;
                }
                if seen.insert(entry.account.clone()) {
                    accounts.push(entry.account);
                    added += 1;
                }
            }

            if let Some(last) = &last_entry {
                debug!(
                    "Frontier page {} from {}: {} returned, {} new ({} / {}), last {} at head {}",
                    pages,
                    cursor,
                    returned,
                    added,
                    accounts.len(),
                    expected,
                    last.account,
                    last.frontier
                );
            }
            emit(
                events,
                RebuildEvent::PageFetched {
                    page: pages,
                    collected: accounts.len() as u64,
                    expected,
                },
            );

            if added == 0 {
                return Err(self.stalled(&cursor, accounts.len(), expected));
            }

            if let Some(last) = last_entry {
                cursor = last.account;
            }

            // A short page means the chain is exhausted
            if returned < requested && (accounts.len() as u64) < expected {
                warn!(
                    "Frontier chain ended early: {} of {} expected accounts",
                    accounts.len(),
                    expected
                );
                return Err(self.stalled(&cursor, accounts.len(), expected));
            }
        }

        info!("✅ Enumerated {} accounts in {} page(s)", accounts.len(), pages);
        Ok(accounts)
    }

    fn stalled(&self, cursor: &str, collected: usize, expected: u64) -> DistributionError {
        DistributionError::EnumerationStalled {
            cursor: cursor.to_string(),
            collected: collected as u64,
            expected,
        }
    }

    /// Upper bound on page requests for a crawl of `expected` accounts
    fn max_pages(expected: u64, page_size: u64) -> u64 {
        2 * expected.div_ceil(page_size) + 2
    }
}
