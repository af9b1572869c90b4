//! Occupancy snapshot

use std::collections::BTreeMap;

use serde::Serialize;

/// Slot counts for one account. Connecting slots count as in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub push: usize,
}

/// Point-in-time view of the whole pool. For observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_slots: usize,
    pub accounts_with_slots: usize,
    pub per_account: BTreeMap<String, AccountStats>,
}

impl PoolStats {
    pub(crate) fn record(&mut self, account: &str, stats: AccountStats) {
        if stats.total == 0 {
            return;
        }
        self.total_slots += stats.total;
        self.accounts_with_slots += 1;
        self.per_account.insert(account.to_owned(), stats);
    }

    /// Counts for one account; zeroes when it has no slots.
    pub fn account(&self, account: &str) -> AccountStats {
        self.per_account.get(account).copied().unwrap_or_default()
    }

    pub fn idle(&self) -> usize {
        self.per_account.values().map(|s| s.idle).sum()
    }

    pub fn in_use(&self) -> usize {
        self.per_account.values().map(|s| s.in_use).sum()
    }

    pub fn push(&self) -> usize {
        self.per_account.values().map(|s| s.push).sum()
    }
}
