//! Background reaper
//!
//! Every `reap_interval` the reaper walks all account groups, pulls idle
//! slots that sat unused past `idle_timeout` or outlived `max_session_age`
//! out under the group lock, and logs them out after the lock is released.
//! In-use slots are never touched, and Push slots younger than
//! `push_grace_period` are left alone.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::pool::{Shared, close_session};
use crate::registry::{CloseReason, Purpose, Slot};

/// Spawn the periodic sweep. The task runs until aborted.
pub(crate) fn spawn_reaper(shared: Arc<Shared>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(shared.config.reap_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and there is nothing to reap yet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let closed = sweep(&shared).await;
            if closed > 0 {
                info!(closed, "reaper closed expired sessions");
            }
        }
    })
}

/// Why an idle slot should be closed at `now`, if at all.
pub(crate) fn expiry(slot: &Slot, now: Instant, config: &PoolConfig) -> Option<CloseReason> {
    let age = now.saturating_duration_since(slot.created_at);
    if slot.purpose == Purpose::Push && age < config.push_grace_period {
        return None;
    }
    if age > config.max_session_age {
        return Some(CloseReason::MaxAge);
    }
    if now.saturating_duration_since(slot.last_released_at) > config.idle_timeout {
        return Some(CloseReason::IdleTimeout);
    }
    None
}

/// One pass over every group. Returns the number of sessions closed.
pub(crate) async fn sweep(shared: &Shared) -> usize {
    let now = Instant::now();
    let mut closed = 0;

    for (account, group) in shared.registry.groups() {
        let expired = group
            .lock()
            .take_idle_where(|slot| expiry(slot, now, &shared.config));
        if expired.is_empty() {
            continue;
        }
        group.notify_waiters();
        for (slot_id, session, reason) in expired {
            close_session(session, &account, slot_id, reason).await;
            closed += 1;
        }
    }

    let pruned = shared.registry.prune_empty();
    if pruned > 0 {
        debug!(pruned, "removed empty account groups");
    }
    closed
}
