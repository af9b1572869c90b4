//! Slot registry
//!
//! Account groups keyed by account. Each group owns its slots behind its own
//! mutex plus a `Notify` that fires whenever a slot goes idle or disappears,
//! which is what saturated acquisitions wait on. The registry-level lock is
//! only taken to find, add, or prune groups.
//!
//! Lock order is always registry, then group. Nothing here does I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use imap_session::Session;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;

use crate::stats::AccountStats;

pub type SlotId = u64;

/// What a slot is for.
///
/// Transient slots serve one command batch and are reused afterwards. Push
/// slots hold a long-lived IDLE channel and are never handed to a second
/// caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Transient,
    Push,
}

impl Purpose {
    pub fn label(&self) -> &'static str {
        match self {
            Purpose::Transient => "transient",
            Purpose::Push => "push",
        }
    }
}

/// Why a session was closed. Used as a log field and metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    MaxAge,
    Evicted,
    Unusable,
    Discarded,
    Shutdown,
    Orphaned,
    /// A Push lease came back; its session is never handed out again.
    PushEnded,
}

impl CloseReason {
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::MaxAge => "max_age",
            CloseReason::Evicted => "evicted",
            CloseReason::Unusable => "unusable",
            CloseReason::Discarded => "discarded",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Orphaned => "orphaned",
            CloseReason::PushEnded => "push_ended",
        }
    }
}

pub(crate) enum SlotState {
    /// Reserved; the session is being opened outside the lock.
    Connecting,
    /// Lent to exactly one caller.
    InUse,
    Idle(Box<dyn Session>),
}

pub(crate) struct Slot {
    pub id: SlotId,
    pub purpose: Purpose,
    pub state: SlotState,
    pub created_at: Instant,
    pub last_released_at: Instant,
}

impl Slot {
    pub fn is_idle(&self) -> bool {
        matches!(self.state, SlotState::Idle(_))
    }

    pub fn candidate(&self) -> Candidate {
        Candidate {
            id: self.id,
            purpose: self.purpose,
            idle: self.is_idle(),
            last_released_at: self.last_released_at,
        }
    }
}

/// Plain view of a slot for victim selection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub id: SlotId,
    pub purpose: Purpose,
    pub idle: bool,
    pub last_released_at: Instant,
}

/// An idle Transient slot just switched to InUse, with its session.
pub(crate) struct Reused {
    pub slot_id: SlotId,
    pub session: Box<dyn Session>,
    pub created_at: Instant,
}

/// All slots of one account.
#[derive(Default)]
pub(crate) struct Slots {
    slots: Vec<Slot>,
}

impl Slots {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Take the most recently released idle Transient slot and mark it InUse.
    pub fn take_reusable(&mut self, now: Instant) -> Option<Reused> {
        let slot = self
            .slots
            .iter_mut()
            .filter(|s| s.purpose == Purpose::Transient && s.is_idle())
            .max_by_key(|s| s.last_released_at)?;
        let SlotState::Idle(session) = std::mem::replace(&mut slot.state, SlotState::InUse) else {
            return None;
        };
        slot.last_released_at = now;
        Some(Reused {
            slot_id: slot.id,
            session,
            created_at: slot.created_at,
        })
    }

    pub fn reserve(&mut self, id: SlotId, purpose: Purpose, now: Instant) {
        self.slots.push(Slot {
            id,
            purpose,
            state: SlotState::Connecting,
            created_at: now,
            last_released_at: now,
        });
    }

    /// Connecting → InUse. False if the reservation is gone.
    pub fn activate(&mut self, id: SlotId) -> bool {
        match self.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) if matches!(slot.state, SlotState::Connecting) => {
                slot.state = SlotState::InUse;
                true
            }
            _ => false,
        }
    }

    /// InUse → Idle. Hands the session back if the slot is unknown or not in
    /// use, so a stray release can never overwrite a live idle session.
    pub fn mark_idle(
        &mut self,
        id: SlotId,
        session: Box<dyn Session>,
        now: Instant,
    ) -> std::result::Result<(), Box<dyn Session>> {
        match self.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) if matches!(slot.state, SlotState::InUse) => {
                slot.state = SlotState::Idle(session);
                slot.last_released_at = now;
                Ok(())
            }
            _ => Err(session),
        }
    }

    pub fn remove(&mut self, id: SlotId) -> Option<Slot> {
        let idx = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(idx))
    }

    /// Remove an idle slot and return its session.
    pub fn remove_idle(&mut self, id: SlotId) -> Option<Box<dyn Session>> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.id == id && s.is_idle())?;
        match self.slots.remove(idx).state {
            SlotState::Idle(session) => Some(session),
            _ => None,
        }
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        self.slots.iter().map(Slot::candidate).collect()
    }

    /// Remove every idle slot for which `verdict` returns a reason.
    pub fn take_idle_where<R>(
        &mut self,
        mut verdict: impl FnMut(&Slot) -> Option<R>,
    ) -> Vec<(SlotId, Box<dyn Session>, R)> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.slots.len() {
            let reason = if self.slots[i].is_idle() {
                verdict(&self.slots[i])
            } else {
                None
            };
            let Some(reason) = reason else {
                i += 1;
                continue;
            };
            let slot = self.slots.remove(i);
            if let SlotState::Idle(session) = slot.state {
                taken.push((slot.id, session, reason));
            }
        }
        taken
    }

    pub fn stats(&self) -> AccountStats {
        let mut stats = AccountStats {
            total: self.slots.len(),
            ..AccountStats::default()
        };
        for slot in &self.slots {
            if slot.is_idle() {
                stats.idle += 1;
            } else {
                stats.in_use += 1;
            }
            if slot.purpose == Purpose::Push {
                stats.push += 1;
            }
        }
        stats
    }
}

pub(crate) struct AccountGroup {
    slots: Mutex<Slots>,
    changed: Notify,
}

impl AccountGroup {
    fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            changed: Notify::new(),
        }
    }

    /// Bookkeeping lock. A panic while holding it cannot leave a slot half
    /// updated, so poisoning is ignored.
    pub fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Future resolving on the next capacity change. Call `enable()` on it
    /// before inspecting the slots so a change in between is not missed.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Wake every current waiter. Stores no permit, so a waiter that already
    /// gave up leaves nothing behind for a later caller.
    pub fn notify_waiters(&self) {
        self.changed.notify_waiters();
    }
}

pub(crate) struct Registry {
    groups: RwLock<HashMap<String, Arc<AccountGroup>>>,
    next_slot_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            next_slot_id: AtomicU64::new(1),
        }
    }

    pub fn next_slot_id(&self) -> SlotId {
        self.next_slot_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Group for `account`, created on first use.
    pub fn group(&self, account: &str) -> Arc<AccountGroup> {
        if let Some(group) = self.read().get(account) {
            return Arc::clone(group);
        }
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            groups
                .entry(account.to_owned())
                .or_insert_with(|| Arc::new(AccountGroup::new())),
        )
    }

    /// Point-in-time list of groups; the registry lock is released on return.
    pub fn groups(&self) -> Vec<(String, Arc<AccountGroup>)> {
        self.read()
            .iter()
            .map(|(account, group)| (account.clone(), Arc::clone(group)))
            .collect()
    }

    /// Visit every group while holding the registry lock.
    pub fn for_each(&self, mut visit: impl FnMut(&str, &AccountGroup)) {
        for (account, group) in self.read().iter() {
            visit(account, group);
        }
    }

    /// Drop empty groups nobody holds a handle to. A held handle (a waiter, a
    /// lease) shows up as an extra strong count, and no new handle can be
    /// cloned out while the write lock is held.
    pub fn prune_empty(&self) -> usize {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let before = groups.len();
        groups.retain(|_, group| Arc::strong_count(group) > 1 || !group.lock().is_empty());
        before - groups.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<AccountGroup>>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }
}
