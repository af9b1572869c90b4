//! Session pool and leases
//!
//! `Pool::acquire` hands out a `Lease` on one upstream session for an
//! account: a reused idle Transient session when one passes its probe,
//! otherwise a freshly opened one. Saturated accounts make the caller wait
//! for a release (never a poll loop), up to `wait_timeout`. Push admissions
//! evict an idle session or, as a last resort, open one slot past the cap.
//!
//! Bookkeeping happens under the account group's mutex; probes, logins and
//! logouts happen after it is released. A reserved or reused slot is guarded
//! until the lease exists, so an acquisition cancelled mid-way gives its
//! slot back.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use imap_session::{Credentials, Response, Session, SessionError, SessionFactory};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::admission::{self, Admission};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::reaper;
use crate::registry::{AccountGroup, CloseReason, Purpose, Registry, SlotId};
use crate::stats::PoolStats;

/// State shared by the pool handle, its leases and the reaper task.
pub(crate) struct Shared {
    pub registry: Registry,
    pub config: PoolConfig,
    pub factory: Arc<dyn SessionFactory>,
    closed: AtomicBool,
}

impl Shared {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Per-account pool of authenticated IMAP sessions.
///
/// Created with [`Pool::start`], which also spawns the reaper. Call
/// [`Pool::shutdown`] to log out idle sessions; dropping the pool only stops
/// the reaper.
pub struct Pool {
    shared: Arc<Shared>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Pool {
    /// Validate `config` and start the pool. Must be called inside a Tokio
    /// runtime.
    pub fn start(config: PoolConfig, factory: Arc<dyn SessionFactory>) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            registry: Registry::new(),
            config,
            factory,
            closed: AtomicBool::new(false),
        });
        let reaper = reaper::spawn_reaper(Arc::clone(&shared));
        info!(
            max_slots_per_account = shared.config.max_slots_per_account,
            wait_timeout_ms = shared.config.wait_timeout.as_millis() as u64,
            idle_timeout_secs = shared.config.idle_timeout.as_secs(),
            max_session_age_secs = shared.config.max_session_age.as_secs(),
            "session pool started"
        );
        Ok(Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Lease a session for `account`.
    ///
    /// Transient requests reuse the most recently released idle Transient
    /// session if it is still usable, open a new one while under the cap,
    /// and otherwise wait up to `wait_timeout` for a release before failing
    /// with [`Error::PoolExhausted`]. Push requests always get a session of
    /// their own and may evict an idle slot to get it.
    pub async fn acquire(
        &self,
        account: &str,
        credentials: &Credentials,
        purpose: Purpose,
    ) -> Result<Lease> {
        let started = Instant::now();
        let result = self.admit(account, credentials, purpose).await;
        let outcome = match &result {
            Ok(lease) if lease.reused => "reused",
            Ok(_) => "opened",
            Err(e) => e.label(),
        };
        metrics::record_acquire(purpose, outcome, started.elapsed());
        result
    }

    async fn admit(
        &self,
        account: &str,
        credentials: &Credentials,
        purpose: Purpose,
    ) -> Result<Lease> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(Error::Closed);
        }

        let group = shared.registry.group(account);
        let max = shared.config.max_slots_per_account;
        let deadline = Instant::now() + shared.config.wait_timeout;
        let mut timed_out = false;

        loop {
            // Registered before the slots are inspected, so a release landing
            // between the decision and the wait still wakes us.
            let notified = group.changed();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let admission = {
                let mut slots = group.lock();
                if shared.is_closed() {
                    return Err(Error::Closed);
                }
                admission::decide(&mut slots, purpose, Instant::now(), max, timed_out, || {
                    shared.registry.next_slot_id()
                })
            };

            match admission {
                Admission::Reuse(reused) => {
                    let guard = SlotGuard::new(&group, reused.slot_id);
                    let mut session = reused.session;
                    let too_old = reused.created_at.elapsed() > shared.config.max_session_age;
                    if !too_old && session.is_usable().await {
                        guard.disarm();
                        debug!(account, slot_id = reused.slot_id, "reusing idle session");
                        return Ok(Lease {
                            shared: Arc::clone(shared),
                            group: Arc::clone(&group),
                            account: account.to_owned(),
                            slot_id: reused.slot_id,
                            purpose,
                            created_at: reused.created_at,
                            reused: true,
                            session: Some(session),
                        });
                    }
                    drop(guard);
                    let reason = if too_old {
                        CloseReason::MaxAge
                    } else {
                        CloseReason::Unusable
                    };
                    debug!(
                        account,
                        slot_id = reused.slot_id,
                        reason = reason.label(),
                        "idle session not reusable, replacing"
                    );
                    close_session(session, account, reused.slot_id, reason).await;
                }
                Admission::Open {
                    slot_id,
                    victim,
                    overflow,
                } => {
                    let guard = SlotGuard::new(&group, slot_id);
                    if let Some((victim_id, session)) = victim {
                        info!(
                            account,
                            slot_id = victim_id,
                            purpose = purpose.label(),
                            "evicting idle session to make room"
                        );
                        close_session(session, account, victim_id, CloseReason::Evicted).await;
                    }
                    if overflow {
                        warn!(account, max, "push session admitted above the per-account cap");
                    }

                    let session = match shared.factory.open(account, credentials).await {
                        Ok(session) => session,
                        Err(e) => {
                            warn!(
                                account,
                                purpose = purpose.label(),
                                error = %e,
                                "failed to open session"
                            );
                            return Err(e.into());
                        }
                    };

                    let activated = {
                        let mut slots = group.lock();
                        !shared.is_closed() && slots.activate(slot_id)
                    };
                    if !activated {
                        drop(guard);
                        close_session(session, account, slot_id, CloseReason::Shutdown).await;
                        return Err(Error::Closed);
                    }
                    guard.disarm();

                    metrics::record_opened(purpose);
                    info!(account, slot_id, purpose = purpose.label(), "session opened");
                    return Ok(Lease {
                        shared: Arc::clone(shared),
                        group: Arc::clone(&group),
                        account: account.to_owned(),
                        slot_id,
                        purpose,
                        created_at: Instant::now(),
                        reused: false,
                        session: Some(session),
                    });
                }
                Admission::Wait => {
                    debug!(
                        account,
                        purpose = purpose.label(),
                        "account saturated, waiting for a release"
                    );
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        timed_out = true;
                    }
                }
                Admission::Exhausted { slots } => {
                    warn!(account, slots, max, purpose = purpose.label(), "pool exhausted");
                    return Err(Error::PoolExhausted {
                        account: account.to_owned(),
                        slots,
                        max,
                    });
                }
            }
        }
    }

    /// Return a lease's session to its slot so it can be reused.
    ///
    /// A lease issued by another pool is left alone; it goes back to its own
    /// pool when dropped.
    pub async fn release(&self, mut lease: Lease) {
        if !Arc::ptr_eq(&lease.shared, &self.shared) {
            warn!(
                account = %lease.account,
                slot_id = lease.slot_id,
                "lease released to a pool that did not issue it"
            );
            return;
        }
        if let Some((session, reason)) = lease.check_in() {
            close_session(session, &lease.account, lease.slot_id, reason).await;
        }
    }

    /// Close a lease's session instead of returning it, e.g. after a
    /// protocol error left it in an unknown state. Frees the slot.
    pub async fn discard(&self, mut lease: Lease) {
        let Some(session) = lease.session.take() else {
            return;
        };
        lease.group.lock().remove(lease.slot_id);
        lease.group.notify_waiters();
        close_session(session, &lease.account, lease.slot_id, CloseReason::Discarded).await;
    }

    /// Point-in-time occupancy. Accounts without slots are omitted.
    pub fn snapshot(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        self.shared.registry.for_each(|account, group| {
            stats.record(account, group.lock().stats());
        });
        stats
    }

    /// Run one reaper sweep now. Returns how many sessions were closed.
    pub async fn reap(&self) -> usize {
        reaper::sweep(&self.shared).await
    }

    /// Stop the reaper, log out every idle session and refuse further
    /// acquisitions. Leased sessions are logged out as they come back.
    /// Waiters are woken and fail with [`Error::Closed`].
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.take_reaper() {
            handle.abort();
        }

        let mut closing = JoinSet::new();
        for (account, group) in self.shared.registry.groups() {
            let drained = group.lock().take_idle_where(|_| Some(CloseReason::Shutdown));
            group.notify_waiters();
            for (slot_id, session, reason) in drained {
                let account = account.clone();
                closing.spawn(async move {
                    close_session(session, &account, slot_id, reason).await;
                });
            }
        }
        let idle = closing.len();
        while closing.join_next().await.is_some() {}

        let remaining = self.snapshot();
        info!(
            closed_idle = idle,
            still_leased = remaining.total_slots,
            "session pool shut down"
        );
    }

    fn take_reaper(&self) -> Option<JoinHandle<()>> {
        self.reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Some(handle) = self.take_reaper() {
            handle.abort();
        }
    }
}

/// Exclusive use of one pooled session.
///
/// Return it with [`Pool::release`] (or [`Pool::discard`] if it is broken).
/// Dropping a lease releases it too.
pub struct Lease {
    shared: Arc<Shared>,
    group: Arc<AccountGroup>,
    account: String,
    slot_id: SlotId,
    purpose: Purpose,
    created_at: Instant,
    reused: bool,
    session: Option<Box<dyn Session>>,
}

impl Lease {
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    /// Whether the session came from an idle slot rather than a fresh login.
    pub fn was_reused(&self) -> bool {
        self.reused
    }

    /// How long ago the underlying session was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub async fn execute(&mut self, command: &str) -> imap_session::Result<Response> {
        self.session()?.execute(command).await
    }

    /// Wait up to `timeout` for server pushes. Meant for Push leases.
    pub async fn idle(&mut self, timeout: Duration) -> imap_session::Result<Vec<String>> {
        self.session()?.idle(timeout).await
    }

    fn session(&mut self) -> imap_session::Result<&mut Box<dyn Session>> {
        self.session
            .as_mut()
            .ok_or_else(|| SessionError::Protocol("lease already returned".into()))
    }

    /// Put the session back into its slot. Hands it back with a reason when
    /// it has to be logged out instead.
    ///
    /// Push sessions are never reused, so a released Push slot is always
    /// freed; keeping it idle would hold capacity nobody can use.
    fn check_in(&mut self) -> Option<(Box<dyn Session>, CloseReason)> {
        let session = self.session.take()?;
        let too_old = self.created_at.elapsed() > self.shared.config.max_session_age;
        let retire = if too_old {
            Some(CloseReason::MaxAge)
        } else if self.shared.is_closed() {
            Some(CloseReason::Shutdown)
        } else if self.purpose == Purpose::Push {
            Some(CloseReason::PushEnded)
        } else {
            None
        };
        let outcome = {
            let mut slots = self.group.lock();
            if let Some(reason) = retire {
                slots.remove(self.slot_id);
                Some((session, reason))
            } else {
                match slots.mark_idle(self.slot_id, session, Instant::now()) {
                    Ok(()) => None,
                    Err(session) => Some((session, CloseReason::Orphaned)),
                }
            }
        };
        self.group.notify_waiters();
        if let Some((_, CloseReason::Orphaned)) = &outcome {
            warn!(
                account = %self.account,
                slot_id = self.slot_id,
                "released session has no slot, logging it out"
            );
        }
        outcome
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("account", &self.account)
            .field("slot_id", &self.slot_id)
            .field("purpose", &self.purpose)
            .field("reused", &self.reused)
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some((session, reason)) = self.check_in() {
            spawn_close(session, self.account.clone(), self.slot_id, reason);
        }
    }
}

/// Removes a reserved or reused slot unless disarmed, so an acquisition
/// that fails or is cancelled before producing a lease frees its capacity.
struct SlotGuard<'a> {
    group: &'a AccountGroup,
    slot_id: SlotId,
    armed: bool,
}

impl<'a> SlotGuard<'a> {
    fn new(group: &'a AccountGroup, slot_id: SlotId) -> Self {
        Self {
            group,
            slot_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.group.lock().remove(self.slot_id);
            self.group.notify_waiters();
        }
    }
}

/// Log out `session`. Failures are logged and counted, never returned.
pub(crate) async fn close_session(
    mut session: Box<dyn Session>,
    account: &str,
    slot_id: SlotId,
    reason: CloseReason,
) {
    metrics::record_closed(reason);
    match session.close().await {
        Ok(()) => debug!(account, slot_id, reason = reason.label(), "session closed"),
        Err(e) => {
            metrics::record_close_failure();
            warn!(account, slot_id, reason = reason.label(), error = %e, "session logout failed");
        }
    }
}

fn spawn_close(session: Box<dyn Session>, account: String, slot_id: SlotId, reason: CloseReason) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                close_session(session, &account, slot_id, reason).await;
            });
        }
        Err(_) => {
            debug!(account = %account, slot_id, "no runtime to log out on, dropping session");
        }
    }
}
