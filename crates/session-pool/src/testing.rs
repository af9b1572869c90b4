//! In-memory session doubles for pool tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use imap_session::{
    BoxFuture, Credentials, Response, Session, SessionError, SessionFactory, Status,
};

/// Shared counters between a factory and the sessions it opened.
#[derive(Default)]
pub(crate) struct Ledger {
    opened: AtomicUsize,
    closed: Mutex<Vec<u64>>,
    alive: Mutex<Vec<(u64, Arc<AtomicBool>)>>,
}

pub(crate) struct FakeSession {
    id: u64,
    alive: Arc<AtomicBool>,
    ledger: Option<Arc<Ledger>>,
    fail_close: bool,
}

impl FakeSession {
    /// Session not tied to any factory, for bookkeeping-only tests.
    pub(crate) fn detached(id: u64) -> Self {
        Self {
            id,
            alive: Arc::new(AtomicBool::new(true)),
            ledger: None,
            fail_close: false,
        }
    }
}

impl Session for FakeSession {
    fn is_usable(&mut self) -> BoxFuture<'_, bool> {
        let alive = self.alive.load(Ordering::SeqCst);
        Box::pin(async move { alive })
    }

    fn close(&mut self) -> BoxFuture<'_, imap_session::Result<()>> {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(ledger) = &self.ledger {
            ledger.closed.lock().unwrap().push(self.id);
        }
        let fail = self.fail_close;
        Box::pin(async move {
            if fail {
                Err(SessionError::Transport("logout failed".into()))
            } else {
                Ok(())
            }
        })
    }

    fn execute<'a>(
        &'a mut self,
        _command: &'a str,
    ) -> BoxFuture<'a, imap_session::Result<Response>> {
        let id = self.id;
        Box::pin(async move {
            Ok(Response {
                status: Status::Ok,
                untagged: vec![format!("* SESSION {id}")],
                completion: "A0001 OK done".into(),
            })
        })
    }

    fn idle(&mut self, _timeout: Duration) -> BoxFuture<'_, imap_session::Result<Vec<String>>> {
        Box::pin(async { Ok(vec!["* 1 EXISTS".to_string()]) })
    }
}

/// Factory handing out `FakeSession`s.
///
/// Password "bad" fails authentication, "down" fails transport. `open_delay`
/// sleeps before opening, for cancellation tests.
pub(crate) struct FakeFactory {
    ledger: Arc<Ledger>,
    next_id: AtomicU64,
    open_delay: Duration,
    fail_close: bool,
}

impl FakeFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            ledger: Arc::default(),
            next_id: AtomicU64::new(1),
            open_delay: Duration::ZERO,
            fail_close: false,
        })
    }

    pub(crate) fn with_open_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            ledger: Arc::default(),
            next_id: AtomicU64::new(1),
            open_delay: delay,
            fail_close: false,
        })
    }

    pub(crate) fn failing_close() -> Arc<Self> {
        Arc::new(Self {
            ledger: Arc::default(),
            next_id: AtomicU64::new(1),
            open_delay: Duration::ZERO,
            fail_close: true,
        })
    }

    pub(crate) fn opened(&self) -> usize {
        self.ledger.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> Vec<u64> {
        self.ledger.closed.lock().unwrap().clone()
    }

    /// Make session `id` fail its next liveness probe.
    pub(crate) fn kill(&self, id: u64) {
        for (sid, alive) in self.ledger.alive.lock().unwrap().iter() {
            if *sid == id {
                alive.store(false, Ordering::SeqCst);
            }
        }
    }
}

impl SessionFactory for FakeFactory {
    fn open<'a>(
        &'a self,
        _account: &'a str,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, imap_session::Result<Box<dyn Session>>> {
        Box::pin(async move {
            if !self.open_delay.is_zero() {
                tokio::time::sleep(self.open_delay).await;
            }
            match credentials.password.expose().as_str() {
                "bad" => {
                    return Err(SessionError::Authentication(
                        "[AUTHENTICATIONFAILED] Invalid credentials".into(),
                    ));
                }
                "down" => return Err(SessionError::Transport("connection refused".into())),
                _ => {}
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let alive = Arc::new(AtomicBool::new(true));
            self.ledger.alive.lock().unwrap().push((id, Arc::clone(&alive)));
            self.ledger.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                id,
                alive,
                ledger: Some(Arc::clone(&self.ledger)),
                fail_close: self.fail_close,
            }) as Box<dyn Session>)
        })
    }
}

/// Session id as reported by `FakeSession::execute`.
pub(crate) async fn session_id(lease: &mut crate::Lease) -> u64 {
    let response = lease.execute("NOOP").await.unwrap();
    response.untagged[0]
        .strip_prefix("* SESSION ")
        .unwrap()
        .parse()
        .unwrap()
}

pub(crate) fn creds() -> Credentials {
    Credentials::new("a@x.com", "app-password")
}
