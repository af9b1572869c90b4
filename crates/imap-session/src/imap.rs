//! IMAP session over TCP or TLS
//!
//! The wire protocol is `async-imap`'s; this module owns the connection on
//! behalf of the pool. `LOGIN` on open, `NOOP` as the liveness probe,
//! `IDLE`/`DONE` for push and `LOGOUT` on close. Untagged responses that
//! arrive while a command runs are collected into the `Response` in their
//! decoded form.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::extensions::idle::IdleResponse;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::error::{Result, SessionError};
use crate::{BoxFuture, Credentials, Response, Session, SessionFactory, Status};

/// Upstream IMAP server settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// Implicit TLS (port 993 style). Plain TCP when false.
    pub tls: bool,
    /// Bounds the TCP connect, the TLS handshake and the `LOGIN` exchange.
    pub connect_timeout: Duration,
    /// Upper bound on a `NOOP` liveness probe.
    pub probe_timeout: Duration,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".into(),
            port: 993,
            tls: true,
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Plain or TLS byte stream under the IMAP client.
#[derive(Debug)]
pub(crate) enum ImapStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ImapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ImapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ImapStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ImapStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

type ClientSession = async_imap::Session<ImapStream>;

/// Opens authenticated `ImapSession`s against one upstream server.
pub struct ImapSessionFactory {
    config: ImapConfig,
    connector: Option<TlsConnector>,
}

impl ImapSessionFactory {
    pub fn new(config: ImapConfig) -> Self {
        let connector = config.tls.then(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let client = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(client))
        });
        Self { config, connector }
    }

    async fn connect(&self) -> Result<ImapStream> {
        let host = self.config.host.as_str();
        let port = self.config.port;
        let limit = self.config.connect_timeout;
        let tcp = tokio::time::timeout(limit, TcpStream::connect((host, port)))
            .await
            .map_err(|_| SessionError::Transport(format!("connect to {host}:{port} timed out")))??;

        let Some(connector) = &self.connector else {
            return Ok(ImapStream::Plain(tcp));
        };

        let name = ServerName::try_from(host.to_owned())
            .map_err(|e| SessionError::Transport(format!("invalid server name {host}: {e}")))?;
        let tls = tokio::time::timeout(limit, connector.connect(name, tcp))
            .await
            .map_err(|_| SessionError::Transport(format!("TLS handshake with {host} timed out")))??;
        Ok(ImapStream::Tls(Box::new(tls)))
    }

    async fn login(&self, stream: ImapStream, credentials: &Credentials) -> Result<ClientSession> {
        let client = async_imap::Client::new(stream);
        let login = client.login(&credentials.username, credentials.password.expose());
        match tokio::time::timeout(self.config.connect_timeout, login).await {
            Ok(Ok(session)) => Ok(session),
            Ok(Err((e, _client))) => Err(login_error(e)),
            Err(_) => Err(SessionError::Transport(format!(
                "LOGIN to {} timed out",
                self.config.host
            ))),
        }
    }
}

impl SessionFactory for ImapSessionFactory {
    fn open<'a>(
        &'a self,
        account: &'a str,
        credentials: &'a Credentials,
    ) -> BoxFuture<'a, Result<Box<dyn Session>>> {
        Box::pin(async move {
            let stream = self.connect().await?;
            let session = self.login(stream, credentials).await?;
            debug!(account, host = %self.config.host, "imap login succeeded");
            Ok(Box::new(ImapSession {
                inner: Some(session),
                account: account.to_owned(),
                probe_timeout: self.config.probe_timeout,
            }) as Box<dyn Session>)
        })
    }
}

/// One authenticated IMAP connection. `inner` is gone once the connection
/// is known to be dead or has been logged out.
pub struct ImapSession {
    inner: Option<ClientSession>,
    account: String,
    probe_timeout: Duration,
}

impl ImapSession {
    fn client(&mut self) -> Result<&mut ClientSession> {
        self.inner
            .as_mut()
            .ok_or_else(|| SessionError::Transport("session is closed".into()))
    }

    async fn run(&mut self, command: &str) -> Result<Response> {
        let client = self.client()?;
        let updates = client.unsolicited_responses.clone();
        let mut untagged = Vec::new();

        // Drain while the command runs: the update channel is bounded.
        let outcome = {
            let completion = client.run_command_and_check_ok(command);
            tokio::pin!(completion);
            loop {
                tokio::select! {
                    outcome = &mut completion => break outcome,
                    Ok(update) = updates.recv() => untagged.push(format!("{update:?}")),
                }
            }
        };
        while let Ok(update) = updates.try_recv() {
            untagged.push(format!("{update:?}"));
        }

        let (status, completion) = match outcome {
            Ok(()) => (Status::Ok, "OK".to_owned()),
            Err(ImapError::No(text)) => (Status::No, text),
            Err(ImapError::Bad(text)) => (Status::Bad, text),
            Err(e) => {
                self.inner = None;
                return Err(SessionError::Transport(e.to_string()));
            }
        };
        Ok(Response {
            status,
            untagged,
            completion,
        })
    }

    async fn noop_probe(&mut self) -> bool {
        let Some(client) = self.inner.as_mut() else {
            return false;
        };
        let usable = match tokio::time::timeout(self.probe_timeout, client.noop()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(account = %self.account, error = %e, "liveness probe failed");
                false
            }
            Err(_) => {
                debug!(account = %self.account, "liveness probe timed out");
                false
            }
        };
        if usable {
            // Nobody asked for updates that arrive between commands.
            while client.unsolicited_responses.try_recv().is_ok() {}
        } else {
            self.inner = None;
        }
        usable
    }

    async fn logout(&mut self) -> Result<()> {
        let Some(mut client) = self.inner.take() else {
            return Ok(());
        };
        client
            .logout()
            .await
            .map_err(|e| SessionError::Protocol(e.to_string()))
    }

    async fn idle_once(&mut self, timeout: Duration) -> Result<Vec<String>> {
        let client = self
            .inner
            .take()
            .ok_or_else(|| SessionError::Transport("session is closed".into()))?;

        let mut handle = client.idle();
        if let Err(e) = handle.init().await {
            return Err(match e {
                ImapError::No(text) | ImapError::Bad(text) => {
                    SessionError::Protocol(format!("IDLE rejected: {text}"))
                }
                other => SessionError::Transport(other.to_string()),
            });
        }

        let (wait, _interrupt) = handle.wait_with_timeout(timeout);
        let mut pushed = Vec::new();
        match wait.await {
            Ok(IdleResponse::NewData(data)) => pushed.push(format!("{:?}", data.parsed())),
            Ok(IdleResponse::Timeout) | Ok(IdleResponse::ManualInterrupt) => {}
            Err(e) => return Err(SessionError::Transport(e.to_string())),
        }

        let mut client = match handle.done().await {
            Ok(client) => client,
            Err(e) => {
                warn!(account = %self.account, error = %e, "IDLE did not terminate cleanly");
                return Err(SessionError::Transport(e.to_string()));
            }
        };
        while let Ok(update) = client.unsolicited_responses.try_recv() {
            pushed.push(format!("{update:?}"));
        }
        self.inner = Some(client);
        Ok(pushed)
    }
}

impl Session for ImapSession {
    fn is_usable(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(self.noop_probe())
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.logout())
    }

    fn execute<'a>(&'a mut self, command: &'a str) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            if command.contains(['\r', '\n']) {
                return Err(SessionError::Protocol(
                    "command must be a single line".into(),
                ));
            }
            self.run(command).await
        })
    }

    fn idle(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(self.idle_once(timeout))
    }
}

/// `NO` to `LOGIN` is a credentials problem; anything else means the
/// server or the connection failed us.
fn login_error(e: ImapError) -> SessionError {
    match e {
        ImapError::No(text) => SessionError::Authentication(text),
        ImapError::Bad(text) => SessionError::Protocol(format!("LOGIN rejected: {text}")),
        other => SessionError::Transport(other.to_string()),
    }
}
