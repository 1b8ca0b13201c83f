//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations and the
//! [`ImapMailboxClient`] that implements [`MailboxClient`] on top of them.
//! All network calls use TLS; timeouts come from [`ImapTimeouts`].

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, ImapTimeouts};
use crate::errors::{AppError, AppResult};
use crate::idle::{Raced, classify_idle_response, poll_for_change, race_with_timeout};
use crate::mailbox::{ChangeSignal, MailboxClient, RawMessage};

type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Type alias for authenticated IMAP session over TLS
pub type ImapSession = Session<TlsStream>;

/// Items fetched per message; `BODY.PEEK` leaves `\Seen` untouched
const FETCH_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";

/// Open TCP, complete the TLS handshake and read the IMAP greeting
///
/// # Timeouts
///
/// - TCP connect: `timeouts.connect`
/// - TLS handshake and greeting: `timeouts.greeting`
///
/// # Errors
///
/// - `InvalidInput` if the hostname is invalid for TLS SNI
/// - `Timeout` if any phase times out
/// - `Connection` for TCP, TLS, or greeting failures
pub async fn connect_tls(
    timeouts: &ImapTimeouts,
    account: &AccountConfig,
) -> AppResult<Client<TlsStream>> {
    let tcp = timeout(
        timeouts.connect,
        TcpStream::connect((account.host.as_str(), account.port)),
    )
    .await
    .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
    .and_then(|r| r.map_err(|e| AppError::Connection(format!("tcp connect failed: {e}"))))?;

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let server_name = ServerName::try_from(account.host.clone())
        .map_err(|_| AppError::InvalidInput("invalid IMAP host for TLS SNI".to_owned()))?;
    let tls_stream = timeout(timeouts.greeting, connector.connect(server_name, tcp))
        .await
        .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}"))))?;

    let mut client = Client::new(tls_stream);
    let greeting = timeout(timeouts.greeting, client.read_response())
        .await
        .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}")))
        })?;

    if greeting.is_none() {
        return Err(AppError::Connection(
            "IMAP server closed connection before greeting".to_owned(),
        ));
    }

    Ok(client)
}

/// LOGIN with the account's credentials
///
/// # Errors
///
/// - `Timeout` if the server does not answer within `timeouts.greeting`
/// - `AuthFailed` if the server rejects the credentials
pub async fn login(
    timeouts: &ImapTimeouts,
    client: Client<TlsStream>,
    account: &AccountConfig,
) -> AppResult<ImapSession> {
    let pass = account.pass.expose_secret();
    timeout(timeouts.greeting, client.login(account.user.as_str(), pass))
        .await
        .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
        .and_then(|r| {
            r.map_err(|(e, _)| {
                let msg = e.to_string();
                if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                    AppError::AuthFailed(msg)
                } else {
                    AppError::from_imap("LOGIN failed", msg)
                }
            })
        })
}

/// Query server capabilities
pub async fn capabilities(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
) -> AppResult<async_imap::types::Capabilities> {
    timeout(timeouts.socket, session.capabilities())
        .await
        .map_err(|_| AppError::Timeout("CAPABILITY timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("CAPABILITY failed", e)))
}

/// List all visible mailboxes/folders
pub async fn list_all_mailboxes(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
) -> AppResult<Vec<async_imap::types::Name>> {
    let stream = timeout(timeouts.socket, session.list(None, Some("*")))
        .await
        .map_err(|_| AppError::Timeout("LIST timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("LIST failed", e)))?;

    timeout(timeouts.socket, stream.try_collect::<Vec<_>>())
        .await
        .map_err(|_| AppError::Timeout("LIST stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("LIST stream failed", e)))
}

/// Select mailbox in read-write mode
///
/// Uses `SELECT` so `\Seen` can be stored afterwards. Returns the number of
/// messages in the mailbox (`EXISTS`).
pub async fn select_mailbox(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    mailbox: &str,
) -> AppResult<u32> {
    let encoded = utf7_imap::encode_utf7_imap(mailbox.to_owned());
    let selected = timeout(timeouts.socket, session.select(&encoded))
        .await
        .map_err(|_| AppError::Timeout(format!("SELECT timed out for mailbox '{mailbox}'")))
        .and_then(|r| {
            r.map_err(|e| AppError::from_imap(&format!("cannot select mailbox '{mailbox}'"), e))
        })?;
    Ok(selected.exists)
}

/// Search for messages matching query
///
/// Runs `UID SEARCH` and returns matching UIDs in ascending (arrival) order.
pub async fn uid_search(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    query: &str,
) -> AppResult<Vec<u32>> {
    let set = timeout(timeouts.socket, session.uid_search(query))
        .await
        .map_err(|_| AppError::Timeout("UID SEARCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("uid search failed", e)))?;
    let mut uids: Vec<u32> = set.into_iter().collect();
    uids.sort_unstable();
    Ok(uids)
}

/// Fetch messages by UID set
pub async fn uid_fetch(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uid_set: &str,
    query: &str,
) -> AppResult<Vec<Fetch>> {
    let stream = timeout(timeouts.socket, session.uid_fetch(uid_set, query))
        .await
        .map_err(|_| AppError::Timeout("UID FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("uid fetch failed", e)))?;
    timeout(timeouts.socket, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("uid fetch stream failed", e)))
}

/// Fetch messages by sequence-number set
pub async fn seq_fetch(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    seq_set: &str,
    query: &str,
) -> AppResult<Vec<Fetch>> {
    let stream = timeout(timeouts.socket, session.fetch(seq_set, query))
        .await
        .map_err(|_| AppError::Timeout("FETCH timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("fetch failed", e)))?;
    timeout(timeouts.socket, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("FETCH stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("fetch stream failed", e)))
}

/// Store flags on a message
///
/// Runs `UID STORE` with a flag query string. Use `+FLAGS.SILENT` to add
/// flags or `-FLAGS.SILENT` to remove flags.
pub async fn uid_store(
    timeouts: &ImapTimeouts,
    session: &mut ImapSession,
    uid: u32,
    query: &str,
) -> AppResult<()> {
    let stream = timeout(timeouts.socket, session.uid_store(uid.to_string(), query))
        .await
        .map_err(|_| AppError::Timeout("UID STORE timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("uid store failed", e)))?;
    let _: Vec<Fetch> = timeout(timeouts.socket, stream.try_collect())
        .await
        .map_err(|_| AppError::Timeout("UID STORE stream timed out".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::from_imap("uid store stream failed", e)))?;
    Ok(())
}

/// Convert a FETCH response into a [`RawMessage`]
///
/// Returns `None` when the server omitted the UID or the body.
fn to_raw_message(fetch: &Fetch) -> Option<RawMessage> {
    let uid = fetch.uid?;
    let body = fetch.body()?.to_vec();
    Some(RawMessage {
        uid,
        seen: fetch.flags().any(|flag| matches!(flag, Flag::Seen)),
        internal_date: fetch.internal_date(),
        body,
    })
}

/// Keep the newest `limit` entries of an ascending list
fn newest<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    let start = items.len().saturating_sub(limit);
    items.drain(..start);
    items
}

/// Sequence range covering the newest `limit` of `exists` messages
fn recent_seq_range(exists: u32, limit: usize) -> String {
    let limit = u32::try_from(limit).unwrap_or(u32::MAX);
    let first = exists.saturating_sub(limit).saturating_add(1);
    format!("{first}:{exists}")
}

enum Connection {
    /// TLS established and greeting read; not logged in
    Greeted(Client<TlsStream>),
    /// Logged in
    Ready(ImapSession),
}

/// [`MailboxClient`] backed by a single `async-imap` TLS session
pub struct ImapMailboxClient {
    account: Arc<AccountConfig>,
    timeouts: ImapTimeouts,
    conn: Option<Connection>,
    supports_idle: bool,
    /// EXISTS seen by the last fetch pass; the poll baseline
    fetched_exists: Option<u32>,
}

impl ImapMailboxClient {
    /// Create a disconnected client for an account
    pub fn new(account: Arc<AccountConfig>, timeouts: ImapTimeouts) -> Self {
        Self {
            account,
            timeouts,
            conn: None,
            supports_idle: false,
            fetched_exists: None,
        }
    }

    fn session_mut(&mut self) -> AppResult<&mut ImapSession> {
        match self.conn.as_mut() {
            Some(Connection::Ready(session)) => Ok(session),
            _ => Err(AppError::Internal("IMAP session is not authenticated".to_owned())),
        }
    }

    async fn idle_wait(&mut self, folder: &str, idle_timeout: Duration) -> ChangeSignal {
        if let Err(err) = self.select_folder(folder).await {
            return ChangeSignal::Error(err);
        }
        let Some(Connection::Ready(session)) = self.conn.take() else {
            return ChangeSignal::Error(AppError::Internal(
                "IMAP session is not authenticated".to_owned(),
            ));
        };
        info!(account = %self.account.name, folder, "waiting for changes with IDLE");

        let mut handle = session.idle();
        match timeout(self.timeouts.socket, handle.init()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.idle_failed(AppError::from_imap("IDLE failed", e)),
            Err(_) => return self.idle_failed(AppError::Timeout("IDLE start timed out".to_owned())),
        }

        let raced = {
            let (wait, interrupt) = handle.wait();
            race_with_timeout(wait, move || drop(interrupt), idle_timeout).await
        };
        let signal = match raced {
            Raced::Finished(Ok(response)) => classify_idle_response(&response),
            Raced::Finished(Err(e)) => {
                return self.idle_failed(AppError::from_imap("IDLE failed", e));
            }
            Raced::TimedOut => ChangeSignal::Timeout,
        };

        match timeout(self.timeouts.socket, handle.done()).await {
            Ok(Ok(session)) => self.conn = Some(Connection::Ready(session)),
            Ok(Err(e)) => return self.idle_failed(AppError::from_imap("IDLE DONE failed", e)),
            Err(_) => {
                return self.idle_failed(AppError::Timeout("IDLE DONE timed out".to_owned()));
            }
        }

        match &signal {
            ChangeSignal::Signal => info!(account = %self.account.name, "IDLE reported new mail"),
            _ => info!(
                account = %self.account.name,
                idle_timeout = ?idle_timeout,
                "IDLE ended without new mail; recycling connection"
            ),
        }
        signal
    }

    /// Log an IDLE failure; the session was consumed by IDLE and is gone
    fn idle_failed(&self, err: AppError) -> ChangeSignal {
        if err.is_connection_loss() {
            info!(account = %self.account.name, error = %err, "connection dropped during IDLE");
        } else {
            warn!(account = %self.account.name, error = %err, "IDLE error");
        }
        ChangeSignal::Error(err)
    }

    async fn poll_wait(&mut self, folder: &str, poll_interval: Duration) -> ChangeSignal {
        let baseline = match self.fetched_exists.take() {
            Some(count) => count,
            None => match self.select_folder(folder).await {
                Ok(count) => count,
                Err(err) => return ChangeSignal::Error(err),
            },
        };
        info!(
            account = %self.account.name,
            folder,
            poll_interval = ?poll_interval,
            "server lacks IDLE; polling for changes"
        );
        poll_for_change(self, folder, baseline, poll_interval).await
    }
}

impl MailboxClient for ImapMailboxClient {
    async fn connect(&mut self) -> AppResult<()> {
        self.disconnect().await;
        let client = connect_tls(&self.timeouts, &self.account).await?;
        self.conn = Some(Connection::Greeted(client));
        Ok(())
    }

    async fn authenticate(&mut self) -> AppResult<()> {
        let Some(Connection::Greeted(client)) = self.conn.take() else {
            return Err(AppError::Internal(
                "IMAP connection must be greeted before login".to_owned(),
            ));
        };
        let mut session = login(&self.timeouts, client, &self.account).await?;

        self.supports_idle = match capabilities(&self.timeouts, &mut session).await {
            Ok(caps) => caps.has_str("IDLE"),
            Err(err) => {
                warn!(account = %self.account.name, error = %err, "CAPABILITY failed; assuming no IDLE");
                false
            }
        };
        self.conn = Some(Connection::Ready(session));
        Ok(())
    }

    async fn list_folders(&mut self) -> AppResult<Vec<String>> {
        let timeouts = self.timeouts;
        let names = list_all_mailboxes(&timeouts, self.session_mut()?).await?;
        Ok(names
            .iter()
            .map(|name| utf7_imap::decode_utf7_imap(name.name().to_owned()))
            .collect())
    }

    async fn select_folder(&mut self, folder: &str) -> AppResult<u32> {
        let timeouts = self.timeouts;
        select_mailbox(&timeouts, self.session_mut()?, folder).await
    }

    async fn fetch_unread(&mut self, folder: &str, limit: usize) -> AppResult<Vec<RawMessage>> {
        self.fetched_exists = None;
        let exists = self.select_folder(folder).await?;
        self.fetched_exists = Some(exists);
        if exists == 0 {
            return Ok(Vec::new());
        }
        let timeouts = self.timeouts;
        let account = Arc::clone(&self.account);
        let session = self.session_mut()?;

        let mut messages = match uid_search(&timeouts, session, "UNSEEN").await {
            Ok(uids) => {
                if uids.is_empty() {
                    return Ok(Vec::new());
                }
                let uid_set = newest(uids, limit)
                    .iter()
                    .map(u32::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                uid_fetch(&timeouts, session, &uid_set, FETCH_QUERY)
                    .await?
                    .iter()
                    .filter_map(to_raw_message)
                    .collect::<Vec<_>>()
            }
            Err(err) => {
                // Some servers reject flag-based SEARCH; scan the newest
                // messages and filter client-side instead.
                debug!(account = %account.name, error = %err, "UNSEEN search rejected; using sequence fallback");
                let range = recent_seq_range(exists, limit);
                seq_fetch(&timeouts, session, &range, FETCH_QUERY)
                    .await
                    .map_err(|e| {
                        AppError::from_imap("fetch failed after UNSEEN search fallback", e)
                    })?
                    .iter()
                    .filter_map(to_raw_message)
                    .filter(|message| !message.seen)
                    .collect::<Vec<_>>()
            }
        };

        messages.sort_by_key(|message| message.uid);
        Ok(newest(messages, limit))
    }

    async fn mark_read(&mut self, uid: u32) -> AppResult<()> {
        let timeouts = self.timeouts;
        uid_store(&timeouts, self.session_mut()?, uid, "+FLAGS.SILENT (\\Seen)").await
    }

    async fn wait_for_change(
        &mut self,
        folder: &str,
        idle_timeout: Duration,
        poll_interval: Duration,
    ) -> ChangeSignal {
        if self.supports_idle {
            self.idle_wait(folder, idle_timeout).await
        } else {
            self.poll_wait(folder, poll_interval).await
        }
    }

    async fn disconnect(&mut self) {
        match self.conn.take() {
            Some(Connection::Ready(mut session)) => {
                match timeout(self.timeouts.socket, session.logout()).await {
                    Ok(Ok(())) => debug!(account = %self.account.name, "logged out"),
                    Ok(Err(e)) => debug!(account = %self.account.name, error = %e, "logout failed"),
                    Err(_) => debug!(account = %self.account.name, "logout timed out"),
                }
            }
            Some(Connection::Greeted(_)) | None => {}
        }
        self.supports_idle = false;
        self.fetched_exists = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{newest, recent_seq_range};

    #[test]
    fn newest_keeps_tail_in_order() {
        assert_eq!(newest(vec![3, 5, 8, 13], 2), vec![8, 13]);
        assert_eq!(newest(vec![1, 2], 50), vec![1, 2]);
        assert!(newest(Vec::<u32>::new(), 50).is_empty());
    }

    #[test]
    fn recent_seq_range_covers_newest_messages() {
        assert_eq!(recent_seq_range(120, 50), "71:120");
        assert_eq!(recent_seq_range(7, 50), "1:7");
        assert_eq!(recent_seq_range(50, 50), "1:50");
    }
}
