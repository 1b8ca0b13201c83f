//! Mailbox protocol client seam
//!
//! The account monitor drives a mailbox only through [`MailboxClient`], which
//! lets the lifecycle state machine run against the real IMAP client in
//! production and against scripted clients in tests.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};

use crate::errors::{AppError, AppResult};

/// One message as returned by the protocol client, before normalization
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// IMAP UID, valid for the current connection
    pub uid: u32,
    /// Flags as reported by the server
    pub seen: bool,
    /// Server-side INTERNALDATE, if reported
    pub internal_date: Option<DateTime<FixedOffset>>,
    /// Full RFC822 source
    pub body: Vec<u8>,
}

/// Outcome of a single wait-for-change call
///
/// Exactly one value is produced per call.
#[derive(Debug)]
pub enum ChangeSignal {
    /// The folder may have new messages; re-check without reconnecting
    Signal,
    /// The wait expired without actionable news; recycle the connection
    Timeout,
    /// The wait failed; treat as a connection failure
    Error(AppError),
}

/// Operations the account monitor needs from a mailbox connection
///
/// An implementation owns at most one live connection. `disconnect` must be
/// safe to call in any state, including when no connection exists.
pub trait MailboxClient: Send {
    /// Open a secure connection and read the server greeting
    fn connect(&mut self) -> impl Future<Output = AppResult<()>> + Send;

    /// Log in with the stored credentials
    fn authenticate(&mut self) -> impl Future<Output = AppResult<()>> + Send;

    /// Enumerate visible folder names (diagnostic)
    fn list_folders(&mut self) -> impl Future<Output = AppResult<Vec<String>>> + Send;

    /// Select a folder and return its message count
    fn select_folder(&mut self, folder: &str) -> impl Future<Output = AppResult<u32>> + Send;

    /// Fetch at most `limit` unread messages in arrival order
    fn fetch_unread(
        &mut self,
        folder: &str,
        limit: usize,
    ) -> impl Future<Output = AppResult<Vec<RawMessage>>> + Send;

    /// Set `\Seen` on a message
    fn mark_read(&mut self, uid: u32) -> impl Future<Output = AppResult<()>> + Send;

    /// Block until the folder may have changed, the idle timeout expires, or
    /// the connection fails
    fn wait_for_change(
        &mut self,
        folder: &str,
        idle_timeout: Duration,
        poll_interval: Duration,
    ) -> impl Future<Output = ChangeSignal> + Send;

    /// Release the connection, if any
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}
