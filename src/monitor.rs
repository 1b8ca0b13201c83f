//! Per-account monitoring engine
//!
//! An [`AccountMonitor`] owns one account's connection lifecycle: connect,
//! authenticate, enumerate folders once, deliver unread mail, then wait for
//! changes. Connection failures are retried after a fixed delay until the
//! configured maximum is reached, at which point an alert is delivered and
//! the monitor ends in [`MonitorPhase::Fatal`].
//!
//! All state is owned by the monitor and mutated only from its own task.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::AccountConfig;
use crate::errors::{AppError, AppResult};
use crate::mailbox::{ChangeSignal, MailboxClient, RawMessage};
use crate::mime::{NormalizedMessage, normalize};
use crate::notify::{DeliverySink, render_alert, render_message};

/// Maximum unread messages handled per fetch cycle
pub const FETCH_BATCH_LIMIT: usize = 50;

/// Lifecycle phase of an account monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Disconnected,
    Connecting,
    Authenticating,
    Discovering,
    Fetching,
    Waiting,
    Backoff,
    /// Terminal: retry limit exhausted
    Fatal,
}

/// Retry policy applied to connection-level failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Consecutive failures that make the account fatal
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

/// Mutable per-account state, owned by exactly one monitor task
#[derive(Debug)]
struct MonitorState {
    phase: MonitorPhase,
    failures: u32,
    retry: RetryPolicy,
    first_connect: bool,
}

/// How a connected session ended without a connection failure
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Clean IDLE timeout; reconnect without counting a failure
    Recycle,
}

/// Counts for one fetch-and-deliver pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub delivered: usize,
    pub undelivered: usize,
    pub skipped: usize,
}

/// Why an account monitor stopped for good
#[derive(Debug)]
pub struct FatalReport {
    /// Account name
    pub account: String,
    /// Consecutive failed attempts when the monitor gave up
    pub attempts: u32,
    /// Text of the last connection error
    pub last_error: String,
}

/// Lifecycle driver for one account
pub struct AccountMonitor<C, S> {
    account: Arc<AccountConfig>,
    client: C,
    sink: S,
    normalize: fn(&RawMessage) -> AppResult<NormalizedMessage>,
    state: MonitorState,
}

impl<C, S> AccountMonitor<C, S>
where
    C: MailboxClient,
    S: DeliverySink,
{
    /// Create a monitor in the `Disconnected` phase
    pub fn new(account: Arc<AccountConfig>, client: C, sink: S, retry: RetryPolicy) -> Self {
        Self {
            account,
            client,
            sink,
            normalize,
            state: MonitorState {
                phase: MonitorPhase::Disconnected,
                failures: 0,
                retry,
                first_connect: true,
            },
        }
    }

    /// Replace the message normalizer
    #[cfg(test)]
    fn with_normalizer(mut self, normalize: fn(&RawMessage) -> AppResult<NormalizedMessage>) -> Self {
        self.normalize = normalize;
        self
    }

    /// Run until the retry limit is exhausted
    ///
    /// Never returns while the account is healthy. The returned report is
    /// produced only after the alert delivery attempt has finished.
    pub async fn run(mut self) -> FatalReport {
        info!(account = %self.account.name, folder = %self.account.folder, "starting mailbox monitor");
        loop {
            let outcome = self.run_session().await;
            self.client.disconnect().await;
            self.set_phase(MonitorPhase::Disconnected);

            match outcome {
                Ok(SessionEnd::Recycle) => {
                    debug!(account = %self.account.name, "reconnecting after idle timeout");
                }
                Err(err) => {
                    if let Some(report) = self.handle_failure(err).await {
                        return report;
                    }
                }
            }
        }
    }

    /// One connected session: connect, log in, deliver, wait, repeat
    ///
    /// Returns `Ok` when the connection should be recycled and `Err` on a
    /// connection-level failure. The caller always disconnects afterwards.
    async fn run_session(&mut self) -> AppResult<SessionEnd> {
        self.set_phase(MonitorPhase::Connecting);
        self.client
            .connect()
            .await
            .map_err(|e| prefix_error("connect", e))?;
        info!(account = %self.account.name, host = %self.account.host, port = self.account.port, "connected");

        self.set_phase(MonitorPhase::Authenticating);
        self.client
            .authenticate()
            .await
            .map_err(|e| prefix_error("login", e))?;
        info!(account = %self.account.name, user = %self.account.user, "logged in");
        self.state.failures = 0;

        if self.state.first_connect {
            self.state.first_connect = false;
            self.discover_folders().await;
        }

        let folder = self.account.folder.clone();
        loop {
            self.fetch_and_deliver(&folder).await;

            self.set_phase(MonitorPhase::Waiting);
            match self
                .client
                .wait_for_change(&folder, self.account.idle_timeout, self.account.poll_interval)
                .await
            {
                ChangeSignal::Signal => continue,
                ChangeSignal::Timeout => return Ok(SessionEnd::Recycle),
                ChangeSignal::Error(err) => return Err(err),
            }
        }
    }

    /// Log the folder list once per monitor; failures are not counted
    async fn discover_folders(&mut self) {
        self.set_phase(MonitorPhase::Discovering);
        match self.client.list_folders().await {
            Ok(folders) => {
                info!(account = %self.account.name, count = folders.len(), "available folders");
                for folder in &folders {
                    info!(account = %self.account.name, "  - {folder}");
                }
            }
            Err(err) => {
                warn!(account = %self.account.name, error = %err, "failed to list folders");
            }
        }
    }

    /// Deliver every unread message in `folder`, marking delivered ones read
    ///
    /// Every failure in here is absorbed: a message that cannot be parsed is
    /// skipped, one that is not delivered stays unread for the next pass.
    async fn fetch_and_deliver(&mut self, folder: &str) -> BatchReport {
        self.set_phase(MonitorPhase::Fetching);
        let mut report = BatchReport::default();

        let messages = match self.client.fetch_unread(folder, FETCH_BATCH_LIMIT).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(account = %self.account.name, folder, error = %err, "failed to fetch messages");
                return report;
            }
        };
        if messages.is_empty() {
            return report;
        }
        report.fetched = messages.len();
        info!(account = %self.account.name, folder, count = messages.len(), "new messages");

        for raw in &messages {
            let message = match (self.normalize)(raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(account = %self.account.name, uid = raw.uid, error = %err, "skipping unparseable message");
                    report.skipped += 1;
                    continue;
                }
            };

            let body = render_message(&message);
            match self.sink.deliver(&message.subject, &body).await {
                Ok(true) => {
                    report.delivered += 1;
                    info!(account = %self.account.name, uid = message.uid, subject = %message.subject, "delivered");
                    if let Err(err) = self.client.mark_read(message.uid).await {
                        warn!(account = %self.account.name, uid = message.uid, error = %err, "failed to mark message read");
                    }
                }
                Ok(false) => {
                    report.undelivered += 1;
                    debug!(account = %self.account.name, uid = message.uid, "not delivered; leaving unread");
                }
                Err(err) => {
                    report.undelivered += 1;
                    warn!(account = %self.account.name, uid = message.uid, error = %err, "delivery failed; leaving unread");
                }
            }
        }

        info!(
            account = %self.account.name,
            fetched = report.fetched,
            delivered = report.delivered,
            undelivered = report.undelivered,
            skipped = report.skipped,
            "batch finished"
        );
        report
    }

    /// Count a connection failure; back off, or alert and give up
    async fn handle_failure(&mut self, err: AppError) -> Option<FatalReport> {
        self.state.failures += 1;
        let attempt = self.state.failures;
        let max = self.state.retry.max_retries;

        if attempt >= max {
            self.set_phase(MonitorPhase::Fatal);
            error!(account = %self.account.name, error = %err, max_retries = max, "maximum retries reached; giving up");
            let last_error = err.to_string();
            self.send_alert(attempt, &last_error).await;
            return Some(FatalReport {
                account: self.account.name.clone(),
                attempts: attempt,
                last_error,
            });
        }

        self.set_phase(MonitorPhase::Backoff);
        warn!(
            account = %self.account.name,
            error = %err,
            attempt,
            max_retries = max,
            "connection failed (attempt {attempt}/{max}); retrying in {:?}",
            self.state.retry.delay
        );
        tokio::time::sleep(self.state.retry.delay).await;
        None
    }

    async fn send_alert(&mut self, attempts: u32, last_error: &str) {
        let (title, body) = render_alert(&self.account.name, attempts, last_error);
        match self.sink.deliver(&title, &body).await {
            Ok(true) => info!(account = %self.account.name, "alert delivered"),
            Ok(false) => warn!(account = %self.account.name, "alert not delivered"),
            Err(err) => error!(account = %self.account.name, error = %err, "alert delivery failed"),
        }
    }

    fn set_phase(&mut self, phase: MonitorPhase) {
        if self.state.phase != phase {
            debug!(account = %self.account.name, from = ?self.state.phase, to = ?phase, "phase change");
            self.state.phase = phase;
        }
    }
}

/// Tag a connection error with the step that produced it
fn prefix_error(step: &str, err: AppError) -> AppError {
    match err {
        AppError::Connection(msg) => AppError::Connection(format!("{step}: {msg}")),
        AppError::Protocol(msg) => AppError::Protocol(format!("{step}: {msg}")),
        AppError::Timeout(msg) => AppError::Timeout(format!("{step}: {msg}")),
        other => other,
    }
}
