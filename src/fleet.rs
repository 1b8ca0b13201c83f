//! Fleet supervision
//!
//! Runs one independent [`AccountMonitor`] task per configured account and
//! surfaces the first account that gives up. Accounts share nothing mutable;
//! a failing account never disturbs the others until it turns fatal.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tracing::error;

use crate::config::{AccountConfig, Config};
use crate::errors::AppResult;
use crate::mailbox::MailboxClient;
use crate::monitor::{AccountMonitor, FatalReport, RetryPolicy};
use crate::notify::DeliverySink;

/// Owns the running account monitor tasks
///
/// Dropping the supervisor aborts every monitor still running.
pub struct Supervisor {
    tasks: JoinSet<FatalReport>,
}

impl Supervisor {
    /// Spawn a monitor for every account in `config`
    ///
    /// `factory` builds the mailbox client and delivery sink for an account.
    ///
    /// # Errors
    ///
    /// Returns the first factory error; monitors already spawned are aborted
    /// when the partially built supervisor is dropped.
    pub fn spawn<C, S, F>(config: &Config, mut factory: F) -> AppResult<Self>
    where
        C: MailboxClient + 'static,
        S: DeliverySink + 'static,
        F: FnMut(&Arc<AccountConfig>) -> AppResult<(C, S)>,
    {
        let retry = RetryPolicy {
            max_retries: config.app.max_retries,
            delay: config.app.retry_delay,
        };

        let mut tasks = JoinSet::new();
        for account in config.accounts.values() {
            let (client, sink) = factory(account)?;
            let monitor = AccountMonitor::new(Arc::clone(account), client, sink, retry);
            let name = account.name.clone();
            tasks.spawn(async move {
                match AssertUnwindSafe(monitor.run()).catch_unwind().await {
                    Ok(report) => report,
                    Err(_) => {
                        error!(account = %name, "monitor task panicked");
                        FatalReport {
                            account: name,
                            attempts: 0,
                            last_error: "monitor task panicked".to_owned(),
                        }
                    }
                }
            });
        }
        Ok(Self { tasks })
    }

    /// Number of monitors still running
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Wait until any account becomes fatal
    ///
    /// Returns `None` only when no monitors are left to wait on.
    pub async fn wait_for_fatal(&mut self) -> Option<FatalReport> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(report) => return Some(report),
                Err(err) if err.is_cancelled() => continue,
                Err(err) => {
                    error!(error = %err, "monitor task failed");
                    return Some(FatalReport {
                        account: "<unknown>".to_owned(),
                        attempts: 0,
                        last_error: err.to_string(),
                    });
                }
            }
        }
        None
    }

    /// Abort every monitor and wait for them to stop
    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}
