//! Live-wait race and IDLE response classification
//!
//! An IDLE wait is raced against a timer. Whichever side loses is actively
//! stopped: when the timer fires first the IDLE is interrupted and drained
//! before the caller sends `DONE`, so no background work outlives the call.

use std::future::Future;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::imap_proto::{MailboxDatum, Response};
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::mailbox::{ChangeSignal, MailboxClient};

/// Result of racing a wait future against the idle timeout
#[derive(Debug, PartialEq, Eq)]
pub enum Raced<T> {
    /// The wait future resolved before the timer
    Finished(T),
    /// The timer fired; the wait was interrupted and drained
    TimedOut,
}

/// Race `wait` against a timer of `idle_timeout`
///
/// On timeout `interrupt` is invoked and `wait` is then polled to completion
/// so it can unwind cleanly.
pub async fn race_with_timeout<F, I>(wait: F, interrupt: I, idle_timeout: Duration) -> Raced<F::Output>
where
    F: Future,
    I: FnOnce(),
{
    let mut wait = std::pin::pin!(wait);
    let winner = tokio::select! {
        out = &mut wait => Some(out),
        () = tokio::time::sleep(idle_timeout) => None,
    };

    match winner {
        Some(out) => Raced::Finished(out),
        None => {
            interrupt();
            let _ = wait.await;
            Raced::TimedOut
        }
    }
}

/// Re-select `folder` every `poll_interval` until its message count differs
/// from `baseline`
///
/// Never times out on its own. A changed count yields `Signal`, a failed
/// SELECT yields `Error`.
pub async fn poll_for_change<C>(
    client: &mut C,
    folder: &str,
    baseline: u32,
    poll_interval: Duration,
) -> ChangeSignal
where
    C: MailboxClient,
{
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match client.select_folder(folder).await {
            Ok(count) if count != baseline => {
                info!(folder, previous = baseline, current = count, "message count changed");
                return ChangeSignal::Signal;
            }
            Ok(_) => {}
            Err(err) => return ChangeSignal::Error(err),
        }
    }
}

/// Map an IDLE outcome to the change signal the monitor consumes
///
/// New data counts as a signal only when it says something about messages
/// in the folder; keepalives and status chatter are handled like a timeout.
pub fn classify_idle_response(response: &IdleResponse) -> ChangeSignal {
    match response {
        IdleResponse::NewData(data) if is_actionable(data.parsed()) => ChangeSignal::Signal,
        IdleResponse::NewData(_) | IdleResponse::Timeout | IdleResponse::ManualInterrupt => {
            ChangeSignal::Timeout
        }
    }
}

/// Whether an unsolicited response may change the unread set
pub fn is_actionable(response: &Response<'_>) -> bool {
    matches!(
        response,
        Response::MailboxData(MailboxDatum::Exists(_) | MailboxDatum::Recent(_))
            | Response::Expunge(_)
            | Response::Fetch(..)
    )
}
