//! Liveness heartbeat
//!
//! Periodically issues a GET to an external monitoring URL so the relay's
//! process liveness can be observed. Independent of account health.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};

const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
/// Characters of the response body kept in the debug log
const BODY_EXCERPT_CHARS: usize = 120;

/// Start the heartbeat loop: one request now, then one per `interval`
///
/// # Errors
///
/// Returns `Internal` if the HTTP client cannot be constructed.
pub fn spawn_heartbeat(url: String, interval: Duration) -> AppResult<JoinHandle<()>> {
    let http = reqwest::Client::builder()
        .timeout(HEARTBEAT_TIMEOUT)
        .build()
        .map_err(|e| AppError::Internal(format!("HTTP client error: {e}")))?;

    Ok(tokio::spawn(async move {
        // First tick fires immediately
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            beat(&http, &url).await;
        }
    }))
}

async fn beat(http: &reqwest::Client, url: &str) {
    match http.get(url).send().await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            debug!(%status, body = %excerpt(&body), "heartbeat sent");
        }
        Err(err) => warn!(error = %err, "heartbeat failed"),
    }
}

fn excerpt(body: &str) -> &str {
    match body.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::excerpt;

    #[test]
    fn excerpt_cuts_on_char_boundaries() {
        assert_eq!(excerpt("ok"), "ok");
        let long = "\u{e9}".repeat(200);
        assert_eq!(excerpt(&long).chars().count(), 120);
    }
}
