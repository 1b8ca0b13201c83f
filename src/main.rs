//! mail-imap-notify-rs: IMAP mailbox watcher that forwards new mail to a webhook
//!
//! Each configured account gets its own monitor that waits for changes with
//! IMAP IDLE (or polling), pushes every unread message to a webhook, and
//! marks it read only after the webhook accepts it. An account that keeps
//! failing to connect sends one alert and stops the process with exit code 1.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with CLI, env loading and signal handling
//! - [`config`]: JSON configuration for accounts and relay settings
//! - [`errors`]: Application error model
//! - [`mailbox`]: Protocol client seam used by the monitor
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`idle`]: IDLE wait vs. timer race and response classification
//! - [`mime`]: Message parsing and header/body extraction
//! - [`html`]: HTML body to plain text
//! - [`notify`]: Notification rendering and webhook delivery
//! - [`monitor`]: Per-account lifecycle, retry and delivery state machine
//! - [`fleet`]: Supervisor running one monitor per account
//! - [`heartbeat`]: Optional liveness ping

mod config;
mod errors;
mod fleet;
mod heartbeat;
mod html;
mod idle;
mod imap;
mod mailbox;
mod mime;
mod monitor;
mod notify;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use config::Config;
use fleet::Supervisor;
use imap::ImapMailboxClient;
use notify::WebhookSink;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "MAIL_NOTIFY_CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Application entry point
///
/// Loads `.env`, initializes tracing (`RUST_LOG`, default `info`), loads the
/// configuration and runs every account until one becomes fatal or a
/// shutdown signal arrives.
///
/// # Exit codes
///
/// - `0` on SIGINT/SIGTERM
/// - `1` on configuration errors or when an account exhausts its retries
#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    // Both aws-lc-rs and ring are compiled in; pick one for the process
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        return Err("failed to install rustls crypto provider".into());
    }

    let cli = Cli::parse();
    let config = Config::load_from_path(&cli.config)?;
    info!(
        path = %cli.config.display(),
        accounts = config.accounts.len(),
        "configuration loaded"
    );

    let timeouts = config.app.timeouts;
    let mut supervisor = Supervisor::spawn(&config, |account| {
        let client = ImapMailboxClient::new(account.clone(), timeouts);
        let sink = WebhookSink::new(account.webhook_url.clone())?;
        Ok((client, sink))
    })?;
    info!(running = supervisor.running(), "account monitors started");

    let heartbeat = match &config.app.heartbeat_url {
        Some(url) => Some(heartbeat::spawn_heartbeat(
            url.clone(),
            config.app.heartbeat_interval,
        )?),
        None => None,
    };

    let code = tokio::select! {
        report = supervisor.wait_for_fatal() => {
            match report {
                Some(report) => error!(
                    account = %report.account,
                    attempts = report.attempts,
                    last_error = %report.last_error,
                    "account monitor gave up; exiting"
                ),
                None => error!("no account monitors left; exiting"),
            }
            ExitCode::FAILURE
        }
        () = shutdown_signal() => {
            info!("shutdown signal received");
            ExitCode::SUCCESS
        }
    };

    if let Some(handle) = heartbeat {
        handle.abort();
    }
    supervisor.shutdown().await;
    Ok(code)
}

/// Resolve on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
