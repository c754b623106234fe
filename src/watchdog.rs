//! Stale-session reaper
//!
//! Periodically force-closes transactions on chargers that have gone
//! quiet for longer than `transaction_timeout`. Dead *connections* are
//! handled per connection by the server's watchdog; this task catches the
//! sessions they leave behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::CsmsConfig;
use crate::model::ModelRegistry;
use crate::support::shutdown::ShutdownSignal;

pub fn spawn(registry: Arc<ModelRegistry>, cfg: CsmsConfig, shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        info!(
            interval = cfg.transaction_interval,
            timeout = cfg.transaction_timeout,
            "Model watchdog started"
        );
        let timeout = chrono::Duration::seconds(cfg.transaction_timeout as i64);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(cfg.transaction_interval)) => {}
                _ = shutdown.notified().wait() => {
                    info!("Model watchdog shutting down");
                    return;
                }
            }
            let closed = registry.reap_stale_sessions(timeout, Utc::now());
            for session in &closed {
                warn!(
                    session_id = session.session_id.as_str(),
                    charger_id = session.charger_id.as_str(),
                    "Stale session closed"
                );
            }
        }
    });
}
