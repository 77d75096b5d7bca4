use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::services::refresh_store::RefreshTokenStore;

/// Periodically runs `sweep_expired` on the configured store.
pub fn spawn_session_sweeper(
    store: Arc<dyn RefreshTokenStore>,
    interval_seconds: u64,
) -> Option<JoinHandle<()>> {
    if interval_seconds == 0 {
        tracing::info!("Session sweeper disabled");
        return None;
    }

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.sweep_expired(Utc::now()).await {
                Ok(0) => tracing::debug!("Session sweep found nothing to remove"),
                Ok(removed) => tracing::info!(removed, "Session sweep removed expired families"),
                Err(err) => tracing::error!(error = ?err, "Session sweep failed"),
            }
        }
    });
    Some(handle)
}
