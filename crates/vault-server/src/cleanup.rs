//! Background purge of expired login state and sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vault_store::RecordStore;

use crate::service::VaultServer;

#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    pub login_states_removed: usize,
    pub sessions_removed: usize,
    pub duration_ms: u64,
}

/// Run [`VaultServer::cleanup_expired`] every `interval` until `shutdown`
/// is cancelled.
pub fn spawn_cleanup<S: RecordStore>(
    server: Arc<VaultServer<S>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("cleanup task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match server.cleanup_expired().await {
                        Ok(stats) if stats.login_states_removed > 0 || stats.sessions_removed > 0 => {
                            info!(
                                login_states = stats.login_states_removed,
                                sessions = stats.sessions_removed,
                                duration_ms = stats.duration_ms,
                                "cleanup completed"
                            );
                        }
                        Ok(stats) => {
                            debug!(duration_ms = stats.duration_ms, "cleanup completed with no expired entries");
                        }
                        Err(e) => warn!(error = %e, "cleanup failed"),
                    }
                }
            }
        }
    })
}
