//! Background Token Reaper
//!
//! Reads already treat expired tokens as invalid, but a token that nobody
//! reads or deletes again would otherwise stay in memory forever. The reaper
//! is a Tokio task that wakes once per interval and deletes every expired
//! record under the table's write lock.
//!
//! The task is owned by a [`TokenReaper`] handle. Dropping the handle
//! signals the task to stop; [`TokenReaper::shutdown`] also waits for it to
//! finish, which is what the token store does on close.

use crate::session::token::TokenTable;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the token reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Time between sweeps (default: 1 hour)
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
        }
    }
}

/// Handle to a running reaper task.
#[derive(Debug)]
pub struct TokenReaper {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TokenReaper {
    /// Spawns the reaper on the current Tokio runtime.
    pub(crate) fn start(table: Arc<TokenTable>, config: ReaperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let interval = config.interval;

        let task = tokio::spawn(reaper_loop(table, config, shutdown_rx));
        info!(interval_secs = interval.as_secs_f64(), "Token reaper started");

        Self {
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Signals the task to stop without waiting for it.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Stops the task and waits until it has exited.
    pub async fn shutdown(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Token reaper ended abnormally");
            }
        }
        info!("Token reaper stopped");
    }
}

impl Drop for TokenReaper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn reaper_loop(
    table: Arc<TokenTable>,
    config: ReaperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Token reaper received shutdown signal");
                    return;
                }
            }
        }

        let removed = table.purge_expired();
        if removed > 0 {
            debug!(
                removed = removed,
                remaining = table.len(),
                "Expired tokens reaped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::session::descriptor::ConnectionDescriptor;
    use crate::session::token::{MemoryTokenStore, TokenStore};
    use super::*;

    fn fast() -> ReaperConfig {
        ReaperConfig {
            interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_reaper_removes_unread_expired_tokens() {
        let store = MemoryTokenStore::new(fast());
        let descriptor = ConnectionDescriptor::new("localhost", 6379);

        for i in 0..10 {
            store
                .put(&format!("short-{i}"), descriptor.clone(), Duration::from_millis(30))
                .await
                .unwrap();
        }
        store
            .put("long", descriptor, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.stats().await.total, 11);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let stats = store.stats().await;
        assert_eq!(stats.total, 1);
        assert_eq!(stats.valid, 1);
        assert_eq!(store.reaped(), 10);
        store.close().await;
    }

    #[tokio::test]
    async fn test_close_joins_reaper() {
        let store = MemoryTokenStore::new(fast());
        assert!(store.reaper_running());

        store.close().await;
        assert!(!store.reaper_running());

        // Idempotent.
        store.close().await;
    }

    #[tokio::test]
    async fn test_stopped_reaper_leaves_expired_records() {
        let store = MemoryTokenStore::new(fast());
        store.close().await;

        store
            .put(
                "t",
                ConnectionDescriptor::new("localhost", 6379),
                Duration::from_millis(10),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Lazily invalid, but nothing swept it.
        assert!(!store.is_valid("t").await);
        assert_eq!(store.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_dropping_handle_stops_task() {
        let table = Arc::new(TokenTable::default());
        let reaper = TokenReaper::start(Arc::clone(&table), fast());
        let task_alive = reaper.is_running();
        drop(reaper);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(task_alive);
        // Only the test still holds the table once the task has exited.
        assert_eq!(Arc::strong_count(&table), 1);
    }
}
