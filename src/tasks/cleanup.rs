//! TTL Cleanup Task
//!
//! Background task that periodically removes expired entries from one shard.
//!
//! The sweep cadence adapts to what it finds: a sweep that removes nothing
//! doubles the interval up to a cap, and any sweep that removes at least one
//! entry resets it to the base. The task reacts to its stop signal only at
//! sleep boundaries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::clock::Clock;
use crate::cache::shard::Shard;

/// Starting sweep interval.
pub(crate) const BASE_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Longest interval the backoff may reach.
pub(crate) const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Owning handle for one shard's sweeper; dropping the shard goes through
/// [`CleanerHandle::shutdown`] so the task never outlives its shard pool.
pub(crate) struct CleanerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CleanerHandle {
    pub(crate) fn shutdown(self) {
        let _ = self.stop.send(true);
        self.task.abort();
    }
}

/// Spawns the sweeper for one shard.
///
/// Must be called from within a tokio runtime; the manager only does so when
/// the cleaner is enabled in the configuration.
pub(crate) fn spawn_cleaner<V: Send + Sync + 'static>(
    shard: Arc<Shard<V>>,
    clock: Arc<dyn Clock>,
) -> CleanerHandle {
    let (stop, mut stopped) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut interval = BASE_SWEEP_INTERVAL;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let removed = shard.clean_expired(clock.now_unix());
                    if removed == 0 {
                        interval = (interval * 2).min(MAX_SWEEP_INTERVAL);
                        debug!(
                            next_sweep_secs = interval.as_secs(),
                            "sweep removed nothing, backing off"
                        );
                    } else {
                        interval = BASE_SWEEP_INTERVAL;
                        info!(removed, "sweep removed expired entries");
                    }
                }
                _ = stopped.changed() => break,
            }
        }
    });

    CleanerHandle { stop, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    fn expiring_shard(clock: &ManualClock) -> Arc<Shard<String>> {
        let shard = Arc::new(Shard::new(16, u64::MAX));
        let now = clock.now_unix();
        shard.insert(b"soon".to_vec().into(), "v".into(), 0, now + 1, now);
        shard.insert(b"later".to_vec().into(), "v".into(), 0, now + 1000, now);
        shard.insert(b"never".to_vec().into(), "v".into(), 0, 0, now);
        shard
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleaner_removes_expired_entries() {
        let clock = Arc::new(ManualClock::new(100));
        let shard = expiring_shard(&clock);

        let handle = spawn_cleaner(Arc::clone(&shard), clock.clone());

        clock.advance(2);
        tokio::time::sleep(BASE_SWEEP_INTERVAL + Duration::from_secs(1)).await;

        assert_eq!(shard.len(), 2, "only the short-TTL entry should be swept");
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleaner_preserves_unexpired_entries() {
        let clock = Arc::new(ManualClock::new(100));
        let shard = expiring_shard(&clock);

        let handle = spawn_cleaner(Arc::clone(&shard), clock.clone());

        // Several quiet sweeps; nothing has expired yet.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(shard.len(), 3);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleaner_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(100));
        let shard: Arc<Shard<String>> = Arc::new(Shard::new(16, u64::MAX));

        let handle = spawn_cleaner(Arc::clone(&shard), clock.clone());
        handle.shutdown();

        // A post-shutdown expiry is never swept.
        let now = clock.now_unix();
        shard.insert(b"k".to_vec().into(), "v".into(), 0, now + 1, now);
        clock.advance(10);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(shard.len(), 1);
    }
}
