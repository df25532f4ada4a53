//! Periodic background sync.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SyncError, ValidationError};
use crate::sync::cancel::{CancelSource, CancelToken};
use crate::sync::sync_engine::SyncEngine;

struct Schedule {
    stop: CancelSource,
    handle: JoinHandle<()>,
    interval: Duration,
}

/// Runs [`SyncEngine::sync`] every `interval` on the tokio runtime.
///
/// Ticks that land while a cycle is running are answered by the engine's
/// in-flight check, so cycles never overlap. Stopping does not interrupt a
/// cycle already under way; the loop exits once it returns.
pub struct BackgroundSync {
    engine: Arc<SyncEngine>,
    schedule: Mutex<Option<Schedule>>,
}

impl BackgroundSync {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            schedule: Mutex::new(None),
        }
    }

    fn schedule(&self) -> MutexGuard<'_, Option<Schedule>> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start (or restart) the schedule. The first cycle fires one interval
    /// from now. Must be called from within a tokio runtime.
    pub fn start(&self, interval: Duration) -> Result<(), SyncError> {
        if interval.is_zero() {
            return Err(ValidationError::InvalidValue {
                field: "interval".into(),
                message: "must be greater than zero".into(),
            }
            .into());
        }
        let mut schedule = self.schedule();
        if let Some(previous) = schedule.take() {
            previous.stop.cancel();
        }

        let stop = CancelSource::new();
        let handle = tokio::spawn(run_loop(self.engine.clone(), interval, stop.token()));
        info!(interval_secs = interval.as_secs(), "background sync started");
        *schedule = Some(Schedule {
            stop,
            handle,
            interval,
        });
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(schedule) = self.schedule().take() {
            schedule.stop.cancel();
            info!("background sync stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.schedule()
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    pub fn interval(&self) -> Option<Duration> {
        self.schedule().as_ref().map(|s| s.interval)
    }
}

impl Drop for BackgroundSync {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(engine: Arc<SyncEngine>, interval: Duration, stop: CancelToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        // Cycles run to completion; the stop signal is checked between them.
        let result = engine.sync(&CancelToken::never()).await;
        if result.success {
            debug!(
                pushed = result.items_pushed,
                pulled = result.items_pulled,
                "background sync finished"
            );
        } else {
            warn!(errors = ?result.errors, "background sync finished with errors");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::{InMemoryRemote, RemoteCall};
    use crate::storage::TaskDb;
    use crate::sync::types::SyncOptions;

    fn engine() -> (Arc<SyncEngine>, Arc<InMemoryRemote>) {
        let repo = Arc::new(TaskDb::open_in_memory().unwrap());
        let remote = Arc::new(InMemoryRemote::new());
        let engine = SyncEngine::new(repo, remote.clone(), SyncOptions::default());
        (Arc::new(engine), remote)
    }

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
        // Let the spawned loop observe the elapsed timer and finish its cycle.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_every_interval() {
        let (engine, remote) = engine();
        let background = BackgroundSync::new(engine);
        background.start(Duration::from_secs(60)).unwrap();
        assert!(background.is_running());

        advance(Duration::from_secs(30)).await;
        assert_eq!(remote.calls(RemoteCall::ListLists), 0);

        advance(Duration::from_secs(31)).await;
        assert_eq!(remote.calls(RemoteCall::ListLists), 1);

        advance(Duration::from_secs(60)).await;
        assert_eq!(remote.calls(RemoteCall::ListLists), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_further_cycles() {
        let (engine, remote) = engine();
        let background = BackgroundSync::new(engine);
        background.start(Duration::from_secs(10)).unwrap();
        advance(Duration::from_secs(11)).await;
        assert_eq!(remote.calls(RemoteCall::ListLists), 1);

        background.stop();
        advance(Duration::from_secs(100)).await;
        assert_eq!(remote.calls(RemoteCall::ListLists), 1);
        assert!(!background.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_schedule() {
        let (engine, remote) = engine();
        let background = BackgroundSync::new(engine);
        background.start(Duration::from_secs(10)).unwrap();
        background.start(Duration::from_secs(100)).unwrap();
        assert_eq!(background.interval(), Some(Duration::from_secs(100)));

        advance(Duration::from_secs(50)).await;
        assert_eq!(remote.calls(RemoteCall::ListLists), 0);
        advance(Duration::from_secs(51)).await;
        assert_eq!(remote.calls(RemoteCall::ListLists), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let (engine, _) = engine();
        let background = BackgroundSync::new(engine);
        let err = background.start(Duration::ZERO).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert!(!background.is_running());
    }
}
