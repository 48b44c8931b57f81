use crate::error::{PlexDbError, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Fixed-interval background jobs owned by one database instance. Started
/// at open, stopped by `shutdown` at close (or on drop).
pub struct BackgroundTasks {
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundTasks {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        BackgroundTasks {
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Run `job` every `period` until shutdown. The first run happens one
    /// period after the call. A failing run is logged and the timer keeps
    /// going. Must be called from within a tokio runtime.
    pub fn spawn_periodic<F, Fut>(&self, name: &'static str, period: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = job().await {
                            log::error!("Background task '{name}' failed: {e}");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        log::debug!("Background task '{name}' shutting down");
                        break;
                    }
                }
            }
        });
        self.handles.lock().push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal every task to stop and wait for them to finish
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for (name, handle) in handles {
            handle
                .await
                .map_err(|e| PlexDbError::Task(format!("{name}: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_periodic_job_runs_until_shutdown() {
        let tasks = BackgroundTasks::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        tasks.spawn_periodic("count", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        assert_eq!(tasks.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        tasks.shutdown().await.unwrap();
        assert!(tasks.is_empty());

        let after_shutdown = runs.load(Ordering::SeqCst);
        assert!(after_shutdown >= 2, "ran {after_shutdown} times");
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_shutdown);
    }

    #[tokio::test]
    async fn test_failing_job_keeps_running() {
        let tasks = BackgroundTasks::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        tasks.spawn_periodic("fail", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(PlexDbError::Task("boom".into()))
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tasks.shutdown().await.unwrap();
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_drop_stops_tasks() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let tasks = BackgroundTasks::new();
            let counter = runs.clone();
            tasks.spawn_periodic("drop", Duration::from_millis(10), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
