//! Background task runner.
//!
//! A database owns one scheduler and routes all of its long-lived work
//! through it: interval-driven tasks (id sync) implement [`BackgroundTask`]
//! and are registered; channel-driven loops (evictor, limit updater) are
//! spawned with [`Scheduler::spawn`] and select on a receiver from
//! [`Scheduler::subscribe`]. One broadcast channel stops everything, and
//! [`Scheduler::shutdown`] waits until every task has returned.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Work the scheduler drives on a fixed interval. Failures are logged and
/// the task keeps its cadence.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    async fn execute(&self) -> Result<()>;
}

pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Registers an interval task. The first run happens immediately, then
    /// on every interval tick until shutdown.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(task.interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = task.execute().await {
                            tracing::error!(
                                task = task.name(),
                                error = %e,
                                "background task failed"
                            );
                        }
                    }

                    _ = shutdown.recv() => {
                        tracing::debug!(task = task.name(), "background task stopping");
                        break;
                    }
                }
            }
        });
        self.tasks.write().unwrap().push(handle);
    }

    /// Spawns a long-lived loop. The future should select on a receiver
    /// from [`Scheduler::subscribe`] so shutdown can reach it.
    pub fn spawn<F>(&self, f: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(f);
        self.tasks.write().unwrap().push(handle);
    }

    /// A fresh receiver for the shutdown signal.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signals every task to stop and waits for all of them.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<_> = self.tasks.write().unwrap().drain(..).collect();
        for task in handles {
            task.await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        runs: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn execute(&self) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingTask;

    #[async_trait::async_trait]
    impl BackgroundTask for FailingTask {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn execute(&self) -> Result<()> {
            Err(crate::Error::IO("injected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_interval_task_runs_until_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(CountingTask { runs: runs.clone() }));
        tokio::time::sleep(Duration::from_millis(40)).await;
        scheduler.shutdown().await?;

        let runs_at_shutdown = runs.load(Ordering::SeqCst);
        assert!(runs_at_shutdown > 0);

        // Nothing runs after shutdown returned.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), runs_at_shutdown);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_task_keeps_its_cadence() -> Result<()> {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));

        scheduler.register(Arc::new(FailingTask));
        scheduler.register(Arc::new(CountingTask { runs: runs.clone() }));
        tokio::time::sleep(Duration::from_millis(40)).await;

        // The failing task neither wedged the scheduler nor its peers,
        // and shutdown still drains both.
        assert!(runs.load(Ordering::SeqCst) > 1);
        scheduler.shutdown().await
    }

    #[tokio::test]
    async fn test_spawned_loop_observes_shutdown() -> Result<()> {
        let scheduler = Scheduler::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        let drained = Arc::new(AtomicUsize::new(0));

        let mut shutdown = scheduler.subscribe();
        let loop_drained = drained.clone();
        scheduler.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    signal = rx.recv() => match signal {
                        Some(()) => { loop_drained.fetch_add(1, Ordering::SeqCst); }
                        None => break,
                    }
                }
            }
        });

        tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(drained.load(Ordering::SeqCst), 1);

        // Shutdown reaches the loop even though the sender is still open.
        scheduler.shutdown().await
    }
}
