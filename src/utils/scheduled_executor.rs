use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A task executed periodically by [`ScheduledExecutor`]. Used for the
/// maintenance sweeps: expired cache entries, expired analysis requests and
/// expired stored content.
pub trait ScheduledTask: Send + Sync + 'static {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>>;

    /// When this returns true the executor stops after the current tick.
    fn should_terminate(&self) -> bool {
        false
    }
}

impl<T: ScheduledTask> ScheduledTask for Arc<T> {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        (**self).run()
    }

    fn should_terminate(&self) -> bool {
        (**self).should_terminate()
    }
}

/// Runs a [`ScheduledTask`] on a fixed interval until shut down. Task
/// failures are logged and do not stop the schedule.
pub struct ScheduledExecutor {
    task_name: String,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl ScheduledExecutor {
    pub fn new(task_name: impl Into<String>, interval: Duration) -> Self {
        Self { task_name: task_name.into(), interval, shutdown: Arc::new(AtomicBool::new(false)) }
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub async fn start<T: ScheduledTask>(self, task: T) {
        tracing::info!("starting scheduled task '{}' every {:?}", self.task_name, self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so the first run happens
        // one interval after startup
        ticker.tick().await;

        loop {
            ticker.tick().await;

            if self.shutdown.load(Ordering::Relaxed) || task.should_terminate() {
                break;
            }

            if let Err(error) = task.run().await {
                tracing::error!("scheduled task '{}' failed: {}", self.task_name, error);
            }
        }

        tracing::info!("scheduled task '{}' stopped", self.task_name);
    }
}
