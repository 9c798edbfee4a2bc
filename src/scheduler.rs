use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Rate-limited job scheduler for the analysis path.
///
/// Admits jobs FIFO under two global bounds: at most `max_concurrent` jobs
/// run simultaneously, and consecutive job starts are at least `min_spacing`
/// apart. Both the semaphore and the spacing gate are fair, so queued jobs
/// start in submission order. A job's own error never cancels siblings.
///
/// Owned by the process and passed by reference to call sites; there is no
/// ambient global instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    semaphore: Semaphore,
    /// Start time of the most recently admitted job.
    gate: Mutex<Option<Instant>>,
    min_spacing: Duration,
}

impl Scheduler {
    pub fn new(max_concurrent: usize, min_spacing: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                semaphore: Semaphore::new(max_concurrent.max(1)),
                gate: Mutex::new(None),
                min_spacing,
            }),
        }
    }

    /// Run a job under the concurrency and spacing bounds, resolving to the
    /// job's own output.
    pub async fn run<F, Fut, T>(&self, job: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self
            .inner
            .semaphore
            .acquire()
            .await
            .expect("scheduler semaphore is never closed");

        {
            // Holding the gate through the sleep is what spaces the starts:
            // the next admitted job cannot read the gate until this one has
            // actually started.
            let mut gate = self.inner.gate.lock().await;
            if let Some(last_start) = *gate {
                let target = last_start + self.inner.min_spacing;
                if target > Instant::now() {
                    sleep_until(target).await;
                }
            }
            *gate = Some(Instant::now());
        }

        job().await
    }

    /// Fire-and-forget variant for background work.
    pub fn spawn<F, Fut, T>(&self, job: F) -> JoinHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send,
        T: Send + 'static,
    {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(job).await })
    }
}
