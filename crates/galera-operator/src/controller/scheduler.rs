//! Recurring per-cluster background jobs
//!
//! One registry lives for the whole process. Each cluster key has at most
//! one job, running on its own tokio task at a fixed interval. Jobs are
//! responsible for taking the cluster's lock themselves.

use std::future::Future;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

struct ScheduledJob {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// Process-wide registry of scheduled jobs, keyed by `<namespace>/<name>`
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, ScheduledJob>,
}

impl JobRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `interval` for `key`
    ///
    /// Registering the same interval again is a no-op. A different interval
    /// aborts the running task and replaces it. Returns whether a task was
    /// started.
    pub fn register<F, Fut>(&self, key: &str, interval: Duration, job: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self.jobs.entry(key.to_string()) {
            Entry::Occupied(existing)
                if existing.get().interval == interval && !existing.get().handle.is_finished() =>
            {
                false
            }
            Entry::Occupied(mut existing) => {
                debug!(key, ?interval, "rescheduling job");
                existing.get().handle.abort();
                existing.insert(spawn_job(interval, job));
                true
            }
            Entry::Vacant(slot) => {
                debug!(key, ?interval, "scheduling job");
                slot.insert(spawn_job(interval, job));
                true
            }
        }
    }

    /// Stop and forget the job for `key`; returns whether one existed
    pub fn deregister(&self, key: &str) -> bool {
        match self.jobs.remove(key) {
            Some((_, job)) => {
                debug!(key, "removing scheduled job");
                job.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Interval of the job registered for `key`
    pub fn schedule_of(&self, key: &str) -> Option<Duration> {
        self.jobs.get(key).map(|j| j.interval)
    }

    /// Number of registered jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// True if no job is registered
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        for job in self.jobs.iter() {
            job.handle.abort();
        }
    }
}

fn spawn_job<F, Fut>(interval: Duration, job: F) -> ScheduledJob
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick completes immediately
        loop {
            ticker.tick().await;
            job().await;
        }
    });
    ScheduledJob { interval, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_job(counter: Arc<AtomicUsize>) -> impl Fn() -> std::future::Ready<()> {
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn job_runs_each_interval_after_the_first() {
        let registry = JobRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(registry.register("db/prod", Duration::from_secs(10), counting_job(runs.clone())));

        advance(5).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        advance(30).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn same_schedule_is_not_restarted() {
        let registry = JobRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        assert!(registry.register("db/prod", Duration::from_secs(10), counting_job(runs.clone())));
        advance(8).await;
        // Re-registering must not reset the timer
        assert!(!registry.register("db/prod", Duration::from_secs(10), counting_job(runs.clone())));
        advance(4).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn changed_schedule_replaces_job() {
        let registry = JobRegistry::new();
        let old_runs = Arc::new(AtomicUsize::new(0));
        let new_runs = Arc::new(AtomicUsize::new(0));
        registry.register("db/prod", Duration::from_secs(10), counting_job(old_runs.clone()));
        assert!(registry.register("db/prod", Duration::from_secs(3), counting_job(new_runs.clone())));
        assert_eq!(registry.schedule_of("db/prod"), Some(Duration::from_secs(3)));

        advance(20).await;
        assert_eq!(old_runs.load(Ordering::SeqCst), 0);
        assert!(new_runs.load(Ordering::SeqCst) >= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn deregister_stops_job() {
        let registry = JobRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));
        registry.register("db/prod", Duration::from_secs(1), counting_job(runs.clone()));
        assert!(registry.deregister("db/prod"));
        assert!(!registry.deregister("db/prod"));

        advance(5).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }
}
