//! Per-repository refresh loops.
//!
//! Every configured repository gets its own task.  A loop claims a token from
//! the shared [`ConcurrencyBudget`] before touching its mirror; when none is
//! free it waits [`SchedulerTiming::fallback`] and tries again.  A failed
//! update is retried up to `retries` times, sleeping `attempt ×
//! backoff_unit` before each retry.  After the cycle the token is returned
//! and the loop sleeps for the repository's interval, whatever the outcome.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::budget::ConcurrencyBudget;
use super::updater::MirrorUpdater;
use crate::config::RepoConfig;
use crate::metrics::{Metrics, UpdateOutcome};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerTiming {
    /// Wait before re-checking an exhausted budget.
    pub fallback: Duration,
    /// Linear backoff step between retries.
    pub backoff_unit: Duration,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self {
            fallback: Duration::from_secs(30),
            backoff_unit: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    updater: Arc<dyn MirrorUpdater>,
    budget: ConcurrencyBudget,
    base_path: PathBuf,
    retries: u32,
    timing: SchedulerTiming,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    pub fn new(
        updater: Arc<dyn MirrorUpdater>,
        budget: ConcurrencyBudget,
        base_path: PathBuf,
        retries: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            updater,
            budget,
            base_path,
            retries,
            timing: SchedulerTiming::default(),
            metrics,
        }
    }

    #[cfg(test)]
    pub fn with_timing(mut self, timing: SchedulerTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Start one refresh loop per repository.  Every loop stops once
    /// `cancel` fires.
    pub fn spawn_all(&self, repos: &[RepoConfig], cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        repos
            .iter()
            .cloned()
            .map(|repo| {
                let scheduler = self.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move { scheduler.run(repo, cancel).await })
            })
            .collect()
    }

    /// Refresh `repo` forever, until `cancel` fires.
    pub async fn run(&self, repo: RepoConfig, cancel: CancellationToken) {
        let interval = repo.refresh_interval();
        info!(repo = %repo.name, interval_secs = interval.as_secs(), "starting refresh loop");

        loop {
            let pause = match self.budget.try_claim() {
                Some(token) => {
                    self.metrics.active_refreshes.inc();
                    debug!(
                        repo = %repo.name,
                        available = self.budget.available(),
                        "claimed refresh token"
                    );
                    let finished = self.refresh(&repo, &cancel).await;
                    self.metrics.active_refreshes.dec();
                    drop(token);
                    if !finished {
                        break;
                    }
                    interval
                }
                None => {
                    debug!(repo = %repo.name, "refresh budget exhausted; waiting");
                    self.timing.fallback
                }
            };

            if !sleep_or_cancel(pause, &cancel).await {
                break;
            }
        }

        info!(repo = %repo.name, "refresh loop stopped");
    }

    /// One refresh cycle including retries.  Returns `false` when cancelled
    /// during a backoff sleep.
    async fn refresh(&self, repo: &RepoConfig, cancel: &CancellationToken) -> bool {
        info!(repo = %repo.name, "updating mirror");

        let mut result = self.attempt(repo).await;
        let mut attempt: u32 = 1;

        while let Err(err) = &result {
            if attempt > self.retries {
                error!(
                    repo = %repo.name,
                    attempts = attempt,
                    error = %format!("{err:#}"),
                    "mirror update failed; giving up until next interval"
                );
                return true;
            }

            if !sleep_or_cancel(self.timing.backoff_unit * attempt, cancel).await {
                return false;
            }
            warn!(
                repo = %repo.name,
                attempt,
                error = %format!("{err:#}"),
                "error updating mirror; retrying"
            );
            self.metrics.mirror_retries_total.inc();

            result = self.attempt(repo).await;
            attempt += 1;
        }

        info!(repo = %repo.name, "updated mirror");
        true
    }

    async fn attempt(&self, repo: &RepoConfig) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = self.updater.update(repo, &self.base_path).await;
        let outcome = if result.is_ok() {
            UpdateOutcome::Success
        } else {
            UpdateOutcome::Failure
        };
        self.metrics
            .record_update(outcome, started.elapsed().as_secs_f64());
        result
    }
}

/// Sleep for `duration`; `false` if `cancel` fired first.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::metrics::MetricsRegistry;

    /// Test double recording when each update ran.
    struct ScriptedUpdater {
        start: Instant,
        calls: Mutex<Vec<Duration>>,
        fail: bool,
        work: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedUpdater {
        fn new(fail: bool, work: Duration) -> Arc<Self> {
            Arc::new(Self {
                start: Instant::now(),
                calls: Mutex::new(Vec::new()),
                fail,
                work,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<Duration> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MirrorUpdater for ScriptedUpdater {
        async fn update(&self, _repo: &RepoConfig, _base_path: &Path) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(self.start.elapsed());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("origin unreachable")
            }
            Ok(())
        }
    }

    fn repo(name: &str, interval: u64) -> RepoConfig {
        RepoConfig {
            name: name.to_string(),
            origin: format!("https://example.com/{name}.git"),
            interval: Some(interval),
        }
    }

    fn scheduler(updater: Arc<ScriptedUpdater>, budget: ConcurrencyBudget, retries: u32) -> Scheduler {
        Scheduler::new(
            updater,
            budget,
            PathBuf::from("/srv/mirrors"),
            retries,
            MetricsRegistry::new().metrics,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn failing_update_is_retried_with_linear_backoff() {
        let updater = ScriptedUpdater::new(true, Duration::ZERO);
        let budget = ConcurrencyBudget::new(1);
        let scheduler = scheduler(updater.clone(), budget.clone(), 3);
        let cancel = CancellationToken::new();

        let handles = scheduler.spawn_all(&[repo("a", 100)], &cancel);
        tokio::time::sleep(Duration::from_secs(50)).await;

        // Initial attempt plus three retries after 1s, 2s and 3s.
        assert_eq!(
            updater.calls(),
            vec![
                Duration::from_secs(0),
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(6),
            ]
        );
        // The token is back while the loop sleeps its interval.
        assert_eq!(budget.available(), 1);

        // The next cycle starts one interval after the last retry and backs
        // off from scratch.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            updater.calls(),
            [0, 1, 3, 6, 106, 107, 109].map(Duration::from_secs).to_vec()
        );

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_update_runs_once_per_interval() {
        let updater = ScriptedUpdater::new(false, Duration::ZERO);
        let scheduler = scheduler(updater.clone(), ConcurrencyBudget::new(1), 3);
        let cancel = CancellationToken::new();

        let handles = scheduler.spawn_all(&[repo("a", 10)], &cancel);
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(
            updater.calls(),
            vec![
                Duration::from_secs(0),
                Duration::from_secs(10),
                Duration::from_secs(20),
            ]
        );

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_never_exceed_budget() {
        let updater = ScriptedUpdater::new(false, Duration::from_secs(10));
        let budget = ConcurrencyBudget::new(2);
        let scheduler = scheduler(updater.clone(), budget.clone(), 0);
        let cancel = CancellationToken::new();

        let repos: Vec<_> = (0..5).map(|i| repo(&format!("r{i}"), 45)).collect();
        let handles = scheduler.spawn_all(&repos, &cancel);
        tokio::time::sleep(Duration::from_secs(300)).await;

        assert_eq!(updater.peak.load(Ordering::SeqCst), 2);
        assert!(updater.calls().len() >= 5);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(budget.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_waits_for_fallback_interval() {
        let updater = ScriptedUpdater::new(false, Duration::ZERO);
        let budget = ConcurrencyBudget::new(1);
        let held = budget.try_claim().unwrap();
        let scheduler = scheduler(updater.clone(), budget.clone(), 3);
        let cancel = CancellationToken::new();

        let handles = scheduler.spawn_all(&[repo("a", 1000)], &cancel);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(updater.calls().is_empty());

        drop(held);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(updater.calls(), vec![Duration::from_secs(30)]);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let updater = ScriptedUpdater::new(true, Duration::ZERO);
        let budget = ConcurrencyBudget::new(1);
        let scheduler = scheduler(updater.clone(), budget.clone(), 10).with_timing(SchedulerTiming {
            fallback: Duration::from_secs(30),
            backoff_unit: Duration::from_secs(60),
        });
        let cancel = CancellationToken::new();

        let handles = scheduler.spawn_all(&[repo("a", 100)], &cancel);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(updater.calls().len(), 1);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(updater.calls().len(), 1);
        assert_eq!(budget.available(), 1);
    }
}
