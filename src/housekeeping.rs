//! Background housekeeping
//!
//! Periodic jobs (cache sweeps, quota window rollover, flag evaluation
//! expiry) kept off the request path. Whether a job is due is decided
//! against the injected clock; the background task only polls.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::cache::DiscoveryCache;
use crate::clock::{span, SharedClock};
use crate::quota::QuotaGovernor;
use crate::rollout::RolloutGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HousekeepingJob {
    MemorySweep,
    DurableCleanup,
    QuotaRollover,
    RolloutSweep,
}

impl HousekeepingJob {
    pub const ALL: [HousekeepingJob; 4] = [
        HousekeepingJob::MemorySweep,
        HousekeepingJob::DurableCleanup,
        HousekeepingJob::QuotaRollover,
        HousekeepingJob::RolloutSweep,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MemorySweep => "memory_sweep",
            Self::DurableCleanup => "durable_cleanup",
            Self::QuotaRollover => "quota_rollover",
            Self::RolloutSweep => "rollout_sweep",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    /// Expired memory-tier entries (default: 5 minutes)
    pub memory_sweep_interval: Duration,
    /// Expired durable-tier entries (default: 6 hours)
    pub durable_cleanup_interval: Duration,
    /// Quota window rollover (default: 1 minute)
    pub quota_rollover_interval: Duration,
    /// Expired flag evaluations (default: 5 minutes)
    pub rollout_sweep_interval: Duration,
    /// Poll period of the background task (default: 1 second)
    pub tick: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            memory_sweep_interval: Duration::from_secs(5 * 60),
            durable_cleanup_interval: Duration::from_secs(6 * 60 * 60),
            quota_rollover_interval: Duration::from_secs(60),
            rollout_sweep_interval: Duration::from_secs(5 * 60),
            tick: Duration::from_secs(1),
        }
    }
}

impl HousekeepingConfig {
    pub fn interval(&self, job: HousekeepingJob) -> Duration {
        match job {
            HousekeepingJob::MemorySweep => self.memory_sweep_interval,
            HousekeepingJob::DurableCleanup => self.durable_cleanup_interval,
            HousekeepingJob::QuotaRollover => self.quota_rollover_interval,
            HousekeepingJob::RolloutSweep => self.rollout_sweep_interval,
        }
    }
}

/// One job run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRun {
    pub job: HousekeepingJob,
    /// Entries removed or windows rolled over
    pub affected: usize,
}

pub struct Housekeeper {
    config: HousekeepingConfig,
    clock: SharedClock,
    cache: Arc<DiscoveryCache>,
    quota: Arc<QuotaGovernor>,
    rollout: Arc<RolloutGate>,
    next_due: Mutex<BTreeMap<HousekeepingJob, DateTime<Utc>>>,
}

impl Housekeeper {
    /// Every job first becomes due one interval after construction
    pub fn new(
        config: HousekeepingConfig,
        clock: SharedClock,
        cache: Arc<DiscoveryCache>,
        quota: Arc<QuotaGovernor>,
        rollout: Arc<RolloutGate>,
    ) -> Self {
        let now = clock.now();
        let next_due = HousekeepingJob::ALL
            .iter()
            .map(|job| (*job, now + span(config.interval(*job))))
            .collect();

        Self {
            config,
            clock,
            cache,
            quota,
            rollout,
            next_due: Mutex::new(next_due),
        }
    }

    pub fn config(&self) -> &HousekeepingConfig {
        &self.config
    }

    /// Run every job whose time has come and reschedule it
    pub async fn run_due(&self) -> Vec<JobRun> {
        let now = self.clock.now();
        let due: Vec<HousekeepingJob> = {
            let mut schedule = self.next_due.lock().unwrap_or_else(PoisonError::into_inner);
            let due: Vec<HousekeepingJob> = schedule
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(job, _)| *job)
                .collect();
            for job in &due {
                schedule.insert(*job, now + span(self.config.interval(*job)));
            }
            due
        };

        let mut runs = Vec::with_capacity(due.len());
        for job in due {
            runs.push(self.run_job(job).await);
        }
        runs
    }

    /// Run one job immediately, leaving its schedule untouched
    pub async fn run_job(&self, job: HousekeepingJob) -> JobRun {
        let affected = match job {
            HousekeepingJob::MemorySweep => self.cache.sweep_memory(),
            HousekeepingJob::DurableCleanup => self.cache.cleanup().await,
            HousekeepingJob::QuotaRollover => self.quota.roll_over_all(),
            HousekeepingJob::RolloutSweep => self.rollout.sweep_evaluations(),
        };
        debug!(job = job.as_str(), affected, "Housekeeping job completed");
        JobRun { job, affected }
    }

    pub fn next_due(&self, job: HousekeepingJob) -> Option<DateTime<Utc>> {
        self.next_due
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job)
            .copied()
    }
}

/// Poll `housekeeper` every `tick` on its own task
pub fn spawn_housekeeping_task(housekeeper: Arc<Housekeeper>, tick: Duration) -> JoinHandle<()> {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            housekeeper.run_due().await;
        }
    });

    info!(tick_ms = tick.as_millis() as u64, "Housekeeping task started");
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::clock::ManualClock;
    use crate::quota::QuotaConfig;
    use crate::rollout::{IdentityContext, RolloutConfig, COMPANY_DISCOVERY};
    use crate::store::{MemoryStore, SharedStore};
    use crate::types::Candidate;

    struct Fixture {
        housekeeper: Housekeeper,
        clock: Arc<ManualClock>,
        cache: Arc<DiscoveryCache>,
        rollout: Arc<RolloutGate>,
    }

    fn fixture() -> Fixture {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let cache = Arc::new(DiscoveryCache::new(CacheConfig::default(), store.clone(), clock.clone()));
        let quota = Arc::new(QuotaGovernor::new(QuotaConfig::default(), store.clone(), clock.clone()));
        let rollout = Arc::new(RolloutGate::new(RolloutConfig::default(), store, clock.clone()));
        let housekeeper = Housekeeper::new(
            HousekeepingConfig::default(),
            clock.clone(),
            cache.clone(),
            quota,
            rollout.clone(),
        );
        Fixture {
            housekeeper,
            clock,
            cache,
            rollout,
        }
    }

    #[tokio::test]
    async fn test_nothing_due_at_start() {
        let f = fixture();
        assert!(f.housekeeper.run_due().await.is_empty());
    }

    #[tokio::test]
    async fn test_jobs_run_on_their_own_schedule() {
        let f = fixture();
        f.clock.advance(Duration::from_secs(60));
        let runs = f.housekeeper.run_due().await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job, HousekeepingJob::QuotaRollover);

        f.clock.advance(Duration::from_secs(4 * 60));
        let jobs: Vec<HousekeepingJob> = f.housekeeper.run_due().await.into_iter().map(|r| r.job).collect();
        assert_eq!(
            jobs,
            vec![
                HousekeepingJob::MemorySweep,
                HousekeepingJob::QuotaRollover,
                HousekeepingJob::RolloutSweep
            ]
        );
        assert!(f.housekeeper.run_due().await.is_empty());
    }

    #[tokio::test]
    async fn test_sweeps_remove_expired_entries() {
        let f = fixture();
        f.cache
            .set("Acme", vec![Candidate::new("https://example.com/acme", "Acme", "acme", 0.9)])
            .await;
        f.rollout.is_enabled(COMPANY_DISCOVERY, &IdentityContext::system());

        f.clock.advance(Duration::from_secs(2 * 60 * 60));
        let runs = f.housekeeper.run_due().await;
        let affected = |job: HousekeepingJob| runs.iter().find(|r| r.job == job).map(|r| r.affected);
        assert_eq!(affected(HousekeepingJob::MemorySweep), Some(1));
        assert_eq!(affected(HousekeepingJob::RolloutSweep), Some(1));
        assert_eq!(affected(HousekeepingJob::DurableCleanup), None);

        f.clock.advance(Duration::from_secs(7 * 24 * 60 * 60));
        let run = f.housekeeper.run_job(HousekeepingJob::DurableCleanup).await;
        assert_eq!(run.affected, 1);
    }
}
