//! Priority request scheduler
//!
//! A single worker loop serializes provider calls. Requests are served high,
//! then normal, then low, FIFO within a tier. Before each dispatch the loop
//! re-checks the cache (late hit) and the quota (deny without spending a
//! retry). Retry backoff is a `ready_at` timestamp on the queued request; the
//! loop alone decides when it runs again.

mod queue;

pub use queue::{QueueRequest, RequestQueue};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::DiscoveryCache;
use crate::clock::{span, until, SharedClock};
use crate::provider::SharedProvider;
use crate::quota::QuotaGovernor;
use crate::resilience::{fallback::CONTEXT_NAME, Backoff, Recovery, ResilienceController, COMPANY_SEARCH};
use crate::types::{Candidate, Discovery, GuardError, Priority, Result};

// ============================================================================
// Configuration and stats
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Scheduler-level retries per request (default: 2)
    pub max_retries: u32,
    /// Re-queue delay after a failed dispatch
    pub backoff: Backoff,
    /// Base pause between dispatches (default: 250ms)
    pub pacing: Duration,
    /// Pending requests before non-high submissions are refused (default: 100)
    pub max_queue_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::default(),
            pacing: Duration::from_millis(250),
            max_queue_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
    pub average_wait_ms: f64,
    pub paused: bool,
    pub running: bool,
}

/// Handle to a submitted lookup
#[derive(Debug)]
pub struct LookupTicket {
    pub id: Uuid,
    rx: oneshot::Receiver<Result<Discovery>>,
}

impl LookupTicket {
    pub async fn wait(self) -> Result<Discovery> {
        self.rx.await.unwrap_or(Err(GuardError::Cancelled))
    }
}

enum Next {
    Dispatch(QueueRequest),
    WaitUntil(DateTime<Utc>),
    Idle,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct Scheduler {
    config: SchedulerConfig,
    clock: SharedClock,
    cache: Arc<DiscoveryCache>,
    quota: Arc<QuotaGovernor>,
    resilience: Arc<ResilienceController>,
    provider: SharedProvider,
    queue: Mutex<RequestQueue>,
    notify: Notify,
    paused: AtomicBool,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    wait_total_ms: AtomicU64,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        clock: SharedClock,
        cache: Arc<DiscoveryCache>,
        quota: Arc<QuotaGovernor>,
        resilience: Arc<ResilienceController>,
        provider: SharedProvider,
    ) -> Self {
        info!(
            max_retries = config.max_retries,
            pacing_ms = config.pacing.as_millis() as u64,
            max_queue_size = config.max_queue_size,
            provider = provider.id(),
            "Scheduler initialized"
        );

        Self {
            config,
            clock,
            cache,
            quota,
            resilience,
            provider,
            queue: Mutex::new(RequestQueue::new()),
            notify: Notify::new(),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            wait_total_ms: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue a lookup and return a ticket for its result
    pub fn submit(&self, name: &str, priority: Priority, max_retries: u32) -> Result<LookupTicket> {
        let now = self.clock.now();
        let (request, rx) = QueueRequest::new(name, priority, max_retries, now);
        let id = request.id;

        {
            let mut queue = self.lock_queue();
            if priority != Priority::High && queue.len() >= self.config.max_queue_size {
                warn!(name = %name, priority = %priority, pending = queue.len(), "Queue full, refusing request");
                return Err(GuardError::QueueFull {
                    capacity: self.config.max_queue_size,
                });
            }
            queue.push(request);
        }

        debug!(id = %id, name = %name, priority = %priority, "Request queued");
        self.notify.notify_one();
        Ok(LookupTicket { id, rx })
    }

    /// Queue a lookup and wait for it
    pub async fn enqueue(&self, name: &str, priority: Priority, max_retries: u32) -> Result<Discovery> {
        self.submit(name, priority, max_retries)?.wait().await
    }

    /// Look up every name; failures map to an empty result
    pub async fn batch(&self, names: &[String]) -> HashMap<String, Vec<Candidate>> {
        let tickets: Vec<(String, Result<LookupTicket>)> = names
            .iter()
            .map(|n| (n.clone(), self.submit(n, Priority::Normal, self.config.max_retries)))
            .collect();

        let results = join_all(tickets.into_iter().map(|(name, ticket)| async move {
            let candidates = match ticket {
                Ok(ticket) => match ticket.wait().await {
                    Ok(discovery) => discovery.candidates,
                    Err(e) => {
                        debug!(name = %name, error = %e, "Batch entry failed");
                        Vec::new()
                    }
                },
                Err(_) => Vec::new(),
            };
            (name, candidates)
        }))
        .await;

        results.into_iter().collect()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        info!("Scheduler resumed");
    }

    /// Cancel every pending request
    pub fn clear(&self) -> usize {
        let drained = self.lock_queue().drain();
        let count = drained.len();
        for request in drained {
            request.resolve(Err(GuardError::Cancelled));
        }
        self.cancelled.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            warn!(cancelled = count, "Scheduler queue cleared");
        }
        count
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> QueueStats {
        let (high, normal, low) = {
            let q = self.lock_queue();
            (q.len_of(Priority::High), q.len_of(Priority::Normal), q.len_of(Priority::Low))
        };
        let processed = self.processed.load(Ordering::Relaxed);
        let wait_total = self.wait_total_ms.load(Ordering::Relaxed);

        QueueStats {
            high,
            normal,
            low,
            total: high + normal + low,
            processed,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            average_wait_ms: if processed == 0 {
                0.0
            } else {
                wait_total as f64 / processed as f64
            },
            paused: self.is_paused(),
            running: self.is_running(),
        }
    }

    /// Spawn the worker loop; a second call is a no-op
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move {
            scheduler.run().await;
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        info!("Scheduler worker started");
    }

    /// Stop the worker and cancel whatever is still queued
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_one();

        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler worker ended abnormally");
            }
        }
        self.clear();
        info!("Scheduler stopped");
    }

    // ------------------------------------------------------------------------
    // Worker loop
    // ------------------------------------------------------------------------

    async fn run(&self) {
        while self.is_running() {
            if self.is_paused() {
                self.notify.notified().await;
                continue;
            }

            let now = self.clock.now();
            let next = {
                let mut queue = self.lock_queue();
                match queue.pop_ready(now) {
                    Some(request) => Next::Dispatch(request),
                    None => match queue.next_ready_at() {
                        Some(at) => Next::WaitUntil(at),
                        None => Next::Idle,
                    },
                }
            };

            match next {
                Next::Idle => self.notify.notified().await,
                Next::WaitUntil(at) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = self.clock.sleep(until(now, at)) => {}
                    }
                }
                Next::Dispatch(request) => {
                    self.dispatch(request).await;
                    let pace = self.pacing_delay();
                    if !pace.is_zero() {
                        self.clock.sleep(pace).await;
                    }
                }
            }
        }
        debug!("Scheduler worker loop exited");
    }

    async fn dispatch(&self, mut request: QueueRequest) {
        let now = self.clock.now();
        let waited_ms = (now - request.enqueued_at).num_milliseconds().max(0) as u64;
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.wait_total_ms.fetch_add(waited_ms, Ordering::Relaxed);

        // Another request may have filled the cache while this one waited
        if let Some(entry) = self.cache.lookup(&request.name).await {
            debug!(name = %request.name, "Late cache hit");
            self.succeeded.fetch_add(1, Ordering::Relaxed);
            let name = request.name.clone();
            request.resolve(Ok(Discovery::from_cache(name, entry.candidates)));
            return;
        }

        if let Err(e) = self.quota.check().into_result() {
            debug!(name = %request.name, error = %e, "Quota denied before dispatch");
            self.failed.fetch_add(1, Ordering::Relaxed);
            request.resolve(Err(e));
            return;
        }

        let name = request.name.clone();
        let context = BTreeMap::from([
            (CONTEXT_NAME.to_string(), name.clone()),
            ("priority".to_string(), request.priority.to_string()),
            ("requestId".to_string(), request.id.to_string()),
        ]);
        let quota = &self.quota;
        let provider = &self.provider;
        let lookup_name = name.as_str();

        let outcome = self
            .resilience
            .execute_with_recovery(COMPANY_SEARCH, context, || async move {
                quota.check_and_consume().await.into_result()?;
                provider.search(lookup_name).await.map_err(GuardError::from)
            })
            .await;

        match outcome {
            Ok(Recovery::Fresh(candidates)) => {
                self.cache.set(&name, candidates.clone()).await;
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                request.resolve(Ok(Discovery::from_provider(name, candidates)));
            }
            Ok(Recovery::Fallback(outcome)) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                let action = outcome.resolution.action();
                request.resolve(Ok(Discovery::from_fallback(
                    name,
                    action,
                    outcome.resolution.into_candidates(),
                )));
            }
            Err(e) if e.is_retryable() && request.can_retry() => {
                request.retry_count += 1;
                let delay = self.config.backoff.delay_for_attempt(request.retry_count);
                request.ready_at = self.clock.now() + span(delay);
                self.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    name = %name,
                    retry = request.retry_count,
                    max_retries = request.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Lookup failed, re-queued"
                );
                self.lock_queue().push(request);
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Lookup failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                request.resolve(Err(e));
            }
        }
    }

    /// Pause between dispatches, longer when the queue is deep or quota is tight
    fn pacing_delay(&self) -> Duration {
        if self.config.pacing.is_zero() {
            return Duration::ZERO;
        }
        let depth = self.lock_queue().len() as u32;
        let depth_factor = 1 + (depth / 10).min(3);
        let usage = self.quota.usage_ratio();
        let quota_factor = if usage >= 0.9 {
            4
        } else if usage >= 0.75 {
            2
        } else {
            1
        };
        self.config.pacing * depth_factor * quota_factor
    }

    fn lock_queue(&self) -> MutexGuard<'_, RequestQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
