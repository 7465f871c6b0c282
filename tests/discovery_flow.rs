//! End-to-end discovery flows through the public API

use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use discovery_guard::{
    clock::ManualClock,
    provider::{ProviderError, ScriptedProvider},
    quota::{WindowKind, WindowLimit},
    resilience::{Backoff, BreakerState, COMPANY_SEARCH},
    rollout::{Condition, ConditionOperator, FeatureFlag, IdentityContext, COMPANY_DISCOVERY},
    store::{JsonFileStore, MemoryStore, SharedStore},
    Candidate, DiscoveryGuard, DiscoverySource, FallbackAction, GuardConfig, GuardError, Priority,
};

fn acme_candidates() -> Vec<Candidate> {
    vec![
        Candidate::new(
            "https://www.linkedin.com/company/acme-corp",
            "Acme Corp",
            "acme-corp",
            0.92,
        ),
        Candidate::new(
            "https://www.linkedin.com/company/acme-corporation",
            "Acme Corporation",
            "acme-corporation",
            0.61,
        ),
    ]
}

fn test_config() -> GuardConfig {
    let quick = Backoff::new(Duration::from_millis(10), Duration::from_millis(100), Duration::ZERO);
    let mut config = GuardConfig::default();
    config.scheduler.pacing = Duration::ZERO;
    config.scheduler.backoff = quick;
    config.resilience.backoff = quick;
    config
}

fn no_retries(mut config: GuardConfig) -> GuardConfig {
    config.scheduler.max_retries = 0;
    config.resilience.max_retries = 0;
    config
}

struct Harness {
    guard: DiscoveryGuard,
    provider: Arc<ScriptedProvider>,
    clock: Arc<ManualClock>,
}

fn harness_with(config: GuardConfig, provider: ScriptedProvider, store: SharedStore, clock: Arc<ManualClock>) -> Harness {
    let provider = Arc::new(provider);
    let guard = DiscoveryGuard::new(config, provider.clone(), store, clock.clone()).unwrap();
    Harness { guard, provider, clock }
}

fn harness(config: GuardConfig, provider: ScriptedProvider) -> Harness {
    harness_with(
        config,
        provider,
        Arc::new(MemoryStore::new()),
        Arc::new(ManualClock::starting_now()),
    )
}

#[tokio::test]
async fn test_discover_then_serve_from_cache() {
    let h = harness(test_config(), ScriptedProvider::returning(acme_candidates()));
    h.guard.start();

    let first = h.guard.discover("Acme Corp", Priority::High).await.unwrap();
    assert_eq!(first.source, DiscoverySource::Provider);
    let confidences: Vec<f64> = first.candidates.iter().map(|c| c.confidence).collect();
    assert_eq!(confidences, vec![0.92, 0.61]);

    let second = h.guard.discover("acme corp ", Priority::High).await.unwrap();
    assert_eq!(second.source, DiscoverySource::Cache);
    assert_eq!(second.candidates, first.candidates);
    assert_eq!(h.provider.call_count(), 1);

    let stats = h.guard.cache_stats();
    assert_eq!(stats.hits(), 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(h.guard.metrics().total_requests, 1);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_scheduler_serves_by_priority() {
    let h = harness(test_config(), ScriptedProvider::returning(acme_candidates()));
    let scheduler = h.guard.scheduler();

    let tickets = vec![
        scheduler.submit("low", Priority::Low, 0).unwrap(),
        scheduler.submit("high-1", Priority::High, 0).unwrap(),
        scheduler.submit("normal", Priority::Normal, 0).unwrap(),
        scheduler.submit("high-2", Priority::High, 0).unwrap(),
    ];
    assert_eq!(h.guard.queue_stats().total, 4);

    h.guard.start();
    for ticket in tickets {
        ticket.wait().await.unwrap();
    }
    assert_eq!(h.provider.calls(), vec!["high-1", "high-2", "normal", "low"]);
    assert_eq!(h.guard.queue_stats().processed, 4);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_quota_exhaustion_and_reset() {
    let mut config = test_config();
    config.quota.burst = WindowLimit::new(2, Duration::from_secs(10));
    let h = harness(config, ScriptedProvider::returning(acme_candidates()));
    h.guard.start();

    h.guard.discover("Alpha", Priority::Normal).await.unwrap();
    h.guard.discover("Beta", Priority::Normal).await.unwrap();

    match h.guard.discover("Gamma", Priority::Normal).await {
        Err(GuardError::RateLimitExceeded {
            window,
            retry_after_seconds,
        }) => {
            assert_eq!(window, WindowKind::Burst);
            assert!((1..=10).contains(&retry_after_seconds));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(h.provider.call_count(), 2);

    // Cached names are still served while the quota is exhausted
    let cached = h.guard.discover("alpha", Priority::Normal).await.unwrap();
    assert_eq!(cached.source, DiscoverySource::Cache);

    h.clock.advance(Duration::from_secs(10));
    let gamma = h.guard.discover("Gamma", Priority::Normal).await.unwrap();
    assert_eq!(gamma.source, DiscoverySource::Provider);

    let burst = h
        .guard
        .quota_status()
        .windows
        .into_iter()
        .find(|w| w.kind == WindowKind::Burst)
        .unwrap();
    assert_eq!(burst.used, 1);
    assert_eq!(burst.remaining, 1);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_rollout_gate_blocks_discovery() {
    let h = harness(test_config(), ScriptedProvider::returning(acme_candidates()));
    h.guard.start();

    assert_ok!(h.guard.rollout().set_rollout_percentage(COMPANY_DISCOVERY, 0).await);
    let err = assert_err!(h.guard.discover("Acme Corp", Priority::High).await);
    assert!(matches!(err, GuardError::FeatureDisabled { ref flag, .. } if flag == COMPANY_DISCOVERY));
    assert_eq!(h.provider.call_count(), 0);

    h.guard
        .rollout()
        .upsert_flag(
            FeatureFlag::new(COMPANY_DISCOVERY).with_condition(Condition::new(
                "emailDomain",
                ConditionOperator::Equals,
                "acme.com",
            )),
        )
        .await
        .unwrap();

    let outsider = IdentityContext::user("bob").with_email("bob@example.org");
    assert_err!(h.guard.discover_as(&outsider, "Acme Corp", Priority::High).await);

    let insider = IdentityContext::user("amy").with_email("amy@acme.com");
    let found = assert_ok!(h.guard.discover_as(&insider, "Acme Corp", Priority::High).await);
    assert_eq!(found.candidates.len(), 2);
    assert!(h.guard.is_enabled(COMPANY_DISCOVERY, &insider).enabled);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_provider_outage_falls_back_to_heuristic() {
    let h = harness(
        no_retries(test_config()),
        ScriptedProvider::failing(ProviderError::Network("connection reset".into())),
    );
    h.guard.start();

    let guess = h.guard.discover("Acme Corp", Priority::High).await.unwrap();
    assert_eq!(guess.source, DiscoverySource::Fallback(FallbackAction::Heuristic));
    assert!(!guess.candidates.is_empty());
    assert!(guess.candidates.iter().all(|c| c.confidence < 0.5));
    assert_eq!(h.provider.call_count(), 1);

    // Guesses are never cached
    assert!(h.guard.cache().lookup("acme corp").await.is_none());
    assert_eq!(h.guard.metrics().failed_requests, 1);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_open_circuit_enters_offline_mode() {
    let mut config = no_retries(test_config());
    config.resilience.breaker.threshold = 3;
    let h = harness(
        config,
        ScriptedProvider::failing(ProviderError::Timeout(Duration::from_secs(10))),
    );
    h.guard.start();

    for name in ["One", "Two", "Three"] {
        let d = h.guard.discover(name, Priority::Normal).await.unwrap();
        assert_eq!(d.source, DiscoverySource::Fallback(FallbackAction::Heuristic));
    }
    assert_eq!(h.guard.circuit_state(COMPANY_SEARCH).state, BreakerState::Open);

    // Open circuit: no provider call, offline-mode strategy engages
    let d = h.guard.discover("Four", Priority::Normal).await.unwrap();
    assert_eq!(d.source, DiscoverySource::Fallback(FallbackAction::OfflineMode));
    assert_eq!(h.provider.call_count(), 3);

    // While offline, discovery short-circuits before the quota and scheduler
    let processed = h.guard.queue_stats().processed;
    let d = h.guard.discover("Five", Priority::Normal).await.unwrap();
    assert!(d.candidates.is_empty());
    assert_eq!(d.source, DiscoverySource::Fallback(FallbackAction::OfflineMode));
    assert_eq!(h.guard.queue_stats().processed, processed);

    assert!(h.guard.exit_offline_mode().await);
    h.guard.reset_circuit(COMPANY_SEARCH).await;
    h.provider.set_default(Ok(acme_candidates()));
    let d = h.guard.discover("Five", Priority::Normal).await.unwrap();
    assert_eq!(d.source, DiscoverySource::Provider);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_forced_open_circuit_skips_provider() {
    let h = harness(test_config(), ScriptedProvider::returning(acme_candidates()));
    h.guard.start();

    h.guard.force_open_circuit(COMPANY_SEARCH).await;
    let d = h.guard.discover("Acme Corp", Priority::High).await.unwrap();
    assert!(d.candidates.is_empty());
    assert_eq!(h.provider.call_count(), 0);
    assert!(h.guard.status().await.offline.is_some());

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_clear_cancels_waiting_callers() {
    let h = harness(test_config(), ScriptedProvider::returning(acme_candidates()));
    h.guard.start();
    h.guard.pause();

    let (result, cleared) = tokio::join!(h.guard.discover("Acme Corp", Priority::Normal), async {
        while h.guard.queue_stats().total == 0 {
            tokio::task::yield_now().await;
        }
        h.guard.clear()
    });

    assert_eq!(cleared, 1);
    assert!(matches!(result, Err(GuardError::Cancelled)));
    assert_eq!(h.provider.call_count(), 0);
    assert_eq!(h.guard.queue_stats().cancelled, 1);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_batch_maps_failures_to_empty() {
    let h = harness(test_config(), ScriptedProvider::returning(acme_candidates()));
    h.guard.start();

    let names = vec!["Acme Corp".to_string(), "   ".to_string()];
    let results = h.guard.discover_batch(&names).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results["Acme Corp"].len(), 2);
    assert!(results["   "].is_empty());

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard-state.json");
    let clock = Arc::new(ManualClock::starting_now());

    {
        let store: SharedStore = Arc::new(JsonFileStore::open(&path).await.unwrap());
        let h = harness_with(
            test_config(),
            ScriptedProvider::returning(acme_candidates()),
            store,
            clock.clone(),
        );
        h.guard.start();
        h.guard.discover("Acme Corp", Priority::High).await.unwrap();
        h.guard.force_open_circuit("profile-search").await;
        h.guard
            .rollout()
            .set_rollout_percentage(COMPANY_DISCOVERY, 100)
            .await
            .unwrap();
        h.guard.shutdown().await;
    }

    let store: SharedStore = Arc::new(JsonFileStore::open(&path).await.unwrap());
    let h = harness_with(
        test_config(),
        ScriptedProvider::returning(Vec::new()),
        store,
        clock,
    );
    let report = h.guard.restore().await.unwrap();
    assert_eq!(report.circuits, 1);
    assert_eq!(report.flags, 1);
    assert!(report.quota_windows > 0);
    assert_eq!(h.guard.circuit_state("profile-search").state, BreakerState::Open);
    assert_eq!(h.guard.rollout().flag(COMPANY_DISCOVERY).unwrap().version, 2);

    h.guard.start();
    let d = h.guard.discover("ACME CORP", Priority::High).await.unwrap();
    assert_eq!(d.source, DiscoverySource::Cache);
    assert_eq!(d.candidates, acme_candidates());
    assert_eq!(h.provider.call_count(), 0);

    h.guard.shutdown().await;
}

#[tokio::test]
async fn test_status_serializes() {
    let h = harness(test_config(), ScriptedProvider::returning(acme_candidates()));
    h.guard.start();
    h.guard.discover("Acme Corp", Priority::High).await.unwrap();

    let status = h.guard.status().await;
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["queue"]["processed"], 1);
    assert_eq!(json["health"]["status"], "healthy");
    assert!(json["quota"]["windows"].is_array());
    assert!(json.get("offline").is_none());

    h.guard.shutdown().await;
}
