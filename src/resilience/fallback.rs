//! Fallback chain
//!
//! Ordered strategies tried when a guarded call ultimately fails. A strategy
//! runs only when it is enabled and its condition (if any) matches the
//! error. Strategies run in ascending priority; the first handler that
//! returns `Ok` wins.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::heuristic::heuristic_guess;
use super::offline::OfflineMode;
use crate::cache::DiscoveryCache;
use crate::clock::{span, SharedClock};
use crate::types::{Candidate, ErrorKind, FallbackAction, GuardError};

/// Context key carrying the lookup name
pub const CONTEXT_NAME: &str = "name";

pub const CACHED_RESULT: &str = "cached-result";
pub const MANUAL_INPUT: &str = "manual-input";
pub const SKIP_DISCOVERY: &str = "skip-discovery";
pub const OFFLINE_MODE: &str = "offline-mode";
pub const HEURISTIC: &str = "heuristic";

/// Everything a fallback handler knows about the failure
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    pub operation: String,
    pub attempt: u32,
    pub error: String,
    pub error_kind: ErrorKind,
    pub timestamp: DateTime<Utc>,
    pub user_context: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn name(&self) -> Option<&str> {
        self.user_context.get(CONTEXT_NAME).map(String::as_str)
    }
}

/// What a successful fallback hands back to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackResolution {
    Cached(Vec<Candidate>),
    ManualInputRequired,
    SkipDiscovery,
    OfflineMode { until: DateTime<Utc> },
    Heuristic(Vec<Candidate>),
}

impl FallbackResolution {
    pub fn action(&self) -> FallbackAction {
        match self {
            Self::Cached(_) => FallbackAction::CachedResult,
            Self::ManualInputRequired => FallbackAction::ManualInput,
            Self::SkipDiscovery => FallbackAction::SkipDiscovery,
            Self::OfflineMode { .. } => FallbackAction::OfflineMode,
            Self::Heuristic(_) => FallbackAction::Heuristic,
        }
    }

    pub fn into_candidates(self) -> Vec<Candidate> {
        match self {
            Self::Cached(c) | Self::Heuristic(c) => c,
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FallbackError {
    #[error("not applicable: {0}")]
    NotApplicable(String),

    #[error("handler failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn handle(
        &self,
        error: &GuardError,
        context: &ErrorContext,
    ) -> Result<FallbackResolution, FallbackError>;
}

pub type FallbackCondition = Arc<dyn Fn(&GuardError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct FallbackStrategy {
    pub name: String,
    pub enabled: bool,
    pub priority: u32,
    pub condition: Option<FallbackCondition>,
    pub handler: Arc<dyn FallbackHandler>,
}

impl FallbackStrategy {
    pub fn new(name: impl Into<String>, priority: u32, handler: Arc<dyn FallbackHandler>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            priority,
            condition: None,
            handler,
        }
    }

    pub fn when(mut self, condition: impl Fn(&GuardError) -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Only for errors of this kind
    pub fn on_kind(self, kind: ErrorKind) -> Self {
        self.when(move |e| e.kind() == kind)
    }

    pub fn applies_to(&self, error: &GuardError) -> bool {
        self.enabled && self.condition.as_ref().map_or(true, |c| c(error))
    }
}

impl std::fmt::Debug for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStrategy")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("priority", &self.priority)
            .field("conditional", &self.condition.is_some())
            .finish()
    }
}

/// Winning strategy and its resolution
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome {
    pub strategy: String,
    pub resolution: FallbackResolution,
}

#[derive(Default)]
pub struct FallbackChain {
    strategies: RwLock<Vec<FallbackStrategy>>,
}

impl FallbackChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a strategy, replacing any with the same name
    pub fn register(&self, strategy: FallbackStrategy) {
        let mut strategies = self.strategies.write().unwrap_or_else(PoisonError::into_inner);
        strategies.retain(|s| s.name != strategy.name);
        strategies.push(strategy);
        strategies.sort_by_key(|s| s.priority);
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut strategies = self.strategies.write().unwrap_or_else(PoisonError::into_inner);
        match strategies.iter_mut().find(|s| s.name == name) {
            Some(s) => {
                s.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Strategy names in priority order
    pub fn names(&self) -> Vec<String> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    /// Strategies applicable to `error`, in priority order
    pub fn applicable(&self, error: &GuardError) -> Vec<FallbackStrategy> {
        self.strategies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.applies_to(error))
            .cloned()
            .collect()
    }

    /// Try each applicable strategy in order; `None` when all fail
    pub async fn run(&self, error: &GuardError, context: &ErrorContext) -> Option<FallbackOutcome> {
        for strategy in self.applicable(error) {
            match strategy.handler.handle(error, context).await {
                Ok(resolution) => {
                    info!(
                        operation = %context.operation,
                        strategy = %strategy.name,
                        action = resolution.action().as_str(),
                        "Fallback engaged"
                    );
                    return Some(FallbackOutcome {
                        strategy: strategy.name,
                        resolution,
                    });
                }
                Err(e) => {
                    debug!(strategy = %strategy.name, error = %e, "Fallback strategy declined");
                }
            }
        }
        None
    }
}

// ============================================================================
// Default strategies
// ============================================================================

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Max age of a cached result still served on failure (default: 30 minutes)
    pub fresh_window: Duration,
    /// How long offline mode lasts once entered (default: 15 minutes)
    pub offline_duration: Duration,
    /// Base URL for heuristic guesses
    pub heuristic_base_url: String,
    /// Names of strategies enabled by default (default: all five)
    pub enabled: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            fresh_window: Duration::from_secs(30 * 60),
            offline_duration: Duration::from_secs(15 * 60),
            heuristic_base_url: "https://www.linkedin.com/company".to_string(),
            enabled: [CACHED_RESULT, MANUAL_INPUT, SKIP_DISCOVERY, OFFLINE_MODE, HEURISTIC]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Serve a cached result that is still inside the fresh window
pub struct CachedResultHandler {
    pub cache: Arc<DiscoveryCache>,
    pub clock: SharedClock,
    pub fresh_window: Duration,
}

#[async_trait]
impl FallbackHandler for CachedResultHandler {
    async fn handle(&self, _: &GuardError, ctx: &ErrorContext) -> Result<FallbackResolution, FallbackError> {
        let name = ctx
            .name()
            .ok_or_else(|| FallbackError::NotApplicable("no name in context".into()))?;
        let entry = self
            .cache
            .lookup(name)
            .await
            .ok_or_else(|| FallbackError::NotApplicable("nothing cached".into()))?;

        if entry.age(self.clock.now()) <= span(self.fresh_window) {
            Ok(FallbackResolution::Cached(entry.candidates))
        } else {
            Err(FallbackError::NotApplicable("cached result too old".into()))
        }
    }
}

/// Ask the caller to enter the company page by hand
pub struct ManualInputHandler;

#[async_trait]
impl FallbackHandler for ManualInputHandler {
    async fn handle(&self, _: &GuardError, _: &ErrorContext) -> Result<FallbackResolution, FallbackError> {
        Ok(FallbackResolution::ManualInputRequired)
    }
}

/// Skip discovery for this item
pub struct SkipDiscoveryHandler;

#[async_trait]
impl FallbackHandler for SkipDiscoveryHandler {
    async fn handle(&self, _: &GuardError, _: &ErrorContext) -> Result<FallbackResolution, FallbackError> {
        Ok(FallbackResolution::SkipDiscovery)
    }
}

/// Switch discovery off until the offline window passes
pub struct OfflineModeHandler {
    pub offline: Arc<OfflineMode>,
    pub duration: Duration,
}

#[async_trait]
impl FallbackHandler for OfflineModeHandler {
    async fn handle(&self, error: &GuardError, _: &ErrorContext) -> Result<FallbackResolution, FallbackError> {
        let state = self.offline.enter(&error.to_string(), self.duration).await;
        Ok(FallbackResolution::OfflineMode { until: state.until })
    }
}

/// Low-confidence guess from the name alone
pub struct HeuristicHandler {
    pub base_url: String,
}

#[async_trait]
impl FallbackHandler for HeuristicHandler {
    async fn handle(&self, _: &GuardError, ctx: &ErrorContext) -> Result<FallbackResolution, FallbackError> {
        let name = ctx
            .name()
            .ok_or_else(|| FallbackError::NotApplicable("no name in context".into()))?;
        let guess = heuristic_guess(name, &self.base_url);
        if guess.is_empty() {
            Err(FallbackError::Failed(format!("cannot derive a slug from '{}'", name)))
        } else {
            Ok(FallbackResolution::Heuristic(guess))
        }
    }
}

/// The five default strategies, enabled per `config.enabled`
pub fn default_strategies(
    config: &FallbackConfig,
    cache: Arc<DiscoveryCache>,
    offline: Arc<OfflineMode>,
    clock: SharedClock,
) -> Vec<FallbackStrategy> {
    let strategies = vec![
        FallbackStrategy::new(
            CACHED_RESULT,
            1,
            Arc::new(CachedResultHandler {
                cache,
                clock,
                fresh_window: config.fresh_window,
            }),
        ),
        FallbackStrategy::new(MANUAL_INPUT, 2, Arc::new(ManualInputHandler)).on_kind(ErrorKind::Validation),
        FallbackStrategy::new(SKIP_DISCOVERY, 3, Arc::new(SkipDiscoveryHandler)).on_kind(ErrorKind::RateLimit),
        FallbackStrategy::new(
            OFFLINE_MODE,
            4,
            Arc::new(OfflineModeHandler {
                offline,
                duration: config.offline_duration,
            }),
        )
        .on_kind(ErrorKind::CircuitOpen),
        FallbackStrategy::new(
            HEURISTIC,
            5,
            Arc::new(HeuristicHandler {
                base_url: config.heuristic_base_url.clone(),
            }),
        ),
    ];

    strategies
        .into_iter()
        .map(|mut s| {
            s.enabled = config.enabled.iter().any(|n| n == &s.name);
            s
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        outcome: Result<FallbackResolution, FallbackError>,
    }

    impl Counting {
        fn ok(resolution: FallbackResolution) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome: Ok(resolution),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome: Err(FallbackError::Failed("boom".into())),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FallbackHandler for Counting {
        async fn handle(&self, _: &GuardError, _: &ErrorContext) -> Result<FallbackResolution, FallbackError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn context() -> ErrorContext {
        ErrorContext {
            operation: "company-search".into(),
            attempt: 3,
            error: "network".into(),
            error_kind: ErrorKind::ProviderUnavailable,
            timestamp: Utc::now(),
            user_context: BTreeMap::from([(CONTEXT_NAME.to_string(), "Acme".to_string())]),
        }
    }

    fn network_error() -> GuardError {
        ProviderError::Network("reset".into()).into()
    }

    #[tokio::test]
    async fn test_priority_order_and_first_success_wins() {
        let chain = FallbackChain::new();
        let first = Counting::failing();
        let second = Counting::ok(FallbackResolution::SkipDiscovery);
        let third = Counting::ok(FallbackResolution::ManualInputRequired);

        // Registered out of order on purpose
        chain.register(FallbackStrategy::new("third", 30, third.clone()));
        chain.register(FallbackStrategy::new("first", 10, first.clone()));
        chain.register(FallbackStrategy::new("second", 20, second.clone()));

        assert_eq!(chain.names(), vec!["first", "second", "third"]);

        let outcome = chain.run(&network_error(), &context()).await.unwrap();
        assert_eq!(outcome.strategy, "second");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(third.calls(), 0);
    }

    #[tokio::test]
    async fn test_conditions_and_enabled_filter() {
        let chain = FallbackChain::new();
        let rate = Counting::ok(FallbackResolution::SkipDiscovery);
        let disabled = Counting::ok(FallbackResolution::ManualInputRequired);

        chain.register(FallbackStrategy::new("rate", 1, rate.clone()).on_kind(ErrorKind::RateLimit));
        chain.register(FallbackStrategy::new("off", 2, disabled.clone()));
        assert!(chain.set_enabled("off", false));
        assert!(!chain.set_enabled("missing", false));

        assert!(chain.run(&network_error(), &context()).await.is_none());
        assert_eq!(rate.calls(), 0);
        assert_eq!(disabled.calls(), 0);

        let quota: GuardError = ProviderError::Quota {
            retry_after_seconds: None,
        }
        .into();
        let outcome = chain.run(&quota, &context()).await.unwrap();
        assert_eq!(outcome.resolution, FallbackResolution::SkipDiscovery);
    }

    #[tokio::test]
    async fn test_register_replaces_by_name() {
        let chain = FallbackChain::new();
        chain.register(FallbackStrategy::new("x", 1, Counting::failing()));
        chain.register(FallbackStrategy::new("x", 1, Counting::ok(FallbackResolution::SkipDiscovery)));
        assert_eq!(chain.names().len(), 1);
        assert!(chain.run(&network_error(), &context()).await.is_some());
    }

    #[tokio::test]
    async fn test_heuristic_handler_requires_name() {
        let handler = HeuristicHandler {
            base_url: "https://example.com/company".into(),
        };
        let mut ctx = context();
        let resolution = handler.handle(&network_error(), &ctx).await.unwrap();
        assert_eq!(resolution.action(), FallbackAction::Heuristic);
        assert_eq!(resolution.into_candidates()[0].url, "https://example.com/company/acme");

        ctx.user_context.clear();
        assert!(handler.handle(&network_error(), &ctx).await.is_err());
    }
}
