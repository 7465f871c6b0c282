//! Feature flag registry and deterministic evaluation
//!
//! Decisions depend only on the flag definition and the identity: the
//! rollout bucket is a SHA-256 of `"<flag>:<identity>"`, so raising a
//! percentage only ever adds identities.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::condition::{Condition, IdentityContext};
use crate::clock::{span, SharedClock};
use crate::store::{keys, load_json, save_json, SharedStore};
use crate::types::{GuardError, Result};

/// Flag gating the discovery entry point
pub const COMPANY_DISCOVERY: &str = "company-discovery";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RolloutConfig {
    /// How long an evaluation is reused (default: 60 seconds)
    pub evaluation_ttl: Duration,
    /// Percentage for seeded flags without an explicit value (default: 100)
    pub default_rollout_percentage: u8,
    /// Flags created on startup when absent, with their rollout percentage
    pub default_flags: BTreeMap<String, u8>,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            evaluation_ttl: Duration::from_secs(60),
            default_rollout_percentage: 100,
            default_flags: BTreeMap::from([(COMPANY_DISCOVERY.to_string(), 100)]),
        }
    }
}

// ============================================================================
// Flags and evaluations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    pub enabled: bool,
    pub rollout_percentage: u8,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl FeatureFlag {
    /// Enabled flag at 100%
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            enabled: true,
            rollout_percentage: 100,
            conditions: Vec::new(),
            variants: Vec::new(),
            description: None,
            version: 0,
            updated_at: DateTime::<Utc>::default(),
        }
    }

    pub fn with_rollout(mut self, percentage: u8) -> Self {
        self.rollout_percentage = percentage;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_variant(mut self, name: impl Into<String>, weight: u32) -> Self {
        self.variants.push(Variant {
            name: name.into(),
            weight,
        });
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "code")]
pub enum EvaluationReason {
    FlagNotFound,
    FlagDisabled,
    ConditionsNotMet,
    NoIdentity,
    RolloutIncluded { bucket: u8, percentage: u8 },
    RolloutExcluded { bucket: u8, percentage: u8 },
    FullyEnabled,
}

impl fmt::Display for EvaluationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlagNotFound => f.write_str("flag not found"),
            Self::FlagDisabled => f.write_str("flag disabled"),
            Self::ConditionsNotMet => f.write_str("conditions not met"),
            Self::NoIdentity => f.write_str("no identity for rollout"),
            Self::RolloutIncluded { bucket, percentage } => {
                write!(f, "in rollout (bucket {bucket} < {percentage}%)")
            }
            Self::RolloutExcluded { bucket, percentage } => {
                write!(f, "outside rollout (bucket {bucket} >= {percentage}%)")
            }
            Self::FullyEnabled => f.write_str("fully enabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub flag: String,
    pub enabled: bool,
    pub reason: EvaluationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    pub version: u64,
}

/// Bucket in [0, 100) for `identity` under `flag`
pub fn rollout_bucket(flag: &str, identity: &str) -> u8 {
    (stable_hash(&format!("{flag}:{identity}")) % 100) as u8
}

fn stable_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

fn pick_variant(flag: &FeatureFlag, identity: &IdentityContext) -> Option<String> {
    let total: u64 = flag.variants.iter().map(|v| u64::from(v.weight)).sum();
    if total == 0 {
        return None;
    }
    let key = identity.rollout_key().unwrap_or_default();
    let mut point = stable_hash(&format!("{}:variant:{}", flag.key, key)) % total;
    for variant in &flag.variants {
        let weight = u64::from(variant.weight);
        if point < weight {
            return Some(variant.name.clone());
        }
        point -= weight;
    }
    None
}

fn evaluate(key: &str, flag: Option<&FeatureFlag>, identity: &IdentityContext) -> Evaluation {
    let Some(flag) = flag else {
        return Evaluation {
            flag: key.to_string(),
            enabled: false,
            reason: EvaluationReason::FlagNotFound,
            variant: None,
            version: 0,
        };
    };

    let (enabled, reason) = if !flag.enabled {
        (false, EvaluationReason::FlagDisabled)
    } else if !flag.conditions.iter().all(|c| c.matches(identity)) {
        (false, EvaluationReason::ConditionsNotMet)
    } else if flag.rollout_percentage < 100 {
        match identity.rollout_key() {
            None => (false, EvaluationReason::NoIdentity),
            Some(id) => {
                let bucket = rollout_bucket(&flag.key, id);
                let percentage = flag.rollout_percentage;
                if bucket < percentage {
                    (true, EvaluationReason::RolloutIncluded { bucket, percentage })
                } else {
                    (false, EvaluationReason::RolloutExcluded { bucket, percentage })
                }
            }
        }
    } else {
        (true, EvaluationReason::FullyEnabled)
    };

    Evaluation {
        flag: flag.key.clone(),
        enabled,
        reason,
        variant: if enabled { pick_variant(flag, identity) } else { None },
        version: flag.version,
    }
}

fn check_percentage(percentage: u8) -> Result<()> {
    if percentage > 100 {
        return Err(GuardError::Validation(format!(
            "rollout percentage must be within 0..=100, got {percentage}"
        )));
    }
    Ok(())
}

// ============================================================================
// Gate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EvaluationKey {
    flag: String,
    identity: String,
}

#[derive(Debug, Clone)]
struct CachedEvaluation {
    evaluation: Evaluation,
    expires_at: DateTime<Utc>,
}

pub struct RolloutGate {
    config: RolloutConfig,
    store: SharedStore,
    clock: SharedClock,
    flags: RwLock<BTreeMap<String, FeatureFlag>>,
    evaluations: DashMap<EvaluationKey, CachedEvaluation>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl RolloutGate {
    pub fn new(config: RolloutConfig, store: SharedStore, clock: SharedClock) -> Self {
        let now = clock.now();
        let flags: BTreeMap<String, FeatureFlag> = config
            .default_flags
            .iter()
            .map(|(key, percentage)| {
                let mut flag = FeatureFlag::new(key.clone()).with_rollout((*percentage).min(100));
                flag.version = 1;
                flag.updated_at = now;
                (key.clone(), flag)
            })
            .collect();

        info!(
            evaluation_ttl_secs = config.evaluation_ttl.as_secs(),
            seeded = flags.len(),
            "Rollout gate initialized"
        );

        Self {
            config,
            store,
            clock,
            flags: RwLock::new(flags),
            evaluations: DashMap::new(),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Evaluate `flag_key` for `identity`, reusing a recent evaluation made
    /// against the same flag version
    pub fn is_enabled(&self, flag_key: &str, identity: &IdentityContext) -> Evaluation {
        let now = self.clock.now();
        let key = EvaluationKey {
            flag: flag_key.to_string(),
            identity: identity.fingerprint(),
        };

        // Held until the evaluation is cached so a mutation cannot slip between
        let flags = self.read_flags();
        let flag = flags.get(flag_key);
        let version = flag.map_or(0, |f| f.version);

        if let Some(cached) = self.evaluations.get(&key) {
            if cached.expires_at > now && cached.evaluation.version == version {
                return cached.evaluation.clone();
            }
        }

        let evaluation = evaluate(flag_key, flag, identity);
        debug!(
            flag = %flag_key,
            enabled = evaluation.enabled,
            reason = %evaluation.reason,
            "Flag evaluated"
        );
        self.evaluations.insert(
            key,
            CachedEvaluation {
                evaluation: evaluation.clone(),
                expires_at: now + span(self.config.evaluation_ttl),
            },
        );
        evaluation
    }

    pub fn flag(&self, key: &str) -> Option<FeatureFlag> {
        self.read_flags().get(key).cloned()
    }

    pub fn flags(&self) -> Vec<FeatureFlag> {
        self.read_flags().values().cloned().collect()
    }

    /// Create or replace a flag definition
    pub async fn upsert_flag(&self, flag: FeatureFlag) -> Result<FeatureFlag> {
        check_percentage(flag.rollout_percentage)?;
        if flag.key.trim().is_empty() {
            return Err(GuardError::Validation("flag key must not be empty".into()));
        }
        let key = flag.key.clone();
        let stored = {
            let mut flags = self.write_flags();
            let previous = flags.get(&key);
            let mut next = flag;
            self.stamp(&mut next, previous);
            flags.insert(key.clone(), next.clone());
            next
        };
        info!(flag = %key, version = stored.version, rollout = stored.rollout_percentage, "Flag upserted");
        self.after_mutation(&key).await;
        Ok(stored)
    }

    pub async fn set_rollout_percentage(&self, key: &str, percentage: u8) -> Result<FeatureFlag> {
        check_percentage(percentage)?;
        let flag = self.mutate(key, |flag| flag.rollout_percentage = percentage)?;
        info!(flag = %key, rollout = percentage, version = flag.version, "Rollout percentage changed");
        self.after_mutation(key).await;
        Ok(flag)
    }

    pub async fn set_enabled(&self, key: &str, enabled: bool) -> Result<FeatureFlag> {
        let flag = self.mutate(key, |flag| flag.enabled = enabled)?;
        info!(flag = %key, enabled, version = flag.version, "Flag toggled");
        self.after_mutation(key).await;
        Ok(flag)
    }

    pub async fn remove_flag(&self, key: &str) -> bool {
        let removed = self.write_flags().remove(key).is_some();
        if removed {
            info!(flag = %key, "Flag removed");
            self.after_mutation(key).await;
        }
        removed
    }

    /// Drop cached evaluations for one identity snapshot
    pub fn invalidate_identity(&self, identity: &IdentityContext) -> usize {
        let fingerprint = identity.fingerprint();
        let before = self.evaluations.len();
        self.evaluations.retain(|k, _| k.identity != fingerprint);
        before.saturating_sub(self.evaluations.len())
    }

    pub fn clear_evaluations(&self) {
        self.evaluations.clear();
    }

    /// Drop expired evaluations
    pub fn sweep_evaluations(&self) -> usize {
        let now = self.clock.now();
        let before = self.evaluations.len();
        self.evaluations.retain(|_, cached| cached.expires_at > now);
        let removed = before.saturating_sub(self.evaluations.len());
        if removed > 0 {
            debug!(removed, "Swept expired flag evaluations");
        }
        removed
    }

    pub fn evaluation_count(&self) -> usize {
        self.evaluations.len()
    }

    /// Load persisted flags; they take precedence over seeded defaults
    pub async fn restore(&self) -> Result<usize> {
        let persisted: Option<Vec<FeatureFlag>> = load_json(self.store.as_ref(), keys::FLAGS).await?;
        let Some(persisted) = persisted else {
            return Ok(0);
        };
        let count = persisted.len();
        {
            let mut flags = self.write_flags();
            for flag in persisted {
                flags.insert(flag.key.clone(), flag);
            }
        }
        self.evaluations.clear();
        info!(restored = count, "Restored feature flags");
        Ok(count)
    }

    // ------------------------------------------------------------------------

    fn mutate(&self, key: &str, apply: impl FnOnce(&mut FeatureFlag)) -> Result<FeatureFlag> {
        let mut flags = self.write_flags();
        let Some(current) = flags.get(key).cloned() else {
            return Err(GuardError::Validation(format!("unknown feature flag: {key}")));
        };
        let mut next = current.clone();
        apply(&mut next);
        self.stamp(&mut next, Some(&current));
        flags.insert(key.to_string(), next.clone());
        Ok(next)
    }

    /// Next version, and an `updated_at` that never moves backwards
    fn stamp(&self, flag: &mut FeatureFlag, previous: Option<&FeatureFlag>) {
        let now = self.clock.now();
        match previous {
            Some(prev) => {
                flag.version = prev.version + 1;
                flag.updated_at = now.max(prev.updated_at);
            }
            None => {
                flag.version = flag.version.max(1);
                flag.updated_at = now.max(flag.updated_at);
            }
        }
    }

    async fn after_mutation(&self, key: &str) {
        self.evaluations.retain(|k, _| k.flag != key);
        self.persist().await;
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.flags();
        if let Err(e) = save_json(self.store.as_ref(), keys::FLAGS, &snapshot, None).await {
            warn!(error = %e, "Failed to persist feature flags");
        }
    }

    fn read_flags(&self) -> RwLockReadGuard<'_, BTreeMap<String, FeatureFlag>> {
        self.flags.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_flags(&self) -> RwLockWriteGuard<'_, BTreeMap<String, FeatureFlag>> {
        self.flags.write().unwrap_or_else(PoisonError::into_inner)
    }
}
