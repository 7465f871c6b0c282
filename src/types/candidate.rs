//! Lookup result types shared by the cache, provider and facade.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::GuardError;

/// One lookup hit returned by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub url: String,
    pub display_name: String,
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    pub confidence: f64,
}

impl Candidate {
    pub fn new(
        url: impl Into<String>,
        display_name: impl Into<String>,
        slug: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            url: url.into(),
            display_name: display_name.into(),
            slug: slug.into(),
            snippet: None,
            confidence: clamp_confidence(confidence),
        }
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = Some(snippet.into());
        self
    }

    /// Clamp confidence into [0, 1]; NaN becomes 0
    pub fn normalized(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        self
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Scheduling priority of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// User is waiting on the result
    High,
    #[default]
    Normal,
    /// Background enrichment
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(GuardError::Validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// Non-result outcome chosen by the fallback chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    CachedResult,
    ManualInput,
    SkipDiscovery,
    OfflineMode,
    Heuristic,
}

impl FallbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CachedResult => "cached_result",
            Self::ManualInput => "manual_input",
            Self::SkipDiscovery => "skip_discovery",
            Self::OfflineMode => "offline_mode",
            Self::Heuristic => "heuristic",
        }
    }
}

/// Where a discovery result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "action")]
pub enum DiscoverySource {
    Cache,
    Provider,
    Fallback(FallbackAction),
}

/// Outcome of one `discover` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    pub name: String,
    pub candidates: Vec<Candidate>,
    pub source: DiscoverySource,
}

impl Discovery {
    pub fn from_cache(name: impl Into<String>, candidates: Vec<Candidate>) -> Self {
        Self {
            name: name.into(),
            candidates,
            source: DiscoverySource::Cache,
        }
    }

    pub fn from_provider(name: impl Into<String>, candidates: Vec<Candidate>) -> Self {
        Self {
            name: name.into(),
            candidates,
            source: DiscoverySource::Provider,
        }
    }

    pub fn from_fallback(
        name: impl Into<String>,
        action: FallbackAction,
        candidates: Vec<Candidate>,
    ) -> Self {
        Self {
            name: name.into(),
            candidates,
            source: DiscoverySource::Fallback(action),
        }
    }

    /// True when the caller should prompt for manual input
    pub fn needs_manual_input(&self) -> bool {
        self.source == DiscoverySource::Fallback(FallbackAction::ManualInput)
    }

    pub fn is_fresh(&self) -> bool {
        self.source == DiscoverySource::Provider
    }
}
