//! Scripted provider for tests and dry runs.
//!
//! Plays back queued outcomes in order, then falls back to a default outcome.
//! Counts every call so callers can assert how often the network was hit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Provider, ProviderError};
use crate::types::Candidate;

type Outcome = Result<Vec<Candidate>, ProviderError>;

pub struct ScriptedProvider {
    script: Mutex<VecDeque<Outcome>>,
    default: Mutex<Outcome>,
    calls: Mutex<Vec<String>>,
    call_count: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    /// Provider that returns `candidates` for every call
    pub fn returning(candidates: Vec<Candidate>) -> Self {
        Self::with_default(Ok(candidates))
    }

    /// Provider that fails every call with `error`
    pub fn failing(error: ProviderError) -> Self {
        Self::with_default(Err(error))
    }

    fn with_default(default: Outcome) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: Mutex::new(default),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Sleep on the tokio timer before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a one-shot outcome ahead of the default
    pub fn push(&self, outcome: Outcome) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(outcome);
        }
    }

    pub fn set_default(&self, outcome: Outcome) {
        if let Ok(mut default) = self.default.lock() {
            *default = outcome;
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Names searched, in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn search(&self, name: &str) -> Result<Vec<Candidate>, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(name.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match next {
            Some(outcome) => outcome,
            None => self
                .default
                .lock()
                .map(|d| d.clone())
                .unwrap_or_else(|_| Err(ProviderError::Network("script poisoned".into()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_default() {
        let provider = ScriptedProvider::returning(vec![Candidate::new("u", "Acme", "acme", 0.9)]);
        provider.push(Err(ProviderError::Network("reset".into())));

        assert!(provider.search("Acme").await.is_err());
        assert_eq!(provider.search("Acme").await.unwrap().len(), 1);
        assert_eq!(provider.call_count(), 2);
        assert_eq!(provider.calls(), vec!["Acme", "Acme"]);
    }
}
