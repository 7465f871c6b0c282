//! Identity context and attribute conditions

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Identity used for flag evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_age_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,
}

impl IdentityContext {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    /// Identity used for calls made on behalf of the service itself
    pub fn system() -> Self {
        Self::user("system").with_client_type("service")
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_session_age(mut self, age: Duration) -> Self {
        self.session_age_seconds = Some(age.as_secs());
        self
    }

    pub fn with_client_type(mut self, client_type: impl Into<String>) -> Self {
        self.client_type = Some(client_type.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Lowercased part after the last `@`
    pub fn email_domain(&self) -> Option<String> {
        let email = self.email.as_deref()?;
        let (_, domain) = email.rsplit_once('@')?;
        if domain.is_empty() {
            None
        } else {
            Some(domain.to_lowercase())
        }
    }

    /// User id, falling back to session id; blank ids do not count
    pub fn rollout_key(&self) -> Option<&str> {
        [self.user_id.as_deref(), self.session_id.as_deref()]
            .into_iter()
            .flatten()
            .find(|id| !id.trim().is_empty())
    }

    /// Attribute lookup for conditions. Built-ins shadow custom attributes.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "userId" => self.user_id.clone().map(Value::from),
            "sessionId" => self.session_id.clone().map(Value::from),
            "email" => self.email.clone().map(Value::from),
            "emailDomain" => self.email_domain().map(Value::from),
            "sessionAge" | "sessionAgeSeconds" => self.session_age_seconds.map(Value::from),
            "clientType" => self.client_type.clone().map(Value::from),
            other => self.attributes.get(other).cloned(),
        }
    }

    /// Stable digest of the whole context, 16 hex chars
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let hash = Sha256::digest(&encoded);
        hex::encode(&hash[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
    In,
}

/// `attribute <operator> value`; a missing attribute never matches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub attribute: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl Condition {
    pub fn new(attribute: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn matches(&self, identity: &IdentityContext) -> bool {
        let Some(actual) = identity.attribute(&self.attribute) else {
            return false;
        };

        match self.operator {
            ConditionOperator::Equals => values_equal(&actual, &self.value),
            ConditionOperator::Contains => text_op(&actual, &self.value, |a, b| a.contains(b)),
            ConditionOperator::StartsWith => text_op(&actual, &self.value, |a, b| a.starts_with(b)),
            ConditionOperator::EndsWith => text_op(&actual, &self.value, |a, b| a.ends_with(b)),
            ConditionOperator::GreaterThan => number_op(&actual, &self.value, |a, b| a > b),
            ConditionOperator::LessThan => number_op(&actual, &self.value, |a, b| a < b),
            ConditionOperator::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| values_equal(&actual, o)),
                _ => false,
            },
        }
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    if let (Some(a), Some(b)) = (actual.as_f64(), expected.as_f64()) {
        return a == b;
    }
    actual == expected
}

fn text_op(actual: &Value, expected: &Value, op: impl Fn(&str, &str) -> bool) -> bool {
    match (as_text(actual), as_text(expected)) {
        (Some(a), Some(b)) => op(&a, &b),
        _ => false,
    }
}

fn number_op(actual: &Value, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> IdentityContext {
        IdentityContext::user("alice")
            .with_email("Alice@Example.COM")
            .with_session_age(Duration::from_secs(600))
            .with_client_type("web")
            .with_attribute("plan", "pro")
            .with_attribute("seats", 12)
    }

    #[test]
    fn test_email_domain_and_rollout_key() {
        let id = alice();
        assert_eq!(id.email_domain().as_deref(), Some("example.com"));
        assert_eq!(id.rollout_key(), Some("alice"));

        let anon = IdentityContext::session("s-1");
        assert_eq!(anon.rollout_key(), Some("s-1"));

        let blank = IdentityContext {
            user_id: Some("  ".into()),
            ..Default::default()
        };
        assert_eq!(blank.rollout_key(), None);
    }

    #[test]
    fn test_operators() {
        let id = alice();
        let check = |attr: &str, op, value: Value| Condition::new(attr, op, value).matches(&id);

        assert!(check("emailDomain", ConditionOperator::Equals, json!("example.com")));
        assert!(check("email", ConditionOperator::Contains, json!("@Example")));
        assert!(check("userId", ConditionOperator::StartsWith, json!("al")));
        assert!(check("emailDomain", ConditionOperator::EndsWith, json!(".com")));
        assert!(check("sessionAge", ConditionOperator::GreaterThan, json!(300)));
        assert!(!check("sessionAge", ConditionOperator::LessThan, json!(300)));
        assert!(check("seats", ConditionOperator::Equals, json!(12.0)));
        assert!(check("clientType", ConditionOperator::In, json!(["mobile", "web"])));
        assert!(!check("plan", ConditionOperator::In, json!(["free"])));
        assert!(!check("missing", ConditionOperator::Equals, json!("x")));
        assert!(!check("plan", ConditionOperator::In, json!("pro")));
    }

    #[test]
    fn test_fingerprint_tracks_context() {
        let a = alice();
        assert_eq!(a.fingerprint(), alice().fingerprint());
        assert_eq!(a.fingerprint().len(), 16);
        assert_ne!(a.fingerprint(), a.clone().with_client_type("mobile").fingerprint());
    }
}
