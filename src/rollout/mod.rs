//! Feature rollout gate
//!
//! Global enable, attribute conditions and percentage rollout, evaluated
//! deterministically per identity.

mod condition;
mod gate;

pub use condition::{Condition, ConditionOperator, IdentityContext};
pub use gate::{
    rollout_bucket, Evaluation, EvaluationReason, FeatureFlag, RolloutConfig, RolloutGate, Variant,
    COMPANY_DISCOVERY,
};
