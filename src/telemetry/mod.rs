//! Telemetry: outcome history, derived rates, alerts, health checks

mod health;
mod recorder;

pub use health::{
    CacheRoundTripProbe, HealthProbe, HealthReport, HealthStatus, ProbeResult, ProviderProbe,
    SchedulerProbe, StoreProbe,
};
pub use recorder::{
    Alert, AlertLevel, ErrorRecord, OutcomeRecord, TelemetryConfig, TelemetryMetrics,
    TelemetryRecorder,
};
