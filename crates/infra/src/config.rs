//! Pipeline configuration.
//!
//! Loaded once at start-up from an optional JSON file (`HERALD_CONFIG`) plus
//! `HERALD_*` environment overrides, then validated. Nothing here is
//! reloaded at runtime; changing retry budgets means restarting.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use herald_core::WorkerId;
use herald_events::Lane;

use crate::idempotency::{DEFAULT_DEDUP_TTL_MS, DedupFailurePolicy};
use crate::retry::{
    BackoffConfig, BackoffStrategy, BudgetRule, BudgetTableError, RetryBudget, RetryBudgetTable,
};
use crate::telemetry::DEFAULT_QUEUE_CAPACITY;

/// Environment variable naming the JSON config file.
pub const CONFIG_PATH_ENV: &str = "HERALD_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Io { path: String, message: String },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Budget(#[from] BudgetTableError),
}

/// Batching parameters for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneConfig {
    /// Flush a buffer once it holds this many events.
    pub batch_size: usize,
    /// Flush a buffer this long after its oldest event arrived.
    pub batch_timeout_ms: u64,
    /// Handler workers for the lane.
    pub concurrency: usize,
    /// Upper bound on one downstream handler call.
    pub handler_timeout_ms: u64,
    /// Capacity of the lane's input and batch channels.
    pub channel_capacity: usize,
}

impl LaneConfig {
    pub fn fast_default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout_ms: 500,
            concurrency: 4,
            handler_timeout_ms: 5_000,
            channel_capacity: 64,
        }
    }

    pub fn standard_default() -> Self {
        Self {
            batch_size: 25,
            batch_timeout_ms: 2_000,
            concurrency: 2,
            handler_timeout_ms: 30_000,
            channel_capacity: 256,
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

/// Partial lane section as written in the config file; missing fields fall
/// back to that lane's own defaults.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LanePatch {
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    concurrency: Option<usize>,
    handler_timeout_ms: Option<u64>,
    channel_capacity: Option<usize>,
}

impl LanePatch {
    fn apply(self, base: LaneConfig) -> LaneConfig {
        LaneConfig {
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            batch_timeout_ms: self.batch_timeout_ms.unwrap_or(base.batch_timeout_ms),
            concurrency: self.concurrency.unwrap_or(base.concurrency),
            handler_timeout_ms: self.handler_timeout_ms.unwrap_or(base.handler_timeout_ms),
            channel_capacity: self.channel_capacity.unwrap_or(base.channel_capacity),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LanesPatch {
    fast: LanePatch,
    standard: LanePatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LanesPatch")]
pub struct LanesConfig {
    pub fast: LaneConfig,
    pub standard: LaneConfig,
}

impl From<LanesPatch> for LanesConfig {
    fn from(patch: LanesPatch) -> Self {
        Self {
            fast: patch.fast.apply(LaneConfig::fast_default()),
            standard: patch.standard.apply(LaneConfig::standard_default()),
        }
    }
}

impl Default for LanesConfig {
    fn default() -> Self {
        Self {
            fast: LaneConfig::fast_default(),
            standard: LaneConfig::standard_default(),
        }
    }
}

impl LanesConfig {
    pub fn get(&self, lane: Lane) -> &LaneConfig {
        match lane {
            Lane::Fast => &self.fast,
            Lane::Standard => &self.standard,
        }
    }

    fn get_mut(&mut self, lane: Lane) -> &mut LaneConfig {
        match lane {
            Lane::Fast => &mut self.fast,
            Lane::Standard => &mut self.standard,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub poll_interval_ms: u64,
    /// Most rows claimed per poll.
    pub max_batch_size: usize,
    /// Capacity of the producer -> processor channel.
    pub channel_capacity: usize,
    /// Claims older than this are handed back to pending by the lease sweep.
    pub claim_lease_ms: u64,
    /// Claim owner name; generated when absent.
    pub worker_id: Option<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            max_batch_size: 100,
            channel_capacity: 256,
            claim_lease_ms: 300_000,
            worker_id: None,
        }
    }
}

impl ProducerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }

    /// The configured owner id, or a fresh `herald-<uuid>` one.
    pub fn worker_id(&self) -> Result<WorkerId, ConfigError> {
        match &self.worker_id {
            Some(id) => WorkerId::new(id.clone()).map_err(|_| ConfigError::InvalidValue {
                key: "producer.worker_id".to_string(),
                value: id.clone(),
            }),
            None => WorkerId::new(format!("herald-{}", uuid::Uuid::now_v7())).map_err(|e| {
                ConfigError::Invalid(format!("generated worker id rejected: {e}"))
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub workers: usize,
    pub dedup_failure_policy: DedupFailurePolicy,
    pub dedup_ttl_ms: u64,
    /// How often expired idempotency records are purged.
    pub dedup_purge_interval_ms: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dedup_failure_policy: DedupFailurePolicy::FailClosed,
            dedup_ttl_ms: DEFAULT_DEDUP_TTL_MS,
            dedup_purge_interval_ms: 60_000,
        }
    }
}

impl ProcessorConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    pub fn dedup_purge_interval(&self) -> Duration {
        Duration::from_millis(self.dedup_purge_interval_ms)
    }
}

/// Background replay of transiently failed dead-letter records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DlqSweepConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Records younger than this are left alone.
    pub min_age_ms: u64,
    pub max_per_sweep: usize,
    /// Events already replayed this many times are never swept again.
    pub max_auto_replays: u32,
}

impl Default for DlqSweepConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: 60_000,
            min_age_ms: 300_000,
            max_per_sweep: 100,
            max_auto_replays: 1,
        }
    }
}

impl DlqSweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_millis(self.min_age_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub queue_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// The static retry-budget table as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryBudgetsConfig {
    pub rules: Vec<BudgetRule>,
    pub default: RetryBudget,
}

impl Default for RetryBudgetsConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                BudgetRule::new("ml", RetryBudget::new(5, BackoffStrategy::Exponential)),
                BudgetRule::new("ui.command", RetryBudget::new(2, BackoffStrategy::None)),
                BudgetRule::new(
                    "integration",
                    RetryBudget::new(4, BackoffStrategy::Linear { step_ms: 5_000 }),
                ),
            ],
            default: RetryBudget::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backoff: BackoffConfig,
    pub retry_budgets: RetryBudgetsConfig,
    pub lanes: LanesConfig,
    pub producer: ProducerConfig,
    pub processor: ProcessorConfig,
    pub dlq_sweep: DlqSweepConfig,
    pub telemetry: TelemetryConfig,
    /// How long shutdown waits for in-flight batches before releasing claims.
    pub shutdown_grace_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            retry_budgets: RetryBudgetsConfig::default(),
            lanes: LanesConfig::default(),
            producer: ProducerConfig::default(),
            processor: ProcessorConfig::default(),
            dlq_sweep: DlqSweepConfig::default(),
            telemetry: TelemetryConfig::default(),
            shutdown_grace_ms: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Load from `HERALD_CONFIG` and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) if !path.trim().is_empty() => Self::from_file(path.trim())?,
            _ => Self::default(),
        };
        config.apply_overrides(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `HERALD_*` overrides for the flat options.
    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        override_value(lookup, "HERALD_MIN_DELAY_MS", &mut self.backoff.min_delay_ms)?;
        override_value(lookup, "HERALD_MAX_DELAY_MS", &mut self.backoff.max_delay_ms)?;
        override_value(lookup, "HERALD_JITTER_PCT", &mut self.backoff.jitter_pct)?;

        override_value(lookup, "HERALD_POLL_INTERVAL_MS", &mut self.producer.poll_interval_ms)?;
        override_value(lookup, "HERALD_MAX_BATCH_SIZE", &mut self.producer.max_batch_size)?;
        override_value(lookup, "HERALD_CLAIM_LEASE_MS", &mut self.producer.claim_lease_ms)?;
        if let Some(worker_id) = lookup("HERALD_WORKER_ID") {
            self.producer.worker_id = Some(worker_id);
        }

        override_value(lookup, "HERALD_PROCESSOR_WORKERS", &mut self.processor.workers)?;
        override_value(lookup, "HERALD_DEDUP_TTL_MS", &mut self.processor.dedup_ttl_ms)?;
        override_value(
            lookup,
            "HERALD_DEDUP_PURGE_INTERVAL_MS",
            &mut self.processor.dedup_purge_interval_ms,
        )?;
        if let Some(raw) = lookup("HERALD_DEDUP_FAILURE_POLICY") {
            self.processor.dedup_failure_policy = match raw.trim() {
                "fail_closed" => DedupFailurePolicy::FailClosed,
                "fail_open" => DedupFailurePolicy::FailOpen,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "HERALD_DEDUP_FAILURE_POLICY".to_string(),
                        value: raw,
                    });
                }
            };
        }

        override_value(lookup, "HERALD_DLQ_SWEEP_ENABLED", &mut self.dlq_sweep.enabled)?;
        override_value(lookup, "HERALD_SHUTDOWN_GRACE_MS", &mut self.shutdown_grace_ms)?;

        for lane in Lane::ALL {
            let prefix = format!("HERALD_{}", lane.as_str().to_ascii_uppercase());
            let cfg = self.lanes.get_mut(lane);
            override_value(lookup, &format!("{prefix}_BATCH_SIZE"), &mut cfg.batch_size)?;
            override_value(lookup, &format!("{prefix}_BATCH_TIMEOUT_MS"), &mut cfg.batch_timeout_ms)?;
            override_value(lookup, &format!("{prefix}_CONCURRENCY"), &mut cfg.concurrency)?;
            override_value(lookup, &format!("{prefix}_HANDLER_TIMEOUT_MS"), &mut cfg.handler_timeout_ms)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.backoff;
        if b.min_delay_ms > b.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff.min_delay_ms ({}) exceeds backoff.max_delay_ms ({})",
                b.min_delay_ms, b.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&b.jitter_pct) {
            return Err(ConfigError::Invalid(format!(
                "backoff.jitter_pct must be within [0, 1] (got {})",
                b.jitter_pct
            )));
        }

        for lane in Lane::ALL {
            let cfg = self.lanes.get(lane);
            for (field, value) in [
                ("batch_size", cfg.batch_size as u64),
                ("concurrency", cfg.concurrency as u64),
                ("channel_capacity", cfg.channel_capacity as u64),
                ("handler_timeout_ms", cfg.handler_timeout_ms),
            ] {
                if value == 0 {
                    return Err(ConfigError::Invalid(format!("lanes.{lane}.{field} must be positive")));
                }
            }
        }

        for (field, value) in [
            ("producer.max_batch_size", self.producer.max_batch_size as u64),
            ("producer.channel_capacity", self.producer.channel_capacity as u64),
            ("producer.claim_lease_ms", self.producer.claim_lease_ms),
            ("processor.workers", self.processor.workers as u64),
            ("processor.dedup_purge_interval_ms", self.processor.dedup_purge_interval_ms),
            ("telemetry.queue_capacity", self.telemetry.queue_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be positive")));
            }
        }

        // A claim must outlive one full batch window plus the handler call,
        // or an event still being delivered could be reclaimed elsewhere.
        for lane in Lane::ALL {
            let cfg = self.lanes.get(lane);
            let busy_ms = cfg.handler_timeout_ms.saturating_add(cfg.batch_timeout_ms);
            if self.producer.claim_lease_ms <= busy_ms {
                return Err(ConfigError::Invalid(format!(
                    "producer.claim_lease_ms ({}) must exceed lanes.{lane}.handler_timeout_ms + batch_timeout_ms ({busy_ms})",
                    self.producer.claim_lease_ms
                )));
            }
        }

        if self.dlq_sweep.enabled && self.dlq_sweep.interval_ms == 0 {
            return Err(ConfigError::Invalid("dlq_sweep.interval_ms must be positive".to_string()));
        }

        self.producer.worker_id()?;
        self.budget_table()?;
        Ok(())
    }

    /// Build the immutable retry-budget table.
    pub fn budget_table(&self) -> Result<RetryBudgetTable, ConfigError> {
        Ok(RetryBudgetTable::new(
            self.retry_budgets.rules.iter().cloned(),
            self.retry_budgets.default,
        )?)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn override_value<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
