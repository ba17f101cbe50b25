//! Configuration types for the extraction pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExtractionError, Result};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Version tag of the extraction logic.
    ///
    /// Scopes cache keys and provenance; bumping it invalidates every cached
    /// Tier C result without a purge.
    pub extractor_version: String,

    /// Documents processed concurrently by `run_documents`. Default: 4.
    pub workers: usize,

    pub deterministic: DeterministicConfig,
    pub escalation: EscalationConfig,
    pub inference: InferenceConfig,
    pub cache: CacheConfig,
    pub dlq: DlqConfig,
    pub writer: WriterConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extractor_version: "1.0.0".to_string(),
            workers: 4,
            deterministic: DeterministicConfig::default(),
            escalation: EscalationConfig::default(),
            inference: InferenceConfig::default(),
            cache: CacheConfig::default(),
            dlq: DlqConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden from the environment.
    ///
    /// Reads `EXTRACTOR_VERSION`, `EXTRACTION_WORKERS`,
    /// `EXTRACTION_TIER_C_BATCH_SIZE` and `EXTRACTION_GRAPH_BATCH_SIZE`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(version) = std::env::var("EXTRACTOR_VERSION") {
            config.extractor_version = version;
        }
        if let Some(workers) = env_usize("EXTRACTION_WORKERS")? {
            config.workers = workers;
        }
        if let Some(size) = env_usize("EXTRACTION_TIER_C_BATCH_SIZE")? {
            config.inference = config.inference.with_batch_size(size);
        }
        if let Some(size) = env_usize("EXTRACTION_GRAPH_BATCH_SIZE")? {
            config.writer.batch_size = size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ExtractionError::Config(msg.to_string().into()));
        if self.extractor_version.trim().is_empty() {
            return fail("extractor_version must not be empty");
        }
        if self.workers == 0 {
            return fail("workers must be > 0");
        }
        if self.inference.batch_size == 0 || self.inference.parallelism == 0 {
            return fail("inference batch_size and parallelism must be > 0");
        }
        if self.writer.batch_size == 0 {
            return fail("writer batch_size must be > 0");
        }
        if self.writer.shrink_factor < 2 {
            return fail("writer shrink_factor must be >= 2");
        }
        if !(0.0..=1.0).contains(&self.inference.default_confidence) {
            return fail("inference default_confidence must be within [0, 1]");
        }
        Ok(())
    }

    /// Set the extractor version.
    pub fn with_extractor_version(mut self, version: impl Into<String>) -> Self {
        self.extractor_version = version.into();
        self
    }

    /// Set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_inference(mut self, inference: InferenceConfig) -> Self {
        self.inference = inference;
        self
    }

    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_dlq(mut self, dlq: DlqConfig) -> Self {
        self.dlq = dlq;
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_deterministic(mut self, deterministic: DeterministicConfig) -> Self {
        self.deterministic = deterministic;
        self
    }
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ExtractionError::Config(format!("{} must be a number: {}", name, e).into())),
        Err(_) => Ok(None),
    }
}

/// Tier A settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeterministicConfig {
    /// Dictionary of service names recognized anywhere in text.
    pub known_services: Vec<String>,
}

impl Default for DeterministicConfig {
    fn default() -> Self {
        Self {
            known_services: [
                "nginx",
                "haproxy",
                "traefik",
                "envoy",
                "postgres",
                "postgresql",
                "mysql",
                "mariadb",
                "mongodb",
                "redis",
                "memcached",
                "rabbitmq",
                "kafka",
                "zookeeper",
                "elasticsearch",
                "opensearch",
                "prometheus",
                "grafana",
                "consul",
                "vault",
                "etcd",
                "minio",
                "keycloak",
                "jaeger",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl DeterministicConfig {
    /// Add service names to the dictionary.
    pub fn with_services(mut self, services: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.known_services.extend(services.into_iter().map(|s| s.into()));
        self
    }
}

/// Tier B escalation heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Entities per 100 tokens above which a span counts as dense. Default: 8.0.
    pub density_threshold: f32,

    /// Fraction of entities that must take part in a bound relation for a
    /// dense span to stay in Tier B. Default: 0.5.
    pub min_coverage: f32,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            density_threshold: 8.0,
            min_coverage: 0.5,
        }
    }
}

/// Tier C settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Windows per inference call. Default: 8.
    pub batch_size: usize,

    /// Concurrent inference calls. Default: matches `batch_size`.
    pub parallelism: usize,

    /// Hard limit; larger windows are rejected as non-retryable. Default: 512.
    pub max_window_tokens: usize,

    /// Per-call timeout. Default: 30s.
    pub call_timeout: Duration,

    /// Decoding temperature sent with every request. Default: 0.0.
    pub temperature: f32,

    /// Immediate re-asks when output fails validation. Default: 1.
    pub max_validation_retries: u32,

    /// Confidence used when the model reports none. Default: 0.5.
    pub default_confidence: f64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            parallelism: 8,
            max_window_tokens: 512,
            call_timeout: Duration::from_secs(30),
            temperature: 0.0,
            max_validation_retries: 1,
            default_confidence: 0.5,
        }
    }
}

impl InferenceConfig {
    /// Set batch size; parallelism follows it.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self.parallelism = batch_size;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_window_tokens(mut self, tokens: usize) -> Self {
        self.max_window_tokens = tokens;
        self
    }

    pub fn with_max_validation_retries(mut self, retries: u32) -> Self {
        self.max_validation_retries = retries;
        self
    }
}

/// Extraction cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of cached results and their metadata. Default: 7 days.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Dead letter queue retry policy and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Retries before an entry becomes permanently failed. Default: 3.
    pub max_retries: u32,

    /// Delay before the first retry. Default: 1s.
    pub backoff_base: Duration,

    /// Multiplier per retry (1s, 5s, 25s). Default: 5.
    pub backoff_factor: u32,

    /// Whether schema-invalid failures go through the retry schedule
    /// instead of failing permanently. Default: true.
    pub retry_schema_invalid: bool,

    /// Retention of retrying entries. Default: 30 days.
    pub entry_ttl: Duration,

    /// Retention of permanently failed entries. Default: 90 days.
    pub failed_ttl: Duration,

    /// How long a claimed entry may stay in `Retrying` before a sweep
    /// assumes its worker died and puts it back on the schedule.
    /// Default: 10 minutes.
    pub claim_timeout: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 5,
            retry_schema_invalid: true,
            entry_ttl: Duration::from_secs(30 * 24 * 3600),
            failed_ttl: Duration::from_secs(90 * 24 * 3600),
            claim_timeout: Duration::from_secs(600),
        }
    }
}

impl DlqConfig {
    /// Delay before retry number `retries_done + 1`.
    pub fn backoff(&self, retries_done: u32) -> Duration {
        self.backoff_base
            .saturating_mul(self.backoff_factor.saturating_pow(retries_done))
    }
}

/// Batch graph writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Rows per commit. Default: 2,000.
    pub batch_size: usize,

    /// Retries of one batch on write conflict. Default: 3.
    pub max_conflict_retries: u32,

    /// Delay before the first conflict retry, doubled each time. Default: 100ms.
    pub conflict_backoff: Duration,

    /// Divisor applied to a batch that keeps conflicting. Default: 2.
    pub shrink_factor: usize,

    /// Per-commit timeout. Default: 30s.
    pub commit_timeout: Duration,

    /// Throughput the writer is expected to sustain. Default: 5,000 rows/s.
    pub target_rows_per_sec: f64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 2_000,
            max_conflict_retries: 3,
            conflict_backoff: Duration::from_millis(100),
            shrink_factor: 2,
            commit_timeout: Duration::from_secs(30),
            target_rows_per_sec: 5_000.0,
        }
    }
}

impl WriterConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_conflict_backoff(mut self, backoff: Duration) -> Self {
        self.conflict_backoff = backoff;
        self
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    /// Delay before conflict retry number `attempt + 1`.
    pub fn conflict_delay(&self, attempt: u32) -> Duration {
        self.conflict_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dlq_backoff_schedule() {
        let dlq = DlqConfig::default();
        assert_eq!(dlq.backoff(0), Duration::from_secs(1));
        assert_eq!(dlq.backoff(1), Duration::from_secs(5));
        assert_eq!(dlq.backoff(2), Duration::from_secs(25));
    }

    #[test]
    fn test_conflict_delay_doubles() {
        let writer = WriterConfig::default();
        assert_eq!(writer.conflict_delay(0), Duration::from_millis(100));
        assert_eq!(writer.conflict_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_batch_size_sets_parallelism() {
        let inference = InferenceConfig::default().with_batch_size(12);
        assert_eq!(inference.parallelism, 12);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(PipelineConfig::default().with_workers(0).validate().is_err());
        assert!(PipelineConfig::default()
            .with_extractor_version(" ")
            .validate()
            .is_err());
        let mut config = PipelineConfig::default();
        config.writer.shrink_factor = 1;
        assert!(config.validate().is_err());
    }
}
