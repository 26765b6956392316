use serde::{Deserialize, Serialize};

use crate::error::ShiftError;

/// How value conversions treat lossy input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SqlMode {
    /// Overflow, truncation and illegal nulls fail the statement or job.
    #[default]
    Strict,
    /// Overflow clamps and illegal nulls become the zero value, each with a warning.
    Relaxed,
}

/// Runtime configuration for a shiftdb node.
#[derive(Debug, Clone)]
pub struct ShiftConfig {
    /// Failures a job may accumulate before the governor stops retrying it.
    pub error_count_limit: u64,
    /// Upper bound for a schema-sync barrier. A node that has not caught up
    /// within one lease is assumed to have dropped its stale schema.
    pub schema_lease_ms: u64,
    pub sync_poll_interval_ms: u64,
    pub owner_lease_ttl_ms: u64,
    pub owner_campaign_interval_ms: u64,
    pub owner_tick_interval_ms: u64,
    pub job_poll_interval_ms: u64,
    pub reorg_worker_count: usize,
    /// Rows per backfill range handed to one worker.
    pub reorg_chunk_rows: usize,
    /// Rows per backfill transaction inside a range.
    pub reorg_batch_size: usize,
    pub max_txn_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub gc_batch_size: usize,
    pub auto_id_step: i64,
    pub max_cached_schema_versions: usize,
    pub default_sql_mode: SqlMode,
    pub sync_wal_commits: bool,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            error_count_limit: 512,
            schema_lease_ms: 45_000,
            sync_poll_interval_ms: 20,
            owner_lease_ttl_ms: 10_000,
            owner_campaign_interval_ms: 200,
            owner_tick_interval_ms: 50,
            job_poll_interval_ms: 20,
            reorg_worker_count: std::thread::available_parallelism()
                .map(|n| n.get().clamp(2, 16))
                .unwrap_or(4),
            reorg_chunk_rows: 256,
            reorg_batch_size: 128,
            max_txn_retries: 10,
            retry_backoff_base_ms: 2,
            retry_backoff_max_ms: 200,
            gc_batch_size: 1024,
            auto_id_step: 1000,
            max_cached_schema_versions: 64,
            default_sql_mode: SqlMode::Strict,
            sync_wal_commits: true,
        }
    }
}

impl ShiftConfig {
    pub fn production() -> Self {
        Self {
            sync_wal_commits: true,
            ..Self::default()
        }
    }

    /// Short leases and small chunks so tests observe every state quickly.
    pub fn development() -> Self {
        Self {
            schema_lease_ms: 2_000,
            sync_poll_interval_ms: 2,
            owner_lease_ttl_ms: 1_000,
            owner_campaign_interval_ms: 10,
            owner_tick_interval_ms: 5,
            job_poll_interval_ms: 2,
            reorg_worker_count: 4,
            reorg_chunk_rows: 16,
            reorg_batch_size: 8,
            retry_backoff_base_ms: 1,
            retry_backoff_max_ms: 10,
            auto_id_step: 100,
            sync_wal_commits: false,
            ..Self::default()
        }
    }

    pub fn with_error_count_limit(mut self, limit: u64) -> Self {
        self.error_count_limit = limit;
        self
    }

    pub fn with_sql_mode(mut self, mode: SqlMode) -> Self {
        self.default_sql_mode = mode;
        self
    }

    /// Upper bound on step attempts for a job that fails every time: the
    /// ceiling is crossed once, retried once more, then the job is cancelled.
    pub fn max_attempts(&self) -> u64 {
        self.error_count_limit.saturating_add(2)
    }

    pub fn validate(&self) -> Result<(), ShiftError> {
        validate_config(self)
    }
}

pub(crate) fn validate_config(config: &ShiftConfig) -> Result<(), ShiftError> {
    let positive: [(&str, u64); 8] = [
        ("schema_lease_ms", config.schema_lease_ms),
        ("sync_poll_interval_ms", config.sync_poll_interval_ms),
        ("owner_lease_ttl_ms", config.owner_lease_ttl_ms),
        ("owner_campaign_interval_ms", config.owner_campaign_interval_ms),
        ("owner_tick_interval_ms", config.owner_tick_interval_ms),
        ("job_poll_interval_ms", config.job_poll_interval_ms),
        ("retry_backoff_base_ms", config.retry_backoff_base_ms),
        ("max_cached_schema_versions", config.max_cached_schema_versions as u64),
    ];
    for (name, value) in positive {
        if value == 0 {
            return Err(ShiftError::InvalidConfig {
                message: format!("{name} must be > 0"),
            });
        }
    }
    if config.reorg_worker_count == 0 {
        return Err(ShiftError::InvalidConfig {
            message: "reorg_worker_count must be > 0".into(),
        });
    }
    if config.reorg_batch_size == 0 || config.reorg_chunk_rows < config.reorg_batch_size {
        return Err(ShiftError::InvalidConfig {
            message: "reorg_batch_size must be > 0 and <= reorg_chunk_rows".into(),
        });
    }
    if config.retry_backoff_max_ms < config.retry_backoff_base_ms {
        return Err(ShiftError::InvalidConfig {
            message: "retry_backoff_max_ms must be >= retry_backoff_base_ms".into(),
        });
    }
    if config.gc_batch_size == 0 {
        return Err(ShiftError::InvalidConfig {
            message: "gc_batch_size must be > 0".into(),
        });
    }
    if config.auto_id_step <= 0 {
        return Err(ShiftError::InvalidConfig {
            message: "auto_id_step must be > 0".into(),
        });
    }
    if config.owner_lease_ttl_ms <= config.owner_tick_interval_ms {
        return Err(ShiftError::InvalidConfig {
            message: "owner_lease_ttl_ms must exceed owner_tick_interval_ms".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ShiftConfig, validate_config};

    #[test]
    fn profiles_validate() {
        validate_config(&ShiftConfig::default()).expect("default");
        validate_config(&ShiftConfig::production()).expect("production");
        validate_config(&ShiftConfig::development()).expect("development");
        assert_eq!(ShiftConfig::default().error_count_limit, 512);
    }

    #[test]
    fn rejects_batch_larger_than_chunk() {
        let config = ShiftConfig {
            reorg_chunk_rows: 4,
            reorg_batch_size: 8,
            ..ShiftConfig::development()
        };
        let err = validate_config(&config).expect_err("must reject");
        assert!(err.to_string().contains("reorg_batch_size"));
    }

    #[test]
    fn zero_error_limit_is_allowed() {
        let config = ShiftConfig::development().with_error_count_limit(0);
        validate_config(&config).expect("limit 0 means first failure exceeds");
        assert_eq!(config.max_attempts(), 2);
    }
}
