// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration, loadable from YAML.
//!
//! ```yaml
//! checkpoint_interval: 10
//! max_retries: 5
//! mutation_strategy: merge_on_read
//! compaction:
//!   min_file_size: 1048576
//!   max_files_to_compact: 10
//! zorder:
//!   bits_per_dimension: 21
//! ```

use crate::error::{EngineError, Result};
use deltalog::{BackoffPolicy, DeltaLogOptions, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How UPDATE and DELETE change a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStrategy {
    /// Write a small delta file layered over untouched base files
    #[default]
    MergeOnRead,
    /// Rewrite every affected base file
    CopyOnWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Base files smaller than this are compaction candidates (bytes)
    pub min_file_size: u64,
    pub max_files_to_compact: usize,
    /// Desired size of rewritten files (bytes)
    pub target_file_size: u64,
    /// Auto-compaction period
    pub check_interval_secs: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            min_file_size: 1024 * 1024,
            max_files_to_compact: 10,
            target_file_size: 128 * 1024 * 1024,
            check_interval_secs: 60,
        }
    }
}

impl CompactionConfig {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZOrderConfig {
    pub bits_per_dimension: u32,
    pub target_rows_per_file: usize,
}

impl Default for ZOrderConfig {
    fn default() -> Self {
        Self {
            bits_per_dimension: 21,
            target_rows_per_file: 100_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 5,
            max_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub checkpoint_interval: i64,
    pub log_retention: bool,
    pub optimistic_lock: bool,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub data_skipping: bool,
    pub mutation_strategy: MutationStrategy,
    pub compaction: CompactionConfig,
    pub zorder: ZOrderConfig,
    /// Recorded as `user_id` on every commit
    pub user_id: Option<String>,
    /// Replaces the backoff built from `backoff`; tests use `NoBackoff`
    #[serde(skip)]
    pub backoff_policy: Option<Arc<dyn BackoffPolicy>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            log_retention: false,
            optimistic_lock: true,
            max_retries: 5,
            backoff: BackoffConfig::default(),
            data_skipping: true,
            mutation_strategy: MutationStrategy::default(),
            compaction: CompactionConfig::default(),
            zorder: ZOrderConfig::default(),
            user_id: None,
            backoff_policy: None,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_interval < 1 {
            return Err(EngineError::Config(format!(
                "checkpoint_interval must be positive, got {}",
                self.checkpoint_interval
            )));
        }
        if self.compaction.max_files_to_compact < 2 {
            return Err(EngineError::Config(
                "compaction.max_files_to_compact must be at least 2".to_string(),
            ));
        }
        if self.compaction.target_file_size == 0 {
            return Err(EngineError::Config(
                "compaction.target_file_size must be positive".to_string(),
            ));
        }
        if !(1..=64).contains(&self.zorder.bits_per_dimension) {
            return Err(EngineError::Config(format!(
                "zorder.bits_per_dimension must be within 1..=64, got {}",
                self.zorder.bits_per_dimension
            )));
        }
        if self.zorder.target_rows_per_file == 0 {
            return Err(EngineError::Config(
                "zorder.target_rows_per_file must be positive".to_string(),
            ));
        }
        if self.backoff.min_delay_ms > self.backoff.max_delay_ms {
            return Err(EngineError::Config(
                "backoff.min_delay_ms exceeds backoff.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: i64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    #[must_use]
    pub fn with_log_retention(mut self, enabled: bool) -> Self {
        self.log_retention = enabled;
        self
    }

    #[must_use]
    pub fn with_optimistic_lock(mut self, enabled: bool) -> Self {
        self.optimistic_lock = enabled;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_data_skipping(mut self, enabled: bool) -> Self {
        self.data_skipping = enabled;
        self
    }

    #[must_use]
    pub fn with_mutation_strategy(mut self, strategy: MutationStrategy) -> Self {
        self.mutation_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    #[must_use]
    pub fn with_zorder(mut self, zorder: ZOrderConfig) -> Self {
        self.zorder = zorder;
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn log_options(&self) -> DeltaLogOptions {
        DeltaLogOptions {
            checkpoint_interval: self.checkpoint_interval,
            log_retention: self.log_retention,
        }
    }

    #[must_use]
    pub fn backoff_policy(&self) -> Arc<dyn BackoffPolicy> {
        match &self.backoff_policy {
            Some(policy) => policy.clone(),
            None => Arc::new(ExponentialBackoff {
                min_delay: Duration::from_millis(self.backoff.min_delay_ms),
                max_delay: Duration::from_millis(self.backoff.max_delay_ms),
            }),
        }
    }
}
