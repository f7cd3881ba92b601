//! Loading and validating search configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::communication::{LocalGroup, Topology};
use crate::error::{Result, SearchError};

/// Top-level configuration of a search deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub parallel: ParallelConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shape of one model-parallel replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub tensor_parallel_size: usize,
    pub pipeline_parallel_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            tensor_parallel_size: 1,
            pipeline_parallel_size: 1,
        }
    }
}

impl ParallelConfig {
    pub fn world_size(&self) -> usize {
        self.tensor_parallel_size * self.pipeline_parallel_size
    }

    /// Placement of `rank` under this layout.
    pub fn topology(&self, rank: usize) -> Result<Topology> {
        Topology::new(rank, self.tensor_parallel_size, self.pipeline_parallel_size)
    }

    /// Builds an in-process group with this layout.
    pub fn local_group(&self) -> Result<LocalGroup> {
        LocalGroup::new(self.tensor_parallel_size, self.pipeline_parallel_size)
    }
}

/// The model settings batched search depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// True vocabulary size; logits beyond it are padding.
    pub vocab_size: usize,
    pub max_sequence_length: usize,
    #[serde(default)]
    pub sequence_parallel: bool,
    #[serde(default)]
    pub activations_checkpoint_granularity: Option<String>,
    #[serde(default)]
    pub activations_checkpoint_method: Option<String>,
}

impl ModelConfig {
    pub fn new(vocab_size: usize, max_sequence_length: usize) -> Self {
        Self {
            vocab_size,
            max_sequence_length,
            sequence_parallel: false,
            activations_checkpoint_granularity: None,
            activations_checkpoint_method: None,
        }
    }

    /// Checks the settings a model must run with during search.
    ///
    /// # Errors
    ///
    /// [`SearchError::ConfigPrecondition`] when sequence parallelism or
    /// activation checkpointing is enabled.
    pub fn check_inference(&self) -> Result<()> {
        if self.sequence_parallel {
            return Err(SearchError::ConfigPrecondition(
                "sequence_parallel must be disabled during inference".to_string(),
            ));
        }
        if let Some(granularity) = &self.activations_checkpoint_granularity {
            return Err(SearchError::ConfigPrecondition(format!(
                "activations_checkpoint_granularity must be unset during inference, got {granularity}"
            )));
        }
        if let Some(method) = &self.activations_checkpoint_method {
            return Err(SearchError::ConfigPrecondition(format!(
                "activations_checkpoint_method must be unset during inference, got {method}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Batch sizes for one decode pass.
///
/// Search always runs one micro-batch holding the whole request, with no
/// data parallelism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub micro_batch_size: usize,
    pub global_batch_size: usize,
}

impl BatchConfig {
    pub fn for_batch(batch_size: usize) -> Self {
        Self {
            micro_batch_size: batch_size,
            global_batch_size: batch_size,
        }
    }
}

impl SearchConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SearchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config = Self::from_toml_str(&content)?;
        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.parallel.tensor_parallel_size == 0 || self.parallel.pipeline_parallel_size == 0 {
            return Err(SearchError::Config(
                "tensor_parallel_size and pipeline_parallel_size must be at least 1".into(),
            ));
        }

        if self.model.vocab_size == 0 {
            return Err(SearchError::Config("vocab_size must be at least 1".into()));
        }

        if self.model.max_sequence_length == 0 {
            return Err(SearchError::Config("max_sequence_length must be at least 1".into()));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(SearchError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ));
            }
        }

        Ok(())
    }
}
