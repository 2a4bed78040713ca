use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;

/// Keyword-group coverage needed for each confidence band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceThresholds {
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high: 0.90,
            medium: 0.75,
            low: 0.60,
        }
    }
}

/// Tunables for one [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chunks returned per retrieval pass.
    pub top_k: usize,
    /// Maximum chunk length in characters.
    pub max_chunk_chars: usize,
    /// Differential candidates kept after ranking.
    pub max_diagnoses: usize,
    /// Upper bound on a single generation call.
    pub generation_timeout: Duration,
    pub thresholds: ConfidenceThresholds,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            top_k: 6,
            max_chunk_chars: 1500,
            max_diagnoses: 3,
            generation_timeout: Duration::from_secs(60),
            thresholds: ConfidenceThresholds::default(),
        }
    }
}

impl PipelineConfig {
    pub const MIN_CHUNK_CHARS: usize = 64;

    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Defaults overlaid with environment variables, then validated.
    ///
    /// Optional:
    /// - `COPILOT_TOP_K` (default: 6)
    /// - `COPILOT_MAX_CHUNK_CHARS` (default: 1500)
    /// - `COPILOT_MAX_DIAGNOSES` (default: 3)
    /// - `COPILOT_GENERATION_TIMEOUT_SECS` (default: 60)
    /// - `COPILOT_THRESHOLD_HIGH`, `COPILOT_THRESHOLD_MEDIUM`, `COPILOT_THRESHOLD_LOW`
    ///   (defaults: 0.90, 0.75, 0.60)
    pub fn from_env() -> Result<Self, AnalysisError> {
        let mut builder = Self::builder();
        if let Some(v) = env_parse::<usize>("COPILOT_TOP_K")? {
            builder = builder.top_k(v);
        }
        if let Some(v) = env_parse::<usize>("COPILOT_MAX_CHUNK_CHARS")? {
            builder = builder.max_chunk_chars(v);
        }
        if let Some(v) = env_parse::<usize>("COPILOT_MAX_DIAGNOSES")? {
            builder = builder.max_diagnoses(v);
        }
        if let Some(v) = env_parse::<u64>("COPILOT_GENERATION_TIMEOUT_SECS")? {
            builder = builder.generation_timeout(Duration::from_secs(v));
        }

        let mut thresholds = ConfidenceThresholds::default();
        if let Some(v) = env_parse::<f32>("COPILOT_THRESHOLD_HIGH")? {
            thresholds.high = v;
        }
        if let Some(v) = env_parse::<f32>("COPILOT_THRESHOLD_MEDIUM")? {
            thresholds.medium = v;
        }
        if let Some(v) = env_parse::<f32>("COPILOT_THRESHOLD_LOW")? {
            thresholds.low = v;
        }
        builder.thresholds(thresholds).build()
    }
}

/// Unset variables are `Ok(None)`; set but unparseable variables are a config error.
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AnalysisError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AnalysisError::Config(format!("{name} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    pub fn max_chunk_chars(mut self, chars: usize) -> Self {
        self.config.max_chunk_chars = chars;
        self
    }

    pub fn max_diagnoses(mut self, n: usize) -> Self {
        self.config.max_diagnoses = n;
        self
    }

    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.config.generation_timeout = timeout;
        self
    }

    pub fn thresholds(mut self, thresholds: ConfidenceThresholds) -> Self {
        self.config.thresholds = thresholds;
        self
    }

    /// # Errors
    ///
    /// Returns [`AnalysisError::Config`] if:
    /// - `top_k == 0` or `max_diagnoses == 0`
    /// - `max_chunk_chars` is below [`PipelineConfig::MIN_CHUNK_CHARS`]
    /// - thresholds are not ordered `0 < low <= medium <= high <= 1`
    /// - `generation_timeout` is zero
    pub fn build(self) -> Result<PipelineConfig, AnalysisError> {
        let c = &self.config;
        if c.top_k == 0 {
            return Err(AnalysisError::Config("top_k must be greater than zero".to_string()));
        }
        if c.max_diagnoses == 0 {
            return Err(AnalysisError::Config(
                "max_diagnoses must be greater than zero".to_string(),
            ));
        }
        if c.max_chunk_chars < PipelineConfig::MIN_CHUNK_CHARS {
            return Err(AnalysisError::Config(format!(
                "max_chunk_chars ({}) must be at least {}",
                c.max_chunk_chars,
                PipelineConfig::MIN_CHUNK_CHARS
            )));
        }
        let t = c.thresholds;
        let ordered = t.low > 0.0 && t.low <= t.medium && t.medium <= t.high && t.high <= 1.0;
        if !ordered {
            return Err(AnalysisError::Config(format!(
                "confidence thresholds must satisfy 0 < low <= medium <= high <= 1 (got low={}, medium={}, high={})",
                t.low, t.medium, t.high
            )));
        }
        if c.generation_timeout.is_zero() {
            return Err(AnalysisError::Config(
                "generation_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let built = PipelineConfig::builder().build().unwrap();
        assert_eq!(built, PipelineConfig::default());
        assert_eq!(built.top_k, 6);
        assert_eq!(built.max_chunk_chars, 1500);
        assert_eq!(built.max_diagnoses, 3);
    }

    #[test]
    fn zero_top_k_is_rejected() {
        let err = PipelineConfig::builder().top_k(0).build().unwrap_err();
        assert!(matches!(err, AnalysisError::Config(_)));
    }

    #[test]
    fn tiny_chunks_are_rejected() {
        assert!(PipelineConfig::builder().max_chunk_chars(10).build().is_err());
        assert!(PipelineConfig::builder().max_chunk_chars(64).build().is_ok());
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let inverted = ConfidenceThresholds {
            high: 0.5,
            medium: 0.75,
            low: 0.6,
        };
        assert!(PipelineConfig::builder().thresholds(inverted).build().is_err());

        let zero_low = ConfidenceThresholds {
            high: 0.9,
            medium: 0.5,
            low: 0.0,
        };
        assert!(PipelineConfig::builder().thresholds(zero_low).build().is_err());

        let flat = ConfidenceThresholds {
            high: 0.8,
            medium: 0.8,
            low: 0.8,
        };
        assert!(PipelineConfig::builder().thresholds(flat).build().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = PipelineConfig::builder()
            .generation_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("generation_timeout"));
    }
}
