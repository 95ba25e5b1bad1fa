use serde::{Deserialize, Serialize};

use crate::{FluxError, Result};

/// Hard safety ceiling on convergence passes, regardless of configuration.
pub const MAX_ITERATIONS_CEILING: usize = 10;

/// Tunables for the whole pipeline. All fields have serde defaults so a
/// partial JSON/TOML fragment is enough to construct one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Base batch window before a buffered change is eligible for release.
    #[serde(default = "PipelineConfig::default_debounce_ms")]
    pub debounce_ms: u64,
    /// Interval between dispatch-loop ticks in the accumulator.
    #[serde(default = "PipelineConfig::default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Hard cap on in-flight analysis calls.
    #[serde(default = "PipelineConfig::default_max_concurrent_analyses")]
    pub max_concurrent_analyses: usize,
    /// Changes per second that trip mass-change accumulation.
    #[serde(default = "PipelineConfig::default_mass_change_threshold")]
    pub mass_change_threshold: usize,
    /// Ceiling on the adaptive debounce window.
    #[serde(default = "PipelineConfig::default_max_window_ms")]
    pub max_window_ms: u64,
    /// Cap on convergence-loop passes. Clamped to [`MAX_ITERATIONS_CEILING`].
    #[serde(default = "PipelineConfig::default_max_iterations")]
    pub max_iterations: usize,
    /// Minimum suggestion confidence eligible for refinement re-selection.
    #[serde(default = "PipelineConfig::default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Optional include globs; when set they replace the extension allow-set.
    #[serde(default)]
    pub include_globs: Vec<String>,
    /// Enqueue a full index of the watched roots on startup.
    #[serde(default)]
    pub index_on_start: bool,
}

impl PipelineConfig {
    fn default_debounce_ms() -> u64 {
        500
    }

    fn default_batch_delay_ms() -> u64 {
        100
    }

    fn default_max_concurrent_analyses() -> usize {
        10
    }

    fn default_mass_change_threshold() -> usize {
        5
    }

    fn default_max_window_ms() -> u64 {
        5_000
    }

    fn default_max_iterations() -> usize {
        3
    }

    fn default_confidence_threshold() -> f32 {
        0.9
    }

    /// Check option ranges, clamping `max_iterations` to the safety ceiling.
    pub fn validated(mut self) -> Result<Self> {
        if self.debounce_ms == 0 {
            return Err(FluxError::InvalidConfig(
                "debounce_ms must be greater than zero".into(),
            ));
        }
        if self.max_window_ms < self.debounce_ms {
            return Err(FluxError::InvalidConfig(format!(
                "max_window_ms ({}) must not be below debounce_ms ({})",
                self.max_window_ms, self.debounce_ms
            )));
        }
        if self.max_concurrent_analyses == 0 {
            return Err(FluxError::InvalidConfig(
                "max_concurrent_analyses must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(FluxError::InvalidConfig(format!(
                "confidence_threshold ({}) must be within [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.max_iterations > MAX_ITERATIONS_CEILING {
            tracing::warn!(
                requested = self.max_iterations,
                ceiling = MAX_ITERATIONS_CEILING,
                "max_iterations above safety ceiling, clamping"
            );
            self.max_iterations = MAX_ITERATIONS_CEILING;
        }
        Ok(self)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: Self::default_debounce_ms(),
            batch_delay_ms: Self::default_batch_delay_ms(),
            max_concurrent_analyses: Self::default_max_concurrent_analyses(),
            mass_change_threshold: Self::default_mass_change_threshold(),
            max_window_ms: Self::default_max_window_ms(),
            max_iterations: Self::default_max_iterations(),
            confidence_threshold: Self::default_confidence_threshold(),
            include_globs: Vec::new(),
            index_on_start: false,
        }
    }
}
