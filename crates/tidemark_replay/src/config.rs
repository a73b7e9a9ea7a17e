//! Replay configuration.

use serde::{Deserialize, Serialize};

/// Replayer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Treat callback argument mismatches as fatal instead of warnings
    pub strict_arguments: bool,
    /// Absolute tolerance when comparing floating point values
    pub float_tolerance: f64,
    /// Maximum events to replay (0 = unlimited)
    pub max_events: usize,
}

impl ReplayConfig {
    /// Create a config with lenient argument checks and no event limit
    #[must_use]
    pub fn new() -> Self {
        Self {
            strict_arguments: false,
            float_tolerance: 1e-6,
            max_events: 0,
        }
    }

    /// Make argument mismatches fatal
    #[must_use]
    pub fn with_strict_arguments(mut self, strict: bool) -> Self {
        self.strict_arguments = strict;
        self
    }

    /// Set the float comparison tolerance
    #[must_use]
    pub fn with_float_tolerance(mut self, tolerance: f64) -> Self {
        self.float_tolerance = tolerance;
        self
    }

    /// Stop after this many events
    #[must_use]
    pub fn with_max_events(mut self, max: usize) -> Self {
        self.max_events = max;
        self
    }

    /// Whether `consumed` events exhaust the limit
    #[must_use]
    pub const fn limit_reached(&self, consumed: usize) -> bool {
        self.max_events > 0 && consumed >= self.max_events
    }

    /// Options for comparing replayed values with live ones
    #[must_use]
    pub fn compare_options(&self) -> CompareOptions {
        CompareOptions {
            float_tolerance: self.float_tolerance,
        }
    }

    /// Serialize to JSON
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the input is not a valid config
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How replayed and live values are compared
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompareOptions {
    /// Absolute tolerance for floats
    pub float_tolerance: f64,
}

impl Default for CompareOptions {
    fn default() -> Self {
        ReplayConfig::default().compare_options()
    }
}
