//! Trace configuration.
//!
//! Passed explicitly to recorder and replayer constructors.

use crate::id::Direction;
use serde::{Deserialize, Serialize};

/// Which boundary directions are traced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionFilter {
    /// Trace host-to-guest calls
    pub calls: bool,
    /// Trace guest-to-host callbacks
    pub callbacks: bool,
}

impl DirectionFilter {
    /// Trace both directions
    #[must_use]
    pub const fn all() -> Self {
        Self {
            calls: true,
            callbacks: true,
        }
    }

    /// Whether `direction` passes the filter
    #[must_use]
    pub const fn allows(&self, direction: Direction) -> bool {
        match direction {
            Direction::Call => self.calls,
            Direction::Callback => self.callbacks,
        }
    }
}

impl Default for DirectionFilter {
    fn default() -> Self {
        Self::all()
    }
}

/// Limits on the string table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InternLimits {
    /// Maximum number of distinct strings (`None` = unlimited)
    pub max_strings: Option<usize>,
    /// Maximum byte length of a single string (`None` = unlimited)
    pub max_string_len: Option<usize>,
}

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Direction filters
    pub directions: DirectionFilter,
    /// Record writes into guest memory
    pub memory_writes: bool,
    /// String interning limits
    pub intern: InternLimits,
}

impl TraceConfig {
    /// Create a config that traces everything
    #[must_use]
    pub fn new() -> Self {
        Self {
            directions: DirectionFilter::all(),
            memory_writes: true,
            intern: InternLimits::default(),
        }
    }

    /// Set direction filters
    #[must_use]
    pub fn with_directions(mut self, directions: DirectionFilter) -> Self {
        self.directions = directions;
        self
    }

    /// Enable/disable memory write recording
    #[must_use]
    pub fn with_memory_writes(mut self, enable: bool) -> Self {
        self.memory_writes = enable;
        self
    }

    /// Cap the number of interned strings
    #[must_use]
    pub fn with_max_strings(mut self, max: usize) -> Self {
        self.intern.max_strings = Some(max);
        self
    }

    /// Cap the byte length of interned strings
    #[must_use]
    pub fn with_max_string_len(mut self, max: usize) -> Self {
        self.intern.max_string_len = Some(max);
        self
    }

    /// Whether crossings in `direction` are traced
    #[must_use]
    pub const fn traces(&self, direction: Direction) -> bool {
        self.directions.allows(direction)
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
    /// Returns error if deserialization fails
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = TraceConfig::default();
        assert!(config.traces(Direction::Call));
        assert!(config.traces(Direction::Callback));
        assert!(config.memory_writes);
        assert_eq!(config.intern.max_strings, None);
    }

    #[test]
    fn test_config_builders() {
        let config = TraceConfig::new()
            .with_directions(DirectionFilter {
                calls: true,
                callbacks: false,
            })
            .with_memory_writes(false)
            .with_max_strings(64)
            .with_max_string_len(256);
        assert!(!config.traces(Direction::Callback));
        assert!(!config.memory_writes);
        assert_eq!(config.intern.max_strings, Some(64));
        assert_eq!(config.intern.max_string_len, Some(256));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = TraceConfig::new().with_max_strings(10);
        let back = TraceConfig::from_json(&config.to_json()).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_config_from_partial_json_fails() {
        assert!(TraceConfig::from_json("{\"memory_writes\": true}").is_err());
    }
}
