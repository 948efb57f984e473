use eyre::Result;
use serde::{Deserialize, Serialize};

/// Default ceiling for decoded array lengths.
pub const DEFAULT_MAX_ARRAY_LENGTH: usize = 10_000;

/// Default ceiling for decoded `bytes`/`string` lengths (1 MiB).
pub const DEFAULT_MAX_BYTES_LENGTH: usize = 1 << 20;

/// Default nesting limit when resolving user-defined types.
pub const DEFAULT_MAX_TYPE_DEPTH: usize = 32;

/// Knobs of the trace reconstruction and value decoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct DebuggerConfig {
    /// Fail on an internal return that does not close an internal frame, instead of flagging it.
    pub strict: bool,
    pub max_array_length: usize,
    pub max_bytes_length: usize,
    pub max_type_depth: usize,
    /// Track jumps into and out of internal functions.
    pub resolve_internal_frames: bool,
    /// Match log topics against declared events and decode their arguments.
    pub decode_events: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            strict: false,
            max_array_length: DEFAULT_MAX_ARRAY_LENGTH,
            max_bytes_length: DEFAULT_MAX_BYTES_LENGTH,
            max_type_depth: DEFAULT_MAX_TYPE_DEPTH,
            resolve_internal_frames: true,
            decode_events: true,
        }
    }
}

impl DebuggerConfig {
    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Set strict mode.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the array length ceiling.
    pub fn max_array_length(mut self, len: usize) -> Self {
        self.max_array_length = len;
        self
    }

    /// Set the `bytes`/`string` length ceiling.
    pub fn max_bytes_length(mut self, len: usize) -> Self {
        self.max_bytes_length = len;
        self
    }

    /// Set the type nesting limit.
    pub fn max_type_depth(mut self, depth: usize) -> Self {
        self.max_type_depth = depth;
        self
    }

    /// Enable or disable internal frame tracking.
    pub fn resolve_internal_frames(mut self, enabled: bool) -> Self {
        self.resolve_internal_frames = enabled;
        self
    }

    /// Enable or disable event decoding.
    pub fn decode_events(mut self, enabled: bool) -> Self {
        self.decode_events = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DebuggerConfig::from_toml_str("strict = true\nmax_array_length = 16\n").unwrap();
        assert_eq!(config, DebuggerConfig::default().strict(true).max_array_length(16));
        assert!(DebuggerConfig::from_toml_str("strict = 1").is_err());
    }
}
