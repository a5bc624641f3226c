//! Token usage reported by agents.

use serde::{Deserialize, Serialize};

/// Raw resource counts attached to a processed message.
///
/// Field names follow the provider wire format so usage blobs can be passed
/// through unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Usage with only input and output tokens.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Self::default()
        }
    }

    /// Set cache counters.
    pub fn with_cache(mut self, read: u64, creation: u64) -> Self {
        self.cache_read_input_tokens = read;
        self.cache_creation_input_tokens = creation;
        self
    }

    /// Sum of all four counters.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_deserializes_with_missing_fields() -> Result<(), serde_json::Error> {
        let usage: TokenUsage = serde_json::from_str(r#"{"input_tokens": 1000, "output_tokens": 500}"#)?;
        assert_eq!(usage, TokenUsage::new(1000, 500));
        assert_eq!(usage.cache_read_input_tokens, 0);
        Ok(())
    }

    #[test]
    fn test_total_tokens() {
        let usage = TokenUsage::new(10, 20).with_cache(3, 4);
        assert_eq!(usage.total_tokens(), 37);
        assert!(!usage.is_empty());
        assert!(TokenUsage::default().is_empty());
    }
}
