//! Model selection state.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Reasoning effort requested from the model.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

/// Mutable model selection of one agent instance.
///
/// Changes made at runtime are recorded in the session tree as
/// `model_change` / `thinking_level_change` entries so replay reconstructs
/// the configuration in effect at any leaf.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub thinking_level: ThinkingLevel,
}

impl ModelConfig {
    pub fn new(provider: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_id: model_id.into(),
            thinking_level: ThinkingLevel::Off,
        }
    }

    pub fn with_thinking_level(mut self, level: ThinkingLevel) -> Self {
        self.thinking_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn thinking_level_parses_from_string() {
        assert_eq!(ThinkingLevel::from_str("high").unwrap(), ThinkingLevel::High);
        assert_eq!(ThinkingLevel::from_str("off").unwrap(), ThinkingLevel::Off);
        assert!(ThinkingLevel::from_str("extreme").is_err());
    }

    #[test]
    fn model_config_uses_camel_case_wire_names() {
        let config = ModelConfig::new("anthropic", "opus-4").with_thinking_level(ThinkingLevel::Low);
        let value = serde_json::to_value(&config).expect("serialize");
        assert_eq!(value["modelId"], "opus-4");
        assert_eq!(value["thinkingLevel"], "low");
    }
}
