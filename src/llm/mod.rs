//! LLM integration.
//!
//! The pipeline talks to models only through [`LlmProvider`]. The Anthropic
//! backend speaks the Messages API directly over `reqwest` so that image
//! content blocks can be sent alongside text.

pub mod anthropic;
pub mod provider;

pub use anthropic::AnthropicProvider;
pub use provider::*;

use std::sync::Arc;

use crate::error::LlmError;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
}

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.backend {
        LlmBackend::Anthropic => {
            tracing::info!("Using Anthropic (model: {})", config.model);
            Ok(Arc::new(AnthropicProvider::new(
                config.api_key.clone(),
                &config.model,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_provider_constructs_without_network() {
        let config = LlmConfig {
            backend: LlmBackend::Anthropic,
            api_key: secrecy::SecretString::from("test-key"),
            model: "claude-sonnet-4-20250514".to_string(),
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "claude-sonnet-4-20250514");
    }
}
