pub mod claude_tool_provider;

use std::sync::Arc;

use toolbridge_core::config::LlmConfig;
use toolbridge_runtime::provider::{LlmError, ToolAwareLlmProvider};

/// Create the tool-aware LLM provider named by config.
pub fn create_provider(llm_config: &LlmConfig) -> Result<Arc<dyn ToolAwareLlmProvider>, LlmError> {
    match llm_config.provider.as_str() {
        "anthropic" | "claude" => {
            let api_key = llm_config
                .anthropic_api_key
                .as_ref()
                .ok_or_else(|| LlmError::NotConfigured("ANTHROPIC_API_KEY not set".into()))?;
            Ok(Arc::new(claude_tool_provider::ClaudeToolProvider::new(
                api_key.clone(),
                llm_config.model.clone(),
                llm_config.base_url.clone(),
            )))
        }
        other => Err(LlmError::NotConfigured(format!(
            "unknown LLM provider: '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, key: Option<&str>) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            anthropic_api_key: key.map(String::from),
            model: "claude-test".to_string(),
            base_url: "http://localhost:1".to_string(),
            temperature: 0.0,
            max_tokens: 128,
            system_prompt: None,
        }
    }

    #[test]
    fn test_create_provider_claude_aliases() {
        for name in ["anthropic", "claude"] {
            let provider = create_provider(&config(name, Some("sk-test"))).unwrap();
            assert_eq!(provider.provider_name(), "claude");
        }
    }

    #[test]
    fn test_create_provider_missing_key() {
        let err = create_provider(&config("anthropic", None)).err().unwrap();
        assert!(matches!(err, LlmError::NotConfigured(ref m) if m.contains("ANTHROPIC_API_KEY")));
    }

    #[test]
    fn test_create_provider_unknown() {
        let err = create_provider(&config("gpt", Some("k"))).err().unwrap();
        assert!(matches!(err, LlmError::NotConfigured(ref m) if m.contains("gpt")));
    }
}
