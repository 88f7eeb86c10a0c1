//! Application configuration builders.

use std::sync::Arc;

use tracing::{info, warn};

use toolbridge_core::Config;
use toolbridge_runtime::ToolAwareLlmProvider;

/// Load configuration from `.env` and environment variables.
pub fn load_config() -> Config {
    toolbridge_core::config::load_dotenv();
    Config::from_env()
}

/// Build the model provider, or `None` when the LLM section is incomplete.
pub fn build_provider(config: &Config) -> Option<Arc<dyn ToolAwareLlmProvider>> {
    match toolbridge_llm::create_provider(&config.llm) {
        Ok(provider) => {
            info!(provider = provider.provider_name(), model = %config.llm.model, "LLM provider ready");
            Some(provider)
        }
        Err(e) => {
            warn!("LLM provider unavailable: {} (sessions disabled, relay still served)", e);
            None
        }
    }
}
