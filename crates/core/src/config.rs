use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub tool_provider: ToolProviderConfig,
    pub engine: EngineSettings,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &["ANTHROPIC_API_KEY", "TOOL_PROVIDER_COMMAND", "PORT"];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `TOOLBRIDGE_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("TOOLBRIDGE_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            server: ServerConfig::from_env_profiled(p),
            llm: LlmConfig::from_env_profiled(p),
            tool_provider: ToolProviderConfig::from_env_profiled(p),
            engine: EngineSettings::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_TOOL_DEPTH",
                reason: "must be at least 1".to_string(),
            });
        }
        if !matches!(self.engine.argument_policy.as_str(), "lenient" | "strict") {
            return Err(ConfigError::Invalid {
                key: "ARGUMENT_POLICY",
                reason: format!("expected 'lenient' or 'strict', got '{}'", self.engine.argument_policy),
            });
        }
        if self.tool_provider.command.trim().is_empty() {
            return Err(ConfigError::Missing("TOOL_PROVIDER_COMMAND"));
        }
        if self.server.relay_subprotocol.trim().is_empty() {
            return Err(ConfigError::Missing("RELAY_SUBPROTOCOL"));
        }
        Ok(())
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  server:        {}:{} (relay subprotocol: {})", self.server.host, self.server.port, self.server.relay_subprotocol);
        tracing::info!("  llm:           provider={}, model={}, configured={}", self.llm.provider, self.llm.model, self.llm.is_configured());
        tracing::info!("  tool provider: {} (reconnects={}, backoff={}ms)", self.tool_provider.command_line(), self.tool_provider.max_reconnect_attempts, self.tool_provider.backoff_ms);
        tracing::info!("  engine:        max_depth={}, argument_policy={}, preamble={}", self.engine.max_depth, self.engine.argument_policy, self.engine.preamble.is_some());
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "server": {
                "host": self.server.host,
                "port": self.server.port,
                "relay_subprotocol": self.server.relay_subprotocol,
            },
            "llm": {
                "provider": self.llm.provider,
                "model": self.llm.model,
                "base_url": self.llm.base_url,
                "configured": self.llm.is_configured(),
            },
            "tool_provider": {
                "command": self.tool_provider.command,
                "args": self.tool_provider.args,
                "max_reconnect_attempts": self.tool_provider.max_reconnect_attempts,
                "backoff_ms": self.tool_provider.backoff_ms,
                "request_timeout_secs": self.tool_provider.request_timeout_secs,
            },
            "engine": {
                "max_depth": self.engine.max_depth,
                "argument_policy": self.engine.argument_policy,
                "catalog_timeout_secs": self.engine.catalog_timeout_secs,
                "preamble": self.engine.preamble.is_some(),
            },
        })
    }
}

// ── Server ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    /// WebSocket subprotocol relay clients must request.
    pub relay_subprotocol: String,
}

impl ServerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "PORT", 3001),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
            relay_subprotocol: profiled_env_or(p, "RELAY_SUBPROTOCOL", "mcp"),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── LLM (Anthropic) ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "anthropic" (alias "claude")
    pub provider: String,
    pub anthropic_api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl LlmConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            provider: profiled_env_or(p, "LLM_PROVIDER", "anthropic"),
            anthropic_api_key: profiled_env_opt(p, "ANTHROPIC_API_KEY"),
            model: profiled_env_or(p, "ANTHROPIC_MODEL", "claude-sonnet-4-5-20250929"),
            base_url: profiled_env_or(p, "ANTHROPIC_BASE_URL", "https://api.anthropic.com"),
            temperature: profiled_env_or(p, "LLM_TEMPERATURE", "0.0")
                .parse()
                .unwrap_or(0.0),
            max_tokens: profiled_env_u32(p, "LLM_MAX_TOKENS", 4096),
            system_prompt: profiled_env_opt(p, "SYSTEM_PROMPT"),
        }
    }

    pub fn is_configured(&self) -> bool {
        match self.provider.as_str() {
            "anthropic" | "claude" => self.anthropic_api_key.is_some(),
            _ => false,
        }
    }
}

// ── Tool provider process ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProviderConfig {
    pub command: String,
    pub args: Vec<String>,
    pub max_reconnect_attempts: u32,
    pub backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl ToolProviderConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            command: profiled_env_or(p, "TOOL_PROVIDER_COMMAND", "toolbridge-stub-provider"),
            args: profiled_env_opt(p, "TOOL_PROVIDER_ARGS")
                .map(|raw| raw.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            max_reconnect_attempts: profiled_env_u32(p, "TOOL_PROVIDER_MAX_RECONNECTS", 3),
            backoff_ms: profiled_env_u64(p, "TOOL_PROVIDER_BACKOFF_MS", 1000),
            request_timeout_secs: profiled_env_u64(p, "TOOL_PROVIDER_TIMEOUT_SECS", 120),
        }
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

// ── Conversation engine ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Tool-call rounds allowed per user message.
    pub max_depth: u32,
    /// "lenient" or "strict"
    pub argument_policy: String,
    /// Instruction prepended to the first user message of a session.
    pub preamble: Option<String>,
    pub catalog_timeout_secs: u64,
}

impl EngineSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            max_depth: profiled_env_u32(p, "MAX_TOOL_DEPTH", 4),
            argument_policy: profiled_env_or(p, "ARGUMENT_POLICY", "lenient").to_lowercase(),
            preamble: profiled_env_opt(p, "FIRST_MESSAGE_PREAMBLE"),
            catalog_timeout_secs: profiled_env_u64(p, "CATALOG_TIMEOUT_SECS", 120),
        }
    }

    pub fn catalog_timeout(&self) -> Duration {
        Duration::from_secs(self.catalog_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own profile prefix so parallel tests never share keys.

    #[test]
    fn test_profile_overrides_fall_back_to_defaults() {
        env::set_var("CFGTESTA_MAX_TOOL_DEPTH", "7");
        env::set_var("CFGTESTA_TOOL_PROVIDER_ARGS", "--db  local.db");
        env::set_var("CFGTESTA_TOOL_PROVIDER_BACKOFF_MS", "250");

        let config = Config::for_profile("cfgtesta");
        assert_eq!(config.profile, "CFGTESTA");
        assert_eq!(config.profile_label(), "CFGTESTA");
        assert_eq!(config.engine.max_depth, 7);
        assert_eq!(config.tool_provider.args, vec!["--db", "local.db"]);
        assert_eq!(config.tool_provider.backoff(), Duration::from_millis(250));
        assert!(config.tool_provider.command_line().ends_with("--db local.db"));
    }

    #[test]
    fn test_unparseable_numbers_use_defaults() {
        env::set_var("CFGTESTB_TOOL_PROVIDER_MAX_RECONNECTS", "many");
        let config = Config::for_profile("CFGTESTB");
        assert_eq!(config.tool_provider.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_validate() {
        env::set_var("CFGTESTC_ARGUMENT_POLICY", "Strict");
        let mut config = Config::for_profile("CFGTESTC");
        assert_eq!(config.engine.argument_policy, "strict");
        assert!(config.validate().is_ok());

        config.engine.max_depth = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "MAX_TOOL_DEPTH", .. })
        ));

        config.engine.max_depth = 4;
        config.engine.argument_policy = "yolo".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_summary_hides_api_key() {
        env::set_var("CFGTESTD_ANTHROPIC_API_KEY", "sk-ant-secret");
        let config = Config::for_profile("CFGTESTD");
        assert!(config.llm.is_configured());

        let summary = config.redacted_summary();
        assert_eq!(summary["llm"]["configured"], true);
        assert!(!summary.to_string().contains("sk-ant-secret"));
        assert!(Config::available_profiles().contains(&"CFGTESTD".to_string()));
    }
}
