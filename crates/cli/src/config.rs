use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use toolbridge_core::Config;

use crate::cli::CliArgs;

/// CLI configuration loaded from a TOML file. Every field is optional and
/// only overrides what the environment already configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Instruction prepended to the first message of the session
    #[serde(default)]
    pub preamble: Option<String>,

    #[serde(default)]
    pub max_depth: Option<u32>,

    #[serde(default)]
    pub tool_provider: Option<ToolProviderSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProviderSection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CliConfig {
    /// Return the default config directory path: ~/.config/toolbridge/
    pub fn default_config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine user config directory")?
            .join("toolbridge");
        Ok(config_dir)
    }

    /// Return the default config file path.
    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::default_config_dir()?.join("config.toml"))
    }

    /// Load config from the given path, or the default path.
    ///
    /// A missing default file yields the empty config; a missing explicit
    /// path is an error.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (PathBuf::from(p), true),
            None => match Self::default_config_path() {
                Ok(p) => (p, false),
                Err(e) => {
                    debug!(error = %e, "No config directory, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !config_path.exists() {
            if explicit {
                anyhow::bail!("config file not found: {}", config_path.display());
            }
            debug!(?config_path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        debug!(?config_path, "Loading config");
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config: {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config: {}", config_path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Layer this file and the command line over the environment config.
    /// Priority: command line > config file > environment.
    pub fn apply(&self, config: &mut Config, args: &CliArgs) {
        if let Some(model) = args.model.clone().or_else(|| self.model.clone()) {
            config.llm.model = model;
        }
        if let Some(key) = args.api_key.clone().or_else(|| self.api_key.clone()) {
            config.llm.anthropic_api_key = Some(key);
        }
        if let Some(prompt) = args
            .system_prompt
            .clone()
            .or_else(|| self.system_prompt.clone())
        {
            config.llm.system_prompt = Some(prompt);
        }
        if let Some(preamble) = args.preamble.clone().or_else(|| self.preamble.clone()) {
            config.engine.preamble = Some(preamble);
        }
        if let Some(depth) = args.max_depth.or(self.max_depth) {
            config.engine.max_depth = depth;
        }
        if args.strict_args {
            config.engine.argument_policy = "strict".to_string();
        }

        if let Some(command) = &args.tool_command {
            config.tool_provider.command = command.clone();
            config.tool_provider.args = args.tool_args.clone();
        } else if let Some(section) = &self.tool_provider {
            config.tool_provider.command = section.command.clone();
            config.tool_provider.args = section.args.clone();
        }
    }
}
