use clap::Parser;

/// Chat with a language model that can call tools from an MCP tool provider.
///
/// Runs the conversation engine locally: the model provider is called
/// directly and the tool provider is spawned as a child process.
#[derive(Parser, Debug)]
#[command(name = "toolbridge", about = "Tool-calling chat REPL over an MCP tool provider")]
pub struct CliArgs {
    /// Model name override
    #[arg(long, env = "ANTHROPIC_MODEL")]
    pub model: Option<String>,

    /// API key (overrides env var and config file)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Path to config file (default: ~/.config/toolbridge/config.toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Config profile to read from the environment
    #[arg(long, env = "TOOLBRIDGE_PROFILE")]
    pub profile: Option<String>,

    /// Tool provider executable
    #[arg(long)]
    pub tool_command: Option<String>,

    /// Argument passed to the tool provider (repeatable)
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    pub tool_args: Vec<String>,

    /// System prompt override
    #[arg(long)]
    pub system_prompt: Option<String>,

    /// Instruction prepended to the first message
    #[arg(long)]
    pub preamble: Option<String>,

    /// Maximum tool-call rounds per message
    #[arg(long)]
    pub max_depth: Option<u32>,

    /// Reject malformed tool arguments instead of running with `{}`
    #[arg(long)]
    pub strict_args: bool,

    /// Print the tool catalog and exit
    #[arg(long)]
    pub list_tools: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repeatable_tool_args() {
        let args = CliArgs::try_parse_from([
            "toolbridge",
            "--tool-command",
            "node",
            "--tool-arg",
            "server.js",
            "--tool-arg",
            "stdio",
            "--max-depth",
            "2",
            "--strict-args",
        ])
        .unwrap();

        assert_eq!(args.tool_command.as_deref(), Some("node"));
        assert_eq!(args.tool_args, vec!["server.js", "stdio"]);
        assert_eq!(args.max_depth, Some(2));
        assert!(args.strict_args);
        assert!(!args.list_tools);
    }

    #[test]
    fn test_list_tools_flag() {
        let args = CliArgs::try_parse_from(["toolbridge", "--list-tools"]).unwrap();
        assert!(args.list_tools);
        assert!(args.tool_args.is_empty());
    }
}
