use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use std::io::{self, Write};

use toolbridge_runtime::{Notification, ToolDefinition};

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const USER_PROMPT: Color = Color::Green;
    const ASSISTANT_TEXT: Color = Color::Cyan;
    const TOOL_CALL: Color = Color::Yellow;
    const TOOL_RESULT: Color = Color::DarkGreen;
    const ERROR: Color = Color::Red;
    const DIM: Color = Color::DarkGrey;
    const HEADER: Color = Color::Magenta;
}

const MAX_ARGS_DISPLAY: usize = 200;

/// Manages terminal I/O for the interactive REPL.
pub struct Terminal;

impl Terminal {
    pub fn new() -> Self {
        Self
    }

    /// Print the startup banner.
    pub fn print_banner(&self, model: &str, tool_provider: &str, tools: usize) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("toolbridge"),
            ResetColor,
            Print(" - tool-calling chat\n"),
            SetForegroundColor(Colors::DIM),
            Print(format!("Model: {} | Tools: {} from {}\n", model, tools, tool_provider)),
            Print("Type 'exit' or 'quit' to end. Ctrl+C cancels the current turn.\n"),
            Print("---\n"),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    /// Read a line of user input with prompt.
    /// Returns None if the user wants to exit or stdin is closed.
    pub fn read_input(&self) -> Result<Option<String>> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            Print("\n"),
            SetForegroundColor(Colors::USER_PROMPT),
            Print("you> "),
            ResetColor,
        )?;
        stdout.flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            return Ok(None);
        }
        let trimmed = input.trim().to_string();

        if matches!(trimmed.as_str(), "exit" | "quit" | "/exit" | "/quit") {
            return Ok(None);
        }

        Ok(Some(trimmed))
    }

    /// Display a turn notification. Assistant deltas are printed as they
    /// arrive, without a newline.
    pub fn display_notification(&self, notification: &Notification) -> Result<()> {
        let mut stdout = io::stdout();
        match notification {
            Notification::AssistantDelta { text } => {
                execute!(
                    stdout,
                    SetForegroundColor(Colors::ASSISTANT_TEXT),
                    Print(text),
                    ResetColor,
                )?;
            }
            Notification::ToolInvoked { .. } | Notification::ToolFinished { .. } => {
                let color = match notification {
                    Notification::ToolFinished { is_error: true, .. } => Colors::ERROR,
                    Notification::ToolFinished { .. } => Colors::TOOL_RESULT,
                    _ => Colors::TOOL_CALL,
                };
                execute!(
                    stdout,
                    Print("\n"),
                    SetForegroundColor(color),
                    Print(tool_line(notification)),
                    ResetColor,
                )?;
            }
            Notification::RateLimited { message } | Notification::TooComplex { message } => {
                execute!(
                    stdout,
                    Print("\n"),
                    SetForegroundColor(Colors::TOOL_CALL),
                    Print(message),
                    ResetColor,
                )?;
            }
            Notification::Error { message } => {
                execute!(
                    stdout,
                    Print("\n"),
                    SetForegroundColor(Colors::ERROR),
                    Print(format!("[error: {}]", message)),
                    ResetColor,
                )?;
            }
        }
        stdout.flush()?;
        Ok(())
    }

    /// Print the tool catalog.
    pub fn print_tools(&self, tools: &[&ToolDefinition]) -> Result<()> {
        let mut stdout = io::stdout();
        if tools.is_empty() {
            execute!(
                stdout,
                SetForegroundColor(Colors::DIM),
                Print("The tool provider offers no tools.\n"),
                ResetColor,
            )?;
            return Ok(());
        }

        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print(format!("Tools ({}):\n", tools.len())),
            ResetColor,
        )?;
        for tool in tools {
            execute!(
                stdout,
                SetForegroundColor(Colors::TOOL_CALL),
                Print(format!("  {:<24}", tool.name)),
                ResetColor,
                Print(format!("{}\n", tool.description)),
            )?;
        }
        stdout.flush()?;
        Ok(())
    }

    pub fn print_error(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::ERROR),
            Print(format!("Error: {}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }

    pub fn print_info(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(format!("{}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }
}

/// One-line rendering of a tool notification.
fn tool_line(notification: &Notification) -> String {
    match notification {
        Notification::ToolInvoked {
            tool_name,
            tool_args,
            ..
        } => format!("[tool: {}] {}", tool_name, truncate(&tool_args.to_string(), MAX_ARGS_DISPLAY)),
        Notification::ToolFinished {
            tool_name, is_error, ..
        } => {
            let label = if *is_error { "failed" } else { "done" };
            format!("[tool: {} {}]\n", tool_name, label)
        }
        _ => String::new(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{}... ({} chars total)", head, total)
}
