use colored::*;
use std::io::{self, Write};

use crate::llm::StreamFragment;
use crate::orchestrator::{ChatOutcome, HealthReport, HealthStatus};

/// Console handles all terminal I/O with colored formatting
pub struct Console {
    user_color: Color,
    assistant_color: Color,
    tool_color: Color,
}

impl Console {
    /// Create a new Console with default colors
    pub fn new() -> Self {
        Self {
            user_color: Color::Cyan,
            assistant_color: Color::Green,
            tool_color: Color::Magenta,
        }
    }

    /// Create a new Console with custom colors
    pub fn with_colors(user_color: Color, assistant_color: Color, tool_color: Color) -> Self {
        Self {
            user_color,
            assistant_color,
            tool_color,
        }
    }

    /// Print an assistant message prefix (without newline)
    pub fn print_assistant_prefix(&self) {
        print!("{} ", "Assistant:".color(self.assistant_color).bold());
        let _ = io::stdout().flush();
    }

    /// Print one streamed fragment
    pub fn print_fragment(&self, fragment: &StreamFragment) {
        if fragment.is_terminal {
            println!();
        } else if fragment.is_tool_call {
            print!(
                "{} ",
                format!("[{}]", fragment.text).color(self.tool_color)
            );
        } else {
            print!("{}", fragment.text.color(self.assistant_color));
        }
        let _ = io::stdout().flush();
    }

    /// Print how the answer was produced
    pub fn print_outcome(&self, outcome: &ChatOutcome) {
        let path = outcome
            .attempted
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        match &outcome.error {
            None => println!("{}", format!("({})", path).bright_black()),
            Some(e) => self.print_error(&format!("{} ({})", e, path)),
        }
    }

    /// Print a system message (errors, info, etc.)
    pub fn print_system(&self, message: &str) {
        println!("{} {}", "System:".yellow().bold(), message);
    }

    /// Print an error message
    pub fn print_error(&self, error: &str) {
        eprintln!("{} {}", "Error:".red().bold(), error);
    }

    pub fn print_health(&self, report: &HealthReport) {
        let status = match report.status {
            HealthStatus::Healthy => "Healthy".green().bold(),
            HealthStatus::Degraded => "Degraded".yellow().bold(),
            HealthStatus::Unhealthy => "Unhealthy".red().bold(),
        };
        println!("{} {} - {}", "Health:".bold(), status, report.reason);
        println!(
            "  key {} ({}), model {}",
            report.masked_credential, report.credential_source, report.model
        );
    }

    /// Read a line of input from the user
    pub fn read_input(&self) -> io::Result<String> {
        print!("{} ", ">".color(self.user_color).bold());
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    }

    /// Print a welcome banner
    pub fn print_banner(&self, model: &str) {
        println!("{}", "=".repeat(60).bright_blue());
        println!(
            "{}",
            format!("  Municipal Finance Assistant ({})", model)
                .bright_blue()
                .bold()
        );
        println!("{}", "=".repeat(60).bright_blue());
        println!();
        println!("Type your question and press Enter.");
        println!("Commands: /new (new conversation), /health, /quit");
        println!();
    }

    /// Print a separator line
    pub fn print_separator(&self) {
        println!("{}", "-".repeat(60).bright_black());
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}
