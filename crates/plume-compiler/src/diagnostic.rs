//! Diagnostic rendering shared by fatal errors and warnings.
//!
//! ```text
//! main.pl:3: syntax error: attempt to reassign constant 'x'
//!     3 | x = 6
//!       | ^^^^^ here: this variable is constant, and cannot be reassigned.
//!       |
//! ```
use crate::lexer::LexError;
use owo_colors::OwoColorize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A located message, optionally carrying the offending source line.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub source: String,
    pub line: u32,
    pub message: String,
    /// Annotation printed after the caret run.
    pub here: Option<String>,
    /// Raw text of `line`, when available.
    pub excerpt: Option<String>,
}

impl Diagnostic {
    pub fn render(&self, color: bool, short: bool) -> String {
        let kind = match self.severity {
            Severity::Error => "syntax error",
            Severity::Warning => "warning",
        };
        let kind = match (color, self.severity) {
            (false, _) => kind.to_string(),
            (true, Severity::Error) => kind.bright_red().bold().to_string(),
            (true, Severity::Warning) => kind.bright_yellow().bold().to_string(),
        };
        let header = format!("{}:{}: {}: {}", self.source, self.line, kind, self.message);
        let text = match &self.excerpt {
            Some(text) if !short => text.trim(),
            _ => return header,
        };

        let number = self.line.to_string();
        let pad = " ".repeat(number.len());
        let mut underline = "^".repeat(text.chars().count().max(1));
        if let Some(here) = &self.here {
            underline = format!("{underline} here: {here}");
        }
        if color {
            underline = match self.severity {
                Severity::Error => underline.bright_red().to_string(),
                Severity::Warning => underline.bright_yellow().to_string(),
            };
        }
        format!("{header}\n\t{number} | {text}\n\t{pad} | {underline}\n\t{pad} |")
    }
}

/// Fatal compilation error. `Display` prints the rendered diagnostic.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{rendered}")]
pub struct CompileError {
    /// Bare human-readable message.
    pub message: String,
    /// Chunk name the error was reported against.
    pub chunk: String,
    pub line: u32,
    pub here: Option<String>,
    pub rendered: String,
}

impl CompileError {
    pub fn from_diagnostic(diag: &Diagnostic, color: bool, short: bool) -> Self {
        CompileError {
            message: diag.message.clone(),
            chunk: diag.source.clone(),
            line: diag.line,
            here: diag.here.clone(),
            rendered: diag.render(color, short),
        }
    }
}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            rendered: e.to_string(),
            message: e.message,
            chunk: String::new(),
            line: e.line,
            here: None,
        }
    }
}
