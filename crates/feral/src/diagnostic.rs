//! Diagnostic rendering with source context.
//!
//! Failures that reach the driver are formatted with the source path, line
//! and column, the offending line, and a caret under the failing column.

use std::fmt;

/// A formatted runtime or load diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub path: String,
    pub line: usize,
    pub col: usize,
    pub line_text: String,
    pub message: String,
}

impl Diagnostic {
    /// Build a diagnostic for a byte offset into `code`.
    pub fn at_offset(path: &str, code: &str, offset: usize, message: impl Into<String>) -> Self {
        let (line, col) = offset_to_line_col(code, offset);
        let line_text = code.lines().nth(line - 1).unwrap_or("").to_string();
        Diagnostic {
            path: path.to_string(),
            line,
            col,
            line_text,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:{}:{}: error: {}", self.path, self.line, self.col, self.message)?;
        if !self.line_text.is_empty() {
            writeln!(f, "{}", self.line_text)?;
            writeln!(f, "{:>width$}", "^", width = self.col)?;
        }
        Ok(())
    }
}

/// Translate a byte offset into a 1-indexed line and column.
fn offset_to_line_col(code: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in code.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}
