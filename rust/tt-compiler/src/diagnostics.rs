//! Error diagnostics with source snippets for terminal display.

use crate::compiler::lexer::LexError;
use crate::CompileError;

/// Severity level for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// A rendered diagnostic with source context
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
    pub col: Option<usize>,
    pub source_line: Option<String>,
    pub underline: Option<String>,
}

impl Diagnostic {
    /// Render without colors.
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Note => "note",
        };
        out.push_str(&format!("{}: {}\n", severity, self.message));
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            match self.col {
                Some(col) => out.push_str(&format!("  --> {}:{}:{}\n", file, line, col)),
                None => out.push_str(&format!("  --> {}:{}\n", file, line)),
            }
        }
        if let (Some(line_num), Some(text)) = (self.line, &self.source_line) {
            let gutter = format!("{}", line_num);
            out.push_str(&format!("  {} | {}\n", gutter, text));
            if let Some(underline) = &self.underline {
                let spaces = " ".repeat(gutter.len());
                out.push_str(&format!("  {} | {}\n", spaces, underline));
            }
        }
        out
    }

    /// Render as a JSON object for editor tooling.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "severity": match self.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
                Severity::Note => "note",
            },
            "message": self.message,
            "file": self.file,
            "line": self.line,
            "col": self.col,
        })
    }

    /// Render with ANSI colors for terminal display.
    pub fn render_ansi(&self) -> String {
        let mut out = String::new();
        let (color, severity) = match self.severity {
            Severity::Error => ("\x1b[31m", "error"),
            Severity::Warning => ("\x1b[33m", "warning"),
            Severity::Note => ("\x1b[36m", "note"),
        };
        out.push_str(&format!("{}{}\x1b[0m: {}\n", color, severity, self.message));
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            match self.col {
                Some(col) => {
                    out.push_str(&format!("  \x1b[2m-->\x1b[0m {}:{}:{}\n", file, line, col))
                }
                None => out.push_str(&format!("  \x1b[2m-->\x1b[0m {}:{}\n", file, line)),
            }
        }
        if let (Some(line_num), Some(text)) = (self.line, &self.source_line) {
            let gutter = format!("{}", line_num);
            out.push_str(&format!("  \x1b[2m{} |\x1b[0m {}\n", gutter, text));
            if let Some(underline) = &self.underline {
                let spaces = " ".repeat(gutter.len());
                out.push_str(&format!("  {} | \x1b[31m{}\x1b[0m\n", spaces, underline));
            }
        }
        out
    }
}

fn snippet(source: &str, line: usize) -> Option<String> {
    if line == 0 {
        return None;
    }
    source.lines().nth(line - 1).map(str::to_string)
}

fn underline_at(source_line: &str, col: Option<usize>) -> Option<String> {
    let col = col?;
    if col == 0 || col > source_line.len() + 1 {
        return None;
    }
    Some(format!("{}^", " ".repeat(col - 1)))
}

fn diagnostic_at(
    message: String,
    filename: &str,
    source: &str,
    line: Option<usize>,
    col: Option<usize>,
) -> Diagnostic {
    let source_line = line.and_then(|l| snippet(source, l));
    let underline = source_line.as_deref().and_then(|text| underline_at(text, col));
    Diagnostic {
        severity: Severity::Error,
        message,
        file: Some(filename.to_string()),
        line: line.filter(|&l| l > 0),
        col,
        source_line,
        underline,
    }
}

fn lex_error_position(error: &LexError) -> (Option<usize>, Option<usize>) {
    match error {
        LexError::ForbiddenKeyword { line, col, .. }
        | LexError::UnterminatedString { line, col }
        | LexError::InvalidNumber { line, col }
        | LexError::InvalidEscape { line, col }
        | LexError::InvalidEntityReference { line, col } => (Some(*line), Some(*col)),
        LexError::UnresolvedEntity { .. } => (None, None),
    }
}

/// Map a compile error onto one or more rendered diagnostics.
pub fn format_compile_error(
    error: &CompileError,
    source: &str,
    filename: &str,
) -> Vec<Diagnostic> {
    let (message, line, col) = match error {
        CompileError::Lex(e) => {
            let (line, col) = lex_error_position(e);
            (e.to_string(), line, col)
        }
        CompileError::Parse(e) => (e.to_string(), Some(e.line()), None),
        CompileError::Type(e) => (e.to_string(), e.line(), None),
        CompileError::Ir(e) => (e.to_string(), None, None),
        CompileError::Unserializable(e) => (e.to_string(), None, None),
        CompileError::NotImplemented { construct } => {
            (format!("{} is not implemented", construct), None, None)
        }
    };
    vec![diagnostic_at(message, filename, source, line, col)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse;

    #[test]
    fn test_parse_error_renders_snippet() {
        let source = "monitor ;";
        let err = parse(source).unwrap_err();
        let diagnostics = format_compile_error(&err, source, "test.tt");
        assert_eq!(diagnostics.len(), 1);
        let rendered = diagnostics[0].render_plain();
        assert!(rendered.contains("error:"), "{}", rendered);
        assert!(rendered.contains("test.tt:1"), "{}", rendered);
        assert!(rendered.contains("monitor ;"), "{}", rendered);
    }

    #[test]
    fn test_lex_error_has_caret() {
        let source = "\"unterminated\nrest";
        let err = parse(source).unwrap_err();
        let diagnostics = format_compile_error(&err, source, "test.tt");
        let rendered = diagnostics[0].render_plain();
        assert!(rendered.contains('^'), "{}", rendered);
    }

    #[test]
    fn test_ansi_rendering_includes_color() {
        let source = "monitor ;";
        let err = parse(source).unwrap_err();
        let diagnostics = format_compile_error(&err, source, "test.tt");
        assert!(diagnostics[0].render_ansi().contains("\x1b[31m"));
    }

    #[test]
    fn test_json_rendering() {
        let source = "monitor ;";
        let err = parse(source).unwrap_err();
        let json = format_compile_error(&err, source, "test.tt")[0].to_json();
        assert_eq!(json["severity"], "error");
        assert_eq!(json["file"], "test.tt");
        assert_eq!(json["line"], 1);
    }
}
