//! Lexer for TT source text.

use crate::compiler::tokens::{Span, TildeSide, Token, TokenKind};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("'{keyword}' is a reserved word at line {line}, col {col}")]
    ForbiddenKeyword { keyword: String, line: usize, col: usize },
    #[error("unterminated string at line {line}, col {col}")]
    UnterminatedString { line: usize, col: usize },
    #[error("invalid number at line {line}, col {col}")]
    InvalidNumber { line: usize, col: usize },
    #[error("invalid escape sequence at line {line}, col {col}")]
    InvalidEscape { line: usize, col: usize },
    #[error("invalid entity reference at line {line}, col {col}")]
    InvalidEntityReference { line: usize, col: usize },
    #[error("cannot resolve entity token '{name}'")]
    UnresolvedEntity { name: String },
}

/// Hard keywords: always tokenized as keywords, never usable as names.
static HARD_KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("aggregate", TokenKind::Aggregate);
    m.insert("any", TokenKind::Any);
    m.insert("as", TokenKind::As);
    m.insert("class", TokenKind::Class);
    m.insert("compute", TokenKind::Compute);
    m.insert("dataset", TokenKind::Dataset);
    m.insert("enum", TokenKind::Enum);
    m.insert("extends", TokenKind::Extends);
    m.insert("false", TokenKind::False);
    m.insert("filter", TokenKind::Filter);
    m.insert("function", TokenKind::Function);
    m.insert("from", TokenKind::From);
    m.insert("import", TokenKind::Import);
    m.insert("in", TokenKind::In);
    m.insert("join", TokenKind::Join);
    m.insert("let", TokenKind::Let);
    m.insert("monitor", TokenKind::Monitor);
    m.insert("new", TokenKind::New);
    m.insert("now", TokenKind::Now);
    m.insert("null", TokenKind::Null);
    m.insert("of", TokenKind::Of);
    m.insert("on", TokenKind::On);
    m.insert("opt", TokenKind::Opt);
    m.insert("out", TokenKind::Out);
    m.insert("req", TokenKind::Req);
    m.insert("sort", TokenKind::Sort);
    m.insert("true", TokenKind::True);
    m
});

/// Contextual keywords: ordinary identifiers everywhere except the specific
/// positions the parser looks for them in (class member headers, sort
/// descriptors, aggregation names, chain outputs).
pub static CONTEXTUAL_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "action", "asc", "attimer", "avg", "count", "desc", "edge", "executor", "language",
        "list", "max", "min", "monitorable", "notify", "program", "query", "stream", "sum",
        "timer",
    ]
    .into_iter()
    .collect()
});

/// Identifiers reserved by the runtime; using one is an immediate error.
static FORBIDDEN_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "break", "case", "catch", "continue", "debugger", "default", "delete", "do", "else",
        "finally", "for", "instanceof", "return", "switch", "throw", "try", "typeof", "var",
        "void", "while", "with", "yield",
    ]
    .into_iter()
    .collect()
});

/// `$`-prefixed names with a recognized meaning.
static DOLLAR_KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "?", "answer", "context", "debug", "dialogue", "end_of", "event", "failed", "location",
        "nevermind", "no", "now", "policy", "program_id", "source", "start_of", "stop", "time",
        "undefined", "yes",
    ]
    .into_iter()
    .collect()
});

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn is_tt_whitespace(ch: char) -> bool {
    matches!(
        ch,
        ' ' | '\t' | '\r' | '\n' | '\u{000b}' | '\u{000c}' | '\u{00a0}' | '\u{feff}'
    )
}

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    byte_offset: usize,
    /// Whether the previous significant token could end a value; decides if
    /// `-` starts a negative literal or is the binary minus.
    after_value: bool,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            byte_offset: 0,
            after_value: false,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.source.get(self.pos + 2).copied()
    }

    fn peek3(&self) -> Option<char> {
        self.source.get(self.pos + 3).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        self.byte_offset += ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    fn span_from(&self, so: usize, sl: usize, sc: usize) -> Span {
        Span::new(so, self.byte_offset, sl, sc)
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let Some(ch) = self.current() else { break };
            let (so, sl, sc) = (self.byte_offset, self.line, self.col);
            let kind = self.next_kind(ch)?;
            self.after_value = matches!(
                kind,
                TokenKind::Number(_)
                    | TokenKind::Measure(..)
                    | TokenKind::Str(_)
                    | TokenKind::Ident(_)
                    | TokenKind::DollarKeyword(_)
                    | TokenKind::DollarIdent(_)
                    | TokenKind::EntityRef(_)
                    | TokenKind::True
                    | TokenKind::False
                    | TokenKind::Null
                    | TokenKind::RParen
                    | TokenKind::RBracket
                    | TokenKind::RBrace
            );
            tokens.push(Token::new(kind, self.span_from(so, sl, sc)));
        }
        tokens.push(Token::new(
            TokenKind::Eof,
            Span::new(self.byte_offset, self.byte_offset, self.line, self.col),
        ));
        Ok(tokens)
    }

    /// Skip whitespace and comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.current() {
                Some(ch) if is_tt_whitespace(ch) => {
                    self.advance();
                }
                Some('/') if self.peek() == Some('/') => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.peek() == Some('*') => {
                    self.advance();
                    self.advance();
                    while let Some(c) = self.current() {
                        if c == '*' && self.peek() == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn next_kind(&mut self, ch: char) -> Result<TokenKind, LexError> {
        match ch {
            '"' | '\'' => self.read_string(ch),
            '0'..='9' => self.read_number(false),
            '.' if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) => {
                self.read_number(false)
            }
            '-' if !self.after_value
                && self
                    .peek()
                    .map(|c| c.is_ascii_digit() || c == '.')
                    .unwrap_or(false) =>
            {
                self.advance();
                self.read_number(true)
            }
            '$' => self.read_dollar(),
            '@' => self.read_class_ref(),
            '^' if self.peek() == Some('^') => self.read_entity_ref(),
            '~' => self.read_tilde(),
            c if is_ident_start(c) => self.read_ident(),
            _ => self.read_punct(ch),
        }
    }

    fn read_ident(&mut self) -> Result<TokenKind, LexError> {
        let (sl, sc) = (self.line, self.col);
        let mut name = String::new();
        while let Some(c) = self.current() {
            if is_ident_continue(c) {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        // `ident~` is a single fuzzy-matching operator token.
        if self.current() == Some('~') && self.peek() != Some('=') {
            self.advance();
            return Ok(TokenKind::TildeOp(name, TildeSide::After));
        }
        if let Some(kind) = HARD_KEYWORDS.get(name.as_str()) {
            return Ok(kind.clone());
        }
        if FORBIDDEN_KEYWORDS.contains(name.as_str()) {
            return Err(LexError::ForbiddenKeyword { keyword: name, line: sl, col: sc });
        }
        Ok(TokenKind::Ident(name))
    }

    fn read_tilde(&mut self) -> Result<TokenKind, LexError> {
        self.advance(); // ~
        match self.current() {
            Some('=') => {
                self.advance();
                Ok(TokenKind::TildeEq)
            }
            Some(c) if is_ident_start(c) => {
                let mut name = String::new();
                while let Some(c) = self.current() {
                    if is_ident_continue(c) {
                        name.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Ok(TokenKind::TildeOp(name, TildeSide::Before))
            }
            _ => Ok(TokenKind::Tilde),
        }
    }

    fn read_dollar(&mut self) -> Result<TokenKind, LexError> {
        self.advance(); // $
        if self.current() == Some('?') {
            self.advance();
            return Ok(TokenKind::DollarKeyword("?".into()));
        }
        let mut name = String::new();
        while let Some(c) = self.current() {
            if is_ident_continue(c) {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if DOLLAR_KEYWORDS.contains(name.as_str()) {
            Ok(TokenKind::DollarKeyword(name))
        } else {
            Ok(TokenKind::DollarIdent(name))
        }
    }

    fn read_qualified_name(&mut self) -> String {
        let mut name = String::new();
        while let Some(c) = self.current() {
            if is_ident_continue(c) {
                name.push(c);
                self.advance();
            } else if c == '.'
                && self.peek().map(is_ident_start).unwrap_or(false)
                && !name.is_empty()
            {
                name.push('.');
                self.advance();
            } else {
                break;
            }
        }
        name
    }

    fn read_class_ref(&mut self) -> Result<TokenKind, LexError> {
        self.advance(); // @
        if !self.current().map(is_ident_start).unwrap_or(false) {
            return Ok(TokenKind::Unknown('@'));
        }
        Ok(TokenKind::ClassRef(self.read_qualified_name()))
    }

    fn read_entity_ref(&mut self) -> Result<TokenKind, LexError> {
        let (sl, sc) = (self.line, self.col);
        self.advance(); // ^
        self.advance(); // ^
        if !self.current().map(is_ident_start).unwrap_or(false) {
            return Err(LexError::InvalidEntityReference { line: sl, col: sc });
        }
        let mut name = self.read_qualified_name();
        if self.current() != Some(':') || !self.peek().map(is_ident_start).unwrap_or(false) {
            return Err(LexError::InvalidEntityReference { line: sl, col: sc });
        }
        name.push(':');
        self.advance(); // :
        while let Some(c) = self.current() {
            if is_ident_continue(c) {
                name.push(c);
                self.advance();
            } else {
                break;
            }
        }
        Ok(TokenKind::EntityRef(name))
    }

    fn read_number(&mut self, negative: bool) -> Result<TokenKind, LexError> {
        let (sl, sc) = (self.line, self.col);
        // Radix literals
        if self.current() == Some('0') {
            let radix = match self.peek() {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.advance();
                self.advance();
                let mut digits = String::new();
                while let Some(c) = self.current() {
                    if c.is_digit(radix) {
                        digits.push(c);
                        self.advance();
                    } else {
                        break;
                    }
                }
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|_| LexError::InvalidNumber { line: sl, col: sc })?;
                let value = value as f64;
                return Ok(TokenKind::Number(if negative { -value } else { value }));
            }
        }
        let mut text = String::new();
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if self.current() == Some('.')
            && self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false)
        {
            text.push('.');
            self.advance();
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        if matches!(self.current(), Some('e') | Some('E'))
            && (self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false)
                || (matches!(self.peek(), Some('+') | Some('-'))
                    && self.peek2().map(|c| c.is_ascii_digit()).unwrap_or(false)))
        {
            text.push('e');
            self.advance();
            if matches!(self.current(), Some('+') | Some('-')) {
                text.push(self.current().expect("sign"));
                self.advance();
            }
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let value: f64 =
            text.parse().map_err(|_| LexError::InvalidNumber { line: sl, col: sc })?;
        let value = if negative { -value } else { value };
        // A numeric literal immediately followed by an identifier is a
        // measure; the unit may shadow a hard keyword (`5in`).
        if self.current().map(is_ident_start).unwrap_or(false) {
            let mut unit = String::new();
            while let Some(c) = self.current() {
                if is_ident_continue(c) {
                    unit.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            return Ok(TokenKind::Measure(value, unit));
        }
        Ok(TokenKind::Number(value))
    }

    fn read_string(&mut self, quote: char) -> Result<TokenKind, LexError> {
        let (sl, sc) = (self.line, self.col);
        self.advance(); // opening quote
        let mut buf = String::new();
        loop {
            match self.current() {
                None => {
                    return Err(LexError::UnterminatedString { line: self.line, col: self.col })
                }
                Some('\n') => {
                    // Report at the line terminator, not at end of input.
                    return Err(LexError::UnterminatedString { line: self.line, col: self.col });
                }
                Some(c) if c == quote => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    self.read_escape(&mut buf, sl, sc)?;
                }
                Some(c) => {
                    buf.push(c);
                    self.advance();
                }
            }
        }
        Ok(TokenKind::Str(buf))
    }

    fn read_escape(&mut self, buf: &mut String, sl: usize, sc: usize) -> Result<(), LexError> {
        let Some(c) = self.current() else {
            return Err(LexError::UnterminatedString { line: self.line, col: self.col });
        };
        match c {
            'n' => buf.push('\n'),
            't' => buf.push('\t'),
            'b' => buf.push('\u{0008}'),
            'f' => buf.push('\u{000c}'),
            'r' => buf.push('\r'),
            'v' => buf.push('\u{000b}'),
            '0' => buf.push('\0'),
            'x' => {
                self.advance();
                let mut hex = String::new();
                for _ in 0..2 {
                    match self.current() {
                        Some(c) if c.is_ascii_hexdigit() => {
                            hex.push(c);
                            self.advance();
                        }
                        _ => return Err(LexError::InvalidEscape { line: sl, col: sc }),
                    }
                }
                let byte = u8::from_str_radix(&hex, 16)
                    .map_err(|_| LexError::InvalidEscape { line: sl, col: sc })?;
                buf.push(byte as char);
                return Ok(());
            }
            'u' => {
                self.advance();
                if self.current() == Some('{') {
                    self.advance();
                    let mut hex = String::new();
                    while let Some(c) = self.current() {
                        if c == '}' {
                            break;
                        }
                        hex.push(c);
                        self.advance();
                    }
                    if self.current() != Some('}') {
                        return Err(LexError::InvalidEscape { line: sl, col: sc });
                    }
                    self.advance();
                    let ch = u32::from_str_radix(&hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or(LexError::InvalidEscape { line: sl, col: sc })?;
                    buf.push(ch);
                } else {
                    let mut hex = String::new();
                    for _ in 0..4 {
                        match self.current() {
                            Some(c) if c.is_ascii_hexdigit() => {
                                hex.push(c);
                                self.advance();
                            }
                            _ => return Err(LexError::InvalidEscape { line: sl, col: sc }),
                        }
                    }
                    let ch = u32::from_str_radix(&hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or(LexError::InvalidEscape { line: sl, col: sc })?;
                    buf.push(ch);
                }
                return Ok(());
            }
            other => buf.push(other),
        }
        self.advance();
        Ok(())
    }

    fn read_punct(&mut self, ch: char) -> Result<TokenKind, LexError> {
        // Greedy longest match over the operator set.
        let kind = match ch {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '?' => TokenKind::Question,
            ':' => match self.peek() {
                Some(':') => self.two(TokenKind::ColonColon),
                Some('=') => self.two(TokenKind::ColonEq),
                _ => TokenKind::Colon,
            },
            '.' => {
                if self.peek() == Some('.') && self.peek2() == Some('.') {
                    self.advance();
                    self.advance();
                    TokenKind::DotDotDot
                } else {
                    TokenKind::Dot
                }
            }
            '=' => match (self.peek(), self.peek2()) {
                (Some('='), Some('=')) => self.three(TokenKind::EqEqEq),
                (Some('='), _) => self.two(TokenKind::Eq),
                (Some('>'), _) => self.two(TokenKind::Arrow),
                (Some('~'), _) => self.two(TokenKind::EqTilde),
                _ => TokenKind::Assign,
            },
            '!' => match (self.peek(), self.peek2()) {
                (Some('='), Some('=')) => self.three(TokenKind::NotEqEq),
                (Some('='), _) => self.two(TokenKind::NotEq),
                _ => TokenKind::Bang,
            },
            '>' => match (self.peek(), self.peek2(), self.peek3()) {
                (Some('>'), Some('>'), Some('=')) => self.four(TokenKind::UShrAssign),
                (Some('>'), Some('>'), _) => self.three(TokenKind::UShr),
                (Some('>'), Some('='), _) => self.three(TokenKind::ShrAssign),
                (Some('>'), _, _) => self.two(TokenKind::Shr),
                (Some('='), _, _) => self.two(TokenKind::Ge),
                _ => TokenKind::Gt,
            },
            '<' => match (self.peek(), self.peek2()) {
                (Some('<'), Some('=')) => self.three(TokenKind::ShlAssign),
                (Some('<'), _) => self.two(TokenKind::Shl),
                (Some('='), _) => self.two(TokenKind::Le),
                _ => TokenKind::Lt,
            },
            '+' => match self.peek() {
                Some('+') => self.two(TokenKind::PlusPlus),
                Some('=') => self.two(TokenKind::PlusAssign),
                _ => TokenKind::Plus,
            },
            '-' => match self.peek() {
                Some('-') => self.two(TokenKind::MinusMinus),
                Some('=') => self.two(TokenKind::MinusAssign),
                _ => TokenKind::Minus,
            },
            '*' => match (self.peek(), self.peek2()) {
                (Some('*'), Some('=')) => self.three(TokenKind::StarStarAssign),
                (Some('*'), _) => self.two(TokenKind::StarStar),
                (Some('='), _) => self.two(TokenKind::StarAssign),
                _ => TokenKind::Star,
            },
            '/' => match self.peek() {
                Some('=') => self.two(TokenKind::SlashAssign),
                _ => TokenKind::Slash,
            },
            '%' => match self.peek() {
                Some('=') => self.two(TokenKind::PercentAssign),
                _ => TokenKind::Percent,
            },
            '&' => match self.peek() {
                Some('&') => self.two(TokenKind::AmpAmp),
                Some('=') => self.two(TokenKind::AmpAssign),
                _ => TokenKind::Amp,
            },
            '|' => match self.peek() {
                Some('|') => self.two(TokenKind::PipePipe),
                Some('=') => self.two(TokenKind::PipeAssign),
                _ => TokenKind::Pipe,
            },
            '^' => match self.peek() {
                Some('=') => self.two(TokenKind::CaretAssign),
                _ => TokenKind::Caret,
            },
            '#' => match (self.peek(), self.peek2()) {
                (Some('_'), Some('[')) => self.three(TokenKind::HashUnderBracket),
                (Some('['), _) => self.two(TokenKind::HashBracket),
                _ => TokenKind::Unknown('#'),
            },
            other => TokenKind::Unknown(other),
        };
        self.advance();
        Ok(kind)
    }

    fn two(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn three(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        self.advance();
        kind
    }

    fn four(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        self.advance();
        self.advance();
        kind
    }
}

/// Tokenize a complete source text.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_lex_simple_rule() {
        let toks = kinds("monitor @com.weather.current() => notify;");
        assert_eq!(
            toks,
            vec![
                TokenKind::Monitor,
                TokenKind::ClassRef("com.weather.current".into()),
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::Arrow,
                TokenKind::Ident("notify".into()),
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_lex_measure_immediate() {
        let toks = kinds("20C");
        assert_eq!(toks[0], TokenKind::Measure(20.0, "C".into()));
    }

    #[test]
    fn test_lex_measure_hard_keyword_unit() {
        // `in` is a hard keyword, but as a unit it belongs to the measure.
        let toks = kinds("5in");
        assert_eq!(toks[0], TokenKind::Measure(5.0, "in".into()));
    }

    #[test]
    fn test_lex_numbers() {
        assert_eq!(kinds("0")[0], TokenKind::Number(0.0));
        assert_eq!(kinds("1.5")[0], TokenKind::Number(1.5));
        assert_eq!(kinds(".25")[0], TokenKind::Number(0.25));
        assert_eq!(kinds("1e10")[0], TokenKind::Number(1e10));
        assert_eq!(kinds("0xFF")[0], TokenKind::Number(255.0));
        assert_eq!(kinds("0o777")[0], TokenKind::Number(511.0));
        assert_eq!(kinds("0b1010")[0], TokenKind::Number(10.0));
    }

    #[test]
    fn test_lex_negative_number_after_operator() {
        let toks = kinds("p=-5");
        assert_eq!(toks[2], TokenKind::Number(-5.0));
        // After a value, `-` is binary minus.
        let toks = kinds("a - 5");
        assert_eq!(toks[1], TokenKind::Minus);
        assert_eq!(toks[2], TokenKind::Number(5.0));
    }

    #[test]
    fn test_lex_string_escapes() {
        let toks = kinds(r#""a\nb\tcA\u{1F600}\q""#);
        assert_eq!(toks[0], TokenKind::Str("a\nb\tcA\u{1F600}q".into()));
        let toks = kinds(r#"'single'"#);
        assert_eq!(toks[0], TokenKind::Str("single".into()));
    }

    #[test]
    fn test_unterminated_string_errors_at_line_break() {
        let err = tokenize("\"abc\ndef\"").unwrap_err();
        match err {
            LexError::UnterminatedString { line, .. } => assert_eq!(line, 1),
            other => panic!("expected unterminated string, got {:?}", other),
        }
    }

    #[test]
    fn test_forbidden_keyword_is_error() {
        assert!(matches!(
            tokenize("var x").unwrap_err(),
            LexError::ForbiddenKeyword { .. }
        ));
    }

    #[test]
    fn test_lex_entity_ref() {
        let toks = kinds("^^com.foo:bar");
        assert_eq!(toks[0], TokenKind::EntityRef("com.foo:bar".into()));
        assert!(tokenize("^^com.foo").is_err());
    }

    #[test]
    fn test_lex_dollar_forms() {
        assert_eq!(kinds("$now")[0], TokenKind::DollarKeyword("now".into()));
        assert_eq!(kinds("$?")[0], TokenKind::DollarKeyword("?".into()));
        assert_eq!(kinds("$custom")[0], TokenKind::DollarIdent("custom".into()));
    }

    #[test]
    fn test_lex_tilde_operators() {
        assert_eq!(
            kinds("~contains")[0],
            TokenKind::TildeOp("contains".into(), TildeSide::Before)
        );
        assert_eq!(
            kinds("contains~")[0],
            TokenKind::TildeOp("contains".into(), TildeSide::After)
        );
        assert_eq!(kinds("~=")[0], TokenKind::TildeEq);
        assert_eq!(kinds("=~")[0], TokenKind::EqTilde);
    }

    #[test]
    fn test_lex_greedy_operators() {
        let toks = kinds(">>>= **= ... #_[ #[ === !== :: => ** ++ -- >> <<");
        assert_eq!(
            toks[..14],
            [
                TokenKind::UShrAssign,
                TokenKind::StarStarAssign,
                TokenKind::DotDotDot,
                TokenKind::HashUnderBracket,
                TokenKind::HashBracket,
                TokenKind::EqEqEq,
                TokenKind::NotEqEq,
                TokenKind::ColonColon,
                TokenKind::Arrow,
                TokenKind::StarStar,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::Shr,
                TokenKind::Shl,
            ]
        );
    }

    #[test]
    fn test_lex_comments_and_whitespace() {
        let toks = kinds("a // comment\n/* multi\nline */ b\u{00a0}c");
        assert_eq!(
            toks[..3],
            [
                TokenKind::Ident("a".into()),
                TokenKind::Ident("b".into()),
                TokenKind::Ident("c".into()),
            ]
        );
    }

    #[test]
    fn test_unknown_character_passes_through() {
        let toks = kinds("a ` b");
        assert_eq!(toks[1], TokenKind::Unknown('`'));
    }

    #[test]
    fn test_spans_track_lines() {
        let tokens = tokenize("a\nbb").unwrap();
        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[1].span.line, 2);
        assert_eq!(tokens[1].span.col, 1);
        assert_eq!(tokens[1].span.start, 2);
        assert_eq!(tokens[1].span.end, 4);
    }
}
