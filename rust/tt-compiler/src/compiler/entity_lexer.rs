//! Lexer for pre-tokenized TT produced by natural-language front-ends.
//!
//! The input is a sequence of words where constants have been replaced by
//! entity placeholders (`QUOTED_STRING_0`, `NUMBER_3`,
//! `GENERIC_ENTITY_com.foo:bar_1`, ...). A caller-supplied resolver maps
//! each placeholder back to a concrete value.

use crate::compiler::lexer::{LexError, Lexer};
use crate::compiler::tokens::{Span, Token, TokenKind};
use crate::compiler::values::Value;

/// Maps an entity placeholder to its value. `last_param` and
/// `last_function` describe the syntactic context to the resolver; `unit`
/// is set for measure placeholders.
pub trait EntityResolver {
    fn resolve(
        &self,
        name: &str,
        last_param: Option<&str>,
        last_function: Option<&str>,
        unit: Option<&str>,
    ) -> Option<Value>;
}

const ENTITY_PREFIXES: &[&str] = &[
    "QUOTED_STRING",
    "NUMBER",
    "CURRENCY",
    "DURATION",
    "DATE",
    "TIME",
    "LOCATION",
    "USERNAME",
    "HASHTAG",
    "URL",
    "EMAIL_ADDRESS",
    "PHONE_NUMBER",
    "PATH_NAME",
];

/// Split `QUOTED_STRING_0` into (`QUOTED_STRING`, 0), if the word has the
/// placeholder shape.
fn parse_entity_word(word: &str) -> Option<(&str, usize)> {
    let idx = word.rfind('_')?;
    let number = word[idx + 1..].parse::<usize>().ok()?;
    let prefix = &word[..idx];
    if ENTITY_PREFIXES.contains(&prefix)
        || prefix.starts_with("GENERIC_ENTITY_")
        || prefix.starts_with("MEASURE_")
    {
        Some((prefix, number))
    } else {
        None
    }
}

pub struct EntityLexer<'a, R: EntityResolver> {
    resolver: &'a R,
}

impl<'a, R: EntityResolver> EntityLexer<'a, R> {
    pub fn new(resolver: &'a R) -> Self {
        Self { resolver }
    }

    /// Tokenize a pre-tokenized word sequence. Placeholder words are asked
    /// of the resolver; everything else goes through the ordinary lexer
    /// classification.
    pub fn tokenize(&self, words: &[String]) -> Result<Vec<Token>, LexError> {
        let mut tokens: Vec<Token> = Vec::new();
        let mut last_param: Option<String> = None;
        let mut last_function: Option<String> = None;
        for (index, word) in words.iter().enumerate() {
            let span = Span::new(index, index + 1, 1, index + 1);
            if let Some((prefix, _)) = parse_entity_word(word) {
                let unit = prefix.strip_prefix("MEASURE_");
                let value = self
                    .resolver
                    .resolve(word, last_param.as_deref(), last_function.as_deref(), unit)
                    .ok_or_else(|| LexError::UnresolvedEntity { name: word.clone() })?;
                tokens.push(Token::new(constant_token(value), span));
                continue;
            }
            let word_tokens = Lexer::new(word).tokenize()?;
            for token in word_tokens {
                if token.kind == TokenKind::Eof {
                    break;
                }
                match &token.kind {
                    TokenKind::Ident(name) => {
                        last_param = Some(name.clone());
                    }
                    TokenKind::ClassRef(name) => {
                        last_function = Some(name.clone());
                    }
                    _ => {}
                }
                tokens.push(Token::new(token.kind, span));
            }
        }
        tokens.push(Token::new(TokenKind::Eof, Span::new(words.len(), words.len(), 1, 1)));
        Ok(tokens)
    }
}

/// Select the token kind for a resolved value. Strings, numbers, and
/// measures reuse the literal kinds; everything else rides in a constant
/// token.
fn constant_token(value: Value) -> TokenKind {
    match value {
        Value::String(s) => TokenKind::Str(s),
        Value::Number(n) => TokenKind::Number(n),
        Value::Measure { value, unit } => TokenKind::Measure(value, unit),
        other => TokenKind::Constant(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedResolver;

    impl EntityResolver for FixedResolver {
        fn resolve(
            &self,
            name: &str,
            last_param: Option<&str>,
            _last_function: Option<&str>,
            unit: Option<&str>,
        ) -> Option<Value> {
            if name.starts_with("QUOTED_STRING") {
                Some(Value::String("hello".into()))
            } else if name.starts_with("NUMBER") {
                Some(Value::Number(42.0))
            } else if name.starts_with("MEASURE_") {
                Some(Value::Measure { value: 20.0, unit: unit.expect("unit").into() })
            } else if name.starts_with("GENERIC_ENTITY_") {
                // The resolver may consult the parameter it fills.
                assert_eq!(last_param, Some("p"));
                Some(Value::Entity {
                    value: Some("x".into()),
                    ty: "com.foo:bar".into(),
                    display: None,
                })
            } else {
                None
            }
        }
    }

    fn words(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_entity_tokens_resolved() {
        let lexer = EntityLexer::new(&FixedResolver);
        let tokens = lexer
            .tokenize(&words("@com.foo.bar ( p = GENERIC_ENTITY_com.foo:bar_0 ) ;"))
            .unwrap();
        let kinds: Vec<_> = tokens.into_iter().map(|t| t.kind).collect();
        assert_eq!(kinds[0], TokenKind::ClassRef("com.foo.bar".into()));
        assert!(matches!(&kinds[4], TokenKind::Constant(Value::Entity { .. })));
    }

    #[test]
    fn test_literal_kinds_for_scalars() {
        let lexer = EntityLexer::new(&FixedResolver);
        let tokens = lexer.tokenize(&words("QUOTED_STRING_0 NUMBER_3 MEASURE_C_1")).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Str("hello".into()));
        assert_eq!(tokens[1].kind, TokenKind::Number(42.0));
        assert_eq!(tokens[2].kind, TokenKind::Measure(20.0, "C".into()));
    }

    #[test]
    fn test_unresolved_entity_is_error() {
        let lexer = EntityLexer::new(&FixedResolver);
        let err = lexer.tokenize(&words("DATE_0")).unwrap_err();
        assert!(matches!(err, LexError::UnresolvedEntity { .. }));
    }

    #[test]
    fn test_plain_words_classified_normally() {
        let lexer = EntityLexer::new(&FixedResolver);
        let tokens = lexer.tokenize(&words("monitor => notify")).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Monitor);
        assert_eq!(tokens[1].kind, TokenKind::Arrow);
        assert_eq!(tokens[2].kind, TokenKind::Ident("notify".into()));
    }
}
