//! TT Compiler
//!
//! Front-end and middle-end for the TT automation language: lexing,
//! parsing, type checking against a pluggable schema retriever, filter
//! and program canonicalization, and lowering to a register IR with
//! explicit suspension points.

pub mod compiler;
pub mod diagnostics;

use compiler::ast::{Input, UnserializableError};
use compiler::retriever::SchemaRetriever;
use thiserror::Error;
use tt_core::ir::IrModule;

pub use compiler::optimize::{optimize_filter, optimize_input};
pub use compiler::parser::parse;
pub use compiler::prettyprint::{prettyprint, ToSource};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("syntax error: {0}")]
    Lex(#[from] compiler::lexer::LexError),
    #[error("syntax error: {0}")]
    Parse(#[from] compiler::parser::ParseError),
    #[error("type error: {0}")]
    Type(#[from] compiler::typecheck::TypeError),
    #[error("lowering error: {0}")]
    Ir(#[from] compiler::lower::IrError),
    #[error("{0}")]
    Unserializable(#[from] UnserializableError),
    #[error("{construct} is not implemented")]
    NotImplemented { construct: String },
}

/// Parse and type-check a source text. The retriever is awaited once per
/// unresolved schema, in document order.
pub async fn typecheck_source<R: SchemaRetriever>(
    source: &str,
    retriever: &R,
) -> Result<Input, CompileError> {
    let input = parse(source)?;
    let typed = compiler::typecheck::typecheck(&input, retriever).await?;
    Ok(typed)
}

/// Run the whole pipeline: lex, parse, type-check, optimize, and lower to
/// an IR module. No partial state survives an error.
pub async fn compile<R: SchemaRetriever>(
    source: &str,
    retriever: &R,
) -> Result<IrModule, CompileError> {
    let typed = typecheck_source(source, retriever).await?;
    let optimized = compiler::optimize::optimize_input(&typed);
    let module = compiler::lower::compile_ir(&optimized, source)?;
    Ok(module)
}

/// Re-emit the surface syntax of an input.
pub fn pretty(input: &Input) -> String {
    prettyprint(&input.to_source())
}

/// Format a compile error with source snippets for terminal display.
pub fn format_error(error: &CompileError, source: &str, filename: &str) -> String {
    diagnostics::format_compile_error(error, source, filename)
        .iter()
        .map(|d| d.render_ansi())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use compiler::retriever::StaticSchemaRetriever;
    use compiler::schema::{ArgumentDef, ClassDef, Direction, FunctionDef, FunctionKind};
    use compiler::types::Type;
    use futures::executor::block_on;

    fn retriever() -> StaticSchemaRetriever {
        let mut class = ClassDef::new("com.weather");
        let mut current = FunctionDef::new(
            FunctionKind::Query,
            "current",
            vec![
                ArgumentDef::new("city", Direction::InOpt, Type::String),
                ArgumentDef::new("temperature", Direction::Out, Type::Measure("C".into())),
            ],
        );
        current.is_monitorable = true;
        class.queries.insert("current".into(), current);
        StaticSchemaRetriever::with_classes([class])
    }

    #[test]
    fn test_compile_simple_rule() {
        let source = "monitor @com.weather.current() => notify;";
        let module = block_on(compile(source, &retriever())).unwrap();
        assert!(module.source_hash.starts_with("sha256:"));
        assert!(module.registers > 0);
    }

    #[test]
    fn test_compile_propagates_type_errors() {
        let source = "@com.weather.nope() => notify;";
        let err = block_on(compile(source, &retriever())).unwrap_err();
        assert!(matches!(err, CompileError::Type(_)), "got {:?}", err);
    }

    #[test]
    fn test_compile_propagates_syntax_errors() {
        let err = block_on(compile("monitor ;", &retriever())).unwrap_err();
        assert!(matches!(err, CompileError::Parse(_)));
        let err = block_on(compile("var x;", &retriever())).unwrap_err();
        assert!(matches!(err, CompileError::Lex(_)));
    }

    #[test]
    fn test_format_error_mentions_filename() {
        let source = "monitor ;";
        let err = block_on(compile(source, &retriever())).unwrap_err();
        let rendered = format_error(&err, source, "rule.tt");
        assert!(rendered.contains("rule.tt"), "{}", rendered);
    }
}
