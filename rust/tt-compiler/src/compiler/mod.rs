pub mod ast;
pub mod builtins;
pub mod entity_lexer;
pub mod lexer;
pub mod lower;
pub mod optimize;
pub mod parser;
pub mod prettyprint;
pub mod retriever;
pub mod schema;
pub mod tokens;
pub mod typecheck;
pub mod types;
pub mod values;
pub mod visitor;
