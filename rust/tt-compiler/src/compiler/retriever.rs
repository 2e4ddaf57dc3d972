//! The schema retriever interface consumed by the type checker.
//!
//! Retrieval is inherently I/O: real retrievers query a catalogue service.
//! The compiler only depends on this trait; awaiting happens inside the
//! type checker, one compilation at a time.

use crate::compiler::schema::{ClassDef, FunctionDef, FunctionKind};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetrieverError {
    #[error("unknown class @{0}")]
    UnknownClass(String),
    #[error("class @{class} has no {kind} '{name}'")]
    UnknownFunction { class: String, kind: FunctionKind, name: String },
    #[error("schema retrieval was cancelled")]
    Cancelled,
}

/// Resolves class names to function signatures. Both operations may
/// suspend; the checker serializes its calls so observable error order is
/// deterministic.
pub trait SchemaRetriever {
    /// Look up one function signature.
    async fn get_schema(
        &self,
        class: &str,
        kind: FunctionKind,
        name: &str,
    ) -> Result<FunctionDef, RetrieverError>;

    /// Look up a whole class.
    async fn get_class(&self, class: &str) -> Result<ClassDef, RetrieverError>;
}

/// An in-memory retriever backed by a fixed set of classes. Used by tests
/// and by embedders that load their catalogue up front.
#[derive(Debug, Default)]
pub struct StaticSchemaRetriever {
    classes: HashMap<String, ClassDef>,
}

impl StaticSchemaRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classes(classes: impl IntoIterator<Item = ClassDef>) -> Self {
        let mut retriever = Self::new();
        for class in classes {
            retriever.add_class(class);
        }
        retriever
    }

    pub fn add_class(&mut self, class: ClassDef) {
        self.classes.insert(class.name.clone(), class);
    }
}

impl SchemaRetriever for StaticSchemaRetriever {
    async fn get_schema(
        &self,
        class: &str,
        kind: FunctionKind,
        name: &str,
    ) -> Result<FunctionDef, RetrieverError> {
        let class_def = self
            .classes
            .get(class)
            .ok_or_else(|| RetrieverError::UnknownClass(class.to_string()))?;
        class_def
            .get_function(kind, name)
            .cloned()
            .ok_or_else(|| RetrieverError::UnknownFunction {
                class: class.to_string(),
                kind,
                name: name.to_string(),
            })
    }

    async fn get_class(&self, class: &str) -> Result<ClassDef, RetrieverError> {
        self.classes
            .get(class)
            .cloned()
            .ok_or_else(|| RetrieverError::UnknownClass(class.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::schema::{ArgumentDef, Direction};
    use crate::compiler::types::Type;
    use futures::executor::block_on;

    fn sample_class() -> ClassDef {
        let mut class = ClassDef::new("com.weather");
        let mut current = FunctionDef::new(
            FunctionKind::Query,
            "current",
            vec![ArgumentDef::new("temperature", Direction::Out, Type::Measure("C".into()))],
        );
        current.is_monitorable = true;
        class.queries.insert("current".into(), current);
        class
    }

    #[test]
    fn test_static_retriever_lookup() {
        let retriever = StaticSchemaRetriever::with_classes([sample_class()]);
        let def = block_on(retriever.get_schema("com.weather", FunctionKind::Query, "current"))
            .unwrap();
        assert_eq!(def.name, "current");
        assert!(block_on(retriever.get_class("com.weather")).is_ok());
    }

    #[test]
    fn test_static_retriever_errors() {
        let retriever = StaticSchemaRetriever::with_classes([sample_class()]);
        assert!(matches!(
            block_on(retriever.get_schema("com.nope", FunctionKind::Query, "x")),
            Err(RetrieverError::UnknownClass(_))
        ));
        assert!(matches!(
            block_on(retriever.get_schema("com.weather", FunctionKind::Action, "current")),
            Err(RetrieverError::UnknownFunction { .. })
        ));
    }
}
