//! Function and class schema definitions resolved against the catalogue.

use crate::compiler::tokens::SrcRange;
use crate::compiler::types::Type;
use crate::compiler::values::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumIter, EnumString};

/// Annotation maps are ordered so that emission is deterministic.
pub type AnnotationMap = BTreeMap<String, Value>;

/// The three function kinds of the TT catalogue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum FunctionKind {
    Stream,
    Query,
    Action,
}

/// Direction of a function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum Direction {
    #[strum(serialize = "in req")]
    InReq,
    #[strum(serialize = "in opt")]
    InOpt,
    #[strum(serialize = "out")]
    Out,
}

/// One argument of a catalogued function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDef {
    pub name: String,
    pub direction: Direction,
    pub ty: Type,
    pub nl_annotations: AnnotationMap,
    pub impl_annotations: AnnotationMap,
}

impl ArgumentDef {
    pub fn new(name: impl Into<String>, direction: Direction, ty: Type) -> Self {
        Self {
            name: name.into(),
            direction,
            ty,
            nl_annotations: AnnotationMap::new(),
            impl_annotations: AnnotationMap::new(),
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self.direction, Direction::InReq | Direction::InOpt)
    }

    pub fn is_required(&self) -> bool {
        self.direction == Direction::InReq
    }

    /// The canonical natural-language form, falling back to the name.
    pub fn canonical(&self) -> &str {
        match self.nl_annotations.get("canonical") {
            Some(Value::String(s)) => s,
            _ => &self.name,
        }
    }
}

/// A catalogued function signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub kind: FunctionKind,
    pub name: String,
    /// Declaration order is significant for emission and tuple layout.
    pub args: Vec<ArgumentDef>,
    /// Names of sibling functions whose arguments this one inherits.
    pub extends: Vec<String>,
    pub is_list: bool,
    pub is_monitorable: bool,
    pub require_filter: bool,
    pub default_projection: Vec<String>,
    pub nl_annotations: AnnotationMap,
    pub impl_annotations: AnnotationMap,
}

impl FunctionDef {
    pub fn new(kind: FunctionKind, name: impl Into<String>, args: Vec<ArgumentDef>) -> Self {
        Self {
            kind,
            name: name.into(),
            args,
            extends: Vec::new(),
            is_list: false,
            is_monitorable: false,
            require_filter: false,
            default_projection: Vec::new(),
            nl_annotations: AnnotationMap::new(),
            impl_annotations: AnnotationMap::new(),
        }
    }

    pub fn get_arg(&self, name: &str) -> Option<&ArgumentDef> {
        self.args.iter().find(|a| a.name == name)
    }

    pub fn get_arg_type(&self, name: &str) -> Option<&Type> {
        self.get_arg(name).map(|a| &a.ty)
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.get_arg(name).is_some()
    }

    pub fn in_params(&self) -> impl Iterator<Item = &ArgumentDef> {
        self.args.iter().filter(|a| a.is_input())
    }

    pub fn out_params(&self) -> impl Iterator<Item = &ArgumentDef> {
        self.args.iter().filter(|a| !a.is_input())
    }

    /// The canonical natural-language form, falling back to the name.
    pub fn canonical(&self) -> &str {
        match self.nl_annotations.get("canonical") {
            Some(Value::String(s)) => s,
            _ => &self.name,
        }
    }

    pub fn confirmation(&self) -> Option<&str> {
        match self.nl_annotations.get("confirmation") {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// An entity type declared by a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub nl_annotations: AnnotationMap,
}

/// A mixin import inside a class body: `import loader from @org.module();`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixinImport {
    pub facets: Vec<String>,
    pub module: String,
}

/// A class of catalogued functions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub extends: Vec<String>,
    pub queries: BTreeMap<String, FunctionDef>,
    pub actions: BTreeMap<String, FunctionDef>,
    pub entities: Vec<EntityDef>,
    pub imports: Vec<MixinImport>,
    pub nl_annotations: AnnotationMap,
    pub impl_annotations: AnnotationMap,
    pub range: SrcRange,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: Vec::new(),
            queries: BTreeMap::new(),
            actions: BTreeMap::new(),
            entities: Vec::new(),
            imports: Vec::new(),
            nl_annotations: AnnotationMap::new(),
            impl_annotations: AnnotationMap::new(),
            range: SrcRange::default(),
        }
    }

    /// Look up a member function. Streams are monitorable queries.
    pub fn get_function(&self, kind: FunctionKind, name: &str) -> Option<&FunctionDef> {
        match kind {
            FunctionKind::Query => self.queries.get(name),
            FunctionKind::Action => self.actions.get(name),
            FunctionKind::Stream => self.queries.get(name).filter(|f| f.is_monitorable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_query() -> FunctionDef {
        let mut def = FunctionDef::new(
            FunctionKind::Query,
            "current",
            vec![
                ArgumentDef::new("city", Direction::InReq, Type::String),
                ArgumentDef::new("temperature", Direction::Out, Type::Measure("C".into())),
            ],
        );
        def.is_monitorable = true;
        def
    }

    #[test]
    fn test_argument_direction() {
        let def = weather_query();
        assert!(def.get_arg("city").unwrap().is_required());
        assert!(!def.get_arg("temperature").unwrap().is_input());
        assert_eq!(def.in_params().count(), 1);
        assert_eq!(def.out_params().count(), 1);
    }

    #[test]
    fn test_canonical_falls_back_to_name() {
        let mut def = weather_query();
        assert_eq!(def.canonical(), "current");
        def.nl_annotations
            .insert("canonical".into(), Value::String("current weather".into()));
        assert_eq!(def.canonical(), "current weather");
    }

    #[test]
    fn test_class_stream_lookup_requires_monitorable() {
        let mut class = ClassDef::new("com.weather");
        class.queries.insert("current".into(), weather_query());
        assert!(class.get_function(FunctionKind::Stream, "current").is_some());
        class.queries.get_mut("current").unwrap().is_monitorable = false;
        assert!(class.get_function(FunctionKind::Stream, "current").is_none());
        assert!(class.get_function(FunctionKind::Query, "current").is_some());
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::InReq.to_string(), "in req");
        assert_eq!(Direction::Out.to_string(), "out");
        assert_eq!(FunctionKind::Query.to_string(), "query");
    }
}
