//! Builtin operator tables and builtin function schemas.
//!
//! The tables are process-wide, initialized once, and read-only
//! thereafter. The type checker selects the first overload whose operand
//! types unify with the atom's.

use crate::compiler::schema::{ArgumentDef, Direction, FunctionDef, FunctionKind};
use crate::compiler::types::Type;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// One overload of a comparison operator: `(lhs, rhs) -> ret`. Type
/// variables are shared between the operand types, so `t == t` forces both
/// sides to the same type.
#[derive(Debug, Clone)]
pub struct OpOverload {
    pub lhs: Type,
    pub rhs: Type,
    pub ret: Type,
}

impl OpOverload {
    fn new(lhs: Type, rhs: Type, ret: Type) -> Self {
        Self { lhs, rhs, ret }
    }
}

/// Extra requirement applied to the resolved left operand when an overload
/// with type variables matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadGuard {
    None,
    Comparable,
    Numeric,
}

#[derive(Debug, Clone)]
pub struct BinaryOpDef {
    pub overloads: Vec<OpOverload>,
    pub guard: OverloadGuard,
}

fn tvar(name: &str) -> Type {
    Type::TypeVar(name.into())
}

fn array(elem: Type) -> Type {
    Type::Array(Box::new(elem))
}

/// Comparison operators usable in filter atoms.
pub static BINARY_OPS: Lazy<HashMap<&'static str, BinaryOpDef>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "==",
        BinaryOpDef {
            overloads: vec![OpOverload::new(tvar("t"), tvar("t"), Type::Boolean)],
            guard: OverloadGuard::None,
        },
    );
    for op in [">=", "<=", ">", "<"] {
        m.insert(
            op,
            BinaryOpDef {
                overloads: vec![OpOverload::new(tvar("t"), tvar("t"), Type::Boolean)],
                guard: OverloadGuard::Comparable,
            },
        );
    }
    for op in ["=~", "~="] {
        m.insert(
            op,
            BinaryOpDef {
                overloads: vec![OpOverload::new(Type::String, Type::String, Type::Boolean)],
                guard: OverloadGuard::None,
            },
        );
    }
    for op in ["starts_with", "ends_with", "~contains"] {
        m.insert(
            op,
            BinaryOpDef {
                overloads: vec![OpOverload::new(Type::String, Type::String, Type::Boolean)],
                guard: OverloadGuard::None,
            },
        );
    }
    m.insert(
        "contains",
        BinaryOpDef {
            overloads: vec![
                OpOverload::new(array(tvar("t")), tvar("t"), Type::Boolean),
                OpOverload::new(Type::String, Type::String, Type::Boolean),
                OpOverload::new(Type::RecurrentTimeSpecification, Type::Date, Type::Boolean),
            ],
            guard: OverloadGuard::None,
        },
    );
    m.insert(
        "contains~",
        BinaryOpDef {
            overloads: vec![OpOverload::new(array(Type::String), Type::String, Type::Boolean)],
            guard: OverloadGuard::None,
        },
    );
    m.insert(
        "in_array",
        BinaryOpDef {
            overloads: vec![OpOverload::new(tvar("t"), array(tvar("t")), Type::Boolean)],
            guard: OverloadGuard::None,
        },
    );
    m.insert(
        "in_array~",
        BinaryOpDef {
            overloads: vec![OpOverload::new(Type::String, array(Type::String), Type::Boolean)],
            guard: OverloadGuard::None,
        },
    );
    m.insert(
        "has_member",
        BinaryOpDef {
            overloads: vec![OpOverload::new(Type::Feed, Type::User, Type::Boolean)],
            guard: OverloadGuard::None,
        },
    );
    m.insert(
        "group_member",
        BinaryOpDef {
            overloads: vec![OpOverload::new(
                Type::Entity("tt:contact_group".into()),
                Type::Entity("tt:contact".into()),
                Type::Boolean,
            )],
            guard: OverloadGuard::None,
        },
    );
    m
});

/// One overload of a scalar computation operator.
#[derive(Debug, Clone)]
pub struct ScalarOverload {
    pub operands: Vec<Type>,
    pub ret: Type,
}

#[derive(Debug, Clone)]
pub struct ScalarOpDef {
    pub overloads: Vec<ScalarOverload>,
    pub guard: OverloadGuard,
}

fn scalar(operands: Vec<Type>, ret: Type) -> ScalarOverload {
    ScalarOverload { operands, ret }
}

/// Operators usable in computation values.
pub static SCALAR_OPS: Lazy<HashMap<&'static str, ScalarOpDef>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert(
        "+",
        ScalarOpDef {
            overloads: vec![
                scalar(vec![Type::String, Type::String], Type::String),
                scalar(vec![Type::Date, Type::Measure(String::new())], Type::Date),
                scalar(vec![Type::Time, Type::Measure(String::new())], Type::Time),
                scalar(vec![tvar("t"), tvar("t")], tvar("t")),
            ],
            guard: OverloadGuard::Numeric,
        },
    );
    m.insert(
        "-",
        ScalarOpDef {
            overloads: vec![
                scalar(vec![Type::Date, Type::Measure(String::new())], Type::Date),
                scalar(vec![Type::Time, Type::Measure(String::new())], Type::Time),
                scalar(vec![tvar("t"), tvar("t")], tvar("t")),
            ],
            guard: OverloadGuard::Numeric,
        },
    );
    for op in ["*", "/", "%", "**"] {
        m.insert(
            op,
            ScalarOpDef {
                overloads: vec![scalar(vec![tvar("t"), tvar("t")], tvar("t"))],
                guard: OverloadGuard::Numeric,
            },
        );
    }
    for op in ["max", "min", "sum"] {
        m.insert(
            op,
            ScalarOpDef {
                overloads: vec![
                    scalar(vec![array(Type::Number)], Type::Number),
                    scalar(vec![array(Type::Currency)], Type::Currency),
                ],
                guard: OverloadGuard::None,
            },
        );
    }
    m.insert(
        "avg",
        ScalarOpDef {
            overloads: vec![scalar(vec![array(Type::Number)], Type::Number)],
            guard: OverloadGuard::None,
        },
    );
    m.insert(
        "count",
        ScalarOpDef {
            overloads: vec![scalar(vec![array(tvar("t"))], Type::Number)],
            guard: OverloadGuard::None,
        },
    );
    m.insert(
        "distance",
        ScalarOpDef {
            overloads: vec![scalar(
                vec![Type::Location, Type::Location],
                Type::Measure("m".into()),
            )],
            guard: OverloadGuard::None,
        },
    );
    m
});

/// The builtin `notify` output action at the end of a chain.
pub fn notify_action() -> FunctionDef {
    FunctionDef::new(FunctionKind::Action, "notify", Vec::new())
}

/// The builtin `timer(interval=...)` stream.
pub fn timer_stream() -> FunctionDef {
    let mut def = FunctionDef::new(
        FunctionKind::Stream,
        "timer",
        vec![
            ArgumentDef::new("interval", Direction::InReq, Type::Measure(String::new())),
            ArgumentDef::new("frequency", Direction::InOpt, Type::Number),
            ArgumentDef::new("__timestamp", Direction::Out, Type::Date),
        ],
    );
    def.is_monitorable = false;
    def
}

/// The builtin `attimer(time=[...])` stream.
pub fn attimer_stream() -> FunctionDef {
    FunctionDef::new(
        FunctionKind::Stream,
        "attimer",
        vec![
            ArgumentDef::new("time", Direction::InReq, Type::Array(Box::new(Type::Time))),
            ArgumentDef::new("__timestamp", Direction::Out, Type::Date),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::types::TypeScope;

    #[test]
    fn test_eq_overload_links_operands() {
        let def = &BINARY_OPS["=="];
        let overload = &def.overloads[0];
        let mut scope = TypeScope::new();
        overload.lhs.unify(&Type::Measure("C".into()), &mut scope).unwrap();
        // The right side must now be the same measure.
        assert!(overload.rhs.unify(&Type::Measure("F".into()), &mut scope).is_err());
        let mut scope = TypeScope::new();
        overload.lhs.unify(&Type::Measure("C".into()), &mut scope).unwrap();
        assert!(overload.rhs.unify(&Type::Measure("C".into()), &mut scope).is_ok());
    }

    #[test]
    fn test_contains_overloads() {
        let def = &BINARY_OPS["contains"];
        assert_eq!(def.overloads.len(), 3);
        let mut scope = TypeScope::new();
        let arr = Type::Array(Box::new(Type::String));
        def.overloads[0].lhs.unify(&arr, &mut scope).unwrap();
        assert!(def.overloads[0].rhs.unify(&Type::String, &mut scope).is_ok());
    }

    #[test]
    fn test_distance_returns_meters() {
        let def = &SCALAR_OPS["distance"];
        assert_eq!(def.overloads[0].ret, Type::Measure("m".into()));
    }

    #[test]
    fn test_builtin_schemas() {
        assert_eq!(notify_action().kind, FunctionKind::Action);
        let timer = timer_stream();
        assert_eq!(timer.kind, FunctionKind::Stream);
        assert!(timer.get_arg("interval").unwrap().is_required());
        assert!(!timer.get_arg("__timestamp").unwrap().is_input());
    }
}
