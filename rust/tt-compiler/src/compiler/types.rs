//! The TT type system: base types, parametric constructors, and the unifier.

use crate::compiler::schema::ArgumentDef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnifyError {
    #[error("cannot unify {left} with {right}")]
    Mismatch { left: String, right: String },
}

/// A TT type. `Any` unifies with everything; `TypeVar` is bound through a
/// [`TypeScope`] during unification; `Unknown` is the error-recovery type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Type {
    Boolean,
    String,
    Number,
    Currency,
    Date,
    Time,
    Location,
    RecurrentTimeSpecification,
    /// Unit-tagged quantity; units are opaque tags, the empty unit is a
    /// placeholder that unifies with any measure.
    Measure(std::string::String),
    Array(Box<Type>),
    Map(Box<Type>, Box<Type>),
    Tuple(Vec<Type>),
    Entity(std::string::String),
    /// `None` is the open universe (the `*` sentinel): any tag permitted.
    Enum(Option<Vec<std::string::String>>),
    Compound(BTreeMap<std::string::String, ArgumentDef>),
    Object(BTreeMap<std::string::String, Type>),
    ArgMap,
    Any,
    User,
    Feed,
    TypeVar(std::string::String),
    Unknown,
}

/// Variable bindings accumulated during unification.
#[derive(Debug, Clone, Default)]
pub struct TypeScope(HashMap<String, Type>);

impl TypeScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.0.get(name)
    }

    pub fn bind(&mut self, name: &str, ty: Type) {
        self.0.insert(name.to_string(), ty);
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Boolean => write!(f, "Boolean"),
            Type::String => write!(f, "String"),
            Type::Number => write!(f, "Number"),
            Type::Currency => write!(f, "Currency"),
            Type::Date => write!(f, "Date"),
            Type::Time => write!(f, "Time"),
            Type::Location => write!(f, "Location"),
            Type::RecurrentTimeSpecification => write!(f, "RecurrentTimeSpecification"),
            Type::Measure(unit) => write!(f, "Measure({})", unit),
            Type::Array(elem) => write!(f, "Array({})", elem),
            Type::Map(k, v) => write!(f, "Map({}, {})", k, v),
            Type::Tuple(fields) => {
                let parts: Vec<_> = fields.iter().map(|t| t.to_string()).collect();
                write!(f, "Tuple({})", parts.join(", "))
            }
            Type::Entity(name) => write!(f, "Entity({})", name),
            Type::Enum(None) => write!(f, "Enum(*)"),
            Type::Enum(Some(members)) => write!(f, "Enum({})", members.join(", ")),
            Type::Compound(fields) => {
                let parts: Vec<_> = fields
                    .iter()
                    .map(|(name, arg)| format!("{} : {}", name, arg.ty))
                    .collect();
                write!(f, "Compound({})", parts.join(", "))
            }
            Type::Object(fields) => {
                let parts: Vec<_> =
                    fields.iter().map(|(name, ty)| format!("{} : {}", name, ty)).collect();
                write!(f, "Object({})", parts.join(", "))
            }
            Type::ArgMap => write!(f, "ArgMap"),
            Type::Any => write!(f, "Any"),
            Type::User => write!(f, "User"),
            Type::Feed => write!(f, "Feed"),
            Type::TypeVar(name) => write!(f, "{}", name),
            Type::Unknown => write!(f, "Unknown"),
        }
    }
}

impl Type {
    /// Compute the most-general unifier of `self` and `other` under `scope`.
    /// Returns the unified type, binding type variables into `scope` as a
    /// side effect.
    pub fn unify(&self, other: &Type, scope: &mut TypeScope) -> Result<Type, UnifyError> {
        match (self, other) {
            (Type::Any, t) | (t, Type::Any) => Ok(t.clone()),
            (Type::TypeVar(v), t) | (t, Type::TypeVar(v)) => {
                if let Some(bound) = scope.get(v).cloned() {
                    bound.unify(t, scope)
                } else {
                    let resolved = t.resolve_type_scope(scope);
                    scope.bind(v, resolved.clone());
                    Ok(resolved)
                }
            }
            (Type::Measure(u1), Type::Measure(u2)) => {
                if u1 == u2 {
                    Ok(Type::Measure(u1.clone()))
                } else if u1.is_empty() {
                    Ok(Type::Measure(u2.clone()))
                } else if u2.is_empty() {
                    Ok(Type::Measure(u1.clone()))
                } else {
                    Err(self.mismatch(other))
                }
            }
            (Type::Array(a), Type::Array(b)) => Ok(Type::Array(Box::new(a.unify(b, scope)?))),
            (Type::Map(k1, v1), Type::Map(k2, v2)) => Ok(Type::Map(
                Box::new(k1.unify(k2, scope)?),
                Box::new(v1.unify(v2, scope)?),
            )),
            (Type::Tuple(a), Type::Tuple(b)) => {
                if a.len() != b.len() {
                    return Err(self.mismatch(other));
                }
                let fields = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| x.unify(y, scope))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Type::Tuple(fields))
            }
            (Type::Entity(n1), Type::Entity(n2)) if n1 == n2 => Ok(Type::Entity(n1.clone())),
            (Type::Enum(None), Type::Enum(m)) | (Type::Enum(m), Type::Enum(None)) => {
                Ok(Type::Enum(m.clone()))
            }
            (Type::Enum(Some(a)), Type::Enum(Some(b))) if a == b => {
                Ok(Type::Enum(Some(a.clone())))
            }
            (Type::Compound(a), Type::Compound(b)) => {
                if a.len() != b.len() || !a.keys().eq(b.keys()) {
                    return Err(self.mismatch(other));
                }
                let mut fields = BTreeMap::new();
                for (name, arg) in a {
                    let mut merged = arg.clone();
                    merged.ty = arg.ty.unify(&b[name].ty, scope)?;
                    fields.insert(name.clone(), merged);
                }
                Ok(Type::Compound(fields))
            }
            (Type::Object(a), Type::Object(b)) => {
                if a.len() != b.len() || !a.keys().eq(b.keys()) {
                    return Err(self.mismatch(other));
                }
                let mut fields = BTreeMap::new();
                for (name, ty) in a {
                    fields.insert(name.clone(), ty.unify(&b[name], scope)?);
                }
                Ok(Type::Object(fields))
            }
            (a, b) if a == b => Ok(a.clone()),
            _ => Err(self.mismatch(other)),
        }
    }

    fn mismatch(&self, other: &Type) -> UnifyError {
        UnifyError::Mismatch { left: self.to_string(), right: other.to_string() }
    }

    /// Substitute all bound type variables. Unbound variables survive.
    pub fn resolve_type_scope(&self, scope: &TypeScope) -> Type {
        match self {
            Type::TypeVar(v) => match scope.get(v) {
                Some(bound) => bound.resolve_type_scope(scope),
                None => self.clone(),
            },
            Type::Array(elem) => Type::Array(Box::new(elem.resolve_type_scope(scope))),
            Type::Map(k, v) => Type::Map(
                Box::new(k.resolve_type_scope(scope)),
                Box::new(v.resolve_type_scope(scope)),
            ),
            Type::Tuple(fields) => {
                Type::Tuple(fields.iter().map(|t| t.resolve_type_scope(scope)).collect())
            }
            Type::Compound(fields) => Type::Compound(
                fields
                    .iter()
                    .map(|(name, arg)| {
                        let mut resolved = arg.clone();
                        resolved.ty = arg.ty.resolve_type_scope(scope);
                        (name.clone(), resolved)
                    })
                    .collect(),
            ),
            Type::Object(fields) => Type::Object(
                fields
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.resolve_type_scope(scope)))
                    .collect(),
            ),
            _ => self.clone(),
        }
    }

    /// Directional assignability, strictly weaker than unification. Used by
    /// coerced parameter passing: a `source` value may be passed where
    /// `self` is expected.
    pub fn is_assignable(&self, source: &Type) -> bool {
        match (self, source) {
            (Type::Any, _) | (_, Type::Any) => true,
            (Type::TypeVar(_), _) | (_, Type::TypeVar(_)) => true,
            (Type::String, Type::Entity(_)) => true,
            (Type::Currency, Type::Number) => true,
            (Type::Enum(None), Type::Enum(_)) => true,
            (Type::Enum(Some(members)), Type::Enum(Some(others))) => {
                others.iter().all(|m| members.contains(m))
            }
            (Type::Measure(u), Type::Measure(v)) => u == v || u.is_empty() || v.is_empty(),
            (Type::Array(a), Type::Array(b)) => a.is_assignable(b),
            (Type::Map(k1, v1), Type::Map(k2, v2)) => {
                k1.is_assignable(k2) && v1.is_assignable(v2)
            }
            (Type::Tuple(a), Type::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_assignable(y))
            }
            (a, b) => a == b,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Number | Type::Currency | Type::Measure(_))
    }

    /// Types with a total order usable by `>=`/`<=`/`>`/`<`.
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            Type::String
                | Type::Number
                | Type::Currency
                | Type::Date
                | Type::Time
                | Type::Measure(_)
        )
    }

    /// A type is concrete when it contains no variables and no error types.
    pub fn is_concrete(&self) -> bool {
        match self {
            Type::TypeVar(_) | Type::Unknown => false,
            Type::Array(elem) => elem.is_concrete(),
            Type::Map(k, v) => k.is_concrete() && v.is_concrete(),
            Type::Tuple(fields) => fields.iter().all(Type::is_concrete),
            Type::Compound(fields) => fields.values().all(|arg| arg.ty.is_concrete()),
            Type::Object(fields) => fields.values().all(Type::is_concrete),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unify_identical_primitives() {
        let mut scope = TypeScope::new();
        assert_eq!(Type::String.unify(&Type::String, &mut scope).unwrap(), Type::String);
        assert!(Type::String.unify(&Type::Number, &mut scope).is_err());
    }

    #[test]
    fn test_unify_any_is_identity() {
        let mut scope = TypeScope::new();
        assert_eq!(Type::Any.unify(&Type::Date, &mut scope).unwrap(), Type::Date);
        assert_eq!(Type::Date.unify(&Type::Any, &mut scope).unwrap(), Type::Date);
    }

    #[test]
    fn test_unify_measure_units_opaque() {
        let mut scope = TypeScope::new();
        let c = Type::Measure("C".into());
        let f = Type::Measure("F".into());
        assert_eq!(c.unify(&c.clone(), &mut scope).unwrap(), c);
        assert!(c.unify(&f, &mut scope).is_err());
    }

    #[test]
    fn test_unify_measure_placeholder_unit() {
        let mut scope = TypeScope::new();
        let placeholder = Type::Measure(String::new());
        let c = Type::Measure("C".into());
        assert_eq!(placeholder.unify(&c, &mut scope).unwrap(), c);
    }

    #[test]
    fn test_unify_array_componentwise() {
        let mut scope = TypeScope::new();
        let a = Type::Array(Box::new(Type::Any));
        let b = Type::Array(Box::new(Type::Number));
        assert_eq!(a.unify(&b, &mut scope).unwrap(), Type::Array(Box::new(Type::Number)));
    }

    #[test]
    fn test_unify_type_var_binds() {
        let mut scope = TypeScope::new();
        let var = Type::TypeVar("t".into());
        assert_eq!(var.unify(&Type::String, &mut scope).unwrap(), Type::String);
        // Second use of the same variable must respect the binding.
        assert!(var.unify(&Type::Number, &mut scope).is_err());
        assert_eq!(var.resolve_type_scope(&scope), Type::String);
    }

    #[test]
    fn test_unify_enum_star_sentinel() {
        let mut scope = TypeScope::new();
        let open = Type::Enum(None);
        let closed = Type::Enum(Some(vec!["on".into(), "off".into()]));
        assert_eq!(open.unify(&closed, &mut scope).unwrap(), closed);
    }

    #[test]
    fn test_unification_soundness() {
        // If unify(a, b) = c then both sides resolve to c under the scope.
        let mut scope = TypeScope::new();
        let a = Type::Array(Box::new(Type::TypeVar("t".into())));
        let b = Type::Array(Box::new(Type::Time));
        let c = a.unify(&b, &mut scope).unwrap();
        assert_eq!(a.resolve_type_scope(&scope), c);
        assert_eq!(b.resolve_type_scope(&scope), c);
    }

    #[test]
    fn test_is_assignable_relaxations() {
        assert!(Type::String.is_assignable(&Type::Entity("tt:username".into())));
        assert!(Type::Currency.is_assignable(&Type::Number));
        assert!(!Type::Number.is_assignable(&Type::String));
    }

    #[test]
    fn test_display_surface_syntax() {
        assert_eq!(Type::Measure("ms".into()).to_string(), "Measure(ms)");
        assert_eq!(Type::Array(Box::new(Type::String)).to_string(), "Array(String)");
        assert_eq!(Type::Enum(None).to_string(), "Enum(*)");
    }
}
