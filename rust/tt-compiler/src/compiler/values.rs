//! The TT value model: literal and symbolic scalars carried by the AST.

use crate::compiler::ast::BooleanExpression;
use crate::compiler::types::Type;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tt_core::strings::quote_string;

/// Render a number the way the surface syntax writes it: integral values
/// without a decimal point.
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Location {
    Absolute { lat: f64, lon: f64, display: Option<String> },
    /// `$location.home` and friends, resolved by the runtime per user
    Relative(String),
    /// A place name the entity linker could not resolve yet
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeValue {
    Absolute { hour: u32, minute: u32, second: u32 },
    /// `$time.morning` and friends
    Relative(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateEdge {
    StartOf,
    EndOf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DateValue {
    Now,
    Absolute(DateTime<Utc>),
    /// `$start_of(week)` / `$end_of(mon)`
    Edge { edge: DateEdge, unit: String },
    /// A partially-specified civil date
    DatePiece {
        year: Option<i32>,
        month: Option<u32>,
        day: Option<u32>,
        time: Option<TimeValue>,
    },
}

/// A literal or symbolic scalar. Values carry no source ranges; errors about
/// a value are reported with the range of the enclosing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    String(String),
    Number(f64),
    Currency { value: f64, code: String },
    Measure { value: f64, unit: String },
    Location(Location),
    Time(TimeValue),
    Date(DateValue),
    Entity { value: Option<String>, ty: String, display: Option<String> },
    Enum(String),
    /// `$event` or `$event.field`
    Event(Option<String>),
    VarRef { name: String, ty: Option<Type> },
    Computation { op: String, operands: Vec<Value>, ty: Option<Type> },
    /// Maps an array of compounds to one field of each element
    ArrayField { value: Box<Value>, field: String, ty: Option<Type> },
    /// Filters an array value by a predicate over its elements
    Filter { value: Box<Value>, filter: Box<BooleanExpression> },
    Undefined { local: bool },
    ContextRef { name: String, ty: Type },
    Array(Vec<Value>),
    ArgMap(BTreeMap<String, Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// The type this value inhabits. Enum literals type as the open enum
    /// universe so that they unify with any declared member set.
    pub fn get_type(&self) -> Type {
        match self {
            Value::Boolean(_) => Type::Boolean,
            Value::String(_) => Type::String,
            Value::Number(_) => Type::Number,
            Value::Currency { .. } => Type::Currency,
            Value::Measure { unit, .. } => Type::Measure(unit.clone()),
            Value::Location(_) => Type::Location,
            Value::Time(_) => Type::Time,
            Value::Date(_) => Type::Date,
            Value::Entity { ty, .. } => Type::Entity(ty.clone()),
            Value::Enum(_) => Type::Enum(None),
            Value::Event(_) => Type::String,
            Value::VarRef { ty, .. } => ty.clone().unwrap_or(Type::Any),
            Value::Computation { ty, .. } => ty.clone().unwrap_or(Type::Any),
            Value::ArrayField { ty, .. } => {
                Type::Array(Box::new(ty.clone().unwrap_or(Type::Any)))
            }
            Value::Filter { value, .. } => value.get_type(),
            Value::Undefined { .. } => Type::Any,
            Value::ContextRef { ty, .. } => ty.clone(),
            Value::Array(elements) => {
                let elem = elements.first().map(Value::get_type).unwrap_or(Type::Any);
                Type::Array(Box::new(elem))
            }
            Value::ArgMap(_) => Type::ArgMap,
            Value::Object(fields) => Type::Object(
                fields.iter().map(|(name, v)| (name.clone(), v.get_type())).collect(),
            ),
        }
    }

    /// Literals are constant; anything resolved at runtime is not.
    pub fn is_constant(&self) -> bool {
        match self {
            Value::Boolean(_)
            | Value::String(_)
            | Value::Number(_)
            | Value::Currency { .. }
            | Value::Measure { .. }
            | Value::Location(_)
            | Value::Time(_)
            | Value::Date(_)
            | Value::Entity { .. }
            | Value::Enum(_) => true,
            Value::Array(elements) => elements.iter().all(Value::is_constant),
            Value::Object(fields) | Value::ArgMap(fields) => {
                fields.values().all(Value::is_constant)
            }
            Value::Event(_)
            | Value::VarRef { .. }
            | Value::Computation { .. }
            | Value::ArrayField { .. }
            | Value::Filter { .. }
            | Value::Undefined { .. }
            | Value::ContextRef { .. } => false,
        }
    }

    /// Concrete values can be executed as-is. Undefined values, unresolved
    /// entities and locations, relative times, and placeholder measure
    /// units all need slot filling or runtime resolution first.
    pub fn is_concrete(&self) -> bool {
        match self {
            Value::Undefined { .. } => false,
            Value::Entity { value, .. } => value.is_some(),
            Value::Location(Location::Unresolved(_)) | Value::Location(Location::Relative(_)) => {
                false
            }
            Value::Time(TimeValue::Relative(_)) => false,
            Value::Measure { unit, .. } => !unit.is_empty(),
            Value::Array(elements) => elements.iter().all(Value::is_concrete),
            Value::Object(fields) | Value::ArgMap(fields) => {
                fields.values().all(Value::is_concrete)
            }
            Value::Computation { operands, .. } => operands.iter().all(Value::is_concrete),
            Value::ArrayField { value, .. } | Value::Filter { value, .. } => value.is_concrete(),
            _ => true,
        }
    }

    /// True for the symbolic computation operators rendered infix.
    fn is_infix_op(op: &str) -> bool {
        matches!(op, "+" | "-" | "*" | "/" | "%" | "**")
    }

    fn needs_parens(&self) -> bool {
        matches!(self, Value::Computation { op, .. } if Value::is_infix_op(op))
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.needs_parens() {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", quote_string(s)),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Currency { value, code } => {
                write!(f, "new Currency({}, {})", format_number(*value), code)
            }
            Value::Measure { value, unit } => write!(f, "{}{}", format_number(*value), unit),
            Value::Location(Location::Absolute { lat, lon, display }) => match display {
                Some(d) => write!(f, "new Location({}, {}, {})", lat, lon, quote_string(d)),
                None => write!(f, "new Location({}, {})", lat, lon),
            },
            Value::Location(Location::Relative(name)) => write!(f, "$location.{}", name),
            Value::Location(Location::Unresolved(name)) => {
                write!(f, "new Location({})", quote_string(name))
            }
            Value::Time(TimeValue::Absolute { hour, minute, second }) => {
                if *second > 0 {
                    write!(f, "new Time({}, {}, {})", hour, minute, second)
                } else {
                    write!(f, "new Time({}, {})", hour, minute)
                }
            }
            Value::Time(TimeValue::Relative(name)) => write!(f, "$time.{}", name),
            Value::Date(DateValue::Now) => write!(f, "$now"),
            Value::Date(DateValue::Absolute(dt)) => {
                write!(f, "new Date(\"{}\")", dt.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Date(DateValue::Edge { edge, unit }) => match edge {
                DateEdge::StartOf => write!(f, "$start_of({})", unit),
                DateEdge::EndOf => write!(f, "$end_of({})", unit),
            },
            Value::Date(DateValue::DatePiece { year, month, day, time }) => {
                let part = |f: &mut fmt::Formatter<'_>, v: Option<u32>| match v {
                    Some(v) => write!(f, ", {}", v),
                    None => write!(f, ", null"),
                };
                write!(f, "new Date(")?;
                match year {
                    Some(y) => write!(f, "{}", y)?,
                    None => write!(f, "null")?,
                }
                part(f, *month)?;
                part(f, *day)?;
                if let Some(t) = time {
                    write!(f, ", {}", Value::Time(t.clone()))?;
                }
                write!(f, ")")
            }
            Value::Entity { value, ty, display } => {
                match value {
                    Some(v) => write!(f, "{}^^{}", quote_string(v), ty)?,
                    None => write!(f, "null^^{}", ty)?,
                }
                if let Some(d) = display {
                    write!(f, "({})", quote_string(d))?;
                }
                Ok(())
            }
            Value::Enum(tag) => write!(f, "enum({})", tag),
            Value::Event(None) => write!(f, "$event"),
            Value::Event(Some(kind)) => write!(f, "$event.{}", kind),
            Value::VarRef { name, .. } => write!(f, "{}", name),
            Value::Computation { op, operands, .. } => {
                if Value::is_infix_op(op) && operands.len() == 2 {
                    operands[0].fmt_operand(f)?;
                    write!(f, " {} ", op)?;
                    operands[1].fmt_operand(f)
                } else {
                    write!(f, "{}(", op)?;
                    for (i, operand) in operands.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        write!(f, "{}", operand)?;
                    }
                    write!(f, ")")
                }
            }
            Value::ArrayField { value, field, .. } => {
                write!(f, "{} of ", field)?;
                value.fmt_operand(f)
            }
            Value::Filter { value, filter } => {
                value.fmt_operand(f)?;
                write!(f, " filter {}", filter)
            }
            Value::Undefined { local: true } => write!(f, "$?"),
            Value::Undefined { local: false } => write!(f, "$undefined"),
            Value::ContextRef { name, ty } => write!(f, "$context.{} : {}", name, ty),
            Value::Array(elements) => {
                write!(f, "[")?;
                for (i, elem) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", elem)?;
                }
                write!(f, "]")
            }
            Value::ArgMap(fields) => {
                write!(f, "new ArgMap(")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, v)?;
                }
                write!(f, ")")
            }
            Value::Object(fields) => {
                write!(f, "{{ ")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", name, v)?;
                }
                write!(f, " }}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_clone_fidelity() {
        let value = Value::Array(vec![
            Value::Number(1.5),
            Value::Measure { value: 20.0, unit: "C".into() },
        ]);
        let copy = value.clone();
        assert_eq!(copy, value);
    }

    #[test]
    fn test_get_type_measure() {
        let v = Value::Measure { value: 20.0, unit: "C".into() };
        assert_eq!(v.get_type(), Type::Measure("C".into()));
    }

    #[test]
    fn test_enum_types_as_open_universe() {
        assert_eq!(Value::Enum("on".into()).get_type(), Type::Enum(None));
    }

    #[test]
    fn test_constant_flags() {
        assert!(Value::Number(1.0).is_constant());
        assert!(Value::Array(vec![Value::Boolean(true)]).is_constant());
        assert!(!Value::VarRef { name: "x".into(), ty: None }.is_constant());
        assert!(!Value::Array(vec![Value::Undefined { local: true }]).is_constant());
    }

    #[test]
    fn test_concreteness() {
        assert!(!Value::Undefined { local: true }.is_concrete());
        assert!(!Value::Entity { value: None, ty: "tt:username".into(), display: None }
            .is_concrete());
        assert!(!Value::Time(TimeValue::Relative("morning".into())).is_concrete());
        assert!(!Value::Measure { value: 1.0, unit: String::new() }.is_concrete());
        assert!(Value::Measure { value: 1.0, unit: "C".into() }.is_concrete());
    }

    #[test]
    fn test_object_equality_requires_all_keys() {
        let mut a = BTreeMap::new();
        a.insert("x".to_string(), Value::Number(1.0));
        a.insert("y".to_string(), Value::Number(2.0));
        let mut b = a.clone();
        b.remove("y");
        assert_ne!(Value::Object(a.clone()), Value::Object(b.clone()));
        b.insert("y".to_string(), Value::Number(3.0));
        assert_ne!(Value::Object(a.clone()), Value::Object(b.clone()));
        b.insert("y".to_string(), Value::Number(2.0));
        assert_eq!(Value::Object(a), Value::Object(b));
    }

    #[test]
    fn test_date_renders_iso() {
        let dt = Utc.with_ymd_and_hms(2020, 5, 1, 0, 0, 0).unwrap();
        let v = Value::Date(DateValue::Absolute(dt));
        assert_eq!(v.to_string(), "new Date(\"2020-05-01T00:00:00.000Z\")");
    }

    #[test]
    fn test_number_rendering() {
        assert_eq!(Value::Number(20.0).to_string(), "20");
        assert_eq!(Value::Number(1.5).to_string(), "1.5");
        assert_eq!(Value::Measure { value: 20.0, unit: "C".into() }.to_string(), "20C");
    }

    #[test]
    fn test_computation_rendering() {
        let v = Value::Computation {
            op: "+".into(),
            operands: vec![
                Value::VarRef { name: "a".into(), ty: None },
                Value::Number(1.0),
            ],
            ty: None,
        };
        assert_eq!(v.to_string(), "a + 1");
        let named = Value::Computation {
            op: "max".into(),
            operands: vec![Value::VarRef { name: "xs".into(), ty: None }],
            ty: None,
        };
        assert_eq!(named.to_string(), "max(xs)");
    }
}
