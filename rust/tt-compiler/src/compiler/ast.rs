//! The TT abstract syntax tree: boolean predicates, expressions,
//! statements, and top-level inputs.
//!
//! All nodes are plain data with `Clone` and structural `PartialEq`; source
//! ranges are metadata and never participate in equality. Type checking
//! fills the `schema` slots; until then they are `None`.

use crate::compiler::schema::{AnnotationMap, ArgumentDef, FunctionDef, FunctionKind};
use crate::compiler::tokens::SrcRange;
use crate::compiler::values::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display as StrumDisplay, EnumString};
use thiserror::Error;

/// Raised when a construct has no representation in the requested surface.
#[derive(Debug, Error)]
#[error("cannot represent {construct} in legacy syntax")]
pub struct UnserializableError {
    pub construct: String,
}

// ── Boolean predicates ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BooleanExpression {
    True,
    False,
    /// `param op value` over the surrounding function signature
    Atom { name: String, op: String, value: Value },
    Not(Box<BooleanExpression>),
    And(Vec<BooleanExpression>),
    Or(Vec<BooleanExpression>),
    /// `true(param)`: the user explicitly does not care about this param
    DontCare { name: String },
    /// Comparison between two computed scalars
    Compute { lhs: Value, op: String, rhs: Value },
    /// `any(query)`: true iff the subquery returns at least one row
    ExistentialSubquery(Box<Expression>),
    /// `lhs op any(query)`: compares against the single column of a subquery
    ComparisonSubquery { lhs: Value, op: String, query: Box<Expression> },
    /// `a.b.c op value` through compound fields
    PropertyPath { path: Vec<String>, op: String, value: Value },
    /// Legacy external predicate: `@class.channel(params) { filter }`
    External {
        class_name: String,
        channel: String,
        in_params: Vec<InputParam>,
        filter: Box<BooleanExpression>,
    },
}

impl BooleanExpression {
    /// Convenience constructor used by the optimizer and tests.
    pub fn atom(name: impl Into<String>, op: impl Into<String>, value: Value) -> Self {
        BooleanExpression::Atom { name: name.into(), op: op.into(), value }
    }
}

impl fmt::Display for BooleanExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::compiler::prettyprint::{prettyprint, ToSource};
        write!(f, "{}", prettyprint(&self.to_source()))
    }
}

// ── Invocations ──

/// The device or principal a function is invoked on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    pub class_name: String,
    pub id: Option<String>,
    pub principal: Option<Value>,
    pub all_devices: bool,
}

impl Selector {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self { class_name: class_name.into(), id: None, principal: None, all_devices: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,
    pub value: Value,
}

impl InputParam {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self { name: name.into(), value }
    }
}

/// A direct invocation of a catalogued function: `@com.foo.bar(p=v)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub selector: Selector,
    pub channel: String,
    pub in_params: Vec<InputParam>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

impl Invocation {
    pub fn new(class_name: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            selector: Selector::new(class_name),
            channel: channel.into(),
            in_params: Vec::new(),
            schema: None,
            range: SrcRange::default(),
        }
    }
}

/// A call to a locally declared function or builtin: `name(p=v)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub in_params: Vec<InputParam>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), in_params: Vec::new(), schema: None, range: SrcRange::default() }
    }

    /// The builtin output action at the end of a chain.
    pub fn is_notify(&self) -> bool {
        self.name == "notify"
    }
}

// ── Expressions ──

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum AggregationOperator {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpression {
    pub inner: Box<Expression>,
    pub filter: BooleanExpression,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionExpression {
    pub inner: Box<Expression>,
    pub args: Vec<String>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortExpression {
    pub inner: Box<Expression>,
    pub field: String,
    pub direction: SortDirection,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexExpression {
    pub inner: Box<Expression>,
    pub indices: Vec<Value>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceExpression {
    pub inner: Box<Expression>,
    pub base: Value,
    pub limit: Value,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationExpression {
    pub inner: Box<Expression>,
    pub operator: AggregationOperator,
    /// `None` for a bare `count`
    pub field: Option<String>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasExpression {
    pub inner: Box<Expression>,
    pub name: String,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorExpression {
    pub inner: Box<Expression>,
    /// Restrict change detection to these output params; empty = all
    pub args: Vec<String>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

/// `edge <stream> on <filter>`: fires when the predicate newly becomes
/// true over the inner stream's values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeFilterExpression {
    pub inner: Box<Expression>,
    pub filter: BooleanExpression,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

/// `edge <stream> on new`: fires only for rows not previously seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeNewExpression {
    pub inner: Box<Expression>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerExpression {
    pub interval: Value,
    pub frequency: Option<Value>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtTimerExpression {
    pub times: Vec<Value>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainExpression {
    pub expressions: Vec<Expression>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Invocation(Invocation),
    FunctionCall(FunctionCall),
    Filter(FilterExpression),
    Projection(ProjectionExpression),
    Sort(SortExpression),
    Index(IndexExpression),
    Slice(SliceExpression),
    Aggregation(AggregationExpression),
    Alias(AliasExpression),
    Monitor(MonitorExpression),
    EdgeFilter(EdgeFilterExpression),
    EdgeNew(EdgeNewExpression),
    Timer(TimerExpression),
    AtTimer(AtTimerExpression),
    Chain(ChainExpression),
}

impl Expression {
    pub fn range(&self) -> SrcRange {
        match self {
            Expression::Invocation(e) => e.range,
            Expression::FunctionCall(e) => e.range,
            Expression::Filter(e) => e.range,
            Expression::Projection(e) => e.range,
            Expression::Sort(e) => e.range,
            Expression::Index(e) => e.range,
            Expression::Slice(e) => e.range,
            Expression::Aggregation(e) => e.range,
            Expression::Alias(e) => e.range,
            Expression::Monitor(e) => e.range,
            Expression::EdgeFilter(e) => e.range,
            Expression::EdgeNew(e) => e.range,
            Expression::Timer(e) => e.range,
            Expression::AtTimer(e) => e.range,
            Expression::Chain(e) => e.range,
        }
    }

    pub fn schema(&self) -> Option<&FunctionDef> {
        let slot = match self {
            Expression::Invocation(e) => &e.schema,
            Expression::FunctionCall(e) => &e.schema,
            Expression::Filter(e) => &e.schema,
            Expression::Projection(e) => &e.schema,
            Expression::Sort(e) => &e.schema,
            Expression::Index(e) => &e.schema,
            Expression::Slice(e) => &e.schema,
            Expression::Aggregation(e) => &e.schema,
            Expression::Alias(e) => &e.schema,
            Expression::Monitor(e) => &e.schema,
            Expression::EdgeFilter(e) => &e.schema,
            Expression::EdgeNew(e) => &e.schema,
            Expression::Timer(e) => &e.schema,
            Expression::AtTimer(e) => &e.schema,
            Expression::Chain(e) => &e.schema,
        };
        slot.as_deref()
    }

    pub fn set_schema(&mut self, schema: FunctionDef) {
        let slot = match self {
            Expression::Invocation(e) => &mut e.schema,
            Expression::FunctionCall(e) => &mut e.schema,
            Expression::Filter(e) => &mut e.schema,
            Expression::Projection(e) => &mut e.schema,
            Expression::Sort(e) => &mut e.schema,
            Expression::Index(e) => &mut e.schema,
            Expression::Slice(e) => &mut e.schema,
            Expression::Aggregation(e) => &mut e.schema,
            Expression::Alias(e) => &mut e.schema,
            Expression::Monitor(e) => &mut e.schema,
            Expression::EdgeFilter(e) => &mut e.schema,
            Expression::EdgeNew(e) => &mut e.schema,
            Expression::Timer(e) => &mut e.schema,
            Expression::AtTimer(e) => &mut e.schema,
            Expression::Chain(e) => &mut e.schema,
        };
        *slot = Some(Box::new(schema));
    }

    /// Structural check for stream-producing expressions, available before
    /// type checking.
    pub fn is_monitor_like(&self) -> bool {
        match self {
            Expression::Monitor(_)
            | Expression::EdgeFilter(_)
            | Expression::EdgeNew(_)
            | Expression::Timer(_)
            | Expression::AtTimer(_) => true,
            Expression::Filter(e) => e.inner.is_monitor_like(),
            Expression::Projection(e) => e.inner.is_monitor_like(),
            Expression::Alias(e) => e.inner.is_monitor_like(),
            Expression::Chain(e) => {
                e.expressions.first().map(Expression::is_monitor_like).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// The function kind of this expression, if the checker attached one.
    pub fn function_kind(&self) -> Option<FunctionKind> {
        self.schema().map(|s| s.kind)
    }

    pub fn first(&self) -> &Expression {
        match self {
            Expression::Chain(e) => e.expressions.first().map(Expression::first).unwrap_or(self),
            _ => self,
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::compiler::prettyprint::{prettyprint, ToSource};
        write!(f, "{}", prettyprint(&self.to_source()))
    }
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub args: Vec<ArgumentDef>,
    pub body: Vec<Statement>,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub value: Expression,
    pub schema: Option<Box<FunctionDef>>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionStatement {
    pub expression: Expression,
    pub range: SrcRange,
}

/// Legacy rule form: `stream => actions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleStatement {
    pub stream: Expression,
    pub actions: Vec<Expression>,
    pub range: SrcRange,
}

/// Legacy command form: `now => table => actions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStatement {
    pub table: Option<Expression>,
    pub actions: Vec<Expression>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    FunctionDeclaration(FunctionDeclaration),
    Assignment(Assignment),
    Expression(ExpressionStatement),
    Rule(RuleStatement),
    Command(CommandStatement),
}

impl Statement {
    pub fn range(&self) -> SrcRange {
        match self {
            Statement::FunctionDeclaration(s) => s.range,
            Statement::Assignment(s) => s.range,
            Statement::Expression(s) => s.range,
            Statement::Rule(s) => s.range,
            Statement::Command(s) => s.range,
        }
    }
}

impl RuleStatement {
    /// Convert to the modern chain form. Always representable.
    pub fn to_expression_statement(&self) -> ExpressionStatement {
        let mut expressions = vec![self.stream.clone()];
        expressions.extend(self.actions.iter().cloned());
        ExpressionStatement {
            expression: Expression::Chain(ChainExpression {
                expressions,
                schema: None,
                range: self.range,
            }),
            range: self.range,
        }
    }
}

impl CommandStatement {
    /// Convert to the modern chain form. Always representable.
    pub fn to_expression_statement(&self) -> ExpressionStatement {
        let mut expressions = Vec::new();
        if let Some(table) = &self.table {
            expressions.push(table.clone());
        }
        expressions.extend(self.actions.iter().cloned());
        let expression = if expressions.len() == 1 {
            expressions.into_iter().next().expect("one expression")
        } else {
            Expression::Chain(ChainExpression { expressions, schema: None, range: self.range })
        };
        ExpressionStatement { expression, range: self.range }
    }
}

impl ExpressionStatement {
    /// Convert back to the legacy rule/command split. Chains with more than
    /// one table stage have no legacy form.
    pub fn to_legacy(&self) -> Result<Statement, UnserializableError> {
        let parts: Vec<Expression> = match &self.expression {
            Expression::Chain(c) => c.expressions.clone(),
            other => vec![other.clone()],
        };
        if parts.is_empty() {
            return Err(UnserializableError { construct: "empty chain".into() });
        }
        // The legacy forms allow one head stage and a trailing action list.
        // With schemas attached the kind is authoritative; before type
        // checking only the shape can be checked.
        let actions_ok = parts[1..].iter().all(|e| {
            matches!(e, Expression::Invocation(_) | Expression::FunctionCall(_))
                && e.function_kind().map(|k| k == FunctionKind::Action).unwrap_or(true)
        });
        if !actions_ok {
            return Err(UnserializableError {
                construct: "chain with multiple table stages".into(),
            });
        }
        if parts[0].is_monitor_like() {
            Ok(Statement::Rule(RuleStatement {
                stream: parts[0].clone(),
                actions: parts[1..].to_vec(),
                range: self.range,
            }))
        } else if parts.len() == 1 {
            Ok(Statement::Command(CommandStatement {
                table: None,
                actions: vec![parts[0].clone()],
                range: self.range,
            }))
        } else {
            Ok(Statement::Command(CommandStatement {
                table: Some(parts[0].clone()),
                actions: parts[1..].to_vec(),
                range: self.range,
            }))
        }
    }
}

// ── Datasets ──

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, StrumDisplay, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ExampleKind {
    Stream,
    Query,
    Action,
    Program,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub kind: ExampleKind,
    pub args: Vec<ArgumentDef>,
    pub expression: Expression,
    pub nl_annotations: AnnotationMap,
    pub impl_annotations: AnnotationMap,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    pub language: Option<String>,
    pub examples: Vec<Example>,
    pub range: SrcRange,
}

// ── Permission rules ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PermissionFunction {
    /// The builtin `notify` output
    Builtin,
    /// `*`: any function of any class
    Star,
    /// `@class.*`: any function of one class
    ClassStar(String),
    /// A specific function, optionally filtered
    Specified {
        class_name: String,
        channel: String,
        filter: BooleanExpression,
        schema: Option<Box<FunctionDef>>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub principal: BooleanExpression,
    pub query: PermissionFunction,
    pub action: PermissionFunction,
    pub range: SrcRange,
}

// ── Control commands and dialogue states ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlIntent {
    Yes,
    No,
    Stop,
    Nevermind,
    Debug,
    Failed,
    Answer(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub intent: ControlIntent,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    pub policy: String,
    pub statements: Vec<Statement>,
    pub range: SrcRange,
}

// ── Top-level inputs ──

use crate::compiler::schema::ClassDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub classes: Vec<ClassDef>,
    pub declarations: Vec<FunctionDeclaration>,
    pub statements: Vec<Statement>,
    /// Executor of a remote program, when not the local user
    pub principal: Option<Value>,
    pub nl_annotations: AnnotationMap,
    pub impl_annotations: AnnotationMap,
    pub range: SrcRange,
}

impl Program {
    pub fn new(statements: Vec<Statement>) -> Self {
        Self {
            classes: Vec::new(),
            declarations: Vec::new(),
            statements,
            principal: None,
            nl_annotations: AnnotationMap::new(),
            impl_annotations: AnnotationMap::new(),
            range: SrcRange::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub classes: Vec<ClassDef>,
    pub datasets: Vec<Dataset>,
    pub range: SrcRange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Input {
    Program(Program),
    Library(Library),
    PermissionRule(PermissionRule),
    DialogueState(DialogueState),
    ControlCommand(ControlCommand),
}

impl Input {
    pub fn range(&self) -> SrcRange {
        match self {
            Input::Program(p) => p.range,
            Input::Library(l) => l.range,
            Input::PermissionRule(r) => r.range,
            Input::DialogueState(d) => d.range,
            Input::ControlCommand(c) => c.range,
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::compiler::prettyprint::{prettyprint, ToSource};
        write!(f, "{}", prettyprint(&self.to_source()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_chain() -> ExpressionStatement {
        let monitor = Expression::Monitor(MonitorExpression {
            inner: Box::new(Expression::Invocation(Invocation::new("com.weather", "current"))),
            args: Vec::new(),
            schema: None,
            range: SrcRange::default(),
        });
        let notify = Expression::FunctionCall(FunctionCall::new("notify"));
        ExpressionStatement {
            expression: Expression::Chain(ChainExpression {
                expressions: vec![monitor, notify],
                schema: None,
                range: SrcRange::default(),
            }),
            range: SrcRange::default(),
        }
    }

    #[test]
    fn test_clone_equality_ignores_ranges() {
        let stmt = monitor_chain();
        let mut copy = stmt.clone();
        copy.range = SrcRange::of(crate::compiler::tokens::Span::new(1, 2, 3, 4));
        assert_eq!(stmt, copy);
    }

    #[test]
    fn test_rule_roundtrip_through_legacy() {
        let stmt = monitor_chain();
        let legacy = stmt.to_legacy().unwrap();
        let Statement::Rule(rule) = &legacy else {
            panic!("expected a rule, got {:?}", legacy)
        };
        assert!(rule.stream.is_monitor_like());
        assert_eq!(rule.to_expression_statement(), stmt);
    }

    #[test]
    fn test_chain_with_two_table_stages_is_unserializable() {
        let stage = || Expression::Invocation(Invocation::new("com.foo", "bar"));
        let mut middle = stage();
        middle.set_schema(FunctionDef::new(FunctionKind::Query, "bar", vec![]));
        let stmt = ExpressionStatement {
            expression: Expression::Chain(ChainExpression {
                expressions: vec![stage(), middle, stage()],
                schema: None,
                range: SrcRange::default(),
            }),
            range: SrcRange::default(),
        };
        assert!(stmt.to_legacy().is_err());
    }

    #[test]
    fn test_monitor_like_through_wrappers() {
        let timer = Expression::Timer(TimerExpression {
            interval: Value::Measure { value: 1.0, unit: "h".into() },
            frequency: None,
            schema: None,
            range: SrcRange::default(),
        });
        let filtered = Expression::Filter(FilterExpression {
            inner: Box::new(timer),
            filter: BooleanExpression::True,
            schema: None,
            range: SrcRange::default(),
        });
        assert!(filtered.is_monitor_like());
        assert!(!Expression::Invocation(Invocation::new("a.b", "c")).is_monitor_like());
    }
}
