//! Token-stream emission and pretty-printing of TT surface syntax.
//!
//! `to_source` produces a stream of literal strings, constant tokens, and
//! formatting pseudo-tokens; `prettyprint` folds the stream into text. The
//! emission is canonical: `parse(prettyprint(to_source(n)))` reproduces an
//! equivalent tree for every optimized node.

use crate::compiler::ast::*;
use crate::compiler::schema::{AnnotationMap, ArgumentDef, ClassDef, FunctionDef, FunctionKind};
use crate::compiler::values::Value;

/// One element of the emitted stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceToken {
    Literal(String),
    Constant(Value),
    Space,
    Newline,
    CancelNewline,
    Indent,
    Dedent,
    PushAlign,
    PopAlign,
}

#[derive(Debug, Clone, Default)]
pub struct TokenStream(pub Vec<SourceToken>);

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lit(&mut self, s: impl Into<String>) -> &mut Self {
        self.0.push(SourceToken::Literal(s.into()));
        self
    }

    pub fn constant(&mut self, v: &Value) -> &mut Self {
        self.0.push(SourceToken::Constant(v.clone()));
        self
    }

    /// Emit a value: constant kinds ride in a constant token, symbolic
    /// values are rendered to literals.
    pub fn value(&mut self, v: &Value) -> &mut Self {
        match v {
            Value::Boolean(_)
            | Value::String(_)
            | Value::Number(_)
            | Value::Currency { .. }
            | Value::Measure { .. }
            | Value::Location(_)
            | Value::Time(_)
            | Value::Date(_)
            | Value::Entity { .. }
            | Value::Enum(_) => self.constant(v),
            other => self.lit(other.to_string()),
        }
    }

    pub fn sp(&mut self) -> &mut Self {
        self.0.push(SourceToken::Space);
        self
    }

    /// An operator with surrounding spaces.
    pub fn op(&mut self, s: &str) -> &mut Self {
        self.sp().lit(s).sp()
    }

    /// A keyword with a trailing space.
    pub fn kw(&mut self, s: &str) -> &mut Self {
        self.lit(s).sp()
    }

    pub fn comma(&mut self) -> &mut Self {
        self.lit(",").sp()
    }

    pub fn nl(&mut self) -> &mut Self {
        self.0.push(SourceToken::Newline);
        self
    }

    pub fn cancel_nl(&mut self) -> &mut Self {
        self.0.push(SourceToken::CancelNewline);
        self
    }

    pub fn indent(&mut self) -> &mut Self {
        self.0.push(SourceToken::Indent);
        self
    }

    pub fn dedent(&mut self) -> &mut Self {
        self.0.push(SourceToken::Dedent);
        self
    }

    pub fn push_align(&mut self) -> &mut Self {
        self.0.push(SourceToken::PushAlign);
        self
    }

    pub fn pop_align(&mut self) -> &mut Self {
        self.0.push(SourceToken::PopAlign);
        self
    }

    pub fn extend(&mut self, other: TokenStream) -> &mut Self {
        self.0.extend(other.0);
        self
    }
}

/// Anything that can re-emit its surface syntax.
pub trait ToSource {
    fn to_source(&self) -> TokenStream;
}

const INDENT_STEP: usize = 2;

/// Fold a token stream into text. Maintains the current indent and a stack
/// of column-aligned tab stops; trailing spaces are removed before every
/// newline.
pub fn prettyprint(stream: &TokenStream) -> String {
    let mut out = String::new();
    let mut indent = 0usize;
    let mut align: Vec<usize> = Vec::new();
    for token in &stream.0 {
        match token {
            SourceToken::Literal(s) => out.push_str(s),
            SourceToken::Constant(v) => out.push_str(&v.to_string()),
            SourceToken::Space => {
                if !(out.is_empty() || out.ends_with(' ') || out.ends_with('\n')) {
                    out.push(' ');
                }
            }
            SourceToken::Newline => {
                while out.ends_with(' ') {
                    out.pop();
                }
                out.push('\n');
                let col = align.last().copied().unwrap_or(indent);
                for _ in 0..col {
                    out.push(' ');
                }
            }
            SourceToken::CancelNewline => {
                while out.ends_with(' ') {
                    out.pop();
                }
                if out.ends_with('\n') {
                    out.pop();
                }
            }
            SourceToken::Indent => indent += INDENT_STEP,
            SourceToken::Dedent => indent = indent.saturating_sub(INDENT_STEP),
            SourceToken::PushAlign => {
                let col = out.len() - out.rfind('\n').map(|i| i + 1).unwrap_or(0);
                align.push(col);
            }
            SourceToken::PopAlign => {
                align.pop();
            }
        }
    }
    while out.ends_with(' ') || out.ends_with('\n') {
        out.pop();
    }
    out
}

// ── Annotations ──

fn emit_annotations(ts: &mut TokenStream, nl: &AnnotationMap, impl_: &AnnotationMap) {
    for (key, value) in nl {
        ts.sp().lit("#_[").lit(key.clone()).lit("=").value(value).lit("]");
    }
    for (key, value) in impl_ {
        ts.sp().lit("#[").lit(key.clone()).lit("=").value(value).lit("]");
    }
}

// ── Boolean expressions ──

impl ToSource for BooleanExpression {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        emit_boolean(&mut ts, self);
        ts
    }
}

fn emit_boolean(ts: &mut TokenStream, expr: &BooleanExpression) {
    match expr {
        BooleanExpression::True => {
            ts.lit("true");
        }
        BooleanExpression::False => {
            ts.lit("false");
        }
        BooleanExpression::Atom { name, op, value } => {
            ts.lit(name.clone()).op(op).value(value);
        }
        BooleanExpression::Not(inner) => {
            ts.lit("!").lit("(");
            emit_boolean(ts, inner);
            ts.lit(")");
        }
        BooleanExpression::And(ops) => {
            for (i, operand) in ops.iter().enumerate() {
                if i > 0 {
                    ts.op("&&");
                }
                // `||` binds looser, so a disjunction operand needs parens.
                if matches!(operand, BooleanExpression::Or(_)) {
                    ts.lit("(");
                    emit_boolean(ts, operand);
                    ts.lit(")");
                } else {
                    emit_boolean(ts, operand);
                }
            }
        }
        BooleanExpression::Or(ops) => {
            for (i, operand) in ops.iter().enumerate() {
                if i > 0 {
                    ts.op("||");
                }
                emit_boolean(ts, operand);
            }
        }
        BooleanExpression::DontCare { name } => {
            ts.lit("true").lit("(").lit(name.clone()).lit(")");
        }
        BooleanExpression::Compute { lhs, op, rhs } => {
            ts.value(lhs).op(op).value(rhs);
        }
        BooleanExpression::ExistentialSubquery(query) => {
            ts.lit("any").lit("(");
            ts.extend(query.to_source());
            ts.lit(")");
        }
        BooleanExpression::ComparisonSubquery { lhs, op, query } => {
            ts.value(lhs).op(op).lit("any").lit("(");
            ts.extend(query.to_source());
            ts.lit(")");
        }
        BooleanExpression::PropertyPath { path, op, value } => {
            ts.lit(path.join(".")).op(op).value(value);
        }
        BooleanExpression::External { class_name, channel, in_params, filter } => {
            ts.lit(format!("@{}.{}", class_name, channel)).lit("(");
            emit_input_params(ts, in_params);
            ts.lit(")").sp().lit("{").sp();
            emit_boolean(ts, filter);
            ts.sp().lit("}");
        }
    }
}

// ── Expressions ──

fn emit_input_params(ts: &mut TokenStream, params: &[InputParam]) {
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            ts.comma();
        }
        ts.lit(param.name.clone()).lit("=").value(&param.value);
    }
}

/// Emit a sub-expression that must parse as a single postfix-able unit.
fn emit_expr_operand(ts: &mut TokenStream, expr: &Expression) {
    match expr {
        Expression::Invocation(_) | Expression::FunctionCall(_) => ts.extend(expr.to_source()),
        _ => {
            ts.lit("(");
            ts.extend(expr.to_source());
            ts.lit(")")
        }
    };
}

impl ToSource for Expression {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        match self {
            Expression::Invocation(inv) => {
                let selector = &inv.selector;
                ts.lit(format!("@{}", selector.class_name));
                let has_attrs =
                    selector.id.is_some() || selector.principal.is_some() || selector.all_devices;
                if has_attrs {
                    ts.lit("(");
                    let mut first = true;
                    if let Some(id) = &selector.id {
                        ts.lit("id=").value(&Value::String(id.clone()));
                        first = false;
                    }
                    if let Some(principal) = &selector.principal {
                        if !first {
                            ts.comma();
                        }
                        ts.lit("principal=").value(principal);
                        first = false;
                    }
                    if selector.all_devices {
                        if !first {
                            ts.comma();
                        }
                        ts.lit("all=true");
                    }
                    ts.lit(")");
                }
                ts.lit(format!(".{}", inv.channel)).lit("(");
                emit_input_params(&mut ts, &inv.in_params);
                ts.lit(")");
            }
            Expression::FunctionCall(call) => {
                if call.is_notify() && call.in_params.is_empty() {
                    ts.lit("notify");
                } else {
                    ts.lit(call.name.clone()).lit("(");
                    emit_input_params(&mut ts, &call.in_params);
                    ts.lit(")");
                }
            }
            Expression::Filter(e) => {
                // Streams must be parenthesized so the filter does not fold
                // into the monitored table on re-parse.
                if e.inner.is_monitor_like() || matches!(*e.inner, Expression::Chain(_)) {
                    emit_expr_operand(&mut ts, &e.inner);
                } else {
                    ts.extend(e.inner.to_source());
                }
                ts.sp().kw("filter");
                emit_boolean(&mut ts, &e.filter);
            }
            Expression::Projection(e) => {
                ts.lit("[").lit(e.args.join(", ")).lit("]").sp().kw("of");
                emit_inner(&mut ts, &e.inner);
            }
            Expression::Sort(e) => {
                ts.lit("sort").lit("(").lit(e.field.clone()).sp().lit(e.direction.to_string());
                ts.sp().kw("of");
                ts.extend(e.inner.to_source());
                ts.lit(")");
            }
            Expression::Index(e) => {
                emit_postfix_base(&mut ts, &e.inner);
                ts.lit("[");
                for (i, index) in e.indices.iter().enumerate() {
                    if i > 0 {
                        ts.comma();
                    }
                    ts.value(index);
                }
                ts.lit("]");
            }
            Expression::Slice(e) => {
                emit_postfix_base(&mut ts, &e.inner);
                ts.lit("[").value(&e.base).sp().lit(":").sp().value(&e.limit).lit("]");
            }
            Expression::Aggregation(e) => {
                ts.kw("aggregate").lit(e.operator.to_string());
                if let Some(field) = &e.field {
                    ts.sp().lit(field.clone());
                }
                ts.sp().kw("of");
                emit_inner(&mut ts, &e.inner);
            }
            Expression::Alias(e) => {
                ts.extend(e.inner.to_source());
                ts.sp().kw("as").lit(e.name.clone());
            }
            Expression::Monitor(e) => {
                ts.kw("monitor");
                if !e.args.is_empty() {
                    ts.lit("[").lit(e.args.join(", ")).lit("]").sp().kw("of");
                }
                emit_inner(&mut ts, &e.inner);
            }
            Expression::EdgeFilter(e) => {
                ts.kw("edge");
                emit_inner(&mut ts, &e.inner);
                ts.sp().kw("on");
                emit_boolean(&mut ts, &e.filter);
            }
            Expression::EdgeNew(e) => {
                ts.kw("edge");
                emit_inner(&mut ts, &e.inner);
                ts.sp().kw("on").lit("new");
            }
            Expression::Timer(e) => {
                ts.lit("timer").lit("(").lit("interval=").value(&e.interval);
                if let Some(frequency) = &e.frequency {
                    ts.comma().lit("frequency=").value(frequency);
                }
                ts.lit(")");
            }
            Expression::AtTimer(e) => {
                ts.lit("attimer").lit("(").lit("time=[");
                for (i, time) in e.times.iter().enumerate() {
                    if i > 0 {
                        ts.comma();
                    }
                    ts.value(time);
                }
                ts.lit("])");
            }
            Expression::Chain(e) => {
                for (i, expr) in e.expressions.iter().enumerate() {
                    if i > 0 {
                        ts.op("=>");
                    }
                    if matches!(expr, Expression::Chain(_)) {
                        emit_expr_operand(&mut ts, expr);
                    } else {
                        ts.extend(expr.to_source());
                    }
                }
            }
        }
        ts
    }
}

/// A wrapped expression after `of` or `monitor`: chains need parens.
fn emit_inner(ts: &mut TokenStream, inner: &Expression) {
    if matches!(inner, Expression::Chain(_)) {
        emit_expr_operand(ts, inner);
    } else {
        ts.extend(inner.to_source());
    }
}

/// The base of an index or slice: anything that is not a bare invocation
/// gets parenthesized so the subscript does not merge into a literal.
fn emit_postfix_base(ts: &mut TokenStream, inner: &Expression) {
    match inner {
        Expression::Invocation(_) | Expression::FunctionCall(_) | Expression::Index(_)
        | Expression::Slice(_) => {
            ts.extend(inner.to_source());
        }
        _ => emit_expr_operand(ts, inner),
    }
}

// ── Statements ──

impl ToSource for Statement {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        match self {
            Statement::FunctionDeclaration(decl) => {
                ts.kw("function").lit(decl.name.clone()).lit("(");
                for (i, arg) in decl.args.iter().enumerate() {
                    if i > 0 {
                        ts.comma();
                    }
                    ts.lit(arg.name.clone()).op(":").lit(arg.ty.to_string());
                }
                ts.lit(")").sp().lit("{").indent();
                for stmt in &decl.body {
                    ts.nl().extend(stmt.to_source());
                }
                ts.dedent().nl().lit("}");
            }
            Statement::Assignment(assign) => {
                ts.kw("let").lit(assign.name.clone()).op("=");
                ts.extend(assign.value.to_source());
                ts.lit(";");
            }
            Statement::Expression(stmt) => {
                ts.extend(stmt.expression.to_source());
                ts.lit(";");
            }
            Statement::Rule(rule) => {
                ts.extend(rule.stream.to_source());
                for action in &rule.actions {
                    ts.op("=>");
                    ts.extend(action.to_source());
                }
                ts.lit(";");
            }
            Statement::Command(cmd) => {
                ts.kw("now").lit("=>").sp();
                if let Some(table) = &cmd.table {
                    ts.extend(table.to_source());
                    ts.op("=>");
                }
                for (i, action) in cmd.actions.iter().enumerate() {
                    if i > 0 {
                        ts.op("=>");
                    }
                    ts.extend(action.to_source());
                }
                ts.lit(";");
            }
        }
        ts
    }
}

// ── Schema definitions ──

impl ToSource for ArgumentDef {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.kw(&self.direction.to_string()).lit(self.name.clone()).op(":");
        ts.lit(self.ty.to_string());
        emit_annotations(&mut ts, &self.nl_annotations, &self.impl_annotations);
        ts
    }
}

impl ToSource for FunctionDef {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        if self.is_monitorable && self.kind == FunctionKind::Query {
            ts.kw("monitorable");
        }
        if self.is_list {
            ts.kw("list");
        }
        ts.kw(&self.kind.to_string()).lit(self.name.clone());
        if !self.extends.is_empty() {
            ts.sp().kw("extends").lit(self.extends.join(", "));
        }
        ts.lit("(");
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                ts.comma();
            }
            ts.extend(arg.to_source());
        }
        ts.lit(")");
        emit_annotations(&mut ts, &self.nl_annotations, &self.impl_annotations);
        if self.require_filter {
            ts.sp().lit("#[require_filter=true]");
        }
        if !self.default_projection.is_empty() {
            let args: Vec<Value> =
                self.default_projection.iter().map(|a| Value::String(a.clone())).collect();
            ts.sp().lit("#[default_projection=").lit(Value::Array(args).to_string()).lit("]");
        }
        ts.lit(";");
        ts
    }
}

impl ToSource for ClassDef {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.kw("class").lit(format!("@{}", self.name));
        if !self.extends.is_empty() {
            let parents: Vec<String> = self.extends.iter().map(|p| format!("@{}", p)).collect();
            ts.sp().kw("extends").lit(parents.join(", "));
        }
        emit_annotations(&mut ts, &self.nl_annotations, &self.impl_annotations);
        ts.sp().lit("{").indent();
        for import in &self.imports {
            ts.nl().kw("import").lit(import.facets.join(", ")).sp().kw("from");
            ts.lit(format!("@{}", import.module)).lit("();");
        }
        for entity in &self.entities {
            ts.nl().kw("entity").lit(entity.name.clone());
            emit_annotations(&mut ts, &entity.nl_annotations, &AnnotationMap::new());
            ts.lit(";");
        }
        for def in self.queries.values() {
            ts.nl().extend(def.to_source());
        }
        for def in self.actions.values() {
            ts.nl().extend(def.to_source());
        }
        ts.dedent().nl().lit("}");
        ts
    }
}

impl ToSource for Dataset {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.kw("dataset").lit(format!("@{}", self.name));
        if let Some(language) = &self.language {
            ts.sp().kw("language").value(&Value::String(language.clone()));
        }
        ts.sp().lit("{").indent();
        for example in &self.examples {
            ts.nl().lit(example.kind.to_string());
            if !example.args.is_empty() {
                ts.sp().lit("(");
                for (i, arg) in example.args.iter().enumerate() {
                    if i > 0 {
                        ts.comma();
                    }
                    ts.lit(arg.name.clone()).op(":").lit(arg.ty.to_string());
                }
                ts.lit(")");
            }
            ts.op(":=");
            ts.extend(example.expression.to_source());
            emit_annotations(&mut ts, &example.nl_annotations, &example.impl_annotations);
            ts.lit(";");
        }
        ts.dedent().nl().lit("}");
        ts
    }
}

// ── Permission rules ──

impl ToSource for PermissionFunction {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        match self {
            PermissionFunction::Builtin => {
                ts.lit("notify");
            }
            PermissionFunction::Star => {
                ts.lit("*");
            }
            PermissionFunction::ClassStar(class) => {
                ts.lit(format!("@{}.*", class));
            }
            PermissionFunction::Specified { class_name, channel, filter, .. } => {
                ts.lit(format!("@{}.{}", class_name, channel));
                if *filter != BooleanExpression::True {
                    ts.sp().kw("filter");
                    emit_boolean(&mut ts, filter);
                }
            }
        }
        ts
    }
}

// ── Top-level inputs ──

impl ToSource for Input {
    fn to_source(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        match self {
            Input::Program(program) => {
                if let Some(principal) = &program.principal {
                    ts.kw("executor").op("=").value(principal).op(":").nl();
                }
                for class in &program.classes {
                    ts.extend(class.to_source());
                    ts.nl();
                }
                for decl in &program.declarations {
                    ts.extend(Statement::FunctionDeclaration(decl.clone()).to_source());
                    ts.nl();
                }
                for stmt in &program.statements {
                    ts.extend(stmt.to_source());
                    ts.nl();
                }
            }
            Input::Library(library) => {
                for class in &library.classes {
                    ts.extend(class.to_source());
                    ts.nl();
                }
                for dataset in &library.datasets {
                    ts.extend(dataset.to_source());
                    ts.nl();
                }
            }
            Input::PermissionRule(rule) => {
                ts.lit("$policy").sp().lit("{").sp();
                emit_boolean(&mut ts, &rule.principal);
                ts.op(":");
                ts.extend(rule.query.to_source());
                ts.op("=>");
                ts.extend(rule.action.to_source());
                ts.lit(";").sp().lit("}");
            }
            Input::DialogueState(state) => {
                ts.lit("$dialogue").sp().lit(format!("@{}", state.policy)).lit(";");
                for stmt in &state.statements {
                    ts.nl().extend(stmt.to_source());
                }
            }
            Input::ControlCommand(command) => match &command.intent {
                ControlIntent::Yes => {
                    ts.lit("$yes;");
                }
                ControlIntent::No => {
                    ts.lit("$no;");
                }
                ControlIntent::Stop => {
                    ts.lit("$stop;");
                }
                ControlIntent::Nevermind => {
                    ts.lit("$nevermind;");
                }
                ControlIntent::Debug => {
                    ts.lit("$debug;");
                }
                ControlIntent::Failed => {
                    ts.lit("$failed;");
                }
                ControlIntent::Answer(value) => {
                    ts.lit("$answer").lit("(").value(value).lit(");");
                }
            },
        }
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tokens::SrcRange;

    #[test]
    fn test_prettyprint_spaces_and_newlines() {
        let mut ts = TokenStream::new();
        ts.kw("let").lit("x").op("=").lit("1").sp().nl().lit("done");
        // The trailing space before the newline must be removed.
        assert_eq!(prettyprint(&ts), "let x = 1\ndone");
    }

    #[test]
    fn test_prettyprint_indent() {
        let mut ts = TokenStream::new();
        ts.lit("{").indent().nl().lit("a").dedent().nl().lit("}");
        assert_eq!(prettyprint(&ts), "{\n  a\n}");
    }

    #[test]
    fn test_prettyprint_align_stops() {
        let mut ts = TokenStream::new();
        ts.lit("head(").push_align().lit("a,").nl().lit("b").pop_align().lit(")");
        assert_eq!(prettyprint(&ts), "head(a,\n     b)");
    }

    #[test]
    fn test_cancel_newline() {
        let mut ts = TokenStream::new();
        ts.lit("a").nl().cancel_nl().lit("b");
        assert_eq!(prettyprint(&ts), "ab");
    }

    #[test]
    fn test_boolean_emission() {
        let expr = BooleanExpression::And(vec![
            BooleanExpression::atom("a", ">=", Value::Number(1.0)),
            BooleanExpression::Or(vec![
                BooleanExpression::atom("b", "==", Value::String("x".into())),
                BooleanExpression::atom("c", "<", Value::Number(2.0)),
            ]),
        ]);
        assert_eq!(expr.to_string(), "a >= 1 && (b == \"x\" || c < 2)");
    }

    #[test]
    fn test_invocation_emission() {
        let mut inv = Invocation::new("com.weather", "current");
        inv.in_params.push(InputParam::new("city", Value::String("Paris".into())));
        assert_eq!(
            Expression::Invocation(inv).to_string(),
            "@com.weather.current(city=\"Paris\")"
        );
    }

    #[test]
    fn test_monitor_chain_emission() {
        let chain = Expression::Chain(ChainExpression {
            expressions: vec![
                Expression::Monitor(MonitorExpression {
                    inner: Box::new(Expression::Invocation(Invocation::new(
                        "com.weather",
                        "current",
                    ))),
                    args: vec![],
                    schema: None,
                    range: SrcRange::default(),
                }),
                Expression::FunctionCall(FunctionCall::new("notify")),
            ],
            schema: None,
            range: SrcRange::default(),
        });
        assert_eq!(chain.to_string(), "monitor @com.weather.current() => notify");
    }

    #[test]
    fn test_filtered_stream_gets_parens() {
        let monitor = Expression::Monitor(MonitorExpression {
            inner: Box::new(Expression::Invocation(Invocation::new("com.a", "b"))),
            args: vec![],
            schema: None,
            range: SrcRange::default(),
        });
        let filtered = Expression::Filter(FilterExpression {
            inner: Box::new(monitor),
            filter: BooleanExpression::atom("x", "==", Value::Number(1.0)),
            schema: None,
            range: SrcRange::default(),
        });
        assert_eq!(filtered.to_string(), "(monitor @com.a.b()) filter x == 1");
    }

    #[test]
    fn test_permission_rule_emission() {
        let rule = Input::PermissionRule(PermissionRule {
            principal: BooleanExpression::True,
            query: PermissionFunction::Specified {
                class_name: "com.x".into(),
                channel: "q".into(),
                filter: BooleanExpression::True,
                schema: None,
            },
            action: PermissionFunction::Specified {
                class_name: "com.y".into(),
                channel: "a".into(),
                filter: BooleanExpression::True,
                schema: None,
            },
            range: SrcRange::default(),
        });
        assert_eq!(rule.to_string(), "$policy { true : @com.x.q => @com.y.a; }");
    }
}
