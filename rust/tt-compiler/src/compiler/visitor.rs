//! AST traversal and slot enumeration.
//!
//! The `Visitor` trait has pre/post hooks (`enter`/`exit`) and one method
//! per node kind; returning `false` from a `visit_*` method prunes the
//! subtree. Traversal never mutates the tree.

use crate::compiler::ast::*;
use crate::compiler::schema::FunctionDef;
use crate::compiler::values::Value;

/// A borrowed reference to any AST node, for the `enter`/`exit` hooks.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Input(&'a Input),
    Statement(&'a Statement),
    Expression(&'a Expression),
    Boolean(&'a BooleanExpression),
    Value(&'a Value),
}

#[allow(unused_variables)]
pub trait Visitor {
    fn enter(&mut self, node: NodeRef<'_>) {}
    fn exit(&mut self, node: NodeRef<'_>) {}

    fn visit_program(&mut self, program: &Program) -> bool {
        true
    }
    fn visit_library(&mut self, library: &Library) -> bool {
        true
    }
    fn visit_permission_rule(&mut self, rule: &PermissionRule) -> bool {
        true
    }
    fn visit_dialogue_state(&mut self, state: &DialogueState) -> bool {
        true
    }
    fn visit_control_command(&mut self, command: &ControlCommand) -> bool {
        true
    }

    fn visit_function_declaration(&mut self, decl: &FunctionDeclaration) -> bool {
        true
    }
    fn visit_assignment(&mut self, assign: &Assignment) -> bool {
        true
    }
    fn visit_expression_statement(&mut self, stmt: &ExpressionStatement) -> bool {
        true
    }
    fn visit_rule(&mut self, rule: &RuleStatement) -> bool {
        true
    }
    fn visit_command(&mut self, command: &CommandStatement) -> bool {
        true
    }

    fn visit_invocation(&mut self, invocation: &Invocation) -> bool {
        true
    }
    fn visit_function_call(&mut self, call: &FunctionCall) -> bool {
        true
    }
    fn visit_filter_expression(&mut self, filter: &FilterExpression) -> bool {
        true
    }
    fn visit_projection(&mut self, projection: &ProjectionExpression) -> bool {
        true
    }
    fn visit_sort(&mut self, sort: &SortExpression) -> bool {
        true
    }
    fn visit_index(&mut self, index: &IndexExpression) -> bool {
        true
    }
    fn visit_slice(&mut self, slice: &SliceExpression) -> bool {
        true
    }
    fn visit_aggregation(&mut self, aggregation: &AggregationExpression) -> bool {
        true
    }
    fn visit_alias(&mut self, alias: &AliasExpression) -> bool {
        true
    }
    fn visit_monitor(&mut self, monitor: &MonitorExpression) -> bool {
        true
    }
    fn visit_edge_filter(&mut self, edge: &EdgeFilterExpression) -> bool {
        true
    }
    fn visit_edge_new(&mut self, edge: &EdgeNewExpression) -> bool {
        true
    }
    fn visit_timer(&mut self, timer: &TimerExpression) -> bool {
        true
    }
    fn visit_attimer(&mut self, attimer: &AtTimerExpression) -> bool {
        true
    }
    fn visit_chain(&mut self, chain: &ChainExpression) -> bool {
        true
    }

    fn visit_boolean_constant(&mut self, value: bool) -> bool {
        true
    }
    fn visit_atom(&mut self, name: &str, op: &str, value: &Value) -> bool {
        true
    }
    fn visit_not(&mut self, inner: &BooleanExpression) -> bool {
        true
    }
    fn visit_and(&mut self, operands: &[BooleanExpression]) -> bool {
        true
    }
    fn visit_or(&mut self, operands: &[BooleanExpression]) -> bool {
        true
    }
    fn visit_dont_care(&mut self, name: &str) -> bool {
        true
    }
    fn visit_compute_boolean(&mut self, lhs: &Value, op: &str, rhs: &Value) -> bool {
        true
    }
    fn visit_existential_subquery(&mut self, query: &Expression) -> bool {
        true
    }
    fn visit_comparison_subquery(&mut self, lhs: &Value, op: &str, query: &Expression) -> bool {
        true
    }
    fn visit_property_path(&mut self, path: &[String], op: &str, value: &Value) -> bool {
        true
    }
    fn visit_external(&mut self, class_name: &str, channel: &str) -> bool {
        true
    }

    fn visit_value(&mut self, value: &Value) -> bool {
        true
    }
}

impl Input {
    pub fn visit(&self, visitor: &mut dyn Visitor) {
        visitor.enter(NodeRef::Input(self));
        match self {
            Input::Program(program) => {
                if visitor.visit_program(program) {
                    if let Some(principal) = &program.principal {
                        principal.visit(visitor);
                    }
                    for decl in &program.declarations {
                        if visitor.visit_function_declaration(decl) {
                            for stmt in &decl.body {
                                stmt.visit(visitor);
                            }
                        }
                    }
                    for stmt in &program.statements {
                        stmt.visit(visitor);
                    }
                }
            }
            Input::Library(library) => {
                if visitor.visit_library(library) {
                    for dataset in &library.datasets {
                        for example in &dataset.examples {
                            example.expression.visit(visitor);
                        }
                    }
                }
            }
            Input::PermissionRule(rule) => {
                if visitor.visit_permission_rule(rule) {
                    rule.principal.visit(visitor);
                    for function in [&rule.query, &rule.action] {
                        if let PermissionFunction::Specified { filter, .. } = function {
                            filter.visit(visitor);
                        }
                    }
                }
            }
            Input::DialogueState(state) => {
                if visitor.visit_dialogue_state(state) {
                    for stmt in &state.statements {
                        stmt.visit(visitor);
                    }
                }
            }
            Input::ControlCommand(command) => {
                if visitor.visit_control_command(command) {
                    if let ControlIntent::Answer(value) = &command.intent {
                        value.visit(visitor);
                    }
                }
            }
        }
        visitor.exit(NodeRef::Input(self));
    }
}

impl Statement {
    pub fn visit(&self, visitor: &mut dyn Visitor) {
        visitor.enter(NodeRef::Statement(self));
        match self {
            Statement::FunctionDeclaration(decl) => {
                if visitor.visit_function_declaration(decl) {
                    for stmt in &decl.body {
                        stmt.visit(visitor);
                    }
                }
            }
            Statement::Assignment(assign) => {
                if visitor.visit_assignment(assign) {
                    assign.value.visit(visitor);
                }
            }
            Statement::Expression(stmt) => {
                if visitor.visit_expression_statement(stmt) {
                    stmt.expression.visit(visitor);
                }
            }
            Statement::Rule(rule) => {
                if visitor.visit_rule(rule) {
                    rule.stream.visit(visitor);
                    for action in &rule.actions {
                        action.visit(visitor);
                    }
                }
            }
            Statement::Command(command) => {
                if visitor.visit_command(command) {
                    if let Some(table) = &command.table {
                        table.visit(visitor);
                    }
                    for action in &command.actions {
                        action.visit(visitor);
                    }
                }
            }
        }
        visitor.exit(NodeRef::Statement(self));
    }
}

fn visit_in_params(params: &[InputParam], visitor: &mut dyn Visitor) {
    for param in params {
        param.value.visit(visitor);
    }
}

impl Expression {
    pub fn visit(&self, visitor: &mut dyn Visitor) {
        visitor.enter(NodeRef::Expression(self));
        match self {
            Expression::Invocation(invocation) => {
                if visitor.visit_invocation(invocation) {
                    if let Some(principal) = &invocation.selector.principal {
                        principal.visit(visitor);
                    }
                    visit_in_params(&invocation.in_params, visitor);
                }
            }
            Expression::FunctionCall(call) => {
                if visitor.visit_function_call(call) {
                    visit_in_params(&call.in_params, visitor);
                }
            }
            Expression::Filter(e) => {
                if visitor.visit_filter_expression(e) {
                    e.inner.visit(visitor);
                    e.filter.visit(visitor);
                }
            }
            Expression::Projection(e) => {
                if visitor.visit_projection(e) {
                    e.inner.visit(visitor);
                }
            }
            Expression::Sort(e) => {
                if visitor.visit_sort(e) {
                    e.inner.visit(visitor);
                }
            }
            Expression::Index(e) => {
                if visitor.visit_index(e) {
                    e.inner.visit(visitor);
                    for index in &e.indices {
                        index.visit(visitor);
                    }
                }
            }
            Expression::Slice(e) => {
                if visitor.visit_slice(e) {
                    e.inner.visit(visitor);
                    e.base.visit(visitor);
                    e.limit.visit(visitor);
                }
            }
            Expression::Aggregation(e) => {
                if visitor.visit_aggregation(e) {
                    e.inner.visit(visitor);
                }
            }
            Expression::Alias(e) => {
                if visitor.visit_alias(e) {
                    e.inner.visit(visitor);
                }
            }
            Expression::Monitor(e) => {
                if visitor.visit_monitor(e) {
                    e.inner.visit(visitor);
                }
            }
            Expression::EdgeFilter(e) => {
                if visitor.visit_edge_filter(e) {
                    e.inner.visit(visitor);
                    e.filter.visit(visitor);
                }
            }
            Expression::EdgeNew(e) => {
                if visitor.visit_edge_new(e) {
                    e.inner.visit(visitor);
                }
            }
            Expression::Timer(e) => {
                if visitor.visit_timer(e) {
                    e.interval.visit(visitor);
                    if let Some(frequency) = &e.frequency {
                        frequency.visit(visitor);
                    }
                }
            }
            Expression::AtTimer(e) => {
                if visitor.visit_attimer(e) {
                    for time in &e.times {
                        time.visit(visitor);
                    }
                }
            }
            Expression::Chain(e) => {
                if visitor.visit_chain(e) {
                    for expr in &e.expressions {
                        expr.visit(visitor);
                    }
                }
            }
        }
        visitor.exit(NodeRef::Expression(self));
    }
}

impl BooleanExpression {
    pub fn visit(&self, visitor: &mut dyn Visitor) {
        visitor.enter(NodeRef::Boolean(self));
        match self {
            BooleanExpression::True => {
                visitor.visit_boolean_constant(true);
            }
            BooleanExpression::False => {
                visitor.visit_boolean_constant(false);
            }
            BooleanExpression::Atom { name, op, value } => {
                if visitor.visit_atom(name, op, value) {
                    value.visit(visitor);
                }
            }
            BooleanExpression::Not(inner) => {
                if visitor.visit_not(inner) {
                    inner.visit(visitor);
                }
            }
            BooleanExpression::And(operands) => {
                if visitor.visit_and(operands) {
                    for operand in operands {
                        operand.visit(visitor);
                    }
                }
            }
            BooleanExpression::Or(operands) => {
                if visitor.visit_or(operands) {
                    for operand in operands {
                        operand.visit(visitor);
                    }
                }
            }
            BooleanExpression::DontCare { name } => {
                visitor.visit_dont_care(name);
            }
            BooleanExpression::Compute { lhs, op, rhs } => {
                if visitor.visit_compute_boolean(lhs, op, rhs) {
                    lhs.visit(visitor);
                    rhs.visit(visitor);
                }
            }
            BooleanExpression::ExistentialSubquery(query) => {
                if visitor.visit_existential_subquery(query) {
                    query.visit(visitor);
                }
            }
            BooleanExpression::ComparisonSubquery { lhs, op, query } => {
                if visitor.visit_comparison_subquery(lhs, op, query) {
                    lhs.visit(visitor);
                    query.visit(visitor);
                }
            }
            BooleanExpression::PropertyPath { path, op, value } => {
                if visitor.visit_property_path(path, op, value) {
                    value.visit(visitor);
                }
            }
            BooleanExpression::External { class_name, channel, in_params, filter } => {
                if visitor.visit_external(class_name, channel) {
                    visit_in_params(in_params, visitor);
                    filter.visit(visitor);
                }
            }
        }
        visitor.exit(NodeRef::Boolean(self));
    }
}

impl Value {
    pub fn visit(&self, visitor: &mut dyn Visitor) {
        visitor.enter(NodeRef::Value(self));
        if visitor.visit_value(self) {
            match self {
                Value::Computation { operands, .. } => {
                    for operand in operands {
                        operand.visit(visitor);
                    }
                }
                Value::ArrayField { value, .. } => value.visit(visitor),
                Value::Filter { value, filter } => {
                    value.visit(visitor);
                    filter.visit(visitor);
                }
                Value::Array(elements) => {
                    for element in elements {
                        element.visit(visitor);
                    }
                }
                Value::Object(fields) | Value::ArgMap(fields) => {
                    for field in fields.values() {
                        field.visit(visitor);
                    }
                }
                _ => {}
            }
        }
        visitor.exit(NodeRef::Value(self));
    }
}

// ── Slot iteration ──

/// Which construct a value slot lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    InputParam,
    FilterValue,
    Index,
    SliceBase,
    SliceLimit,
    TimerInterval,
    TimerFrequency,
    AtTimerTime,
    Principal,
    Answer,
}

/// One site that may hold an unresolved or undefined value.
#[derive(Debug, Clone, Copy)]
pub struct ValueSlot<'a> {
    /// The signature of the function the slot belongs to, if known.
    pub schema: Option<&'a FunctionDef>,
    /// The parameter or field name the slot fills.
    pub name: &'a str,
    pub value: &'a Value,
    pub kind: SlotKind,
}

/// An item yielded by [`Input::iterate_slots2`]: a device selector or a
/// value slot.
#[derive(Debug, Clone, Copy)]
pub enum Slot<'a> {
    Device(&'a Selector),
    Value(ValueSlot<'a>),
}

struct SlotCollector<'a> {
    slots: Vec<Slot<'a>>,
    schema_stack: Vec<Option<&'a FunctionDef>>,
}

impl<'a> SlotCollector<'a> {
    fn new() -> Self {
        Self { slots: Vec::new(), schema_stack: vec![None] }
    }

    fn current_schema(&self) -> Option<&'a FunctionDef> {
        self.schema_stack.last().copied().flatten()
    }

    fn push_value(&mut self, name: &'a str, value: &'a Value, kind: SlotKind) {
        self.slots.push(Slot::Value(ValueSlot {
            schema: self.current_schema(),
            name,
            value,
            kind,
        }));
    }

    fn collect_expression(&mut self, expr: &'a Expression) {
        match expr {
            Expression::Invocation(invocation) => {
                self.slots.push(Slot::Device(&invocation.selector));
                if let Some(principal) = &invocation.selector.principal {
                    self.push_value("principal", principal, SlotKind::Principal);
                }
                self.schema_stack.push(invocation.schema.as_deref());
                for param in &invocation.in_params {
                    self.push_value(&param.name, &param.value, SlotKind::InputParam);
                }
                self.schema_stack.pop();
            }
            Expression::FunctionCall(call) => {
                self.schema_stack.push(call.schema.as_deref());
                for param in &call.in_params {
                    self.push_value(&param.name, &param.value, SlotKind::InputParam);
                }
                self.schema_stack.pop();
            }
            Expression::Filter(e) => {
                self.collect_expression(&e.inner);
                self.schema_stack.push(e.schema.as_deref());
                self.collect_filter(&e.filter);
                self.schema_stack.pop();
            }
            Expression::Projection(e) => self.collect_expression(&e.inner),
            Expression::Sort(e) => self.collect_expression(&e.inner),
            Expression::Index(e) => {
                self.collect_expression(&e.inner);
                self.schema_stack.push(e.schema.as_deref());
                for index in &e.indices {
                    self.push_value("index", index, SlotKind::Index);
                }
                self.schema_stack.pop();
            }
            Expression::Slice(e) => {
                self.collect_expression(&e.inner);
                self.schema_stack.push(e.schema.as_deref());
                self.push_value("base", &e.base, SlotKind::SliceBase);
                self.push_value("limit", &e.limit, SlotKind::SliceLimit);
                self.schema_stack.pop();
            }
            Expression::Aggregation(e) => self.collect_expression(&e.inner),
            Expression::Alias(e) => self.collect_expression(&e.inner),
            Expression::Monitor(e) => self.collect_expression(&e.inner),
            Expression::EdgeFilter(e) => {
                self.collect_expression(&e.inner);
                self.schema_stack.push(e.schema.as_deref());
                self.collect_filter(&e.filter);
                self.schema_stack.pop();
            }
            Expression::EdgeNew(e) => self.collect_expression(&e.inner),
            Expression::Timer(e) => {
                self.schema_stack.push(e.schema.as_deref());
                self.push_value("interval", &e.interval, SlotKind::TimerInterval);
                if let Some(frequency) = &e.frequency {
                    self.push_value("frequency", frequency, SlotKind::TimerFrequency);
                }
                self.schema_stack.pop();
            }
            Expression::AtTimer(e) => {
                self.schema_stack.push(e.schema.as_deref());
                for time in &e.times {
                    self.push_value("time", time, SlotKind::AtTimerTime);
                }
                self.schema_stack.pop();
            }
            Expression::Chain(e) => {
                for expr in &e.expressions {
                    self.collect_expression(expr);
                }
            }
        }
    }

    fn collect_filter(&mut self, filter: &'a BooleanExpression) {
        match filter {
            BooleanExpression::True
            | BooleanExpression::False
            | BooleanExpression::DontCare { .. } => {}
            BooleanExpression::Atom { name, value, .. } => {
                self.push_value(name, value, SlotKind::FilterValue);
            }
            BooleanExpression::Not(inner) => self.collect_filter(inner),
            BooleanExpression::And(operands) | BooleanExpression::Or(operands) => {
                for operand in operands {
                    self.collect_filter(operand);
                }
            }
            BooleanExpression::Compute { lhs, rhs, .. } => {
                self.push_value("lhs", lhs, SlotKind::FilterValue);
                self.push_value("rhs", rhs, SlotKind::FilterValue);
            }
            BooleanExpression::ExistentialSubquery(query) => self.collect_expression(query),
            BooleanExpression::ComparisonSubquery { lhs, query, .. } => {
                self.push_value("lhs", lhs, SlotKind::FilterValue);
                self.collect_expression(query);
            }
            BooleanExpression::PropertyPath { path, value, .. } => {
                self.push_value(&path[0], value, SlotKind::FilterValue);
            }
            BooleanExpression::External { in_params, filter, .. } => {
                for param in in_params {
                    self.push_value(&param.name, &param.value, SlotKind::InputParam);
                }
                self.collect_filter(filter);
            }
        }
    }

    fn collect_statement(&mut self, stmt: &'a Statement) {
        match stmt {
            Statement::FunctionDeclaration(decl) => {
                for stmt in &decl.body {
                    self.collect_statement(stmt);
                }
            }
            Statement::Assignment(assign) => self.collect_expression(&assign.value),
            Statement::Expression(stmt) => self.collect_expression(&stmt.expression),
            Statement::Rule(rule) => {
                self.collect_expression(&rule.stream);
                for action in &rule.actions {
                    self.collect_expression(action);
                }
            }
            Statement::Command(command) => {
                if let Some(table) = &command.table {
                    self.collect_expression(table);
                }
                for action in &command.actions {
                    self.collect_expression(action);
                }
            }
        }
    }

    fn collect_input(&mut self, input: &'a Input) {
        match input {
            Input::Program(program) => {
                if let Some(principal) = &program.principal {
                    self.push_value("executor", principal, SlotKind::Principal);
                }
                for decl in &program.declarations {
                    for stmt in &decl.body {
                        self.collect_statement(stmt);
                    }
                }
                for stmt in &program.statements {
                    self.collect_statement(stmt);
                }
            }
            Input::Library(library) => {
                for dataset in &library.datasets {
                    for example in &dataset.examples {
                        self.collect_expression(&example.expression);
                    }
                }
            }
            Input::PermissionRule(rule) => {
                self.collect_filter(&rule.principal);
                for function in [&rule.query, &rule.action] {
                    if let PermissionFunction::Specified { filter, schema, .. } = function {
                        self.schema_stack.push(schema.as_deref());
                        self.collect_filter(filter);
                        self.schema_stack.pop();
                    }
                }
            }
            Input::DialogueState(state) => {
                for stmt in &state.statements {
                    self.collect_statement(stmt);
                }
            }
            Input::ControlCommand(command) => {
                if let ControlIntent::Answer(value) = &command.intent {
                    self.push_value("answer", value, SlotKind::Answer);
                }
            }
        }
    }
}

impl Input {
    /// Enumerate every value slot in the input, in source order.
    pub fn iterate_slots(&self) -> Vec<ValueSlot<'_>> {
        self.iterate_slots2()
            .into_iter()
            .filter_map(|slot| match slot {
                Slot::Value(slot) => Some(slot),
                Slot::Device(_) => None,
            })
            .collect()
    }

    /// Like [`iterate_slots`](Self::iterate_slots), additionally yielding
    /// the device selectors encountered.
    pub fn iterate_slots2(&self) -> Vec<Slot<'_>> {
        let mut collector = SlotCollector::new();
        collector.collect_input(self);
        collector.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse;

    #[derive(Default)]
    struct Counter {
        invocations: usize,
        atoms: usize,
        values: usize,
        enters: usize,
        exits: usize,
        prune_filters: bool,
    }

    impl Visitor for Counter {
        fn enter(&mut self, _node: NodeRef<'_>) {
            self.enters += 1;
        }
        fn exit(&mut self, _node: NodeRef<'_>) {
            self.exits += 1;
        }
        fn visit_invocation(&mut self, _: &Invocation) -> bool {
            self.invocations += 1;
            true
        }
        fn visit_atom(&mut self, _: &str, _: &str, _: &Value) -> bool {
            self.atoms += 1;
            true
        }
        fn visit_filter_expression(&mut self, _: &FilterExpression) -> bool {
            !self.prune_filters
        }
        fn visit_value(&mut self, _: &Value) -> bool {
            self.values += 1;
            true
        }
    }

    #[test]
    fn test_visitor_counts_nodes() {
        let input = parse(
            "@com.weather.current() filter temperature > 20C => @com.x.alert(message=\"hi\");",
        )
        .unwrap();
        let mut counter = Counter::default();
        input.visit(&mut counter);
        assert_eq!(counter.invocations, 2);
        assert_eq!(counter.atoms, 1);
        // 20C and "hi"
        assert_eq!(counter.values, 2);
        assert_eq!(counter.enters, counter.exits);
    }

    #[test]
    fn test_visitor_prunes_subtree() {
        let input = parse(
            "@com.weather.current() filter temperature > 20C => @com.x.alert(message=\"hi\");",
        )
        .unwrap();
        let mut counter = Counter { prune_filters: true, ..Default::default() };
        input.visit(&mut counter);
        // The whole filter subtree is skipped, including its invocation.
        assert_eq!(counter.invocations, 1);
        assert_eq!(counter.atoms, 0);
    }

    #[test]
    fn test_slot_enumeration_visits_each_undefined_once() {
        let input = parse(
            "@com.a.q(x=$?, y=$undefined) filter z == $? => @com.b.act(w=$?);",
        )
        .unwrap();
        let slots = input.iterate_slots();
        let undefined: Vec<_> = slots
            .iter()
            .filter(|slot| matches!(slot.value, Value::Undefined { .. }))
            .collect();
        assert_eq!(undefined.len(), 4);
    }

    #[test]
    fn test_slots2_yields_selectors() {
        let input = parse("@com.a.q() => @com.b.act();").unwrap();
        let slots = input.iterate_slots2();
        let devices: Vec<_> =
            slots.iter().filter(|slot| matches!(slot, Slot::Device(_))).collect();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn test_slot_kinds() {
        let input = parse("timer(interval=1h) => notify;").unwrap();
        let slots = input.iterate_slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].kind, SlotKind::TimerInterval);
        assert_eq!(slots[0].name, "interval");
    }
}
