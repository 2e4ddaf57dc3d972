//! AST → IR lowering. Converts a type-checked, optimized input into a
//! register IR module with explicit suspension points.

use crate::compiler::ast::*;
use crate::compiler::schema::{FunctionDef, FunctionKind};
use crate::compiler::values::{DateEdge, DateValue, Location, TimeValue, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use tt_core::ir::{
    BinaryOpcode, Instruction, IrConstant, IrModule, Label, Register, UnaryOpcode,
};

#[derive(Debug, Error)]
pub enum IrError {
    #[error("cannot compile untyped {construct}; run the type checker first")]
    Untyped { construct: String },
    #[error("{construct} is not implemented by the IR compiler")]
    NotImplemented { construct: String },
    #[error("internal compiler error: {0}")]
    Internal(String),
}

/// Class name used for the builtin timer streams.
const BUILTIN_CLASS: &str = "org.tt.builtin";

/// Compile a type-checked, optimized program or permission rule. `source`
/// is only hashed into the module header.
pub fn compile_ir(input: &Input, source: &str) -> Result<IrModule, IrError> {
    let source_hash = format!("sha256:{:x}", Sha256::digest(source.as_bytes()));
    let mut lowerer = Lowerer::new();
    match input {
        Input::Program(program) => lowerer.lower_program(program)?,
        Input::PermissionRule(rule) => lowerer.lower_permission_rule(rule)?,
        Input::Library(_) => {
            return Err(IrError::NotImplemented { construct: "library compilation".into() })
        }
        Input::DialogueState(_) => {
            return Err(IrError::NotImplemented { construct: "dialogue state".into() })
        }
        Input::ControlCommand(_) => {
            return Err(IrError::NotImplemented { construct: "control command".into() })
        }
    }
    let registers = lowerer.builder.next_reg;
    let root = lowerer.builder.finish();
    Ok(IrModule::new(source_hash, registers, root))
}

/// Register and label allocation plus the block stack. Blocks are pushed
/// on entry and popped on exit; instructions always append to the
/// innermost open block.
struct IrBuilder {
    next_reg: u32,
    next_label: u32,
    blocks: Vec<Vec<Instruction>>,
}

impl IrBuilder {
    fn new() -> Self {
        Self { next_reg: 0, next_label: 0, blocks: vec![Vec::new()] }
    }

    fn alloc(&mut self) -> Register {
        let reg = Register(self.next_reg);
        self.next_reg += 1;
        reg
    }

    fn alloc_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn push(&mut self, instr: Instruction) {
        self.blocks.last_mut().expect("open block").push(instr);
    }

    fn enter(&mut self) {
        self.blocks.push(Vec::new());
    }

    fn exit(&mut self) -> Instruction {
        Instruction::Block(self.blocks.pop().expect("open block"))
    }

    fn finish(mut self) -> Instruction {
        Instruction::Block(self.blocks.pop().expect("root block"))
    }
}

type Cont<'c> = &'c mut dyn FnMut(&mut Lowerer) -> Result<(), IrError>;

struct Lowerer {
    builder: IrBuilder,
    /// Named outputs of the enclosing chain stages.
    scope: HashMap<String, Register>,
    /// Register holding the current row tuple, if any.
    current_row: Option<Register>,
    table_count: usize,
}

impl Lowerer {
    fn new() -> Self {
        Self {
            builder: IrBuilder::new(),
            scope: HashMap::new(),
            current_row: None,
            table_count: 0,
        }
    }

    fn fresh_table(&mut self) -> String {
        let table = format!("_t{}", self.table_count);
        self.table_count += 1;
        table
    }

    // ── Inputs ──

    fn lower_program(&mut self, program: &Program) -> Result<(), IrError> {
        for (index, stmt) in program.statements.iter().enumerate() {
            self.scope.clear();
            self.current_row = None;
            self.builder.enter();
            let result = self.lower_statement(stmt);
            let body = self.builder.exit();
            result?;
            self.builder.push(Instruction::TryCatch {
                body: Box::new(body),
                message: format!("Failed to execute statement {}", index + 1),
            });
        }
        if let Some(principal) = &program.principal {
            self.builder
                .push(Instruction::SendEndOfFlow { principal: principal.to_string() });
        }
        Ok(())
    }

    fn lower_statement(&mut self, stmt: &Statement) -> Result<(), IrError> {
        match stmt {
            Statement::Expression(stmt) => {
                self.lower_rows(&stmt.expression, &mut |_| Ok(()))?;
                if !stmt.expression.is_monitor_like() {
                    // Commands re-query on the next execution.
                    self.builder.push(Instruction::ClearGetCache);
                }
                Ok(())
            }
            Statement::Assignment(assign) => {
                let table = assign.name.clone();
                self.lower_rows(&assign.value, &mut |l| {
                    let row = l.current_row.ok_or_else(|| {
                        IrError::Internal("assignment of a rowless expression".into())
                    })?;
                    l.builder.push(Instruction::InvokeSave { table: table.clone(), value: row });
                    Ok(())
                })?;
                self.builder.push(Instruction::ClearGetCache);
                Ok(())
            }
            // Declarations have no runtime effect of their own; their
            // bodies run when invoked.
            Statement::FunctionDeclaration(_) => Ok(()),
            Statement::Rule(rule) => {
                let canonical = rule.to_expression_statement();
                self.lower_statement(&Statement::Expression(canonical))
            }
            Statement::Command(command) => {
                let canonical = command.to_expression_statement();
                self.lower_statement(&Statement::Expression(canonical))
            }
        }
    }

    // ── Tables and streams ──

    /// Lower an expression producing rows; `then` is invoked once with the
    /// row bindings in scope to emit the per-row continuation.
    fn lower_rows(&mut self, expr: &Expression, then: Cont<'_>) -> Result<(), IrError> {
        match expr {
            Expression::Invocation(inv) => self.lower_invocation(inv, then),
            Expression::FunctionCall(call) => self.lower_function_call(call, then),
            Expression::Monitor(e) => self.lower_monitor(&e.inner, then),
            Expression::Filter(e) => self.lower_rows(&e.inner, &mut |l| {
                let cond = l.lower_filter(&e.filter)?;
                l.builder.enter();
                let result = then(l);
                let body = l.builder.exit();
                result?;
                l.builder.push(Instruction::If {
                    cond,
                    then_body: Box::new(body),
                    else_body: Box::new(Instruction::Block(Vec::new())),
                });
                Ok(())
            }),
            Expression::Alias(e) => self.lower_rows(&e.inner, then),
            Expression::EdgeFilter(e) => self.lower_rows(&e.inner, &mut |l| {
                // The edge state (last predicate value) is kept by the
                // environment; the gate fires on a false-to-true transition.
                let cond = l.lower_filter(&e.filter)?;
                let state = l.builder.alloc();
                l.builder.push(Instruction::GetEnvironment { dst: state, name: "state".into() });
                let edge = l.builder.alloc();
                l.builder.push(Instruction::BinaryFunctionOp {
                    dst: edge,
                    func: "became_true".into(),
                    lhs: state,
                    rhs: cond,
                });
                l.builder.enter();
                let result = then(l);
                let body = l.builder.exit();
                result?;
                l.builder.push(Instruction::If {
                    cond: edge,
                    then_body: Box::new(body),
                    else_body: Box::new(Instruction::Block(Vec::new())),
                });
                Ok(())
            }),
            Expression::EdgeNew(e) => self.lower_rows(&e.inner, &mut |l| {
                let row = l.current_row.ok_or_else(|| {
                    IrError::Internal("edge over a rowless stream".into())
                })?;
                let state = l.builder.alloc();
                l.builder.push(Instruction::GetEnvironment { dst: state, name: "state".into() });
                let fresh = l.builder.alloc();
                l.builder.push(Instruction::BinaryFunctionOp {
                    dst: fresh,
                    func: "is_new_tuple".into(),
                    lhs: state,
                    rhs: row,
                });
                l.builder.enter();
                let result = then(l);
                let body = l.builder.exit();
                result?;
                l.builder.push(Instruction::If {
                    cond: fresh,
                    then_body: Box::new(body),
                    else_body: Box::new(Instruction::Block(Vec::new())),
                });
                Ok(())
            }),
            Expression::Projection(e) => {
                let kind = "project".to_string();
                self.lower_materialized(&e.inner, expr.schema(), kind, e.args.clone(), then)
            }
            Expression::Sort(e) => {
                let kind = format!("sort {}", e.direction);
                self.lower_materialized(&e.inner, expr.schema(), kind, vec![e.field.clone()], then)
            }
            Expression::Index(e) => {
                // Taking the first result is a plain early exit.
                if e.indices == vec![Value::Number(1.0)] {
                    return self.lower_rows(&e.inner, &mut |l| {
                        then(l)?;
                        l.builder.push(Instruction::Break);
                        Ok(())
                    });
                }
                let params = e.indices.iter().map(Value::to_string).collect();
                self.lower_materialized(&e.inner, expr.schema(), "index".into(), params, then)
            }
            Expression::Slice(e) => {
                let params = vec![e.base.to_string(), e.limit.to_string()];
                self.lower_materialized(&e.inner, expr.schema(), "slice".into(), params, then)
            }
            Expression::Aggregation(e) => {
                let kind = format!("aggregate {}", e.operator);
                let params = e.field.iter().cloned().collect();
                self.lower_materialized(&e.inner, expr.schema(), kind, params, then)
            }
            Expression::Timer(e) => {
                let tuple = self.builder.alloc();
                self.builder.push(Instruction::CreateTuple { dst: tuple, size: 2 });
                let interval = self.lower_value(&e.interval)?;
                self.builder.push(Instruction::SetIndex {
                    obj: tuple,
                    index: IrConstant::String("interval".into()),
                    value: interval,
                });
                if let Some(frequency) = &e.frequency {
                    let frequency = self.lower_value(frequency)?;
                    self.builder.push(Instruction::SetIndex {
                        obj: tuple,
                        index: IrConstant::String("frequency".into()),
                        value: frequency,
                    });
                }
                self.lower_trigger(BUILTIN_CLASS, "timer", tuple, expr.schema(), then)
            }
            Expression::AtTimer(e) => {
                let times = self.builder.alloc();
                self.builder
                    .push(Instruction::CreateTuple { dst: times, size: e.times.len() });
                for (i, time) in e.times.iter().enumerate() {
                    let time = self.lower_value(time)?;
                    self.builder.push(Instruction::SetIndex {
                        obj: times,
                        index: IrConstant::Number(i as f64),
                        value: time,
                    });
                }
                let tuple = self.builder.alloc();
                self.builder.push(Instruction::CreateTuple { dst: tuple, size: 1 });
                self.builder.push(Instruction::SetIndex {
                    obj: tuple,
                    index: IrConstant::String("time".into()),
                    value: times,
                });
                self.lower_trigger(BUILTIN_CLASS, "attimer", tuple, expr.schema(), then)
            }
            Expression::Chain(e) => self.lower_chain(&e.expressions, then),
        }
    }

    fn lower_chain(&mut self, exprs: &[Expression], then: Cont<'_>) -> Result<(), IrError> {
        match exprs {
            [] => then(self),
            [head, rest @ ..] => self.lower_rows(head, &mut |l| l.lower_chain(rest, then)),
        }
    }

    fn lower_invocation(&mut self, inv: &Invocation, then: Cont<'_>) -> Result<(), IrError> {
        let schema = inv.schema.as_deref().ok_or_else(|| IrError::Untyped {
            construct: format!("invocation of @{}.{}", inv.selector.class_name, inv.channel),
        })?;
        let tuple = self.lower_param_tuple(&inv.in_params)?;
        let class_name = inv.selector.class_name.clone();
        let channel = inv.channel.clone();
        match schema.kind {
            FunctionKind::Action => {
                let dst = self.builder.alloc();
                self.builder.push(Instruction::InvokeAction {
                    dst,
                    class_name,
                    channel,
                    params: tuple,
                });
                then(self)
            }
            FunctionKind::Query => {
                let result = self.builder.alloc();
                self.builder.push(Instruction::InvokeQuery {
                    dst: result,
                    class_name,
                    channel,
                    params: tuple,
                });
                self.for_each_row(result, schema, then)
            }
            FunctionKind::Stream => {
                let class = inv.selector.class_name.clone();
                self.async_iterate(tuple, class, inv.channel.clone(), schema, then)
            }
        }
    }

    fn lower_function_call(&mut self, call: &FunctionCall, then: Cont<'_>) -> Result<(), IrError> {
        if call.is_notify() {
            let row = match self.current_row {
                Some(row) => row,
                None => {
                    let empty = self.builder.alloc();
                    self.builder.push(Instruction::CreateTuple { dst: empty, size: 0 });
                    empty
                }
            };
            let formatted = self.builder.alloc();
            self.builder.push(Instruction::FormatEvent { dst: formatted, params: row });
            self.builder
                .push(Instruction::InvokeOutput { channel: "notify".into(), params: formatted });
            return then(self);
        }
        let schema = call.schema.as_deref().ok_or_else(|| IrError::Untyped {
            construct: format!("call to {}", call.name),
        })?;
        // Declared functions and assignments are materialized tables; a
        // call reads them back from memory.
        let table = call.name.clone();
        let agg = self.builder.alloc();
        self.builder.push(Instruction::CreateAggregation {
            dst: agg,
            table: table.clone(),
            kind: "scan".into(),
            params: Vec::new(),
        });
        let version = self.builder.alloc();
        self.builder
            .push(Instruction::GetTableVersion { dst: version, table: table.clone() });
        let result = self.builder.alloc();
        self.builder
            .push(Instruction::InvokeMemoryQuery { dst: result, table, aggregation: agg });
        self.for_each_row(result, schema, then)
    }

    fn lower_monitor(&mut self, inner: &Expression, then: Cont<'_>) -> Result<(), IrError> {
        match inner {
            Expression::Invocation(inv) => {
                let schema = inv.schema.as_deref().ok_or_else(|| IrError::Untyped {
                    construct: format!(
                        "monitor of @{}.{}",
                        inv.selector.class_name, inv.channel
                    ),
                })?;
                let tuple = self.lower_param_tuple(&inv.in_params)?;
                let class = inv.selector.class_name.clone();
                self.async_iterate(tuple, class, inv.channel.clone(), schema, then)
            }
            Expression::Filter(e) => self.lower_monitor(&e.inner, &mut |l| {
                let cond = l.lower_filter(&e.filter)?;
                l.builder.enter();
                let result = then(l);
                let body = l.builder.exit();
                result?;
                l.builder.push(Instruction::If {
                    cond,
                    then_body: Box::new(body),
                    else_body: Box::new(Instruction::Block(Vec::new())),
                });
                Ok(())
            }),
            Expression::Projection(e) => self.lower_monitor(&e.inner, then),
            Expression::Alias(e) => self.lower_monitor(&e.inner, then),
            other => Err(IrError::NotImplemented {
                construct: format!("monitor of {} expression", expression_kind(other)),
            }),
        }
    }

    /// Invoke a trigger and step through its batches with an async-while
    /// inside a labeled loop.
    fn async_iterate(
        &mut self,
        params: Register,
        class_name: String,
        channel: String,
        schema: &FunctionDef,
        then: Cont<'_>,
    ) -> Result<(), IrError> {
        let iterator = self.builder.alloc();
        self.builder.push(Instruction::InvokeTrigger {
            dst: iterator,
            class_name,
            channel,
            params,
        });
        let label = self.builder.alloc_label();
        let row = self.builder.alloc();
        self.builder.enter();
        {
            self.builder.enter();
            self.bind_outputs(schema, row);
            let result = then(self);
            let body = self.builder.exit();
            result?;
            self.builder.push(Instruction::AsyncWhile {
                result: row,
                iterator,
                body: Box::new(body),
            });
            self.builder.push(Instruction::LabeledBreak(label));
        }
        let loop_body = self.builder.exit();
        self.builder.push(Instruction::LabeledLoop { label, body: Box::new(loop_body) });
        Ok(())
    }

    fn for_each_row(
        &mut self,
        result: Register,
        schema: &FunctionDef,
        then: Cont<'_>,
    ) -> Result<(), IrError> {
        let row = self.builder.alloc();
        self.builder.enter();
        self.bind_outputs(schema, row);
        let cont = then(self);
        let body = self.builder.exit();
        cont?;
        self.builder.push(Instruction::ForOf {
            element: row,
            iterable: result,
            body: Box::new(body),
        });
        Ok(())
    }

    fn bind_outputs(&mut self, schema: &FunctionDef, row: Register) {
        self.current_row = Some(row);
        for arg in schema.out_params() {
            let dst = self.builder.alloc();
            self.builder.push(Instruction::GetIndex {
                dst,
                obj: row,
                index: IrConstant::String(arg.name.clone()),
            });
            self.scope.insert(arg.name.clone(), dst);
        }
    }

    fn lower_param_tuple(&mut self, in_params: &[InputParam]) -> Result<Register, IrError> {
        let tuple = self.builder.alloc();
        self.builder.push(Instruction::CreateTuple { dst: tuple, size: in_params.len() });
        for param in in_params {
            if matches!(param.value, Value::Undefined { .. }) {
                continue;
            }
            let value = self.lower_value(&param.value)?;
            self.builder.push(Instruction::SetIndex {
                obj: tuple,
                index: IrConstant::String(param.name.clone()),
                value,
            });
        }
        Ok(tuple)
    }

    /// Materialize the inner rows into an opaque table, then run an
    /// aggregation over it through the memory layer.
    fn lower_materialized(
        &mut self,
        inner: &Expression,
        schema: Option<&FunctionDef>,
        kind: String,
        params: Vec<String>,
        then: Cont<'_>,
    ) -> Result<(), IrError> {
        let schema = schema.ok_or_else(|| IrError::Untyped {
            construct: format!("{} expression", kind),
        })?;
        let table = self.fresh_table();
        let save_table = table.clone();
        self.lower_rows(inner, &mut |l| {
            let row = l.current_row.ok_or_else(|| {
                IrError::Internal("materialization of a rowless expression".into())
            })?;
            l.builder
                .push(Instruction::InvokeSave { table: save_table.clone(), value: row });
            Ok(())
        })?;
        let agg = self.builder.alloc();
        self.builder.push(Instruction::CreateAggregation {
            dst: agg,
            table: table.clone(),
            kind,
            params,
        });
        let version = self.builder.alloc();
        self.builder
            .push(Instruction::GetTableVersion { dst: version, table: table.clone() });
        let result = self.builder.alloc();
        self.builder
            .push(Instruction::InvokeMemoryQuery { dst: result, table, aggregation: agg });
        let schema = schema.clone();
        self.for_each_row(result, &schema, then)
    }

    // ── Filters ──

    fn lower_filter(&mut self, filter: &BooleanExpression) -> Result<Register, IrError> {
        match filter {
            BooleanExpression::True => self.load(IrConstant::Boolean(true)),
            BooleanExpression::False => self.load(IrConstant::Boolean(false)),
            BooleanExpression::DontCare { .. } => self.load(IrConstant::Boolean(true)),
            BooleanExpression::Atom { name, op, value } => {
                let lhs = self.variable(name);
                let rhs = self.lower_value(value)?;
                self.lower_comparison(op, lhs, rhs)
            }
            BooleanExpression::Not(inner) => {
                let operand = self.lower_filter(inner)?;
                let dst = self.builder.alloc();
                self.builder.push(Instruction::UnaryOp {
                    dst,
                    op: UnaryOpcode::Not,
                    operand,
                });
                Ok(dst)
            }
            BooleanExpression::And(operands) => {
                self.lower_combinator(operands, BinaryOpcode::And, true)
            }
            BooleanExpression::Or(operands) => {
                self.lower_combinator(operands, BinaryOpcode::Or, false)
            }
            BooleanExpression::Compute { lhs, op, rhs } => {
                let lhs = self.lower_value(lhs)?;
                let rhs = self.lower_value(rhs)?;
                self.lower_comparison(op, lhs, rhs)
            }
            BooleanExpression::PropertyPath { path, op, value } => {
                let mut current = self.variable(&path[0]);
                for segment in &path[1..] {
                    let dst = self.builder.alloc();
                    self.builder.push(Instruction::GetIndex {
                        dst,
                        obj: current,
                        index: IrConstant::String(segment.clone()),
                    });
                    current = dst;
                }
                let rhs = self.lower_value(value)?;
                self.lower_comparison(op, current, rhs)
            }
            BooleanExpression::ExistentialSubquery(_)
            | BooleanExpression::ComparisonSubquery { .. } => Err(IrError::NotImplemented {
                construct: "subquery in a compiled filter".into(),
            }),
            BooleanExpression::External { .. } => Err(IrError::NotImplemented {
                construct: "external predicate".into(),
            }),
        }
    }

    fn lower_combinator(
        &mut self,
        operands: &[BooleanExpression],
        op: BinaryOpcode,
        empty: bool,
    ) -> Result<Register, IrError> {
        let mut acc = None;
        for operand in operands {
            let value = self.lower_filter(operand)?;
            acc = Some(match acc {
                None => value,
                Some(prev) => {
                    let dst = self.builder.alloc();
                    self.builder.push(Instruction::BinaryOp { dst, op, lhs: prev, rhs: value });
                    dst
                }
            });
        }
        match acc {
            Some(reg) => Ok(reg),
            None => self.load(IrConstant::Boolean(empty)),
        }
    }

    fn lower_comparison(
        &mut self,
        op: &str,
        lhs: Register,
        rhs: Register,
    ) -> Result<Register, IrError> {
        let dst = self.builder.alloc();
        match symbolic_opcode(op) {
            Some(opcode) => {
                self.builder.push(Instruction::BinaryOp { dst, op: opcode, lhs, rhs });
            }
            None => {
                self.builder.push(Instruction::BinaryFunctionOp {
                    dst,
                    func: op.to_string(),
                    lhs,
                    rhs,
                });
            }
        }
        Ok(dst)
    }

    // ── Values ──

    fn load(&mut self, value: IrConstant) -> Result<Register, IrError> {
        let dst = self.builder.alloc();
        self.builder.push(Instruction::LoadConstant { dst, value });
        Ok(dst)
    }

    fn variable(&mut self, name: &str) -> Register {
        if let Some(reg) = self.scope.get(name) {
            return *reg;
        }
        let dst = self.builder.alloc();
        self.builder.push(Instruction::GetVariable { dst, name: name.to_string() });
        dst
    }

    fn lower_value(&mut self, value: &Value) -> Result<Register, IrError> {
        match value {
            Value::Boolean(b) => self.load(IrConstant::Boolean(*b)),
            Value::String(s) => self.load(IrConstant::String(s.clone())),
            Value::Number(n) => self.load(IrConstant::Number(*n)),
            Value::Measure { value, unit } => {
                self.load(IrConstant::Measure { value: *value, unit: unit.clone() })
            }
            Value::Currency { value, code } => {
                self.load(IrConstant::Currency { value: *value, code: code.clone() })
            }
            Value::Enum(tag) => self.load(IrConstant::Enum(tag.clone())),
            Value::Entity { value, ty, .. } => {
                self.load(IrConstant::Entity { value: value.clone(), ty: ty.clone() })
            }
            Value::Date(DateValue::Absolute(dt)) => self.load(IrConstant::Date(*dt)),
            Value::Date(DateValue::Now) => {
                let dst = self.builder.alloc();
                self.builder.push(Instruction::GetEnvironment { dst, name: "now".into() });
                Ok(dst)
            }
            Value::Date(DateValue::Edge { edge, unit }) => {
                let now = self.builder.alloc();
                self.builder.push(Instruction::GetEnvironment { dst: now, name: "now".into() });
                let unit = self.load(IrConstant::String(unit.clone()))?;
                let dst = self.builder.alloc();
                let func = match edge {
                    DateEdge::StartOf => "start_of",
                    DateEdge::EndOf => "end_of",
                };
                self.builder.push(Instruction::BinaryFunctionOp {
                    dst,
                    func: func.into(),
                    lhs: now,
                    rhs: unit,
                });
                Ok(dst)
            }
            Value::Date(DateValue::DatePiece { .. }) => Err(IrError::NotImplemented {
                construct: "partially specified date".into(),
            }),
            Value::Time(TimeValue::Absolute { hour, minute, second }) => {
                let seconds = (hour * 3600 + minute * 60 + second) as f64;
                self.load(IrConstant::Measure { value: seconds, unit: "s".into() })
            }
            Value::Time(TimeValue::Relative(name)) => {
                let dst = self.builder.alloc();
                self.builder.push(Instruction::GetEnvironment {
                    dst,
                    name: format!("time.{}", name),
                });
                Ok(dst)
            }
            Value::Location(Location::Absolute { lat, lon, .. }) => {
                let tuple = self.builder.alloc();
                self.builder.push(Instruction::CreateTuple { dst: tuple, size: 2 });
                let lat = self.load(IrConstant::Number(*lat))?;
                self.builder.push(Instruction::SetIndex {
                    obj: tuple,
                    index: IrConstant::String("lat".into()),
                    value: lat,
                });
                let lon = self.load(IrConstant::Number(*lon))?;
                self.builder.push(Instruction::SetIndex {
                    obj: tuple,
                    index: IrConstant::String("lon".into()),
                    value: lon,
                });
                Ok(tuple)
            }
            Value::Location(Location::Relative(name)) => {
                let dst = self.builder.alloc();
                self.builder.push(Instruction::GetEnvironment {
                    dst,
                    name: format!("location.{}", name),
                });
                Ok(dst)
            }
            Value::Location(Location::Unresolved(_)) => Err(IrError::Internal(
                "unresolved location survived to compilation".into(),
            )),
            Value::Event(kind) => {
                let event = self.builder.alloc();
                self.builder
                    .push(Instruction::GetEnvironment { dst: event, name: "event".into() });
                match kind {
                    None => Ok(event),
                    Some(kind) => {
                        let dst = self.builder.alloc();
                        self.builder.push(Instruction::GetIndex {
                            dst,
                            obj: event,
                            index: IrConstant::String(kind.clone()),
                        });
                        Ok(dst)
                    }
                }
            }
            Value::VarRef { name, .. } => Ok(self.variable(name)),
            Value::ContextRef { name, .. } => {
                let dst = self.builder.alloc();
                self.builder
                    .push(Instruction::GetEnvironment { dst, name: name.clone() });
                Ok(dst)
            }
            Value::Computation { op, operands, .. } => {
                let regs = operands
                    .iter()
                    .map(|operand| self.lower_value(operand))
                    .collect::<Result<Vec<_>, _>>()?;
                match (symbolic_arith_opcode(op), regs.as_slice()) {
                    (Some(opcode), [lhs, rhs]) => {
                        let dst = self.builder.alloc();
                        self.builder.push(Instruction::BinaryOp {
                            dst,
                            op: opcode,
                            lhs: *lhs,
                            rhs: *rhs,
                        });
                        Ok(dst)
                    }
                    (_, [lhs, rhs]) => {
                        let dst = self.builder.alloc();
                        self.builder.push(Instruction::BinaryFunctionOp {
                            dst,
                            func: op.clone(),
                            lhs: *lhs,
                            rhs: *rhs,
                        });
                        Ok(dst)
                    }
                    (_, [operand]) => {
                        // Unary builtins ignore the second operand.
                        let null = self.load(IrConstant::Null)?;
                        let dst = self.builder.alloc();
                        self.builder.push(Instruction::BinaryFunctionOp {
                            dst,
                            func: op.clone(),
                            lhs: *operand,
                            rhs: null,
                        });
                        Ok(dst)
                    }
                    _ => Err(IrError::NotImplemented {
                        construct: format!("{}-ary computation", regs.len()),
                    }),
                }
            }
            Value::Array(elements) => {
                let tuple = self.builder.alloc();
                self.builder
                    .push(Instruction::CreateTuple { dst: tuple, size: elements.len() });
                for (i, element) in elements.iter().enumerate() {
                    let value = self.lower_value(element)?;
                    self.builder.push(Instruction::SetIndex {
                        obj: tuple,
                        index: IrConstant::Number(i as f64),
                        value,
                    });
                }
                Ok(tuple)
            }
            Value::Object(fields) | Value::ArgMap(fields) => {
                let tuple = self.builder.alloc();
                self.builder.push(Instruction::CreateTuple { dst: tuple, size: fields.len() });
                for (name, field) in fields {
                    let value = self.lower_value(field)?;
                    self.builder.push(Instruction::SetIndex {
                        obj: tuple,
                        index: IrConstant::String(name.clone()),
                        value,
                    });
                }
                Ok(tuple)
            }
            Value::ArrayField { .. } => Err(IrError::NotImplemented {
                construct: "array field projection value".into(),
            }),
            Value::Filter { .. } => Err(IrError::NotImplemented {
                construct: "filtered array value".into(),
            }),
            Value::Undefined { .. } => Err(IrError::Internal(
                "undefined value survived to compilation".into(),
            )),
        }
    }

    // ── Permission rules ──

    fn lower_permission_rule(&mut self, rule: &PermissionRule) -> Result<(), IrError> {
        self.builder.enter();
        let result = self.lower_permission_body(rule);
        let body = self.builder.exit();
        result?;
        self.builder.push(Instruction::TryCatch {
            body: Box::new(body),
            message: "Failed to check permission".into(),
        });
        Ok(())
    }

    fn lower_permission_body(&mut self, rule: &PermissionRule) -> Result<(), IrError> {
        let source = self.builder.alloc();
        self.builder
            .push(Instruction::GetEnvironment { dst: source, name: "source".into() });
        self.scope.insert("source".into(), source);
        let mut decision = self.lower_filter(&rule.principal)?;
        for function in [&rule.query, &rule.action] {
            if let PermissionFunction::Specified { filter, .. } = function {
                let allowed = self.lower_filter(filter)?;
                let dst = self.builder.alloc();
                self.builder.push(Instruction::BinaryOp {
                    dst,
                    op: BinaryOpcode::And,
                    lhs: decision,
                    rhs: allowed,
                });
                decision = dst;
            }
        }
        self.builder
            .push(Instruction::InvokeOutput { channel: "decision".into(), params: decision });
        Ok(())
    }

    fn lower_trigger(
        &mut self,
        class_name: &str,
        channel: &str,
        params: Register,
        schema: Option<&FunctionDef>,
        then: Cont<'_>,
    ) -> Result<(), IrError> {
        let schema = schema
            .ok_or_else(|| IrError::Untyped { construct: format!("{} stream", channel) })?
            .clone();
        self.async_iterate(params, class_name.to_string(), channel.to_string(), &schema, then)
    }
}

fn symbolic_opcode(op: &str) -> Option<BinaryOpcode> {
    match op {
        "==" => Some(BinaryOpcode::Eq),
        ">=" => Some(BinaryOpcode::Ge),
        "<=" => Some(BinaryOpcode::Le),
        ">" => Some(BinaryOpcode::Gt),
        "<" => Some(BinaryOpcode::Lt),
        _ => None,
    }
}

fn symbolic_arith_opcode(op: &str) -> Option<BinaryOpcode> {
    match op {
        "+" => Some(BinaryOpcode::Add),
        "-" => Some(BinaryOpcode::Sub),
        "*" => Some(BinaryOpcode::Mul),
        "/" => Some(BinaryOpcode::Div),
        "%" => Some(BinaryOpcode::Mod),
        "**" => Some(BinaryOpcode::Pow),
        _ => None,
    }
}

fn expression_kind(expr: &Expression) -> &'static str {
    match expr {
        Expression::Invocation(_) => "invocation",
        Expression::FunctionCall(_) => "function call",
        Expression::Filter(_) => "filter",
        Expression::Projection(_) => "projection",
        Expression::Sort(_) => "sort",
        Expression::Index(_) => "index",
        Expression::Slice(_) => "slice",
        Expression::Aggregation(_) => "aggregation",
        Expression::Alias(_) => "alias",
        Expression::Monitor(_) => "monitor",
        Expression::EdgeFilter(_) => "edge filter",
        Expression::EdgeNew(_) => "edge new",
        Expression::Timer(_) => "timer",
        Expression::AtTimer(_) => "attimer",
        Expression::Chain(_) => "chain",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::optimize::optimize_input;
    use crate::compiler::parser::parse;
    use crate::compiler::retriever::StaticSchemaRetriever;
    use crate::compiler::schema::{ArgumentDef, ClassDef, Direction};
    use crate::compiler::typecheck::typecheck;
    use crate::compiler::types::Type;
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
        let alert = FunctionDef::new(
            FunctionKind::Action,
            "alert",
            vec![ArgumentDef::new("message", Direction::InReq, Type::String)],
        );
        class.actions.insert("alert".into(), alert);
        StaticSchemaRetriever::with_classes([class])
    }

    fn compile(source: &str) -> IrModule {
        let input = parse(source).expect("parse failed");
        let typed = block_on(typecheck(&input, &retriever())).expect("typecheck failed");
        let optimized = optimize_input(&typed);
        compile_ir(&optimized, source).expect("lowering failed")
    }

    #[test]
    fn test_monitor_lowering() {
        let module = compile("monitor @com.weather.current() => notify;");
        let text = module.emit();
        assert!(text.contains("try {"), "no try/catch:\n{}", text);
        assert!(text.contains("invoke_trigger @com.weather.current"), "{}", text);
        assert!(text.contains("= step "), "no async while:\n{}", text);
        assert!(text.contains("invoke_output notify"), "{}", text);
        // The try/catch encloses the async while.
        let mut saw = false;
        module.root.walk(&mut |instr| {
            if let Instruction::TryCatch { body, .. } = instr {
                body.walk(&mut |inner| {
                    if matches!(inner, Instruction::AsyncWhile { .. }) {
                        saw = true;
                    }
                });
            }
        });
        assert!(saw, "async while not inside try/catch:\n{}", text);
    }

    #[test]
    fn test_filter_lowers_to_if_with_empty_else() {
        let module = compile(
            "@com.weather.current() filter temperature > 20C => notify;",
        );
        let mut found = false;
        module.root.walk(&mut |instr| {
            if let Instruction::If { else_body, .. } = instr {
                assert_eq!(**else_body, Instruction::Block(Vec::new()));
                found = true;
            }
        });
        assert!(found, "no if instruction:\n{}", module.emit());
    }

    #[test]
    fn test_query_command_lowering() {
        let module = compile("@com.weather.current() => notify;");
        let text = module.emit();
        assert!(text.contains("invoke_query @com.weather.current"), "{}", text);
        assert!(text.contains("for "), "no row loop:\n{}", text);
        assert!(text.contains("clear_get_cache"), "{}", text);
    }

    #[test]
    fn test_action_params_set_by_name() {
        let module =
            compile("@com.weather.current() => @com.weather.alert(message=\"hot\");");
        let text = module.emit();
        assert!(text.contains("invoke_action @com.weather.alert"), "{}", text);
        assert!(text.contains("[\"message\"]"), "param name not set:\n{}", text);
    }

    #[test]
    fn test_assignment_saves_rows_and_calls_read_them() {
        let module = compile("let recent = @com.weather.current();  recent() => notify;");
        let text = module.emit();
        assert!(text.contains("save recent"), "{}", text);
        assert!(text.contains("memory_query recent"), "{}", text);
        assert!(text.contains("table_version recent"), "{}", text);
    }

    #[test]
    fn test_aggregation_uses_memory_query() {
        let module =
            compile("aggregate avg temperature of @com.weather.current() => notify;");
        let text = module.emit();
        assert!(text.contains("aggregation _t0 aggregate avg [temperature]"), "{}", text);
        assert!(text.contains("table_version _t0"), "{}", text);
        assert!(text.contains("memory_query _t0"), "{}", text);
    }

    #[test]
    fn test_edge_filter_gates_on_transition() {
        let module =
            compile("edge monitor @com.weather.current() on temperature > 20C => notify;");
        let text = module.emit();
        assert!(text.contains("env $state"), "{}", text);
        assert!(text.contains("became_true("), "{}", text);
        assert!(text.contains("invoke_output notify"), "{}", text);
    }

    #[test]
    fn test_edge_new_gates_on_fresh_rows() {
        let module = compile("edge monitor @com.weather.current() on new => notify;");
        let text = module.emit();
        assert!(text.contains("is_new_tuple("), "{}", text);
        let mut found = false;
        module.root.walk(&mut |instr| {
            if let Instruction::If { else_body, .. } = instr {
                assert_eq!(**else_body, Instruction::Block(Vec::new()));
                found = true;
            }
        });
        assert!(found, "no gating if:\n{}", text);
    }

    #[test]
    fn test_first_result_uses_break() {
        let module = compile("@com.weather.current()[1] => notify;");
        let mut found = false;
        module.root.walk(&mut |instr| {
            if matches!(instr, Instruction::Break) {
                found = true;
            }
        });
        assert!(found, "no break:\n{}", module.emit());
    }

    #[test]
    fn test_permission_rule_lowering() {
        let source = "$policy { true : @com.weather.current => @com.weather.alert; }";
        let module = compile(source);
        let text = module.emit();
        assert!(text.contains("invoke_output decision"), "{}", text);
        assert!(text.contains("env $source"), "{}", text);
    }

    #[test]
    fn test_untyped_input_is_rejected() {
        let input = parse("monitor @com.weather.current() => notify;").unwrap();
        let err = compile_ir(&input, "").unwrap_err();
        assert!(matches!(err, IrError::Untyped { .. }), "got {:?}", err);
    }

    #[test]
    fn test_registers_monotonic() {
        let module = compile("monitor @com.weather.current() => notify;");
        assert!(module.registers > 0);
        let mut max_seen = 0;
        module.root.walk(&mut |instr| {
            if let Instruction::LoadConstant { dst, .. }
            | Instruction::GetIndex { dst, .. }
            | Instruction::InvokeTrigger { dst, .. } = instr
            {
                max_seen = max_seen.max(dst.0);
            }
        });
        assert!(max_seen < module.registers);
    }
}
