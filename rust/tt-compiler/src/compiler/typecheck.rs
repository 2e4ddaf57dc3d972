//! The type checker: resolves names against the schema retriever, infers
//! and unifies types, and attaches function signatures to the AST.
//!
//! Checking is fail-fast: the first error in document order aborts the
//! walk. Retriever calls are awaited one at a time, so the observable
//! error order is deterministic.

use crate::compiler::ast::*;
use crate::compiler::builtins::{self, OverloadGuard, BINARY_OPS, SCALAR_OPS};
use crate::compiler::retriever::{RetrieverError, SchemaRetriever};
use crate::compiler::schema::{ArgumentDef, ClassDef, Direction, FunctionDef, FunctionKind};
use crate::compiler::tokens::SrcRange;
use crate::compiler::types::{Type, TypeScope};
use crate::compiler::values::Value;
use async_recursion::async_recursion;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypeError {
    #[error("type mismatch at line {line}: expected {expected}, found {actual}")]
    Mismatch { expected: String, actual: String, line: usize },
    #[error("class @{class} has no function '{name}' at line {line}")]
    UnknownFunction { class: String, name: String, line: usize },
    #[error("'{name}' is not a declared function at line {line}")]
    UndeclaredFunction { name: String, line: usize },
    #[error("undeclared variable '{name}' at line {line}")]
    UndeclaredVariable { name: String, line: usize },
    #[error("function '{function}' has no parameter '{param}' at line {line}")]
    UnknownParameter { function: String, param: String, line: usize },
    #[error("parameter '{param}' of '{function}' is not an output at line {line}")]
    NotOutput { function: String, param: String, line: usize },
    #[error("'{op}' is not a valid operator at line {line}")]
    InvalidOperator { op: String, line: usize },
    #[error("no overload of '{op}' accepts ({lhs}, {rhs}) at line {line}")]
    NoOverload { op: String, lhs: String, rhs: String, line: usize },
    #[error("'{function}' is not monitorable at line {line}")]
    NotMonitorable { function: String, line: usize },
    #[error("duplicate projection argument '{param}' at line {line}")]
    DuplicateProjection { param: String, line: usize },
    #[error("cannot aggregate '{op}' over non-numeric field '{field}' at line {line}")]
    NonNumericAggregation { op: String, field: String, line: usize },
    #[error("aggregation '{op}' requires a field at line {line}")]
    MissingAggregationField { op: String, line: usize },
    #[error("chain stages after the first must be invocations at line {line}")]
    InvalidChain { line: usize },
    #[error("subquery must expose exactly one column at line {line}")]
    SingleColumnRequired { line: usize },
    #[error("@{class}.{name} is not a {expected} at line {line}")]
    WrongFunctionKind { class: String, name: String, expected: FunctionKind, line: usize },
    #[error("schema retrieval failed at line {line}: {message}")]
    Retriever { message: String, line: usize },
    #[error("type checking was cancelled")]
    Cancelled,
}

impl TypeError {
    pub fn line(&self) -> Option<usize> {
        match self {
            TypeError::Mismatch { line, .. }
            | TypeError::UnknownFunction { line, .. }
            | TypeError::UndeclaredFunction { line, .. }
            | TypeError::UndeclaredVariable { line, .. }
            | TypeError::UnknownParameter { line, .. }
            | TypeError::NotOutput { line, .. }
            | TypeError::InvalidOperator { line, .. }
            | TypeError::NoOverload { line, .. }
            | TypeError::NotMonitorable { line, .. }
            | TypeError::DuplicateProjection { line, .. }
            | TypeError::NonNumericAggregation { line, .. }
            | TypeError::MissingAggregationField { line, .. }
            | TypeError::InvalidChain { line }
            | TypeError::SingleColumnRequired { line }
            | TypeError::WrongFunctionKind { line, .. }
            | TypeError::Retriever { line, .. } => Some(*line),
            TypeError::Cancelled => None,
        }
    }
}

fn line_of(range: SrcRange) -> usize {
    range.span().map(|s| s.line).unwrap_or(0)
}

/// Type-check an input against a schema retriever, returning a new tree
/// with schemas attached. The input is not modified; checking an already
/// typed tree returns an identical tree.
pub async fn typecheck<R: SchemaRetriever>(
    input: &Input,
    retriever: &R,
) -> Result<Input, TypeError> {
    let mut checked = input.clone();
    let mut checker = Checker::new(retriever);
    match &mut checked {
        Input::Program(program) => checker.check_program(program).await?,
        Input::Library(library) => checker.check_library(library).await?,
        Input::PermissionRule(rule) => checker.check_permission_rule(rule).await?,
        Input::DialogueState(state) => {
            for stmt in &mut state.statements {
                checker.check_statement(stmt).await?;
            }
        }
        Input::ControlCommand(_) => {}
    }
    Ok(checked)
}

struct Checker<'a, R: SchemaRetriever> {
    retriever: &'a R,
    /// Classes declared inside the program; they shadow the retriever.
    classes: HashMap<String, ClassDef>,
    /// Schemas of `let` assignments and function declarations.
    declarations: HashMap<String, FunctionDef>,
    /// Name scopes, innermost last.
    scope: Vec<HashMap<String, Type>>,
}

impl<'a, R: SchemaRetriever> Checker<'a, R> {
    fn new(retriever: &'a R) -> Self {
        Self {
            retriever,
            classes: HashMap::new(),
            declarations: HashMap::new(),
            scope: vec![HashMap::new()],
        }
    }

    fn push_scope(&mut self) {
        self.scope.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scope.pop();
    }

    fn bind(&mut self, name: &str, ty: Type) {
        if let Some(top) = self.scope.last_mut() {
            top.insert(name.to_string(), ty);
        }
    }

    fn lookup(&self, name: &str) -> Option<&Type> {
        self.scope.iter().rev().find_map(|layer| layer.get(name))
    }

    // ── Schema resolution ──

    /// Flatten argument inheritance: a function that extends siblings
    /// carries their arguments after its own.
    fn flatten_function(
        class: &ClassDef,
        def: &FunctionDef,
        visited: &mut HashSet<String>,
    ) -> FunctionDef {
        let mut merged = def.clone();
        if !visited.insert(def.name.clone()) {
            return merged;
        }
        let mut names: HashSet<String> =
            merged.args.iter().map(|a| a.name.clone()).collect();
        for parent_name in &def.extends {
            let parent = class
                .queries
                .get(parent_name)
                .or_else(|| class.actions.get(parent_name));
            if let Some(parent) = parent {
                let parent = Self::flatten_function(class, parent, visited);
                for arg in parent.args {
                    if names.insert(arg.name.clone()) {
                        merged.args.push(arg);
                    }
                }
            }
        }
        merged
    }

    async fn get_schema(
        &self,
        class_name: &str,
        kind: FunctionKind,
        name: &str,
        range: SrcRange,
    ) -> Result<FunctionDef, TypeError> {
        if let Some(class) = self.classes.get(class_name) {
            let def = class.get_function(kind, name).ok_or_else(|| {
                TypeError::UnknownFunction {
                    class: class_name.to_string(),
                    name: name.to_string(),
                    line: line_of(range),
                }
            })?;
            return Ok(Self::flatten_function(class, def, &mut HashSet::new()));
        }
        match self.retriever.get_schema(class_name, kind, name).await {
            Ok(def) => Ok(def),
            Err(RetrieverError::Cancelled) => Err(TypeError::Cancelled),
            Err(RetrieverError::UnknownFunction { class, name, .. }) => {
                Err(TypeError::UnknownFunction { class, name, line: line_of(range) })
            }
            Err(other) => {
                Err(TypeError::Retriever { message: other.to_string(), line: line_of(range) })
            }
        }
    }

    /// Resolve an invocation that is syntactically either a query or an
    /// action.
    async fn get_schema_any_kind(
        &self,
        class_name: &str,
        name: &str,
        range: SrcRange,
    ) -> Result<FunctionDef, TypeError> {
        match self.get_schema(class_name, FunctionKind::Query, name, range).await {
            Ok(def) => Ok(def),
            Err(TypeError::UnknownFunction { .. }) => {
                self.get_schema(class_name, FunctionKind::Action, name, range).await
            }
            Err(other) => Err(other),
        }
    }

    // ── Inputs ──

    async fn check_program(&mut self, program: &mut Program) -> Result<(), TypeError> {
        for class in &program.classes {
            self.classes.insert(class.name.clone(), class.clone());
        }
        if let Some(principal) = &mut program.principal {
            let ty = self.value_type(principal, program.range).await?;
            let expected = Type::Entity("tt:username".into());
            if !(expected.is_assignable(&ty) || Type::String.is_assignable(&ty)) {
                return Err(TypeError::Mismatch {
                    expected: expected.to_string(),
                    actual: ty.to_string(),
                    line: line_of(program.range),
                });
            }
        }
        for decl in &mut program.declarations {
            self.check_declaration(decl).await?;
        }
        for stmt in &mut program.statements {
            self.check_statement(stmt).await?;
        }
        Ok(())
    }

    async fn check_library(&mut self, library: &mut Library) -> Result<(), TypeError> {
        for class in &library.classes {
            self.classes.insert(class.name.clone(), class.clone());
        }
        for dataset in &mut library.datasets {
            for example in &mut dataset.examples {
                self.push_scope();
                for arg in &example.args {
                    self.bind(&arg.name, arg.ty.clone());
                }
                let result = self.check_expression(&mut example.expression).await;
                self.pop_scope();
                result?;
            }
        }
        Ok(())
    }

    async fn check_permission_rule(&mut self, rule: &mut PermissionRule) -> Result<(), TypeError> {
        self.push_scope();
        self.bind("source", Type::Entity("tt:username".into()));
        let principal = self.check_filter(&mut rule.principal, None, rule.range).await;
        self.pop_scope();
        principal?;
        let range = rule.range;
        self.check_permission_function(&mut rule.query, FunctionKind::Query, range).await?;
        self.check_permission_function(&mut rule.action, FunctionKind::Action, range).await?;
        Ok(())
    }

    async fn check_permission_function(
        &mut self,
        function: &mut PermissionFunction,
        expected: FunctionKind,
        range: SrcRange,
    ) -> Result<(), TypeError> {
        match function {
            PermissionFunction::Builtin | PermissionFunction::Star => Ok(()),
            PermissionFunction::ClassStar(class) => {
                match self.retriever.get_class(class).await {
                    Ok(_) => Ok(()),
                    Err(RetrieverError::Cancelled) => Err(TypeError::Cancelled),
                    Err(other) => Err(TypeError::Retriever {
                        message: other.to_string(),
                        line: line_of(range),
                    }),
                }
            }
            PermissionFunction::Specified { class_name, channel, filter, schema } => {
                let def = match self.get_schema(class_name, expected, channel, range).await {
                    Ok(def) => def,
                    Err(TypeError::UnknownFunction { class, name, line }) => {
                        // A name that exists with the other kind is a kind
                        // mismatch, not a missing function.
                        let other = match expected {
                            FunctionKind::Action => FunctionKind::Query,
                            _ => FunctionKind::Action,
                        };
                        let found = self.get_schema(class_name, other, channel, range).await;
                        return Err(match found {
                            Ok(_) => TypeError::WrongFunctionKind { class, name, expected, line },
                            Err(_) => TypeError::UnknownFunction { class, name, line },
                        });
                    }
                    Err(other) => return Err(other),
                };
                self.check_filter(filter, Some(&def), range).await?;
                *schema = Some(Box::new(def));
                Ok(())
            }
        }
    }

    // ── Statements ──

    #[async_recursion(?Send)]
    async fn check_statement(&mut self, stmt: &mut Statement) -> Result<(), TypeError> {
        match stmt {
            Statement::Assignment(assign) => {
                let schema = self.check_expression(&mut assign.value).await?;
                self.declarations.insert(assign.name.clone(), schema.clone());
                assign.schema = Some(Box::new(schema));
                Ok(())
            }
            Statement::FunctionDeclaration(decl) => self.check_declaration(decl).await,
            Statement::Expression(stmt) => {
                self.check_expression(&mut stmt.expression).await?;
                Ok(())
            }
            Statement::Rule(rule) => {
                let stream = self.check_expression(&mut rule.stream).await?;
                if stream.kind != FunctionKind::Stream {
                    return Err(TypeError::WrongFunctionKind {
                        class: String::new(),
                        name: stream.name,
                        expected: FunctionKind::Stream,
                        line: line_of(rule.range),
                    });
                }
                self.push_scope();
                for arg in stream.out_params() {
                    self.bind(&arg.name, arg.ty.clone());
                }
                let mut result = Ok(());
                for action in &mut rule.actions {
                    result = self.check_expression(action).await.map(|_| ());
                    if result.is_err() {
                        break;
                    }
                }
                self.pop_scope();
                result
            }
            Statement::Command(cmd) => {
                self.push_scope();
                let mut result = Ok(());
                if let Some(table) = &mut cmd.table {
                    let checked = self.check_expression(table).await;
                    match checked {
                        Ok(schema) => {
                            for arg in schema.out_params() {
                                let (name, ty) = (arg.name.clone(), arg.ty.clone());
                                self.bind(&name, ty);
                            }
                        }
                        Err(e) => result = Err(e),
                    }
                }
                if result.is_ok() {
                    for action in &mut cmd.actions {
                        let checked = self.check_expression(action).await;
                        result = checked.map(|_| ());
                        if result.is_err() {
                            break;
                        }
                    }
                }
                self.pop_scope();
                result
            }
        }
    }

    async fn check_declaration(&mut self, decl: &mut FunctionDeclaration) -> Result<(), TypeError> {
        self.push_scope();
        let mut result = Ok(());
        for arg in &decl.args {
            self.bind(&arg.name, arg.ty.clone());
        }
        for stmt in &mut decl.body {
            result = self.check_statement(stmt).await;
            if result.is_err() {
                break;
            }
        }
        self.pop_scope();
        result?;
        let schema = FunctionDef::new(FunctionKind::Query, decl.name.clone(), decl.args.clone());
        self.declarations.insert(decl.name.clone(), schema.clone());
        decl.schema = Some(Box::new(schema));
        Ok(())
    }

    // ── Expressions ──

    /// Check one expression and return its output schema.
    #[async_recursion(?Send)]
    async fn check_expression(&mut self, expr: &mut Expression) -> Result<FunctionDef, TypeError> {
        let range = expr.range();
        match expr {
            Expression::Invocation(inv) => {
                let def = self
                    .get_schema_any_kind(&inv.selector.class_name, &inv.channel, range)
                    .await?;
                self.check_in_params(&mut inv.in_params, &def, range).await?;
                inv.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::FunctionCall(call) => {
                let def = if call.is_notify() {
                    builtins::notify_action()
                } else {
                    self.declarations.get(&call.name).cloned().ok_or_else(|| {
                        TypeError::UndeclaredFunction {
                            name: call.name.clone(),
                            line: line_of(range),
                        }
                    })?
                };
                self.check_in_params(&mut call.in_params, &def, range).await?;
                call.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Filter(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                self.check_filter(&mut e.filter, Some(&def), range).await?;
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Projection(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                let mut seen = HashSet::new();
                for arg in &e.args {
                    if !def.has_arg(arg) {
                        return Err(TypeError::UnknownParameter {
                            function: def.name.clone(),
                            param: arg.clone(),
                            line: line_of(range),
                        });
                    }
                    if !seen.insert(arg.clone()) {
                        return Err(TypeError::DuplicateProjection {
                            param: arg.clone(),
                            line: line_of(range),
                        });
                    }
                }
                let mut projected = def.clone();
                projected.args =
                    def.args
                        .iter()
                        .filter(|a| a.is_input() || e.args.contains(&a.name))
                        .cloned()
                        .collect();
                e.schema = Some(Box::new(projected.clone()));
                Ok(projected)
            }
            Expression::Sort(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                let arg = def.get_arg(&e.field).ok_or_else(|| TypeError::UnknownParameter {
                    function: def.name.clone(),
                    param: e.field.clone(),
                    line: line_of(range),
                })?;
                if arg.is_input() {
                    return Err(TypeError::NotOutput {
                        function: def.name.clone(),
                        param: e.field.clone(),
                        line: line_of(range),
                    });
                }
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Index(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                for index in &mut e.indices {
                    self.check_value_unifies(index, &Type::Number, range).await?;
                }
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Slice(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                self.check_value_unifies(&mut e.base, &Type::Number, range).await?;
                self.check_value_unifies(&mut e.limit, &Type::Number, range).await?;
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Aggregation(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                let out = match (&e.operator, &e.field) {
                    (AggregationOperator::Count, None) => {
                        ArgumentDef::new("count", Direction::Out, Type::Number)
                    }
                    (op, field) => {
                        let field = match field {
                            Some(field) => field.clone(),
                            None => {
                                return Err(TypeError::MissingAggregationField {
                                    op: op.to_string(),
                                    line: line_of(range),
                                })
                            }
                        };
                        let arg =
                            def.get_arg(&field).ok_or_else(|| TypeError::UnknownParameter {
                                function: def.name.clone(),
                                param: field.clone(),
                                line: line_of(range),
                            })?;
                        if *op == AggregationOperator::Count {
                            ArgumentDef::new("count", Direction::Out, Type::Number)
                        } else {
                            if !arg.ty.is_numeric() {
                                return Err(TypeError::NonNumericAggregation {
                                    op: op.to_string(),
                                    field,
                                    line: line_of(range),
                                });
                            }
                            ArgumentDef::new(arg.name.clone(), Direction::Out, arg.ty.clone())
                        }
                    }
                };
                // Aggregated tables are not monitorable.
                let aggregated =
                    FunctionDef::new(FunctionKind::Query, def.name.clone(), vec![out]);
                e.schema = Some(Box::new(aggregated.clone()));
                Ok(aggregated)
            }
            Expression::Alias(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Monitor(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                if !def.is_monitorable {
                    return Err(TypeError::NotMonitorable {
                        function: def.name.clone(),
                        line: line_of(range),
                    });
                }
                for arg in &e.args {
                    match def.get_arg(arg) {
                        None => {
                            return Err(TypeError::UnknownParameter {
                                function: def.name.clone(),
                                param: arg.clone(),
                                line: line_of(range),
                            })
                        }
                        Some(a) if a.is_input() => {
                            return Err(TypeError::NotOutput {
                                function: def.name.clone(),
                                param: arg.clone(),
                                line: line_of(range),
                            })
                        }
                        Some(_) => {}
                    }
                }
                let mut stream = def.clone();
                stream.kind = FunctionKind::Stream;
                e.schema = Some(Box::new(stream.clone()));
                Ok(stream)
            }
            Expression::EdgeFilter(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                if def.kind != FunctionKind::Stream {
                    return Err(TypeError::WrongFunctionKind {
                        class: String::new(),
                        name: def.name,
                        expected: FunctionKind::Stream,
                        line: line_of(range),
                    });
                }
                self.check_filter(&mut e.filter, Some(&def), range).await?;
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::EdgeNew(e) => {
                let def = self.check_expression(&mut e.inner).await?;
                if def.kind != FunctionKind::Stream {
                    return Err(TypeError::WrongFunctionKind {
                        class: String::new(),
                        name: def.name,
                        expected: FunctionKind::Stream,
                        line: line_of(range),
                    });
                }
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Timer(e) => {
                let def = builtins::timer_stream();
                self.check_value_unifies(&mut e.interval, &Type::Measure(String::new()), range)
                    .await?;
                if let Some(frequency) = &mut e.frequency {
                    self.check_value_unifies(frequency, &Type::Number, range).await?;
                }
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::AtTimer(e) => {
                let def = builtins::attimer_stream();
                for time in &mut e.times {
                    self.check_value_unifies(time, &Type::Time, range).await?;
                }
                e.schema = Some(Box::new(def.clone()));
                Ok(def)
            }
            Expression::Chain(e) => {
                self.push_scope();
                let result = self.check_chain(e).await;
                self.pop_scope();
                result
            }
        }
    }

    async fn check_chain(&mut self, e: &mut ChainExpression) -> Result<FunctionDef, TypeError> {
        let mut kind = FunctionKind::Query;
        let mut args: Vec<ArgumentDef> = Vec::new();
        let mut names = HashSet::new();
        for (i, expr) in e.expressions.iter_mut().enumerate() {
            if i > 0
                && !matches!(expr, Expression::Invocation(_) | Expression::FunctionCall(_))
            {
                return Err(TypeError::InvalidChain { line: line_of(expr.range()) });
            }
            let def = self.check_expression(expr).await?;
            if i == 0 && def.kind == FunctionKind::Stream {
                kind = FunctionKind::Stream;
            }
            for arg in def.out_params() {
                self.bind(&arg.name, arg.ty.clone());
                if names.insert(arg.name.clone()) {
                    args.push(arg.clone());
                }
            }
            // Passed-through inputs join the schema.
            for arg in def.in_params() {
                if names.insert(arg.name.clone()) {
                    let mut passed = arg.clone();
                    passed.direction = Direction::InOpt;
                    args.push(passed);
                }
            }
        }
        let def = FunctionDef::new(kind, "chain", args);
        e.schema = Some(Box::new(def.clone()));
        Ok(def)
    }

    /// Check the input parameters of an invocation. Unknown names are
    /// errors; missing required inputs are filled with an undefined value
    /// for the slot-filling machinery to find.
    async fn check_in_params(
        &mut self,
        in_params: &mut Vec<InputParam>,
        def: &FunctionDef,
        range: SrcRange,
    ) -> Result<(), TypeError> {
        for param in in_params.iter_mut() {
            let arg = def.get_arg(&param.name).filter(|a| a.is_input()).ok_or_else(|| {
                TypeError::UnknownParameter {
                    function: def.name.clone(),
                    param: param.name.clone(),
                    line: line_of(range),
                }
            })?;
            if matches!(param.value, Value::Undefined { .. }) {
                continue;
            }
            let expected = arg.ty.clone();
            self.check_value_unifies(&mut param.value, &expected, range).await?;
        }
        for arg in def.in_params() {
            if arg.is_required() && !in_params.iter().any(|p| p.name == arg.name) {
                in_params.push(InputParam::new(
                    arg.name.clone(),
                    Value::Undefined { local: true },
                ));
            }
        }
        Ok(())
    }

    // ── Filters ──

    #[async_recursion(?Send)]
    async fn check_filter(
        &mut self,
        filter: &mut BooleanExpression,
        schema: Option<&FunctionDef>,
        range: SrcRange,
    ) -> Result<(), TypeError> {
        match filter {
            BooleanExpression::True | BooleanExpression::False => Ok(()),
            BooleanExpression::And(ops) | BooleanExpression::Or(ops) => {
                for op in ops {
                    self.check_filter(op, schema, range).await?;
                }
                Ok(())
            }
            BooleanExpression::Not(inner) => self.check_filter(inner, schema, range).await,
            BooleanExpression::Atom { name, op, value } => {
                let param_ty = self.param_type(name, schema, range)?;
                let value_ty = self.value_type(value, range).await?;
                self.check_binary_op(op, &param_ty, &value_ty, range)
            }
            BooleanExpression::DontCare { name } => {
                self.param_type(name, schema, range)?;
                Ok(())
            }
            BooleanExpression::Compute { lhs, op, rhs } => {
                let lhs_ty = self.filter_value_type(lhs, schema, range).await?;
                let rhs_ty = self.filter_value_type(rhs, schema, range).await?;
                self.check_binary_op(op, &lhs_ty, &rhs_ty, range)
            }
            BooleanExpression::PropertyPath { path, op, value } => {
                let mut ty = self.param_type(&path[0], schema, range)?;
                for segment in &path[1..] {
                    ty = field_type(&ty, segment).ok_or_else(|| TypeError::UnknownParameter {
                        function: path[0].clone(),
                        param: segment.clone(),
                        line: line_of(range),
                    })?;
                }
                let value_ty = self.value_type(value, range).await?;
                self.check_binary_op(op, &ty, &value_ty, range)
            }
            BooleanExpression::ExistentialSubquery(query) => {
                self.check_expression(query).await?;
                Ok(())
            }
            BooleanExpression::ComparisonSubquery { lhs, op, query } => {
                let lhs_ty = self.filter_value_type(lhs, schema, range).await?;
                let sub = self.check_expression(query).await?;
                let mut outs = sub.out_params();
                let column = outs.next().ok_or(TypeError::SingleColumnRequired {
                    line: line_of(range),
                })?;
                if outs.next().is_some() {
                    return Err(TypeError::SingleColumnRequired { line: line_of(range) });
                }
                let column_ty = column.ty.clone();
                self.check_binary_op(op, &lhs_ty, &column_ty, range)
            }
            BooleanExpression::External { class_name, channel, in_params, filter } => {
                let def = self
                    .get_schema(class_name, FunctionKind::Query, channel, range)
                    .await?;
                self.check_in_params(in_params, &def, range).await?;
                self.check_filter(filter, Some(&def), range).await?;
                Ok(())
            }
        }
    }

    /// The type of `name` inside a filter: a parameter of the surrounding
    /// function, or a name already in scope.
    fn param_type(
        &self,
        name: &str,
        schema: Option<&FunctionDef>,
        range: SrcRange,
    ) -> Result<Type, TypeError> {
        if let Some(def) = schema {
            if let Some(ty) = def.get_arg_type(name) {
                return Ok(ty.clone());
            }
        }
        if let Some(ty) = self.lookup(name) {
            return Ok(ty.clone());
        }
        match schema {
            Some(def) => Err(TypeError::UnknownParameter {
                function: def.name.clone(),
                param: name.to_string(),
                line: line_of(range),
            }),
            None => Err(TypeError::UndeclaredVariable {
                name: name.to_string(),
                line: line_of(range),
            }),
        }
    }

    /// Type a value that may reference parameters of the surrounding
    /// function in addition to the lexical scope.
    async fn filter_value_type(
        &mut self,
        value: &mut Value,
        schema: Option<&FunctionDef>,
        range: SrcRange,
    ) -> Result<Type, TypeError> {
        self.push_scope();
        if let Some(def) = schema {
            for arg in &def.args {
                self.bind(&arg.name, arg.ty.clone());
            }
        }
        let result = self.value_type(value, range).await;
        self.pop_scope();
        result
    }

    fn check_binary_op(
        &self,
        op: &str,
        lhs: &Type,
        rhs: &Type,
        range: SrcRange,
    ) -> Result<(), TypeError> {
        let def = BINARY_OPS.get(op).ok_or_else(|| TypeError::InvalidOperator {
            op: op.to_string(),
            line: line_of(range),
        })?;
        for overload in &def.overloads {
            let mut scope = TypeScope::new();
            let Ok(bound_lhs) = overload.lhs.unify(lhs, &mut scope) else { continue };
            if overload.rhs.unify(rhs, &mut scope).is_err() {
                continue;
            }
            let resolved = bound_lhs.resolve_type_scope(&scope);
            let guard_ok = match def.guard {
                OverloadGuard::None => true,
                OverloadGuard::Comparable => resolved.is_comparable(),
                OverloadGuard::Numeric => resolved.is_numeric(),
            };
            if guard_ok {
                // The overload's return type always unifies with Boolean.
                return Ok(());
            }
        }
        Err(TypeError::NoOverload {
            op: op.to_string(),
            lhs: lhs.to_string(),
            rhs: rhs.to_string(),
            line: line_of(range),
        })
    }

    // ── Values ──

    async fn check_value_unifies(
        &mut self,
        value: &mut Value,
        expected: &Type,
        range: SrcRange,
    ) -> Result<Type, TypeError> {
        let actual = self.value_type(value, range).await?;
        let mut scope = TypeScope::new();
        match expected.unify(&actual, &mut scope) {
            Ok(unified) => Ok(unified),
            // Coerced parameter passing accepts assignable values where
            // strict unification fails (e.g. an entity for a string).
            Err(_) if expected.is_assignable(&actual) => Ok(expected.clone()),
            Err(_) => Err(TypeError::Mismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
                line: line_of(range),
            }),
        }
    }

    /// Infer the type of a value, resolving variable references through the
    /// scope and attaching inferred types in place.
    #[async_recursion(?Send)]
    async fn value_type(&mut self, value: &mut Value, range: SrcRange) -> Result<Type, TypeError> {
        match value {
            Value::VarRef { name, ty } => {
                let resolved = self.lookup(name).cloned().ok_or_else(|| {
                    TypeError::UndeclaredVariable {
                        name: name.clone(),
                        line: line_of(range),
                    }
                })?;
                *ty = Some(resolved.clone());
                Ok(resolved)
            }
            Value::Computation { op, operands, ty } => {
                let def = SCALAR_OPS.get(op.as_str()).ok_or_else(|| {
                    TypeError::InvalidOperator { op: op.clone(), line: line_of(range) }
                })?;
                let mut operand_types = Vec::new();
                for operand in operands.iter_mut() {
                    operand_types.push(self.value_type(operand, range).await?);
                }
                for overload in &def.overloads {
                    if overload.operands.len() != operand_types.len() {
                        continue;
                    }
                    let mut scope = TypeScope::new();
                    let mut ok = true;
                    for (expected, actual) in overload.operands.iter().zip(&operand_types) {
                        if expected.unify(actual, &mut scope).is_err() {
                            ok = false;
                            break;
                        }
                    }
                    if !ok {
                        continue;
                    }
                    let first = overload.operands[0].resolve_type_scope(&scope);
                    let guard_ok = match def.guard {
                        OverloadGuard::None => true,
                        OverloadGuard::Comparable => first.is_comparable(),
                        OverloadGuard::Numeric => {
                            // Concrete overloads passed their own shape check.
                            !matches!(overload.operands[0], Type::TypeVar(_))
                                || first.is_numeric()
                        }
                    };
                    if guard_ok {
                        let ret = overload.ret.resolve_type_scope(&scope);
                        *ty = Some(ret.clone());
                        return Ok(ret);
                    }
                }
                Err(TypeError::NoOverload {
                    op: op.clone(),
                    lhs: operand_types
                        .first()
                        .map(Type::to_string)
                        .unwrap_or_else(|| "()".into()),
                    rhs: operand_types
                        .get(1)
                        .map(Type::to_string)
                        .unwrap_or_else(|| "()".into()),
                    line: line_of(range),
                })
            }
            Value::ArrayField { value, field, ty } => {
                let array_ty = self.value_type(value, range).await?;
                let Type::Array(elem) = array_ty else {
                    return Err(TypeError::Mismatch {
                        expected: "Array(Compound(...))".into(),
                        actual: array_ty.to_string(),
                        line: line_of(range),
                    });
                };
                let field_ty =
                    field_type(&elem, field).ok_or_else(|| TypeError::UnknownParameter {
                        function: "array field access".into(),
                        param: field.clone(),
                        line: line_of(range),
                    })?;
                *ty = Some(field_ty.clone());
                Ok(Type::Array(Box::new(field_ty)))
            }
            Value::Filter { value, filter } => {
                let array_ty = self.value_type(value, range).await?;
                let elem_schema = match &array_ty {
                    Type::Array(elem) => compound_schema(elem),
                    _ => None,
                };
                self.check_filter(filter, elem_schema.as_ref(), range).await?;
                Ok(array_ty)
            }
            Value::Array(elements) => {
                let mut unified = Type::Any;
                for element in elements.iter_mut() {
                    let elem_ty = self.value_type(element, range).await?;
                    let mut scope = TypeScope::new();
                    unified = unified.unify(&elem_ty, &mut scope).map_err(|_| {
                        TypeError::Mismatch {
                            expected: unified.to_string(),
                            actual: elem_ty.to_string(),
                            line: line_of(range),
                        }
                    })?;
                }
                Ok(Type::Array(Box::new(unified)))
            }
            Value::Object(fields) | Value::ArgMap(fields) => {
                for field in fields.values_mut() {
                    self.value_type(field, range).await?;
                }
                Ok(value.get_type())
            }
            other => Ok(other.get_type()),
        }
    }
}

/// Look up a named field inside a compound or object type.
fn field_type(ty: &Type, field: &str) -> Option<Type> {
    match ty {
        Type::Compound(fields) => fields.get(field).map(|arg| arg.ty.clone()),
        Type::Object(fields) => fields.get(field).cloned(),
        _ => None,
    }
}

/// Build a synthetic schema from a compound element type so that filters
/// over array elements can resolve field names.
fn compound_schema(ty: &Type) -> Option<FunctionDef> {
    match ty {
        Type::Compound(fields) => Some(FunctionDef::new(
            FunctionKind::Query,
            "element",
            fields.values().cloned().collect(),
        )),
        Type::Object(fields) => Some(FunctionDef::new(
            FunctionKind::Query,
            "element",
            fields
                .iter()
                .map(|(name, ty)| ArgumentDef::new(name.clone(), Direction::Out, ty.clone()))
                .collect(),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse;
    use crate::compiler::retriever::StaticSchemaRetriever;
    use futures::executor::block_on;

    fn weather_retriever() -> StaticSchemaRetriever {
        let mut class = ClassDef::new("com.weather");
        let mut current = FunctionDef::new(
            FunctionKind::Query,
            "current",
            vec![
                ArgumentDef::new("city", Direction::InOpt, Type::String),
                ArgumentDef::new("temperature", Direction::Out, Type::Measure("C".into())),
                ArgumentDef::new("condition", Direction::Out, Type::Enum(Some(vec![
                    "sunny".into(),
                    "rainy".into(),
                ]))),
            ],
        );
        current.is_monitorable = true;
        current.is_list = true;
        class.queries.insert("current".into(), current);
        let alert = FunctionDef::new(
            FunctionKind::Action,
            "alert",
            vec![ArgumentDef::new("message", Direction::InReq, Type::String)],
        );
        class.actions.insert("alert".into(), alert);
        StaticSchemaRetriever::with_classes([class])
    }

    fn check(source: &str) -> Result<Input, TypeError> {
        let input = parse(source).expect("parse failed");
        block_on(typecheck(&input, &weather_retriever()))
    }

    fn check_ok(source: &str) -> Input {
        match check(source) {
            Ok(input) => input,
            Err(e) => panic!("typecheck of {:?} failed: {}", source, e),
        }
    }

    #[test]
    fn test_projection_attaches_measure() {
        let input = check_ok("@com.weather.current() filter temperature > 20C => notify;");
        let Input::Program(program) = &input else { panic!() };
        let Statement::Expression(stmt) = &program.statements[0] else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::Filter(filter) = &chain.expressions[0] else { panic!() };
        let schema = filter.schema.as_ref().expect("schema attached");
        assert_eq!(
            schema.get_arg_type("temperature"),
            Some(&Type::Measure("C".into()))
        );
    }

    #[test]
    fn test_filter_wrong_unit_rejected() {
        let err = check("@com.weather.current() filter temperature > 20kg => notify;")
            .unwrap_err();
        assert!(matches!(err, TypeError::NoOverload { .. }), "got {:?}", err);
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = check("@com.weather.current() filter humidity > 1 => notify;").unwrap_err();
        assert!(matches!(err, TypeError::UnknownParameter { .. }), "got {:?}", err);
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = check("@com.weather.tomorrow() => notify;").unwrap_err();
        assert!(matches!(err, TypeError::UnknownFunction { .. }), "got {:?}", err);
    }

    #[test]
    fn test_monitor_requires_monitorable() {
        check_ok("monitor @com.weather.current() => notify;");
        // Aggregations are not monitorable.
        let err = check("monitor aggregate count of @com.weather.current() => notify;")
            .unwrap_err();
        assert!(matches!(err, TypeError::NotMonitorable { .. }), "got {:?}", err);
    }

    #[test]
    fn test_missing_required_param_filled_with_undefined() {
        let input = check_ok("@com.weather.alert();");
        let Input::Program(program) = &input else { panic!() };
        let Statement::Expression(stmt) = &program.statements[0] else { panic!() };
        let Expression::Invocation(inv) = &stmt.expression else { panic!() };
        assert_eq!(inv.in_params.len(), 1);
        assert_eq!(inv.in_params[0].name, "message");
        assert!(matches!(inv.in_params[0].value, Value::Undefined { .. }));
    }

    #[test]
    fn test_projection_unknown_and_duplicate() {
        let err = check("[humidity] of @com.weather.current() => notify;").unwrap_err();
        assert!(matches!(err, TypeError::UnknownParameter { .. }));
        let err =
            check("[temperature, temperature] of @com.weather.current() => notify;").unwrap_err();
        assert!(matches!(err, TypeError::DuplicateProjection { .. }));
    }

    #[test]
    fn test_aggregation_rules() {
        check_ok("aggregate avg temperature of @com.weather.current() => notify;");
        let err =
            check("aggregate avg condition of @com.weather.current() => notify;").unwrap_err();
        assert!(matches!(err, TypeError::NonNumericAggregation { .. }));
        let err = check("aggregate avg of @com.weather.current() => notify;").unwrap_err();
        assert!(matches!(err, TypeError::MissingAggregationField { .. }));
    }

    #[test]
    fn test_chain_passes_outputs_to_actions() {
        check_ok(
            "monitor @com.weather.current() => @com.weather.alert(message=\"hot\");",
        );
        // Chain outputs are visible to later stages, and their types are
        // enforced: an enum output does not fit a string input.
        let err = check("@com.weather.current() => @com.weather.alert(message=condition);")
            .unwrap_err();
        assert!(matches!(err, TypeError::Mismatch { .. }), "got {:?}", err);
    }

    #[test]
    fn test_enum_value_unifies_with_declared_members() {
        check_ok("@com.weather.current() filter condition == enum(sunny) => notify;");
    }

    #[test]
    fn test_typecheck_idempotent() {
        let source = "monitor @com.weather.current() filter temperature >= 10C => notify;";
        let input = parse(source).unwrap();
        let retriever = weather_retriever();
        let once = block_on(typecheck(&input, &retriever)).unwrap();
        let twice = block_on(typecheck(&once, &retriever)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_permission_rule_checking() {
        let source = "$policy { true : @com.weather.current => @com.weather.alert; }";
        let input = check_ok(source);
        let Input::PermissionRule(rule) = &input else { panic!() };
        let PermissionFunction::Specified { schema, .. } = &rule.query else { panic!() };
        assert!(schema.is_some());

        let err = check("$policy { true : @com.weather.alert => @com.weather.alert; }")
            .unwrap_err();
        assert!(matches!(err, TypeError::WrongFunctionKind { .. }), "got {:?}", err);
    }

    #[test]
    fn test_declaration_scope() {
        check_ok(
            "function f(city : String) { @com.weather.current(city=city) => notify; }",
        );
        let err = check(
            "function f(city : String) { @com.weather.current(city=town) => notify; }",
        )
        .unwrap_err();
        assert!(matches!(err, TypeError::UndeclaredVariable { .. }));
    }

    #[test]
    fn test_edge_streams() {
        // Edge predicates resolve against the inner stream's schema.
        let input =
            check_ok("edge monitor @com.weather.current() on temperature > 20C => notify;");
        let Input::Program(program) = &input else { panic!() };
        let Statement::Expression(stmt) = &program.statements[0] else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::EdgeFilter(edge) = &chain.expressions[0] else { panic!() };
        assert_eq!(edge.schema.as_ref().unwrap().kind, FunctionKind::Stream);
        check_ok("edge monitor @com.weather.current() on new => notify;");

        // `edge` applies to streams, not bare tables.
        let err = check("edge @com.weather.current() on new => notify;").unwrap_err();
        assert!(matches!(err, TypeError::WrongFunctionKind { .. }), "got {:?}", err);
        let err = check("edge monitor @com.weather.current() on humidity > 1 => notify;")
            .unwrap_err();
        assert!(matches!(err, TypeError::UnknownParameter { .. }), "got {:?}", err);
    }

    #[test]
    fn test_timer_interval_types() {
        check_ok("timer(interval=30min) => notify;");
        let err = check("timer(interval=\"soon\") => notify;").unwrap_err();
        assert!(matches!(err, TypeError::Mismatch { .. }));
    }
}
