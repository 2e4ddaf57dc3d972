//! Semantic canonicalization of filters and programs.
//!
//! Optimization is pure: every entry point returns a new tree. Filter
//! optimization runs to a fixed point and is idempotent.

use crate::compiler::ast::*;
use crate::compiler::schema::FunctionKind;
use crate::compiler::values::Value;
use crate::compiler::visitor::Visitor;
use std::collections::HashSet;

/// Canonicalize a boolean predicate: flatten nested combinators, fold
/// constants, eliminate double negation, and deduplicate operands.
pub fn optimize_filter(filter: BooleanExpression) -> BooleanExpression {
    let mut current = filter;
    loop {
        let next = optimize_filter_once(current.clone());
        if next == current {
            return next;
        }
        current = next;
    }
}

fn optimize_filter_once(filter: BooleanExpression) -> BooleanExpression {
    match filter {
        BooleanExpression::Not(inner) => match optimize_filter_once(*inner) {
            BooleanExpression::True => BooleanExpression::False,
            BooleanExpression::False => BooleanExpression::True,
            BooleanExpression::Not(x) => *x,
            other => BooleanExpression::Not(Box::new(other)),
        },
        BooleanExpression::And(operands) => {
            let mut flat = Vec::new();
            for operand in operands {
                match optimize_filter_once(operand) {
                    // `false` dominates a conjunction.
                    BooleanExpression::False => return BooleanExpression::False,
                    BooleanExpression::True => {}
                    BooleanExpression::And(inner) => flat.extend(inner),
                    other => flat.push(other),
                }
            }
            let mut deduped: Vec<BooleanExpression> = Vec::new();
            for operand in flat {
                if !deduped.contains(&operand) {
                    deduped.push(operand);
                }
            }
            match deduped.len() {
                0 => BooleanExpression::True,
                1 => deduped.into_iter().next().expect("one operand"),
                _ => BooleanExpression::And(deduped),
            }
        }
        BooleanExpression::Or(operands) => {
            let mut flat = Vec::new();
            for operand in operands {
                match optimize_filter_once(operand) {
                    // `true` dominates a disjunction.
                    BooleanExpression::True => return BooleanExpression::True,
                    BooleanExpression::False => {}
                    BooleanExpression::Or(inner) => flat.extend(inner),
                    other => flat.push(other),
                }
            }
            let mut deduped: Vec<BooleanExpression> = Vec::new();
            for operand in flat {
                if !deduped.contains(&operand) {
                    deduped.push(operand);
                }
            }
            match deduped.len() {
                0 => BooleanExpression::False,
                1 => deduped.into_iter().next().expect("one operand"),
                _ => BooleanExpression::Or(deduped),
            }
        }
        // A comparison whose left side is a bare variable reference is an
        // ordinary atom.
        BooleanExpression::Compute { lhs: Value::VarRef { name, .. }, op, rhs } => {
            BooleanExpression::Atom { name, op, value: rhs }
        }
        BooleanExpression::External { class_name, channel, in_params, filter } => {
            BooleanExpression::External {
                class_name,
                channel,
                in_params,
                filter: Box::new(optimize_filter_once(*filter)),
            }
        }
        other => other,
    }
}

/// Optimize an expression tree: canonicalize every filter, drop filters
/// that reduce to `true`, flatten nested chains.
pub fn optimize_expression(expr: Expression) -> Expression {
    match expr {
        Expression::Filter(e) => {
            let inner = optimize_expression(*e.inner);
            let filter = optimize_filter(e.filter);
            if filter == BooleanExpression::True {
                return inner;
            }
            Expression::Filter(FilterExpression {
                inner: Box::new(inner),
                filter,
                schema: e.schema,
                range: e.range,
            })
        }
        Expression::Chain(e) => {
            let mut expressions = Vec::new();
            for expr in e.expressions {
                match optimize_expression(expr) {
                    Expression::Chain(inner) => expressions.extend(inner.expressions),
                    other => expressions.push(other),
                }
            }
            if expressions.len() == 1 {
                return expressions.into_iter().next().expect("one expression");
            }
            Expression::Chain(ChainExpression { expressions, schema: e.schema, range: e.range })
        }
        Expression::Projection(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::Projection(e)
        }
        Expression::Sort(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::Sort(e)
        }
        Expression::Index(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::Index(e)
        }
        Expression::Slice(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::Slice(e)
        }
        Expression::Aggregation(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::Aggregation(e)
        }
        Expression::Alias(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::Alias(e)
        }
        Expression::Monitor(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::Monitor(e)
        }
        // `edge s on true` still means "on any new value", so the node
        // survives even when its predicate folds to a constant.
        Expression::EdgeFilter(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            e.filter = optimize_filter(e.filter);
            Expression::EdgeFilter(e)
        }
        Expression::EdgeNew(mut e) => {
            e.inner = Box::new(optimize_expression(*e.inner));
            Expression::EdgeNew(e)
        }
        other => other,
    }
}

/// Collects names referenced by variable references and function calls.
#[derive(Default)]
struct UsedNames {
    names: HashSet<String>,
}

impl Visitor for UsedNames {
    fn visit_function_call(&mut self, call: &FunctionCall) -> bool {
        self.names.insert(call.name.clone());
        true
    }

    fn visit_value(&mut self, value: &Value) -> bool {
        if let Value::VarRef { name, .. } = value {
            self.names.insert(name.clone());
        }
        true
    }
}

/// Detects observable side effects. Untyped invocations are conservatively
/// treated as effectful.
#[derive(Default)]
struct EffectCheck {
    effectful: bool,
}

impl Visitor for EffectCheck {
    fn visit_invocation(&mut self, invocation: &Invocation) -> bool {
        match invocation.schema.as_deref() {
            Some(schema) if schema.kind != FunctionKind::Action => {}
            _ => self.effectful = true,
        }
        true
    }

    fn visit_function_call(&mut self, call: &FunctionCall) -> bool {
        match call.schema.as_deref() {
            _ if call.is_notify() => self.effectful = true,
            Some(schema) if schema.kind != FunctionKind::Action => {}
            _ => self.effectful = true,
        }
        true
    }
}

fn has_side_effect(expr: &Expression) -> bool {
    let mut check = EffectCheck::default();
    expr.visit(&mut check);
    check.effectful
}

fn optimize_statement(stmt: Statement) -> Statement {
    match stmt {
        Statement::Rule(rule) => {
            optimize_statement(Statement::Expression(rule.to_expression_statement()))
        }
        Statement::Command(command) => {
            optimize_statement(Statement::Expression(command.to_expression_statement()))
        }
        Statement::Expression(mut stmt) => {
            stmt.expression = optimize_expression(stmt.expression);
            Statement::Expression(stmt)
        }
        Statement::Assignment(mut assign) => {
            assign.value = optimize_expression(assign.value);
            Statement::Assignment(assign)
        }
        Statement::FunctionDeclaration(mut decl) => {
            decl.body = decl.body.into_iter().map(optimize_statement).collect();
            Statement::FunctionDeclaration(decl)
        }
    }
}

/// Remove assignments whose name is never referenced and whose expression
/// has no observable side effect. Runs to a fixed point so that chains of
/// dead assignments disappear.
fn remove_dead_assignments(mut statements: Vec<Statement>) -> Vec<Statement> {
    loop {
        let mut used = UsedNames::default();
        for stmt in &statements {
            stmt.visit(&mut used);
        }
        let before = statements.len();
        statements.retain(|stmt| match stmt {
            Statement::Assignment(assign) => {
                used.names.contains(&assign.name) || has_side_effect(&assign.value)
            }
            _ => true,
        });
        if statements.len() == before {
            return statements;
        }
    }
}

/// Optimize a whole input. Legacy rule/command statements are canonicalized
/// into expression statements.
pub fn optimize_input(input: &Input) -> Input {
    match input.clone() {
        Input::Program(mut program) => {
            program.statements = remove_dead_assignments(
                program.statements.into_iter().map(optimize_statement).collect(),
            );
            program.declarations = program
                .declarations
                .into_iter()
                .map(|mut decl| {
                    decl.body = decl.body.into_iter().map(optimize_statement).collect();
                    decl
                })
                .collect();
            Input::Program(program)
        }
        Input::Library(mut library) => {
            library.datasets = library
                .datasets
                .into_iter()
                .map(|mut dataset| {
                    dataset.examples = dataset
                        .examples
                        .into_iter()
                        .map(|mut example| {
                            example.expression = optimize_expression(example.expression);
                            example
                        })
                        .collect();
                    dataset
                })
                .collect();
            Input::Library(library)
        }
        Input::PermissionRule(rule) => {
            let optimize_function = |function: PermissionFunction| match function {
                PermissionFunction::Specified { class_name, channel, filter, schema } => {
                    PermissionFunction::Specified {
                        class_name,
                        channel,
                        filter: optimize_filter(filter),
                        schema,
                    }
                }
                other => other,
            };
            Input::PermissionRule(PermissionRule {
                principal: optimize_filter(rule.principal),
                query: optimize_function(rule.query),
                action: optimize_function(rule.action),
                range: rule.range,
            })
        }
        Input::DialogueState(mut state) => {
            state.statements = state.statements.into_iter().map(optimize_statement).collect();
            Input::DialogueState(state)
        }
        other @ Input::ControlCommand(_) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::parse;
    use crate::compiler::schema::FunctionDef;
    use crate::compiler::tokens::SrcRange;

    fn atom(name: &str, op: &str, n: f64) -> BooleanExpression {
        BooleanExpression::atom(name, op, Value::Number(n))
    }

    #[test]
    fn test_constant_fold_and_dedup() {
        // (a > 1) && true && (b < 2) && (a > 1)  =>  (a > 1) && (b < 2)
        let filter = BooleanExpression::And(vec![
            atom("a", ">", 1.0),
            BooleanExpression::True,
            atom("b", "<", 2.0),
            atom("a", ">", 1.0),
        ]);
        assert_eq!(
            optimize_filter(filter),
            BooleanExpression::And(vec![atom("a", ">", 1.0), atom("b", "<", 2.0)])
        );
    }

    #[test]
    fn test_empty_combinators_normalize() {
        assert_eq!(optimize_filter(BooleanExpression::And(vec![])), BooleanExpression::True);
        assert_eq!(optimize_filter(BooleanExpression::Or(vec![])), BooleanExpression::False);
    }

    #[test]
    fn test_dominating_constants() {
        let filter =
            BooleanExpression::And(vec![atom("a", ">", 1.0), BooleanExpression::False]);
        assert_eq!(optimize_filter(filter), BooleanExpression::False);
        let filter = BooleanExpression::Or(vec![atom("a", ">", 1.0), BooleanExpression::True]);
        assert_eq!(optimize_filter(filter), BooleanExpression::True);
    }

    #[test]
    fn test_double_negation() {
        let filter = BooleanExpression::Not(Box::new(BooleanExpression::Not(Box::new(atom(
            "a", "==", 1.0,
        )))));
        assert_eq!(optimize_filter(filter), atom("a", "==", 1.0));
        assert_eq!(
            optimize_filter(BooleanExpression::Not(Box::new(BooleanExpression::True))),
            BooleanExpression::False
        );
    }

    #[test]
    fn test_nested_flattening() {
        let filter = BooleanExpression::And(vec![
            BooleanExpression::And(vec![atom("a", ">", 1.0), atom("b", ">", 2.0)]),
            atom("c", ">", 3.0),
        ]);
        assert_eq!(
            optimize_filter(filter),
            BooleanExpression::And(vec![
                atom("a", ">", 1.0),
                atom("b", ">", 2.0),
                atom("c", ">", 3.0)
            ])
        );
    }

    #[test]
    fn test_optimizer_idempotent() {
        let filter = BooleanExpression::Or(vec![
            BooleanExpression::And(vec![atom("a", ">", 1.0), BooleanExpression::True]),
            BooleanExpression::Not(Box::new(BooleanExpression::False)),
        ]);
        let once = optimize_filter(filter);
        assert_eq!(optimize_filter(once.clone()), once);
    }

    #[test]
    fn test_compute_with_var_ref_becomes_atom() {
        let filter = BooleanExpression::Compute {
            lhs: Value::VarRef { name: "x".into(), ty: None },
            op: "==".into(),
            rhs: Value::Number(5.0),
        };
        assert_eq!(optimize_filter(filter), atom("x", "==", 5.0));
    }

    #[test]
    fn test_true_filter_dropped() {
        let input = parse("@c.a.q() filter true => notify;").unwrap();
        let optimized = optimize_input(&input);
        let Input::Program(program) = &optimized else { panic!() };
        let Statement::Expression(stmt) = &program.statements[0] else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        assert!(matches!(&chain.expressions[0], Expression::Invocation(_)));
    }

    #[test]
    fn test_legacy_command_canonicalized() {
        let input = parse("now => @c.a.q() => notify;").unwrap();
        let optimized = optimize_input(&input);
        let Input::Program(program) = &optimized else { panic!() };
        assert!(matches!(&program.statements[0], Statement::Expression(_)));
    }

    #[test]
    fn test_dead_assignment_removed() {
        let mut query = Invocation::new("com.a", "q");
        query.schema = Some(Box::new(FunctionDef::new(
            crate::compiler::schema::FunctionKind::Query,
            "q",
            vec![],
        )));
        let dead = Statement::Assignment(Assignment {
            name: "unused".into(),
            value: Expression::Invocation(query),
            schema: None,
            range: SrcRange::default(),
        });
        let keep = parse("monitor @c.a.q() => notify;").unwrap();
        let Input::Program(mut program) = keep else { panic!() };
        program.statements.insert(0, dead);
        let optimized = optimize_input(&Input::Program(program));
        let Input::Program(program) = &optimized else { panic!() };
        assert_eq!(program.statements.len(), 1);
        assert!(matches!(&program.statements[0], Statement::Expression(_)));
    }

    #[test]
    fn test_effectful_assignment_kept() {
        // Untyped invocations are conservatively effectful.
        let input = parse("let x = @c.a.q();  monitor @c.b.s() => notify;").unwrap();
        let optimized = optimize_input(&input);
        let Input::Program(program) = &optimized else { panic!() };
        assert_eq!(program.statements.len(), 2);
    }
}
