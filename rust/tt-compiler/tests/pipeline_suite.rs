//! End-to-end pipeline tests: lex → parse → typecheck → optimize → lower.

use futures::executor::block_on;
use tt_compiler::compiler::ast::{Expression, Input, Statement};
use tt_compiler::compiler::lexer::tokenize;
use tt_compiler::compiler::retriever::StaticSchemaRetriever;
use tt_compiler::compiler::schema::{ArgumentDef, ClassDef, Direction, FunctionDef, FunctionKind};
use tt_compiler::compiler::tokens::TokenKind;
use tt_compiler::compiler::typecheck::typecheck;
use tt_compiler::compiler::types::Type;
use tt_compiler::compiler::values::Value;
use tt_compiler::{compile, optimize_input, parse, pretty};

fn retriever() -> StaticSchemaRetriever {
    let mut weather = ClassDef::new("com.weather");
    let mut current = FunctionDef::new(
        FunctionKind::Query,
        "current",
        vec![
            ArgumentDef::new("city", Direction::InOpt, Type::String),
            ArgumentDef::new("temperature", Direction::Out, Type::Measure("C".into())),
            ArgumentDef::new("humidity", Direction::Out, Type::Number),
        ],
    );
    current.is_monitorable = true;
    current.is_list = true;
    weather.queries.insert("current".into(), current);

    let mut x = ClassDef::new("com.x");
    x.queries.insert(
        "q".into(),
        FunctionDef::new(
            FunctionKind::Query,
            "q",
            vec![ArgumentDef::new("data", Direction::Out, Type::String)],
        ),
    );
    let mut y = ClassDef::new("com.y");
    y.actions.insert(
        "a".into(),
        FunctionDef::new(
            FunctionKind::Action,
            "a",
            vec![ArgumentDef::new("data", Direction::InOpt, Type::String)],
        ),
    );
    StaticSchemaRetriever::with_classes([weather, x, y])
}

#[test]
fn test_lex_simple_rule_token_sequence() {
    let tokens = tokenize("monitor @com.weather.current() => notify;").unwrap();
    let kinds: Vec<_> = tokens.into_iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::Monitor,
            TokenKind::ClassRef("com.weather.current".into()),
            TokenKind::LParen,
            TokenKind::RParen,
            TokenKind::Arrow,
            TokenKind::Ident("notify".into()),
            TokenKind::Semicolon,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn test_typecheck_attaches_measure_to_both_sides() {
    let source = "@com.weather.current() filter temperature > 20C => notify;";
    let typed = block_on(typecheck(&parse(source).unwrap(), &retriever())).unwrap();
    let Input::Program(program) = &typed else { panic!("expected program") };
    let Statement::Expression(stmt) = &program.statements[0] else { panic!() };
    let Expression::Chain(chain) = &stmt.expression else { panic!() };
    let Expression::Filter(filter) = &chain.expressions[0] else { panic!() };
    let schema = filter.schema.as_ref().expect("schema attached");
    assert_eq!(schema.get_arg_type("temperature"), Some(&Type::Measure("C".into())));
    // The literal side must carry the same unit.
    let tt_compiler::compiler::ast::BooleanExpression::Atom { value, .. } = &filter.filter
    else {
        panic!("expected atom")
    };
    assert_eq!(value.get_type(), Type::Measure("C".into()));
}

#[test]
fn test_monitor_lowering_has_async_while_and_notify() {
    let source = "monitor @com.weather.current() => notify;";
    let module = block_on(compile(source, &retriever())).unwrap();
    let text = module.emit();
    assert!(text.contains("try {"), "{}", text);
    assert!(text.contains("invoke_trigger @com.weather.current"), "{}", text);
    assert!(text.contains("invoke_output notify"), "{}", text);
}

#[test]
fn test_permission_rule_roundtrips_identically() {
    let source = "$policy { true : @com.x.q => @com.y.a; }";
    let typed = block_on(typecheck(&parse(source).unwrap(), &retriever())).unwrap();
    let optimized = optimize_input(&typed);
    assert_eq!(pretty(&optimized), source);
}

#[test]
fn test_slot_enumeration_is_total_over_undefined() {
    let source = "@com.weather.current(city=$?) filter temperature > $? => notify;";
    let typed = block_on(typecheck(&parse(source).unwrap(), &retriever())).unwrap();
    let undefined_slots = typed
        .iterate_slots()
        .into_iter()
        .filter(|slot| matches!(slot.value, Value::Undefined { .. }))
        .count();
    assert_eq!(undefined_slots, 2);
}

#[test]
fn test_clone_fidelity() {
    let source = "monitor @com.weather.current() filter temperature > 20C => notify;";
    let input = parse(source).unwrap();
    let copy = input.clone();
    assert_eq!(copy, input);
    // A typed clone still equals its original.
    let typed = block_on(typecheck(&input, &retriever())).unwrap();
    assert_eq!(typed.clone(), typed);
}

#[test]
fn test_typecheck_is_idempotent() {
    let source = "@com.weather.current() filter humidity >= 50 => notify;";
    let r = retriever();
    let once = block_on(typecheck(&parse(source).unwrap(), &r)).unwrap();
    let twice = block_on(typecheck(&once, &r)).unwrap();
    assert_eq!(once, twice);
}

#[test]
fn test_error_order_is_document_order() {
    // Both statements are wrong; the first one must win.
    let source = "@com.weather.bad1() => notify;\n@com.weather.bad2() => notify;";
    let err = block_on(compile(source, &retriever())).unwrap_err();
    assert!(err.to_string().contains("bad1"), "{}", err);
}

#[test]
fn test_chain_of_query_and_action() {
    let source = "@com.x.q() => @com.y.a(data=data);";
    let module = block_on(compile(source, &retriever())).unwrap();
    let text = module.emit();
    assert!(text.contains("invoke_query @com.x.q"), "{}", text);
    assert!(text.contains("invoke_action @com.y.a"), "{}", text);
}
