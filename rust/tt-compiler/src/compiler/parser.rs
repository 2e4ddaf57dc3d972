//! Recursive-descent parser: token stream → untyped AST.
//!
//! The parser accepts exactly the surface syntax the pretty-printer emits,
//! plus the legacy forms (`now =>` commands, `Entity(...)` type syntax).
//! Schemas are attached later by the type checker.

use crate::compiler::ast::*;
use crate::compiler::builtins::SCALAR_OPS;
use crate::compiler::lexer;
use crate::compiler::schema::{
    ArgumentDef, ClassDef, Direction, EntityDef, FunctionDef, FunctionKind, MixinImport,
};
use crate::compiler::tokens::{Span, SrcRange, TildeSide, Token, TokenKind};
use crate::compiler::types::Type;
use crate::compiler::values::{
    DateEdge, DateValue, Location, TimeValue, Value,
};
use chrono::{DateTime, Utc};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found} at line {line}, col {col}")]
    UnexpectedToken { expected: String, found: String, line: usize, col: usize },
    #[error("invalid date literal '{text}' at line {line}")]
    InvalidDate { text: String, line: usize },
    #[error("'{name}' is not a known type at line {line}")]
    UnknownType { name: String, line: usize },
    #[error("'{name}' is not a valid {what} at line {line}")]
    InvalidName { name: String, what: &'static str, line: usize },
}

impl ParseError {
    pub fn line(&self) -> usize {
        match self {
            ParseError::UnexpectedToken { line, .. }
            | ParseError::InvalidDate { line, .. }
            | ParseError::UnknownType { line, .. }
            | ParseError::InvalidName { line, .. } => *line,
        }
    }
}

const FILTER_OP_NAMES: &[&str] = &[
    "starts_with",
    "ends_with",
    "contains",
    "in_array",
    "has_member",
    "group_member",
];

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn peek2(&self) -> &TokenKind {
        self.tokens.get(self.pos + 1).map(|t| &t.kind).unwrap_or(&TokenKind::Eof)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or_else(Span::dummy)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, expected: impl Into<String>) -> ParseError {
        let span = self.span();
        ParseError::UnexpectedToken {
            expected: expected.into(),
            found: self.peek().to_string(),
            line: span.line,
            col: span.col,
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if *self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.error(format!("'{}'", kind)))
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if *self.peek() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("an identifier")),
        }
    }

    fn at_ident(&self, name: &str) -> bool {
        matches!(self.peek(), TokenKind::Ident(s) if s == name)
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if self.at_ident(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn range_from(&self, start: Span) -> SrcRange {
        let end = self
            .tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.span)
            .unwrap_or(start);
        SrcRange::of(start.merge(end))
    }

    // ── Top level ──

    pub fn parse_input(&mut self) -> Result<Input, ParseError> {
        let start = self.span();
        match self.peek() {
            TokenKind::DollarKeyword(kw) => match kw.as_str() {
                "policy" => self.parse_permission_rule(),
                "dialogue" => self.parse_dialogue_state(),
                "yes" | "no" | "stop" | "nevermind" | "debug" | "failed" | "answer" => {
                    self.parse_control_command()
                }
                _ => self.parse_program_or_library(start),
            },
            _ => self.parse_program_or_library(start),
        }
    }

    fn parse_program_or_library(&mut self, start: Span) -> Result<Input, ParseError> {
        let mut classes = Vec::new();
        let mut datasets = Vec::new();
        let mut declarations = Vec::new();
        let mut statements = Vec::new();
        let mut principal = None;

        if self.at_ident("executor") && *self.peek2() == TokenKind::Assign {
            self.advance();
            self.advance();
            principal = Some(self.parse_value()?);
            self.expect(TokenKind::Colon)?;
        }

        while *self.peek() != TokenKind::Eof {
            match self.peek() {
                TokenKind::Class => classes.push(self.parse_class()?),
                TokenKind::Dataset => datasets.push(self.parse_dataset()?),
                TokenKind::Let => statements.push(self.parse_assignment()?),
                TokenKind::Function => {
                    let Statement::FunctionDeclaration(decl) = self.parse_function_declaration()?
                    else {
                        unreachable!("parse_function_declaration returns a declaration")
                    };
                    declarations.push(decl);
                }
                TokenKind::Now if *self.peek2() == TokenKind::Arrow => {
                    statements.push(self.parse_command_statement()?);
                }
                _ => {
                    let stmt_start = self.span();
                    let expression = self.parse_expression()?;
                    self.expect(TokenKind::Semicolon)?;
                    statements.push(Statement::Expression(ExpressionStatement {
                        expression,
                        range: self.range_from(stmt_start),
                    }));
                }
            }
        }

        let is_library = !datasets.is_empty()
            || (!classes.is_empty() && statements.is_empty() && declarations.is_empty());
        if is_library {
            if !statements.is_empty() || !declarations.is_empty() {
                return Err(self.error("a library without executable statements"));
            }
            Ok(Input::Library(Library { classes, datasets, range: self.range_from(start) }))
        } else {
            Ok(Input::Program(Program {
                classes,
                declarations,
                statements,
                principal,
                nl_annotations: Default::default(),
                impl_annotations: Default::default(),
                range: self.range_from(start),
            }))
        }
    }

    fn parse_permission_rule(&mut self) -> Result<Input, ParseError> {
        let start = self.span();
        self.advance(); // $policy
        self.expect(TokenKind::LBrace)?;
        let principal = self.parse_boolean()?;
        self.expect(TokenKind::Colon)?;
        let query = self.parse_permission_function()?;
        self.expect(TokenKind::Arrow)?;
        let action = self.parse_permission_function()?;
        self.expect(TokenKind::Semicolon)?;
        self.expect(TokenKind::RBrace)?;
        Ok(Input::PermissionRule(PermissionRule {
            principal,
            query,
            action,
            range: self.range_from(start),
        }))
    }

    fn parse_permission_function(&mut self) -> Result<PermissionFunction, ParseError> {
        match self.peek().clone() {
            TokenKind::Ident(name) if name == "notify" => {
                self.advance();
                Ok(PermissionFunction::Builtin)
            }
            TokenKind::Star => {
                self.advance();
                Ok(PermissionFunction::Star)
            }
            TokenKind::ClassRef(name) => {
                self.advance();
                if *self.peek() == TokenKind::Dot && *self.peek2() == TokenKind::Star {
                    self.advance();
                    self.advance();
                    return Ok(PermissionFunction::ClassStar(name));
                }
                let (class_name, channel) = split_channel(&name)
                    .ok_or_else(|| ParseError::InvalidName {
                        name: name.clone(),
                        what: "function reference",
                        line: self.span().line,
                    })?;
                let filter = if self.eat(TokenKind::Filter) {
                    self.parse_boolean()?
                } else {
                    BooleanExpression::True
                };
                Ok(PermissionFunction::Specified {
                    class_name,
                    channel,
                    filter,
                    schema: None,
                })
            }
            _ => Err(self.error("a permission function")),
        }
    }

    fn parse_dialogue_state(&mut self) -> Result<Input, ParseError> {
        let start = self.span();
        self.advance(); // $dialogue
        let policy = match self.advance() {
            TokenKind::ClassRef(name) => name,
            _ => return Err(self.error("a policy name")),
        };
        self.expect(TokenKind::Semicolon)?;
        let mut statements = Vec::new();
        while *self.peek() != TokenKind::Eof {
            statements.push(self.parse_statement()?);
        }
        Ok(Input::DialogueState(DialogueState {
            policy,
            statements,
            range: self.range_from(start),
        }))
    }

    fn parse_control_command(&mut self) -> Result<Input, ParseError> {
        let start = self.span();
        let TokenKind::DollarKeyword(kw) = self.advance() else {
            return Err(self.error("a control command"));
        };
        let intent = match kw.as_str() {
            "yes" => ControlIntent::Yes,
            "no" => ControlIntent::No,
            "stop" => ControlIntent::Stop,
            "nevermind" => ControlIntent::Nevermind,
            "debug" => ControlIntent::Debug,
            "failed" => ControlIntent::Failed,
            "answer" => {
                self.expect(TokenKind::LParen)?;
                let value = self.parse_value()?;
                self.expect(TokenKind::RParen)?;
                ControlIntent::Answer(value)
            }
            _ => return Err(self.error("a control command")),
        };
        self.expect(TokenKind::Semicolon)?;
        Ok(Input::ControlCommand(ControlCommand { intent, range: self.range_from(start) }))
    }

    // ── Statements ──

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        match self.peek() {
            TokenKind::Let => self.parse_assignment(),
            TokenKind::Function => self.parse_function_declaration(),
            TokenKind::Now if *self.peek2() == TokenKind::Arrow => {
                self.parse_command_statement()
            }
            _ => {
                let start = self.span();
                let expression = self.parse_expression()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Statement::Expression(ExpressionStatement {
                    expression,
                    range: self.range_from(start),
                }))
            }
        }
    }

    fn parse_assignment(&mut self) -> Result<Statement, ParseError> {
        let start = self.span();
        self.expect(TokenKind::Let)?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::Assign)?;
        let value = self.parse_expression()?;
        self.expect(TokenKind::Semicolon)?;
        Ok(Statement::Assignment(Assignment {
            name,
            value,
            schema: None,
            range: self.range_from(start),
        }))
    }

    fn parse_function_declaration(&mut self) -> Result<Statement, ParseError> {
        let start = self.span();
        self.expect(TokenKind::Function)?;
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let mut args = Vec::new();
        while *self.peek() != TokenKind::RParen {
            if !args.is_empty() {
                self.expect(TokenKind::Comma)?;
            }
            let arg_name = self.expect_ident()?;
            self.expect(TokenKind::Colon)?;
            let ty = self.parse_type()?;
            args.push(ArgumentDef::new(arg_name, Direction::InReq, ty));
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::LBrace)?;
        let mut body = Vec::new();
        while !self.eat(TokenKind::RBrace) {
            body.push(self.parse_statement()?);
        }
        self.eat(TokenKind::Semicolon);
        Ok(Statement::FunctionDeclaration(FunctionDeclaration {
            name,
            args,
            body,
            schema: None,
            range: self.range_from(start),
        }))
    }

    fn parse_command_statement(&mut self) -> Result<Statement, ParseError> {
        let start = self.span();
        self.expect(TokenKind::Now)?;
        self.expect(TokenKind::Arrow)?;
        let expression = self.parse_expression()?;
        self.expect(TokenKind::Semicolon)?;
        let range = self.range_from(start);
        let (table, actions) = match expression {
            Expression::Chain(chain) => {
                let mut parts = chain.expressions;
                let rest = parts.split_off(1);
                (parts.pop(), rest)
            }
            single => (None, vec![single]),
        };
        Ok(Statement::Command(CommandStatement { table, actions, range }))
    }

    // ── Expressions ──

    pub fn parse_expression(&mut self) -> Result<Expression, ParseError> {
        let start = self.span();
        let first = self.parse_unary_expression()?;
        if *self.peek() != TokenKind::Arrow {
            return Ok(first);
        }
        let mut expressions = vec![first];
        while self.eat(TokenKind::Arrow) {
            expressions.push(self.parse_unary_expression()?);
        }
        Ok(Expression::Chain(ChainExpression {
            expressions,
            schema: None,
            range: self.range_from(start),
        }))
    }

    fn parse_unary_expression(&mut self) -> Result<Expression, ParseError> {
        let start = self.span();
        match self.peek().clone() {
            TokenKind::Monitor => {
                self.advance();
                let mut args = Vec::new();
                if self.eat(TokenKind::LBracket) {
                    loop {
                        args.push(self.expect_ident()?);
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RBracket)?;
                    self.expect(TokenKind::Of)?;
                }
                let inner = self.parse_unary_expression()?;
                Ok(Expression::Monitor(MonitorExpression {
                    inner: Box::new(inner),
                    args,
                    schema: None,
                    range: self.range_from(start),
                }))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut args = vec![self.expect_ident()?];
                while self.eat(TokenKind::Comma) {
                    args.push(self.expect_ident()?);
                }
                self.expect(TokenKind::RBracket)?;
                self.expect(TokenKind::Of)?;
                let inner = self.parse_unary_expression()?;
                Ok(Expression::Projection(ProjectionExpression {
                    inner: Box::new(inner),
                    args,
                    schema: None,
                    range: self.range_from(start),
                }))
            }
            TokenKind::Aggregate => {
                self.advance();
                let op_name = self.expect_ident()?;
                let operator = AggregationOperator::from_str(&op_name).map_err(|_| {
                    ParseError::InvalidName {
                        name: op_name,
                        what: "aggregation operator",
                        line: start.line,
                    }
                })?;
                let field = if *self.peek() == TokenKind::Of {
                    None
                } else {
                    Some(self.expect_ident()?)
                };
                self.expect(TokenKind::Of)?;
                let inner = self.parse_unary_expression()?;
                Ok(Expression::Aggregation(AggregationExpression {
                    inner: Box::new(inner),
                    operator,
                    field,
                    schema: None,
                    range: self.range_from(start),
                }))
            }
            TokenKind::Ident(name) if name == "edge" => {
                self.advance();
                let inner = self.parse_unary_expression()?;
                self.expect(TokenKind::On)?;
                if self.eat(TokenKind::New) {
                    Ok(Expression::EdgeNew(EdgeNewExpression {
                        inner: Box::new(inner),
                        schema: None,
                        range: self.range_from(start),
                    }))
                } else {
                    let filter = self.parse_boolean()?;
                    Ok(Expression::EdgeFilter(EdgeFilterExpression {
                        inner: Box::new(inner),
                        filter,
                        schema: None,
                        range: self.range_from(start),
                    }))
                }
            }
            TokenKind::Sort => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let field = self.expect_ident()?;
                let dir_name = self.expect_ident()?;
                let direction = SortDirection::from_str(&dir_name).map_err(|_| {
                    ParseError::InvalidName {
                        name: dir_name,
                        what: "sort direction",
                        line: start.line,
                    }
                })?;
                self.expect(TokenKind::Of)?;
                let inner = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(Expression::Sort(SortExpression {
                    inner: Box::new(inner),
                    field,
                    direction,
                    schema: None,
                    range: self.range_from(start),
                }))
            }
            _ => self.parse_postfix_expression(),
        }
    }

    fn parse_postfix_expression(&mut self) -> Result<Expression, ParseError> {
        let start = self.span();
        let mut expr = self.parse_primary_expression()?;
        loop {
            match self.peek() {
                TokenKind::Filter => {
                    self.advance();
                    let filter = self.parse_boolean()?;
                    expr = Expression::Filter(FilterExpression {
                        inner: Box::new(expr),
                        filter,
                        schema: None,
                        range: self.range_from(start),
                    });
                }
                TokenKind::LBracket => {
                    self.advance();
                    let first = self.parse_value()?;
                    if self.eat(TokenKind::Colon) {
                        let limit = self.parse_value()?;
                        self.expect(TokenKind::RBracket)?;
                        expr = Expression::Slice(SliceExpression {
                            inner: Box::new(expr),
                            base: first,
                            limit,
                            schema: None,
                            range: self.range_from(start),
                        });
                    } else {
                        let mut indices = vec![first];
                        while self.eat(TokenKind::Comma) {
                            indices.push(self.parse_value()?);
                        }
                        self.expect(TokenKind::RBracket)?;
                        expr = Expression::Index(IndexExpression {
                            inner: Box::new(expr),
                            indices,
                            schema: None,
                            range: self.range_from(start),
                        });
                    }
                }
                TokenKind::As => {
                    self.advance();
                    let name = self.expect_ident()?;
                    expr = Expression::Alias(AliasExpression {
                        inner: Box::new(expr),
                        name,
                        schema: None,
                        range: self.range_from(start),
                    });
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary_expression(&mut self) -> Result<Expression, ParseError> {
        let start = self.span();
        match self.peek().clone() {
            TokenKind::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::ClassRef(name) => {
                self.advance();
                self.parse_invocation(name, start)
            }
            TokenKind::Ident(name) if name == "timer" && *self.peek2() == TokenKind::LParen => {
                self.advance();
                let params = self.parse_input_params()?;
                let mut interval = None;
                let mut frequency = None;
                for param in params {
                    match param.name.as_str() {
                        "interval" => interval = Some(param.value),
                        "frequency" => frequency = Some(param.value),
                        other => {
                            return Err(ParseError::InvalidName {
                                name: other.to_string(),
                                what: "timer parameter",
                                line: start.line,
                            })
                        }
                    }
                }
                let interval = interval.ok_or(ParseError::InvalidName {
                    name: "interval".into(),
                    what: "missing timer parameter",
                    line: start.line,
                })?;
                Ok(Expression::Timer(TimerExpression {
                    interval,
                    frequency,
                    schema: None,
                    range: self.range_from(start),
                }))
            }
            TokenKind::Ident(name) if name == "attimer" && *self.peek2() == TokenKind::LParen => {
                self.advance();
                let params = self.parse_input_params()?;
                let mut times = Vec::new();
                for param in params {
                    if param.name != "time" {
                        return Err(ParseError::InvalidName {
                            name: param.name,
                            what: "attimer parameter",
                            line: start.line,
                        });
                    }
                    match param.value {
                        Value::Array(elements) => times.extend(elements),
                        single => times.push(single),
                    }
                }
                Ok(Expression::AtTimer(AtTimerExpression {
                    times,
                    schema: None,
                    range: self.range_from(start),
                }))
            }
            TokenKind::Ident(name) => {
                self.advance();
                let mut call = FunctionCall::new(name);
                if *self.peek() == TokenKind::LParen {
                    call.in_params = self.parse_input_params()?;
                }
                call.range = self.range_from(start);
                Ok(Expression::FunctionCall(call))
            }
            _ => Err(self.error("an expression")),
        }
    }

    fn parse_invocation(&mut self, name: String, start: Span) -> Result<Expression, ParseError> {
        let mut params = if *self.peek() == TokenKind::LParen {
            self.parse_input_params()?
        } else {
            Vec::new()
        };
        let mut selector_params = Vec::new();
        let (class_name, channel) = if self.eat(TokenKind::Dot) {
            // The first parenthesized list belonged to the selector.
            selector_params = std::mem::take(&mut params);
            let channel = self.expect_ident()?;
            params = self.parse_input_params()?;
            (name, channel)
        } else {
            split_channel(&name).ok_or_else(|| ParseError::InvalidName {
                name: name.clone(),
                what: "function reference",
                line: start.line,
            })?
        };
        let mut selector = Selector::new(class_name);
        for attr in selector_params {
            match (attr.name.as_str(), attr.value) {
                ("id", Value::String(id)) => selector.id = Some(id),
                ("principal", value) => selector.principal = Some(value),
                ("all", Value::Boolean(true)) => selector.all_devices = true,
                (other, _) => {
                    return Err(ParseError::InvalidName {
                        name: other.to_string(),
                        what: "device attribute",
                        line: start.line,
                    })
                }
            }
        }
        Ok(Expression::Invocation(Invocation {
            selector,
            channel,
            in_params: params,
            schema: None,
            range: self.range_from(start),
        }))
    }

    fn parse_input_params(&mut self) -> Result<Vec<InputParam>, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        while *self.peek() != TokenKind::RParen {
            if !params.is_empty() {
                self.expect(TokenKind::Comma)?;
            }
            let name = self.expect_ident()?;
            self.expect(TokenKind::Assign)?;
            let value = self.parse_value()?;
            params.push(InputParam::new(name, value));
        }
        self.expect(TokenKind::RParen)?;
        Ok(params)
    }

    // ── Boolean expressions ──

    pub fn parse_boolean(&mut self) -> Result<BooleanExpression, ParseError> {
        let mut operands = vec![self.parse_boolean_and()?];
        while self.eat(TokenKind::PipePipe) {
            operands.push(self.parse_boolean_and()?);
        }
        if operands.len() == 1 {
            Ok(operands.into_iter().next().expect("one operand"))
        } else {
            Ok(BooleanExpression::Or(operands))
        }
    }

    fn parse_boolean_and(&mut self) -> Result<BooleanExpression, ParseError> {
        let mut operands = vec![self.parse_boolean_unary()?];
        while self.eat(TokenKind::AmpAmp) {
            operands.push(self.parse_boolean_unary()?);
        }
        if operands.len() == 1 {
            Ok(operands.into_iter().next().expect("one operand"))
        } else {
            Ok(BooleanExpression::And(operands))
        }
    }

    fn parse_boolean_unary(&mut self) -> Result<BooleanExpression, ParseError> {
        if self.eat(TokenKind::Bang) {
            let inner = self.parse_boolean_unary()?;
            return Ok(BooleanExpression::Not(Box::new(inner)));
        }
        self.parse_boolean_primary()
    }

    fn parse_boolean_primary(&mut self) -> Result<BooleanExpression, ParseError> {
        match self.peek().clone() {
            TokenKind::True => {
                self.advance();
                if self.eat(TokenKind::LParen) {
                    let name = self.expect_ident()?;
                    self.expect(TokenKind::RParen)?;
                    Ok(BooleanExpression::DontCare { name })
                } else {
                    Ok(BooleanExpression::True)
                }
            }
            TokenKind::False => {
                self.advance();
                Ok(BooleanExpression::False)
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_boolean()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::Any => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let query = self.parse_expression()?;
                self.expect(TokenKind::RParen)?;
                Ok(BooleanExpression::ExistentialSubquery(Box::new(query)))
            }
            TokenKind::ClassRef(name) => {
                self.advance();
                let (class_name, channel) = split_channel(&name)
                    .ok_or_else(|| ParseError::InvalidName {
                        name: name.clone(),
                        what: "function reference",
                        line: self.span().line,
                    })?;
                let in_params = self.parse_input_params()?;
                self.expect(TokenKind::LBrace)?;
                let filter = self.parse_boolean()?;
                self.expect(TokenKind::RBrace)?;
                Ok(BooleanExpression::External {
                    class_name,
                    channel,
                    in_params,
                    filter: Box::new(filter),
                })
            }
            _ => self.parse_comparison(),
        }
    }

    fn parse_comparison(&mut self) -> Result<BooleanExpression, ParseError> {
        let lhs = self.parse_value()?;
        // A dotted bare reference is a property path.
        if let Value::VarRef { name, .. } = &lhs {
            if *self.peek() == TokenKind::Dot {
                let mut path = vec![name.clone()];
                while self.eat(TokenKind::Dot) {
                    path.push(self.expect_ident()?);
                }
                let op = self.parse_filter_op()?;
                let value = self.parse_value()?;
                return Ok(BooleanExpression::PropertyPath { path, op, value });
            }
        }
        let op = self.parse_filter_op()?;
        if *self.peek() == TokenKind::Any {
            self.advance();
            self.expect(TokenKind::LParen)?;
            let query = self.parse_expression()?;
            self.expect(TokenKind::RParen)?;
            return Ok(BooleanExpression::ComparisonSubquery {
                lhs,
                op,
                query: Box::new(query),
            });
        }
        let rhs = self.parse_value()?;
        match lhs {
            Value::VarRef { name, .. } => Ok(BooleanExpression::Atom { name, op, value: rhs }),
            lhs => Ok(BooleanExpression::Compute { lhs, op, rhs }),
        }
    }

    fn parse_filter_op(&mut self) -> Result<String, ParseError> {
        let op = match self.peek() {
            TokenKind::Eq => "==".to_string(),
            TokenKind::Ge => ">=".to_string(),
            TokenKind::Le => "<=".to_string(),
            TokenKind::Gt => ">".to_string(),
            TokenKind::Lt => "<".to_string(),
            TokenKind::EqTilde => "=~".to_string(),
            TokenKind::TildeEq => "~=".to_string(),
            TokenKind::TildeOp(name, TildeSide::Before) => format!("~{}", name),
            TokenKind::TildeOp(name, TildeSide::After) => format!("{}~", name),
            TokenKind::Ident(name) if FILTER_OP_NAMES.contains(&name.as_str()) => name.clone(),
            _ => return Err(self.error("a comparison operator")),
        };
        self.advance();
        Ok(op)
    }

    // ── Values ──

    pub fn parse_value(&mut self) -> Result<Value, ParseError> {
        let value = self.parse_additive_value()?;
        if self.eat(TokenKind::Filter) {
            let filter = self.parse_boolean()?;
            return Ok(Value::Filter { value: Box::new(value), filter: Box::new(filter) });
        }
        Ok(value)
    }

    fn parse_additive_value(&mut self) -> Result<Value, ParseError> {
        let mut value = self.parse_multiplicative_value()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => "+",
                TokenKind::Minus => "-",
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative_value()?;
            value = Value::Computation { op: op.into(), operands: vec![value, rhs], ty: None };
        }
        Ok(value)
    }

    fn parse_multiplicative_value(&mut self) -> Result<Value, ParseError> {
        let mut value = self.parse_power_value()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => "*",
                TokenKind::Slash => "/",
                TokenKind::Percent => "%",
                _ => break,
            };
            self.advance();
            let rhs = self.parse_power_value()?;
            value = Value::Computation { op: op.into(), operands: vec![value, rhs], ty: None };
        }
        Ok(value)
    }

    fn parse_power_value(&mut self) -> Result<Value, ParseError> {
        let mut value = self.parse_primary_value()?;
        while self.eat(TokenKind::StarStar) {
            let rhs = self.parse_primary_value()?;
            value = Value::Computation { op: "**".into(), operands: vec![value, rhs], ty: None };
        }
        Ok(value)
    }

    fn parse_primary_value(&mut self) -> Result<Value, ParseError> {
        let start = self.span();
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Value::Number(n))
            }
            TokenKind::Measure(value, unit) => {
                self.advance();
                Ok(Value::Measure { value, unit })
            }
            TokenKind::Str(s) => {
                self.advance();
                self.parse_entity_suffix(Some(s))
            }
            TokenKind::Null if matches!(self.peek2(), TokenKind::EntityRef(_)) => {
                self.advance();
                self.parse_entity_suffix(None)
            }
            TokenKind::Constant(v) => {
                self.advance();
                Ok(v)
            }
            TokenKind::True => {
                self.advance();
                Ok(Value::Boolean(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Value::Boolean(false))
            }
            TokenKind::Enum => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let tag = self.expect_ident()?;
                self.expect(TokenKind::RParen)?;
                Ok(Value::Enum(tag))
            }
            TokenKind::New => {
                self.advance();
                self.parse_constructor(start)
            }
            TokenKind::DollarKeyword(kw) => {
                self.advance();
                self.parse_dollar_value(&kw)
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                while *self.peek() != TokenKind::RBracket {
                    if !elements.is_empty() {
                        self.expect(TokenKind::Comma)?;
                    }
                    elements.push(self.parse_value()?);
                }
                self.expect(TokenKind::RBracket)?;
                Ok(Value::Array(elements))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut fields = std::collections::BTreeMap::new();
                while *self.peek() != TokenKind::RBrace {
                    if !fields.is_empty() {
                        self.expect(TokenKind::Comma)?;
                    }
                    let name = self.expect_ident()?;
                    self.expect(TokenKind::Assign)?;
                    fields.insert(name, self.parse_value()?);
                }
                self.expect(TokenKind::RBrace)?;
                Ok(Value::Object(fields))
            }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_primary_value()?;
                match operand {
                    Value::Number(n) => Ok(Value::Number(-n)),
                    Value::Measure { value, unit } => Ok(Value::Measure { value: -value, unit }),
                    other => Ok(Value::Computation {
                        op: "-".into(),
                        operands: vec![Value::Number(0.0), other],
                        ty: None,
                    }),
                }
            }
            TokenKind::LParen => {
                self.advance();
                let value = self.parse_value()?;
                self.expect(TokenKind::RParen)?;
                Ok(value)
            }
            TokenKind::Ident(name) => {
                self.advance();
                if SCALAR_OPS.contains_key(name.as_str()) && *self.peek() == TokenKind::LParen {
                    self.advance();
                    let mut operands = Vec::new();
                    while *self.peek() != TokenKind::RParen {
                        if !operands.is_empty() {
                            self.expect(TokenKind::Comma)?;
                        }
                        operands.push(self.parse_value()?);
                    }
                    self.expect(TokenKind::RParen)?;
                    return Ok(Value::Computation { op: name, operands, ty: None });
                }
                if self.eat(TokenKind::Of) {
                    let value = self.parse_primary_value()?;
                    return Ok(Value::ArrayField {
                        value: Box::new(value),
                        field: name,
                        ty: None,
                    });
                }
                Ok(Value::VarRef { name, ty: None })
            }
            _ => Err(self.error("a value")),
        }
    }

    /// `"x"^^com.foo:bar("Display")` or `null^^com.foo:bar`
    fn parse_entity_suffix(&mut self, value: Option<String>) -> Result<Value, ParseError> {
        if let TokenKind::EntityRef(ty) = self.peek().clone() {
            self.advance();
            let display = if *self.peek() == TokenKind::LParen {
                self.advance();
                let display = match self.advance() {
                    TokenKind::Str(s) => s,
                    _ => return Err(self.error("a display string")),
                };
                self.expect(TokenKind::RParen)?;
                Some(display)
            } else {
                None
            };
            return Ok(Value::Entity { value, ty, display });
        }
        match value {
            Some(s) => Ok(Value::String(s)),
            None => Err(self.error("an entity type")),
        }
    }

    fn parse_constructor(&mut self, start: Span) -> Result<Value, ParseError> {
        let name = self.expect_ident()?;
        self.expect(TokenKind::LParen)?;
        let value = match name.as_str() {
            "Date" => {
                if *self.peek() == TokenKind::RParen {
                    Value::Date(DateValue::Now)
                } else if let TokenKind::Str(text) = self.peek().clone() {
                    self.advance();
                    let parsed = DateTime::parse_from_rfc3339(&text).map_err(|_| {
                        ParseError::InvalidDate { text: text.clone(), line: start.line }
                    })?;
                    Value::Date(DateValue::Absolute(parsed.with_timezone(&Utc)))
                } else {
                    self.parse_date_piece()?
                }
            }
            "Time" => {
                let hour = self.parse_small_number()?;
                self.expect(TokenKind::Comma)?;
                let minute = self.parse_small_number()?;
                let second = if self.eat(TokenKind::Comma) {
                    self.parse_small_number()?
                } else {
                    0
                };
                Value::Time(TimeValue::Absolute { hour, minute, second })
            }
            "Location" => {
                if let TokenKind::Str(name) = self.peek().clone() {
                    self.advance();
                    Value::Location(Location::Unresolved(name))
                } else {
                    let lat = self.parse_signed_number()?;
                    self.expect(TokenKind::Comma)?;
                    let lon = self.parse_signed_number()?;
                    let display = if self.eat(TokenKind::Comma) {
                        match self.advance() {
                            TokenKind::Str(s) => Some(s),
                            _ => return Err(self.error("a display string")),
                        }
                    } else {
                        None
                    };
                    Value::Location(Location::Absolute { lat, lon, display })
                }
            }
            "Currency" => {
                let value = self.parse_signed_number()?;
                self.expect(TokenKind::Comma)?;
                let code = self.expect_ident()?;
                Value::Currency { value, code }
            }
            "ArgMap" => {
                let mut fields = std::collections::BTreeMap::new();
                while *self.peek() != TokenKind::RParen {
                    if !fields.is_empty() {
                        self.expect(TokenKind::Comma)?;
                    }
                    let name = self.expect_ident()?;
                    self.expect(TokenKind::Assign)?;
                    fields.insert(name, self.parse_value()?);
                }
                self.expect(TokenKind::RParen)?;
                return Ok(Value::ArgMap(fields));
            }
            other => {
                return Err(ParseError::InvalidName {
                    name: other.to_string(),
                    what: "constructor",
                    line: start.line,
                })
            }
        };
        self.expect(TokenKind::RParen)?;
        Ok(value)
    }

    /// The argument list of `new Date(year, month, day[, time])` with
    /// `null` for unspecified fields.
    fn parse_date_piece(&mut self) -> Result<Value, ParseError> {
        let year = self.parse_optional_number()?.map(|n| n as i32);
        let mut month = None;
        let mut day = None;
        let mut time = None;
        if self.eat(TokenKind::Comma) {
            month = self.parse_optional_number()?.map(|n| n as u32);
            if self.eat(TokenKind::Comma) {
                day = self.parse_optional_number()?.map(|n| n as u32);
                if self.eat(TokenKind::Comma) {
                    self.expect(TokenKind::New)?;
                    let inner = self.parse_constructor(self.span())?;
                    match inner {
                        Value::Time(t) => time = Some(t),
                        _ => return Err(self.error("a time constructor")),
                    }
                }
            }
        }
        Ok(Value::Date(DateValue::DatePiece { year, month, day, time }))
    }

    fn parse_optional_number(&mut self) -> Result<Option<f64>, ParseError> {
        if self.eat(TokenKind::Null) {
            return Ok(None);
        }
        Ok(Some(self.parse_signed_number()?))
    }

    fn parse_signed_number(&mut self) -> Result<f64, ParseError> {
        let negative = self.eat(TokenKind::Minus);
        match self.advance() {
            TokenKind::Number(n) => Ok(if negative { -n } else { n }),
            _ => Err(self.error("a number")),
        }
    }

    fn parse_small_number(&mut self) -> Result<u32, ParseError> {
        match self.advance() {
            TokenKind::Number(n) if n >= 0.0 && n.fract() == 0.0 => Ok(n as u32),
            _ => Err(self.error("a non-negative integer")),
        }
    }

    fn parse_dollar_value(&mut self, kw: &str) -> Result<Value, ParseError> {
        match kw {
            "now" => Ok(Value::Date(DateValue::Now)),
            "undefined" => Ok(Value::Undefined { local: false }),
            "?" => Ok(Value::Undefined { local: true }),
            "event" => {
                if self.eat(TokenKind::Dot) {
                    Ok(Value::Event(Some(self.expect_ident()?)))
                } else {
                    Ok(Value::Event(None))
                }
            }
            "location" => {
                self.expect(TokenKind::Dot)?;
                Ok(Value::Location(Location::Relative(self.expect_ident()?)))
            }
            "time" => {
                self.expect(TokenKind::Dot)?;
                Ok(Value::Time(TimeValue::Relative(self.expect_ident()?)))
            }
            "start_of" | "end_of" => {
                self.expect(TokenKind::LParen)?;
                let unit = self.expect_ident()?;
                self.expect(TokenKind::RParen)?;
                let edge = if kw == "start_of" { DateEdge::StartOf } else { DateEdge::EndOf };
                Ok(Value::Date(DateValue::Edge { edge, unit }))
            }
            "context" => {
                self.expect(TokenKind::Dot)?;
                let name = self.expect_ident()?;
                self.expect(TokenKind::Colon)?;
                let ty = self.parse_type()?;
                Ok(Value::ContextRef { name, ty })
            }
            "program_id" => Ok(Value::ContextRef {
                name: "program_id".into(),
                ty: Type::Entity("tt:program_id".into()),
            }),
            "source" => Ok(Value::VarRef { name: "source".into(), ty: None }),
            other => Err(ParseError::InvalidName {
                name: format!("${}", other),
                what: "value",
                line: self.span().line,
            }),
        }
    }

    // ── Types ──

    pub fn parse_type(&mut self) -> Result<Type, ParseError> {
        let start = self.span();
        if self.eat(TokenKind::Enum) {
            self.expect(TokenKind::LParen)?;
            if self.eat(TokenKind::Star) {
                self.expect(TokenKind::RParen)?;
                return Ok(Type::Enum(None));
            }
            let mut members = vec![self.expect_ident()?];
            while self.eat(TokenKind::Comma) {
                members.push(self.expect_ident()?);
            }
            self.expect(TokenKind::RParen)?;
            return Ok(Type::Enum(Some(members)));
        }
        let name = self.expect_ident()?;
        let ty = match name.as_str() {
            "Boolean" => Type::Boolean,
            "String" => Type::String,
            "Number" => Type::Number,
            "Currency" => Type::Currency,
            "Date" => Type::Date,
            "Time" => Type::Time,
            "Location" => Type::Location,
            "RecurrentTimeSpecification" => Type::RecurrentTimeSpecification,
            "ArgMap" => Type::ArgMap,
            "Any" => Type::Any,
            "User" => Type::User,
            "Feed" => Type::Feed,
            "Measure" => {
                self.expect(TokenKind::LParen)?;
                let unit = self.expect_ident()?;
                self.expect(TokenKind::RParen)?;
                Type::Measure(unit)
            }
            "Array" => {
                self.expect(TokenKind::LParen)?;
                let elem = self.parse_type()?;
                self.expect(TokenKind::RParen)?;
                Type::Array(Box::new(elem))
            }
            "Map" => {
                self.expect(TokenKind::LParen)?;
                let key = self.parse_type()?;
                self.expect(TokenKind::Comma)?;
                let value = self.parse_type()?;
                self.expect(TokenKind::RParen)?;
                Type::Map(Box::new(key), Box::new(value))
            }
            "Tuple" => {
                self.expect(TokenKind::LParen)?;
                let mut fields = vec![self.parse_type()?];
                while self.eat(TokenKind::Comma) {
                    fields.push(self.parse_type()?);
                }
                self.expect(TokenKind::RParen)?;
                Type::Tuple(fields)
            }
            "Entity" => {
                // Legacy form: the name arrives as separate tokens.
                self.expect(TokenKind::LParen)?;
                let mut entity = self.expect_ident()?;
                while self.eat(TokenKind::Dot) {
                    entity.push('.');
                    entity.push_str(&self.expect_ident()?);
                }
                self.expect(TokenKind::Colon)?;
                entity.push(':');
                entity.push_str(&self.expect_ident()?);
                self.expect(TokenKind::RParen)?;
                Type::Entity(entity)
            }
            other => {
                return Err(ParseError::UnknownType {
                    name: other.to_string(),
                    line: start.line,
                })
            }
        };
        Ok(ty)
    }

    // ── Classes and datasets ──

    fn parse_annotations(
        &mut self,
    ) -> Result<(crate::compiler::schema::AnnotationMap, crate::compiler::schema::AnnotationMap), ParseError>
    {
        let mut nl = crate::compiler::schema::AnnotationMap::new();
        let mut impl_ = crate::compiler::schema::AnnotationMap::new();
        loop {
            let is_nl = match self.peek() {
                TokenKind::HashUnderBracket => true,
                TokenKind::HashBracket => false,
                _ => break,
            };
            self.advance();
            let key = self.expect_ident()?;
            self.expect(TokenKind::Assign)?;
            let value = self.parse_value()?;
            self.expect(TokenKind::RBracket)?;
            if is_nl {
                nl.insert(key, value);
            } else {
                impl_.insert(key, value);
            }
        }
        Ok((nl, impl_))
    }

    fn parse_class(&mut self) -> Result<ClassDef, ParseError> {
        let start = self.span();
        self.expect(TokenKind::Class)?;
        let name = match self.advance() {
            TokenKind::ClassRef(name) => name,
            _ => return Err(self.error("a class name")),
        };
        let mut class = ClassDef::new(name);
        if self.eat(TokenKind::Extends) {
            loop {
                match self.advance() {
                    TokenKind::ClassRef(parent) => class.extends.push(parent),
                    _ => return Err(self.error("a parent class name")),
                }
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        let (nl, impl_) = self.parse_annotations()?;
        class.nl_annotations = nl;
        class.impl_annotations = impl_;
        self.expect(TokenKind::LBrace)?;
        while !self.eat(TokenKind::RBrace) {
            if self.eat(TokenKind::Import) {
                let mut facets = vec![self.expect_ident()?];
                while self.eat(TokenKind::Comma) {
                    facets.push(self.expect_ident()?);
                }
                self.expect(TokenKind::From)?;
                let module = match self.advance() {
                    TokenKind::ClassRef(module) => module,
                    _ => return Err(self.error("a mixin module name")),
                };
                self.expect(TokenKind::LParen)?;
                self.expect(TokenKind::RParen)?;
                self.expect(TokenKind::Semicolon)?;
                class.imports.push(MixinImport { facets, module });
            } else if self.at_ident("entity") {
                self.advance();
                let name = self.expect_ident()?;
                let (nl, _) = self.parse_annotations()?;
                self.expect(TokenKind::Semicolon)?;
                class.entities.push(EntityDef { name, nl_annotations: nl });
            } else {
                let def = self.parse_function_def()?;
                match def.kind {
                    FunctionKind::Action => {
                        class.actions.insert(def.name.clone(), def);
                    }
                    _ => {
                        class.queries.insert(def.name.clone(), def);
                    }
                }
            }
        }
        class.range = self.range_from(start);
        Ok(class)
    }

    fn parse_function_def(&mut self) -> Result<FunctionDef, ParseError> {
        let start = self.span();
        let mut is_monitorable = false;
        let mut is_list = false;
        loop {
            if self.eat_ident("monitorable") {
                is_monitorable = true;
            } else if self.eat_ident("list") {
                is_list = true;
            } else {
                break;
            }
        }
        let kind_name = self.expect_ident()?;
        let kind = FunctionKind::from_str(&kind_name).map_err(|_| ParseError::InvalidName {
            name: kind_name,
            what: "function kind",
            line: start.line,
        })?;
        let name = self.expect_ident()?;
        let mut def = FunctionDef::new(kind, name, Vec::new());
        // Streams are represented as monitorable queries.
        def.is_monitorable = is_monitorable || kind == FunctionKind::Stream;
        def.is_list = is_list;
        if self.eat(TokenKind::Extends) {
            loop {
                def.extends.push(self.expect_ident()?);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::LParen)?;
        while *self.peek() != TokenKind::RParen {
            if !def.args.is_empty() {
                self.expect(TokenKind::Comma)?;
            }
            def.args.push(self.parse_argument_def()?);
        }
        self.expect(TokenKind::RParen)?;
        let (nl, mut impl_) = self.parse_annotations()?;
        if let Some(Value::Boolean(true)) = impl_.remove("require_filter") {
            def.require_filter = true;
        }
        if let Some(Value::Array(projection)) = impl_.remove("default_projection") {
            for arg in projection {
                if let Value::String(name) = arg {
                    def.default_projection.push(name);
                }
            }
        }
        def.nl_annotations = nl;
        def.impl_annotations = impl_;
        self.expect(TokenKind::Semicolon)?;
        Ok(def)
    }

    fn parse_argument_def(&mut self) -> Result<ArgumentDef, ParseError> {
        let direction = if self.eat(TokenKind::In) {
            if self.eat(TokenKind::Req) {
                Direction::InReq
            } else if self.eat(TokenKind::Opt) {
                Direction::InOpt
            } else {
                return Err(self.error("'req' or 'opt'"));
            }
        } else if self.eat(TokenKind::Out) {
            Direction::Out
        } else {
            return Err(self.error("an argument direction"));
        };
        let name = self.expect_ident()?;
        self.expect(TokenKind::Colon)?;
        let ty = self.parse_type()?;
        let mut arg = ArgumentDef::new(name, direction, ty);
        let (nl, impl_) = self.parse_annotations()?;
        arg.nl_annotations = nl;
        arg.impl_annotations = impl_;
        Ok(arg)
    }

    fn parse_dataset(&mut self) -> Result<Dataset, ParseError> {
        let start = self.span();
        self.expect(TokenKind::Dataset)?;
        let name = match self.advance() {
            TokenKind::ClassRef(name) => name,
            _ => return Err(self.error("a dataset name")),
        };
        let language = if self.eat_ident("language") {
            match self.advance() {
                TokenKind::Str(language) => Some(language),
                _ => return Err(self.error("a language string")),
            }
        } else {
            None
        };
        self.expect(TokenKind::LBrace)?;
        let mut examples = Vec::new();
        while !self.eat(TokenKind::RBrace) {
            let example_start = self.span();
            let kind_name = self.expect_ident()?;
            let kind =
                ExampleKind::from_str(&kind_name).map_err(|_| ParseError::InvalidName {
                    name: kind_name,
                    what: "example kind",
                    line: example_start.line,
                })?;
            let mut args = Vec::new();
            if self.eat(TokenKind::LParen) {
                while *self.peek() != TokenKind::RParen {
                    if !args.is_empty() {
                        self.expect(TokenKind::Comma)?;
                    }
                    let arg_name = self.expect_ident()?;
                    self.expect(TokenKind::Colon)?;
                    let ty = self.parse_type()?;
                    args.push(ArgumentDef::new(arg_name, Direction::InReq, ty));
                }
                self.expect(TokenKind::RParen)?;
            }
            self.expect(TokenKind::ColonEq)?;
            let expression = self.parse_expression()?;
            let (nl, impl_) = self.parse_annotations()?;
            self.expect(TokenKind::Semicolon)?;
            examples.push(Example {
                kind,
                args,
                expression,
                nl_annotations: nl,
                impl_annotations: impl_,
                range: self.range_from(example_start),
            });
        }
        Ok(Dataset { name, language, examples, range: self.range_from(start) })
    }
}

/// Split `com.foo.bar` into (`com.foo`, `bar`).
fn split_channel(name: &str) -> Option<(String, String)> {
    let idx = name.rfind('.')?;
    Some((name[..idx].to_string(), name[idx + 1..].to_string()))
}

/// Lex and parse a complete source text.
pub fn parse(source: &str) -> Result<Input, crate::CompileError> {
    let tokens = lexer::tokenize(source)?;
    let mut parser = Parser::new(tokens);
    parser.parse_input().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Input {
        match parse(source) {
            Ok(input) => input,
            Err(e) => panic!("failed to parse {:?}: {}", source, e),
        }
    }

    fn first_statement(input: &Input) -> &Statement {
        match input {
            Input::Program(p) => &p.statements[0],
            other => panic!("expected a program, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_monitor_rule() {
        let input = parse_ok("monitor @com.weather.current() => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else {
            panic!("expected expression statement")
        };
        let Expression::Chain(chain) = &stmt.expression else { panic!("expected chain") };
        assert_eq!(chain.expressions.len(), 2);
        assert!(chain.expressions[0].is_monitor_like());
    }

    #[test]
    fn test_parse_filter_with_measure() {
        let input = parse_ok("@com.weather.current() filter temperature > 20C => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::Filter(filter) = &chain.expressions[0] else { panic!() };
        assert_eq!(
            filter.filter,
            BooleanExpression::atom(
                "temperature",
                ">",
                Value::Measure { value: 20.0, unit: "C".into() }
            )
        );
    }

    #[test]
    fn test_parse_assignment_and_projection() {
        let input = parse_ok("let x = [temperature, humidity] of @com.weather.current();");
        let Statement::Assignment(assign) = first_statement(&input) else { panic!() };
        assert_eq!(assign.name, "x");
        let Expression::Projection(projection) = &assign.value else { panic!() };
        assert_eq!(projection.args, vec!["temperature", "humidity"]);
    }

    #[test]
    fn test_parse_sort_index_slice() {
        let input = parse_ok("sort(temperature asc of @c.a.q())[1] => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::Index(index) = &chain.expressions[0] else { panic!() };
        assert_eq!(index.indices, vec![Value::Number(1.0)]);
        assert!(matches!(*index.inner, Expression::Sort(_)));

        let input = parse_ok("@c.a.q()[1 : 5] => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        assert!(matches!(&chain.expressions[0], Expression::Slice(_)));
    }

    #[test]
    fn test_parse_aggregation() {
        let input = parse_ok("aggregate avg temperature of @c.a.q() => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::Aggregation(agg) = &chain.expressions[0] else { panic!() };
        assert_eq!(agg.operator, AggregationOperator::Avg);
        assert_eq!(agg.field.as_deref(), Some("temperature"));

        let input = parse_ok("aggregate count of @c.a.q() => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::Aggregation(agg) = &chain.expressions[0] else { panic!() };
        assert_eq!(agg.operator, AggregationOperator::Count);
        assert_eq!(agg.field, None);
    }

    #[test]
    fn test_parse_edge_streams() {
        let input = parse_ok("edge monitor @c.a.q() on temperature > 20C => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::EdgeFilter(edge) = &chain.expressions[0] else {
            panic!("expected edge filter, got {:?}", chain.expressions[0])
        };
        assert!(matches!(*edge.inner, Expression::Monitor(_)));
        assert_eq!(
            edge.filter,
            BooleanExpression::atom(
                "temperature",
                ">",
                Value::Measure { value: 20.0, unit: "C".into() }
            )
        );

        let input = parse_ok("edge monitor @c.a.q() on new => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::EdgeNew(edge) = &chain.expressions[0] else {
            panic!("expected edge new, got {:?}", chain.expressions[0])
        };
        assert!(matches!(*edge.inner, Expression::Monitor(_)));
    }

    #[test]
    fn test_parse_timer_and_attimer() {
        let input = parse_ok("timer(interval=1h) => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::Timer(timer) = &chain.expressions[0] else { panic!() };
        assert_eq!(timer.interval, Value::Measure { value: 1.0, unit: "h".into() });

        let input = parse_ok("attimer(time=[new Time(10, 30)]) => notify;");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Chain(chain) = &stmt.expression else { panic!() };
        let Expression::AtTimer(attimer) = &chain.expressions[0] else { panic!() };
        assert_eq!(
            attimer.times,
            vec![Value::Time(TimeValue::Absolute { hour: 10, minute: 30, second: 0 })]
        );
    }

    #[test]
    fn test_parse_legacy_command() {
        let input = parse_ok("now => @c.a.q() => notify;");
        let Statement::Command(cmd) = first_statement(&input) else { panic!() };
        assert!(cmd.table.is_some());
        assert_eq!(cmd.actions.len(), 1);
    }

    #[test]
    fn test_parse_selector_attributes() {
        let input = parse_ok("@com.lg.tv(id=\"tv-1\").set_power(power=enum(on));");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Invocation(inv) = &stmt.expression else { panic!() };
        assert_eq!(inv.selector.class_name, "com.lg.tv");
        assert_eq!(inv.selector.id.as_deref(), Some("tv-1"));
        assert_eq!(inv.channel, "set_power");
        assert_eq!(inv.in_params[0].value, Value::Enum("on".into()));
    }

    #[test]
    fn test_parse_class_definition() {
        let source = r#"
class @com.weather extends @org.base {
  import loader from @org.loader();
  entity city_id #_[description="a city"];
  monitorable list query current(in req city : String, out temperature : Measure(C))
    #_[canonical="current weather"] #[poll_interval=10min];
  action alert(in req message : String);
}
"#;
        let Input::Library(library) = parse_ok(source) else { panic!("expected library") };
        let class = &library.classes[0];
        assert_eq!(class.name, "com.weather");
        assert_eq!(class.extends, vec!["org.base"]);
        assert_eq!(class.imports[0].module, "org.loader");
        assert_eq!(class.entities[0].name, "city_id");
        let current = &class.queries["current"];
        assert!(current.is_monitorable);
        assert!(current.is_list);
        assert_eq!(current.args.len(), 2);
        assert_eq!(
            current.get_arg_type("temperature"),
            Some(&Type::Measure("C".into()))
        );
        assert!(class.actions.contains_key("alert"));
    }

    #[test]
    fn test_parse_dataset() {
        let source = r#"
dataset @com.weather language "en" {
  query := @com.weather.current()
    #_[utterances=["the weather"]];
  action (message : String) := @com.weather.alert(message=message);
}
"#;
        let Input::Library(library) = parse_ok(source) else { panic!("expected library") };
        let dataset = &library.datasets[0];
        assert_eq!(dataset.language.as_deref(), Some("en"));
        assert_eq!(dataset.examples.len(), 2);
        assert_eq!(dataset.examples[1].args[0].name, "message");
    }

    #[test]
    fn test_parse_permission_rule() {
        let source = "$policy { true : @com.x.q => @com.y.a; }";
        let Input::PermissionRule(rule) = parse_ok(source) else { panic!("expected rule") };
        assert_eq!(rule.principal, BooleanExpression::True);
        assert!(matches!(
            &rule.query,
            PermissionFunction::Specified { class_name, channel, .. }
                if class_name == "com.x" && channel == "q"
        ));
        let source = "$policy { source == \"bob\"^^tt:username : @com.x.* => *; }";
        let Input::PermissionRule(rule) = parse_ok(source) else { panic!("expected rule") };
        assert!(matches!(&rule.query, PermissionFunction::ClassStar(c) if c == "com.x"));
        assert_eq!(rule.action, PermissionFunction::Star);
    }

    #[test]
    fn test_parse_boolean_precedence() {
        let source = "@c.a.q() filter a >= 1 && b == 2 || !(c < 3);";
        let input = parse_ok(source);
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Filter(filter) = &stmt.expression else { panic!() };
        let BooleanExpression::Or(ops) = &filter.filter else { panic!("expected or") };
        assert!(matches!(&ops[0], BooleanExpression::And(_)));
        assert!(matches!(&ops[1], BooleanExpression::Not(_)));
    }

    #[test]
    fn test_parse_control_and_dialogue() {
        assert!(matches!(
            parse_ok("$yes;"),
            Input::ControlCommand(ControlCommand { intent: ControlIntent::Yes, .. })
        ));
        let source = "$dialogue @org.policy.execute; monitor @c.a.q() => notify;";
        let Input::DialogueState(state) = parse_ok(source) else {
            panic!("expected dialogue state")
        };
        assert_eq!(state.policy, "org.policy.execute");
        assert_eq!(state.statements.len(), 1);
    }

    #[test]
    fn test_parse_function_declaration() {
        let source = "function f(city : String) { @com.weather.current(city=city) => notify; }";
        let input = parse_ok(source);
        let Input::Program(program) = &input else { panic!() };
        assert_eq!(program.declarations.len(), 1);
        assert_eq!(program.declarations[0].args[0].name, "city");
        assert_eq!(program.declarations[0].body.len(), 1);
    }

    #[test]
    fn test_parse_date_roundtrip_value() {
        let input = parse_ok("@c.a.q() filter date >= new Date(\"2020-05-01T00:00:00.000Z\");");
        let Statement::Expression(stmt) = first_statement(&input) else { panic!() };
        let Expression::Filter(filter) = &stmt.expression else { panic!() };
        let BooleanExpression::Atom { value, .. } = &filter.filter else { panic!() };
        assert_eq!(value.to_string(), "new Date(\"2020-05-01T00:00:00.000Z\")");
    }

    #[test]
    fn test_parse_errors_carry_position() {
        let err = parse("monitor ;").unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.contains("line 1"), "unhelpful error: {}", rendered);
    }
}
