//! IR (TT Intermediate Representation) data types.
//! Register machine with block structure and explicit suspension points.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A virtual register. Registers are allocated by a monotonic counter and
/// never reused within a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Register(pub u32);

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// A loop label for `LabeledBreak`/`LabeledContinue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_l{}", self.0)
    }
}

/// Constant operand of `LoadConstant`, `SetIndex` and `GetIndex`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IrConstant {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Measure { value: f64, unit: String },
    Currency { value: f64, code: String },
    Date(DateTime<Utc>),
    Enum(String),
    Entity { value: Option<String>, ty: String },
}

impl fmt::Display for IrConstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrConstant::Null => write!(f, "null"),
            IrConstant::Boolean(b) => write!(f, "{}", b),
            IrConstant::Number(n) => write!(f, "{}", n),
            IrConstant::String(s) => write!(f, "{}", crate::strings::quote_string(s)),
            IrConstant::Measure { value, unit } => write!(f, "{}{}", value, unit),
            IrConstant::Currency { value, code } => write!(f, "{}${}", value, code),
            IrConstant::Date(d) => {
                write!(f, "date({})", d.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            IrConstant::Enum(tag) => write!(f, "enum({})", tag),
            IrConstant::Entity { value, ty } => match value {
                Some(v) => write!(f, "{}^^{}", crate::strings::quote_string(v), ty),
                None => write!(f, "null^^{}", ty),
            },
        }
    }
}

/// Infix operators of `BinaryOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOpcode {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl fmt::Display for BinaryOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOpcode::Add => "+",
            BinaryOpcode::Sub => "-",
            BinaryOpcode::Mul => "*",
            BinaryOpcode::Div => "/",
            BinaryOpcode::Mod => "%",
            BinaryOpcode::Pow => "**",
            BinaryOpcode::And => "&&",
            BinaryOpcode::Or => "||",
            BinaryOpcode::Eq => "==",
            BinaryOpcode::Ne => "!=",
            BinaryOpcode::Ge => ">=",
            BinaryOpcode::Le => "<=",
            BinaryOpcode::Gt => ">",
            BinaryOpcode::Lt => "<",
        };
        write!(f, "{}", s)
    }
}

/// Operators of `UnaryOp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOpcode {
    Not,
    Neg,
}

impl fmt::Display for UnaryOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOpcode::Not => write!(f, "!"),
            UnaryOpcode::Neg => write!(f, "-"),
        }
    }
}

/// One IR instruction. `Invoke*`, `GetTableVersion`, `FormatEvent`,
/// `SendEndOfFlow` and `AsyncWhile` suspend; everything else completes
/// synchronously. Blocks nest through `Box`ed bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // Non-suspending
    LoadConstant { dst: Register, value: IrConstant },
    CreateTuple { dst: Register, size: usize },
    SetIndex { obj: Register, index: IrConstant, value: Register },
    GetIndex { dst: Register, obj: Register, index: IrConstant },
    GetVariable { dst: Register, name: String },
    GetEnvironment { dst: Register, name: String },
    BinaryOp { dst: Register, op: BinaryOpcode, lhs: Register, rhs: Register },
    UnaryOp { dst: Register, op: UnaryOpcode, operand: Register },
    BinaryFunctionOp { dst: Register, func: String, lhs: Register, rhs: Register },
    CreateAggregation { dst: Register, table: String, kind: String, params: Vec<String> },
    ClearGetCache,

    // Suspending
    InvokeTrigger { dst: Register, class_name: String, channel: String, params: Register },
    InvokeQuery { dst: Register, class_name: String, channel: String, params: Register },
    InvokeAction { dst: Register, class_name: String, channel: String, params: Register },
    InvokeOutput { channel: String, params: Register },
    InvokeMemoryQuery { dst: Register, table: String, aggregation: Register },
    InvokeSave { table: String, value: Register },
    GetTableVersion { dst: Register, table: String },
    FormatEvent { dst: Register, params: Register },
    SendEndOfFlow { principal: String },

    // Blocks and control flow
    Block(Vec<Instruction>),
    TryCatch { body: Box<Instruction>, message: String },
    If { cond: Register, then_body: Box<Instruction>, else_body: Box<Instruction> },
    ForOf { element: Register, iterable: Register, body: Box<Instruction> },
    AsyncWhile { result: Register, iterator: Register, body: Box<Instruction> },
    LabeledLoop { label: Label, body: Box<Instruction> },
    LabeledBreak(Label),
    LabeledContinue(Label),
    Break,
}

impl Instruction {
    /// Whether this instruction yields to the host environment. `AsyncWhile`
    /// counts as suspending because each iterator step suspends.
    pub fn is_suspending(&self) -> bool {
        matches!(
            self,
            Instruction::InvokeTrigger { .. }
                | Instruction::InvokeQuery { .. }
                | Instruction::InvokeAction { .. }
                | Instruction::InvokeOutput { .. }
                | Instruction::InvokeMemoryQuery { .. }
                | Instruction::InvokeSave { .. }
                | Instruction::GetTableVersion { .. }
                | Instruction::FormatEvent { .. }
                | Instruction::SendEndOfFlow { .. }
                | Instruction::AsyncWhile { .. }
        )
    }

    fn emit_into(&self, out: &mut String, depth: usize) {
        let pad = "  ".repeat(depth);
        let prefix = if self.is_suspending() { "await " } else { "" };
        match self {
            Instruction::LoadConstant { dst, value } => {
                out.push_str(&format!("{}{} = const {}\n", pad, dst, value));
            }
            Instruction::CreateTuple { dst, size } => {
                out.push_str(&format!("{}{} = tuple {}\n", pad, dst, size));
            }
            Instruction::SetIndex { obj, index, value } => {
                out.push_str(&format!("{}{}[{}] = {}\n", pad, obj, index, value));
            }
            Instruction::GetIndex { dst, obj, index } => {
                out.push_str(&format!("{}{} = {}[{}]\n", pad, dst, obj, index));
            }
            Instruction::GetVariable { dst, name } => {
                out.push_str(&format!("{}{} = var {}\n", pad, dst, name));
            }
            Instruction::GetEnvironment { dst, name } => {
                out.push_str(&format!("{}{} = env ${}\n", pad, dst, name));
            }
            Instruction::BinaryOp { dst, op, lhs, rhs } => {
                out.push_str(&format!("{}{} = {} {} {}\n", pad, dst, lhs, op, rhs));
            }
            Instruction::UnaryOp { dst, op, operand } => {
                out.push_str(&format!("{}{} = {}{}\n", pad, dst, op, operand));
            }
            Instruction::BinaryFunctionOp { dst, func, lhs, rhs } => {
                out.push_str(&format!("{}{} = {}({}, {})\n", pad, dst, func, lhs, rhs));
            }
            Instruction::CreateAggregation { dst, table, kind, params } => {
                out.push_str(&format!(
                    "{}{} = aggregation {} {} [{}]\n",
                    pad,
                    dst,
                    table,
                    kind,
                    params.join(", ")
                ));
            }
            Instruction::ClearGetCache => {
                out.push_str(&format!("{}clear_get_cache\n", pad));
            }
            Instruction::InvokeTrigger { dst, class_name, channel, params } => {
                out.push_str(&format!(
                    "{}{}{} = invoke_trigger @{}.{} {}\n",
                    pad, prefix, dst, class_name, channel, params
                ));
            }
            Instruction::InvokeQuery { dst, class_name, channel, params } => {
                out.push_str(&format!(
                    "{}{}{} = invoke_query @{}.{} {}\n",
                    pad, prefix, dst, class_name, channel, params
                ));
            }
            Instruction::InvokeAction { dst, class_name, channel, params } => {
                out.push_str(&format!(
                    "{}{}{} = invoke_action @{}.{} {}\n",
                    pad, prefix, dst, class_name, channel, params
                ));
            }
            Instruction::InvokeOutput { channel, params } => {
                out.push_str(&format!("{}{}invoke_output {} {}\n", pad, prefix, channel, params));
            }
            Instruction::InvokeMemoryQuery { dst, table, aggregation } => {
                out.push_str(&format!(
                    "{}{}{} = memory_query {} {}\n",
                    pad, prefix, dst, table, aggregation
                ));
            }
            Instruction::InvokeSave { table, value } => {
                out.push_str(&format!("{}{}save {} {}\n", pad, prefix, table, value));
            }
            Instruction::GetTableVersion { dst, table } => {
                out.push_str(&format!("{}{}{} = table_version {}\n", pad, prefix, dst, table));
            }
            Instruction::FormatEvent { dst, params } => {
                out.push_str(&format!("{}{}{} = format_event {}\n", pad, prefix, dst, params));
            }
            Instruction::SendEndOfFlow { principal } => {
                out.push_str(&format!("{}{}send_end_of_flow {}\n", pad, prefix, principal));
            }
            Instruction::Block(body) => {
                out.push_str(&format!("{}{{\n", pad));
                for instr in body {
                    instr.emit_into(out, depth + 1);
                }
                out.push_str(&format!("{}}}\n", pad));
            }
            Instruction::TryCatch { body, message } => {
                out.push_str(&format!("{}try {{\n", pad));
                body.emit_into(out, depth + 1);
                out.push_str(&format!(
                    "{}}} catch {}\n",
                    pad,
                    crate::strings::quote_string(message)
                ));
            }
            Instruction::If { cond, then_body, else_body } => {
                out.push_str(&format!("{}if {} {{\n", pad, cond));
                then_body.emit_into(out, depth + 1);
                out.push_str(&format!("{}}} else {{\n", pad));
                else_body.emit_into(out, depth + 1);
                out.push_str(&format!("{}}}\n", pad));
            }
            Instruction::ForOf { element, iterable, body } => {
                out.push_str(&format!("{}for {} of {} {{\n", pad, element, iterable));
                body.emit_into(out, depth + 1);
                out.push_str(&format!("{}}}\n", pad));
            }
            Instruction::AsyncWhile { result, iterator, body } => {
                out.push_str(&format!("{}{}while {} = step {} {{\n", pad, prefix, result, iterator));
                body.emit_into(out, depth + 1);
                out.push_str(&format!("{}}}\n", pad));
            }
            Instruction::LabeledLoop { label, body } => {
                out.push_str(&format!("{}loop {} {{\n", pad, label));
                body.emit_into(out, depth + 1);
                out.push_str(&format!("{}}}\n", pad));
            }
            Instruction::LabeledBreak(label) => {
                out.push_str(&format!("{}break {}\n", pad, label));
            }
            Instruction::LabeledContinue(label) => {
                out.push_str(&format!("{}continue {}\n", pad, label));
            }
            Instruction::Break => {
                out.push_str(&format!("{}break\n", pad));
            }
        }
    }

    /// Recursively visit this instruction and all nested instructions.
    pub fn walk(&self, f: &mut dyn FnMut(&Instruction)) {
        f(self);
        match self {
            Instruction::Block(body) => {
                for instr in body {
                    instr.walk(f);
                }
            }
            Instruction::TryCatch { body, .. }
            | Instruction::ForOf { body, .. }
            | Instruction::AsyncWhile { body, .. }
            | Instruction::LabeledLoop { body, .. } => body.walk(f),
            Instruction::If { then_body, else_body, .. } => {
                then_body.walk(f);
                else_body.walk(f);
            }
            _ => {}
        }
    }
}

/// A complete compiled module: register pool size plus the root block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IrModule {
    /// `sha256:<hex>` digest of the source the module was compiled from.
    pub source_hash: String,
    /// Number of registers the root block declares.
    pub registers: u32,
    pub root: Instruction,
}

impl IrModule {
    pub fn new(source_hash: String, registers: u32, root: Instruction) -> Self {
        Self { source_hash, registers, root }
    }

    /// Emit the textual artifact consumed by the execution environment.
    /// Register declarations come first, suspension points carry an `await`
    /// prefix, and block structure is rendered with braces.
    pub fn emit(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("module {}\n", self.source_hash));
        out.push_str(&format!("registers {}\n", self.registers));
        self.root.emit_into(&mut out, 0);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspending_classification() {
        let invoke = Instruction::InvokeQuery {
            dst: Register(0),
            class_name: "com.foo".into(),
            channel: "bar".into(),
            params: Register(1),
        };
        assert!(invoke.is_suspending());
        let load = Instruction::LoadConstant { dst: Register(0), value: IrConstant::Null };
        assert!(!load.is_suspending());
    }

    #[test]
    fn test_emit_await_prefix() {
        let module = IrModule::new(
            "sha256:test".into(),
            2,
            Instruction::Block(vec![
                Instruction::CreateTuple { dst: Register(0), size: 0 },
                Instruction::InvokeQuery {
                    dst: Register(1),
                    class_name: "com.foo".into(),
                    channel: "bar".into(),
                    params: Register(0),
                },
            ]),
        );
        let text = module.emit();
        assert!(text.starts_with("module sha256:test\nregisters 2\n"));
        assert!(text.contains("r0 = tuple 0"));
        assert!(text.contains("await r1 = invoke_query @com.foo.bar r0"));
    }

    #[test]
    fn test_emit_try_catch_nesting() {
        let module = IrModule::new(
            "sha256:t".into(),
            1,
            Instruction::TryCatch {
                body: Box::new(Instruction::Block(vec![Instruction::Break])),
                message: "failed".into(),
            },
        );
        let text = module.emit();
        assert!(text.contains("try {"));
        assert!(text.contains("} catch \"failed\""));
    }

    #[test]
    fn test_walk_visits_nested() {
        let root = Instruction::TryCatch {
            body: Box::new(Instruction::Block(vec![
                Instruction::ClearGetCache,
                Instruction::LabeledLoop {
                    label: Label(0),
                    body: Box::new(Instruction::Break),
                },
            ])),
            message: "m".into(),
        };
        let mut count = 0;
        root.walk(&mut |_| count += 1);
        assert_eq!(count, 5);
    }
}
