use crate::runtime::function::Function;
use crate::runtime::value::Value;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

/// Single instruction of the stack machine.
///
/// Jump operands are absolute instruction indexes inside the owning [`Code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    LoadConst(u32),
    LoadLocal(u32),
    StoreLocal(u32),
    LoadFree(u32),
    LoadGlobal(u32),
    StoreGlobal(u32),
    PopTop,
    Binary(BinaryOp),
    Negate,
    Not,
    BuildList(u32),
    Jump(u32),
    JumpIfFalse(u32),
    /// Pop `argc` arguments and a callee, push the call result.
    Call(u32),
    /// Create a closure from the nested function with given index.
    MakeClosure(u32),
    /// Push a copy of the value `n` slots below the top of the stack.
    Copy(u32),
    Raise,
    /// Pop a value and raise the exception that entered the current handler,
    /// the popped value is raised if there is none.
    Reraise,
    Return,
}

impl Instruction {
    /// Return jump destination if instruction transfers control.
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Instruction::Jump(target) | Instruction::JumpIfFalse(target) => Some(*target),
            _ => None,
        }
    }

    /// Return the same instruction with another jump destination.
    /// Non-jump instructions are returned as is.
    pub fn with_jump_target(self, target: u32) -> Self {
        match self {
            Instruction::Jump(_) => Instruction::Jump(target),
            Instruction::JumpIfFalse(_) => Instruction::JumpIfFalse(target),
            other => other,
        }
    }

    /// Net change of evaluation stack depth after instruction execution.
    pub fn stack_effect(&self) -> i32 {
        match self {
            Instruction::Nop => 0,
            Instruction::LoadConst(_)
            | Instruction::LoadLocal(_)
            | Instruction::LoadFree(_)
            | Instruction::LoadGlobal(_)
            | Instruction::MakeClosure(_)
            | Instruction::Copy(_) => 1,
            Instruction::StoreLocal(_) | Instruction::StoreGlobal(_) | Instruction::PopTop => -1,
            Instruction::Binary(_) => -1,
            Instruction::Negate | Instruction::Not => 0,
            Instruction::BuildList(n) => 1 - *n as i32,
            Instruction::Jump(_) => 0,
            Instruction::JumpIfFalse(_) => -1,
            Instruction::Call(argc) => -(*argc as i32),
            Instruction::Raise | Instruction::Reraise | Instruction::Return => -1,
        }
    }
}

/// Protected instruction range `[start, end)`. An exception raised inside the range
/// truncates the evaluation stack to `depth`, pushes the exception value and continues at `target`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub start: u32,
    pub end: u32,
    pub target: u32,
    pub depth: u32,
}

impl ExceptionEntry {
    pub fn contains(&self, pc: u32) -> bool {
        self.start <= pc && pc < self.end
    }
}

/// Source of a closure variable, relative to the frame executing `MakeClosure`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capture {
    Local(u32),
    Free(u32),
}

/// Executable representation of a function (or a module body).
///
/// Code is immutable once built, functions switch between representations
/// by replacing the whole `Arc<Code>`.
#[derive(Clone, Debug)]
pub struct Code {
    pub name: Arc<str>,
    pub qualname: Arc<str>,
    pub filename: Arc<str>,
    pub first_line: u32,
    pub arg_count: u32,
    pub instructions: Vec<Instruction>,
    /// Source line of each instruction, `lines[i]` belongs to `instructions[i]`.
    pub lines: Vec<u32>,
    pub consts: Vec<Value>,
    /// Global names used by `LoadGlobal`/`StoreGlobal`.
    pub names: Vec<Arc<str>>,
    pub locals: Vec<Arc<str>>,
    /// `cells[i]` is true if local `i` is captured by a nested function.
    pub cells: Vec<bool>,
    pub free_vars: Vec<Arc<str>>,
    pub nested: Vec<Arc<Function>>,
    pub exception_table: Vec<ExceptionEntry>,
    /// Maximum evaluation stack depth.
    pub stack_size: u32,
}

impl Code {
    pub fn line_of(&self, pc: usize) -> Option<u32> {
        self.lines.get(pc).copied()
    }

    /// Index of the first instruction mapped to the line.
    pub fn first_instruction_at(&self, line: u32) -> Option<usize> {
        self.lines.iter().position(|l| *l == line)
    }

    /// Return the innermost exception handler protecting instruction at `pc`.
    pub fn handler_for(&self, pc: usize) -> Option<&ExceptionEntry> {
        let pc = pc as u32;
        self.exception_table
            .iter()
            .filter(|entry| entry.contains(pc))
            .min_by_key(|entry| entry.end - entry.start)
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "code {} ({}:{})", self.qualname, self.filename, self.first_line)?;
        let mut prev_line = None;
        for (idx, (instr, line)) in self.instructions.iter().zip(&self.lines).enumerate() {
            if prev_line != Some(*line) {
                write!(f, "{line:>5}")?;
                prev_line = Some(*line);
            } else {
                f.write_str("     ")?;
            }
            write!(f, " {idx:>4} {instr:?}")?;
            if let Instruction::LoadConst(c) = instr {
                if let Some(value) = self.consts.get(*c as usize) {
                    write!(f, " ({value:?})")?;
                }
            }
            writeln!(f)?;
        }
        for entry in &self.exception_table {
            writeln!(
                f,
                "  except [{}, {}) -> {} depth {}",
                entry.start, entry.end, entry.target, entry.depth
            )?;
        }
        Ok(())
    }
}
