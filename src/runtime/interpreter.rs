use crate::runtime::code::{BinaryOp, Capture, Code, Instruction};
use crate::runtime::error::RuntimeError;
use crate::runtime::function::Function;
use crate::runtime::module::Globals;
use crate::runtime::value::{lock_cell, new_cell, Cell, Closure, Value};
use std::cell::RefCell;
use std::sync::Arc;

/// Maximum number of nested calls on a single thread.
pub const MAX_CALL_DEPTH: usize = 200;

/// Single call stack entry.
#[derive(Clone, Debug, PartialEq)]
pub struct FrameSummary {
    pub function: Arc<str>,
    pub file: Arc<str>,
    pub line: u32,
}

thread_local! {
    static CALL_STACK: RefCell<Vec<FrameSummary>> = const { RefCell::new(Vec::new()) };
}

/// Call stack entry of a running frame, removed from the thread call stack on drop.
struct StackGuard;

impl StackGuard {
    fn enter(code: &Code) -> Result<Self, RuntimeError> {
        CALL_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.len() >= MAX_CALL_DEPTH {
                return Err(RuntimeError::Recursion(MAX_CALL_DEPTH));
            }
            stack.push(FrameSummary {
                function: code.qualname.clone(),
                file: code.filename.clone(),
                line: code.first_line,
            });
            Ok(StackGuard)
        })
    }

    fn set_line(&self, line: u32) {
        CALL_STACK.with(|stack| {
            if let Some(top) = stack.borrow_mut().last_mut() {
                top.line = line;
            }
        })
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        CALL_STACK.with(|stack| {
            stack.borrow_mut().pop();
        })
    }
}

enum Slot {
    Plain(Option<Value>),
    Cell(Cell),
}

impl Slot {
    fn get(&self) -> Option<Value> {
        match self {
            Slot::Plain(value) => value.clone(),
            Slot::Cell(cell) => lock_cell(cell).clone(),
        }
    }

    fn set(&mut self, value: Value) {
        match self {
            Slot::Plain(slot) => *slot = Some(value),
            Slot::Cell(cell) => *lock_cell(cell) = Some(value),
        }
    }
}

/// Activation record. Holds the code it was started with for the whole execution,
/// a concurrent code replacement is observed by the next call only.
struct Frame {
    code: Arc<Code>,
    globals: Arc<Globals>,
    locals: Vec<Slot>,
    free: Vec<Cell>,
    stack: Vec<Value>,
    /// Exception that entered the last taken handler.
    caught: Option<RuntimeError>,
}

enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

impl Frame {
    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.code.stack_size as usize {
            return Err(RuntimeError::Internal(format!(
                "evaluation stack overflow in `{}` (limit {})",
                self.code.qualname, self.code.stack_size
            )));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::Internal("evaluation stack underflow".to_string()))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if self.stack.len() < n {
            return Err(RuntimeError::Internal("evaluation stack underflow".to_string()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn name(&self, idx: u32) -> Result<Arc<str>, RuntimeError> {
        self.code
            .names
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::Internal(format!("name index {idx} out of range")))
    }

    fn run(&mut self, guard: &StackGuard) -> Result<Value, RuntimeError> {
        let mut pc = 0;
        loop {
            let Some(instr) = self.code.instructions.get(pc).copied() else {
                return Err(RuntimeError::Internal(format!(
                    "execution of `{}` fell off the end of code",
                    self.code.qualname
                )));
            };

            match self.step(pc, instr, guard) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(err) if err.is_catchable() => {
                    let Some(entry) = self.code.handler_for(pc).copied() else {
                        return Err(err);
                    };
                    self.stack.truncate(entry.depth as usize);
                    self.push(err.exception_value())?;
                    self.caught = Some(err);
                    pc = entry.target as usize;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn step(&mut self, pc: usize, instr: Instruction, guard: &StackGuard) -> Result<Flow, RuntimeError> {
        match instr {
            Instruction::Nop => {}
            Instruction::LoadConst(idx) => {
                let value = self.code.consts.get(idx as usize).cloned().ok_or_else(|| {
                    RuntimeError::Internal(format!("constant index {idx} out of range"))
                })?;
                self.push(value)?;
            }
            Instruction::LoadLocal(idx) => {
                let value = self.locals.get(idx as usize).and_then(Slot::get);
                let value = value.ok_or_else(|| {
                    RuntimeError::Name(format!(
                        "local variable `{}` referenced before assignment",
                        self.code.locals.get(idx as usize).map(|n| &**n).unwrap_or("?")
                    ))
                })?;
                self.push(value)?;
            }
            Instruction::StoreLocal(idx) => {
                let value = self.pop()?;
                let slot = self.locals.get_mut(idx as usize).ok_or_else(|| {
                    RuntimeError::Internal(format!("local index {idx} out of range"))
                })?;
                slot.set(value);
            }
            Instruction::LoadFree(idx) => {
                let value = self.free.get(idx as usize).and_then(|cell| lock_cell(cell).clone());
                let value = value.ok_or_else(|| {
                    RuntimeError::Name(format!(
                        "free variable `{}` referenced before assignment",
                        self.code.free_vars.get(idx as usize).map(|n| &**n).unwrap_or("?")
                    ))
                })?;
                self.push(value)?;
            }
            Instruction::LoadGlobal(idx) => {
                let name = self.name(idx)?;
                let value = self
                    .globals
                    .get(&name)
                    .ok_or_else(|| RuntimeError::Name(format!("name `{name}` is not defined")))?;
                self.push(value)?;
            }
            Instruction::StoreGlobal(idx) => {
                let name = self.name(idx)?;
                let value = self.pop()?;
                self.globals.set(name, value);
            }
            Instruction::PopTop => {
                self.pop()?;
            }
            Instruction::Binary(op) => {
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                self.push(binary(op, &lhs, &rhs)?)?;
            }
            Instruction::Negate => {
                let value = match self.pop()? {
                    Value::Int(i) => Value::Int(
                        i.checked_neg()
                            .ok_or_else(|| RuntimeError::Type("integer overflow".to_string()))?,
                    ),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(RuntimeError::Type(format!(
                            "bad operand type for unary -: `{}`",
                            other.type_name()
                        )))
                    }
                };
                self.push(value)?;
            }
            Instruction::Not => {
                let value = self.pop()?;
                self.push(Value::Bool(!value.is_truthy()))?;
            }
            Instruction::BuildList(n) => {
                let items = self.pop_n(n as usize)?;
                self.push(Value::from(items))?;
            }
            Instruction::Jump(target) => return Ok(Flow::Jump(target as usize)),
            Instruction::JumpIfFalse(target) => {
                if !self.pop()?.is_truthy() {
                    return Ok(Flow::Jump(target as usize));
                }
            }
            Instruction::Call(argc) => {
                if let Some(line) = self.code.line_of(pc) {
                    guard.set_line(line);
                }
                let args = self.pop_n(argc as usize)?;
                let callee = self.pop()?;
                let result = match &callee {
                    Value::Function(closure) => invoke(closure, &args)?,
                    Value::Native(native) => {
                        let ctx = CallContext { caller: Some(&*self) };
                        native.call(&ctx, &args)?
                    }
                    other => {
                        return Err(RuntimeError::Type(format!(
                            "`{}` object is not callable",
                            other.type_name()
                        )))
                    }
                };
                self.push(result)?;
            }
            Instruction::MakeClosure(idx) => {
                let function = self.code.nested.get(idx as usize).cloned().ok_or_else(|| {
                    RuntimeError::Internal(format!("nested function index {idx} out of range"))
                })?;
                let free = function
                    .captures()
                    .iter()
                    .map(|capture| self.capture(*capture))
                    .collect::<Result<Vec<_>, _>>()?;
                self.push(Value::Function(Arc::new(Closure { function, free })))?;
            }
            Instruction::Copy(n) => {
                let value = self
                    .stack
                    .len()
                    .checked_sub(n as usize + 1)
                    .and_then(|idx| self.stack.get(idx))
                    .cloned()
                    .ok_or_else(|| RuntimeError::Internal("evaluation stack underflow".to_string()))?;
                self.push(value)?;
            }
            Instruction::Raise => return Err(RuntimeError::Raised(self.pop()?)),
            Instruction::Reraise => {
                let value = self.pop()?;
                return Err(self.caught.take().unwrap_or(RuntimeError::Raised(value)));
            }
            Instruction::Return => return Ok(Flow::Return(self.pop()?)),
        }
        Ok(Flow::Next)
    }

    fn capture(&self, capture: Capture) -> Result<Cell, RuntimeError> {
        match capture {
            Capture::Local(idx) => match self.locals.get(idx as usize) {
                Some(Slot::Cell(cell)) => Ok(cell.clone()),
                _ => Err(RuntimeError::Internal(format!(
                    "local {idx} of `{}` is not a cell",
                    self.code.qualname
                ))),
            },
            Capture::Free(idx) => self.free.get(idx as usize).cloned().ok_or_else(|| {
                RuntimeError::Internal(format!("free variable index {idx} out of range"))
            }),
        }
    }
}

/// View of the calling frame given to native functions.
pub struct CallContext<'a> {
    caller: Option<&'a Frame>,
}

impl<'a> CallContext<'a> {
    /// Return bound variables of the calling frame: locals in declaration order, then
    /// variables captured from enclosing functions. Unbound variables are skipped.
    pub fn locals(&self) -> Vec<(Arc<str>, Value)> {
        let Some(frame) = self.caller else {
            return vec![];
        };

        let locals = frame
            .code
            .locals
            .iter()
            .zip(&frame.locals)
            .filter_map(|(name, slot)| Some((name.clone(), slot.get()?)));
        let free = frame
            .code
            .free_vars
            .iter()
            .zip(&frame.free)
            .filter_map(|(name, cell)| Some((name.clone(), lock_cell(cell).clone()?)));
        locals.chain(free).collect()
    }

    /// Return current thread call stack, innermost frame first.
    pub fn backtrace(&self) -> Vec<FrameSummary> {
        backtrace()
    }
}

/// Return current thread call stack, innermost frame first.
pub fn backtrace() -> Vec<FrameSummary> {
    CALL_STACK.with(|stack| stack.borrow().iter().rev().cloned().collect())
}

fn invoke(closure: &Closure, args: &[Value]) -> Result<Value, RuntimeError> {
    let function: &Arc<Function> = &closure.function;
    let code = function.code();
    if args.len() != code.arg_count as usize {
        return Err(RuntimeError::Type(format!(
            "`{}` takes {} arguments but {} were given",
            function.qualname(),
            code.arg_count,
            args.len()
        )));
    }
    let globals = function.globals().ok_or_else(|| {
        RuntimeError::Internal(format!("module of `{}` is unloaded", function.qualname()))
    })?;

    let locals = code
        .cells
        .iter()
        .enumerate()
        .map(|(idx, is_cell)| {
            let value = args.get(idx).cloned();
            if *is_cell {
                Slot::Cell(new_cell(value))
            } else {
                Slot::Plain(value)
            }
        })
        .collect();

    let guard = StackGuard::enter(&code)?;
    let mut frame = Frame {
        stack: Vec::with_capacity(code.stack_size as usize),
        code,
        globals,
        locals,
        free: closure.free.clone(),
        caught: None,
    };
    frame.run(&guard)
}

/// Call a program function or a native from the host.
pub fn call(callee: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    match callee {
        Value::Function(closure) => invoke(closure, args),
        Value::Native(native) => native.call(&CallContext { caller: None }, args),
        other => Err(RuntimeError::Type(format!(
            "`{}` object is not callable",
            other.type_name()
        ))),
    }
}

/// Execute module body code against module globals.
pub(crate) fn run_module(code: Arc<Code>, globals: Arc<Globals>) -> Result<Value, RuntimeError> {
    let guard = StackGuard::enter(&code)?;
    let mut frame = Frame {
        stack: Vec::with_capacity(code.stack_size as usize),
        code,
        globals,
        locals: vec![],
        free: vec![],
        caught: None,
    };
    frame.run(&guard)
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Mod => "%",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    let unsupported = || {
        RuntimeError::Type(format!(
            "unsupported operand types for {}: `{}` and `{}`",
            symbol(op),
            lhs.type_name(),
            rhs.type_name()
        ))
    };
    let overflow = || RuntimeError::Type("integer overflow".to_string());

    let value = match (op, lhs, rhs) {
        (BinaryOp::Eq, _, _) => Value::Bool(lhs == rhs),
        (BinaryOp::Ne, _, _) => Value::Bool(lhs != rhs),

        (BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge, _, _) => {
            let ordering = match (lhs, rhs) {
                (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
                _ => as_float(lhs)
                    .zip(as_float(rhs))
                    .and_then(|(a, b)| a.partial_cmp(&b)),
            };
            let ordering = ordering.ok_or_else(unsupported)?;
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }

        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Value::from(format!("{a}{b}").as_str()),
        (BinaryOp::Add, Value::List(a), Value::List(b)) => {
            Value::from(a.iter().chain(b.iter()).cloned().collect::<Vec<_>>())
        }

        (BinaryOp::Div | BinaryOp::Mod, _, Value::Int(0)) => return Err(RuntimeError::ZeroDivision),
        (BinaryOp::Div | BinaryOp::Mod, _, Value::Float(f)) if *f == 0.0 => {
            return Err(RuntimeError::ZeroDivision)
        }

        (_, Value::Int(a), Value::Int(b)) => match op {
            BinaryOp::Add => Value::Int(a.checked_add(*b).ok_or_else(overflow)?),
            BinaryOp::Sub => Value::Int(a.checked_sub(*b).ok_or_else(overflow)?),
            BinaryOp::Mul => Value::Int(a.checked_mul(*b).ok_or_else(overflow)?),
            BinaryOp::Div => Value::Float(*a as f64 / *b as f64),
            BinaryOp::Mod => Value::Int(a.checked_rem_euclid(*b).ok_or_else(overflow)?),
            _ => return Err(unsupported()),
        },

        _ => {
            let (a, b) = as_float(lhs).zip(as_float(rhs)).ok_or_else(unsupported)?;
            match op {
                BinaryOp::Add => Value::Float(a + b),
                BinaryOp::Sub => Value::Float(a - b),
                BinaryOp::Mul => Value::Float(a * b),
                BinaryOp::Div => Value::Float(a / b),
                BinaryOp::Mod => Value::Float(a.rem_euclid(b)),
                _ => return Err(unsupported()),
            }
        }
    };
    Ok(value)
}
