use crate::runtime::error::RuntimeError;
use crate::runtime::function::Function;
use crate::runtime::interpreter::CallContext;
use itertools::Itertools;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared storage of a variable captured by a nested function.
pub type Cell = Arc<Mutex<Option<Value>>>;

pub(crate) fn new_cell(value: Option<Value>) -> Cell {
    Arc::new(Mutex::new(value))
}

pub(crate) fn lock_cell(cell: &Cell) -> MutexGuard<'_, Option<Value>> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Host implemented function, callable from a program like any other function.
pub trait NativeFunction: Send + Sync {
    fn name(&self) -> &str;

    /// Call the function.
    ///
    /// # Arguments
    ///
    /// * `ctx`: view of the calling frame and current thread call stack
    /// * `args`: call arguments
    fn call(&self, ctx: &CallContext<'_>, args: &[Value]) -> Result<Value, RuntimeError>;
}

/// [`NativeFunction`] implementation backed by a closure.
pub struct NativeFn<F> {
    name: String,
    f: F,
}

impl<F> NativeFn<F>
where
    F: Fn(&CallContext<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            f,
        })
    }
}

impl<F> NativeFunction for NativeFn<F>
where
    F: Fn(&CallContext<'_>, &[Value]) -> Result<Value, RuntimeError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, ctx: &CallContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
        (self.f)(ctx, args)
    }
}

/// Function object created by a `def` statement: function definition and captured variables.
pub struct Closure {
    pub(crate) function: Arc<Function>,
    pub(crate) free: Vec<Cell>,
}

impl Closure {
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }
}

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    List(Arc<[Value]>),
    Function(Arc<Closure>),
    Native(Arc<dyn NativeFunction>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Function(_) => "function",
            Value::Native(_) => "native",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Function(_) | Value::Native(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    fn repr(&self) -> String {
        match self {
            Value::Str(s) => format!("{s:?}"),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Native(a), Value::Native(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Str(s) => f.write_str(s),
            Value::List(items) => write!(f, "[{}]", items.iter().map(Value::repr).join(", ")),
            Value::Function(closure) => write!(f, "<function {}>", closure.function.qualname()),
            Value::Native(native) => write!(f, "<native {}>", native.name()),
        }
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Arc::from(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(Arc::from(value))
    }
}

impl From<Arc<dyn NativeFunction>> for Value {
    fn from(value: Arc<dyn NativeFunction>) -> Self {
        Value::Native(value)
    }
}
