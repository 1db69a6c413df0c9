//! Host runtime: compiler and interpreter of a small indentation structured language.
//!
//! Functions keep their executable representation behind a replaceable [`Arc<Code>`],
//! a call takes the current representation at entry and runs it to completion.

pub mod code;
pub mod compiler;
pub mod error;
pub mod function;
pub mod interpreter;
pub mod module;
pub mod value;

pub use code::{BinaryOp, Code, ExceptionEntry, Instruction};
pub use error::RuntimeError;
pub use function::{Function, FunctionId};
pub use interpreter::{backtrace, call, CallContext, FrameSummary};
pub use module::{Globals, Module, ModuleRegistry};
pub use value::{NativeFn, NativeFunction, Value};
