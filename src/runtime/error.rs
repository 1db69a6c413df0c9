use crate::runtime::value::Value;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    // --------------------------------- load errors -----------------------------------------------
    #[error("syntax error at line {line}: {message}")]
    Syntax { line: u32, message: String },
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- program exceptions ----------------------------------------
    #[error("name error: {0}")]
    Name(String),
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    ZeroDivision,
    #[error("maximum call depth ({0}) exceeded")]
    Recursion(usize),
    #[error("exception raised: {0}")]
    Raised(Value),

    // --------------------------------- runtime invariants ----------------------------------------
    #[error("internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub(crate) fn syntax(line: u32, message: impl Into<String>) -> Self {
        RuntimeError::Syntax {
            line,
            message: message.into(),
        }
    }

    /// Return true if the error is a program level exception and can be handled by
    /// an `except` block of the running program.
    pub fn is_catchable(&self) -> bool {
        match self {
            RuntimeError::Name(_) => true,
            RuntimeError::Type(_) => true,
            RuntimeError::ZeroDivision => true,
            RuntimeError::Recursion(_) => true,
            RuntimeError::Raised(_) => true,

            RuntimeError::Syntax { .. } => false,
            RuntimeError::IO(_) => false,
            RuntimeError::Internal(_) => false,
        }
    }

    /// Convert a catchable error into the value bound by an `except name:` clause.
    pub(crate) fn exception_value(&self) -> Value {
        match self {
            RuntimeError::Raised(value) => value.clone(),
            other => Value::from(other.to_string().as_str()),
        }
    }
}
