use crate::runtime::RuntimeError;
use std::path::PathBuf;
use strum_macros::Display;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error("debugger already started")]
    AlreadyStarted,
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    // --------------------------------- location resolution errors --------------------------------
    #[error("module `{0}` is not loaded")]
    ModuleNotLoaded(PathBuf),
    #[error("no function contains line {1} of `{0}`")]
    NoFunctionAtLine(PathBuf, u32),
    #[error("function `{1}` of `{0}` not found in loaded module")]
    FunctionNotLoaded(PathBuf, String),
    #[error("line {1} of `{0}` claimed by sibling definitions `{2}` and `{3}`")]
    AmbiguousLocation(PathBuf, u32, String, String),

    // --------------------------------- patch errors ----------------------------------------------
    #[error("no instruction mapped to line {1} in `{0}`")]
    NoInstructionAtLine(String, u32),
    #[error("unsafe to rewrite `{0}`: {1}")]
    UnsafeRewrite(String, &'static str),

    // --------------------------------- capture and collaborator errors ---------------------------
    #[error("capture failed: {0}")]
    Capture(String),
    #[error("fetch desired breakpoints: {0:#}")]
    Fetch(anyhow::Error),
    #[error("emit capture payload: {0:#}")]
    Sink(anyhow::Error),
}

/// Error category, determines how an error affects a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    /// Retried on the next tick.
    #[strum(serialize = "location not found")]
    LocationNotFound,
    /// Internal invariant violation, reported and not applied.
    #[strum(serialize = "ambiguous location")]
    AmbiguousLocation,
    /// Retried with backoff.
    #[strum(serialize = "patch failure")]
    PatchFailure,
    /// Swallowed at the handler boundary.
    #[strum(serialize = "capture failure")]
    CaptureFailure,
    /// Failure of an external collaborator (breakpoint source or event sink).
    #[strum(serialize = "collaborator failure")]
    Collaborator,
    #[strum(serialize = "generic")]
    Generic,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ModuleNotLoaded(_) => ErrorKind::LocationNotFound,
            Error::NoFunctionAtLine(_, _) => ErrorKind::LocationNotFound,
            Error::FunctionNotLoaded(_, _) => ErrorKind::LocationNotFound,
            Error::AmbiguousLocation(_, _, _, _) => ErrorKind::AmbiguousLocation,
            Error::NoInstructionAtLine(_, _) => ErrorKind::PatchFailure,
            Error::UnsafeRewrite(_, _) => ErrorKind::PatchFailure,
            Error::Capture(_) => ErrorKind::CaptureFailure,
            Error::Fetch(_) => ErrorKind::Collaborator,
            Error::Sink(_) => ErrorKind::Collaborator,
            Error::AlreadyStarted => ErrorKind::Generic,
            Error::IO(_) => ErrorKind::Generic,
            Error::Config(_) => ErrorKind::Generic,
            Error::Runtime(_) => ErrorKind::Generic,
        }
    }

    /// Return a hint of whether the debugger can keep working after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::AlreadyStarted => false,
            Error::IO(_) => false,
            Error::Runtime(_) => false,
            Error::ModuleNotLoaded(_) => false,
            Error::NoFunctionAtLine(_, _) => false,
            Error::FunctionNotLoaded(_, _) => false,
            Error::AmbiguousLocation(_, _, _, _) => false,
            Error::NoInstructionAtLine(_, _) => false,
            Error::UnsafeRewrite(_, _) => false,
            Error::Capture(_) => false,
            Error::Fetch(_) => false,
            Error::Sink(_) => false,

            // currently fatal errors
            Error::Config(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $crate::log::TARGET, "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: $crate::log::TARGET, concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!($crate::lb_warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!($crate::lb_warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!($crate::lb_debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!($crate::lb_debug, $res, $msg)
    };
}
