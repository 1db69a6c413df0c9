pub mod config;
pub mod debugger;
pub mod log;
pub mod runtime;
