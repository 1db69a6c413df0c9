use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Lifecycle messages target.
pub const TARGET: &str = "livebreak";
/// Hot path (breakpoint hit) diagnostics target.
pub const HANDLER_TARGET: &str = "livebreak::handler";

#[inline(always)]
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

/// Mute engine logging process-wide.
pub fn disable() {
    ENABLED.store(false, Ordering::SeqCst)
}

pub fn enable() {
    ENABLED.store(true, Ordering::SeqCst)
}

/// Install `env_logger` configured from `RUST_LOG`. Does nothing if a logger is already set.
pub fn init_logger() {
    _ = env_logger::Builder::from_default_env().try_init();
}

/// Same as [`init_logger`] but captured by the test harness.
pub fn init_test_logger() {
    _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .try_init();
}

/// Log at a level through the `log` facade unless engine logging is muted.
/// Records without an explicit target go to [`TARGET`].
#[macro_export]
macro_rules! lb_log {
    ($level:expr, target: $target:expr, $($arg:tt)+) => {
        if $crate::log::is_enabled() {
            ::log::log!(target: $target, $level, $($arg)+)
        }
    };
    ($level:expr, $($arg:tt)+) => {
        $crate::lb_log!($level, target: $crate::log::TARGET, $($arg)+)
    };
}

#[macro_export]
macro_rules! lb_info {
    ($($arg:tt)+) => { $crate::lb_log!(::log::Level::Info, $($arg)+) };
}

#[macro_export]
macro_rules! lb_warn {
    ($($arg:tt)+) => { $crate::lb_log!(::log::Level::Warn, $($arg)+) };
}

#[macro_export]
macro_rules! lb_error {
    ($($arg:tt)+) => { $crate::lb_log!(::log::Level::Error, $($arg)+) };
}

#[macro_export]
macro_rules! lb_debug {
    ($($arg:tt)+) => { $crate::lb_log!(::log::Level::Debug, $($arg)+) };
}
