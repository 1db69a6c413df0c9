//! Code executed inside the host program at patched locations.
//!
//! A handler call never fails and never panics from the host program point of view:
//! any capture or sink error is logged, counted and dropped here.

use crate::config::CaptureConfig;
use crate::debugger::breakpoint::{BreakpointId, Location, ProbeKind};
use crate::debugger::registry::BreakpointRegistry;
use crate::debugger::{Error, EventSink};
use crate::lb_debug;
use crate::log::HANDLER_TARGET;
use crate::runtime::{CallContext, NativeFunction, RuntimeError, Value};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Name of the handler native function.
pub const HANDLER_NAME: &str = "__livebreak_hit__";

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Return process unique number of the current thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// Captured state of a single breakpoint hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturePayload {
    pub breakpoint_id: BreakpointId,
    pub file_path: String,
    pub line_number: u32,
    #[serde(default)]
    pub probe: ProbeKind,
    /// Value returned by the function, exit probes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// Exception leaving the function, exit probes only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<serde_json::Value>,
    pub locals: IndexMap<String, serde_json::Value>,
    /// Call stack, innermost frame first.
    pub stack_trace: Vec<StackFrame>,
    pub timestamp: DateTime<Utc>,
    pub thread_id: u64,
    pub thread_name: Option<String>,
}

/// Decides whether a conditional breakpoint fires.
pub trait ConditionEvaluator: Send + Sync {
    /// # Arguments
    ///
    /// * `condition`: breakpoint condition expression
    /// * `locals`: encoded locals of the hit frame
    fn evaluate(&self, condition: &str, locals: &IndexMap<String, serde_json::Value>) -> bool;
}

/// Accepts every breakpoint, conditions are not evaluated.
#[derive(Default)]
pub struct AcceptAll;

impl ConditionEvaluator for AcceptAll {
    fn evaluate(&self, _: &str, _: &IndexMap<String, serde_json::Value>) -> bool {
        true
    }
}

/// Handler counters.
#[derive(Default)]
pub struct HandlerStats {
    hits: AtomicU64,
    emitted: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

/// Point in time copy of [`HandlerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCounters {
    /// Handler invocations.
    pub hits: u64,
    /// Payloads accepted by the sink.
    pub emitted: u64,
    /// Breakpoints skipped by their condition.
    pub skipped: u64,
    /// Capture and emit failures, panics included.
    pub failures: u64,
}

impl HandlerStats {
    pub fn counters(&self) -> HandlerCounters {
        HandlerCounters {
            hits: self.hits.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Convert a value into JSON, respecting capture limits.
/// Values that cannot be represented degrade into placeholder strings.
pub fn encode_value(value: &Value, limits: &CaptureConfig) -> serde_json::Value {
    encode(value, 0, limits)
}

fn encode(value: &Value, depth: usize, limits: &CaptureConfig) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::None => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(i) => Json::from(*i),
        Value::Float(f) => match serde_json::Number::from_f64(*f) {
            Some(n) => Json::Number(n),
            None => Json::String(format!("<unserializable: {f}>")),
        },
        Value::Str(s) => {
            if s.chars().count() > limits.max_string_len {
                let mut truncated: String = s.chars().take(limits.max_string_len).collect();
                truncated.push('…');
                Json::String(truncated)
            } else {
                Json::String(s.to_string())
            }
        }
        Value::List(_) if depth >= limits.max_depth => Json::String("<...>".to_string()),
        Value::List(items) => Json::Array(
            items
                .iter()
                .map(|item| encode(item, depth + 1, limits))
                .collect(),
        ),
        Value::Function(_) | Value::Native(_) => Json::String(value.to_string()),
    }
}

/// Function exit observed by an exit probe.
enum Exit<'a> {
    Returned(&'a Value),
    Raised(&'a Value),
}

/// Native function called from patched code with `(file, line)` arguments,
/// or `(file, line, value, raised)` on function exit.
pub struct HandlerRuntime {
    registry: Arc<RwLock<BreakpointRegistry>>,
    sink: Arc<dyn EventSink>,
    condition: Arc<dyn ConditionEvaluator>,
    limits: CaptureConfig,
    stats: HandlerStats,
}

impl HandlerRuntime {
    pub fn new(
        registry: Arc<RwLock<BreakpointRegistry>>,
        sink: Arc<dyn EventSink>,
        condition: Arc<dyn ConditionEvaluator>,
        limits: CaptureConfig,
    ) -> Self {
        Self {
            registry,
            sink,
            condition,
            limits,
            stats: HandlerStats::default(),
        }
    }

    pub fn stats(&self) -> &HandlerStats {
        &self.stats
    }

    fn fail(&self, err: impl std::fmt::Display) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        lb_debug!(target: HANDLER_TARGET, "breakpoint hit dropped: {err}");
    }

    /// Handle a hit. Return number of emitted payloads.
    fn on_hit(&self, ctx: &CallContext<'_>, args: &[Value]) -> Result<usize, Error> {
        let (file, line, exit) = match args {
            [Value::Str(file), Value::Int(line)] if *line >= 0 => (file.clone(), *line as u32, None),
            [Value::Str(file), Value::Int(line), value, Value::Bool(raised)] if *line >= 0 => {
                let exit = if *raised {
                    Exit::Raised(value)
                } else {
                    Exit::Returned(value)
                };
                (file.clone(), *line as u32, Some(exit))
            }
            _ => return Err(Error::Capture("malformed handler arguments".to_string())),
        };
        self.stats.hits.fetch_add(1, Ordering::Relaxed);

        let kind = match exit {
            Some(_) => ProbeKind::Exit,
            None => ProbeKind::Line,
        };
        let location = Location::with_kind(PathBuf::from(&*file), line, kind);
        let targets = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hit_targets(&location);
        if targets.is_empty() {
            return Ok(0);
        }

        let locals: IndexMap<String, serde_json::Value> = ctx
            .locals()
            .into_iter()
            .take(self.limits.max_locals)
            .map(|(name, value)| (name.to_string(), encode_value(&value, &self.limits)))
            .collect();
        let stack_trace: Vec<StackFrame> = ctx
            .backtrace()
            .into_iter()
            .take(self.limits.max_frames)
            .map(|frame| StackFrame {
                function: frame.function.to_string(),
                file: frame.file.to_string(),
                line: frame.line,
            })
            .collect();
        let (return_value, exception) = match exit {
            Some(Exit::Returned(value)) => (Some(encode_value(value, &self.limits)), None),
            Some(Exit::Raised(value)) => (None, Some(encode_value(value, &self.limits))),
            None => (None, None),
        };
        let thread = std::thread::current();
        let thread_name = thread.name().map(ToString::to_string);
        let timestamp = Utc::now();

        let mut emitted = 0;
        for (id, condition) in targets {
            if let Some(condition) = &condition {
                if !self.condition.evaluate(condition, &locals) {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            let payload = CapturePayload {
                breakpoint_id: id,
                file_path: file.to_string(),
                line_number: line,
                probe: kind,
                return_value: return_value.clone(),
                exception: exception.clone(),
                locals: locals.clone(),
                stack_trace: stack_trace.clone(),
                timestamp,
                thread_id: current_thread_id(),
                thread_name: thread_name.clone(),
            };
            match catch_unwind(AssertUnwindSafe(|| self.sink.emit(payload))) {
                Ok(Ok(())) => {
                    self.stats.emitted.fetch_add(1, Ordering::Relaxed);
                    emitted += 1;
                }
                Ok(Err(err)) => self.fail(Error::Sink(err)),
                Err(_) => self.fail("event sink panicked"),
            }
        }
        Ok(emitted)
    }
}

impl NativeFunction for HandlerRuntime {
    fn name(&self) -> &str {
        HANDLER_NAME
    }

    fn call(&self, ctx: &CallContext<'_>, args: &[Value]) -> Result<Value, RuntimeError> {
        match catch_unwind(AssertUnwindSafe(|| self.on_hit(ctx, args))) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => self.fail(err),
            Err(_) => self.fail("breakpoint handler panicked"),
        }
        Ok(Value::None)
    }
}
