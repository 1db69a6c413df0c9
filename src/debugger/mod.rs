//! Live debugger: non-interrupting breakpoints for a running program.
//!
//! Desired breakpoints are periodically fetched from a [`BreakpointSource`]. Each breakpoint
//! location is resolved to the innermost function containing it, and the function code is
//! replaced by an instrumented copy that calls the hit handler before the location executes.
//! The handler captures locals and the call stack, sends them to an [`EventSink`] and returns,
//! the program keeps running.

pub mod breakpoint;
pub mod error;
pub mod handler;
pub mod patch;
pub mod poller;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod source;

pub use breakpoint::{Breakpoint, BreakpointId, Location, ProbeKind};
pub use error::{Error, ErrorKind};
pub use handler::{AcceptAll, CapturePayload, ConditionEvaluator, HandlerCounters, StackFrame};
pub use reconcile::{Failure, TickReport};
pub use registry::PatchState;
pub use resolver::{FunctionHandle, ModuleResolver, SourceResolver};

use crate::config::Config;
use crate::debugger::handler::HandlerRuntime;
use crate::debugger::patch::PatchEngine;
use crate::debugger::poller::{Poller, PollerHandle};
use crate::debugger::reconcile::Reconciler;
use crate::debugger::registry::BreakpointRegistry;
use crate::runtime::{Function, FunctionId, ModuleRegistry};
use crate::{lb_info, weak_error};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Source of the desired breakpoint set.
pub trait BreakpointSource: Send + Sync {
    /// Return breakpoints that must be installed. Breakpoints absent
    /// from the result are removed.
    fn fetch(&self) -> anyhow::Result<Vec<Breakpoint>>;
}

/// Receiver of breakpoint hits.
pub trait EventSink: Send + Sync {
    /// Accept a payload. Called on the host program thread that hit the breakpoint.
    fn emit(&self, payload: CapturePayload) -> anyhow::Result<()>;
}

pub struct LiveDebuggerBuilder {
    config: Config,
    condition: Arc<dyn ConditionEvaluator>,
    resolver: Option<Arc<dyn SourceResolver>>,
}

impl LiveDebuggerBuilder {
    pub fn with_config(self, config: Config) -> Self {
        Self { config, ..self }
    }

    /// Set evaluator of breakpoint conditions. By default every breakpoint fires.
    pub fn with_condition_evaluator(self, condition: Arc<dyn ConditionEvaluator>) -> Self {
        Self { condition, ..self }
    }

    /// Set location resolver. By default a [`ModuleResolver`] over the module registry is used.
    pub fn with_resolver(self, resolver: Arc<dyn SourceResolver>) -> Self {
        Self {
            resolver: Some(resolver),
            ..self
        }
    }

    /// Create a debugger.
    ///
    /// # Arguments
    ///
    /// * `modules`: live modules of the program
    /// * `source`: desired breakpoints source
    /// * `sink`: breakpoint hits receiver
    pub fn build(
        self,
        modules: Arc<ModuleRegistry>,
        source: Arc<dyn BreakpointSource>,
        sink: Arc<dyn EventSink>,
    ) -> LiveDebugger {
        if !self.config.log_enabled {
            crate::log::disable();
        }

        let registry = Arc::new(RwLock::new(BreakpointRegistry::default()));
        let handler = Arc::new(HandlerRuntime::new(
            registry.clone(),
            sink,
            self.condition,
            self.config.capture.clone(),
        ));
        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(ModuleResolver::new(modules, self.config.outline_cache_size))
        });
        let reconciler = Reconciler::new(
            resolver,
            PatchEngine::new(handler.clone()),
            registry.clone(),
            self.config.retry.clone(),
        );

        LiveDebugger {
            inner: Arc::new(Inner {
                reconciler,
                source,
                handler,
                registry,
            }),
            config: self.config,
            poller: Mutex::new(None),
        }
    }
}

struct Inner {
    reconciler: Reconciler,
    source: Arc<dyn BreakpointSource>,
    handler: Arc<HandlerRuntime>,
    registry: Arc<RwLock<BreakpointRegistry>>,
}

impl Inner {
    fn tick(&self) -> Result<TickReport, Error> {
        self.reconciler.tick(self.source.as_ref())
    }
}

/// Debugger lifecycle: polling, instrumentation and cleanup.
/// Dropping the debugger stops it.
pub struct LiveDebugger {
    inner: Arc<Inner>,
    config: Config,
    poller: Mutex<Option<PollerHandle>>,
}

impl LiveDebugger {
    pub fn builder() -> LiveDebuggerBuilder {
        LiveDebuggerBuilder {
            config: Config::default(),
            condition: Arc::new(AcceptAll),
            resolver: None,
        }
    }

    pub fn new(
        modules: Arc<ModuleRegistry>,
        source: Arc<dyn BreakpointSource>,
        sink: Arc<dyn EventSink>,
        config: Config,
    ) -> Self {
        Self::builder()
            .with_config(config)
            .build(modules, source, sink)
    }

    /// Install currently desired breakpoints and start periodic polling.
    pub fn start(&self) -> Result<(), Error> {
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        if poller.is_some() {
            return Err(Error::AlreadyStarted);
        }

        weak_error!(self.inner.tick(), "initial tick:");

        let inner = self.inner.clone();
        let handle = Poller::new(self.config.poll_interval()).run(move || {
            weak_error!(inner.tick(), "tick:");
        })?;
        *poller = Some(handle);
        lb_info!(
            "live debugger started, poll interval {:?}",
            self.config.poll_interval()
        );
        Ok(())
    }

    /// Stop polling and restore original code of all patched functions.
    /// Frames already running patched code may hit the handler once more.
    pub fn stop(&self) {
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            handle.stop();
        }

        let restored = self.inner.reconciler.restore_all();
        if was_running || restored > 0 {
            lb_info!("live debugger stopped, {restored} functions restored");
        }
    }

    pub fn is_running(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Fetch desired breakpoints and reconcile now.
    pub fn refresh(&self) -> Result<TickReport, Error> {
        self.inner.tick()
    }

    /// Reconcile against an explicitly given breakpoint set.
    pub fn apply(&self, desired: &[Breakpoint]) -> TickReport {
        self.inner.reconciler.apply(desired)
    }

    pub fn stats(&self) -> HandlerCounters {
        self.inner.handler.stats().counters()
    }

    /// Return lines instrumented in the current code of a function.
    pub fn instrumented_lines(&self, function: &Function) -> Vec<u32> {
        self.inner
            .reconciler
            .engine()
            .insertions(&function.code())
    }

    /// Return lines of exit probes instrumented in a function.
    pub fn instrumented_exits(&self, function: &Function) -> Vec<u32> {
        self.inner.reconciler.engine().exits(&function.code())
    }

    /// Return patch state of a function.
    pub fn patch_state(&self, function: FunctionId) -> PatchState {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .function(function)
            .map(|record| record.state())
            .unwrap_or(PatchState::Unpatched)
    }

    /// Return patched functions defined directly inside a patched function.
    pub fn patched_nested(&self, function: FunctionId) -> Vec<FunctionId> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .patched_nested(function)
    }

    /// Return breakpoint ids installed at a location.
    pub fn breakpoints_at(&self, location: &Location) -> Vec<BreakpointId> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .hit_targets(location)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for LiveDebugger {
    fn drop(&mut self) {
        self.stop();
    }
}
