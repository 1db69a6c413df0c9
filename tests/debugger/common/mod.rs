use anyhow::anyhow;
use livebreak::config::Config;
use livebreak::debugger::{Breakpoint, BreakpointSource, CapturePayload, EventSink, LiveDebugger};
use livebreak::runtime::{ModuleRegistry, NativeFn, NativeFunction, RuntimeError, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Breakpoint source returning a settable breakpoint list.
#[derive(Default)]
pub struct StaticSource {
    breakpoints: Mutex<Vec<Breakpoint>>,
    failing: AtomicBool,
    fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(breakpoints: Vec<Breakpoint>) -> Arc<Self> {
        Arc::new(Self {
            breakpoints: Mutex::new(breakpoints),
            ..Self::default()
        })
    }

    pub fn set(&self, breakpoints: Vec<Breakpoint>) {
        *self.breakpoints.lock().unwrap() = breakpoints;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl BreakpointSource for StaticSource {
    fn fetch(&self) -> anyhow::Result<Vec<Breakpoint>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("configuration service unavailable"));
        }
        Ok(self.breakpoints.lock().unwrap().clone())
    }
}

/// Sink collecting payloads in memory.
#[derive(Default)]
pub struct MemorySink {
    payloads: Mutex<Vec<CapturePayload>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<CapturePayload> {
        std::mem::take(&mut *self.payloads.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, payload: CapturePayload) -> anyhow::Result<()> {
        self.payloads.lock().unwrap().push(payload);
        Ok(())
    }
}

pub struct FailingSink;

impl EventSink for FailingSink {
    fn emit(&self, _: CapturePayload) -> anyhow::Result<()> {
        Err(anyhow!("transport closed"))
    }
}

pub struct PanickingSink;

impl EventSink for PanickingSink {
    fn emit(&self, _: CapturePayload) -> anyhow::Result<()> {
        panic!("sink exploded")
    }
}

/// Controls the `wait` native function: a call to `wait()` signals that it is entered,
/// then blocks until released.
pub struct Gate {
    entered: Receiver<()>,
    release: Sender<()>,
}

impl Gate {
    pub fn new() -> (Arc<dyn NativeFunction>, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);

        let native: Arc<dyn NativeFunction> = NativeFn::new("wait", move |_, _: &[Value]| {
            _ = entered_tx.lock().unwrap().send(());
            release_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10))
                .map_err(|e| RuntimeError::Internal(e.to_string()))?;
            Ok(Value::None)
        });
        (
            native,
            Gate {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }

    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(10))
            .expect("gate is not entered");
    }

    pub fn release(&self) {
        self.release.send(()).unwrap();
    }
}

pub fn debugger(
    modules: &Arc<ModuleRegistry>,
    source: Arc<dyn BreakpointSource>,
    sink: Arc<dyn EventSink>,
) -> LiveDebugger {
    livebreak::log::init_test_logger();
    LiveDebugger::new(modules.clone(), source, sink, Config::default())
}

pub fn bp(id: &str, file: &str, line: u32) -> Breakpoint {
    Breakpoint::with_id(id, file, line)
}
