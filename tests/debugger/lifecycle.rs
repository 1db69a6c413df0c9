use crate::common::{bp, debugger, MemorySink, StaticSource};
use livebreak::config::Config;
use livebreak::debugger::{Error, ErrorKind, LiveDebugger, Location, PatchState};
use livebreak::runtime::{ModuleRegistry, Value};
use serial_test::serial;
use std::mem;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const APP: &str = "def f(a):\n    b = a * 2\n    return b\n";

#[test]
fn test_start_installs_and_stop_restores() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app.lb", APP).unwrap();
    let f = module.function("f").unwrap();
    let original = f.code();
    let sink = MemorySink::new();
    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "app.lb", 2)]),
        sink.clone(),
    );

    debugger.start().unwrap();
    assert!(debugger.is_running());
    assert_eq!(debugger.instrumented_lines(f), vec![2]);
    assert!(matches!(debugger.start(), Err(Error::AlreadyStarted)));

    module.call("f", &[Value::Int(1)]).unwrap();
    assert_eq!(sink.take().len(), 1);

    debugger.stop();
    assert!(!debugger.is_running());
    assert!(Arc::ptr_eq(&f.code(), &original));

    module.call("f", &[Value::Int(1)]).unwrap();
    assert_eq!(sink.len(), 0);

    // restart after stop
    debugger.start().unwrap();
    assert_eq!(debugger.instrumented_lines(f), vec![2]);
    debugger.stop();
}

#[test]
fn test_drop_restores() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app.lb", APP).unwrap();
    let f = module.function("f").unwrap();
    let original = f.code();

    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "app.lb", 3)]),
        MemorySink::new(),
    );
    debugger.start().unwrap();
    assert!(!Arc::ptr_eq(&f.code(), &original));

    mem::drop(debugger);
    assert!(Arc::ptr_eq(&f.code(), &original));
}

#[test]
fn test_start_survives_fetch_failure() {
    let modules = ModuleRegistry::new();
    modules.load("app.lb", APP).unwrap();
    let source = StaticSource::new(vec![bp("a", "app.lb", 2)]);
    source.set_failing(true);
    let debugger = debugger(&modules, source.clone(), MemorySink::new());

    debugger.start().unwrap();
    assert!(debugger.is_running());
    assert_eq!(source.fetches(), 1);
    debugger.stop();
}

#[test]
fn test_poller_picks_up_changes() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app.lb", APP).unwrap();
    let f = module.function("f").unwrap();
    let source = StaticSource::new(vec![]);
    let config = Config {
        poll_interval_secs: 1,
        ..Config::default()
    };
    let debugger = LiveDebugger::new(modules.clone(), source.clone(), MemorySink::new(), config);

    debugger.start().unwrap();
    assert!(debugger.instrumented_lines(f).is_empty());

    source.set(vec![bp("a", "app.lb", 3)]);
    let deadline = Instant::now() + Duration::from_secs(10);
    while debugger.instrumented_lines(f).is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(debugger.instrumented_lines(f), vec![3]);
    debugger.stop();
    assert!(debugger.instrumented_lines(f).is_empty());
}

#[test]
fn test_reload_installs_into_new_function() {
    let modules = ModuleRegistry::new();
    let old = modules.load("app.lb", APP).unwrap();
    let old_f = old.function("f").unwrap().clone();
    let sink = MemorySink::new();
    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "app.lb", 3)]),
        sink.clone(),
    );
    debugger.refresh().unwrap();
    assert_eq!(debugger.instrumented_lines(&old_f), vec![3]);

    let new = modules
        .load("app.lb", "def f(a):\n    b = a + 100\n    return b\n")
        .unwrap();
    let new_f = new.function("f").unwrap();
    let report = debugger.refresh().unwrap();
    assert_eq!(report.added.len(), 1);
    assert_eq!(report.removed.len(), 1);
    assert_eq!(debugger.instrumented_lines(new_f), vec![3]);
    assert!(debugger.instrumented_lines(&old_f).is_empty());

    assert_eq!(new.call("f", &[Value::Int(1)]).unwrap(), Value::Int(101));
    let payloads = sink.take();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].locals["b"], serde_json::json!(101));
}

#[test]
fn test_unload_restores_function() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app.lb", APP).unwrap();
    let f = module.function("f").unwrap().clone();
    let original = f.code();
    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "app.lb", 2)]),
        MemorySink::new(),
    );
    debugger.refresh().unwrap();
    assert_eq!(debugger.instrumented_lines(&f), vec![2]);

    modules.unload("app.lb".as_ref()).unwrap();
    let report = debugger.refresh().unwrap();
    assert_eq!(report.removed, vec![Location::new("app.lb", 2)]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, ErrorKind::LocationNotFound);
    assert!(Arc::ptr_eq(&f.code(), &original));
    assert_eq!(debugger.patch_state(f.id()), PatchState::Unpatched);

    // loading the module again installs the breakpoint into the new function
    let module = modules.load("app.lb", APP).unwrap();
    let report = debugger.refresh().unwrap();
    assert_eq!(report.added, vec![Location::new("app.lb", 2)]);
    assert_eq!(debugger.instrumented_lines(module.function("f").unwrap()), vec![2]);
}

#[test]
#[serial]
fn test_disabled_logging() {
    let modules = ModuleRegistry::new();
    modules.load("app.lb", APP).unwrap();
    let config = Config::parse("log_enabled = false\npoll_interval_secs = 5\n").unwrap();
    assert_eq!(config.poll_interval(), Duration::from_secs(5));

    let debugger = LiveDebugger::new(
        modules,
        StaticSource::new(vec![bp("a", "app.lb", 2)]),
        MemorySink::new(),
        config,
    );
    assert!(!livebreak::log::is_enabled());
    assert_eq!(debugger.refresh().unwrap().added.len(), 1);

    mem::drop(debugger);
    livebreak::log::enable();
    assert!(livebreak::log::is_enabled());
}
