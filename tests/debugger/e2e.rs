use crate::common::{bp, debugger, MemorySink, StaticSource};
use livebreak::debugger::BreakpointId;
use livebreak::runtime::{ModuleRegistry, Value};
use std::path::Path;

const M: &str = r#"
def helper():
    return 0

def main():
    return f()

def f():
    x = 1
    y = 2
    return x + y
"#;

#[test]
fn test_single_hit_payload() {
    let modules = ModuleRegistry::new();
    let module = modules.load("m", M).unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "m", 10)]),
        sink.clone(),
    );

    let report = debugger.refresh().unwrap();
    assert_eq!(report.added.len(), 1);
    assert!(report.failures.is_empty());

    assert_eq!(module.call("f", &[]).unwrap(), Value::Int(3));

    let payloads = sink.take();
    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload.breakpoint_id, BreakpointId::from("a"));
    assert_eq!(payload.file_path, "m");
    assert_eq!(payload.line_number, 10);
    assert_eq!(payload.locals.len(), 1);
    assert_eq!(payload.locals["x"], serde_json::json!(1));
    assert_eq!(payload.stack_trace[0].function, "f");
    assert_eq!(payload.stack_trace[0].line, 10);
    assert_eq!(payload.thread_name.as_deref(), std::thread::current().name());
}

#[test]
fn test_stack_trace_innermost_first() {
    let modules = ModuleRegistry::new();
    let module = modules.load("m", M).unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "m", 10)]),
        sink.clone(),
    );
    debugger.refresh().unwrap();

    assert_eq!(module.call("main", &[]).unwrap(), Value::Int(3));

    let payloads = sink.take();
    assert_eq!(payloads.len(), 1);
    let functions: Vec<_> = payloads[0]
        .stack_trace
        .iter()
        .map(|frame| frame.function.as_str())
        .collect();
    assert_eq!(functions[..2], ["f", "main"]);
    assert_eq!(payloads[0].stack_trace[1].line, 6);
}

#[test]
fn test_payload_serialization() {
    let modules = ModuleRegistry::new();
    let module = modules.load("m", M).unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "m", 11)]),
        sink.clone(),
    );
    debugger.refresh().unwrap();
    module.call("f", &[]).unwrap();

    let payload = sink.take().pop().unwrap();
    let json = serde_json::to_value(&payload).unwrap();
    assert_eq!(json["breakpoint_id"], "a");
    assert_eq!(json["line_number"], 11);
    assert_eq!(json["locals"], serde_json::json!({"x": 1, "y": 2}));
    assert_eq!(json["stack_trace"][0]["file"], "m");
    assert!(modules.get(Path::new("m")).is_some());
}

#[test]
fn test_unknown_module_is_resolved_after_load() {
    let modules = ModuleRegistry::new();
    let sink = MemorySink::new();
    let debugger = debugger(
        &modules,
        StaticSource::new(vec![bp("a", "m", 10)]),
        sink.clone(),
    );

    let report = debugger.refresh().unwrap();
    assert!(report.added.is_empty());
    assert_eq!(report.failures.len(), 1);

    let module = modules.load("m", M).unwrap();
    let report = debugger.refresh().unwrap();
    assert_eq!(report.added.len(), 1);

    module.call("f", &[]).unwrap();
    assert_eq!(sink.len(), 1);
}
