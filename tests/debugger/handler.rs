use crate::common::{bp, FailingSink, MemorySink, PanickingSink, StaticSource};
use indexmap::IndexMap;
use livebreak::config::{CaptureConfig, Config};
use livebreak::debugger::{ConditionEvaluator, EventSink, LiveDebugger};
use livebreak::runtime::{ModuleRegistry, RuntimeError, Value};
use std::sync::Arc;

const FLOW: &str = r#"
def run(n):
    total = 0
    i = 0
    while i < n:
        i += 1
        if i % 2 == 0:
            continue
        total += i
    return total

def guarded(a, b):
    try:
        q = a / b
        return q
    except err:
        return "failed: " + err

def raising(x):
    raise x

def make_adder(k):
    def add(v):
        return v + k
    return add(10)
"#;

/// Every line holding code in `FLOW` functions.
fn all_lines() -> Vec<u32> {
    vec![2, 3, 4, 5, 6, 7, 8, 9, 10, 12, 13, 14, 15, 16, 17, 19, 20, 22, 23, 24, 25]
}

fn results(module: &livebreak::runtime::Module) -> Vec<Result<Value, String>> {
    let call = |name: &str, args: &[Value]| module.call(name, args).map_err(|e| e.to_string());
    vec![
        call("run", &[Value::Int(7)]),
        call("guarded", &[Value::Int(6), Value::Int(4)]),
        call("guarded", &[Value::Int(1), Value::Int(0)]),
        call("raising", &[Value::from("boom")]),
        call("make_adder", &[Value::Int(5)]),
    ]
}

fn instrumented_results(sink: Arc<dyn EventSink>) -> Vec<Result<Value, String>> {
    let modules = ModuleRegistry::new();
    let module = modules.load("flow.lb", FLOW).unwrap();
    let breakpoints = all_lines()
        .into_iter()
        .map(|line| bp(&format!("bp-{line}"), "flow.lb", line))
        .collect();
    let debugger = LiveDebugger::new(
        modules,
        StaticSource::new(breakpoints),
        sink,
        Config::default(),
    );
    let report = debugger.refresh().unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.added.len(), all_lines().len());
    results(&module)
}

#[test]
fn test_patched_functions_keep_semantic() {
    let modules = ModuleRegistry::new();
    let module = modules.load("flow.lb", FLOW).unwrap();
    let expected = results(&module);
    assert_eq!(expected[0], Ok(Value::Int(16)));
    assert_eq!(expected[1], Ok(Value::Float(1.5)));
    assert_eq!(expected[2], Ok(Value::from("failed: division by zero")));
    assert!(matches!(&expected[3], Err(msg) if msg.contains("boom")));
    assert_eq!(expected[4], Ok(Value::Int(15)));

    let sink = MemorySink::new();
    assert_eq!(instrumented_results(sink.clone()), expected);
    assert!(sink.len() > 0);
}

#[test]
fn test_sink_failures_do_not_change_results() {
    let modules = ModuleRegistry::new();
    let module = modules.load("flow.lb", FLOW).unwrap();
    let expected = results(&module);

    assert_eq!(instrumented_results(Arc::new(FailingSink)), expected);
    assert_eq!(instrumented_results(Arc::new(PanickingSink)), expected);
}

#[test]
fn test_handler_counters() {
    let modules = ModuleRegistry::new();
    let module = modules.load("flow.lb", FLOW).unwrap();
    let debugger = LiveDebugger::new(
        modules,
        StaticSource::new(vec![bp("a", "flow.lb", 20), bp("b", "flow.lb", 20)]),
        Arc::new(FailingSink),
        Config::default(),
    );
    debugger.refresh().unwrap();

    let err = module.call("raising", &[Value::Int(1)]).unwrap_err();
    assert!(matches!(err, RuntimeError::Raised(Value::Int(1))));

    let counters = debugger.stats();
    assert_eq!(counters.hits, 1);
    assert_eq!(counters.emitted, 0);
    assert_eq!(counters.failures, 2);
}

/// Evaluates `name == value` conditions against integer locals.
struct EqualsEvaluator;

impl ConditionEvaluator for EqualsEvaluator {
    fn evaluate(&self, condition: &str, locals: &IndexMap<String, serde_json::Value>) -> bool {
        let Some((name, value)) = condition.split_once("==") else {
            return false;
        };
        let Ok(value) = value.trim().parse::<i64>() else {
            return false;
        };
        locals.get(name.trim()) == Some(&serde_json::json!(value))
    }
}

#[test]
fn test_conditional_breakpoints() {
    let modules = ModuleRegistry::new();
    let module = modules.load("flow.lb", FLOW).unwrap();
    let sink = MemorySink::new();
    let debugger = LiveDebugger::builder()
        .with_condition_evaluator(Arc::new(EqualsEvaluator))
        .build(
            modules,
            StaticSource::new(vec![
                bp("cond", "flow.lb", 9).with_condition("i == 5"),
                bp("plain", "flow.lb", 9),
            ]),
            sink.clone(),
        );
    debugger.refresh().unwrap();

    module.call("run", &[Value::Int(7)]).unwrap();

    let payloads = sink.take();
    let cond_hits: Vec<_> = payloads
        .iter()
        .filter(|p| p.breakpoint_id.as_str() == "cond")
        .collect();
    assert_eq!(cond_hits.len(), 1);
    assert_eq!(cond_hits[0].locals["total"], serde_json::json!(4));
    assert_eq!(payloads.len(), 5);
    assert_eq!(debugger.stats().skipped, 3);
}

#[test]
fn test_capture_limits() {
    let modules = ModuleRegistry::new();
    let module = modules
        .load(
            "limits.lb",
            "def f(a, b, c):\n    s = a + b + c\n    return s\n",
        )
        .unwrap();
    let sink = MemorySink::new();
    let config = Config {
        capture: CaptureConfig {
            max_locals: 2,
            max_string_len: 2,
            ..CaptureConfig::default()
        },
        ..Config::default()
    };
    let debugger = LiveDebugger::new(
        modules,
        StaticSource::new(vec![bp("a", "limits.lb", 3)]),
        sink.clone(),
        config,
    );
    debugger.refresh().unwrap();

    let args = [Value::from("xyz"), Value::from("1"), Value::from("2")];
    assert_eq!(module.call("f", &args).unwrap(), Value::from("xyz12"));

    let payload = sink.take().pop().unwrap();
    assert_eq!(
        payload.locals.keys().collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert_eq!(payload.locals["a"], serde_json::json!("xy…"));
}
