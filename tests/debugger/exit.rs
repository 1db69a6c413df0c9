use crate::common::{bp, debugger, MemorySink, StaticSource};
use livebreak::debugger::{Location, ProbeKind};
use livebreak::runtime::{ModuleRegistry, Value};
use serde_json::json;
use std::sync::Arc;

const DIVIDE: &str = r#"def divide(a, b):
    q = a / b
    return q

def safe(a, b):
    try:
        return divide(a, b)
    except e:
        return "failed"
"#;

#[test]
fn test_exit_probe_captures_return_and_exception() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app/divide.lb", DIVIDE).unwrap();
    let divide = module.function("divide").unwrap();
    let original = divide.code();
    let sink = MemorySink::new();
    let debugger = debugger(&modules, StaticSource::new(vec![]), sink.clone());

    let report = debugger.apply(&[
        bp("ret", "divide.lb", 1).on_exit(),
        bp("line", "divide.lb", 3),
    ]);
    assert!(report.failures.is_empty());
    assert_eq!(
        report.added,
        vec![
            Location::exit("app/divide.lb", 1),
            Location::new("app/divide.lb", 3)
        ]
    );
    assert_eq!(debugger.instrumented_lines(divide), vec![3]);
    assert_eq!(debugger.instrumented_exits(divide), vec![1]);

    assert_eq!(
        module.call("safe", &[Value::Int(6), Value::Int(3)]).unwrap(),
        Value::Float(2.0)
    );
    let payloads = sink.take();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].breakpoint_id.as_str(), "line");
    assert_eq!(payloads[0].probe, ProbeKind::Line);
    assert_eq!(payloads[0].return_value, None);

    let exit = &payloads[1];
    assert_eq!(exit.breakpoint_id.as_str(), "ret");
    assert_eq!(exit.probe, ProbeKind::Exit);
    assert_eq!(exit.line_number, 1);
    assert_eq!(exit.return_value, Some(json!(2.0)));
    assert_eq!(exit.exception, None);
    assert_eq!(exit.locals["q"], json!(2.0));
    let functions: Vec<_> = exit.stack_trace.iter().map(|f| f.function.as_str()).collect();
    assert_eq!(functions, vec!["divide", "safe"]);

    // the exception still reaches the caller's handler
    assert_eq!(
        module.call("safe", &[Value::Int(1), Value::Int(0)]).unwrap(),
        Value::from("failed")
    );
    let payloads = sink.take();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].return_value, None);
    assert_eq!(payloads[0].exception, Some(json!("division by zero")));
    assert!(!payloads[0].locals.contains_key("q"));

    let encoded = serde_json::to_value(&payloads[0]).unwrap();
    assert_eq!(encoded["probe"], json!("exit"));
    assert!(encoded.get("return_value").is_none());

    let report = debugger.apply(&[bp("line", "divide.lb", 3)]);
    assert_eq!(report.removed, vec![Location::exit("app/divide.lb", 1)]);
    assert!(debugger.instrumented_exits(divide).is_empty());
    assert_eq!(debugger.instrumented_lines(divide), vec![3]);

    debugger.apply(&[]);
    assert!(Arc::ptr_eq(&divide.code(), &original));
}

#[test]
fn test_exit_probe_on_blank_line() {
    let modules = ModuleRegistry::new();
    let module = modules
        .load("gap.lb", "def f(a):\n    b = a + 1\n\n    return b\n")
        .unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(&modules, StaticSource::new(vec![]), sink.clone());

    // a line probe needs code at the line, an exit probe only needs the enclosing function
    let report = debugger.apply(&[bp("blank", "gap.lb", 3)]);
    assert_eq!(report.failures.len(), 1);
    let report = debugger.apply(&[bp("blank", "gap.lb", 3).on_exit()]);
    assert_eq!(report.added, vec![Location::exit("gap.lb", 3)]);

    assert_eq!(module.call("f", &[Value::Int(1)]).unwrap(), Value::Int(2));
    let payloads = sink.take();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].return_value, Some(json!(2)));
}
