use crate::common::{bp, debugger, MemorySink, StaticSource};
use livebreak::debugger::PatchState;
use livebreak::runtime::{ModuleRegistry, Value};
use std::sync::Arc;

const NESTED: &str = r#"
def outer(n):
    base = n * 10
    def inner(k):
        y = k + base
        return y
    total = inner(1) + inner(2)
    return total
"#;

#[test]
fn test_nested_breakpoint_patches_only_child() {
    let modules = ModuleRegistry::new();
    let module = modules.load("nested.lb", NESTED).unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(&modules, StaticSource::new(vec![]), sink.clone());
    let outer = module.function("outer").unwrap();
    let inner = module.function("outer.inner").unwrap();
    let outer_original = outer.code();

    let report = debugger.apply(&[bp("child", "nested.lb", 5)]);
    assert_eq!(report.added.len(), 1);
    assert!(Arc::ptr_eq(&outer.code(), &outer_original));
    assert_eq!(debugger.instrumented_lines(inner), vec![5]);
    assert_eq!(debugger.patch_state(outer.id()), PatchState::Unpatched);
    assert_eq!(debugger.patch_state(inner.id()), PatchState::Patched);

    assert_eq!(module.call("outer", &[Value::Int(1)]).unwrap(), Value::Int(23));

    let payloads = sink.take();
    assert_eq!(payloads.len(), 2);
    assert_eq!(payloads[0].locals["k"], serde_json::json!(1));
    assert_eq!(payloads[0].locals["base"], serde_json::json!(10));
    assert!(!payloads[0].locals.contains_key("y"));
    assert_eq!(payloads[1].locals["k"], serde_json::json!(2));

    let functions: Vec<_> = payloads[0]
        .stack_trace
        .iter()
        .map(|frame| frame.function.as_str())
        .collect();
    assert_eq!(functions, vec!["outer.inner", "outer"]);
}

#[test]
fn test_parent_removal_keeps_child_patched() {
    let modules = ModuleRegistry::new();
    let module = modules.load("nested.lb", NESTED).unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(&modules, StaticSource::new(vec![]), sink.clone());
    let outer = module.function("outer").unwrap();
    let inner = module.function("outer.inner").unwrap();
    let outer_original = outer.code();

    debugger.apply(&[bp("parent", "nested.lb", 7), bp("child", "nested.lb", 5)]);
    assert_eq!(debugger.instrumented_lines(outer), vec![7]);
    assert_eq!(debugger.instrumented_lines(inner), vec![5]);
    assert_eq!(debugger.patched_nested(outer.id()), vec![inner.id()]);
    assert!(debugger.patched_nested(inner.id()).is_empty());

    let report = debugger.apply(&[bp("child", "nested.lb", 5)]);
    assert_eq!(report.removed.len(), 1);
    assert!(Arc::ptr_eq(&outer.code(), &outer_original));
    assert_eq!(debugger.instrumented_lines(inner), vec![5]);
    assert_eq!(debugger.patch_state(inner.id()), PatchState::Patched);
    assert!(debugger.patched_nested(outer.id()).is_empty());

    assert_eq!(module.call("outer", &[Value::Int(2)]).unwrap(), Value::Int(43));
    assert!(sink
        .take()
        .iter()
        .all(|p| p.breakpoint_id.as_str() == "child"));
}

#[test]
fn test_child_removal_keeps_parent_patched() {
    let modules = ModuleRegistry::new();
    let module = modules.load("nested.lb", NESTED).unwrap();
    let debugger = debugger(&modules, StaticSource::new(vec![]), MemorySink::new());
    let outer = module.function("outer").unwrap();
    let inner = module.function("outer.inner").unwrap();
    let inner_original = inner.code();

    debugger.apply(&[bp("parent", "nested.lb", 3), bp("child", "nested.lb", 6)]);
    assert_eq!(debugger.patched_nested(outer.id()), vec![inner.id()]);
    debugger.apply(&[bp("parent", "nested.lb", 3)]);

    assert!(Arc::ptr_eq(&inner.code(), &inner_original));
    assert!(debugger.patched_nested(outer.id()).is_empty());
    assert_eq!(debugger.instrumented_lines(outer), vec![3]);
}
