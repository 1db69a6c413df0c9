use crate::common::{bp, debugger, MemorySink, StaticSource};
use livebreak::debugger::{Error, ErrorKind, Location, PatchState};
use livebreak::runtime::{ModuleRegistry, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

const CALC: &str = r#"
def sum(a, b):
    s = a + b
    return s

def fact(n):
    result = 1
    while n > 1:
        result *= n
        n -= 1
    return result

def classify(n):
    if n < 0:
        return "negative"
    else:
        return "non-negative"
"#;

#[test]
fn test_reconcile_twice_is_noop() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app/calc.lb", CALC).unwrap();
    let debugger = debugger(&modules, StaticSource::new(vec![]), MemorySink::new());
    let desired = [bp("a", "calc.lb", 3), bp("b", "calc.lb", 9)];

    let first = debugger.apply(&desired);
    assert_eq!(first.added.len(), 2);

    let sum = module.function("sum").unwrap();
    let fact = module.function("fact").unwrap();
    let sum_code = sum.code();
    let fact_code = fact.code();

    let second = debugger.apply(&desired);
    assert!(second.is_noop());
    assert!(second.updated.is_empty());
    assert!(second.failures.is_empty());
    assert!(Arc::ptr_eq(&sum.code(), &sum_code));
    assert!(Arc::ptr_eq(&fact.code(), &fact_code));
}

#[test]
fn test_remove_last_location_restores_snapshot() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app/calc.lb", CALC).unwrap();
    let debugger = debugger(&modules, StaticSource::new(vec![]), MemorySink::new());
    let fact = module.function("fact").unwrap();
    let classify = module.function("classify").unwrap();
    let fact_original = fact.code();
    let classify_original = classify.code();

    debugger.apply(&[bp("a", "calc.lb", 9), bp("b", "calc.lb", 14)]);
    assert_eq!(debugger.instrumented_lines(fact), vec![9]);
    assert_eq!(debugger.instrumented_lines(classify), vec![14]);
    assert_eq!(debugger.patch_state(fact.id()), PatchState::Patched);

    let report = debugger.apply(&[bp("b", "calc.lb", 14)]);
    assert_eq!(report.removed, vec![Location::new("app/calc.lb", 9)]);
    assert!(Arc::ptr_eq(&fact.code(), &fact_original));
    assert_eq!(debugger.patch_state(fact.id()), PatchState::Unpatched);
    assert!(!Arc::ptr_eq(&classify.code(), &classify_original));

    assert_eq!(module.call("fact", &[Value::Int(5)]).unwrap(), Value::Int(120));
}

#[test]
fn test_shared_location_single_insertion() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app/calc.lb", CALC).unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(&modules, StaticSource::new(vec![]), sink.clone());

    debugger.apply(&[
        bp("a", "calc.lb", 3),
        bp("b", "app/calc.lb", 3),
        bp("c", "calc.lb", 3),
    ]);
    let sum = module.function("sum").unwrap();
    assert_eq!(debugger.instrumented_lines(sum), vec![3]);
    assert_eq!(
        debugger.breakpoints_at(&Location::new("app/calc.lb", 3)).len(),
        3
    );

    assert_eq!(
        module.call("sum", &[Value::Int(2), Value::Int(3)]).unwrap(),
        Value::Int(5)
    );
    let ids: BTreeSet<String> = sink
        .take()
        .into_iter()
        .map(|p| p.breakpoint_id.to_string())
        .collect();
    assert_eq!(ids, BTreeSet::from(["a".into(), "b".into(), "c".into()]));
}

#[test]
fn test_loop_location_fires_each_iteration() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app/calc.lb", CALC).unwrap();
    let sink = MemorySink::new();
    let debugger = debugger(&modules, StaticSource::new(vec![]), sink.clone());

    debugger.apply(&[bp("a", "calc.lb", 9), bp("b", "calc.lb", 15)]);
    assert_eq!(module.call("fact", &[Value::Int(4)]).unwrap(), Value::Int(24));
    let payloads = sink.take();
    assert_eq!(payloads.len(), 3);
    assert_eq!(payloads[0].locals["result"], serde_json::json!(1));
    assert_eq!(payloads[2].locals["n"], serde_json::json!(2));

    assert_eq!(
        module.call("classify", &[Value::Int(0)]).unwrap(),
        Value::from("non-negative")
    );
    assert_eq!(
        module.call("classify", &[Value::Int(-3)]).unwrap(),
        Value::from("negative")
    );
    assert_eq!(sink.take().len(), 1);
}

#[test]
fn test_unresolvable_locations() {
    let modules = ModuleRegistry::new();
    modules.load("app/calc.lb", CALC).unwrap();
    let debugger = debugger(&modules, StaticSource::new(vec![]), MemorySink::new());

    struct TestCase {
        breakpoint: livebreak::debugger::Breakpoint,
        kind: ErrorKind,
    }
    let test_cases = vec![
        TestCase {
            breakpoint: bp("missing-module", "other.lb", 3),
            kind: ErrorKind::LocationNotFound,
        },
        TestCase {
            breakpoint: bp("module-level", "calc.lb", 1),
            kind: ErrorKind::LocationNotFound,
        },
        TestCase {
            breakpoint: bp("blank-line", "calc.lb", 5),
            kind: ErrorKind::LocationNotFound,
        },
        TestCase {
            breakpoint: bp("else-line", "calc.lb", 16),
            kind: ErrorKind::PatchFailure,
        },
    ];

    for tc in test_cases {
        let report = debugger.apply(&[tc.breakpoint]);
        assert!(report.added.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, tc.kind);
    }
}

#[test]
fn test_fetch_failure_keeps_patches() {
    let modules = ModuleRegistry::new();
    let module = modules.load("app/calc.lb", CALC).unwrap();
    let source = StaticSource::new(vec![bp("a", "calc.lb", 3)]);
    let debugger = debugger(&modules, source.clone(), MemorySink::new());

    debugger.refresh().unwrap();
    let sum = module.function("sum").unwrap();
    assert_eq!(debugger.instrumented_lines(sum), vec![3]);

    source.set_failing(true);
    source.set(vec![]);
    let err = debugger.refresh().unwrap_err();
    assert!(matches!(err, Error::Fetch(_)));
    assert_eq!(err.kind(), ErrorKind::Collaborator);
    assert_eq!(debugger.instrumented_lines(sum), vec![3]);

    source.set_failing(false);
    debugger.refresh().unwrap();
    assert!(debugger.instrumented_lines(sum).is_empty());
    assert_eq!(source.fetches(), 3);
}
