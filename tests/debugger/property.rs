use crate::common::{bp, debugger, MemorySink, StaticSource};
use livebreak::runtime::{ModuleRegistry, Value};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

const STRAIGHT: &str = r#"
def a(v):
    x = v
    y = x + 1
    return y

def b(v):
    p = v * 2
    q = p - 1
    return q

def c(v):
    r = v
    return r
"#;

/// Functions of `STRAIGHT` with their lines, every line runs once per call.
const FUNCTIONS: [(&str, &[u32]); 3] = [("a", &[3, 4, 5]), ("b", &[8, 9, 10]), ("c", &[13, 14])];

fn all_lines() -> Vec<u32> {
    FUNCTIONS
        .iter()
        .flat_map(|(_, lines)| lines.iter().copied())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_instrumentation_follows_desired_set(
        sets in prop::collection::vec(
            prop::collection::btree_set((0usize..8, 0usize..3), 0..8),
            1..6,
        )
    ) {
        let modules = ModuleRegistry::new();
        let module = modules.load("straight.lb", STRAIGHT).unwrap();
        let sink = MemorySink::new();
        let debugger = debugger(&modules, StaticSource::new(vec![]), sink.clone());
        let lines = all_lines();
        let originals: Vec<_> = FUNCTIONS
            .iter()
            .map(|(name, _)| module.function(name).unwrap().code())
            .collect();

        for set in sets {
            let desired: Vec<_> = set
                .iter()
                .map(|(line_idx, k)| {
                    let line = lines[*line_idx];
                    bp(&format!("bp-{line}-{k}"), "straight.lb", line)
                })
                .collect();
            let report = debugger.apply(&desired);
            prop_assert!(report.failures.is_empty());

            for ((name, function_lines), original) in FUNCTIONS.iter().zip(&originals) {
                let function = module.function(name).unwrap();
                let expected_lines: BTreeSet<u32> = set
                    .iter()
                    .map(|(line_idx, _)| lines[*line_idx])
                    .filter(|line| function_lines.contains(line))
                    .collect();
                let expected_hits = set
                    .iter()
                    .filter(|(line_idx, _)| function_lines.contains(&lines[*line_idx]))
                    .count();

                prop_assert_eq!(
                    debugger.instrumented_lines(function),
                    expected_lines.iter().copied().collect::<Vec<_>>()
                );
                if expected_lines.is_empty() {
                    prop_assert!(Arc::ptr_eq(&function.code(), original));
                }

                let result = module.call(name, &[Value::Int(3)]).unwrap();
                let unpatched = match *name {
                    "a" => 4,
                    "b" => 5,
                    _ => 3,
                };
                prop_assert_eq!(result, Value::Int(unpatched));
                prop_assert_eq!(sink.take().len(), expected_hits);
            }

            // a repeated tick changes nothing
            prop_assert!(debugger.apply(&desired).is_noop());
        }
    }
}
