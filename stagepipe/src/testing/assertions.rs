//! Assertions for pipeline results.

use crate::errors::StagepipeError;
use serde_json::Value;
use std::fmt::Debug;

fn sorted(values: &[Value]) -> Vec<String> {
    let mut keys: Vec<String> = values.iter().map(Value::to_string).collect();
    keys.sort();
    keys
}

/// Asserts that two collections hold the same items, ignoring order.
pub fn assert_same_items(actual: &[Value], expected: &[Value]) {
    assert_eq!(
        sorted(actual),
        sorted(expected),
        "Expected the multiset {expected:?}, got {actual:?}"
    );
}

/// Asserts that a run ended with a worker fault whose source is `E`, and
/// returns that source.
pub fn assert_worker_fault<E>(err: &StagepipeError) -> &E
where
    E: std::error::Error + Send + Sync + 'static,
{
    let Some(fault) = err.as_worker_fault() else {
        panic!("Expected a worker fault, got: {err}");
    };
    match fault.downcast_ref::<E>() {
        Some(source) => source,
        None => panic!(
            "Expected a fault caused by {}, got: {fault}",
            std::any::type_name::<E>()
        ),
    }
}

/// Asserts that a run succeeded and returns its outputs.
pub fn assert_run_ok<T: Debug>(result: Result<T, StagepipeError>) -> T {
    match result {
        Ok(outputs) => outputs,
        Err(err) => panic!("Expected the run to succeed, got: {err}"),
    }
}
