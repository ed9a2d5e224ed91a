//! Ready-made tasks for pipeline tests.

use crate::task::{Task, TaskFn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Error raised by [`fail_on_nth`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("value error on item {item}: {value}")]
pub struct ValueError {
    /// 1-based position of the failing call.
    pub item: usize,
    /// The input that was rejected.
    pub value: Value,
}

fn number(value: &Value) -> anyhow::Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| anyhow::anyhow!("expected an integer, got {value}"))
}

fn build(builder: crate::task::TaskBuilder) -> Task {
    // Fixture options are fixed and valid.
    match builder.build() {
        Ok(task) => task,
        Err(err) => panic!("invalid fixture task: {err}"),
    }
}

/// Source task yielding every element of an array input, or the input
/// itself if it is not an array.
#[must_use]
pub fn emit_each() -> Task {
    build(
        Task::builder(TaskFn::generator(|input| match input {
            Value::Array(items) => items.into_iter().map(Ok).collect::<Vec<_>>(),
            other => vec![Ok(other)],
        }))
        .name("emit_each")
        .branch(true),
    )
}

/// Source task yielding the integers `0..n`, ignoring its input.
#[must_use]
pub fn range_source(n: i64) -> Task {
    build(
        Task::builder(TaskFn::generator(move |_| (0..n).map(|i| Ok(json!(i)))))
            .name("range")
            .branch(true),
    )
}

/// Doubles an integer input.
#[must_use]
pub fn doubler(concurrency: i64) -> Task {
    build(
        Task::builder(TaskFn::sync(|input| Ok(json!(number(&input)? * 2))))
            .name("doubler")
            .concurrency(concurrency),
    )
}

/// Async flavour of [`doubler`].
#[must_use]
pub fn async_doubler(concurrency: i64) -> Task {
    build(
        Task::builder(TaskFn::asynchronous(|input| async move {
            tokio::task::yield_now().await;
            number(&input).map(|n| json!(n * 2))
        }))
        .name("async_doubler")
        .concurrency(concurrency),
    )
}

/// Yields `[x, "a"]` and `[x, "b"]` for every input `x`.
#[must_use]
pub fn pairs(concurrency: i64) -> Task {
    build(
        Task::builder(TaskFn::generator(|input: Value| {
            vec![Ok(json!([input.clone(), "a"])), Ok(json!([input, "b"]))]
        }))
        .name("pairs")
        .branch(true)
        .concurrency(concurrency),
    )
}

/// Passes inputs through, failing with [`ValueError`] on the `n`-th call
/// counted across all of its workers.
#[must_use]
pub fn fail_on_nth(n: usize, concurrency: i64) -> Task {
    let calls = Arc::new(AtomicUsize::new(0));
    build(
        Task::builder(TaskFn::sync(move |input| {
            let item = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if item == n {
                return Err(ValueError { item, value: input }.into());
            }
            Ok(input)
        }))
        .name("fail_on_nth")
        .concurrency(concurrency),
    )
}

/// Passes inputs through after sleeping for `delay`.
#[must_use]
pub fn slow_identity(delay: Duration, concurrency: i64) -> Task {
    build(
        Task::builder(TaskFn::sync(move |input| {
            thread::sleep(delay);
            Ok(input)
        }))
        .name("slow_identity")
        .concurrency(concurrency),
    )
}

/// Joins its whole input stream and sums it.
#[must_use]
pub fn summer() -> Task {
    build(
        Task::builder(TaskFn::sync(|input| {
            let items = input.as_array().cloned().unwrap_or_default();
            let total = items.iter().map(number).sum::<anyhow::Result<i64>>()?;
            Ok(json!(total))
        }))
        .name("summer")
        .join(true),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(task: &Task, input: Value) -> anyhow::Result<Value> {
        match task.func() {
            TaskFn::Sync(func) => func(input),
            other => panic!("expected a sync task, got {other:?}"),
        }
    }

    #[test]
    fn test_fail_on_nth_counts_calls() {
        let task = fail_on_nth(2, 1);
        assert_eq!(call(&task, json!(1)).unwrap(), json!(1));
        let err = call(&task, json!(2)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ValueError>(),
            Some(&ValueError {
                item: 2,
                value: json!(2)
            })
        );
        assert_eq!(call(&task, json!(3)).unwrap(), json!(3));
    }

    #[test]
    fn test_summer_rejects_non_numbers() {
        assert_eq!(call(&summer(), json!([1, 2, 3])).unwrap(), json!(6));
        assert!(call(&summer(), json!([1, "x"])).is_err());
    }

    #[test]
    fn test_async_doubler_doubles() {
        let TaskFn::Async(func) = async_doubler(1).func().clone() else {
            panic!("expected an async task");
        };
        assert_eq!(tokio_test::block_on(func(json!(21))).unwrap(), json!(42));
        assert!(tokio_test::block_on(func(json!("x"))).is_err());
    }

    #[test]
    fn test_emit_each_accepts_scalars() {
        let TaskFn::Generator(func) = emit_each().func().clone() else {
            panic!("expected a generator");
        };
        let items: Vec<Value> = func(json!(7)).map(Result::unwrap).collect();
        assert_eq!(items, vec![json!(7)]);
    }
}
