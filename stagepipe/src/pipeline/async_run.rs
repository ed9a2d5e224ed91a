//! Tokio-backed pipeline runs.

use super::PipelineConfig;
use crate::asynchronous::{asynchronize, AsyncProducer, AsyncProducerConsumer, Executors};
use crate::control::{ErrorSink, Scope, ShutdownFlag};
use crate::errors::{StagepipeError, WorkerFault};
use crate::observability::RunStats;
use crate::queue::Message;
use crate::task::Task;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

pub(crate) async fn run(
    tasks: &[Task],
    config: &PipelineConfig,
    input: Value,
) -> Result<Vec<Value>, StagepipeError> {
    let executors = Executors::new(config);
    let tasks: Vec<Task> = tasks.iter().map(|t| asynchronize(t, &executors)).collect();
    let Some((source_task, relay_tasks)) = tasks.split_first() else {
        return Err(StagepipeError::Runtime("pipeline has no tasks".to_string()));
    };

    let scope = Scope::widest(tasks.iter().map(Task::multiprocess));
    let shutdown = ShutdownFlag::new(scope);
    let errors = ErrorSink::new(scope);
    let mut stats = RunStats::new();
    let span = info_span!("pipeline_run", run_id = %stats.run_id(), stages = tasks.len(), backend = "async");

    let source = AsyncProducer::new(
        source_task.clone(),
        relay_tasks.first(),
        errors.clone(),
        shutdown.clone(),
        stats.register(source_task.name()),
    )?;

    let mut workers = JoinSet::new();
    let mut q_in = Arc::clone(source.q_out());
    for (idx, task) in relay_tasks.iter().enumerate() {
        let relay = AsyncProducerConsumer::new(
            q_in,
            task.clone(),
            relay_tasks.get(idx + 1),
            errors.clone(),
            shutdown.clone(),
            stats.register(task.name()),
        );
        q_in = Arc::clone(relay.q_out());
        relay.start(&mut workers);
    }
    source.start(&mut workers, input);

    let terminal_stage = tasks.last().map_or("", |t| t.name()).to_string();
    let output = q_in;

    async move {
        info!(scope = %scope, "Pipeline run started");

        let mut outputs = Vec::new();
        loop {
            match output.get().await {
                Ok(Message::Data(_)) if shutdown.is_set() => {}
                Ok(Message::Data(value)) => outputs.push(value),
                Ok(Message::Stop) => break,
                Err(StagepipeError::Runtime(reason)) => {
                    return Err(StagepipeError::Runtime(reason));
                }
                Err(err) => {
                    shutdown.set(format!("output of stage '{terminal_stage}' unreadable"));
                    errors.push(WorkerFault::new(terminal_stage.clone(), 0, err.into()));
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            joined.map_err(|err| StagepipeError::Runtime(format!("async worker failed: {err}")))?;
        }

        info!(
            elapsed_ms = stats.elapsed_ms(),
            faults = stats.total_faults(),
            "Pipeline run finished"
        );
        match errors.take_first() {
            Some(fault) => {
                warn!(stage = %fault.stage, worker = fault.worker, "Surfacing first fault");
                Err(fault.into())
            }
            None => Ok(outputs),
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{async_doubler, assert_same_items, emit_each};
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_chain_is_rejected() {
        let err = run(&[], &PipelineConfig::default(), Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, StagepipeError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_mixed_tasks_run_together() {
        let outputs = run(
            &[emit_each(), async_doubler(2)],
            &PipelineConfig::default(),
            json!([1, 2, 3]),
        )
        .await
        .unwrap();
        assert_same_items(&outputs, &[json!(2), json!(4), json!(6)]);
    }
}
