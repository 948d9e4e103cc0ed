//! Tool dispatch for one model response: batching, timeouts, cancellation
//! and listener notification.

use std::{sync::Arc, time::Duration};

use coda_ai::ToolCall;
use coda_core::{CancellationToken, CodaError, CodaResult};
use coda_tools::{ToolContext, ToolRegistry};
use serde_json::Value;

use crate::{tool_listener::notify_listener, ToolExecutionListener};

/// Result of one tool call, paired with the call that produced it.
pub(crate) struct ToolCallResult {
    pub(crate) call: ToolCall,
    pub(crate) result: CodaResult<Value>,
}

/// Calls grouped for execution. Consecutive independent calls share a batch
/// and run concurrently; every other call runs alone.
pub(crate) fn partition_tool_calls(
    registry: &ToolRegistry,
    calls: &[ToolCall],
    max_parallel: usize,
) -> Vec<Vec<ToolCall>> {
    let max_parallel = max_parallel.max(1);
    let mut batches: Vec<Vec<ToolCall>> = Vec::new();
    let mut independent_run: Vec<ToolCall> = Vec::new();

    for call in calls {
        let independent = registry
            .lookup(&call.name)
            .map(|entry| entry.is_independent())
            .unwrap_or(false);
        if independent {
            independent_run.push(call.clone());
            continue;
        }
        flush_independent_run(&mut batches, &mut independent_run, max_parallel);
        batches.push(vec![call.clone()]);
    }
    flush_independent_run(&mut batches, &mut independent_run, max_parallel);
    batches
}

fn flush_independent_run(
    batches: &mut Vec<Vec<ToolCall>>,
    run: &mut Vec<ToolCall>,
    max_parallel: usize,
) {
    if run.is_empty() {
        return;
    }
    batches.extend(run.chunks(max_parallel).map(<[ToolCall]>::to_vec));
    run.clear();
}

#[derive(Clone)]
pub(crate) struct ToolDispatch {
    pub(crate) registry: Arc<ToolRegistry>,
    pub(crate) listener: Arc<dyn ToolExecutionListener>,
    pub(crate) working_dir: std::path::PathBuf,
    pub(crate) tool_timeout: Option<Duration>,
    pub(crate) max_parallel: usize,
}

impl ToolDispatch {
    /// Executes `calls` and returns one result per call in issue order.
    ///
    /// Once `cancellation` fires, in-flight calls resolve to `Cancelled` and
    /// calls that have not started are reported as `Cancelled` without being
    /// invoked.
    pub(crate) async fn execute(
        &self,
        calls: &[ToolCall],
        cancellation: &CancellationToken,
    ) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(calls.len());
        for batch in partition_tool_calls(&self.registry, calls, self.max_parallel) {
            if cancellation.is_cancelled() {
                results.extend(batch.into_iter().map(|call| ToolCallResult {
                    result: Err(cancelled_before_start(&call)),
                    call,
                }));
                continue;
            }

            let handles: Vec<_> = batch
                .into_iter()
                .map(|call| {
                    let dispatch = self.clone();
                    let token = cancellation.clone();
                    let task_call = call.clone();
                    let handle =
                        tokio::spawn(async move { dispatch.invoke_one(task_call, token).await });
                    (call, handle)
                })
                .collect();

            for (call, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(error) => Err(CodaError::internal(format!(
                        "tool '{}' execution task failed: {error}",
                        call.name
                    ))
                    .with_context("tool", &call.name)),
                };
                results.push(ToolCallResult { call, result });
            }
        }
        results
    }

    async fn invoke_one(&self, call: ToolCall, cancellation: CancellationToken) -> CodaResult<Value> {
        let listener = Arc::clone(&self.listener);
        notify_listener(|| listener.on_start(&call.id, &call.name, &call.arguments));

        let progress_listener = Arc::clone(&self.listener);
        let progress_call_id = call.id.clone();
        let progress_tool = call.name.clone();
        let context = ToolContext::new(self.working_dir.clone())
            .with_cancellation(cancellation.clone())
            .with_progress(Arc::new(move |info: Value| {
                notify_listener(|| {
                    progress_listener.on_progress(&progress_call_id, &progress_tool, &info)
                });
            }));

        let invocation = self
            .registry
            .invoke(&call.name, call.arguments.clone(), context);
        let bounded = async {
            match self.tool_timeout {
                Some(limit) => tokio::time::timeout(limit, invocation).await.unwrap_or_else(|_| {
                    Err(CodaError::timeout("tool")
                        .with_context("tool", &call.name)
                        .with_context("timeout_ms", limit.as_millis()))
                }),
                None => invocation.await,
            }
        };
        let result = tokio::select! {
            _ = cancellation.cancelled() => {
                Err(CodaError::cancelled("tool").with_context("tool", &call.name))
            }
            result = bounded => result,
        };

        tracing::debug!(
            call_id = %call.id,
            tool = %call.name,
            ok = result.is_ok(),
            "tool call finished"
        );
        notify_listener(|| listener.on_complete(&call.id, &call.name, result.as_ref()));
        result
    }
}

fn cancelled_before_start(call: &ToolCall) -> CodaError {
    CodaError::cancelled("tool")
        .with_context("tool", &call.name)
        .with_suggestion("the turn was cancelled before this tool call started")
}
