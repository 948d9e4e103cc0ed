//! Observer hooks notified around every tool invocation.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use coda_core::CodaError;
use serde_json::Value;

/// Trait contract for `ToolExecutionListener` behavior.
///
/// Every method defaults to a no-op. Listeners observe execution only; the
/// loop ignores anything they do, including panics.
pub trait ToolExecutionListener: Send + Sync {
    fn on_start(&self, _call_id: &str, _tool_name: &str, _arguments: &Value) {}

    fn on_progress(&self, _call_id: &str, _tool_name: &str, _info: &Value) {}

    fn on_complete(&self, _call_id: &str, _tool_name: &str, _result: Result<&Value, &CodaError>) {}
}

#[derive(Debug, Clone, Copy, Default)]
/// Listener used when nothing is attached.
pub struct NoopToolListener;

impl ToolExecutionListener for NoopToolListener {}

#[derive(Debug, Clone, Copy, Default)]
/// Emits one `tracing` event per listener callback.
pub struct TracingToolListener;

impl ToolExecutionListener for TracingToolListener {
    fn on_start(&self, call_id: &str, tool_name: &str, arguments: &Value) {
        tracing::info!(call_id, tool = tool_name, %arguments, "tool started");
    }

    fn on_progress(&self, call_id: &str, tool_name: &str, info: &Value) {
        tracing::debug!(call_id, tool = tool_name, %info, "tool progress");
    }

    fn on_complete(&self, call_id: &str, tool_name: &str, result: Result<&Value, &CodaError>) {
        match result {
            Ok(_) => tracing::info!(call_id, tool = tool_name, "tool completed"),
            Err(error) => tracing::warn!(
                call_id,
                tool = tool_name,
                code = %error.code(),
                error = %error,
                "tool failed"
            ),
        }
    }
}

#[derive(Clone, Default)]
/// Forwards every callback to each wrapped listener in order.
pub struct ListenerFanout(pub Vec<Arc<dyn ToolExecutionListener>>);

impl ListenerFanout {
    pub fn new(listeners: Vec<Arc<dyn ToolExecutionListener>>) -> Self {
        Self(listeners)
    }

    pub fn push(&mut self, listener: Arc<dyn ToolExecutionListener>) {
        self.0.push(listener);
    }
}

impl std::fmt::Debug for ListenerFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerFanout")
            .field("listeners", &self.0.len())
            .finish()
    }
}

impl ToolExecutionListener for ListenerFanout {
    fn on_start(&self, call_id: &str, tool_name: &str, arguments: &Value) {
        for listener in &self.0 {
            notify_listener(|| listener.on_start(call_id, tool_name, arguments));
        }
    }

    fn on_progress(&self, call_id: &str, tool_name: &str, info: &Value) {
        for listener in &self.0 {
            notify_listener(|| listener.on_progress(call_id, tool_name, info));
        }
    }

    fn on_complete(&self, call_id: &str, tool_name: &str, result: Result<&Value, &CodaError>) {
        for listener in &self.0 {
            notify_listener(|| listener.on_complete(call_id, tool_name, result));
        }
    }
}

/// Runs one listener callback, swallowing a panic.
pub(crate) fn notify_listener(callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        tracing::warn!("tool execution listener panicked; ignoring");
    }
}
