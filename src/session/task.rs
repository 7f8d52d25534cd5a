use super::correlation::{AskError, CorrelationTable};
use super::sink::{CellCapture, OutputSink};
use crate::engine::{Capabilities, CellOutput, EngineError, SharedExecutionContext};
use crate::protocol::{ServerMessage, StreamKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

/// What an execution needs from its session.
#[derive(Clone)]
pub struct SessionHandle {
    pub context: SharedExecutionContext,
    pub sink: OutputSink,
    pub table: Arc<CorrelationTable>,
    pub span: tracing::Span,
}

/// The ask/notice capabilities handed to one running cell.
struct TaskCapabilities<'a> {
    sink: &'a OutputSink,
    table: &'a CorrelationTable,
}

impl Capabilities for TaskCapabilities<'_> {
    fn ask(&self, prompt: &str) -> Result<String, AskError> {
        let id = self.table.register()?;
        self.sink.emit(ServerMessage::Ask {
            id: id.clone(),
            prompt: prompt.to_string(),
        });
        self.table.await_answer(&id)
    }

    fn notice(&self, message: &str) {
        self.sink.notice(message);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one cell to completion and emit exactly one result message for it.
pub fn run(handle: &SessionHandle, code: &str) {
    let mut capture = CellCapture::new(handle.sink.clone());
    let caps = TaskCapabilities {
        sink: &handle.sink,
        table: &handle.table,
    };
    let engine = handle.context.engine();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.run_cell(code, &mut capture, &caps)
    }));

    // Only the engine's own status is trusted. When the engine itself failed there is no
    // status to trust, so the cell is still reported as a success.
    let success = match outcome {
        Ok(Ok(status)) => status.success,
        Ok(Err(e)) => {
            tracing::warn!(engine = engine.name(), error = %e, "engine invocation failed");
            capture.write(StreamKind::Stderr, &format!("{}\n", e));
            true
        }
        Err(payload) => {
            let e = EngineError::Panicked(panic_message(payload.as_ref()));
            tracing::warn!(engine = engine.name(), error = %e, "engine panicked");
            capture.write(StreamKind::Stderr, &format!("{}\n", e));
            true
        }
    };

    capture.finish(success);
}

/// Start a cell on its own thread. The caller does not wait for it.
pub fn spawn(handle: SessionHandle, code: String, cell: u64) {
    let fallback = handle.sink.clone();
    let spawned = thread::Builder::new()
        .name(format!("cell-{}", cell))
        .spawn(move || {
            let _guard = handle.span.enter();
            tracing::debug!(cell, "cell started");
            run(&handle, &code);
            tracing::debug!(cell, "cell finished");
        });

    if let Err(e) = spawned {
        tracing::error!(cell, error = %e, "failed to spawn cell thread");
        let mut capture = CellCapture::new(fallback);
        capture.write(
            StreamKind::Stderr,
            &format!("failed to start execution: {}\n", e),
        );
        capture.finish(false);
    }
}
