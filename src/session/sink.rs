use crate::engine::CellOutput;
use crate::protocol::{ServerMessage, StreamKind};
use std::sync::mpsc::Sender;

/// Funnel onto the session's single outbound channel.
///
/// The channel is unbounded, so `emit` never blocks. Once the drain side has gone away
/// messages are discarded.
#[derive(Clone)]
pub struct OutputSink {
    tx: Sender<ServerMessage>,
}

impl OutputSink {
    pub fn new(tx: Sender<ServerMessage>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, msg: ServerMessage) {
        if self.tx.send(msg).is_err() {
            tracing::trace!("outbound channel closed, discarding message");
        }
    }

    pub fn notice(&self, message: &str) {
        self.emit(ServerMessage::Notice {
            message: message.to_string(),
        });
    }
}

/// Tees one execution's output: each fragment is streamed live through the sink and
/// appended to the per-stream buffers used for the final result message.
pub struct CellCapture {
    sink: OutputSink,
    stdout: String,
    stderr: String,
}

impl CellCapture {
    pub fn new(sink: OutputSink) -> Self {
        Self {
            sink,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Consume the capture and emit the single result message for this execution.
    pub fn finish(self, success: bool) {
        let output = format!("{}{}", self.stdout, self.stderr);
        self.sink.emit(ServerMessage::Result {
            output,
            stdout: self.stdout,
            stderr: self.stderr,
            success,
        });
    }
}

impl CellOutput for CellCapture {
    fn write(&mut self, stream: StreamKind, text: &str) {
        if text.is_empty() {
            return;
        }
        self.sink.emit(ServerMessage::output(text, stream));
        match stream {
            StreamKind::Stdout => self.stdout.push_str(text),
            StreamKind::Stderr => self.stderr.push_str(text),
        }
    }
}
