//! One duplex stream, one session.
//!
//! The inbound loop reads client frames on its own thread and dispatches them: a run
//! request starts a cell thread, an answer resolves the correlation table. The calling
//! thread drains the outbound channel onto the stream. Every cell and the inbound loop hold
//! a sender, so the drain wakes for each new message and ends on its own once the client has
//! stopped sending and the last cell has finished, or as soon as the peer stops accepting
//! writes.

pub mod correlation;
pub mod sink;
pub mod task;

pub use correlation::{AskError, CorrelationTable};
pub use sink::{CellCapture, OutputSink};
pub use task::SessionHandle;

use crate::config::SessionConfig;
use crate::engine::{Engine, SharedExecutionContext};
use crate::protocol::{read_frame, write_frame, ClientMessage, ServerMessage};
use std::io::{BufRead, Write};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

pub struct Session {
    id: String,
    context: SharedExecutionContext,
    table: Arc<CorrelationTable>,
}

impl Session {
    pub fn new(engine: Arc<dyn Engine>, cfg: &SessionConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context: SharedExecutionContext::new(engine),
            table: Arc::new(CorrelationTable::new(cfg.ask_timeout())),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Serve the session until it ends. Peer disconnects and stream errors are a normal end,
    /// so nothing is returned.
    pub fn run<R, W>(self, reader: R, mut writer: W)
    where
        R: BufRead + Send + 'static,
        W: Write,
    {
        let span = tracing::info_span!("session", id = %self.id);
        let _guard = span.enter();
        tracing::info!(engine = self.context.engine().name(), "session opened");

        let (tx, rx) = mpsc::channel();
        let handle = SessionHandle {
            context: self.context.clone(),
            sink: OutputSink::new(tx),
            table: Arc::clone(&self.table),
            span: span.clone(),
        };

        let spawned = thread::Builder::new()
            .name("session-inbound".to_string())
            .spawn(move || {
                let _guard = handle.span.clone().entered();
                inbound_loop(reader, handle);
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to start inbound loop");
            self.table.close();
            return;
        }

        drain(rx, &mut writer);

        // Nobody can answer anymore; let blocked asks fail instead of hanging.
        self.table.close();
        tracing::info!("session closed");
    }
}

fn inbound_loop<R: BufRead>(mut reader: R, handle: SessionHandle) {
    let mut cells: u64 = 0;
    loop {
        match read_frame::<ClientMessage, _>(&mut reader) {
            Ok(Some(msg)) => dispatch(&handle, msg, &mut cells),
            Ok(None) => {
                tracing::debug!("client closed its side of the stream");
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "ignoring malformed frame");
            }
            Err(e) => {
                tracing::debug!(error = %e, "inbound stream failed");
                break;
            }
        }
    }
    handle.table.close();
}

fn dispatch(handle: &SessionHandle, msg: ClientMessage, cells: &mut u64) {
    match msg {
        ClientMessage::Run { code } => {
            *cells += 1;
            tracing::debug!(cell = *cells, "run requested");
            task::spawn(handle.clone(), code, *cells);
        }
        ClientMessage::Answer { id, value } => {
            tracing::debug!(id = %id, "answer received");
            handle.table.resolve(&id, value);
        }
        ClientMessage::Cancel => {
            tracing::debug!("cancel received; running cells are not interrupted");
        }
    }
}

fn drain<W: Write + ?Sized>(rx: Receiver<ServerMessage>, writer: &mut W) {
    for msg in rx {
        if let Err(e) = write_frame(writer, &msg) {
            tracing::debug!(error = %e, "peer stopped accepting output");
            return;
        }
    }
}
