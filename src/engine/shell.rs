use super::{Capabilities, CellOutput, CellStatus, Engine, EngineError};
use crate::protocol::StreamKind;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

const ASK_PREFIX: &str = "::ask::";
const NOTICE_PREFIX: &str = "::notice::";
pub const SESSION_DIR_ENV: &str = "CELLSTREAM_SESSION_DIR";

enum Event {
    Line(StreamKind, String),
    Closed,
}

/// Runs each cell with `sh -c` inside a working directory shared by the whole session.
///
/// Running code talks back through stdout control lines: `::ask::<prompt>` sends an ask and
/// the answer is written verbatim to the cell's stdin followed by a newline; `::notice::<message>`
/// sends a notice. An answer containing newlines arrives as several lines, so a cell expecting
/// one must call `read` once per line.
pub struct ShellEngine {
    shell: String,
    timeout: Duration,
    workdir: tempfile::TempDir,
}

impl ShellEngine {
    pub fn new(shell: &str, timeout: Duration) -> Result<Self, EngineError> {
        let workdir = tempfile::Builder::new()
            .prefix("cellstream-")
            .tempdir()
            .map_err(|e| EngineError::Setup(format!("Failed to create session directory: {}", e)))?;
        Ok(Self {
            shell: shell.to_string(),
            timeout,
            workdir,
        })
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    kind: StreamKind,
    tx: mpsc::Sender<Event>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(Event::Line(kind, line)).is_err() {
                        break;
                    }
                }
            }
        }
        let _ = tx.send(Event::Closed);
    })
}

fn answer_ask(
    prompt: &str,
    stdin: &mut Option<ChildStdin>,
    out: &mut dyn CellOutput,
    caps: &dyn Capabilities,
) {
    match caps.ask(prompt) {
        Ok(answer) => {
            let delivered = stdin.as_mut().map(|w| {
                w.write_all(answer.as_bytes())
                    .and_then(|_| w.write_all(b"\n"))
                    .and_then(|_| w.flush())
            });
            if let Some(Err(e)) = delivered {
                tracing::debug!(error = %e, "cell stopped reading stdin before its answer arrived");
                *stdin = None;
            }
        }
        Err(e) => {
            out.write(StreamKind::Stderr, &format!("ask failed: {}\n", e));
            // EOF lets a blocked `read` return instead of hanging.
            *stdin = None;
        }
    }
}

impl Engine for ShellEngine {
    fn name(&self) -> &str {
        "shell"
    }

    fn run_cell(
        &self,
        code: &str,
        out: &mut dyn CellOutput,
        caps: &dyn Capabilities,
    ) -> Result<CellStatus, EngineError> {
        let mut child = Command::new(&self.shell)
            .args(["-c", code])
            .current_dir(self.workdir.path())
            .env(SESSION_DIR_ENV, self.workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError::Invocation(format!("Failed to spawn '{}': {}", self.shell, e))
            })?;

        let mut stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Invocation("Failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Invocation("Failed to capture stderr".to_string()))?;

        let (tx, rx) = mpsc::channel();
        let readers = [
            spawn_reader(stdout, StreamKind::Stdout, tx.clone()),
            spawn_reader(stderr, StreamKind::Stderr, tx),
        ];

        let mut deadline = Instant::now() + self.timeout;
        let mut open_streams = readers.len();
        let mut timed_out = false;

        while open_streams > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(Event::Line(StreamKind::Stdout, line)) => {
                    let body = line.trim_end_matches(['\n', '\r']);
                    if let Some(prompt) = body.strip_prefix(ASK_PREFIX) {
                        let asked_at = Instant::now();
                        answer_ask(prompt, &mut stdin, out, caps);
                        // Waiting on the client does not count against the cell.
                        deadline += asked_at.elapsed();
                    } else if let Some(message) = body.strip_prefix(NOTICE_PREFIX) {
                        caps.notice(message);
                    } else {
                        out.write(StreamKind::Stdout, &line);
                    }
                }
                Ok(Event::Line(StreamKind::Stderr, line)) => out.write(StreamKind::Stderr, &line),
                Ok(Event::Closed) => open_streams -= 1,
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(stdin);

        let status = if timed_out {
            None
        } else {
            let remaining = deadline.saturating_duration_since(Instant::now());
            child
                .wait_timeout(remaining)
                .map_err(|e| EngineError::Invocation(format!("Failed to wait for cell: {}", e)))?
        };

        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            for reader in readers {
                let _ = reader.join();
            }
            // Drain anything the readers flushed before the kill.
            for event in rx.try_iter() {
                if let Event::Line(kind, line) = event {
                    out.write(kind, &line);
                }
            }
            out.write(
                StreamKind::Stderr,
                &format!("cell timed out after {} seconds\n", self.timeout.as_secs()),
            );
            return Ok(CellStatus::failed());
        };

        for reader in readers {
            let _ = reader.join();
        }

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            tracing::debug!(exit_code, "shell cell exited with failure");
        }
        Ok(CellStatus {
            success: status.success(),
        })
    }
}
