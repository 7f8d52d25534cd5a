use crate::protocol::{
    read_frame, write_frame, ClientMessage, ProtocolError, ServerMessage, StreamKind,
};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

/// Callbacks the client runs for messages a cell sends while it executes.
pub trait Delegate {
    /// Answer an ask from running code. An `Err` is sent back as the answer text
    /// `"Error: <message>"` so the cell is never left waiting.
    fn ask(&mut self, prompt: &str) -> Result<String, String>;

    fn notice(&mut self, message: &str) {
        tracing::info!(notice = message, "notice from sandbox");
    }

    fn on_output(&mut self, text: &str, stream: StreamKind) {
        tracing::debug!(text, ?stream, "sandbox output");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellResult {
    pub output: String,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to '{addr}': {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("stream ended without a result")]
    StreamEnded,
}

/// Client side of a session: runs cells one at a time and services their asks.
pub struct SandboxClient {
    reader: Box<dyn BufRead + Send>,
    writer: Box<dyn Write + Send>,
}

impl SandboxClient {
    pub fn connect(addr: &str) -> Result<Self, ClientError> {
        let connect_err = |source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = TcpStream::connect(addr).map_err(connect_err)?;
        let reader = stream.try_clone().map_err(connect_err)?;
        Ok(Self::from_parts(BufReader::new(reader), stream))
    }

    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        write_frame(&mut self.writer, msg)?;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Cancel)
    }

    /// Submit a cell and service its output, asks and notices until its result arrives.
    pub fn run_cell(
        &mut self,
        code: &str,
        delegate: &mut dyn Delegate,
    ) -> Result<CellResult, ClientError> {
        self.send(&ClientMessage::Run {
            code: code.to_string(),
        })?;

        loop {
            let msg = match read_frame::<ServerMessage, _>(&mut self.reader) {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(ClientError::StreamEnded),
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, "skipping malformed frame from server");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match msg {
                ServerMessage::Output { text, stream } => delegate.on_output(&text, stream),
                ServerMessage::Ask { id, prompt } => {
                    let value = delegate
                        .ask(&prompt)
                        .unwrap_or_else(|e| format!("Error: {}", e));
                    self.send(&ClientMessage::Answer { id, value })?;
                }
                ServerMessage::Notice { message } => delegate.notice(&message),
                ServerMessage::Result {
                    output,
                    stdout,
                    stderr,
                    success,
                } => {
                    return Ok(CellResult {
                        output,
                        stdout,
                        stderr,
                        success,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Answers {
        prompts: Vec<String>,
        notices: Vec<String>,
        fail: bool,
    }

    impl Delegate for Answers {
        fn ask(&mut self, prompt: &str) -> Result<String, String> {
            self.prompts.push(prompt.to_string());
            if self.fail {
                Err("model unavailable".to_string())
            } else {
                Ok("Ada".to_string())
            }
        }

        fn notice(&mut self, message: &str) {
            self.notices.push(message.to_string());
        }
    }

    fn sent(buf: &SharedBuf) -> Vec<ClientMessage> {
        let bytes = buf.0.lock().unwrap().clone();
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        while let Some(msg) = read_frame::<ClientMessage, _>(&mut cursor).unwrap() {
            out.push(msg);
        }
        out
    }

    const SCRIPTED_SERVER: &str = concat!(
        "{\"type\":\"output\",\"text\":\"thinking\\n\",\"stream\":\"stdout\"}\n",
        "{\"type\":\"notice\",\"message\":\"hi\"}\n",
        "{\"type\":\"ask\",\"id\":\"id-1\",\"prompt\":\"name?\"}\n",
        "not json\n",
        "{\"type\":\"result\",\"output\":\"Ada\\n\",\"stdout\":\"Ada\\n\",\"stderr\":\"\",\"success\":true}\n",
    );

    #[test]
    fn test_run_cell_services_asks_and_notices() {
        let written = SharedBuf::default();
        let mut client = SandboxClient::from_parts(
            Cursor::new(SCRIPTED_SERVER.as_bytes().to_vec()),
            written.clone(),
        );
        let mut delegate = Answers::default();

        let result = client.run_cell("code", &mut delegate).unwrap();
        assert_eq!(result.stdout, "Ada\n");
        assert!(result.success);
        assert_eq!(delegate.prompts, vec!["name?".to_string()]);
        assert_eq!(delegate.notices, vec!["hi".to_string()]);

        assert_eq!(
            sent(&written),
            vec![
                ClientMessage::Run {
                    code: "code".to_string()
                },
                ClientMessage::Answer {
                    id: "id-1".to_string(),
                    value: "Ada".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_delegate_error_is_sent_as_answer() {
        let written = SharedBuf::default();
        let mut client = SandboxClient::from_parts(
            Cursor::new(SCRIPTED_SERVER.as_bytes().to_vec()),
            written.clone(),
        );
        let mut delegate = Answers {
            fail: true,
            ..Answers::default()
        };
        client.run_cell("code", &mut delegate).unwrap();

        let answers: Vec<ClientMessage> = sent(&written)
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::Answer { .. }))
            .collect();
        assert_eq!(
            answers,
            vec![ClientMessage::Answer {
                id: "id-1".to_string(),
                value: "Error: model unavailable".to_string()
            }]
        );
    }

    #[test]
    fn test_stream_ended_without_result() {
        let mut client =
            SandboxClient::from_parts(Cursor::new(Vec::new()), SharedBuf::default());
        let err = client
            .run_cell("code", &mut Answers::default())
            .unwrap_err();
        assert!(matches!(err, ClientError::StreamEnded));
    }

    #[test]
    fn test_connect_refused() {
        // Port 1 on localhost is essentially never listening.
        let err = SandboxClient::connect("127.0.0.1:1").err().unwrap();
        assert!(err.to_string().contains("127.0.0.1:1"));
    }

    #[test]
    fn test_cancel_sends_cancel_frame() {
        let written = SharedBuf::default();
        let mut client = SandboxClient::from_parts(Cursor::new(Vec::new()), written.clone());
        client.cancel().unwrap();
        assert_eq!(sent(&written), vec![ClientMessage::Cancel]);
    }
}
