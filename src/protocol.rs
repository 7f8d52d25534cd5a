use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

/// Which standard stream an output fragment was written to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Client to server messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Run { code: String },
    Answer { id: String, value: String },
    Cancel,
}

/// Server to client messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ask {
        id: String,
        prompt: String,
    },
    Notice {
        message: String,
    },
    Output {
        text: String,
        stream: StreamKind,
    },
    Result {
        output: String,
        stdout: String,
        stderr: String,
        success: bool,
    },
}

impl ServerMessage {
    pub fn output(text: &str, stream: StreamKind) -> Self {
        ServerMessage::Output {
            text: text.to_string(),
            stream,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ProtocolError {
    /// A malformed frame only spoils one line; the stream itself is still usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Malformed(_))
    }
}

/// Read the next newline-delimited JSON frame. Returns `Ok(None)` on EOF.
pub fn read_frame<T, R>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    T: DeserializeOwned,
    R: BufRead + ?Sized,
{
    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            return Ok(None);
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        return serde_json::from_str(line)
            .map(Some)
            .map_err(|e| ProtocolError::Malformed(format!("{}: {}", e, truncate(line, 120))));
    }
}

/// Write one frame followed by a newline and flush.
pub fn write_frame<T, W>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: Write + ?Sized,
{
    let mut json_str = serde_json::to_string(msg).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    json_str.push('\n');
    writer.write_all(json_str.as_bytes())?;
    writer.flush()?;
    Ok(())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_client_message_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "answer", "id": "abc", "value": "Ada"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Answer {
                id: "abc".to_string(),
                value: "Ada".to_string()
            }
        );

        let msg: ClientMessage = serde_json::from_value(json!({"type": "cancel"})).unwrap();
        assert_eq!(msg, ClientMessage::Cancel);
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ServerMessage::output("hi\n", StreamKind::Stderr);
        let parsed: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(parsed["type"], "output");
        assert_eq!(parsed["text"], "hi\n");
        assert_eq!(parsed["stream"], "stderr");

        let msg = ServerMessage::Result {
            output: "a".to_string(),
            stdout: "a".to_string(),
            stderr: String::new(),
            success: true,
        };
        let parsed: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(parsed["type"], "result");
        assert_eq!(parsed["success"], true);
    }

    #[test]
    fn test_read_frame_skips_blank_lines() {
        let mut input = Cursor::new("\n\n{\"type\":\"run\",\"code\":\"1\"}\n");
        let msg: Option<ClientMessage> = read_frame(&mut input).unwrap();
        assert_eq!(
            msg,
            Some(ClientMessage::Run {
                code: "1".to_string()
            })
        );
        let msg: Option<ClientMessage> = read_frame(&mut input).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn test_read_frame_unknown_kind_is_malformed() {
        let mut input = Cursor::new("{\"type\":\"reboot\"}\n{\"type\":\"cancel\"}\n");
        let err = read_frame::<ClientMessage, _>(&mut input).unwrap_err();
        assert!(err.is_recoverable());
        // The stream is still usable after a bad line.
        let msg: Option<ClientMessage> = read_frame(&mut input).unwrap();
        assert_eq!(msg, Some(ClientMessage::Cancel));
    }

    #[test]
    fn test_read_frame_not_json() {
        let mut input = Cursor::new("this is not json\n");
        let err = read_frame::<ClientMessage, _>(&mut input).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_write_frame_appends_newline() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &ServerMessage::Notice {
                message: "hi".to_string(),
            },
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);
    }

    #[test]
    fn test_write_then_read_multiline_text() {
        let mut buf = Vec::new();
        let msg = ServerMessage::output("line1\nline2\n", StreamKind::Stdout);
        write_frame(&mut buf, &msg).unwrap();
        let read: Option<ServerMessage> = read_frame(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, Some(msg));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
