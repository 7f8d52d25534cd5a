#![allow(dead_code)]

use cellstream::config::SessionConfig;
use cellstream::engine::script::ScriptEngine;
use cellstream::engine::Engine;
use cellstream::protocol::{read_frame, write_frame, ClientMessage, ServerMessage};
use cellstream::session::Session;
use std::io::BufReader;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A session served over an in-process socket pair, driven from the client end.
pub struct Harness {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    server: JoinHandle<()>,
}

impl Harness {
    pub fn start() -> Self {
        Self::with_engine(Arc::new(ScriptEngine::new()))
    }

    pub fn with_engine(engine: Arc<dyn Engine>) -> Self {
        let (server_end, client_end) = UnixStream::pair().unwrap();
        let server_reader = BufReader::new(server_end.try_clone().unwrap());
        let server = thread::spawn(move || {
            Session::new(engine, &SessionConfig::default()).run(server_reader, server_end);
        });

        client_end
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Self {
            reader: BufReader::new(client_end.try_clone().unwrap()),
            writer: client_end,
            server,
        }
    }

    pub fn send(&mut self, msg: ClientMessage) {
        write_frame(&mut self.writer, &msg).unwrap();
    }

    pub fn run(&mut self, code: &str) {
        self.send(ClientMessage::Run {
            code: code.to_string(),
        });
    }

    pub fn answer(&mut self, id: &str, value: &str) {
        self.send(ClientMessage::Answer {
            id: id.to_string(),
            value: value.to_string(),
        });
    }

    pub fn recv(&mut self) -> ServerMessage {
        read_frame::<ServerMessage, _>(&mut self.reader)
            .unwrap()
            .expect("session ended unexpectedly")
    }

    /// Receive until a result arrives, returning everything seen including the result.
    pub fn recv_through_result(&mut self) -> Vec<ServerMessage> {
        let mut seen = Vec::new();
        loop {
            let msg = self.recv();
            let done = matches!(msg, ServerMessage::Result { .. });
            seen.push(msg);
            if done {
                return seen;
            }
        }
    }

    /// Stop sending, collect whatever the session still delivers, and wait for it to end.
    pub fn finish(mut self) -> Vec<ServerMessage> {
        self.writer.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        while let Some(msg) = read_frame::<ServerMessage, _>(&mut self.reader).unwrap() {
            rest.push(msg);
        }
        self.server.join().unwrap();
        rest
    }
}

pub fn result_stdout(msg: &ServerMessage) -> &str {
    match msg {
        ServerMessage::Result { stdout, .. } => stdout,
        other => panic!("expected result, got {:?}", other),
    }
}
