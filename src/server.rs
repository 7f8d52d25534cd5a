use crate::config::Config;
use crate::engine;
use crate::session::Session;
use std::io::{self, BufReader};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// Accept connections forever. Each connection gets its own thread, session and engine, so
/// one session failing or hanging never touches another.
pub fn serve_tcp(listener: TcpListener, config: Arc<Config>) -> io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "listening");

    for conn in listener.incoming() {
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let config = Arc::clone(&config);
        let name = match stream.peer_addr() {
            Ok(addr) => format!("conn-{}", addr),
            Err(_) => "conn".to_string(),
        };
        let spawned = thread::Builder::new().name(name).spawn(move || {
            if let Err(e) = handle_connection(stream, &config) {
                tracing::warn!(error = %e, "connection ended with an error");
            }
        });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn connection thread");
        }
    }

    Ok(())
}

/// Run one session over an accepted TCP connection.
pub fn handle_connection(stream: TcpStream, config: &Config) -> io::Result<()> {
    let peer = stream.peer_addr().ok();
    let engine = engine::from_config(&config.engine)
        .map_err(|e| io::Error::other(e.to_string()))?;

    let reader = BufReader::new(stream.try_clone()?);
    let writer = stream.try_clone()?;
    let session = Session::new(engine, &config.session);
    tracing::info!(peer = ?peer, session = session.id(), "client connected");

    session.run(reader, writer);

    // Unblocks the inbound reader if the peer stopped reading but never hung up.
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

/// Run a single session over this process's stdin and stdout.
pub fn serve_stdio(config: &Config) -> io::Result<()> {
    let engine = engine::from_config(&config.engine)
        .map_err(|e| io::Error::other(e.to_string()))?;
    let session = Session::new(engine, &config.session);
    session.run(BufReader::new(io::stdin()), io::stdout());
    Ok(())
}
