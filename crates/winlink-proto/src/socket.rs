//! Socket helpers: port-range binding and client socket options.

use std::io::ErrorKind;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Bind the first free port in `start..=end` on `host`.
///
/// A port that is already in use is skipped; any other bind error ends the
/// search. A range of `0..=0` binds an ephemeral port.
pub async fn bind_in_range(host: &str, start: u16, end: u16) -> Result<TcpListener, TransportError> {
    let bind_error = |reason: String| TransportError::Bind {
        host: host.to_string(),
        start,
        end,
        reason,
    };

    if start > end {
        return Err(bind_error("empty port range".to_string()));
    }

    for port in start..=end {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                debug!(host, port, "Bound listener");
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                warn!(host, port, "Port in use, trying next");
            }
            Err(e) => return Err(bind_error(e.to_string())),
        }
    }

    Err(bind_error("every port in range is in use".to_string()))
}

/// Resolve `address` and open a TCP connection with keep-alive and no-delay.
pub async fn connect_tcp(address: &str) -> Result<TcpStream, TransportError> {
    let addr: SocketAddr = lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| TransportError::Io(std::io::Error::new(
            ErrorKind::NotFound,
            format!("no address found for {}", address),
        )))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
