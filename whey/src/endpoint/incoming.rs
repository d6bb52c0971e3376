use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::time::Duration;

use socket2::TcpKeepalive;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// A bound listening socket with per-accept socket options.
#[derive(Debug)]
pub struct TcpIncoming {
    listener: TcpListener,
    nodelay: bool,
    keepalive: Option<TcpKeepalive>,
}

impl TcpIncoming {
    /// Binds (opens) the given socket address.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let std_listener = StdTcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        Ok(Self {
            listener: TcpListener::from_std(std_listener)?,
            nodelay: true,
            keepalive: None,
        })
    }

    /// Sets the `TCP_NODELAY` option on accepted connections.
    pub fn with_nodelay(self, nodelay: bool) -> Self {
        Self { nodelay, ..self }
    }

    /// Sets the `TCP_KEEPALIVE` idle time on accepted connections.
    pub fn with_keepalive(self, keepalive_time: Option<Duration>) -> Self {
        Self {
            keepalive: keepalive_time.map(|time| TcpKeepalive::new().with_time(time)),
            ..self
        }
    }

    /// The local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one connection, applying the configured socket options.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote) = self.listener.accept().await?;
        self.set_accepted_socket_options(&stream);
        Ok((stream, remote))
    }

    // Consistent with the accept path in hyper, option failures warn rather
    // than fail the connection.
    fn set_accepted_socket_options(&self, stream: &TcpStream) {
        if let Err(error) = stream.set_nodelay(self.nodelay) {
            warn!("error trying to set TCP_NODELAY: {error}");
        }
        if let Some(keepalive) = &self.keepalive {
            let sock_ref = socket2::SockRef::from(&stream);
            if let Err(error) = sock_ref.set_tcp_keepalive(keepalive) {
                warn!("error trying to set TCP_KEEPALIVE: {error}");
            }
        }
    }
}

/// Whether an accept error is momentary (keep accepting) or fatal for the
/// listener.
pub(crate) fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
