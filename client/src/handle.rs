use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use dirconn_common::{
    error::ConnectError,
    events::{notify_listeners, ConnectionListener, SocketEvent, SocketEventKind},
    socket_opts,
    tls_stream::TlsStream,
};
use rustls::{ClientConnection, ProtocolVersion};
use uuid::Uuid;

/// Lifecycle of a connection.
///
/// `Created → Ready` for plain sockets, `Created → Negotiating →
/// Established | Failed` for TLS, and `Closed` at the end of every path.
/// Socket options are applied before the final transition, so a plain socket
/// that cannot take its keepalive setting goes `Created → Failed`.
/// Callers only ever receive handles in `Ready` or `Established`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Created,
    Negotiating,
    Ready,
    Established,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Created => "CREATED",
            ConnectionState::Negotiating => "NEGOTIATING",
            ConnectionState::Ready => "READY",
            ConnectionState::Established => "ESTABLISHED",
            ConnectionState::Failed => "FAILED",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream>),
}

/// One transport connection produced by a [`SocketFactory`](crate::SocketFactory).
///
/// Closing happens through [`close`](Self::close) or on drop; registered
/// connection listeners see `BeforeClose` and `AfterClose` either way.
pub struct ConnectionHandle {
    id:        Uuid,
    host:      String,
    port:      u16,
    peer_addr: SocketAddr,
    state:     ConnectionState,
    transport: Transport,
    listeners: Vec<Arc<dyn ConnectionListener>>,
}

impl ConnectionHandle {
    pub(crate) fn plain(
        id: Uuid,
        host: &str,
        port: u16,
        peer_addr: SocketAddr,
        socket: TcpStream,
    ) -> Self {
        Self {
            id,
            host: host.to_string(),
            port,
            peer_addr,
            state: ConnectionState::Created,
            transport: Transport::Plain(socket),
            listeners: Vec::new(),
        }
    }

    pub(crate) fn negotiating(
        id: Uuid,
        host: &str,
        port: u16,
        peer_addr: SocketAddr,
        stream: TlsStream,
        listeners: Vec<Arc<dyn ConnectionListener>>,
    ) -> Self {
        let mut handle = Self {
            id,
            host: host.to_string(),
            port,
            peer_addr,
            state: ConnectionState::Created,
            transport: Transport::Tls(Box::new(stream)),
            listeners,
        };
        handle.notify(SocketEventKind::Connected);
        handle.transition(ConnectionState::Negotiating);
        handle
    }

    pub(crate) fn transition(&mut self, next: ConnectionState) {
        tracing::trace!(
            conn_id = %self.id,
            from = %self.state,
            to = %next,
            "Connection state change"
        );
        self.state = next;
    }

    /// Run the handshake of a negotiating TLS handle with `timeout` applied to
    /// socket reads and writes, then clear the timeouts. The handle stays
    /// `Negotiating` until [`finish_setup`](Self::finish_setup).
    pub(crate) fn complete_handshake(&mut self, timeout: Duration) -> io::Result<()> {
        let Transport::Tls(stream) = &mut self.transport else {
            return Ok(());
        };
        let socket = stream.get_ref();
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        stream.complete_handshake()?;

        let socket = stream.get_ref();
        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)
    }

    /// Apply the keepalive setting, then move to `Ready` or `Established`.
    pub(crate) fn finish_setup(&mut self, keep_alive: bool) -> io::Result<()> {
        socket_opts::set_keepalive(self.tcp_stream(), keep_alive)?;
        let next = if self.is_secure() {
            ConnectionState::Established
        } else {
            ConnectionState::Ready
        };
        self.transition(next);
        Ok(())
    }

    /// Mark the handle failed, release its socket and produce the error for
    /// the caller.
    pub(crate) fn fail(mut self, cause: io::Error) -> ConnectError {
        tracing::debug!(conn_id = %self.id, host = %self.host, "Connection failed: {}", cause);
        self.transition(ConnectionState::Failed);
        if let Err(e) = self.shutdown() {
            tracing::warn!(conn_id = %self.id, "Unable to close socket: {}", e);
        }
        ConnectError::connection(self.host.as_str(), self.port, cause)
    }

    fn notify(&self, kind: SocketEventKind) {
        if self.listeners.is_empty() {
            return;
        }
        let event = SocketEvent {
            kind,
            conn_id: self.id.to_string(),
            host: self.host.clone(),
            peer_addr: self.peer_addr,
        };
        notify_listeners(&self.listeners, &event);
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.notify(SocketEventKind::BeforeClose);
        let result = match &mut self.transport {
            Transport::Plain(socket) => socket.shutdown(Shutdown::Both),
            Transport::Tls(stream) => stream.close(),
        };
        self.transition(ConnectionState::Closed);
        self.notify(SocketEventKind::AfterClose);

        match result {
            // the peer may already have torn the connection down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    /// Close the connection, sending close_notify first on TLS connections.
    pub fn close(mut self) -> io::Result<()> {
        self.shutdown()
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// Negotiated TLS version, `None` for plain connections
    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.tls_session()?.protocol_version()
    }

    /// Negotiated cipher suite name, `None` for plain connections
    pub fn cipher_suite(&self) -> Option<String> {
        self.tls_session()?
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
    }

    /// The TLS session, `None` for plain connections
    pub fn tls_session(&self) -> Option<&ClientConnection> {
        match &self.transport {
            Transport::Plain(_) => None,
            Transport::Tls(stream) => Some(stream.connection()),
        }
    }

    /// The TCP socket beneath any TLS layer
    pub fn tcp_stream(&self) -> &TcpStream {
        match &self.transport {
            Transport::Plain(socket) => socket,
            Transport::Tls(stream) => stream.get_ref(),
        }
    }

    /// Current `SO_KEEPALIVE` setting of the socket
    pub fn keep_alive(&self) -> io::Result<bool> {
        socket_opts::keepalive(self.tcp_stream())
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp_stream().set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp_stream().set_write_timeout(timeout)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("secure", &self.is_secure())
            .finish()
    }
}

impl Read for ConnectionHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(socket) => socket.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for ConnectionHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.transport {
            Transport::Plain(socket) => socket.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.transport {
            Transport::Plain(socket) => socket.flush(),
            Transport::Tls(stream) => stream.flush(),
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::trace!(conn_id = %self.id, "Error closing dropped connection: {}", e);
        }
    }
}
