//! Passive observers of the connection lifecycle.
//!
//! Both observer kinds are diagnostic sinks. Their errors are logged by the
//! notify helpers and never reach the caller of `connect`, nor change the
//! outcome of a handshake.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rustls::{ClientConnection, ProtocolVersion};
use sha2::{Digest, Sha256};

/// Snapshot of a completed TLS handshake.
#[derive(Debug, Clone)]
pub struct HandshakeCompletedEvent {
    /// Diagnostic id of the connection
    pub conn_id:            String,
    /// Host name the connection was opened for
    pub host:               String,
    /// Resolved peer address
    pub peer_addr:          SocketAddr,
    /// Negotiated protocol version
    pub protocol_version:   Option<ProtocolVersion>,
    /// Name of the negotiated cipher suite
    pub cipher_suite:       Option<String>,
    /// Hex SHA-256 of the server's end-entity certificate
    pub server_cert_sha256: Option<String>,
}

impl HandshakeCompletedEvent {
    /// Capture the negotiated parameters of `conn`.
    pub fn capture(
        conn: &ClientConnection,
        conn_id: &str,
        host: &str,
        peer_addr: SocketAddr,
    ) -> Self {
        let server_cert_sha256 = conn
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| hex::encode(Sha256::digest(cert.as_ref())));

        Self {
            conn_id: conn_id.to_string(),
            host: host.to_string(),
            peer_addr,
            protocol_version: conn.protocol_version(),
            cipher_suite: conn
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            server_cert_sha256,
        }
    }
}

/// Notified once per completed handshake.
pub trait HandshakeObserver: Send + Sync {
    fn handshake_completed(&self, event: &HandshakeCompletedEvent) -> anyhow::Result<()>;
}

/// Socket lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketEventKind {
    /// Transport connected, before any TLS negotiation
    Connected,
    /// About to close the socket
    BeforeClose,
    /// Socket closed
    AfterClose,
}

impl fmt::Display for SocketEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketEventKind::Connected => "connected",
            SocketEventKind::BeforeClose => "before-close",
            SocketEventKind::AfterClose => "after-close",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SocketEvent {
    pub kind:      SocketEventKind,
    pub conn_id:   String,
    pub host:      String,
    pub peer_addr: SocketAddr,
}

/// Receives socket lifecycle events. Implementations must return promptly.
pub trait ConnectionListener: Send + Sync {
    fn on_event(&self, event: &SocketEvent) -> anyhow::Result<()>;
}

/// Deliver `event` to every observer, logging and dropping their errors.
pub fn notify_handshake(observers: &[Arc<dyn HandshakeObserver>], event: &HandshakeCompletedEvent) {
    for observer in observers {
        if let Err(e) = observer.handshake_completed(event) {
            tracing::warn!(
                conn_id = %event.conn_id,
                host = %event.host,
                "Handshake observer failed: {:#}",
                e
            );
        }
    }
}

/// Deliver `event` to every listener, logging and dropping their errors.
pub fn notify_listeners(listeners: &[Arc<dyn ConnectionListener>], event: &SocketEvent) {
    for listener in listeners {
        if let Err(e) = listener.on_event(event) {
            tracing::warn!(
                conn_id = %event.conn_id,
                event = %event.kind,
                "Connection listener failed: {:#}",
                e
            );
        }
    }
}

/// Observer that traces handshake completion.
#[derive(Debug, Default)]
pub struct LoggingHandshakeObserver;

impl HandshakeObserver for LoggingHandshakeObserver {
    fn handshake_completed(&self, event: &HandshakeCompletedEvent) -> anyhow::Result<()> {
        tracing::debug!(
            conn_id = %event.conn_id,
            host = %event.host,
            peer = %event.peer_addr,
            version = ?event.protocol_version,
            cipher_suite = event.cipher_suite.as_deref().unwrap_or("unknown"),
            server_cert_sha256 = event.server_cert_sha256.as_deref().unwrap_or("none"),
            "TLS handshake completed"
        );
        Ok(())
    }
}

/// Listener that traces socket events and counts them.
#[derive(Debug, Default)]
pub struct LoggingConnectionListener {
    connected:    AtomicU64,
    before_close: AtomicU64,
    after_close:  AtomicU64,
}

impl LoggingConnectionListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events of `kind` seen so far
    pub fn count(&self, kind: SocketEventKind) -> u64 {
        self.counter(kind).load(Ordering::Relaxed)
    }

    fn counter(&self, kind: SocketEventKind) -> &AtomicU64 {
        match kind {
            SocketEventKind::Connected => &self.connected,
            SocketEventKind::BeforeClose => &self.before_close,
            SocketEventKind::AfterClose => &self.after_close,
        }
    }
}

impl ConnectionListener for LoggingConnectionListener {
    fn on_event(&self, event: &SocketEvent) -> anyhow::Result<()> {
        self.counter(event.kind).fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            conn_id = %event.conn_id,
            host = %event.host,
            peer = %event.peer_addr,
            event = %event.kind,
            "Socket event"
        );
        Ok(())
    }
}
