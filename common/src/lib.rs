//! dirconn common library
//!
//! Shared building blocks for the directory-protocol connection layer used by
//! both the dirconn client and the dirconn test server. It includes:
//!
//! - Connection configuration and its validation rules
//! - The error taxonomy surfaced by the socket factory
//! - Nickname-based client certificate selection for mutual TLS
//! - Handshake observers and connection lifecycle listeners
//! - A blocking TLS stream wrapper over TCP
//!
//! # Features
//!
//! - **Mutual TLS**: client certificates are chosen by nickname from a local
//!   credential store at handshake time
//! - **Fail-safe observers**: observer and listener errors are logged, never
//!   surfaced to the caller
//! - **Socket options**: cross-platform TCP keepalive

/// Connection configuration and certificate directory conventions
pub mod config;

/// Nickname-keyed credential store and the rustls client certificate resolver
pub mod credentials;

/// Error taxonomy for factory construction and connection attempts
pub mod error;

/// Handshake observers and connection lifecycle listeners
pub mod events;

/// Client certificate selection policy
pub mod selector;

/// Platform-specific socket options
pub mod socket_opts;

/// Blocking TLS stream wrapper for TCP connections
pub mod tls_stream;

// Re-export commonly used types for convenience
pub use config::{CertDbPath, ConnectionConfig, ServerCertPath};
pub use credentials::{default_provider, load_root_store, CredentialStore, NicknameCertResolver};
pub use error::{ConnectError, CredentialError};
pub use events::{
    ConnectionListener, HandshakeCompletedEvent, HandshakeObserver, LoggingConnectionListener,
    LoggingHandshakeObserver, SocketEvent, SocketEventKind,
};
pub use selector::ClientCertSelector;
pub use tls_stream::TlsStream;
