//! dirconn client
//!
//! A socket factory for directory-protocol clients. Depending on its
//! [`ConnectionConfig`] it opens plain TCP connections or TLS connections,
//! and when mutual authentication is configured it presents the client
//! certificate stored under the configured nickname.
//!
//! # Example
//!
//! ```no_run
//! use dirconn_client::{ConnectionConfig, SocketFactory};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ConnectionConfig::client_auth("subsystemCert cert-pki-ca")
//!     .with_ca_path("certs/root-ca.pem")
//!     .with_cert_db_dir("certs/nicknames");
//!
//! let factory = SocketFactory::new(config)?;
//! let handle = factory.connect("ldap.example.com", 636)?;
//! println!("{} is {}", handle.peer_addr(), handle.state());
//!
//! handle.close()?;
//! # Ok(())
//! # }
//! ```

mod factory;
mod handle;

pub use factory::SocketFactory;
pub use handle::{ConnectionHandle, ConnectionState};
// Re-export important types from dirconn-common for convenience
pub use dirconn_common::{
    CertDbPath, ConnectError, ConnectionConfig, ConnectionListener, CredentialStore,
    HandshakeCompletedEvent, HandshakeObserver, SocketEvent, SocketEventKind,
};
