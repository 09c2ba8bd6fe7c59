use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors surfaced while building a socket factory or opening a connection.
///
/// `Configuration` is fatal for the factory that produced it. The other two
/// are per-call and are never retried internally.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Settings are invalid or a required setting could not be read.
    #[error("invalid connection configuration: {0}")]
    Configuration(String),

    /// The target host did not resolve to any address.
    #[error("unable to resolve host {host}:{port}")]
    HostResolution {
        host:   String,
        port:   u16,
        #[source]
        source: Option<io::Error>,
    },

    /// Transport or handshake failure.
    #[error("unable to create socket to {host}:{port}: {source}")]
    Connection {
        host:   String,
        port:   u16,
        #[source]
        source: io::Error,
    },
}

impl ConnectError {
    pub(crate) fn configuration<S: Into<String>>(message: S) -> Self {
        ConnectError::Configuration(message.into())
    }

    /// Wrap an I/O failure observed while connecting to `host:port`.
    pub fn connection<H: Into<String>>(host: H, port: u16, source: io::Error) -> Self {
        ConnectError::Connection {
            host: host.into(),
            port,
            source,
        }
    }

    /// Whether this error was raised before any connection was attempted.
    pub fn is_configuration(&self) -> bool {
        matches!(self, ConnectError::Configuration(_))
    }
}

impl From<CredentialError> for ConnectError {
    fn from(err: CredentialError) -> Self {
        ConnectError::Configuration(err.to_string())
    }
}

/// Errors raised while loading trust anchors or the client credential store.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse PEM data in {path:?}: {source}")]
    Pem {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("unsupported private key for nickname '{nickname}': {source}")]
    UnsupportedKey {
        nickname: String,
        #[source]
        source:   rustls::Error,
    },

    #[error("duplicate nickname '{0}' in credential store")]
    DuplicateNickname(String),
}
