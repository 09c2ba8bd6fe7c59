use std::{
    io,
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
};

use dirconn_common::{
    config::ConnectionConfig,
    credentials::{default_provider, load_root_store, CredentialStore, NicknameCertResolver},
    error::ConnectError,
    events::{
        notify_handshake, ConnectionListener, HandshakeCompletedEvent, HandshakeObserver,
        LoggingConnectionListener, LoggingHandshakeObserver,
    },
    selector::ClientCertSelector,
    tls_stream::TlsStream,
};
use rustls::{
    pki_types::ServerName, ClientConfig as RustlsClientConfig, ClientConnection, RootCertStore,
};
use uuid::Uuid;

use crate::handle::{ConnectionHandle, ConnectionState};

// Legacy hello formats and anything older than TLS 1.2 are never offered
static PROTOCOL_VERSIONS: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Produces plain or TLS connections according to a [`ConnectionConfig`].
///
/// Configuration and TLS settings are fixed at construction, so one factory
/// can serve concurrent `connect` calls from any number of threads.
pub struct SocketFactory {
    config:     ConnectionConfig,
    tls_config: Option<Arc<RustlsClientConfig>>,
    lifecycle:  Arc<LoggingConnectionListener>,
    listeners:  Vec<Arc<dyn ConnectionListener>>,
    observers:  Vec<Arc<dyn HandshakeObserver>>,
}

impl SocketFactory {
    /// Build a factory, loading trust anchors from the configured CA file
    /// and, when a client auth nickname is set, the credential store.
    pub fn new(config: ConnectionConfig) -> Result<Self, ConnectError> {
        config.validate()?;
        if !config.is_secure() {
            return Self::assemble(config, None);
        }

        let ca_path = config.ca_path().ok_or_else(|| {
            ConnectError::Configuration("secure connections require a CA certificate file".into())
        })?;
        tracing::info!("Loading trust anchors from {:?}", ca_path);
        let roots = load_root_store(ca_path)?;

        let store = match config.client_auth_nickname() {
            Some(_) => {
                let dir = config.cert_db_dir().ok_or_else(|| {
                    ConnectError::Configuration(
                        "client authentication requires a credential store directory".into(),
                    )
                })?;
                tracing::info!("Loading client credentials from {:?}", dir);
                CredentialStore::load_dir(dir, &default_provider())?
            }
            None => CredentialStore::new(),
        };

        Self::with_credentials(config, roots, store)
    }

    /// Build a factory from trust anchors and credentials already in memory.
    pub fn with_credentials(
        config: ConnectionConfig,
        roots: RootCertStore,
        store: CredentialStore,
    ) -> Result<Self, ConnectError> {
        config.validate()?;
        let tls_config = if config.is_secure() {
            Some(Arc::new(build_tls_config(&config, roots, store)?))
        } else {
            None
        };
        Self::assemble(config, tls_config)
    }

    fn assemble(
        config: ConnectionConfig,
        tls_config: Option<Arc<RustlsClientConfig>>,
    ) -> Result<Self, ConnectError> {
        tracing::debug!(
            secure = config.is_secure(),
            keep_alive = config.keep_alive_enabled(),
            nickname = ?config.client_auth_nickname(),
            "Socket factory ready"
        );
        let lifecycle = Arc::new(LoggingConnectionListener::new());
        Ok(Self {
            config,
            tls_config,
            listeners: vec![lifecycle.clone()],
            lifecycle,
            observers: vec![Arc::new(LoggingHandshakeObserver)],
        })
    }

    /// Register an additional lifecycle listener for secure connections
    pub fn with_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Register an additional handshake observer
    pub fn with_observer(mut self, observer: Arc<dyn HandshakeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Lifecycle event counts across every secure connection this factory
    /// has produced
    pub fn lifecycle_events(&self) -> &LoggingConnectionListener {
        &self.lifecycle
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Whether connections from this factory offer a client certificate
    pub fn is_client_auth(&self) -> bool {
        self.config.client_auth_nickname().is_some()
    }

    /// Open a connection to `host:port`.
    ///
    /// Secure connections return only after the TLS handshake has finished.
    /// Any failure releases the socket before the error is returned.
    pub fn connect(&self, host: &str, port: u16) -> Result<ConnectionHandle, ConnectError> {
        let conn_id = Uuid::new_v4();
        tracing::debug!(%conn_id, host, port, secure = self.config.is_secure(), "Creating socket");

        let (socket, peer_addr) = self.open_socket(host, port)?;

        let mut handle = match &self.tls_config {
            None => ConnectionHandle::plain(conn_id, host, port, peer_addr, socket),
            Some(tls_config) => {
                let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
                    let cause = io::Error::new(io::ErrorKind::InvalidInput, e);
                    ConnectError::connection(host, port, cause)
                })?;
                let session = ClientConnection::new(Arc::clone(tls_config), server_name)
                    .map_err(|e| ConnectError::connection(host, port, io::Error::other(e)))?;

                let mut handle = ConnectionHandle::negotiating(
                    conn_id,
                    host,
                    port,
                    peer_addr,
                    TlsStream::new(socket, session),
                    self.listeners.clone(),
                );
                if let Err(e) = handle.complete_handshake(self.config.handshake_timeout()) {
                    return Err(handle.fail(e));
                }
                handle
            }
        };

        if let Err(e) = handle.finish_setup(self.config.keep_alive_enabled()) {
            return Err(handle.fail(e));
        }
        self.observe_handshake(&handle, conn_id, host, peer_addr);

        debug_assert!(matches!(
            handle.state(),
            ConnectionState::Ready | ConnectionState::Established
        ));
        tracing::debug!(%conn_id, host, port, state = %handle.state(), "Socket created");
        Ok(handle)
    }

    fn observe_handshake(
        &self,
        handle: &ConnectionHandle,
        conn_id: Uuid,
        host: &str,
        peer_addr: SocketAddr,
    ) {
        if let Some(session) = handle.tls_session() {
            let event =
                HandshakeCompletedEvent::capture(session, &conn_id.to_string(), host, peer_addr);
            notify_handshake(&self.observers, &event);
        }
    }

    fn open_socket(&self, host: &str, port: u16) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| ConnectError::HostResolution {
                host: host.to_string(),
                port,
                source: Some(e),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::HostResolution {
                host: host.to_string(),
                port,
                source: None,
            });
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout()) {
                Ok(stream) => return Ok((stream, addr)),
                Err(e) => {
                    tracing::debug!(host, %addr, "Connect attempt failed: {}", e);
                    last_err = Some(e);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| io::Error::other("no address to connect to"));
        tracing::error!("Unable to create socket to {}:{}: {}", host, port, err);
        Err(ConnectError::connection(host, port, err))
    }
}

fn build_tls_config(
    config: &ConnectionConfig,
    roots: RootCertStore,
    store: CredentialStore,
) -> Result<RustlsClientConfig, ConnectError> {
    let builder = RustlsClientConfig::builder_with_provider(default_provider())
        .with_protocol_versions(PROTOCOL_VERSIONS)
        .map_err(|e| ConnectError::Configuration(format!("unsupported TLS versions: {e}")))?
        .with_root_certificates(roots);

    let tls_config = match config.client_auth_nickname() {
        Some(nickname) => {
            tracing::debug!(nickname, "Setting client auth cert nickname");
            let selector = ClientCertSelector::new(Some(nickname.to_string()));
            let nicknames: Vec<&str> = store.nicknames().collect();
            if selector.select(&nicknames).is_none() {
                tracing::warn!(
                    nickname,
                    "Client auth nickname not found in credential store, handshakes will \
                     decline client authentication"
                );
            }
            builder.with_client_cert_resolver(Arc::new(NicknameCertResolver::new(
                Arc::new(store),
                selector,
            )))
        }
        None => builder.with_no_client_auth(),
    };
    Ok(tls_config)
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use dirconn_common::events::SocketEventKind;

    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn factory_is_shareable_across_threads() {
        assert_send_sync::<SocketFactory>();
    }

    #[test]
    fn nickname_on_plain_factory_is_a_configuration_error() {
        let config = ConnectionConfig::plain().with_client_auth_nickname("AdminCert");
        let err = SocketFactory::new(config).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn secure_factory_requires_trust_anchors() {
        let err = SocketFactory::new(ConnectionConfig::secure()).err().unwrap();
        assert!(err.is_configuration());

        let config = ConnectionConfig::secure().with_ca_path("/nonexistent/root-ca.pem");
        let err = SocketFactory::new(config).err().unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn plain_connect_never_builds_tls() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let factory = SocketFactory::new(ConnectionConfig::plain()).unwrap();
        assert!(factory.tls_config.is_none());
        assert!(!factory.is_client_auth());

        let handle = factory.connect("127.0.0.1", port).unwrap();
        assert_eq!(handle.state(), ConnectionState::Ready);
        assert!(!handle.is_secure());
        assert!(handle.keep_alive().unwrap());

        handle.close().unwrap();
        let events = factory.lifecycle_events();
        assert_eq!(events.count(SocketEventKind::Connected), 0);
        assert_eq!(events.count(SocketEventKind::AfterClose), 0);
    }

    #[test]
    fn plain_connect_applies_disabled_keepalive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let config = ConnectionConfig::plain().with_keep_alive(false);
        let factory = SocketFactory::new(config).unwrap();
        let handle = factory.connect("127.0.0.1", port).unwrap();
        assert!(!handle.keep_alive().unwrap());
    }

    #[test]
    fn refused_connection_is_a_connection_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let factory = SocketFactory::new(ConnectionConfig::plain()).unwrap();
        let err = factory.connect("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, ConnectError::Connection { port: p, .. } if p == port));
    }

    #[test]
    fn unresolvable_host_is_a_resolution_error() {
        let factory = SocketFactory::with_credentials(
            ConnectionConfig::secure(),
            RootCertStore::empty(),
            CredentialStore::new(),
        )
        .unwrap();
        let err = factory.connect("nonexistent.invalid", 636).unwrap_err();
        assert!(matches!(err, ConnectError::HostResolution { .. }), "{err:?}");
    }

    #[test]
    fn client_auth_factory_reports_mutual_auth() {
        let factory = SocketFactory::with_credentials(
            ConnectionConfig::client_auth("AdminCert"),
            RootCertStore::empty(),
            CredentialStore::new(),
        )
        .unwrap();
        assert!(factory.is_client_auth());
        assert!(factory.tls_config.is_some());
    }
}
