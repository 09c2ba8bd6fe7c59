//! TLS test endpoint for the dirconn socket factory.
//!
//! [`TlsEndpoint`] accepts TCP connections, performs the server side of the
//! TLS handshake with a configurable client authentication policy, reports
//! a [`HandshakeRecord`] per connection and then echoes application data
//! back until the client closes. [`pki::TestPki`] generates the certificates
//! it runs with.

pub mod pki;

use std::{
    fs,
    io::{self, BufReader, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use dirconn_common::{config::ServerCertPath, credentials::default_provider};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    server::WebPkiClientVerifier,
    ProtocolVersion, RootCertStore, ServerConfig, ServerConnection,
};
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};

use crate::pki::TestPki;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

static TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];

/// How the endpoint treats client certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ClientAuthPolicy {
    /// Never request a certificate
    None,
    /// Request a certificate and verify it when one is sent
    #[default]
    Optional,
    /// Abort handshakes that do not present a valid certificate
    Required,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    pub client_auth: ClientAuthPolicy,
    /// Only negotiate TLS 1.2
    pub tls12_only:  bool,
}

/// Outcome of one server side handshake
#[derive(Debug, Clone)]
pub struct HandshakeRecord {
    pub peer_addr:          SocketAddr,
    pub protocol_version:   Option<ProtocolVersion>,
    /// Hex SHA-256 of the end-entity certificate the client presented
    pub client_cert_sha256: Option<String>,
    pub error:              Option<String>,
}

impl HandshakeRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// A TLS endpoint that records every handshake it performs.
#[derive(Clone)]
pub struct TlsEndpoint {
    tls_config: Arc<ServerConfig>,
}

impl TlsEndpoint {
    /// Load the server certificate, key and client CA from disk.
    pub fn new(cert_path: &ServerCertPath, options: EndpointOptions) -> Result<Self> {
        tracing::info!("Creating TLS endpoint with certificates:");
        tracing::info!("  - Server cert: {:?}", cert_path.cert_path);
        tracing::info!("  - Server key: {:?}", cert_path.key_path);
        tracing::info!("  - CA cert: {:?}", cert_path.ca_path);

        let cert_pem = fs::read(&cert_path.cert_path)
            .with_context(|| format!("Failed to read certificate from {:?}", cert_path.cert_path))?;
        let key_pem = fs::read(&cert_path.key_path)
            .with_context(|| format!("Failed to read private key from {:?}", cert_path.key_path))?;
        let ca_pem = fs::read(&cert_path.ca_path)
            .with_context(|| format!("Failed to read root CA from {:?}", cert_path.ca_path))?;

        let cert_chain = certs(&mut BufReader::new(&*cert_pem))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate")?;
        let key = private_key(&mut BufReader::new(&*key_pem))
            .context("Failed to parse private key")?
            .ok_or_else(|| anyhow!("No private key found in {:?}", cert_path.key_path))?;

        let mut roots = RootCertStore::empty();
        let ca_certs = certs(&mut BufReader::new(&*ca_pem))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse root CA certificate")?;
        roots.add_parsable_certificates(ca_certs);
        if roots.is_empty() {
            return Err(anyhow!("No valid CA certificates found in {:?}", cert_path.ca_path));
        }

        Self::with_materials(cert_chain, key, roots, options)
    }

    /// Serve the server credential of `pki` and trust its CA for clients.
    pub fn from_pki(pki: &TestPki, options: EndpointOptions) -> Result<Self> {
        Self::with_materials(
            pki.server().chain(),
            pki.server().private_key(),
            pki.root_store(),
            options,
        )
    }

    pub fn with_materials(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        client_roots: RootCertStore,
        options: EndpointOptions,
    ) -> Result<Self> {
        let provider = default_provider();
        let versions = if options.tls12_only {
            TLS12_ONLY
        } else {
            rustls::DEFAULT_VERSIONS
        };

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(versions)
            .context("Unsupported protocol versions")?;

        let builder = match options.client_auth {
            ClientAuthPolicy::None => builder.with_no_client_auth(),
            policy => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), provider);
                let verifier = if policy == ClientAuthPolicy::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                builder.with_client_cert_verifier(
                    verifier.build().context("Failed to build client verifier")?,
                )
            }
        };

        let config = builder
            .with_single_cert(cert_chain, key)
            .context("Failed to create TLS config")?;
        tracing::debug!(
            client_auth = ?options.client_auth,
            tls12_only = options.tls12_only,
            "TLS endpoint configured"
        );

        Ok(Self {
            tls_config: Arc::new(config),
        })
    }

    /// Bind `addr` and serve on a background thread until the returned
    /// handle is dropped.
    pub fn spawn(self, addr: &str) -> Result<RunningEndpoint> {
        let listener =
            TcpListener::bind(addr).with_context(|| format!("Failed to bind to {addr}"))?;
        let local_addr = listener.local_addr()?;
        let (records_tx, records_rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let thread = thread::spawn(move || {
            if let Err(e) = self.run_with_shutdown(listener, flag, records_tx) {
                tracing::error!("Endpoint error: {:#}", e);
            }
        });

        tracing::info!("TLS endpoint listening on {}", local_addr);
        Ok(RunningEndpoint {
            local_addr,
            records: records_rx,
            running,
            thread: Some(thread),
        })
    }

    /// Accept connections until `running` is cleared. Each connection is
    /// served on its own thread.
    pub fn run_with_shutdown(
        &self,
        listener: TcpListener,
        running: Arc<AtomicBool>,
        records: Sender<HandshakeRecord>,
    ) -> Result<()> {
        // Non-blocking accept so the flag is observed between connections
        listener
            .set_nonblocking(true)
            .context("Failed to make listener non-blocking")?;

        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((socket, peer_addr)) => {
                    tracing::debug!(%peer_addr, "New connection received");
                    let config = Arc::clone(&self.tls_config);
                    let records = records.clone();
                    thread::spawn(move || serve_client(socket, peer_addr, config, &records));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => tracing::error!("Connection error: {}", e),
            }
        }

        tracing::info!("Endpoint shutdown signal received, stopping gracefully");
        Ok(())
    }
}

/// Handle to an endpoint serving on a background thread
pub struct RunningEndpoint {
    local_addr: SocketAddr,
    records:    Receiver<HandshakeRecord>,
    running:    Arc<AtomicBool>,
    thread:     Option<JoinHandle<()>>,
}

impl RunningEndpoint {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Handshake records in completion order
    pub fn records(&self) -> &Receiver<HandshakeRecord> {
        &self.records
    }

    /// Wait up to `timeout` for the next handshake record.
    pub fn next_record(&self, timeout: Duration) -> Result<HandshakeRecord> {
        self.records.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => anyhow!("No handshake within {timeout:?}"),
            RecvTimeoutError::Disconnected => anyhow!("Endpoint stopped"),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RunningEndpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handshake, report the outcome on `records`, then echo until the client
/// goes away. The record is sent before any application data is read.
fn serve_client(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ServerConfig>,
    records: &Sender<HandshakeRecord>,
) {
    let mut record = HandshakeRecord {
        peer_addr,
        protocol_version: None,
        client_cert_sha256: None,
        error: None,
    };

    let mut conn = match ServerConnection::new(config) {
        Ok(conn) => conn,
        Err(e) => {
            record.error = Some(e.to_string());
            let _ = records.send(record);
            return;
        }
    };

    if let Err(e) = handshake(&mut socket, &mut conn) {
        tracing::warn!(%peer_addr, "Handshake failed: {}", e);
        record.error = Some(e.to_string());
        let _ = records.send(record);
        return;
    }

    record.protocol_version = conn.protocol_version();
    record.client_cert_sha256 = conn
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| hex::encode(Sha256::digest(cert.as_ref())));
    tracing::info!(
        %peer_addr,
        version = ?record.protocol_version,
        client_cert = record.client_cert_sha256.as_deref().unwrap_or("none"),
        "Handshake completed"
    );
    let _ = records.send(record);

    let mut stream = rustls::StreamOwned::new(conn, socket);
    match echo(&mut stream) {
        Ok(bytes) => tracing::debug!(%peer_addr, bytes, "Client closed connection"),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            tracing::debug!(%peer_addr, "Client closed connection without close_notify")
        }
        Err(e) => tracing::debug!(%peer_addr, "Connection ended: {}", e),
    }
}

fn handshake(socket: &mut TcpStream, conn: &mut ServerConnection) -> io::Result<()> {
    socket.set_nonblocking(false)?;
    socket.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    while conn.is_handshaking() {
        conn.complete_io(socket)?;
    }
    // The last server flight may still be queued once the handshake is done
    while conn.wants_write() {
        conn.write_tls(socket)?;
    }
    socket.set_read_timeout(None)
}

fn echo(stream: &mut rustls::StreamOwned<ServerConnection, TcpStream>) -> io::Result<u64> {
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            stream.conn.send_close_notify();
            stream.flush()?;
            return Ok(total);
        }
        stream.write_all(&buf[..n])?;
        stream.flush()?;
        total += n as u64;
    }
}
