//! Throwaway certificate authority for tests and local experiments.
//!
//! Everything is generated in memory with `rcgen`; [`TestPki::write_to`]
//! lays the material out in the directory structure the client and the
//! endpoint read by default.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use dirconn_common::{
    config::{CertDbPath, ServerCertPath},
    credentials::CredentialStore,
};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::{
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    RootCertStore,
};
use sha2::{Digest, Sha256};

/// A certificate and its private key
#[derive(Debug, Clone)]
pub struct Credential {
    pub cert_pem: String,
    pub key_pem:  String,
    cert_der:     Vec<u8>,
    key_der:      Vec<u8>,
}

impl Credential {
    fn issue(
        params: CertificateParams,
        issuer: Option<(&rcgen::Certificate, &KeyPair)>,
    ) -> Result<(Self, rcgen::Certificate, KeyPair)> {
        let key = KeyPair::generate().context("Failed to generate key pair")?;
        let cert = match issuer {
            Some((ca_cert, ca_key)) => params.signed_by(&key, ca_cert, ca_key),
            None => params.self_signed(&key),
        }
        .context("Failed to sign certificate")?;

        let credential = Self {
            cert_pem: cert.pem(),
            key_pem:  key.serialize_pem(),
            cert_der: cert.der().to_vec(),
            key_der:  key.serialize_der(),
        };
        Ok((credential, cert, key))
    }

    /// Single element certificate chain
    pub fn chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.cert_der.clone())]
    }

    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_der.clone()).into()
    }

    /// Hex SHA-256 of the DER certificate
    pub fn sha256_hex(&self) -> String {
        hex::encode(Sha256::digest(&self.cert_der))
    }
}

/// A CA plus a server certificate and any number of nicknamed client
/// certificates, all signed by that CA.
pub struct TestPki {
    ca_cert: rcgen::Certificate,
    ca_key:  KeyPair,
    ca:      Credential,
    server:  Credential,
    clients: Vec<(String, Credential)>,
}

impl TestPki {
    /// Generate a CA and a server certificate valid for `server_names`
    /// (DNS names or IP addresses).
    pub fn generate(server_names: &[&str]) -> Result<Self> {
        let mut ca_params = CertificateParams::new(Vec::<String>::new())
            .context("Failed to create CA parameters")?;
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "dirconn test CA");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (ca, ca_cert, ca_key) = Credential::issue(ca_params, None)?;

        let names: Vec<String> = server_names.iter().map(|name| name.to_string()).collect();
        let mut server_params =
            CertificateParams::new(names).context("Invalid server name")?;
        server_params
            .distinguished_name
            .push(DnType::CommonName, server_names.first().copied().unwrap_or("localhost"));
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let (server, _, _) = Credential::issue(server_params, Some((&ca_cert, &ca_key)))?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca,
            server,
            clients: Vec::new(),
        })
    }

    /// Issue a client certificate stored under `nickname`.
    pub fn issue_client(&mut self, nickname: &str) -> Result<&Credential> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .context("Failed to create client parameters")?;
        params.distinguished_name.push(DnType::CommonName, nickname);
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let (credential, _, _) = Credential::issue(params, Some((&self.ca_cert, &self.ca_key)))?;

        self.clients.push((nickname.to_string(), credential));
        Ok(&self.clients[self.clients.len() - 1].1)
    }

    pub fn server(&self) -> &Credential {
        &self.server
    }

    /// Client credential issued under exactly `nickname`
    pub fn client(&self, nickname: &str) -> Option<&Credential> {
        self.clients
            .iter()
            .find(|(name, _)| name == nickname)
            .map(|(_, credential)| credential)
    }

    /// Trust store containing only this CA
    pub fn root_store(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(self.ca.chain());
        roots
    }

    /// Credential store holding every issued client certificate in issue
    /// order.
    pub fn credential_store(&self, provider: &CryptoProvider) -> Result<CredentialStore> {
        let mut store = CredentialStore::new();
        for (nickname, credential) in &self.clients {
            store
                .insert_der(
                    nickname.as_str(),
                    credential.chain(),
                    credential.private_key(),
                    provider,
                )
                .with_context(|| format!("Failed to add credential '{nickname}'"))?;
        }
        Ok(store)
    }

    /// Write the PKI below `dir` using the default certificate layout.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        let server_paths = ServerCertPath::in_dir(dir);
        let client_paths = CertDbPath::in_dir(dir);

        for path in [&server_paths.cert_path, &client_paths.cert_db_dir.join("_")] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {parent:?}"))?;
            }
        }

        write(&server_paths.ca_path, &self.ca.cert_pem)?;
        write(&server_paths.cert_path, &self.server.cert_pem)?;
        write(&server_paths.key_path, &self.server.key_pem)?;
        for (nickname, credential) in &self.clients {
            let base = &client_paths.cert_db_dir;
            write(&base.join(format!("{nickname}.pem")), &credential.cert_pem)?;
            write(&base.join(format!("{nickname}.key.pem")), &credential.key_pem)?;
        }

        tracing::info!(?dir, clients = self.clients.len(), "Wrote test PKI");
        Ok(())
    }
}

fn write(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {path:?}"))
}

#[cfg(test)]
mod tests {
    use dirconn_common::credentials::{default_provider, load_root_store};

    use super::*;

    #[test]
    fn issued_clients_are_kept_in_order() {
        let mut pki = TestPki::generate(&["localhost"]).unwrap();
        pki.issue_client("UserCert").unwrap();
        pki.issue_client("AdminCert").unwrap();

        let store = pki.credential_store(&default_provider()).unwrap();
        let nicknames: Vec<_> = store.nicknames().collect();
        assert_eq!(nicknames, ["UserCert", "AdminCert"]);
        assert!(pki.client("AdminCert").is_some());
        assert!(pki.client("admincert").is_none());
    }

    #[test]
    fn fingerprints_differ_between_credentials() {
        let mut pki = TestPki::generate(&["localhost"]).unwrap();
        let first = pki.issue_client("a").unwrap().sha256_hex();
        let second = pki.issue_client("b").unwrap().sha256_hex();
        assert_ne!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn written_layout_loads_back() {
        let mut pki = TestPki::generate(&["localhost", "127.0.0.1"]).unwrap();
        pki.issue_client("AdminCert").unwrap();
        let dir = tempfile::tempdir().unwrap();
        pki.write_to(dir.path()).unwrap();

        let paths = CertDbPath::in_dir(dir.path());
        let roots = load_root_store(&paths.ca_path).unwrap();
        assert_eq!(roots.len(), 1);

        let store = CredentialStore::load_dir(&paths.cert_db_dir, &default_provider()).unwrap();
        assert_eq!(store.nicknames().collect::<Vec<_>>(), ["AdminCert"]);

        let server = ServerCertPath::in_dir(dir.path());
        assert!(server.cert_path.exists());
        assert!(server.key_path.exists());
    }
}
