use std::{
    fs,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    client::ResolvesClientCert,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
    RootCertStore, SignatureScheme,
};
use rustls_pemfile::{certs, private_key};

use crate::{error::CredentialError, selector::ClientCertSelector};

const CERT_SUFFIX: &str = ".pem";
const KEY_SUFFIX: &str = ".key.pem";

/// Crypto provider used for every TLS configuration built by dirconn.
pub fn default_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Load trusted CA certificates from a PEM file.
pub fn load_root_store<P: AsRef<Path>>(path: P) -> Result<RootCertStore, CredentialError> {
    let path = path.as_ref();
    let ca_certs = read_certs(path)?;

    let mut root_store = RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(ca_certs);
    if ignored > 0 {
        tracing::warn!(?path, ignored, "Ignored unparsable CA certificates");
    }
    if root_store.is_empty() {
        return Err(CredentialError::NoCertificates(path.to_path_buf()));
    }

    tracing::debug!(?path, added, "Loaded trust anchors");
    Ok(root_store)
}

fn read_file(path: &Path) -> Result<Vec<u8>, CredentialError> {
    fs::read(path).map_err(|source| CredentialError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let pem = read_file(path)?;
    parse_certs(&pem, path)
}

fn parse_certs(pem: &[u8], path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let chain = certs(&mut BufReader::new(pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CredentialError::Pem {
            path: path.to_path_buf(),
            source,
        })?;
    if chain.is_empty() {
        return Err(CredentialError::NoCertificates(path.to_path_buf()));
    }
    Ok(chain)
}

fn parse_key(pem: &[u8], path: &Path) -> Result<PrivateKeyDer<'static>, CredentialError> {
    private_key(&mut BufReader::new(pem))
        .map_err(|source| CredentialError::Pem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CredentialError::NoPrivateKey(path.to_path_buf()))
}

#[derive(Debug, Clone)]
struct CredentialEntry {
    nickname:  String,
    certified: Arc<CertifiedKey>,
}

/// Local store of client credentials keyed by nickname.
///
/// Entries keep their insertion order, which is the order candidates are
/// offered to the [`ClientCertSelector`]. Nicknames are unique by exact
/// comparison; names differing only in case may coexist.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    entries: Vec<CredentialEntry>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `<nickname>.pem` / `<nickname>.key.pem` pair in `dir`,
    /// ordered by nickname.
    pub fn load_dir<P: AsRef<Path>>(
        dir: P,
        provider: &CryptoProvider,
    ) -> Result<Self, CredentialError> {
        let dir = dir.as_ref();
        let read_dir = fs::read_dir(dir).map_err(|source| CredentialError::Read {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut nicknames = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| CredentialError::Read {
                path: dir.to_path_buf(),
                source,
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                tracing::warn!(path = ?entry.path(), "Skipping non UTF-8 credential file");
                continue;
            };
            if name.ends_with(KEY_SUFFIX) {
                continue;
            }
            if let Some(nickname) = name.strip_suffix(CERT_SUFFIX) {
                nicknames.push(nickname.to_string());
            }
        }
        nicknames.sort();

        let mut store = Self::new();
        for nickname in nicknames {
            let cert_path = dir.join(format!("{nickname}{CERT_SUFFIX}"));
            let key_path: PathBuf = dir.join(format!("{nickname}{KEY_SUFFIX}"));
            let cert_pem = read_file(&cert_path)?;
            let key_pem = read_file(&key_path)?;

            let chain = parse_certs(&cert_pem, &cert_path)?;
            let key = parse_key(&key_pem, &key_path)?;
            store.insert_der(nickname, chain, key, provider)?;
        }

        tracing::debug!(?dir, credentials = store.len(), "Loaded credential store");
        Ok(store)
    }

    /// Add a credential from PEM encoded certificate chain and private key.
    pub fn insert_pem<S: Into<String>>(
        &mut self,
        nickname: S,
        cert_pem: &[u8],
        key_pem: &[u8],
        provider: &CryptoProvider,
    ) -> Result<(), CredentialError> {
        let nickname = nickname.into();
        let origin = PathBuf::from(format!("<{nickname}>"));
        let chain = parse_certs(cert_pem, &origin)?;
        let key = parse_key(key_pem, &origin)?;
        self.insert_der(nickname, chain, key, provider)
    }

    /// Add a credential from DER encoded certificate chain and private key.
    pub fn insert_der<S: Into<String>>(
        &mut self,
        nickname: S,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        provider: &CryptoProvider,
    ) -> Result<(), CredentialError> {
        let nickname = nickname.into();
        let signing_key = provider.key_provider.load_private_key(key).map_err(|source| {
            CredentialError::UnsupportedKey {
                nickname: nickname.clone(),
                source,
            }
        })?;
        self.insert(nickname, Arc::new(CertifiedKey::new(chain, signing_key)))
    }

    /// Add an already assembled credential.
    pub fn insert<S: Into<String>>(
        &mut self,
        nickname: S,
        certified: Arc<CertifiedKey>,
    ) -> Result<(), CredentialError> {
        let nickname = nickname.into();
        if self.get(&nickname).is_some() {
            return Err(CredentialError::DuplicateNickname(nickname));
        }
        self.entries.push(CredentialEntry {
            nickname,
            certified,
        });
        Ok(())
    }

    /// Exact lookup by nickname.
    pub fn get(&self, nickname: &str) -> Option<&Arc<CertifiedKey>> {
        self.entries
            .iter()
            .find(|entry| entry.nickname == nickname)
            .map(|entry| &entry.certified)
    }

    pub fn nicknames(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.nickname.as_str())
    }

    /// Nicknames whose key can sign with one of the offered schemes, in store
    /// order.
    pub fn candidates(&self, sigschemes: &[SignatureScheme]) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| entry.certified.key.choose_scheme(sigschemes).is_some())
            .map(|entry| entry.nickname.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// rustls hook that defers the choice of client certificate to a
/// [`ClientCertSelector`].
///
/// Holds a shared snapshot of the credential store; nothing here is mutated
/// during a handshake.
#[derive(Debug)]
pub struct NicknameCertResolver {
    store:    Arc<CredentialStore>,
    selector: ClientCertSelector,
}

impl NicknameCertResolver {
    pub fn new(store: Arc<CredentialStore>, selector: ClientCertSelector) -> Self {
        Self { store, selector }
    }
}

impl ResolvesClientCert for NicknameCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        let candidates = self.store.candidates(sigschemes);
        tracing::debug!(
            candidates = candidates.len(),
            "Server requested a client certificate"
        );

        let nickname = self.selector.select(&candidates)?;
        tracing::debug!(nickname, "Presenting client certificate");
        self.store.get(nickname).cloned()
    }

    fn has_certs(&self) -> bool {
        !self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const ECDSA_SCHEMES: &[SignatureScheme] = &[SignatureScheme::ECDSA_NISTP256_SHA256];
    const RSA_ONLY: &[SignatureScheme] = &[SignatureScheme::RSA_PSS_SHA256];

    fn generate_pem(name: &str) -> (String, String) {
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec![name.to_string()]).unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    fn store_with(nicknames: &[&str]) -> CredentialStore {
        let provider = default_provider();
        let mut store = CredentialStore::new();
        for nickname in nicknames {
            let (cert, key) = generate_pem("client.test");
            store
                .insert_pem(*nickname, cert.as_bytes(), key.as_bytes(), &provider)
                .unwrap();
        }
        store
    }

    #[test]
    fn store_keeps_insertion_order() {
        let store = store_with(&["UserCert", "AdminCert", "Other"]);
        let nicknames: Vec<_> = store.nicknames().collect();
        assert_eq!(nicknames, ["UserCert", "AdminCert", "Other"]);
        assert_eq!(store.candidates(ECDSA_SCHEMES), nicknames);
    }

    #[test]
    fn candidates_exclude_keys_that_cannot_sign() {
        let store = store_with(&["AdminCert"]);
        assert!(store.candidates(RSA_ONLY).is_empty());
    }

    #[test]
    fn exact_duplicates_are_rejected() {
        let mut store = store_with(&["AdminCert"]);
        let existing = Arc::clone(store.get("AdminCert").unwrap());
        let err = store.insert("AdminCert", existing.clone()).unwrap_err();
        assert!(matches!(err, CredentialError::DuplicateNickname(_)));

        // differing only in case is a distinct nickname
        store.insert("admincert", existing).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let provider = default_provider();
        let mut store = CredentialStore::new();
        let err = store
            .insert_pem("AdminCert", b"not a certificate", b"nor a key", &provider)
            .unwrap_err();
        assert!(matches!(err, CredentialError::NoCertificates(_)));
    }

    #[test]
    fn load_dir_pairs_certificates_with_keys() {
        let dir = tempfile::tempdir().unwrap();
        for nickname in ["zeta", "AdminCert", "UserCert"] {
            let (cert, key) = generate_pem("client.test");
            fs::write(dir.path().join(format!("{nickname}.pem")), cert).unwrap();
            fs::write(dir.path().join(format!("{nickname}.key.pem")), key).unwrap();
        }
        fs::write(dir.path().join("README"), "ignored").unwrap();

        let store = CredentialStore::load_dir(dir.path(), &default_provider()).unwrap();
        let nicknames: Vec<_> = store.nicknames().collect();
        assert_eq!(nicknames, ["AdminCert", "UserCert", "zeta"]);
    }

    #[test]
    fn load_dir_requires_a_key_for_each_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = generate_pem("client.test");
        fs::write(dir.path().join("AdminCert.pem"), cert).unwrap();

        let err = CredentialStore::load_dir(dir.path(), &default_provider()).unwrap_err();
        assert!(matches!(err, CredentialError::Read { .. }));
    }

    #[test]
    fn root_store_requires_certificates() {
        let mut empty = tempfile::NamedTempFile::new().unwrap();
        writeln!(empty, "no pem blocks here").unwrap();
        let err = load_root_store(empty.path()).unwrap_err();
        assert!(matches!(err, CredentialError::NoCertificates(_)));

        let err = load_root_store("/nonexistent/root-ca.pem").unwrap_err();
        assert!(matches!(err, CredentialError::Read { .. }));
    }

    #[test]
    fn root_store_loads_ca_certificate() {
        let (cert, _) = generate_pem("ca.test");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(cert.as_bytes()).unwrap();
        let roots = load_root_store(file.path()).unwrap();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn resolver_presents_selected_credential() {
        let store = Arc::new(store_with(&["usercert", "adminCERT"]));
        let expected = Arc::clone(store.get("adminCERT").unwrap());
        let resolver = NicknameCertResolver::new(
            store,
            ClientCertSelector::new(Some("AdminCert".into())),
        );

        let resolved = resolver.resolve(&[], ECDSA_SCHEMES).unwrap();
        assert!(Arc::ptr_eq(&resolved, &expected));
        assert!(resolver.has_certs());
    }

    #[test]
    fn resolver_declines_when_nothing_matches() {
        let store = Arc::new(store_with(&["UserCert"]));
        let resolver = NicknameCertResolver::new(
            Arc::clone(&store),
            ClientCertSelector::new(Some("AdminCert".into())),
        );
        assert!(resolver.resolve(&[], ECDSA_SCHEMES).is_none());

        let resolver = NicknameCertResolver::new(store, ClientCertSelector::none());
        assert!(resolver.resolve(&[], ECDSA_SCHEMES).is_none());
    }
}
