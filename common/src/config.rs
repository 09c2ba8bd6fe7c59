use std::{env, fs, path::{Path, PathBuf}, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

const CERTS_DIR_ENV: &str = "DIRCONN_CERTS_DIR";
const DEFAULT_CERTS_DIR: &str = "certs";

// Server material and nickname credentials live in separate subdirectories
const SERVER_CERTS_SUBDIR: &str = "server";
const CLIENT_CERTS_SUBDIR: &str = "nicknames";

const SECURE_ENV: &str = "DIRCONN_SECURE";
const NICKNAME_ENV: &str = "DIRCONN_CLIENT_AUTH_NICKNAME";
const KEEPALIVE_ENV: &str = "DIRCONN_TCP_KEEPALIVE";
const CA_PATH_ENV: &str = "DIRCONN_CA_PATH";

/// Default timeout for establishing the TCP connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default read/write timeout while the TLS handshake is in progress
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

fn get_certs_dir() -> PathBuf {
    let dir = env::var(CERTS_DIR_ENV).unwrap_or(DEFAULT_CERTS_DIR.to_string());
    PathBuf::from(dir)
}

/// Server certificate paths used by the test endpoint
#[derive(Debug, Clone)]
pub struct ServerCertPath {
    /// Path to the server certificate file
    pub cert_path: PathBuf,
    /// Path to the server private key file
    pub key_path:  PathBuf,
    /// Path to the certificate authority file
    pub ca_path:   PathBuf,
}

impl ServerCertPath {
    /// Default server locations below `base`.
    pub fn in_dir<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        let server = base.join(SERVER_CERTS_SUBDIR);
        Self {
            cert_path: server.join("server.pem"),
            key_path:  server.join("server.key.pem"),
            ca_path:   base.join("root-ca.pem"),
        }
    }
}

impl Default for ServerCertPath {
    fn default() -> Self {
        Self::in_dir(get_certs_dir())
    }
}

/// Client-side trust anchors and nickname credential store locations
#[derive(Debug, Clone)]
pub struct CertDbPath {
    /// Path to the certificate authority file
    pub ca_path:     PathBuf,
    /// Directory holding `<nickname>.pem` / `<nickname>.key.pem` pairs
    pub cert_db_dir: PathBuf,
}

impl CertDbPath {
    /// Default client locations below `base`.
    pub fn in_dir<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        Self {
            ca_path:     base.join("root-ca.pem"),
            cert_db_dir: base.join(CLIENT_CERTS_SUBDIR),
        }
    }
}

impl Default for CertDbPath {
    fn default() -> Self {
        Self::in_dir(get_certs_dir())
    }
}

/// Settings for a socket factory.
///
/// Resolved once and handed to the factory by value; the factory never
/// changes it afterwards. The only cross-field rule is that a client auth
/// nickname requires `secure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ConnectionConfig {
    secure:               bool,
    client_auth_nickname: Option<String>,
    keep_alive_enabled:   bool,
    #[serde(rename = "connectTimeoutSecs", with = "secs")]
    connect_timeout:      Duration,
    #[serde(rename = "handshakeTimeoutSecs", with = "secs")]
    handshake_timeout:    Duration,
    ca_path:              Option<PathBuf>,
    cert_db_dir:          Option<PathBuf>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            secure:               false,
            client_auth_nickname: None,
            keep_alive_enabled:   true,
            connect_timeout:      DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout:    DEFAULT_HANDSHAKE_TIMEOUT,
            ca_path:              None,
            cert_db_dir:          None,
        }
    }
}

impl ConnectionConfig {
    /// Plain TCP connections.
    pub fn plain() -> Self {
        Self::default()
    }

    /// TLS connections without a client certificate.
    pub fn secure() -> Self {
        Self {
            secure: true,
            ..Self::default()
        }
    }

    /// TLS connections presenting the certificate stored under `nickname`.
    pub fn client_auth<S: Into<String>>(nickname: S) -> Self {
        Self {
            secure: true,
            client_auth_nickname: Some(nickname.into()),
            ..Self::default()
        }
    }

    /// Read settings from `DIRCONN_*` environment variables.
    ///
    /// Unset variables fall back to defaults; the trust anchor and credential
    /// store locations follow the `DIRCONN_CERTS_DIR` layout.
    pub fn from_env() -> Result<Self, ConnectError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConnectError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let paths = CertDbPath::default();
        let secure = parse_bool(SECURE_ENV, lookup(SECURE_ENV), false)?;
        let keep_alive_enabled = parse_bool(KEEPALIVE_ENV, lookup(KEEPALIVE_ENV), true)?;
        let client_auth_nickname = lookup(NICKNAME_ENV)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let ca_path = lookup(CA_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or(paths.ca_path);

        let config = Self {
            secure,
            client_auth_nickname,
            keep_alive_enabled,
            ca_path: Some(ca_path),
            cert_db_dir: Some(paths.cert_db_dir),
            ..Self::default()
        };
        config.validate()?;

        tracing::debug!(
            secure = config.secure,
            keep_alive = config.keep_alive_enabled,
            nickname = ?config.client_auth_nickname,
            "Loaded connection configuration from environment"
        );
        Ok(config)
    }

    /// Load settings from a JSON document with camelCase keys.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConnectError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            ConnectError::configuration(format!("unable to read {path:?}: {e}"))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ConnectError::configuration(format!("unable to parse {path:?}: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Enable or disable TLS
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Set the nickname of the client certificate to present
    pub fn with_client_auth_nickname<S: Into<String>>(mut self, nickname: S) -> Self {
        self.client_auth_nickname = Some(nickname.into());
        self
    }

    /// Enable or disable TCP keepalive on returned sockets
    pub fn with_keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive_enabled = enabled;
        self
    }

    /// Set the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read/write timeout used while the handshake runs
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the PEM file holding trusted CA certificates
    pub fn with_ca_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    /// Set the nickname credential store directory
    pub fn with_cert_db_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.cert_db_dir = Some(dir.into());
        self
    }

    /// Use the trust anchors and credential store of a [`CertDbPath`]
    pub fn with_cert_db_path(self, paths: CertDbPath) -> Self {
        self.with_ca_path(paths.ca_path)
            .with_cert_db_dir(paths.cert_db_dir)
    }

    /// Check the cross-field rules.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if let Some(nickname) = &self.client_auth_nickname {
            if !self.secure {
                return Err(ConnectError::configuration(format!(
                    "client auth nickname '{nickname}' requires a secure connection"
                )));
            }
            if nickname.trim().is_empty() {
                return Err(ConnectError::configuration(
                    "client auth nickname must not be empty",
                ));
            }
        }
        if self.connect_timeout.is_zero() {
            return Err(ConnectError::configuration("connect timeout must be non-zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConnectError::configuration(
                "handshake timeout must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn client_auth_nickname(&self) -> Option<&str> {
        self.client_auth_nickname.as_deref()
    }

    pub fn keep_alive_enabled(&self) -> bool {
        self.keep_alive_enabled
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn ca_path(&self) -> Option<&Path> {
        self.ca_path.as_deref()
    }

    pub fn cert_db_dir(&self) -> Option<&Path> {
        self.cert_db_dir.as_deref()
    }
}

fn parse_bool(key: &str, value: Option<String>, default: bool) -> Result<bool, ConnectError> {
    let Some(value) = value else {
        return Ok(default);
    };
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConnectError::configuration(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_plain_with_keepalive() {
        let config = ConnectionConfig::default();
        assert!(!config.is_secure());
        assert!(config.keep_alive_enabled());
        assert_eq!(config.client_auth_nickname(), None);
        assert_eq!(config.connect_timeout(), DEFAULT_CONNECT_TIMEOUT);
    }

    #[test]
    fn client_auth_implies_secure() {
        let config = ConnectionConfig::client_auth("AdminCert");
        assert!(config.is_secure());
        assert_eq!(config.client_auth_nickname(), Some("AdminCert"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn nickname_without_secure_is_rejected() {
        let config = ConnectionConfig::plain().with_client_auth_nickname("AdminCert");
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn blank_nickname_is_rejected() {
        let config = ConnectionConfig::secure().with_client_auth_nickname("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let config = ConnectionConfig::plain().with_connect_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
        let config = ConnectionConfig::secure().with_handshake_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn env_lookup_reads_all_settings() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            (SECURE_ENV, "true"),
            (NICKNAME_ENV, "subsystemCert cert-pki-ca"),
            (KEEPALIVE_ENV, "false"),
            (CA_PATH_ENV, "/etc/pki/ca.pem"),
        ]))
        .unwrap();
        assert!(config.is_secure());
        assert!(!config.keep_alive_enabled());
        assert_eq!(config.client_auth_nickname(), Some("subsystemCert cert-pki-ca"));
        assert_eq!(config.ca_path(), Some(Path::new("/etc/pki/ca.pem")));
        assert!(config.cert_db_dir().is_some());
    }

    #[test]
    fn env_lookup_defaults_keepalive_to_true() {
        let config = ConnectionConfig::from_lookup(lookup(&[])).unwrap();
        assert!(!config.is_secure());
        assert!(config.keep_alive_enabled());
        assert_eq!(config.client_auth_nickname(), None);
    }

    #[test]
    fn env_lookup_rejects_unreadable_boolean() {
        let err = ConnectionConfig::from_lookup(lookup(&[(KEEPALIVE_ENV, "sometimes")]))
            .unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains(KEEPALIVE_ENV));
    }

    #[test]
    fn env_lookup_rejects_nickname_on_plain_connection() {
        let err = ConnectionConfig::from_lookup(lookup(&[(NICKNAME_ENV, "AdminCert")]))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn json_file_uses_camel_case_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "secure": true,
                "clientAuthNickname": "AdminCert",
                "keepAliveEnabled": false,
                "connectTimeoutSecs": 5,
                "caPath": "/tmp/ca.pem"
            }}"#
        )
        .unwrap();

        let config = ConnectionConfig::from_json_file(file.path()).unwrap();
        assert!(config.is_secure());
        assert!(!config.keep_alive_enabled());
        assert_eq!(config.client_auth_nickname(), Some("AdminCert"));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.handshake_timeout(), DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn json_file_errors_are_configuration_errors() {
        let err = ConnectionConfig::from_json_file("/nonexistent/dirconn.json").unwrap_err();
        assert!(err.is_configuration());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "secure": "yes" }}"#).unwrap();
        assert!(ConnectionConfig::from_json_file(file.path()).is_err());
    }

    #[test]
    fn cert_paths_follow_directory_layout() {
        let client = CertDbPath::in_dir("/srv/certs");
        assert_eq!(client.ca_path, PathBuf::from("/srv/certs/root-ca.pem"));
        assert_eq!(client.cert_db_dir, PathBuf::from("/srv/certs/nicknames"));

        let server = ServerCertPath::in_dir("/srv/certs");
        assert_eq!(server.cert_path, PathBuf::from("/srv/certs/server/server.pem"));
        assert_eq!(server.ca_path, client.ca_path);
    }
}
