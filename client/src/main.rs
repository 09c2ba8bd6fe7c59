use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use dirconn_client::{CertDbPath, ConnectionConfig, SocketFactory};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dirconn-probe")]
#[command(about = "Open one connection the way the directory client would and report on it")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Host to connect to
    host: String,

    /// Port to connect to
    #[arg(default_value_t = 636)]
    port: u16,

    /// Load settings from a JSON file instead of the flags below
    #[arg(long, conflicts_with_all = ["secure", "nickname", "no_keepalive", "certs_dir"])]
    config: Option<PathBuf>,

    /// Use TLS
    #[arg(short, long)]
    secure: bool,

    /// Nickname of the client certificate to present (implies --secure)
    #[arg(short, long)]
    nickname: Option<String>,

    /// Disable TCP keepalive
    #[arg(long)]
    no_keepalive: bool,

    /// Directory holding root-ca.pem and the nicknames/ credential store
    #[arg(long)]
    certs_dir: Option<PathBuf>,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

impl Args {
    fn connection_config(&self) -> Result<ConnectionConfig> {
        if let Some(path) = &self.config {
            return ConnectionConfig::from_json_file(path)
                .with_context(|| format!("Failed to load configuration from {path:?}"));
        }

        let paths = match &self.certs_dir {
            Some(dir) => CertDbPath::in_dir(dir),
            None => CertDbPath::default(),
        };
        let mut config = ConnectionConfig::plain()
            .with_secure(self.secure || self.nickname.is_some())
            .with_keep_alive(!self.no_keepalive)
            .with_connect_timeout(Duration::from_secs(self.timeout))
            .with_cert_db_path(paths);
        if let Some(nickname) = &self.nickname {
            config = config.with_client_auth_nickname(nickname.as_str());
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = args.connection_config()?;
    let factory = SocketFactory::new(config).context("Failed to create socket factory")?;

    tracing::info!("Connecting to {}:{}", args.host, args.port);
    let handle = factory
        .connect(&args.host, args.port)
        .with_context(|| format!("Failed to connect to {}:{}", args.host, args.port))?;

    println!("Connection {}", handle.id());
    println!("  peer:       {}", handle.peer_addr());
    println!("  state:      {}", handle.state());
    println!("  keepalive:  {}", handle.keep_alive().context("Failed to read keepalive")?);
    if handle.is_secure() {
        let version = handle
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_else(|| "unknown".to_string());
        println!("  protocol:   {version}");
        println!(
            "  cipher:     {}",
            handle.cipher_suite().unwrap_or_else(|| "unknown".to_string())
        );
        println!("  client auth: {}", factory.is_client_auth());
    }

    handle.close().context("Failed to close connection")?;
    Ok(())
}
