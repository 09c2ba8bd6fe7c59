use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dirconn_common::config::ServerCertPath;
use dirconn_server::{pki::TestPki, ClientAuthPolicy, EndpointOptions, TlsEndpoint};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dirconn-server")]
#[command(about = "TLS test endpoint for directory connections")]
struct Args {
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a throwaway CA, server certificate and nicknamed client
    /// credentials
    InitPki {
        /// Output directory
        dir: PathBuf,

        /// Names the server certificate is valid for
        #[arg(
            long = "server-name",
            default_values_t = ["localhost".to_string(), "127.0.0.1".to_string()]
        )]
        server_names: Vec<String>,

        /// Nickname of a client credential to issue (repeatable)
        #[arg(short, long = "nickname")]
        nicknames: Vec<String>,
    },
    /// Run the endpoint and log every handshake
    Serve {
        /// Directory written by init-pki (defaults to DIRCONN_CERTS_DIR)
        #[arg(long)]
        certs_dir: Option<PathBuf>,

        #[arg(short, long, default_value = "127.0.0.1:6360")]
        bind: String,

        #[arg(long, value_enum, default_value_t = ClientAuthPolicy::Optional)]
        client_auth: ClientAuthPolicy,

        /// Only negotiate TLS 1.2
        #[arg(long)]
        tls12_only: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    match args.command {
        Command::InitPki {
            dir,
            server_names,
            nicknames,
        } => {
            let names: Vec<&str> = server_names.iter().map(String::as_str).collect();
            let mut pki = TestPki::generate(&names).context("Failed to generate PKI")?;
            for nickname in &nicknames {
                let credential = pki.issue_client(nickname)?;
                tracing::info!(
                    nickname = nickname.as_str(),
                    sha256 = %credential.sha256_hex(),
                    "Issued client credential"
                );
            }
            pki.write_to(&dir)?;
        }
        Command::Serve {
            certs_dir,
            bind,
            client_auth,
            tls12_only,
        } => {
            let paths = match certs_dir {
                Some(dir) => ServerCertPath::in_dir(dir),
                None => ServerCertPath::default(),
            };
            let options = EndpointOptions {
                client_auth,
                tls12_only,
            };
            let endpoint = TlsEndpoint::new(&paths, options)
                .context("Failed to create endpoint")?
                .spawn(&bind)?;

            for record in endpoint.records().iter() {
                match &record.error {
                    None => tracing::info!(
                        peer = %record.peer_addr,
                        version = ?record.protocol_version,
                        client_cert = record.client_cert_sha256.as_deref().unwrap_or("none"),
                        "Connection served"
                    ),
                    Some(e) => {
                        tracing::warn!(peer = %record.peer_addr, "Handshake rejected: {}", e)
                    }
                }
            }
        }
    }

    Ok(())
}
