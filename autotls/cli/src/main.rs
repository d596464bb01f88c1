use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use autotls::AutotlsConfig;
use clap::Parser;
use documented::DocumentedFields;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const HELLO: &[u8] = b"HTTP/1.1 200 OK\r\n\
connection: close\r\n\
content-type: text/plain\r\n\
content-length: 12\r\n\
\r\n\
Hello, TLS!\n";

#[derive(Parser)]
enum Command {
    /// Serve TLS with automatically provisioned certificates
    Serve {
        /// Path to the configuration file
        #[arg(short, long, default_value = "autotls.toml")]
        config: PathBuf,
    },
    /// Provision the cache, default certificate and ACME account
    Init {
        /// Path to the configuration file
        #[arg(short, long, default_value = "autotls.toml")]
        config: PathBuf,
    },
    /// Generate configuration template
    Cfg {
        /// Write to file
        #[arg(short, long)]
        write_to: Option<PathBuf>,
    },
}

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Deserialize, Serialize, DocumentedFields)]
struct Config {
    /// Path to the certificate cache directory
    cache_dir: PathBuf,
    /// Address to listen on
    listen: String,
    /// ACME server URL
    acme_url: String,
    /// Domains to provision certificates for
    domains: Vec<String>,
    /// Accept the CA's terms of service
    accept_tos: bool,
    /// TLS handshake timeout in seconds
    handshake_timeout: u64,
    /// Contact URL for the CA account, e.g. "mailto:admin@example.com"
    #[serde(default)]
    contact: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: "./autotls-cache".into(),
            listen: "0.0.0.0:443".into(),
            acme_url: "https://acme-staging-v02.api.letsencrypt.org/directory".into(),
            domains: vec!["example.com".into()],
            accept_tos: false,
            handshake_timeout: 10,
            contact: None,
        }
    }
}

impl Config {
    fn to_commented_toml(&self) -> Result<String> {
        let mut doc = toml_edit::ser::to_document(self)?;

        for (i, (mut key, _value)) in doc.iter_mut().enumerate() {
            let decor = key.leaf_decor_mut();
            let docstring = Self::FIELD_DOCS[i].unwrap_or_default();

            let mut comment = String::new();
            for line in docstring.lines() {
                let line = if line.is_empty() {
                    String::from("#\n")
                } else {
                    format!("# {line}\n")
                };
                comment.push_str(&line);
            }
            decor.set_prefix(comment);
        }
        Ok(doc.to_string())
    }
}

fn load_config(config: &PathBuf) -> Result<(Config, AutotlsConfig)> {
    let config: Config = toml_edit::de::from_str(&fs::read_to_string(config)?)?;
    let engine = AutotlsConfig::builder()
        .acme_url(config.acme_url.clone())
        .cache_dir(config.cache_dir.clone())
        .domains(config.domains.clone())
        .maybe_contact(config.contact.clone())
        .accept_tos(config.accept_tos)
        .handshake_timeout(Duration::from_secs(config.handshake_timeout))
        .build();
    Ok((config, engine))
}

async fn handle(mut stream: impl AsyncRead + AsyncWrite + Unpin) -> Result<()> {
    // Drain the request head, then answer with the demo page.
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await;
    stream.write_all(HELLO).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn serve(config: &PathBuf) -> Result<()> {
    let (config, engine) = load_config(config).context("Failed to load configuration")?;
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let tls = engine
        .wrap(listener)
        .await
        .context("Failed to wrap listener")?;
    loop {
        match tls.accept().await {
            Ok((stream, peer)) => {
                debug!("connection from {peer}");
                tokio::spawn(async move {
                    if let Err(err) = handle(stream).await {
                        debug!("connection error: {err:#}");
                    }
                });
            }
            Err(err) => {
                error!("failed to accept connection: {err:#}");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install default crypto provider");

    let args = Args::parse();
    match args.command {
        Command::Serve { config } => {
            serve(&config).await?;
        }
        Command::Init { config } => {
            let (_, engine) = load_config(&config).context("Failed to load configuration")?;
            engine
                .provision()
                .await
                .context("Failed to provision certificates")?;
            info!("initialized");
        }
        Command::Cfg { write_to } => {
            let toml_str = Config::default().to_commented_toml()?;
            match write_to {
                Some(path) => fs::write(path, toml_str)?,
                None => println!("{}", toml_str),
            }
        }
    }
    Ok(())
}
