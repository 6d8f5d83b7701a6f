use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use edgecert::acme::{HttpStep, LogPublisher};
use edgecert::config::{AcmeRegistry, DEFAULT_CONFIG_PATH, Settings};
use edgecert::store::{self, CertStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "EDGECERT_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Renew a certificate through its bound ACME configuration
    Renew {
        /// Name of the certificate in the store
        certname: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(Some(cli.config))?;
    let registry = AcmeRegistry::from_settings(&settings)?;

    let cert_store = Arc::new(CertStore::new());
    for section in &settings.certificates {
        let entry = store::load_entry(
            &section.name,
            &section.cert,
            &section.key,
            section.domains.clone(),
            section.acme.clone(),
        )?;
        cert_store.insert(entry)?;
        for listener in &section.listeners {
            cert_store.bind(&section.name, listener)?;
        }
    }

    match cli.command {
        Command::Renew { certname } => {
            let handle = edgecert::spawn_renewal(
                cert_store.clone(),
                &registry,
                HttpStep::new()?,
                Arc::new(LogPublisher),
                &certname,
            )?;
            handle.await.context("renewal task panicked")??;

            let entry = cert_store.entry(&certname)?;
            store::persist_entry(&entry)?;
            info!(cert = %certname, "renewal finished");
        }
    }
    Ok(())
}
