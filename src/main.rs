//! Snitcher proxy - embedder CLI around the proxy core
//!
//! The core library has no CLI of its own; this binary wires it together:
//! it loads options, opens (or creates) the CA, runs the proxy, and tails
//! captured flows to the log as JSON lines.
//!
//! ## Usage
//!
//! ```bash
//! snitcher-proxy run
//! # Then point clients at it:
//! export HTTP_PROXY=http://127.0.0.1:8899
//! export HTTPS_PROXY=http://127.0.0.1:8899
//! ```
//!
//! HTTPS interception requires the root CA to be trusted:
//!
//! ```bash
//! snitcher-proxy trust          # install into the OS trust store
//! snitcher-proxy export-ca ca.pem   # or export for manual installation
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snitcher_proxy::{
    CaError, CaStorage, CertificateAuthority, FlowEvent, FlowStore, FsCaStorage,
    InterceptorPipeline, NativeTrustStore, ProxyOptions, ProxyServer, TracingLogger,
};
use tracing_subscriber::EnvFilter;

/// Canonical default password for the CA container. The core requires the
/// embedder to pick one; override with --ca-password or the env var.
const DEFAULT_CA_PASSWORD: &str = "snitcher-ca";

#[derive(Parser, Debug)]
#[command(name = "snitcher-proxy")]
#[command(about = "Intercepting HTTPS proxy", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Password for the CA container
    #[arg(long, env = "SNITCHER_CA_PASSWORD", default_value = DEFAULT_CA_PASSWORD, global = true)]
    ca_password: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy (default)
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// Tunnel CONNECT traffic blindly instead of intercepting TLS
        #[arg(long)]
        no_intercept: bool,
    },
    /// Install the root CA into the OS trust store
    Trust,
    /// Write the root CA certificate PEM to a file
    ExportCa {
        /// Output path
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run {
        config: None,
        port: None,
        no_intercept: false,
    }) {
        Commands::Run {
            config,
            port,
            no_intercept,
        } => run(config, port, no_intercept, &cli.ca_password).await,
        Commands::Trust => trust(&cli.ca_password).await,
        Commands::ExportCa { out } => export_ca(&out, &cli.ca_password).await,
    }
}

fn load_options(config: Option<PathBuf>) -> Result<ProxyOptions> {
    match config {
        Some(path) => ProxyOptions::from_file(path),
        None => Ok(ProxyOptions::from_env()),
    }
}

fn open_ca(options: &ProxyOptions) -> Arc<CertificateAuthority> {
    let storage: Arc<dyn CaStorage> = Arc::new(FsCaStorage::new(&options.tls.state_dir));
    Arc::new(CertificateAuthority::new(
        storage,
        Arc::new(NativeTrustStore),
    ))
}

async fn run(
    config: Option<PathBuf>,
    port: Option<u16>,
    no_intercept: bool,
    ca_password: &str,
) -> Result<()> {
    let mut options = load_options(config)?;
    if let Some(port) = port {
        options.listen_port = port;
    }
    if no_intercept {
        options.intercept_https = false;
    }

    let ca = open_ca(&options);
    ca.get_or_create_root(ca_password)
        .await
        .context("Failed to load or create the root CA")?;

    if options.intercept_https && !ca.is_root_trusted().unwrap_or(false) {
        tracing::warn!("the root CA is not in the OS trust store; HTTPS clients will warn");
        tracing::warn!("  run `snitcher-proxy trust`, or export it with `snitcher-proxy export-ca`");
    }

    let flows = Arc::new(FlowStore::new(
        options.flow_capacity,
        options.subscriber_queue,
    ));
    let server = ProxyServer::new(
        options,
        ca,
        flows,
        InterceptorPipeline::new(),
        Arc::new(TracingLogger),
    )?;

    let addr = server.start().await?;
    tracing::info!("set HTTP_PROXY/HTTPS_PROXY to http://{addr}");

    // Tail flows as JSON lines until interrupted.
    let mut events = server.flow_events();
    let tail = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                FlowEvent::Appended(flow) => match serde_json::to_string(&flow) {
                    Ok(json) => println!("{json}"),
                    Err(err) => tracing::warn!("failed to serialize flow: {err}"),
                },
                FlowEvent::Dropped(count) => {
                    tracing::warn!("flow tail fell behind; {count} events dropped");
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for ctrl-c")?;
    tracing::info!("shutting down");
    server.stop().await;
    server.flows().close();
    let _ = tail.await;
    Ok(())
}

async fn trust(ca_password: &str) -> Result<()> {
    let options = ProxyOptions::from_env();
    let ca = open_ca(&options);
    match ca.install_root(ca_password).await {
        Ok(()) => {
            tracing::info!("root CA installed into the current user's trust store");
            Ok(())
        }
        Err(CaError::TrustStoreUnsupported) => {
            let pem_hint = options.tls.state_dir.join("ca.pem");
            tracing::error!("no OS trust store on this platform; export and install manually:");
            tracing::error!("  snitcher-proxy export-ca {}", pem_hint.display());
            tracing::error!("  sudo cp {} /usr/local/share/ca-certificates/snitcher.crt && sudo update-ca-certificates", pem_hint.display());
            anyhow::bail!("trust store unsupported")
        }
        Err(err) => Err(err).context("Failed to install the root CA"),
    }
}

async fn export_ca(out: &PathBuf, ca_password: &str) -> Result<()> {
    let options = ProxyOptions::from_env();
    let ca = open_ca(&options);
    ca.get_or_create_root(ca_password)
        .await
        .context("Failed to load or create the root CA")?;
    let pem = ca.root_certificate_pem()?;
    std::fs::write(out, pem).with_context(|| format!("Failed to write {}", out.display()))?;
    tracing::info!("root CA certificate written to {}", out.display());
    Ok(())
}
