//! orchd: the credential broker daemon.
//!
//! Assembles the subsystems into one process:
//! - State store (redb) with the mapping feed loaded at startup
//! - Container runtime client (Docker API or Podman CLI)
//! - Kerberos admin, build host registration, and the local CA
//! - Checkout broker + lease sweeper
//! - REST API
//!
//! # Usage
//!
//! ```text
//! orchd serve --config /etc/orch/orch.toml
//! orchd serve --listen 0.0.0.0:5000 --data-dir /mnt/data
//! orchd config --config /etc/orch/orch.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use orch_authority::{CaChainManager, CommandHostRegistrar, KadminAuthority, SigningAuthority};
use orch_broker::{CheckoutBroker, CredentialMaterializer, Sweeper};
use orch_core::OrchConfig;
use orch_core::config::RuntimeBackend;
use orch_runtime::{ContainerRuntime, DockerRuntime, IdentityResolver, PodmanRuntime};
use orch_state::StateStore;

#[derive(Parser)]
#[command(name = "orchd", about = "Container-identity credential broker")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broker service.
    Serve {
        /// Path to orch.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on (overrides `server.listen`).
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Data directory (overrides `storage.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            run_serve(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,orchd=debug,orch=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<OrchConfig> {
    let mut config = match path {
        Some(path) => OrchConfig::from_file(path)?,
        None => OrchConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

fn connect_runtime(config: &OrchConfig) -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    let runtime = &config.runtime;
    let client: Arc<dyn ContainerRuntime> = match runtime.backend {
        RuntimeBackend::Docker => Arc::new(
            DockerRuntime::connect(&runtime.socket, runtime.timeout_secs)
                .context("connecting to the docker engine")?,
        ),
        RuntimeBackend::Podman => {
            Arc::new(PodmanRuntime::new(&runtime.podman_bin, runtime.timeout_secs))
        }
    };
    Ok(client)
}

async fn run_serve(config: OrchConfig) -> anyhow::Result<()> {
    info!("orch broker starting");

    // ── Storage ────────────────────────────────────────────────

    let storage = &config.storage;
    std::fs::create_dir_all(&storage.data_dir)
        .with_context(|| format!("creating {}", storage.data_dir.display()))?;
    let store = StateStore::open(&storage.db_path())?;
    info!(path = ?storage.db_path(), "state store opened");

    match orch_core::load_mapping_feed(&storage.mapping_file) {
        Ok(mappings) => {
            store.load_mappings(&mappings)?;
            info!(count = mappings.len(), file = %storage.mapping_file.display(), "mapping feed loaded");
        }
        Err(e) => {
            // Mappings from a previous run stay usable.
            warn!(error = %e, "mapping feed not loaded");
        }
    }

    // ── Runtime ────────────────────────────────────────────────

    let runtime = connect_runtime(&config)?;
    match runtime.ping().await {
        Ok(()) => info!(backend = runtime.name(), "container runtime reachable"),
        Err(e) => warn!(backend = runtime.name(), error = %e, "container runtime not reachable yet"),
    }
    let resolver = Arc::new(IdentityResolver::new(runtime)?);

    // ── Authorities ────────────────────────────────────────────

    let signing = Arc::new(CaChainManager::new(
        storage.ca_dir(),
        storage.certs_dir(),
        config.certificates.clone(),
    ));
    if signing.bootstrap().await? {
        info!(path = %signing.root_certificate_path().display(), "root CA created");
    }
    let materializer = Arc::new(CredentialMaterializer::new(
        Arc::new(KadminAuthority::new(&config.kerberos)),
        Arc::new(CommandHostRegistrar::new(&config.hosts)),
        signing,
        storage.keytabs_dir(),
    ));

    // ── Broker + sweeper ───────────────────────────────────────

    let broker = Arc::new(CheckoutBroker::new(store, resolver, materializer));
    let sweeper = Arc::new(Sweeper::new(broker.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_interval = Duration::from_secs(config.sweep.interval_secs.max(1));
    let sweep_task = sweeper.clone();
    let sweep_handle = tokio::spawn(async move {
        sweep_task.run(sweep_interval, shutdown_rx).await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = orch_api::build_router(orch_api::ServiceContext::new(broker, sweeper));
    let addr = config.server.listen;
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;
    let _ = sweep_handle.await;

    info!("orch broker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c, shutting down");
    }
}
