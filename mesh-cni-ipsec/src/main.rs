use std::fs::File;
use std::io::BufReader;

use anyhow::Context;
use clap::Parser;
use mesh_cni_ipsec::config::{AgentArgs, Cli, Commands, DeleteArgs, KeyArgs, UpsertArgs};
use mesh_cni_ipsec::xfrm::iproute::IpXfrm;
use mesh_cni_ipsec::{Ipsec, KeyRegistry, endpoint, sysctl};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_subscriber();
    let cli = Cli::parse();
    let out = match cli.command {
        Commands::Agent(args) => agent(args).await,
        Commands::CheckKeys(args) => check_keys(&args),
        Commands::Upsert(args) => upsert(&args),
        Commands::Delete(args) => delete(&args),
    };
    exit("mesh-cni-ipsec", &out);
    out
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_cni_ipsec=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn agent(args: AgentArgs) -> anyhow::Result<()> {
    if args.enable_ipv6_forwarding {
        sysctl::enable_ipv6_forwarding(&args.proc_root)
            .context("failed to enable ipv6 forwarding")?;
    }

    let ipsec = Ipsec::try_new(IpXfrm::default(), args.to_config())?;
    let spi = ipsec
        .load_keys_from_file(&args.keys.keys_file)
        .with_context(|| format!("failed to load {}", args.keys.keys_file.display()))?;
    info!(spi, "IPsec keys loaded");

    let mut reload = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = reload.recv() => {
                info!("captured SIGHUP, reloading IPsec keys");
                match ipsec.load_keys_from_file(&args.keys.keys_file) {
                    Ok(spi) => info!(spi, "IPsec keys reloaded"),
                    Err(e) => error!("IPsec key reload failed, keeping current keys: {e}"),
                }
            }
        }
    }

    ipsec.shutdown().await;
    Ok(())
}

fn load_registry(args: &KeyArgs) -> anyhow::Result<KeyRegistry> {
    let config = args.to_config();
    config.validate()?;
    let file = File::open(&args.keys_file)
        .with_context(|| format!("failed to open {}", args.keys_file.display()))?;
    let registry = KeyRegistry::default();
    registry.load(BufReader::new(file), config.max_key_version)?;
    Ok(registry)
}

fn check_keys(args: &KeyArgs) -> anyhow::Result<()> {
    let registry = load_registry(args)?;
    info!(
        scopes = registry.len(),
        versions = ?registry.active_spis(),
        "key file is valid"
    );
    Ok(())
}

fn upsert(args: &UpsertArgs) -> anyhow::Result<()> {
    let registry = load_registry(&args.keys)?;
    let spi = endpoint::upsert_endpoint(
        &IpXfrm::default(),
        &registry,
        args.local,
        args.remote,
        args.direction,
    )?;
    info!(spi, local = %args.local, remote = %args.remote, "endpoint programmed");
    Ok(())
}

fn delete(args: &DeleteArgs) -> anyhow::Result<()> {
    endpoint::delete_endpoint(&IpXfrm::default(), args.peer, args.local)?;
    info!(peer = %args.peer, "endpoint removed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl_c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured SIGTERM signal");
        },
    }
}

fn exit(task: &str, out: &anyhow::Result<()>) {
    match out {
        Ok(_) => info!("{task} exited"),
        Err(e) => error!("{task} failed with error: {e:#}"),
    }
}
