use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use futures_util::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Api;
use stopper::Stopper;
use tokio::sync::mpsc;

use certwatch::broker::Broker;
use certwatch::config::ControllerConfig;
use certwatch::dispatcher::{self, ReconcilerContext};
use certwatch::leader_election::LeaderLease;
use certwatch::pki::VaultPki;
use certwatch::secret::KubeSecretStore;
use certwatch::watch;

#[derive(Parser)]
#[command(about = "Keeps Ingress TLS secrets in sync with Vault-issued certificates")]
struct Args {
    /// Namespace to watch; watches all namespaces when omitted
    #[arg(long)]
    namespace: Option<String>,
}

/// Generate future that awaits shutdown signal
async fn shutdown_signal(stopper: Stopper) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("terminate signal received");
    stopper.stop();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = ControllerConfig::try_from_env()?;
    let kube_config = kube::Config::infer().await?;
    let default_namespace = kube_config.default_namespace.clone();
    let client: kube::Client = kube_config.try_into()?;

    // Prepare shutdown signal future
    let stopper = Stopper::new();
    tokio::spawn(shutdown_signal(stopper.clone()));

    // Leader election
    tracing::info!("attempting to acquire leader lease...");
    let hostname = hostname::get()?;
    let hostname = hostname.to_string_lossy();
    let lease_fut = LeaderLease::acquire(
        client.clone(),
        &default_namespace,
        "certwatch.devsisters.com",
        &hostname,
    );
    let lease = match stopper.stop_future(lease_fut).await {
        Some(lease) => lease?,
        // Early exit when shutdown signal is received
        None => return Ok(()),
    };
    tracing::info!("acquired lease");

    // Wire the certificate broker and the dispatcher
    let issuer = Arc::new(VaultPki::new(
        config.vault_addr.clone(),
        config.vault_token.clone(),
    )?);
    let source = Broker::spawn(issuer);
    let ctx = Arc::new(ReconcilerContext {
        source: Arc::new(source),
        secrets: Arc::new(KubeSecretStore::new(client.clone())),
    });

    let ingress_api = match &args.namespace {
        Some(namespace) => Api::<Ingress>::namespaced(client, namespace),
        None => Api::<Ingress>::all(client),
    };

    let (event_tx, event_rx) = mpsc::channel(64);
    let dispatcher_handle = tokio::spawn(dispatcher::run_dispatcher(event_rx, ctx));
    tracing::info!("spawned dispatcher");

    // Forward watch events until shutdown. Dropping the sender afterwards
    // shuts the dispatcher and its agents down.
    let mut events = watch::resource_events(ingress_api).boxed();
    while let Some(Some(event)) = stopper.stop_future(events.next()).await {
        if event_tx.send(event).await.is_err() {
            break;
        }
    }
    drop(event_tx);
    drop(events);

    dispatcher_handle.await?;
    tracing::info!("dispatcher terminated");

    tracing::info!("releasing lease...");
    lease.release().await?;
    tracing::info!("lease released");

    Ok(())
}
