use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::CertificateSource;
use crate::reconciler;
use crate::secret::SecretStore;
use crate::types::{EventKind, ResourceEvent, ResourceId};

/// Capacity of each per-resource forwarding channel.
const FORWARD_CAPACITY: usize = 16;

/// Collaborators handed to every reconciliation agent.
pub struct ReconcilerContext {
    pub source: Arc<dyn CertificateSource>,
    pub secrets: Arc<dyn SecretStore>,
}

/// Routes resource events to one reconciliation agent per resource identity.
/// Agents are started on first sight and torn down by closing their channel;
/// the dispatcher exits once the event stream ends, closing every remaining
/// channel on the way out.
pub async fn run_dispatcher(mut events: mpsc::Receiver<ResourceEvent>, ctx: Arc<ReconcilerContext>) {
    let mut agents: HashMap<ResourceId, mpsc::Sender<ResourceEvent>> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::channel::<ResourceId>(FORWARD_CAPACITY);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => handle_event(event, &mut agents, &done_tx, &ctx).await,
                None => break,
            },
            Some(id) = done_rx.recv() => {
                agents.remove(&id);
                tracing::info!(resource = %id, "reconciliation agent deregistered");
            }
        }
    }

    tracing::info!("dispatcher shutting down");
    // Dropping the map closes every forwarding channel; agents clean up on
    // their own from there.
}

async fn handle_event(
    event: ResourceEvent,
    agents: &mut HashMap<ResourceId, mpsc::Sender<ResourceEvent>>,
    done_tx: &mpsc::Sender<ResourceId>,
    ctx: &Arc<ReconcilerContext>,
) {
    match event.kind {
        EventKind::Delete => {
            // Dropping the sender is the agent's termination signal. Deletes
            // for resources nobody tracks are a no-op.
            if agents.remove(&event.id).is_some() {
                tracing::info!(resource = %event.id, "resource deleted, shutting down its agent");
            }
        }
        EventKind::Create | EventKind::Update => {
            let sender = agents.entry(event.id.clone()).or_insert_with(|| {
                tracing::info!(resource = %event.id, "starting reconciliation agent");
                let (forward_tx, forward_rx) = mpsc::channel(FORWARD_CAPACITY);
                tokio::spawn(reconciler::run_reconciler(
                    event.id.clone(),
                    forward_rx,
                    ctx.clone(),
                    done_tx.clone(),
                ));
                forward_tx
            });

            tracing::debug!(resource = %event.id, kind = ?event.kind, "forwarding event");
            if sender.send(event.clone()).await.is_err() {
                // The agent exited but its termination signal has not been
                // processed yet; drop the stale entry so the next event
                // starts a fresh agent.
                tracing::warn!(resource = %event.id, "agent channel closed, dropping event");
                agents.remove(&event.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eventually, FakeCertSource, FakeSecretStore, SecretOp};
    use crate::types::TlsSpec;

    struct Harness {
        source: Arc<FakeCertSource>,
        secrets: Arc<FakeSecretStore>,
        events: mpsc::Sender<ResourceEvent>,
    }

    fn start_dispatcher() -> Harness {
        let source = Arc::new(FakeCertSource::default());
        let secrets = Arc::new(FakeSecretStore::default());
        let ctx = Arc::new(ReconcilerContext {
            source: source.clone(),
            secrets: secrets.clone(),
        });
        let (event_tx, event_rx) = mpsc::channel(16);
        tokio::spawn(run_dispatcher(event_rx, ctx));
        Harness {
            source,
            secrets,
            events: event_tx,
        }
    }

    fn id(name: &str) -> ResourceId {
        ResourceId {
            namespace: "default".to_string(),
            name: name.to_string(),
        }
    }

    fn event(kind: EventKind, name: &str) -> ResourceEvent {
        ResourceEvent {
            kind,
            id: id(name),
            spec: TlsSpec {
                issuer_path: Some("pki/issue/web".to_string()),
                domain: Some(format!("{name}.example.com")),
                secret_name: Some(format!("{name}-tls")),
            },
        }
    }

    #[tokio::test]
    async fn test_events_for_same_identity_share_one_agent() {
        let harness = start_dispatcher();

        harness
            .events
            .send(event(EventKind::Create, "web"))
            .await
            .unwrap();
        harness
            .events
            .send(event(EventKind::Update, "web"))
            .await
            .unwrap();

        eventually(|| harness.source.subscribe_count() == 1, "single subscription").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(harness.source.subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_for_unknown_identity_is_noop() {
        let harness = start_dispatcher();

        harness
            .events
            .send(event(EventKind::Delete, "ghost"))
            .await
            .unwrap();

        // The dispatcher stays healthy and no agent was ever spawned.
        harness
            .events
            .send(event(EventKind::Create, "web"))
            .await
            .unwrap();
        eventually(|| harness.source.subscribe_count() == 1, "agent for web").await;
        assert!(harness
            .source
            .subscribed
            .lock()
            .unwrap()
            .iter()
            .all(|key| key.domain == "web.example.com"));
    }

    #[tokio::test]
    async fn test_delete_tears_agent_down_and_recreate_starts_fresh() {
        let harness = start_dispatcher();

        harness
            .events
            .send(event(EventKind::Create, "web"))
            .await
            .unwrap();
        eventually(|| harness.source.subscribe_count() == 1, "first agent").await;

        harness
            .events
            .send(event(EventKind::Delete, "web"))
            .await
            .unwrap();
        eventually(|| harness.source.cancel_count() == 1, "subscription cancelled").await;
        eventually(
            || {
                harness.secrets.ops().last()
                    == Some(&SecretOp::Delete {
                        namespace: "default".to_string(),
                        name: "web-tls".to_string(),
                    })
            },
            "secret deleted on teardown",
        )
        .await;

        harness
            .events
            .send(event(EventKind::Create, "web"))
            .await
            .unwrap();
        eventually(|| harness.source.subscribe_count() == 2, "fresh agent").await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_agents() {
        let harness = start_dispatcher();

        harness
            .events
            .send(event(EventKind::Create, "web"))
            .await
            .unwrap();
        harness
            .events
            .send(event(EventKind::Create, "api"))
            .await
            .unwrap();
        eventually(|| harness.source.subscribe_count() == 2, "two agents").await;

        drop(harness.events);

        eventually(|| harness.source.cancel_count() == 2, "both agents cleaned up").await;
    }
}
