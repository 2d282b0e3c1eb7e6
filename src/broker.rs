use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use stopper::Stopper;
use tokio::sync::{mpsc, oneshot};

use crate::issuance;
use crate::pki::CertificateIssuer;
use crate::types::{CertificateMaterial, IssuanceKey};

/// Capacity of each subscriber's delivery channel. Fan-out awaits every
/// subscriber in turn, so a subscriber that stops reading delays its siblings
/// for that update.
const DELIVERY_CAPACITY: usize = 1;
const UPDATE_CAPACITY: usize = 1;

/// A certificate pushed by an issuance agent. The epoch identifies which
/// agent generation produced it.
pub(crate) struct CertUpdate {
    pub(crate) key: IssuanceKey,
    pub(crate) epoch: u64,
    pub(crate) material: CertificateMaterial,
}

enum Command {
    Subscribe {
        key: IssuanceKey,
        reply: oneshot::Sender<SubscribeReply>,
    },
    Unsubscribe {
        key: IssuanceKey,
        id: u64,
    },
}

struct SubscribeReply {
    id: u64,
    updates: mpsc::Receiver<CertificateMaterial>,
}

/// A live interest in certificate updates for one issuance key. The broker
/// closes the delivery channel once the subscription is cancelled.
pub struct Subscription {
    updates: mpsc::Receiver<CertificateMaterial>,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(
        updates: mpsc::Receiver<CertificateMaterial>,
        cancel: Box<dyn FnOnce() + Send + Sync>,
    ) -> Self {
        Self {
            updates,
            cancel: Some(cancel),
        }
    }

    pub async fn recv(&mut self) -> Option<CertificateMaterial> {
        self.updates.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Capability to subscribe to certificate updates for one issuance key.
#[async_trait]
pub trait CertificateSource: Send + Sync {
    async fn subscribe(&self, key: IssuanceKey) -> Subscription;
}

#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl CertificateSource for BrokerHandle {
    async fn subscribe(&self, key: IssuanceKey) -> Subscription {
        tracing::info!(issuer_path = %key.issuer_path, domain = %key.domain, "subscribing to certificate");

        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = self.commands.send(Command::Subscribe {
            key: key.clone(),
            reply: reply_tx,
        });

        match reply_rx.await {
            Ok(reply) => {
                let commands = self.commands.clone();
                let cancel = Box::new(move || {
                    let _ = commands.send(Command::Unsubscribe { key, id: reply.id });
                });
                Subscription::new(reply.updates, cancel)
            }
            Err(_) => {
                // Only possible when the broker task is gone; hand back a
                // subscription that never delivers.
                tracing::error!(domain = %key.domain, "certificate broker is not running");
                let (_, updates) = mpsc::channel(DELIVERY_CAPACITY);
                Subscription::new(updates, Box::new(|| {}))
            }
        }
    }
}

struct AgentHandle {
    stopper: Stopper,
    epoch: u64,
}

/// Owns all subscription and certificate-cache state. Runs as a single task
/// processing one message at a time, so none of it needs locking.
pub struct Broker {
    issuer: Arc<dyn CertificateIssuer>,
    commands: mpsc::UnboundedReceiver<Command>,
    updates_rx: mpsc::Receiver<CertUpdate>,
    updates_tx: mpsc::Sender<CertUpdate>,
    known_certs: HashMap<IssuanceKey, CertificateMaterial>,
    subscriptions: HashMap<IssuanceKey, BTreeMap<u64, mpsc::Sender<CertificateMaterial>>>,
    agents: HashMap<IssuanceKey, AgentHandle>,
    next_subscription_id: u64,
    next_epoch: u64,
}

impl Broker {
    pub fn new(issuer: Arc<dyn CertificateIssuer>) -> (Self, BrokerHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CAPACITY);
        let broker = Self {
            issuer,
            commands: command_rx,
            updates_rx,
            updates_tx,
            known_certs: HashMap::new(),
            subscriptions: HashMap::new(),
            agents: HashMap::new(),
            next_subscription_id: 0,
            next_epoch: 0,
        };
        (broker, BrokerHandle { commands: command_tx })
    }

    /// Spawns the broker task and returns the cloneable handle to it.
    pub fn spawn(issuer: Arc<dyn CertificateIssuer>) -> BrokerHandle {
        let (broker, handle) = Self::new(issuer);
        tokio::spawn(broker.run());
        handle
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Subscribe { key, reply }) => self.handle_subscribe(key, reply).await,
                    Some(Command::Unsubscribe { key, id }) => self.handle_unsubscribe(key, id),
                    None => break,
                },
                Some(update) = self.updates_rx.recv() => self.handle_update(update).await,
            }
        }
        tracing::info!("certificate broker stopped");
    }

    async fn handle_subscribe(&mut self, key: IssuanceKey, reply: oneshot::Sender<SubscribeReply>) {
        if !self.subscriptions.contains_key(&key) {
            self.subscriptions.insert(key.clone(), BTreeMap::new());
            self.spawn_agent(key.clone());
        }

        self.next_subscription_id += 1;
        let id = self.next_subscription_id;
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_CAPACITY);

        if reply
            .send(SubscribeReply {
                id,
                updates: delivery_rx,
            })
            .is_err()
        {
            tracing::warn!(domain = %key.domain, "subscriber vanished before registration completed");
            self.teardown_if_unsubscribed(&key);
            return;
        }

        if let Some(material) = self.known_certs.get(&key) {
            // A fresh channel always has room, so the new subscriber sees the
            // cached value before any later update.
            let _ = delivery_tx.send(material.clone()).await;
        }

        if let Some(subscribers) = self.subscriptions.get_mut(&key) {
            subscribers.insert(id, delivery_tx);
        }
    }

    fn handle_unsubscribe(&mut self, key: IssuanceKey, id: u64) {
        let subscribers = match self.subscriptions.get_mut(&key) {
            Some(subscribers) => subscribers,
            None => {
                tracing::warn!(domain = %key.domain, id, "unsubscribe for unknown issuance key");
                return;
            }
        };

        // Dropping the sender closes the subscriber's delivery channel.
        if subscribers.remove(&id).is_none() {
            tracing::warn!(domain = %key.domain, id, "unsubscribe for unknown subscription");
            return;
        }

        self.teardown_if_unsubscribed(&key);
    }

    async fn handle_update(&mut self, update: CertUpdate) {
        let CertUpdate { key, epoch, material } = update;

        match self.agents.get(&key) {
            Some(agent) if agent.epoch == epoch => {}
            _ => {
                // A stopped agent may flush one last result before it
                // observes its stop signal.
                tracing::warn!(domain = %key.domain, epoch, "dropping certificate update from stale issuance agent");
                return;
            }
        }

        let subscribers = match self.subscriptions.get(&key) {
            Some(subscribers) => subscribers,
            None => {
                tracing::warn!(domain = %key.domain, "received certificate update without any subscriber");
                return;
            }
        };

        // Deliver sequentially in subscription order. A slow subscriber
        // delays its siblings for this update only, never unrelated keys.
        let targets: Vec<(u64, mpsc::Sender<CertificateMaterial>)> = subscribers
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();
        let mut dropped = Vec::new();
        for (id, sender) in targets {
            if sender.send(material.clone()).await.is_err() {
                tracing::warn!(domain = %key.domain, id, "subscriber dropped its delivery channel without cancelling");
                dropped.push(id);
            }
        }
        if !dropped.is_empty() {
            if let Some(subscribers) = self.subscriptions.get_mut(&key) {
                for id in dropped {
                    subscribers.remove(&id);
                }
            }
            self.teardown_if_unsubscribed(&key);
        }

        self.known_certs.insert(key, material);
    }

    fn spawn_agent(&mut self, key: IssuanceKey) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let stopper = Stopper::new();
        self.agents.insert(
            key.clone(),
            AgentHandle {
                stopper: stopper.clone(),
                epoch,
            },
        );
        tokio::spawn(issuance::run_issuance_agent(
            key,
            epoch,
            self.issuer.clone(),
            self.updates_tx.clone(),
            stopper,
        ));
    }

    /// Removes the per-key bookkeeping and stops the issuance agent once the
    /// last subscriber for the key is gone.
    fn teardown_if_unsubscribed(&mut self, key: &IssuanceKey) {
        let empty = self
            .subscriptions
            .get(key)
            .map(BTreeMap::is_empty)
            .unwrap_or(false);
        if !empty {
            return;
        }

        self.subscriptions.remove(key);
        if let Some(agent) = self.agents.remove(key) {
            agent.stopper.stop();
            tracing::info!(issuer_path = %key.issuer_path, domain = %key.domain, "last subscriber gone, stopping issuance agent");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::pki::IssueError;
    use crate::testing::{eventually, test_material};

    /// Counts issue calls and never resolves, keeping agents idle.
    #[derive(Default)]
    struct PendingIssuer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CertificateIssuer for PendingIssuer {
        async fn issue(&self, _key: &IssuanceKey) -> Result<CertificateMaterial, IssueError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// Resolves with the given material once a permit is released, then keeps
    /// further calls pending.
    struct GatedIssuer {
        gate: tokio::sync::Semaphore,
        material: CertificateMaterial,
    }

    impl GatedIssuer {
        fn new(material: CertificateMaterial) -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(0),
                material,
            }
        }
    }

    #[async_trait]
    impl CertificateIssuer for GatedIssuer {
        async fn issue(&self, _key: &IssuanceKey) -> Result<CertificateMaterial, IssueError> {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            Ok(self.material.clone())
        }
    }

    fn web_key() -> IssuanceKey {
        IssuanceKey {
            issuer_path: "pki/issue/web".to_string(),
            domain: "a.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_material_and_cache_serves_late_subscriber() {
        let material = test_material();
        let issuer = Arc::new(GatedIssuer::new(material.clone()));
        let handle = Broker::spawn(issuer.clone());

        let mut first = handle.subscribe(web_key()).await;
        issuer.gate.add_permits(1);
        assert_eq!(first.recv().await, Some(material.clone()));

        // The update is already cached, so a late subscriber sees it
        // immediately without another issuance.
        let mut second = handle.subscribe(web_key()).await;
        assert_eq!(second.recv().await, Some(material));
    }

    #[tokio::test]
    async fn test_fanout_delivers_same_material_to_all_subscribers() {
        let material = test_material();
        let issuer = Arc::new(GatedIssuer::new(material.clone()));
        let handle = Broker::spawn(issuer.clone());

        let mut first = handle.subscribe(web_key()).await;
        let mut second = handle.subscribe(web_key()).await;
        issuer.gate.add_permits(1);

        assert_eq!(first.recv().await, Some(material.clone()));
        assert_eq!(second.recv().await, Some(material));
    }

    #[tokio::test]
    async fn test_agents_are_deduplicated_per_key() {
        let issuer = Arc::new(PendingIssuer::default());
        let handle = Broker::spawn(issuer.clone());

        let _first = handle.subscribe(web_key()).await;
        let _second = handle.subscribe(web_key()).await;

        eventually(|| issuer.calls.load(Ordering::SeqCst) == 1, "first issuance attempt").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_stops_agent_and_resubscribe_starts_fresh_one() {
        let issuer = Arc::new(PendingIssuer::default());
        let handle = Broker::spawn(issuer.clone());

        let mut first = handle.subscribe(web_key()).await;
        let mut second = handle.subscribe(web_key()).await;
        eventually(|| issuer.calls.load(Ordering::SeqCst) == 1, "first issuance attempt").await;

        first.cancel();
        second.cancel();
        // Cancelling closes the delivery channel from the broker side.
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, None);

        let _third = handle.subscribe(web_key()).await;
        eventually(|| issuer.calls.load(Ordering::SeqCst) == 2, "fresh issuance agent").await;
    }

    #[tokio::test]
    async fn test_update_without_subscribers_is_dropped() {
        let (mut broker, _handle) = Broker::new(Arc::new(PendingIssuer::default()));

        // Simulate a live agent whose subscribers are already gone.
        broker.agents.insert(
            web_key(),
            AgentHandle {
                stopper: Stopper::new(),
                epoch: 1,
            },
        );
        broker
            .handle_update(CertUpdate {
                key: web_key(),
                epoch: 1,
                material: test_material(),
            })
            .await;

        assert!(broker.known_certs.is_empty());
    }

    #[tokio::test]
    async fn test_update_from_stale_agent_epoch_is_dropped() {
        let (mut broker, _handle) = Broker::new(Arc::new(PendingIssuer::default()));

        broker.agents.insert(
            web_key(),
            AgentHandle {
                stopper: Stopper::new(),
                epoch: 2,
            },
        );
        broker
            .subscriptions
            .insert(web_key(), BTreeMap::new());
        broker
            .handle_update(CertUpdate {
                key: web_key(),
                epoch: 1,
                material: test_material(),
            })
            .await;

        assert!(broker.known_certs.is_empty());
    }
}
