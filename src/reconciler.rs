use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::Subscription;
use crate::dispatcher::ReconcilerContext;
use crate::secret::SecretError;
use crate::types::{CertificateMaterial, IssuanceKey, ResourceEvent, ResourceId};

struct Reconciler {
    id: ResourceId,
    ctx: Arc<ReconcilerContext>,
    issuance_key: Option<IssuanceKey>,
    secret_name: Option<String>,
    material: Option<CertificateMaterial>,
    subscription: Option<Subscription>,
}

/// Keeps one watched resource's TLS secret in sync with its desired
/// certificate. Exits when the input channel closes, cleaning up the
/// subscription and the owned secret.
pub(crate) async fn run_reconciler(
    id: ResourceId,
    mut input: mpsc::Receiver<ResourceEvent>,
    ctx: Arc<ReconcilerContext>,
    done: mpsc::Sender<ResourceId>,
) {
    tracing::info!(resource = %id, "reconciliation agent started");

    let mut reconciler = Reconciler {
        id: id.clone(),
        ctx,
        issuance_key: None,
        secret_name: None,
        material: None,
        subscription: None,
    };

    loop {
        tokio::select! {
            event = input.recv() => match event {
                Some(event) => reconciler.apply_spec(&event).await,
                None => break,
            },
            update = next_update(&mut reconciler.subscription) => match update {
                Some(material) => reconciler.apply_material(material).await,
                None => {
                    tracing::warn!(resource = %reconciler.id, "certificate delivery channel closed unexpectedly");
                    reconciler.subscription = None;
                }
            },
        }
    }

    reconciler.cleanup().await;
    let _ = done.send(id).await;
}

/// Waits on the subscription's delivery channel, or forever if there is none.
async fn next_update(subscription: &mut Option<Subscription>) -> Option<CertificateMaterial> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

impl Reconciler {
    async fn apply_spec(&mut self, event: &ResourceEvent) {
        let desired_key = event.spec.issuance_key();
        let desired_secret = event.spec.secret_name.clone();

        if desired_key != self.issuance_key {
            if let Some(mut subscription) = self.subscription.take() {
                subscription.cancel();
            }
            // Material from the previous key must never end up in the secret.
            self.material = None;
            self.issuance_key = desired_key.clone();
            if let Some(key) = desired_key {
                tracing::info!(
                    resource = %self.id,
                    issuer_path = %key.issuer_path,
                    domain = %key.domain,
                    "binding to certificate"
                );
                self.subscription = Some(self.ctx.source.subscribe(key).await);
            }
        }

        if desired_secret != self.secret_name {
            self.transition_secret(desired_secret).await;
        }
    }

    async fn apply_material(&mut self, material: CertificateMaterial) {
        self.material = Some(material);
        match self.secret_name.clone() {
            Some(name) => self.write_secret(&name).await,
            None => {
                tracing::debug!(resource = %self.id, "certificate received but no secret is configured")
            }
        }
    }

    /// Replaces the recorded secret name: cleans up the secret under the old
    /// name, pre-cleans the new name, then creates the new secret with the
    /// current material (which may still be absent).
    async fn transition_secret(&mut self, new_name: Option<String>) {
        let old_name = self.secret_name.take();

        if let Some(old) = &old_name {
            self.delete_secret(old).await;
        }
        if let Some(new) = &new_name {
            if old_name.as_deref() != Some(new.as_str()) {
                // A secret under the new name could be left over from before
                // this agent existed.
                self.delete_secret(new).await;
            }
        }

        self.secret_name = new_name.clone();
        match new_name {
            Some(name) => self.create_secret(&name).await,
            None => tracing::info!(resource = %self.id, "no secret desired"),
        }
    }

    /// Rewrites the secret under `name` from the current material.
    async fn write_secret(&self, name: &str) {
        self.delete_secret(name).await;
        self.create_secret(name).await;
    }

    async fn create_secret(&self, name: &str) {
        let created = self
            .ctx
            .secrets
            .create_tls_secret(&self.id.namespace, name, self.material.as_ref())
            .await;
        if let Err(error) = created {
            // Left for the next spec or certificate event to retry.
            tracing::error!(resource = %self.id, secret = name, %error, "failed to create secret");
        }
    }

    async fn delete_secret(&self, name: &str) {
        match self.ctx.secrets.delete_secret(&self.id.namespace, name).await {
            Ok(()) | Err(SecretError::NotFound) => {}
            Err(error) => {
                tracing::error!(resource = %self.id, secret = name, %error, "failed to delete secret");
            }
        }
    }

    async fn cleanup(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.cancel();
        }
        if let Some(name) = self.secret_name.take() {
            self.delete_secret(&name).await;
        }
        tracing::info!(resource = %self.id, "reconciliation agent terminated");
    }
}
