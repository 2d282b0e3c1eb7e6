use std::time::Duration;

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    Client,
};
use tokio::{sync::oneshot, task::JoinHandle};

const LEASE_DURATION_SECONDS: i64 = 15;
const FIELD_MANAGER: &str = "certwatch.devsisters.com";

/// Holds the controller leader lease and renews it in the background until
/// released.
pub struct LeaderLease {
    renewer: JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
}

impl LeaderLease {
    /// Blocks until the lease is free or expired, then takes it. Competing
    /// holders are waited out.
    pub async fn acquire(
        client: Client,
        namespace: &str,
        lease_name: &str,
        identity: &str,
    ) -> Result<Self, kube::Error> {
        let lease_api: Api<Lease> = Api::namespaced(client, namespace);

        loop {
            match lease_api.get_opt(lease_name).await? {
                None => {
                    let fresh = new_lease(namespace, lease_name, identity);
                    match lease_api.create(&PostParams::default(), &fresh).await {
                        Ok(_) => break,
                        Err(kube::Error::Api(response)) if response.code == 409 => {
                            // Somebody else created it first; re-evaluate.
                            continue;
                        }
                        Err(error) => return Err(error),
                    }
                }
                Some(mut lease) => {
                    if !lease_expired(&lease) {
                        tracing::debug!(lease_name, "lease is held, waiting");
                        let wait = held_duration_seconds(&lease).max(1) as u64;
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        continue;
                    }

                    // Take over the expired lease.
                    lease.metadata.managed_fields = None;
                    let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                    spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                    spec.acquire_time = Some(micro_now());
                    spec.renew_time = None;
                    spec.lease_duration_seconds = Some(LEASE_DURATION_SECONDS as i32);
                    spec.holder_identity = Some(identity.to_string());

                    lease_api
                        .patch(
                            lease_name,
                            &PatchParams::apply(FIELD_MANAGER).force(),
                            &Patch::Apply(&lease),
                        )
                        .await?;
                    break;
                }
            }
        }

        Ok(Self::spawn_renewer(lease_api, lease_name.to_string()))
    }

    fn spawn_renewer(lease_api: Api<Lease>, lease_name: String) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let renewer = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(LEASE_DURATION_SECONDS as u64 / 3));
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = &mut shutdown_rx => break,
                }

                let patch = serde_json::json!({ "spec": { "renewTime": micro_now() } });
                let renewed = lease_api
                    .patch(
                        &lease_name,
                        &PatchParams::apply(FIELD_MANAGER),
                        &Patch::Merge(patch),
                    )
                    .await;
                if let Err(error) = renewed {
                    tracing::error!(%error, %lease_name, "failed to renew lease");
                }
            }

            let patch = serde_json::json!({
                "spec": {
                    "renewTime": Option::<()>::None,
                    "acquireTime": Option::<()>::None,
                    "holderIdentity": Option::<()>::None,
                }
            });
            let released = lease_api
                .patch(
                    &lease_name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(patch),
                )
                .await;
            if let Err(error) = released {
                tracing::error!(%error, %lease_name, "failed to release lease");
            }
        });

        Self {
            renewer,
            shutdown: shutdown_tx,
        }
    }

    /// Stops renewing and releases the lease.
    pub async fn release(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown.send(());
        self.renewer.await
    }
}

fn new_lease(namespace: &str, lease_name: &str, identity: &str) -> Lease {
    Lease {
        metadata: ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(lease_name.to_string()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            acquire_time: Some(micro_now()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS as i32),
            holder_identity: Some(identity.to_string()),
            lease_transitions: Some(1),
            ..Default::default()
        }),
    }
}

fn micro_now() -> MicroTime {
    MicroTime(Utc::now())
}

fn held_duration_seconds(lease: &Lease) -> i64 {
    lease
        .spec
        .as_ref()
        .and_then(|spec| spec.lease_duration_seconds)
        .map(i64::from)
        .unwrap_or(LEASE_DURATION_SECONDS)
}

/// A lease that was never renewed or acquired counts as expired.
fn lease_expired(lease: &Lease) -> bool {
    let spec = match &lease.spec {
        Some(spec) => spec,
        None => return true,
    };

    match spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) {
        Some(MicroTime(last_active)) => {
            let expires =
                *last_active + chrono::Duration::seconds(held_duration_seconds(lease));
            Utc::now() > expires
        }
        None => true,
    }
}
