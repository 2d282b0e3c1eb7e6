//! Shared fakes for the actor tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{CertificateSource, Subscription};
use crate::secret::{SecretError, SecretStore};
use crate::types::{CertificateMaterial, IssuanceKey};

/// Material with a real certificate expiring 30 days out, so expiry parsing
/// succeeds and renewal scheduling stays in the common case.
pub(crate) fn test_material() -> CertificateMaterial {
    let mut params = rcgen::CertificateParams::new(vec!["a.example.com".to_string()]);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(30);
    let certificate = rcgen::Certificate::from_params(params).unwrap();
    CertificateMaterial {
        certificate_pem: certificate.serialize_pem().unwrap(),
        private_key_pem: certificate.serialize_private_key_pem(),
    }
}

/// Polls until `condition` holds, failing the test after five seconds.
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F, what: &str) {
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });
    if deadline.await.is_err() {
        panic!("timed out waiting for {what}");
    }
}

/// Records subscriptions and hands the test the delivery senders, so tests
/// can play the broker's role.
#[derive(Default)]
pub(crate) struct FakeCertSource {
    pub(crate) subscribed: Mutex<Vec<IssuanceKey>>,
    pub(crate) cancelled: Arc<AtomicUsize>,
    pub(crate) senders: Mutex<Vec<mpsc::Sender<CertificateMaterial>>>,
}

impl FakeCertSource {
    pub(crate) fn subscribe_count(&self) -> usize {
        self.subscribed.lock().unwrap().len()
    }

    pub(crate) fn cancel_count(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn sender(&self, index: usize) -> mpsc::Sender<CertificateMaterial> {
        self.senders.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl CertificateSource for FakeCertSource {
    async fn subscribe(&self, key: IssuanceKey) -> Subscription {
        self.subscribed.lock().unwrap().push(key);
        let (sender, receiver) = mpsc::channel(1);
        self.senders.lock().unwrap().push(sender);
        let cancelled = self.cancelled.clone();
        Subscription::new(
            receiver,
            Box::new(move || {
                cancelled.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SecretOp {
    Create {
        namespace: String,
        name: String,
        with_material: bool,
    },
    Delete {
        namespace: String,
        name: String,
    },
}

/// In-memory secret store recording every operation. Deleting an absent
/// secret reports `NotFound` like the real API does.
#[derive(Default)]
pub(crate) struct FakeSecretStore {
    pub(crate) ops: Mutex<Vec<SecretOp>>,
    existing: Mutex<HashSet<(String, String)>>,
}

impl FakeSecretStore {
    pub(crate) fn op_count(&self) -> usize {
        self.ops.lock().unwrap().len()
    }

    pub(crate) fn ops(&self) -> Vec<SecretOp> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl SecretStore for FakeSecretStore {
    async fn create_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        material: Option<&CertificateMaterial>,
    ) -> Result<(), SecretError> {
        self.ops.lock().unwrap().push(SecretOp::Create {
            namespace: namespace.to_string(),
            name: name.to_string(),
            with_material: material.is_some(),
        });
        self.existing
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), SecretError> {
        self.ops.lock().unwrap().push(SecretOp::Delete {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        let existed = self
            .existing
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        if existed {
            Ok(())
        } else {
            Err(SecretError::NotFound)
        }
    }
}
