use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{api::core::v1::Secret, ByteString};
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use thiserror::Error;

use crate::types::CertificateMaterial;

#[derive(Debug, Error)]
pub enum SecretError {
    /// Distinguished non-fatal result the reconciler depends on.
    #[error("secret not found")]
    NotFound,
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[source] kube::Error),
}

/// Secret storage boundary: create and delete TLS secrets by namespace+name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn create_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        material: Option<&CertificateMaterial>,
    ) -> Result<(), SecretError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), SecretError>;
}

pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

fn map_kube_error(error: kube::Error) -> SecretError {
    if let kube::Error::Api(ref api_error) = error {
        if api_error.code == 404 {
            return SecretError::NotFound;
        }
    }
    SecretError::Kubernetes(error)
}

/// Builds a `kubernetes.io/tls` secret. Without material the payload keys are
/// present but empty, a transient state until the certificate arrives.
fn make_tls_secret(name: &str, material: Option<&CertificateMaterial>) -> Secret {
    let (cert, key) = match material {
        Some(material) => (
            material.certificate_pem.clone().into_bytes(),
            material.private_key_pem.clone().into_bytes(),
        ),
        None => (Vec::new(), Vec::new()),
    };

    let mut data = BTreeMap::new();
    data.insert("tls.crt".to_string(), ByteString(cert));
    data.insert("tls.key".to_string(), ByteString(key));

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn create_tls_secret(
        &self,
        namespace: &str,
        name: &str,
        material: Option<&CertificateMaterial>,
    ) -> Result<(), SecretError> {
        let secret_api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        secret_api
            .create(&PostParams::default(), &make_tls_secret(name, material))
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), SecretError> {
        let secret_api = Api::<Secret>::namespaced(self.client.clone(), namespace);
        secret_api
            .delete(name, &DeleteParams::default())
            .await
            .map_err(map_kube_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_tls_secret() {
        let material = CertificateMaterial {
            certificate_pem: "CERT_A".to_string(),
            private_key_pem: "KEY_A".to_string(),
        };

        let secret = make_tls_secret("web-tls", Some(&material));
        assert_eq!(secret.metadata.name, Some("web-tls".to_string()));
        assert_eq!(secret.type_, Some("kubernetes.io/tls".to_string()));
        let data = secret.data.unwrap();
        assert_eq!(data["tls.crt"], ByteString(b"CERT_A".to_vec()));
        assert_eq!(data["tls.key"], ByteString(b"KEY_A".to_vec()));
    }

    #[test]
    fn test_make_tls_secret_without_material() {
        let secret = make_tls_secret("web-tls", None);
        let data = secret.data.unwrap();
        assert_eq!(data["tls.crt"], ByteString(Vec::new()));
        assert_eq!(data["tls.key"], ByteString(Vec::new()));
    }
}
