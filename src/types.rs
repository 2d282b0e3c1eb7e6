use std::fmt;

/// Identifies one certificate-issuance target: a Vault PKI issue path plus
/// the domain the certificate is requested for.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IssuanceKey {
    pub issuer_path: String,
    pub domain: String,
}

/// PEM-encoded certificate and private key pair, carried opaquely end to end.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"[redacted]")
            .finish()
    }
}

/// Namespace+name pair uniquely identifying a watched resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// TLS-relevant fields extracted from an Ingress spec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSpec {
    /// Vault PKI issue path taken from the issuer annotation.
    pub issuer_path: Option<String>,
    /// First host of the first TLS entry.
    pub domain: Option<String>,
    /// Secret name of the first TLS entry.
    pub secret_name: Option<String>,
}

impl TlsSpec {
    /// The issuance key this spec asks for. Absence of either the issuer
    /// annotation or a TLS host means no certificate is desired.
    pub fn issuance_key(&self) -> Option<IssuanceKey> {
        match (&self.issuer_path, &self.domain) {
            (Some(issuer_path), Some(domain)) => Some(IssuanceKey {
                issuer_path: issuer_path.clone(),
                domain: domain.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ResourceEvent {
    pub kind: EventKind,
    pub id: ResourceId,
    pub spec: TlsSpec,
}
