use futures_util::{stream, Stream, StreamExt};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{runtime::watcher, Api, ResourceExt};

use crate::types::{EventKind, ResourceEvent, ResourceId, TlsSpec};

/// Annotation holding the Vault PKI issue path for an Ingress.
pub const ISSUER_PATH_ANNOTATION: &str = "certwatch.devsisters.com/issuer-path";

/// Adapts the Kubernetes Ingress watch to resource events. Watch errors are
/// logged and skipped; the watcher reconnects and resyncs internally.
pub fn resource_events(api: Api<Ingress>) -> impl Stream<Item = ResourceEvent> {
    watcher(api, watcher::Config::default()).flat_map(|result| {
        let events = match result {
            Ok(watcher::Event::Applied(ingress)) => to_events(EventKind::Update, vec![ingress]),
            Ok(watcher::Event::Deleted(ingress)) => to_events(EventKind::Delete, vec![ingress]),
            Ok(watcher::Event::Restarted(ingresses)) => to_events(EventKind::Update, ingresses),
            Err(error) => {
                tracing::warn!(%error, "ingress watch failed, retrying");
                Vec::new()
            }
        };
        stream::iter(events)
    })
}

fn to_events(kind: EventKind, ingresses: Vec<Ingress>) -> Vec<ResourceEvent> {
    ingresses
        .into_iter()
        .filter_map(|ingress| {
            let id = resource_id(&ingress)?;
            let spec = extract_tls_spec(&ingress);
            Some(ResourceEvent { kind, id, spec })
        })
        .collect()
}

fn resource_id(ingress: &Ingress) -> Option<ResourceId> {
    let namespace = ingress.namespace()?;
    let name = ingress.metadata.name.clone()?;
    Some(ResourceId { namespace, name })
}

/// Pulls the TLS-relevant fields out of an Ingress: the issuer annotation and
/// the host/secret of the first TLS entry.
fn extract_tls_spec(ingress: &Ingress) -> TlsSpec {
    let issuer_path = ingress
        .annotations()
        .get(ISSUER_PATH_ANNOTATION)
        .filter(|path| !path.is_empty())
        .cloned();

    let first_tls = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.tls.as_ref())
        .and_then(|tls| tls.first());

    let domain = first_tls
        .and_then(|tls| tls.hosts.as_ref())
        .and_then(|hosts| hosts.first())
        .filter(|host| !host.is_empty())
        .cloned();

    let secret_name = first_tls
        .and_then(|tls| tls.secret_name.clone())
        .filter(|name| !name.is_empty());

    TlsSpec {
        issuer_path,
        domain,
        secret_name,
    }
}
