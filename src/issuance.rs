use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stopper::Stopper;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::broker::CertUpdate;
use crate::pki::CertificateIssuer;
use crate::types::IssuanceKey;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponential backoff for failed issuance attempts: doubles on every failure
/// up to a cap, reset after any success.
struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    fn next_interval(&mut self) -> Duration {
        let interval = self.next;
        self.next = (self.next * 2).min(self.max);
        interval
    }

    fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// What to do after a successful issuance, based on remaining validity.
#[derive(Debug, PartialEq, Eq)]
enum RenewalDecision {
    /// Remaining validity is too short to be usable; re-issue immediately.
    Reissue,
    /// Check again after this interval.
    Sleep(Duration),
}

/// Tiered renewal schedule: the closer the certificate is to expiry, the more
/// often the agent checks. The common case sleeps until 7 days before expiry.
fn renewal_decision(remaining: chrono::Duration) -> RenewalDecision {
    if remaining < chrono::Duration::hours(1) {
        RenewalDecision::Reissue
    } else if remaining < chrono::Duration::hours(24) {
        RenewalDecision::Sleep(Duration::from_secs(5 * 60))
    } else if remaining <= chrono::Duration::days(7) {
        RenewalDecision::Sleep(Duration::from_secs(60 * 60))
    } else {
        let until_renewal = remaining - chrono::Duration::days(7);
        RenewalDecision::Sleep(until_renewal.to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug, Error)]
enum CertParseError {
    #[error("invalid PEM: {0}")]
    Pem(#[from] x509_parser::nom::Err<x509_parser::error::PEMError>),
    #[error("invalid X.509 certificate: {0}")]
    X509(#[from] x509_parser::nom::Err<x509_parser::error::X509Error>),
}

/// Expiry of the leaf certificate as a Unix timestamp. Expiry is only ever
/// examined here; the rest of the system treats material as opaque PEM.
fn not_after(certificate_pem: &str) -> Result<i64, CertParseError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(certificate_pem.as_bytes())?;
    let certificate = pem.parse_x509()?;
    Ok(certificate.validity().not_after.timestamp())
}

/// Polls the PKI backend for one issuance key until stopped, forwarding every
/// successfully issued certificate to the broker.
pub(crate) async fn run_issuance_agent(
    key: IssuanceKey,
    epoch: u64,
    issuer: Arc<dyn CertificateIssuer>,
    updates: mpsc::Sender<CertUpdate>,
    stopper: Stopper,
) {
    tracing::info!(issuer_path = %key.issuer_path, domain = %key.domain, "issuance agent started");

    let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);

    loop {
        let sleep = match stopper.stop_future(issuer.issue(&key)).await {
            None => break,
            Some(Err(error)) => {
                tracing::warn!(domain = %key.domain, %error, "failed to issue certificate");
                backoff.next_interval()
            }
            // An unparsable certificate is an issuance failure like any
            // other: nothing is forwarded and backoff applies.
            Some(Ok(material)) => match not_after(&material.certificate_pem) {
                Err(error) => {
                    tracing::warn!(domain = %key.domain, %error, "issued certificate is unparsable");
                    backoff.next_interval()
                }
                Ok(expires_at) => {
                    let update = CertUpdate {
                        key: key.clone(),
                        epoch,
                        material,
                    };
                    if updates.send(update).await.is_err() {
                        // Broker is gone; nothing left to report to.
                        break;
                    }
                    backoff.reset();

                    let remaining =
                        chrono::Duration::seconds(expires_at - Utc::now().timestamp());
                    match renewal_decision(remaining) {
                        RenewalDecision::Reissue => {
                            tracing::info!(domain = %key.domain, "certificate expires too soon, re-issuing");
                            continue;
                        }
                        RenewalDecision::Sleep(interval) => interval,
                    }
                }
            },
        };

        tracing::debug!(domain = %key.domain, ?sleep, "issuance agent sleeping");
        if stopper.stop_future(tokio::time::sleep(sleep)).await.is_none() {
            break;
        }
    }

    tracing::info!(issuer_path = %key.issuer_path, domain = %key.domain, "issuance agent stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);

        // Two consecutive failures sleep 1s then 2s, not the cap.
        assert_eq!(backoff.next_interval(), Duration::from_secs(1));
        assert_eq!(backoff.next_interval(), Duration::from_secs(2));
        assert_eq!(backoff.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            backoff.next_interval();
        }
        assert_eq!(backoff.next_interval(), Duration::from_secs(60));

        backoff.reset();
        assert_eq!(backoff.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_renewal_decision_tiers() {
        // Common case: sleep until 7 days before expiry.
        assert_eq!(
            renewal_decision(chrono::Duration::days(30)),
            RenewalDecision::Sleep(Duration::from_secs(23 * 24 * 60 * 60))
        );
        // Within the renewal window: hourly checks.
        assert_eq!(
            renewal_decision(chrono::Duration::days(7)),
            RenewalDecision::Sleep(Duration::from_secs(60 * 60))
        );
        assert_eq!(
            renewal_decision(chrono::Duration::days(3)),
            RenewalDecision::Sleep(Duration::from_secs(60 * 60))
        );
        // Close to expiry: every five minutes.
        assert_eq!(
            renewal_decision(chrono::Duration::hours(12)),
            RenewalDecision::Sleep(Duration::from_secs(5 * 60))
        );
        // Too short to be usable.
        assert_eq!(
            renewal_decision(chrono::Duration::minutes(30)),
            RenewalDecision::Reissue
        );
        assert_eq!(
            renewal_decision(chrono::Duration::seconds(-60)),
            RenewalDecision::Reissue
        );
    }

    #[test]
    fn test_not_after_reads_leaf_expiry() {
        let mut params = rcgen::CertificateParams::new(vec!["a.example.com".to_string()]);
        params.not_after = rcgen::date_time_ymd(2030, 1, 1);
        let certificate = rcgen::Certificate::from_params(params).unwrap();
        let pem = certificate.serialize_pem().unwrap();

        // 2030-01-01T00:00:00Z
        assert_eq!(not_after(&pem).unwrap(), 1_893_456_000);
    }

    #[test]
    fn test_not_after_rejects_garbage() {
        assert!(not_after("not a certificate").is_err());
    }
}
