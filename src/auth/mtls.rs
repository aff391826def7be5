//! mTLS certificate-binding verification
//!
//! The TLS terminator (in front of, or inside, the socket layer) hands
//! over the peer-verified certificate's identifying fields; this module
//! matches them against the identity's bindings and the revocation list
//! in the KV store. Revocation lookups fail closed.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::identity::CertificateBinding;
use crate::infrastructure::KeyValueStore;

/// Peer certificate fields extracted by the TLS layer
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    /// SHA-256 digest of the DER encoding, any textual form.
    pub fingerprint: String,
    pub subject_cn: Option<String>,
    pub serial_number: Option<String>,
    pub subject_alt_names: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

/// Canonical fingerprint form: colons stripped, upper-case.
pub fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != ':')
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Verify a peer certificate against the identity's bindings.
///
/// Returns the matched binding's fingerprint (where recorded) or an
/// explanation for the log; the caller collapses every failure to
/// "unauthenticated" on the wire.
pub async fn verify_client_certificate(
    kv: &Arc<dyn KeyValueStore>,
    bindings: &[CertificateBinding],
    revoked_fingerprints: &[String],
    certificate: &ClientCertificate,
    now: DateTime<Utc>,
) -> Result<(), String> {
    // Certificate's own validity window.
    if let Some(from) = certificate.not_before {
        if now < from {
            return Err("certificate not yet valid".into());
        }
    }
    if let Some(to) = certificate.not_after {
        if now > to {
            return Err("certificate expired".into());
        }
    }

    let fingerprint = normalize_fingerprint(&certificate.fingerprint);

    if revoked_fingerprints
        .iter()
        .any(|r| normalize_fingerprint(r) == fingerprint)
    {
        return Err("certificate fingerprint revoked by identity".into());
    }

    // Cluster-wide revocation flag; an unreachable store blocks access.
    match kv.get(&format!("revoked-certs:{}", fingerprint)).await {
        Ok(Some(_)) => return Err("certificate fingerprint revoked".into()),
        Ok(None) => {}
        Err(e) => return Err(format!("revocation lookup failed: {}", e)),
    }

    let matched = bindings.iter().any(|binding| {
        if !binding.is_current(now) {
            return false;
        }
        if binding
            .fingerprint
            .as_deref()
            .is_some_and(|fp| revoked_fingerprints
                .iter()
                .any(|r| normalize_fingerprint(r) == normalize_fingerprint(fp)))
        {
            return false;
        }

        let by_fingerprint = binding
            .fingerprint
            .as_deref()
            .is_some_and(|fp| normalize_fingerprint(fp) == fingerprint);
        let by_subject = match (&binding.subject, &certificate.subject_cn) {
            (Some(b), Some(c)) => b == c,
            _ => false,
        };
        let by_san = binding.subject_alt_name.as_deref().is_some_and(|san| {
            certificate.subject_alt_names.iter().any(|c| c == san)
        });
        let by_serial = match (&binding.serial_number, &certificate.serial_number) {
            (Some(b), Some(c)) => b.eq_ignore_ascii_case(c),
            _ => false,
        };

        by_fingerprint || by_subject || by_san || by_serial
    });

    if matched {
        Ok(())
    } else {
        Err("no certificate binding matched".into())
    }
}
