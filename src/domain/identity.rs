//! Charger identity records
//!
//! An identity record is fetched from the KV store under `chargers:{id}`
//! during connection admission. It carries the charger's tenancy, the
//! protocols and source addresses it may use, and its credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::version::OcppVersion;

/// Minimum accepted hex digest length (sha256 = 64 hex chars).
const MIN_HASH_LEN: usize = 32;
/// Minimum accepted salt length.
const MIN_SALT_LEN: usize = 8;

/// Identity lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Disabled,
}

/// Salted-hash algorithm for basic/token credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Scrypt,
}

/// Authentication mode selected for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Basic,
    Token,
    Mtls,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Token => "token",
            Self::Mtls => "mtls",
        }
    }
}

/// One certificate binding inside an mTLS credential set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateBinding {
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub subject_alt_name: Option<String>,
    #[serde(default)]
    pub serial_number: Option<String>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default = "default_binding_status")]
    pub status: String,
}

fn default_binding_status() -> String {
    "active".to_string()
}

impl CertificateBinding {
    /// Whether the binding's own validity window contains `now` and the
    /// binding has not been administratively revoked.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        if !self.status.eq_ignore_ascii_case("active") {
            return false;
        }
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(to) = self.valid_to {
            if now > to {
                return false;
            }
        }
        true
    }
}

/// Credentials attached to an identity record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthCredentials {
    #[serde(rename_all = "camelCase")]
    Basic {
        #[serde(default)]
        username: Option<String>,
        secret_hash: String,
        secret_salt: String,
        hash_algorithm: HashAlgorithm,
    },
    #[serde(rename_all = "camelCase")]
    Token {
        token_hash: String,
        secret_salt: String,
        hash_algorithm: HashAlgorithm,
    },
    #[serde(rename_all = "camelCase")]
    Mtls {
        certificates: Vec<CertificateBinding>,
        #[serde(default)]
        revoked_fingerprints: Vec<String>,
    },
}

impl AuthCredentials {
    /// The auth mode this credential set supports.
    pub fn mode(&self) -> AuthMode {
        match self {
            Self::Basic { .. } => AuthMode::Basic,
            Self::Token { .. } => AuthMode::Token,
            Self::Mtls { .. } => AuthMode::Mtls,
        }
    }
}

/// Charger identity record (KV key `chargers:{id}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargerIdentity {
    pub charge_point_id: String,
    pub station_id: String,
    pub tenant_id: String,
    pub status: IdentityStatus,
    /// Versions this charger may speak; `None` means any (unless the
    /// gateway is configured to require an explicit list).
    #[serde(default)]
    pub allowed_protocols: Option<Vec<OcppVersion>>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub allowed_cidrs: Vec<String>,
    /// Auth modes this identity may use; `None` means the configured default.
    #[serde(default)]
    pub allowed_auth_types: Option<Vec<AuthMode>>,
    pub auth: AuthCredentials,
}

impl ChargerIdentity {
    /// Structural invariants checked after a KV fetch. `key` is the
    /// charge-point id the record was fetched under.
    pub fn validate(&self, key: &str) -> Result<(), String> {
        if self.charge_point_id != key {
            return Err(format!(
                "identity chargePointId '{}' does not match key '{}'",
                self.charge_point_id, key
            ));
        }
        match &self.auth {
            AuthCredentials::Basic {
                secret_hash,
                secret_salt,
                ..
            } => {
                if secret_hash.len() < MIN_HASH_LEN {
                    return Err("secretHash below minimum length".into());
                }
                if secret_salt.len() < MIN_SALT_LEN {
                    return Err("secretSalt below minimum length".into());
                }
            }
            AuthCredentials::Token {
                token_hash,
                secret_salt,
                ..
            } => {
                if token_hash.len() < MIN_HASH_LEN {
                    return Err("tokenHash below minimum length".into());
                }
                if secret_salt.len() < MIN_SALT_LEN {
                    return Err("secretSalt below minimum length".into());
                }
            }
            AuthCredentials::Mtls {
                certificates,
                revoked_fingerprints,
            } => {
                let now = Utc::now();
                let usable = certificates.iter().any(|c| {
                    c.is_current(now)
                        && !c.fingerprint.as_deref().is_some_and(|fp| {
                            revoked_fingerprints
                                .iter()
                                .any(|r| r.eq_ignore_ascii_case(fp))
                        })
                });
                if !usable {
                    return Err("mTLS identity has no unrevoked binding valid now".into());
                }
            }
        }
        Ok(())
    }
}
