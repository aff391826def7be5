//! Connection admission
//!
//! Identity lookup and credential verification for incoming WebSocket
//! upgrades. Every failure collapses to "unauthenticated" on the wire
//! (close 1008); the concrete reason is logged at most once per source
//! IP per cooldown window.

pub mod mtls;
pub mod net;
pub mod secrets;

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use tracing::warn;

use crate::domain::{AuthCredentials, ChargerIdentity, IdentityStatus, OcppVersion};
use crate::infrastructure::{FloodControl, FloodKind, KeyValueStore};

pub use mtls::ClientCertificate;

/// Admission policy knobs
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Whether HTTP Basic credentials are acceptable at all.
    pub allow_basic: bool,
    /// Reject identities that carry no explicit protocol allow-list.
    pub require_protocol_allowlist: bool,
    /// Trust `X-Forwarded-For` / `Forwarded` from the peer.
    pub trusted_proxy: bool,
    pub global_allowed_ips: Vec<String>,
    pub global_allowed_cidrs: Vec<String>,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            allow_basic: true,
            require_protocol_allowlist: false,
            trusted_proxy: false,
            global_allowed_ips: Vec::new(),
            global_allowed_cidrs: Vec::new(),
        }
    }
}

/// Everything the admission decision needs about one upgrade request
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub charge_point_id: String,
    pub version: Option<OcppVersion>,
    /// Socket peer, textual (may carry a port).
    pub peer_addr: String,
    pub authorization: Option<String>,
    pub x_api_key: Option<String>,
    pub x_forwarded_for: Option<String>,
    pub forwarded: Option<String>,
    pub client_certificate: Option<ClientCertificate>,
}

/// Admission failure. The wire only ever sees "unauthenticated".
#[derive(Debug)]
pub struct AuthFailure {
    reason: String,
}

impl AuthFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Identity lookup + credential verification
pub struct Authenticator {
    kv: Arc<dyn KeyValueStore>,
    settings: AuthSettings,
    flood: FloodControl,
}

impl Authenticator {
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: AuthSettings, flood: FloodControl) -> Self {
        Self { kv, settings, flood }
    }

    /// Run the admission steps in order. On success the resolved identity
    /// record is returned for downstream use.
    pub async fn authenticate(&self, req: &ConnectRequest) -> Result<ChargerIdentity, AuthFailure> {
        match self.try_authenticate(req).await {
            Ok(identity) => Ok(identity),
            Err(failure) => {
                let ip = req.peer_addr.clone();
                if self.flood.should_log(FloodKind::Unauthorized, &ip).await {
                    warn!(
                        charge_point_id = req.charge_point_id.as_str(),
                        ip = ip.as_str(),
                        reason = failure.reason(),
                        "Connection rejected: unauthenticated"
                    );
                }
                Err(failure)
            }
        }
    }

    async fn try_authenticate(&self, req: &ConnectRequest) -> Result<ChargerIdentity, AuthFailure> {
        // 1. Identity lookup
        let key = format!("chargers:{}", req.charge_point_id);
        let raw = self
            .kv
            .get(&key)
            .await
            .map_err(|e| AuthFailure::new(format!("identity lookup failed: {}", e)))?
            .ok_or_else(|| AuthFailure::new("unknown charge point"))?;
        let identity: ChargerIdentity = serde_json::from_str(&raw)
            .map_err(|e| AuthFailure::new(format!("identity record malformed: {}", e)))?;
        identity
            .validate(&req.charge_point_id)
            .map_err(AuthFailure::new)?;
        if identity.status != IdentityStatus::Active {
            return Err(AuthFailure::new("identity disabled"));
        }

        // 2. Protocol allow-list
        let version = req
            .version
            .ok_or_else(|| AuthFailure::new("no negotiated protocol version"))?;
        match &identity.allowed_protocols {
            Some(allowed) => {
                if !allowed.contains(&version) {
                    return Err(AuthFailure::new(format!(
                        "protocol {} not allowed for identity",
                        version
                    )));
                }
            }
            None if self.settings.require_protocol_allowlist => {
                return Err(AuthFailure::new("identity lacks required protocol allow-list"));
            }
            None => {}
        }

        // 3. Source address allow-lists
        let ip = net::client_ip(
            &req.peer_addr,
            self.settings.trusted_proxy,
            req.x_forwarded_for.as_deref(),
            req.forwarded.as_deref(),
        )
        .ok_or_else(|| AuthFailure::new("unparseable source address"))?;
        if !net::ip_allowed(
            ip,
            &self.settings.global_allowed_ips,
            &self.settings.global_allowed_cidrs,
        ) {
            return Err(AuthFailure::new("source address not in global allow-list"));
        }
        if !net::ip_allowed(ip, &identity.allowed_ips, &identity.allowed_cidrs) {
            return Err(AuthFailure::new("source address not in identity allow-list"));
        }

        // 4. Credential verification
        let mode = identity.auth.mode();
        if let Some(allowed) = &identity.allowed_auth_types {
            if !allowed.contains(&mode) {
                return Err(AuthFailure::new(format!(
                    "auth mode {} not in identity allowedTypes",
                    mode.as_str()
                )));
            }
        }
        match &identity.auth {
            AuthCredentials::Basic {
                username,
                secret_hash,
                secret_salt,
                hash_algorithm,
            } => {
                if !self.settings.allow_basic {
                    return Err(AuthFailure::new("basic auth disabled by configuration"));
                }
                let (presented_user, presented_secret) = parse_basic(req.authorization.as_deref())
                    .ok_or_else(|| AuthFailure::new("missing or malformed Basic credentials"))?;
                let expected_user = username.as_deref().unwrap_or(&req.charge_point_id);
                if presented_user != expected_user && presented_user != req.charge_point_id {
                    return Err(AuthFailure::new("basic username mismatch"));
                }
                if !secrets::verify_secret(
                    *hash_algorithm,
                    &presented_secret,
                    secret_salt,
                    secret_hash,
                ) {
                    return Err(AuthFailure::new("basic secret mismatch"));
                }
            }
            AuthCredentials::Token {
                token_hash,
                secret_salt,
                hash_algorithm,
            } => {
                let token = bearer_token(req.authorization.as_deref())
                    .or_else(|| req.x_api_key.clone())
                    .ok_or_else(|| AuthFailure::new("missing bearer token"))?;
                if !secrets::verify_secret(*hash_algorithm, &token, secret_salt, token_hash) {
                    return Err(AuthFailure::new("token mismatch"));
                }
            }
            AuthCredentials::Mtls {
                certificates,
                revoked_fingerprints,
            } => {
                let certificate = req
                    .client_certificate
                    .as_ref()
                    .ok_or_else(|| AuthFailure::new("mTLS required but no peer certificate"))?;
                mtls::verify_client_certificate(
                    &self.kv,
                    certificates,
                    revoked_fingerprints,
                    certificate,
                    Utc::now(),
                )
                .await
                .map_err(AuthFailure::new)?;
            }
        }

        Ok(identity)
    }
}

/// Parse `Authorization: Basic <base64(user:secret)>`, splitting on the
/// first colon.
fn parse_basic(header: Option<&str>) -> Option<(String, String)> {
    let value = header?;
    let value = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(value.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, secret) = decoded.split_once(':')?;
    Some((user.to_string(), secret.to_string()))
}

/// Extract `Authorization: Bearer <token>`.
fn bearer_token(header: Option<&str>) -> Option<String> {
    let value = header?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(|t| t.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::InMemoryKvStore;
    use serde_json::json;
    use std::time::Duration;

    async fn kv_with_identity(auth: serde_json::Value) -> Arc<InMemoryKvStore> {
        kv_with_identity_fields(auth, json!({})).await
    }

    async fn kv_with_identity_fields(
        auth: serde_json::Value,
        extra: serde_json::Value,
    ) -> Arc<InMemoryKvStore> {
        let kv = Arc::new(InMemoryKvStore::new());
        let mut identity = json!({
            "chargePointId": "CP-1",
            "stationId": "ST-1",
            "tenantId": "T-1",
            "status": "active",
            "auth": auth,
        });
        if let (Some(base), Some(extra)) = (identity.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        kv.put("chargers:CP-1", &identity.to_string(), None)
            .await
            .unwrap();
        kv
    }

    fn authenticator(kv: Arc<InMemoryKvStore>) -> Authenticator {
        let flood = FloodControl::new(kv.clone(), Duration::from_secs(60));
        Authenticator::new(kv, AuthSettings::default(), flood)
    }

    fn basic_auth_json(secret: &str) -> serde_json::Value {
        let hash = secrets::hash_secret(crate::domain::HashAlgorithm::Sha256, secret, "salt-salt")
            .unwrap();
        json!({
            "type": "basic",
            "secretHash": hash,
            "secretSalt": "salt-salt",
            "hashAlgorithm": "sha256",
        })
    }

    fn request(authorization: Option<String>) -> ConnectRequest {
        ConnectRequest {
            charge_point_id: "CP-1".into(),
            version: Some(OcppVersion::V16),
            peer_addr: "10.0.0.1:50000".into(),
            authorization,
            ..Default::default()
        }
    }

    fn basic_header(user: &str, secret: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{}:{}", user, secret)))
    }

    #[tokio::test]
    async fn basic_happy_path() {
        let kv = kv_with_identity(basic_auth_json("s3cret")).await;
        let auth = authenticator(kv);
        let identity = auth
            .authenticate(&request(Some(basic_header("CP-1", "s3cret"))))
            .await
            .unwrap();
        assert_eq!(identity.charge_point_id, "CP-1");
    }

    #[tokio::test]
    async fn wrong_password_rejected() {
        let kv = kv_with_identity(basic_auth_json("s3cret")).await;
        let auth = authenticator(kv);
        assert!(auth
            .authenticate(&request(Some(basic_header("CP-1", "nope"))))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_identity_rejected() {
        let kv = Arc::new(InMemoryKvStore::new());
        let auth = authenticator(kv);
        assert!(auth.authenticate(&request(None)).await.is_err());
    }

    #[tokio::test]
    async fn disallowed_protocol_rejected() {
        let kv = kv_with_identity_fields(
            basic_auth_json("s3cret"),
            json!({"allowedProtocols": ["2.0.1"]}),
        ).await;
        let auth = authenticator(kv);
        let err = auth
            .authenticate(&request(Some(basic_header("CP-1", "s3cret"))))
            .await
            .unwrap_err();
        assert!(err.reason().contains("protocol"));
    }

    #[tokio::test]
    async fn identity_ip_allow_list_enforced() {
        let kv = kv_with_identity_fields(
            basic_auth_json("s3cret"),
            json!({"allowedCidrs": ["192.168.0.0/16"]}),
        ).await;
        let auth = authenticator(kv);
        let err = auth
            .authenticate(&request(Some(basic_header("CP-1", "s3cret"))))
            .await
            .unwrap_err();
        assert!(err.reason().contains("allow-list"));
    }

    #[tokio::test]
    async fn token_via_api_key_header() {
        let hash = secrets::hash_secret(crate::domain::HashAlgorithm::Sha256, "tok-1", "salt-salt")
            .unwrap();
        let kv = kv_with_identity(json!({
            "type": "token",
            "tokenHash": hash,
            "secretSalt": "salt-salt",
            "hashAlgorithm": "sha256",
        }))
        .await;
        let auth = authenticator(kv);
        let mut req = request(None);
        req.x_api_key = Some("tok-1".into());
        assert!(auth.authenticate(&req).await.is_ok());
    }

    #[tokio::test]
    async fn mtls_without_certificate_rejected() {
        let kv = kv_with_identity(json!({
            "type": "mtls",
            "certificates": [{"fingerprint": "AABB", "status": "active"}],
            "revokedFingerprints": [],
        }))
        .await;
        let auth = authenticator(kv);
        let err = auth.authenticate(&request(None)).await.unwrap_err();
        assert!(err.reason().contains("certificate"));
    }

    #[tokio::test]
    async fn mtls_with_matching_certificate_accepted() {
        let kv = kv_with_identity(json!({
            "type": "mtls",
            "certificates": [{"fingerprint": "AA:BB", "status": "active"}],
            "revokedFingerprints": [],
        }))
        .await;
        let auth = authenticator(kv);
        let mut req = request(None);
        req.client_certificate = Some(ClientCertificate {
            fingerprint: "aabb".into(),
            subject_cn: None,
            serial_number: None,
            subject_alt_names: vec![],
            not_before: None,
            not_after: None,
        });
        assert!(auth.authenticate(&req).await.is_ok());
    }
}
