//! Session ownership entries and per-socket connection metadata

use serde::{Deserialize, Serialize};

use super::version::OcppVersion;

/// Cluster-wide session entry (KV key `sessions:{chargePointId}`).
///
/// At most one entry exists per charger; `epoch` increases monotonically
/// on every takeover and `lastSeenAtMs` is advanced only by the owning
/// node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub charge_point_id: String,
    pub ocpp_version: OcppVersion,
    pub node_id: String,
    pub station_id: String,
    pub tenant_id: String,
    pub connected_at_ms: i64,
    pub last_seen_at_ms: i64,
    pub epoch: u64,
}

/// In-process metadata for one accepted socket
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub connection_id: String,
    pub charge_point_id: String,
    pub ocpp_version: OcppVersion,
    pub station_id: String,
    pub tenant_id: String,
    pub session_epoch: u64,
    pub ip: String,
}

// ── Ownership claim protocol ───────────────────────────────────

/// Outcome of an atomic session claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    /// No prior entry existed; epoch starts at 1.
    Fresh,
    /// The calling node already owned the entry.
    Refreshed,
    /// A stale entry owned by another node was taken over; epoch bumped.
    Takeover,
    /// Another node holds a live entry; the claim was not applied.
    Denied,
}

/// Input to the store-side compare-and-set claim.
///
/// `entry` is the template the caller wants written; the store fills in
/// `epoch` (and keeps `last_seen_at_ms` as the claim time supplied by the
/// caller). `stale_ms <= 0` disables takeover.
#[derive(Debug, Clone)]
pub struct SessionClaimRequest {
    pub entry: SessionEntry,
    pub stale_ms: i64,
    pub ttl: std::time::Duration,
}

/// Result of the store-side compare-and-set claim
#[derive(Debug, Clone)]
pub struct SessionClaimReply {
    pub status: ClaimStatus,
    pub previous_owner_node_id: Option<String>,
    pub epoch: u64,
}
