//! Rate limiting and flood-log suppression
//!
//! Sliding-window counters live in the shared KV store so limits hold
//! across the cluster. Only a configured subset of actions is limited
//! (`MeterValues` and `StatusNotification` by default).
//!
//! The counter is incremented before the acceptance check, so the first
//! violating message is both counted and rejected and later messages in
//! the same window keep incrementing. Consumers tune limits accordingly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::kv::{KeyValueStore, KvError};

/// Rate-limiter knobs
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window_seconds: u64,
    pub per_charger_limit: i64,
    pub global_limit: i64,
    /// Actions subject to limiting.
    pub limited_actions: HashSet<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            per_charger_limit: 120,
            global_limit: 6_000,
            limited_actions: ["MeterValues", "StatusNotification"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

/// Decision for one inbound CALL
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    Limited {
        scope: String,
        limit: i64,
        action: String,
        window_seconds: u64,
    },
}

impl RateDecision {
    /// CallError details for a limited decision.
    pub fn error_details(&self) -> Value {
        match self {
            Self::Allowed => Value::Object(Default::default()),
            Self::Limited {
                scope,
                limit,
                action,
                window_seconds,
            } => json!({
                "scope": scope,
                "limit": limit,
                "action": action,
                "windowSeconds": window_seconds,
            }),
        }
    }
}

/// Cluster-wide sliding-window rate limiter
pub struct RateLimiter {
    kv: Arc<dyn KeyValueStore>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KeyValueStore>, settings: RateLimitSettings) -> Self {
        Self { kv, settings }
    }

    /// Count the action and decide. Unlimited actions short-circuit to
    /// `Allowed` without touching the store.
    pub async fn check(&self, action: &str, charge_point_id: &str) -> Result<RateDecision, KvError> {
        if !self.settings.limited_actions.contains(action) {
            return Ok(RateDecision::Allowed);
        }
        let window = Duration::from_secs(self.settings.window_seconds);

        let cp_key = format!("rate:{}:cp:{}", action, charge_point_id);
        let count = self.kv.increment(&cp_key, window).await?;
        if count > self.settings.per_charger_limit {
            return Ok(RateDecision::Limited {
                scope: format!("cp:{}", charge_point_id),
                limit: self.settings.per_charger_limit,
                action: action.to_string(),
                window_seconds: self.settings.window_seconds,
            });
        }

        let global_key = format!("rate:{}:global", action);
        let count = self.kv.increment(&global_key, window).await?;
        if count > self.settings.global_limit {
            return Ok(RateDecision::Limited {
                scope: "global".to_string(),
                limit: self.settings.global_limit,
                action: action.to_string(),
                window_seconds: self.settings.window_seconds,
            });
        }

        Ok(RateDecision::Allowed)
    }
}

// ── Flood-log suppression ──────────────────────────────────────

/// Categories of noisy sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodKind {
    Suspicious,
    Unauthorized,
}

impl FloodKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Suspicious => "suspicious",
            Self::Unauthorized => "unauthorized",
        }
    }
}

/// Log-once-per-cooldown gate keyed by source IP.
///
/// A KV claim with TTL decides whether this occurrence should be logged;
/// when the store is unreachable logging proceeds (losing suppression,
/// not evidence).
pub struct FloodControl {
    kv: Arc<dyn KeyValueStore>,
    cooldown: Duration,
}

impl FloodControl {
    pub fn new(kv: Arc<dyn KeyValueStore>, cooldown: Duration) -> Self {
        Self { kv, cooldown }
    }

    pub async fn should_log(&self, kind: FloodKind, ip: &str) -> bool {
        let key = format!("log:flood:{}:{}", kind.as_str(), ip);
        self.kv
            .put_if_absent(&key, "1", Some(self.cooldown))
            .await
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::kv::InMemoryKvStore;

    fn limiter(per_cp: i64, global: i64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(InMemoryKvStore::new()),
            RateLimitSettings {
                window_seconds: 60,
                per_charger_limit: per_cp,
                global_limit: global,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn unlimited_action_passes() {
        let rl = limiter(1, 1);
        for _ in 0..5 {
            assert_eq!(rl.check("BootNotification", "CP-1").await.unwrap(), RateDecision::Allowed);
        }
    }

    #[tokio::test]
    async fn per_charger_limit_trips_first() {
        let rl = limiter(2, 100);
        assert_eq!(rl.check("MeterValues", "CP-1").await.unwrap(), RateDecision::Allowed);
        assert_eq!(rl.check("MeterValues", "CP-1").await.unwrap(), RateDecision::Allowed);
        match rl.check("MeterValues", "CP-1").await.unwrap() {
            RateDecision::Limited { scope, limit, .. } => {
                assert_eq!(scope, "cp:CP-1");
                assert_eq!(limit, 2);
            }
            other => panic!("expected limited, got {:?}", other),
        }
        // a different charger has its own counter
        assert_eq!(rl.check("MeterValues", "CP-2").await.unwrap(), RateDecision::Allowed);
    }

    #[tokio::test]
    async fn rejected_messages_keep_counting() {
        let rl = limiter(1, 100);
        assert_eq!(rl.check("StatusNotification", "CP-1").await.unwrap(), RateDecision::Allowed);
        for _ in 0..3 {
            assert!(matches!(
                rl.check("StatusNotification", "CP-1").await.unwrap(),
                RateDecision::Limited { .. }
            ));
        }
    }

    #[tokio::test]
    async fn flood_control_logs_once_per_cooldown() {
        let kv = Arc::new(InMemoryKvStore::new());
        let flood = FloodControl::new(kv, Duration::from_secs(60));
        assert!(flood.should_log(FloodKind::Suspicious, "10.0.0.9").await);
        assert!(!flood.should_log(FloodKind::Suspicious, "10.0.0.9").await);
        // a different kind has its own key
        assert!(flood.should_log(FloodKind::Unauthorized, "10.0.0.9").await);
    }
}
