//! Gateway configuration
//!
//! TOML-based configuration with serde defaults, overridable by the
//! operational environment variables. Every integer knob has a default
//! and bounds checked once at startup; a bad value refuses to boot
//! rather than misbehaving quietly.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthSettings;
use crate::cluster::{NodeDirectorySettings, SessionDirectorySettings};
use crate::commands::CommandConsumerSettings;
use crate::infrastructure::{CircuitBreakerConfig, RateLimitSettings};
use crate::server::websocket::ServerSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("environment variable {name} is not a valid integer: {value}")]
    BadEnv { name: String, value: String },
}

/// Root gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Stable node identity; generated when empty.
    #[serde(default)]
    pub node_id: String,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub node_directory: NodeConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub commands: CommandConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on one inbound text frame (`OCPP_MAX_PAYLOAD_BYTES`).
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Frames buffered while admission runs (`OCPP_PENDING_MESSAGE_LIMIT`).
    #[serde(default = "default_pending_message_limit")]
    pub pending_message_limit: usize,
}

/// Session-directory timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// `SESSION_TTL_SECONDS`
    #[serde(default = "default_session_ttl")]
    pub ttl_seconds: u64,

    /// `SESSION_STALE_SECONDS`; zero disables takeover.
    #[serde(default = "default_session_stale")]
    pub stale_seconds: u64,
}

/// Node-directory timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// `NODE_TTL_SECONDS`
    #[serde(default = "default_node_ttl")]
    pub ttl_seconds: u64,

    /// `NODE_HEARTBEAT_SECONDS`
    #[serde(default = "default_node_heartbeat")]
    pub heartbeat_seconds: u64,
}

/// Connection-admission policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true")]
    pub allow_basic: bool,

    #[serde(default)]
    pub require_protocol_allowlist: bool,

    /// Trust `X-Forwarded-For` / `Forwarded` headers.
    #[serde(default)]
    pub trusted_proxy: bool,

    #[serde(default)]
    pub allowed_ips: Vec<String>,

    #[serde(default)]
    pub allowed_cidrs: Vec<String>,

    /// `FLOOD_LOG_COOLDOWN` (seconds)
    #[serde(default = "default_flood_cooldown")]
    pub flood_log_cooldown_seconds: u64,
}

/// Message-engine behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Response-cache TTL; zero or negative disables the cache.
    #[serde(default = "default_response_cache_ttl")]
    pub response_cache_ttl_seconds: i64,

    /// Mirror replies into the shared KV store as a second cache level.
    #[serde(default)]
    pub response_cache_shared: bool,

    /// Accept state-machine anomalies instead of rejecting them
    /// (MeterValues against an unknown transaction gets an `orphaned`
    /// marker on its event).
    #[serde(default)]
    pub lenient_state: bool,

    /// Actions whose schemas keep their own `additionalProperties`
    /// behaviour instead of being tightened to `false`.
    #[serde(default = "default_tighten_exempt")]
    pub tighten_exempt_actions: Vec<String>,
}

/// Outbound command handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Per-CALL reply deadline, overridable per command request.
    #[serde(default = "default_command_timeout")]
    pub timeout_seconds: u64,

    /// `COMMAND_IDEMPOTENCY_TTL_SECONDS`
    #[serde(default = "default_idempotency_ttl")]
    pub idempotency_ttl_seconds: u64,

    /// TTL on `command-audit:*` records.
    #[serde(default = "default_audit_ttl")]
    pub audit_ttl_seconds: u64,

    /// Base consumer group for the command topics.
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

/// Inbound rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window")]
    pub window_seconds: u64,

    #[serde(default = "default_rate_per_charger")]
    pub per_charger_limit: i64,

    #[serde(default = "default_rate_global")]
    pub global_limit: i64,

    #[serde(default = "default_limited_actions")]
    pub limited_actions: Vec<String>,
}

/// KV / bus circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_breaker_cooldown")]
    pub cooldown_seconds: u64,

    #[serde(default = "default_op_timeout_ms")]
    pub operation_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl GatewayConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: GatewayConfig = toml::from_str(&raw)?;
        config.apply_env()?;
        config.finalize()?;
        Ok(config)
    }

    /// Defaults + environment overrides (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = GatewayConfig::default();
        config.apply_env()?;
        config.finalize()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(node_id) = std::env::var("NODE_ID") {
            self.node_id = node_id;
        }
        if let Ok(host) = std::env::var("OCPP_WS_HOST") {
            self.server.host = host;
        }
        override_u64(&mut self.session.ttl_seconds, "SESSION_TTL_SECONDS")?;
        override_u64(&mut self.session.stale_seconds, "SESSION_STALE_SECONDS")?;
        override_u64(&mut self.node_directory.ttl_seconds, "NODE_TTL_SECONDS")?;
        override_u64(&mut self.node_directory.heartbeat_seconds, "NODE_HEARTBEAT_SECONDS")?;
        override_u64(&mut self.commands.idempotency_ttl_seconds, "COMMAND_IDEMPOTENCY_TTL_SECONDS")?;
        override_u64(&mut self.commands.timeout_seconds, "OCPP_COMMAND_TIMEOUT_SECONDS")?;
        override_u64(&mut self.auth.flood_log_cooldown_seconds, "FLOOD_LOG_COOLDOWN")?;
        override_usize(&mut self.server.max_payload_bytes, "OCPP_MAX_PAYLOAD_BYTES")?;
        override_usize(&mut self.server.pending_message_limit, "OCPP_PENDING_MESSAGE_LIMIT")?;
        override_u16(&mut self.server.port, "OCPP_WS_PORT")?;
        override_i64(&mut self.engine.response_cache_ttl_seconds, "OCPP_RESPONSE_CACHE_TTL_SECONDS")?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), ConfigError> {
        if self.node_id.trim().is_empty() {
            self.node_id = format!("node-{}", Uuid::new_v4());
        }
        self.validate()
    }

    /// Bounds checks; failures abort startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid(message));

        if self.server.port == 0 {
            return invalid("server.port must be non-zero".into());
        }
        if !(1_024..=16 * 1024 * 1024).contains(&self.server.max_payload_bytes) {
            return invalid("server.max_payload_bytes must be within 1KiB..16MiB".into());
        }
        if !(1..=10_000).contains(&self.server.pending_message_limit) {
            return invalid("server.pending_message_limit must be within 1..10000".into());
        }
        if !(5..=86_400).contains(&self.session.ttl_seconds) {
            return invalid("session.ttl_seconds must be within 5..86400".into());
        }
        if self.session.stale_seconds > self.session.ttl_seconds {
            return invalid("session.stale_seconds must not exceed session.ttl_seconds".into());
        }
        if !(5..=86_400).contains(&self.node_directory.ttl_seconds) {
            return invalid("node_directory.ttl_seconds must be within 5..86400".into());
        }
        if self.node_directory.heartbeat_seconds == 0
            || self.node_directory.heartbeat_seconds >= self.node_directory.ttl_seconds
        {
            return invalid("node_directory.heartbeat_seconds must be positive and below ttl_seconds".into());
        }
        if !(1..=300).contains(&self.commands.timeout_seconds) {
            return invalid("commands.timeout_seconds must be within 1..300".into());
        }
        if self.commands.idempotency_ttl_seconds == 0 || self.commands.audit_ttl_seconds == 0 {
            return invalid("command TTLs must be positive".into());
        }
        if !(1..=3_600).contains(&self.rate_limit.window_seconds) {
            return invalid("rate_limit.window_seconds must be within 1..3600".into());
        }
        if self.rate_limit.per_charger_limit <= 0 || self.rate_limit.global_limit <= 0 {
            return invalid("rate limits must be positive".into());
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return invalid("circuit breaker thresholds must be positive".into());
        }
        if !(50..=60_000).contains(&self.circuit_breaker.operation_timeout_ms) {
            return invalid("circuit_breaker.operation_timeout_ms must be within 50..60000".into());
        }
        if !["text", "json"].contains(&self.logging.format.as_str()) {
            return invalid("logging.format must be 'text' or 'json'".into());
        }
        Ok(())
    }

    // ── Component settings views ───────────────────────────

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            host: self.server.host.clone(),
            port: self.server.port,
            max_payload_bytes: self.server.max_payload_bytes,
            pending_message_limit: self.server.pending_message_limit,
        }
    }

    pub fn session_directory_settings(&self) -> SessionDirectorySettings {
        SessionDirectorySettings {
            ttl: Duration::from_secs(self.session.ttl_seconds),
            stale: Duration::from_secs(self.session.stale_seconds),
        }
    }

    pub fn node_directory_settings(&self) -> NodeDirectorySettings {
        NodeDirectorySettings {
            ttl: Duration::from_secs(self.node_directory.ttl_seconds),
            heartbeat: Duration::from_secs(self.node_directory.heartbeat_seconds),
        }
    }

    pub fn auth_settings(&self) -> AuthSettings {
        AuthSettings {
            allow_basic: self.auth.allow_basic,
            require_protocol_allowlist: self.auth.require_protocol_allowlist,
            trusted_proxy: self.auth.trusted_proxy,
            global_allowed_ips: self.auth.allowed_ips.clone(),
            global_allowed_cidrs: self.auth.allowed_cidrs.clone(),
        }
    }

    pub fn rate_limit_settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            window_seconds: self.rate_limit.window_seconds,
            per_charger_limit: self.rate_limit.per_charger_limit,
            global_limit: self.rate_limit.global_limit,
            limited_actions: self.rate_limit.limited_actions.iter().cloned().collect(),
        }
    }

    pub fn breaker_settings(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            success_threshold: self.circuit_breaker.success_threshold,
            cooldown: Duration::from_secs(self.circuit_breaker.cooldown_seconds),
            op_timeout: Duration::from_millis(self.circuit_breaker.operation_timeout_ms),
        }
    }

    pub fn consumer_settings(&self) -> CommandConsumerSettings {
        CommandConsumerSettings {
            group: self.commands.consumer_group.clone(),
            idempotency_ttl: Duration::from_secs(self.commands.idempotency_ttl_seconds),
        }
    }

    pub fn tighten_exempt(&self) -> HashSet<String> {
        self.engine.tighten_exempt_actions.iter().cloned().collect()
    }
}

fn override_u64(slot: &mut u64, name: &str) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *slot = value.parse().map_err(|_| ConfigError::BadEnv {
            name: name.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn override_usize(slot: &mut usize, name: &str) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *slot = value.parse().map_err(|_| ConfigError::BadEnv {
            name: name.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn override_u16(slot: &mut u16, name: &str) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *slot = value.parse().map_err(|_| ConfigError::BadEnv {
            name: name.to_string(),
            value,
        })?;
    }
    Ok(())
}

fn override_i64(slot: &mut i64, name: &str) -> Result<(), ConfigError> {
    if let Ok(value) = std::env::var(name) {
        *slot = value.parse().map_err(|_| ConfigError::BadEnv {
            name: name.to_string(),
            value,
        })?;
    }
    Ok(())
}

// ── Defaults ───────────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_max_payload_bytes() -> usize {
    131_072
}

fn default_pending_message_limit() -> usize {
    32
}

fn default_session_ttl() -> u64 {
    300
}

fn default_session_stale() -> u64 {
    90
}

fn default_node_ttl() -> u64 {
    120
}

fn default_node_heartbeat() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_flood_cooldown() -> u64 {
    300
}

fn default_response_cache_ttl() -> i64 {
    300
}

fn default_tighten_exempt() -> Vec<String> {
    vec!["DataTransfer".to_string()]
}

fn default_command_timeout() -> u64 {
    15
}

fn default_idempotency_ttl() -> u64 {
    86_400
}

fn default_audit_ttl() -> u64 {
    86_400
}

fn default_consumer_group() -> String {
    "ocpp-gateway".to_string()
}

fn default_rate_window() -> u64 {
    60
}

fn default_rate_per_charger() -> i64 {
    120
}

fn default_rate_global() -> i64 {
    6_000
}

fn default_limited_actions() -> Vec<String> {
    vec!["MeterValues".to_string(), "StatusNotification".to_string()]
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_cooldown() -> u64 {
    10
}

fn default_op_timeout_ms() -> u64 {
    1_500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_payload_bytes: default_max_payload_bytes(),
            pending_message_limit: default_pending_message_limit(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_session_ttl(),
            stale_seconds: default_session_stale(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_node_ttl(),
            heartbeat_seconds: default_node_heartbeat(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            allow_basic: true,
            require_protocol_allowlist: false,
            trusted_proxy: false,
            allowed_ips: Vec::new(),
            allowed_cidrs: Vec::new(),
            flood_log_cooldown_seconds: default_flood_cooldown(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_cache_ttl_seconds: default_response_cache_ttl(),
            response_cache_shared: false,
            lenient_state: false,
            tighten_exempt_actions: default_tighten_exempt(),
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_command_timeout(),
            idempotency_ttl_seconds: default_idempotency_ttl(),
            audit_ttl_seconds: default_audit_ttl(),
            consumer_group: default_consumer_group(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_rate_window(),
            per_charger_limit: default_rate_per_charger(),
            global_limit: default_rate_global(),
            limited_actions: default_limited_actions(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            cooldown_seconds: default_breaker_cooldown(),
            operation_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}
