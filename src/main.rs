//! OCPP gateway entrypoint
//!
//! Wires the in-memory single-node stack: KV store and event bus behind
//! their ports, schema registry, message engine, session/node
//! directories, command pipeline, and the WebSocket server. Production
//! deployments swap the port implementations at these construction
//! sites.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ocpp_gateway::auth::Authenticator;
use ocpp_gateway::cluster::{NodeDirectory, SessionControl, SessionDirectory};
use ocpp_gateway::commands::{CommandAudit, CommandConsumer, CommandDispatcher, RequestTracker};
use ocpp_gateway::config::GatewayConfig;
use ocpp_gateway::events::EventPublisher;
use ocpp_gateway::infrastructure::{
    CircuitBreaker, FloodControl, GuardedKvStore, InMemoryEventBus, InMemoryKvStore, RateLimiter,
};
use ocpp_gateway::ocpp::{MessageEngine, ResponseCache, StateStore};
use ocpp_gateway::schema::SchemaRegistry;
use ocpp_gateway::server::registry::ConnectionRegistry;
use ocpp_gateway::server::GatewayServer;
use ocpp_gateway::support::shutdown::{listen_for_shutdown_signals, ShutdownSignal};
use ocpp_gateway::{EventBus, KeyValueStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Configuration ──────────────────────────────────────
    let config = match std::env::var("OCPP_GATEWAY_CONFIG").map(PathBuf::from) {
        Ok(path) => GatewayConfig::load(&path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        Err(_) => GatewayConfig::from_env().context("building config from environment")?,
    };

    // ── Logging ────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(node_id = config.node_id.as_str(), "Starting OCPP gateway");

    let shutdown = ShutdownSignal::new();
    tokio::spawn(listen_for_shutdown_signals(shutdown.clone()));

    // ── Ports (in-memory here; external in production) ─────
    let kv_breaker = Arc::new(CircuitBreaker::new("kv", config.breaker_settings()));
    let bus_breaker = Arc::new(CircuitBreaker::new("bus", config.breaker_settings()));
    let raw_kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::new());
    let kv: Arc<dyn KeyValueStore> = Arc::new(GuardedKvStore::new(raw_kv, kv_breaker));
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());

    // ── Core components ────────────────────────────────────
    let schemas = Arc::new(
        SchemaRegistry::load(&config.tighten_exempt()).context("compiling OCPP schemas")?,
    );
    let publisher = Arc::new(EventPublisher::new(
        bus.clone(),
        bus_breaker.clone(),
        config.node_id.clone(),
    ));
    let state = Arc::new(StateStore::new(config.engine.lenient_state));
    let cache_store = config
        .engine
        .response_cache_shared
        .then(|| kv.clone());
    let cache = ResponseCache::new(config.engine.response_cache_ttl_seconds, cache_store);
    let rate_limiter = RateLimiter::new(kv.clone(), config.rate_limit_settings());
    let tracker = Arc::new(RequestTracker::new(schemas.clone()));
    let engine = Arc::new(MessageEngine::new(
        schemas.clone(),
        state,
        cache,
        rate_limiter,
        publisher.clone(),
        tracker.clone(),
    ));

    let flood = Arc::new(FloodControl::new(
        kv.clone(),
        Duration::from_secs(config.auth.flood_log_cooldown_seconds),
    ));
    let authenticator = Arc::new(Authenticator::new(
        kv.clone(),
        config.auth_settings(),
        FloodControl::new(
            kv.clone(),
            Duration::from_secs(config.auth.flood_log_cooldown_seconds),
        ),
    ));

    let sessions = Arc::new(SessionDirectory::new(
        kv.clone(),
        config.node_id.clone(),
        config.session_directory_settings(),
    ));
    let nodes = Arc::new(NodeDirectory::new(
        kv.clone(),
        config.node_id.clone(),
        config.node_directory_settings(),
    ));
    nodes.register().await.context("advertising node in directory")?;
    nodes.clone().spawn_heartbeat(shutdown.clone());

    let registry = Arc::new(ConnectionRegistry::new());
    let session_control = Arc::new(SessionControl::new(
        bus.clone(),
        bus_breaker.clone(),
        config.node_id.clone(),
    ));
    session_control.spawn_consumer(
        registry.clone(),
        format!("{}-{}", config.commands.consumer_group, config.node_id),
        shutdown.clone(),
    );

    // ── Command pipeline ───────────────────────────────────
    let audit = Arc::new(CommandAudit::new(
        kv.clone(),
        publisher.clone(),
        Duration::from_secs(config.commands.audit_ttl_seconds),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        registry.clone(),
        tracker.clone(),
        schemas.clone(),
        audit,
        Duration::from_secs(config.commands.timeout_seconds),
    ));
    let consumer = Arc::new(CommandConsumer::new(
        bus.clone(),
        kv.clone(),
        registry.clone(),
        sessions.clone(),
        nodes.clone(),
        dispatcher,
        publisher.clone(),
        config.node_id.clone(),
        config.consumer_settings(),
    ));
    consumer.spawn(shutdown.clone());

    // ── Serve ──────────────────────────────────────────────
    let server = Arc::new(GatewayServer::new(
        config.server_settings(),
        registry,
        engine,
        authenticator,
        sessions,
        session_control,
        publisher,
        flood,
        shutdown.clone(),
    ));
    server.run().await.context("running WebSocket server")?;

    info!("Gateway stopped");
    Ok(())
}
