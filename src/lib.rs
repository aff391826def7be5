//! # OCPP Gateway
//!
//! Horizontally-scaled gateway between EV charge points and a back-office
//! CPMS. Charge points connect over WebSocket (OCPP 1.6J / 2.0.1 / 2.1),
//! the gateway answers their calls locally after schema validation and
//! relays telemetry onto the event bus, while remote-control commands are
//! consumed back off that bus and dispatched to the owning node.
//!
//! ## Layout
//!
//! - **support**: Cross-cutting utilities (OCPP-J framing, shutdown)
//! - **domain**: Core entities and value objects (identity, session, commands)
//! - **schema**: Per-version JSON-Schema registry with tightening
//! - **ocpp**: Message engine, version adapters, charge-point state, response cache
//! - **auth**: Connection admission (credentials, allow-lists, mTLS bindings)
//! - **cluster**: Session ownership, node directory, cross-node session control
//! - **commands**: Outbound request tracker, command dispatcher and consumer
//! - **events**: Outbound event envelopes and publishing
//! - **infrastructure**: KV / bus ports, circuit breaker, rate limiting
//! - **server**: WebSocket accept loop and connection registry
//! - **config**: Gateway configuration (TOML + environment overrides)

pub mod auth;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod domain;
pub mod events;
pub mod infrastructure;
pub mod ocpp;
pub mod schema;
pub mod server;
pub mod support;

// Re-export commonly used types at crate root
pub use config::GatewayConfig;
pub use domain::OcppVersion;
pub use infrastructure::{EventBus, InMemoryEventBus, InMemoryKvStore, KeyValueStore};
pub use server::GatewayServer;
pub use support::ocpp_frame::OcppFrame;
