//! OCPP message engine
//!
//! The per-version adapters map incoming actions to responses and domain
//! events; the state store carries per-charger transaction and connector
//! state; the response cache makes replies idempotent per messageId; the
//! engine glues them together behind schema validation.

pub mod adapter;
pub mod engine;
pub mod response_cache;
pub mod state;
pub mod v16;
pub mod v201;
pub mod v21;

pub use adapter::{AdapterSet, CallContext, CallErrorBody, EmittedEvent, HandleOutcome, VersionAdapter};
pub use engine::MessageEngine;
pub use response_cache::ResponseCache;
pub use state::StateStore;
