//! Outbound command pipeline
//!
//! Commands arrive from the CPMS on the bus, get routed to the owning
//! node, deduplicated, mapped to OCPP CALLs, sent, and their replies
//! tracked against timeouts with an audit trail in the KV store.

pub mod audit;
pub mod consumer;
pub mod dispatcher;
pub mod tracker;

pub use audit::{AuditState, CommandAudit, CommandAuditRecord};
pub use consumer::{CommandConsumer, CommandConsumerSettings, TOPIC_COMMAND_REQUESTS};
pub use dispatcher::{CommandDispatcher, DispatchFailure, DispatchOutcome};
pub use tracker::{RequestTracker, TrackedReply};
