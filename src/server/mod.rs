//! WebSocket server
//!
//! Accept loop, upgrade admission (path, subprotocol, credentials,
//! ownership claim) and the per-connection gateway loop.

pub mod path;
pub mod registry;
pub mod websocket;

pub use path::{negotiate_subprotocol, parse_connect_path, ConnectPath};
pub use registry::{ConnectionHandle, ConnectionRegistry, OutboundMessage};
pub use websocket::GatewayServer;
