//! Cluster coordination
//!
//! Session ownership (single writer per charger across nodes), the node
//! directory advertising routing topics, and the cross-node session
//! control channel used on takeover.

pub mod node_directory;
pub mod session_control;
pub mod session_directory;

pub use node_directory::{
    command_topic_for, session_control_topic_for, NodeDirectory, NodeDirectorySettings, NodeEntry,
};
pub use session_control::{ForceDisconnect, SessionControl, CLOSE_SESSION_TRANSFERRED};
pub use session_directory::{SessionDirectory, SessionDirectorySettings};
