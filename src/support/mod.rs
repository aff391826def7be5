//! Cross-cutting utilities

pub mod ocpp_frame;
pub mod shutdown;

pub use ocpp_frame::{call_error, call_result, FrameError, OcppFrame};
pub use shutdown::ShutdownSignal;
