//! Core domain entities and value objects

pub mod command;
pub mod identity;
pub mod session;
pub mod version;

pub use command::{CommandRequest, CommandType};
pub use identity::{AuthCredentials, AuthMode, CertificateBinding, ChargerIdentity, HashAlgorithm, IdentityStatus};
pub use session::{ConnectionMeta, SessionEntry};
pub use version::OcppVersion;
