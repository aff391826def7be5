//! OCPP 2.1 adapter
//!
//! Call semantics match 2.0.1; the version tag differs for schema lookup
//! and error spelling, and 2.1 ships its own (wider) schema map.

use serde_json::Value;

use crate::domain::OcppVersion;

use super::adapter::{CallContext, HandleOutcome, VersionAdapter};
use super::state::StateStore;
use super::v201::V2xCore;

pub struct V21Adapter {
    core: V2xCore,
}

impl V21Adapter {
    pub fn new() -> Self {
        Self {
            core: V2xCore::new(OcppVersion::V21),
        }
    }
}

impl VersionAdapter for V21Adapter {
    fn version(&self) -> OcppVersion {
        OcppVersion::V21
    }

    fn handle_call(
        &self,
        action: &str,
        payload: &Value,
        ctx: &CallContext<'_>,
        state: &StateStore,
    ) -> HandleOutcome {
        self.core.handle_call(action, payload, ctx, state)
    }
}
