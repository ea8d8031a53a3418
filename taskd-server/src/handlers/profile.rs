//! Configuration and profile mutation handlers
//!
//! Like task mutations these are fire-and-forget; a failed mutation is
//! logged by the router and leaves engine state untouched. Callers
//! observe the result by issuing a follow-up query.

use tracing::debug;

use taskd_protocol::ConfigurationValues;
use taskd_utils::Result;

use super::{HandlerContext, HandlerResult};

impl HandlerContext {
    pub(super) async fn set_configuration(
        &self,
        values: ConfigurationValues,
    ) -> Result<HandlerResult> {
        self.engine.set_configuration(values).await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn create_profile(&self, name: &str) -> Result<HandlerResult> {
        let id = self.engine.create_profile(name).await?;
        debug!("Profile {} created ({})", name, id);
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn set_active_profile(&self, name: &str) -> Result<HandlerResult> {
        self.engine.set_active_profile(name).await?;
        Ok(HandlerResult::NoResponse)
    }

    pub(super) async fn delete_profile(&self, name: &str) -> Result<HandlerResult> {
        self.engine.delete_profile(name).await?;
        Ok(HandlerResult::NoResponse)
    }
}
