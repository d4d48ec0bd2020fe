use std::sync::Arc;

use crate::event::Readiness;

/// Something the reactor can hand readiness events to.
///
/// Handlers run on worker threads, possibly several at once for the same
/// token, so implementations synchronize their own state.
pub trait EventHandler {
    fn handle_event(&self, event: &Readiness);
}

pub type SharedHandler = Arc<dyn EventHandler + Send + Sync>;
