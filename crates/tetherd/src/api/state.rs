//! Application state shared across handlers.

use std::sync::Arc;

use crate::agent::AgentSupervisor;
use crate::pairing::PairingGuard;
use crate::ws::EventHub;

/// Application state shared across all handlers.
///
/// Constructed once at startup and handed to the router; there is no
/// ambient global lookup.
#[derive(Clone)]
pub struct AppState {
    /// Supervisor for the one agent process.
    pub supervisor: Arc<AgentSupervisor>,
    /// Pairing guard for authentication.
    pub pairing: Arc<PairingGuard>,
    /// Fan-out hub for streaming subscribers.
    pub hub: Arc<EventHub>,
}

impl AppState {
    pub fn new(supervisor: AgentSupervisor, pairing: PairingGuard) -> Self {
        Self {
            supervisor: Arc::new(supervisor),
            pairing: Arc::new(pairing),
            hub: Arc::new(EventHub::new()),
        }
    }
}
