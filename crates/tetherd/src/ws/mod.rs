//! Streaming side of the bridge surface.

mod handler;
mod hub;

pub use handler::ws_handler;
pub use hub::EventHub;

use std::sync::Arc;

use log::warn;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::agent::AgentSupervisor;

/// Forward every supervisor notification into the hub.
///
/// Runs for the lifetime of the supervisor; ends when the supervisor is
/// dropped.
pub fn spawn_event_pump(supervisor: Arc<AgentSupervisor>, hub: Arc<EventHub>) -> JoinHandle<()> {
    let mut notifications = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => hub.publish(&notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event pump lagged, {skipped} notification(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
