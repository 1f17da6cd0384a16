//! Agent process supervision.

mod supervisor;

pub use supervisor::{
    AgentHealth, AgentSupervisor, CallError, Notification, NotificationBody, RuntimeStatus,
    SupervisorConfig,
};
