//! HTTP bridge surface.

mod auth;
mod error;
mod handlers;
mod routes;
mod state;

pub use auth::{ClientIdentity, auth_middleware};
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
