//! HTTP API module.
//!
//! Health check, the chat websocket upgrade and a few REST endpoints over
//! presence and message history.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{DirectMessageRequest, DirectMessageResponse, HealthResponse};
pub use routes::create_router;
pub use state::AppState;
