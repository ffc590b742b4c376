//! Authentication module.
//!
//! Provides the token verification seam used by the chat gateway and the
//! REST middleware:
//! - HS256 JWT validation (production)
//! - `dev:<user_id>` tokens for configured dev users (dev mode)

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::{Claims, Role};
pub use config::{AuthConfig, ConfigValidationError, DevUser};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, SharedVerifier, TokenVerifier, auth_middleware};
