//! Gateway server implementation

pub mod auth;
mod router;
mod server;

pub use auth::{AuthError, AuthGate, auth_middleware, extract_bearer};
pub use router::{AppState, create_router};
pub use server::Gateway;
