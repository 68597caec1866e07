//! HTTP surface: the command-control webhook plus a small job REST API.

pub mod handlers;
pub mod state;

pub use handlers::{create_router, ApiError};
pub use state::AppState;
