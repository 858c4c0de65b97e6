//! HTTP surface: routing, shared state, request handlers.

pub mod handlers;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
