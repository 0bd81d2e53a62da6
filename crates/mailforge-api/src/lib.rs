//! Mailforge API - REST API server
//!
//! Routes under `/api/v1`: authentication, sending, admin CRUD, campaign
//! actions, and the public tracking hooks.

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
