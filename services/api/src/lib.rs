//! Multi-tenant data-access boundary for the Armonía residential-complex
//! platform. Every request is bound to one complex's schema and reaches the
//! database only through a client scoped to that schema.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod services;
pub mod state;
pub mod store;
pub mod tenant;

pub use routes::router;
pub use state::AppState;
