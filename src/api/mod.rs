//! HTTP surface: routes, middleware, and server assembly.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;

pub use server::{build_router, AppState};
