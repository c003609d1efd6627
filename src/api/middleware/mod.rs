//! Request middleware.

pub mod auth;
pub mod request_log;

pub use auth::require_api_key;
pub use request_log::log_requests;
