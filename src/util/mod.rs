//! Small shared utilities.

pub mod id;

pub use id::new_id;
