//! Job identifier generation.

use uuid::Uuid;

/// Generate a fresh random job identifier.
///
/// The canonical form is the hyphenated UUIDv4 rendering
/// (`xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx` where `y` is 8, 9, a, or b).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
