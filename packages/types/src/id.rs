//! Identifier composition and parsing.
//!
//! Branch and request identifiers travel over the wire as a single composed
//! string so a close can route to the right request without a separate rid
//! field: `<bid>:<rid>`. The same helper pair also splits `<rid>:<zone>`
//! pairs, where a missing zone half means the root async zone.

/// Delimiter between the halves of a composed identifier and between the
/// segments of an async-zone path.
pub const FULL_ID_DELIMITER: char = ':';

/// Short form of the root async zone, used on the wire when no zone is given.
pub const ROOT_ASYNC_ZONE_ID: &str = "r";

/// Head segment of every async-zone path (`root:<sid><n>:...`).
pub const ROOT_ASYNC_ZONE_PATH: &str = "root";

/// Name of the root service node.
pub const ROOT_SERVICE: &str = "";

/// `a` if `b` is empty, `a:b` otherwise.
pub fn compose_full_id(primary: &str, secondary: &str) -> String {
    if secondary.is_empty() {
        primary.to_string()
    } else {
        format!("{primary}{FULL_ID_DELIMITER}{secondary}")
    }
}

/// Split on the first `:`. A value without a delimiter is an original root
/// rid, so the secondary half defaults to the root async zone.
pub fn parse_full_id(full_id: &str) -> (&str, &str) {
    match full_id.split_once(FULL_ID_DELIMITER) {
        Some((primary, secondary)) => (primary, secondary),
        None => (full_id, ROOT_ASYNC_ZONE_ID),
    }
}
