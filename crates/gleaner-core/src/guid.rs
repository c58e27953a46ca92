//! Identifier validation.
//!
//! Some catalogs answer an out-of-range page with a record whose identifier
//! is really the error message ("Start position 50 greater than matches").
//! Such strings must never reach the ledger or the fetch stage.

/// Substrings that mark an identifier as a leaked paging error.
///
/// Matched case-insensitively.
pub const INVALID_GUID_MARKERS: &[&str] = &["start position", "greater than"];

/// Returns true if `guid` must be skipped: blank, or carrying a paging error marker.
///
/// # Examples
///
/// ```
/// use gleaner_core::guid::is_invalid_guid;
///
/// assert!(is_invalid_guid("Start position 50 greater than matches"));
/// assert!(is_invalid_guid("   "));
/// assert!(!is_invalid_guid("8a1c9f0e-2d44-4c1b-9a3e-0b5b1d2f7c11"));
/// ```
pub fn is_invalid_guid(guid: &str) -> bool {
    if guid.trim().is_empty() {
        return true;
    }
    let lowered = guid.to_lowercase();
    INVALID_GUID_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
