//! Sentinel search helpers shared by the framers.

/// Returns the index of the first byte in `haystack` that is any of `needles`.
pub(crate) fn find_any(haystack: &[u8], needles: &[u8]) -> Option<usize> {
    haystack.iter().position(|b| needles.contains(b))
}

/// Returns the index of the first occurrence of `needle` in `haystack`.
///
/// An empty needle matches at index 0.
pub(crate) fn find_sequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
