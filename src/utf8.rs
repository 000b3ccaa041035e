//! UTF-8 validation for text payloads.
//!
//! Thin wrapper over `simdutf8`, which picks SSE/AVX/NEON implementations
//! where available and falls back to the std validator elsewhere.

/// Validate that `data` is well-formed UTF-8.
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Borrow `data` as a `&str` if it is well-formed UTF-8.
#[inline]
pub fn as_utf8(data: &[u8]) -> Option<&str> {
    simdutf8::basic::from_utf8(data).ok()
}
