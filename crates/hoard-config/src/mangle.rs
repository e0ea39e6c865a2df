//! Reversible encoding of raw byte paths into filesystem-safe name components.
//!
//! Share names are arbitrary byte strings (they come straight from the backed-up
//! host, in whatever encoding its filesystem uses). Every byte outside
//! `[A-Za-z0-9-_.~]` is percent-encoded, so the result never contains a path
//! separator and round-trips exactly.

use std::borrow::Cow;

/// Encode a raw byte path as a single filename component.
pub fn mangle(raw: &[u8]) -> String {
    urlencoding::encode_binary(raw).into_owned()
}

/// Recover the raw byte path from a mangled component.
pub fn unmangle(mangled: &str) -> Vec<u8> {
    match urlencoding::decode_binary(mangled.as_bytes()) {
        Cow::Borrowed(b) => b.to_vec(),
        Cow::Owned(v) => v,
    }
}
