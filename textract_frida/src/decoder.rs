//! Decoding of managed runtime strings found in the target module's memory.
//!
//! The runtime lays a string out as a fixed header followed by inline UTF-16 code units:
//!
//! ```text
//! +-------+---------+--------+------------------------+
//! | klass | monitor | length | chars[length] (u16)    |
//! +-------+---------+--------+------------------------+
//! ```
//!
//! The projection to text is a lossy ASCII view: every code unit at or above `0x80`
//! (surrogate halves included) becomes a single `?`.

use std::ffi::c_void;

/// Longest string, in code units, that will be read
pub const MAX_STRING_LENGTH: i32 = 4096;

/// Text produced for a null string reference
pub const NULL_SENTINEL: &str = "<null>";

/// Replacement for code units outside of ASCII
pub const NON_ASCII_PLACEHOLDER: char = '?';

/// The in-memory header of a managed string
#[repr(C)]
#[derive(Debug)]
pub struct ManagedString {
    /// Type descriptor, opaque
    pub klass: *const c_void,
    /// Synchronization block, opaque
    pub monitor: *const c_void,
    /// Number of UTF-16 code units in [`ManagedString::chars`]
    pub length: i32,
    /// The first code unit; the rest follow inline
    pub chars: [u16; 0],
}

/// Placeholder for a string with an implausible length
#[must_use]
pub fn length_placeholder(length: i32) -> String {
    format!("<length={length}>")
}

/// Project UTF-16 code units onto ASCII
#[must_use]
pub fn narrow_utf16(units: &[u16]) -> String {
    units
        .iter()
        .map(|&unit| {
            if unit < 0x80 {
                char::from(unit as u8)
            } else {
                NON_ASCII_PLACEHOLDER
            }
        })
        .collect()
}

/// Describe the managed string at `string`.
///
/// * null → [`NULL_SENTINEL`]
/// * length below zero or above [`MAX_STRING_LENGTH`] → `<length=N>`, the characters are
///   never touched
/// * otherwise exactly `length` characters, see [`narrow_utf16`]
///
/// # Safety
/// `string` must be null or point to a readable string header, followed by at least
/// `length` readable code units whenever `length` is in range.
#[must_use]
pub unsafe fn describe(string: *const ManagedString) -> String {
    if string.is_null() {
        return NULL_SENTINEL.to_string();
    }

    let length = unsafe { std::ptr::addr_of!((*string).length).read_unaligned() };
    if !(0..=MAX_STRING_LENGTH).contains(&length) {
        return length_placeholder(length);
    }

    let chars = unsafe { std::ptr::addr_of!((*string).chars) } as *const u16;
    let units = unsafe { std::slice::from_raw_parts(chars, length as usize) };
    narrow_utf16(units)
}

/// `true` for texts the decoder produces in place of real content
#[must_use]
pub fn is_sentinel(text: &str) -> bool {
    text == NULL_SENTINEL
        || text
            .strip_prefix("<length=")
            .and_then(|rest| rest.strip_suffix('>'))
            .is_some_and(|n| n.parse::<i64>().is_ok())
}

/// A decoded string together with the verdict of the noise filter
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedString {
    /// The decoded text
    pub text: String,
    /// `true` if the text may be persisted
    pub accepted: bool,
}
