//! D-Bus signature type system
//!
//! Pure functions over signature strings. A signature is an ASCII string
//! where each character (or bracketed group) denotes one D-Bus type:
//!
//! - fixed scalars: `y` (byte), `b` (boolean), `n`/`q` (16-bit), `i`/`u`
//!   (32-bit), `x`/`t` (64-bit), `d` (double), `h` (unix fd)
//! - string-like: `s` (string), `o` (object path), `g` (signature)
//! - containers: `a` (array), `(`...`)` (struct), `{`...`}` (dict entry),
//!   `v` (variant)
//!
//! The two scanners [`is_single_complete_type`] and
//! [`next_single_complete_type_idx`] are what lets the codec split a
//! multi-argument signature into per-argument sub-signatures; everything
//! downstream relies on their bracket counting being exact.
//!
//! Note: `x`, `t` and `h` are *recognized* here (classification and
//! alignment) but rejected by the codec — 64-bit integers and fd passing are
//! intentionally unsupported (values ride as IEEE-754 doubles).

/// Returned by [`next_single_complete_type_idx`] on malformed input.
pub const INVALID_TYPE_IDX: usize = usize::MAX;

/// Whether `c` is a basic (non-container) type character.
///
/// Includes the string-like types, matching the D-Bus notion of "basic":
/// any type that is legal as a dict-entry key.
pub fn is_basic_type(c: u8) -> bool {
    matches!(
        c,
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b'h'
    ) || is_string_like_type(c)
}

/// Whether `c` is a string-like type character (`s`, `o`, `g`).
pub fn is_string_like_type(c: u8) -> bool {
    matches!(c, b's' | b'o' | b'g')
}

/// Whether `c` opens a container type (`a`, `v`, `(`, `{`).
pub fn is_container_type(c: u8) -> bool {
    matches!(c, b'a' | b'v' | b'(' | b'{')
}

/// Required stream alignment for a type, by its leading character.
///
/// Struct and dict-entry containers align to 8 regardless of their first
/// member; array length fields align to 4; variants align to 1 (the embedded
/// signature field has no padding).
pub fn alignment_of(c: u8) -> usize {
    match c {
        b'y' | b'g' | b'v' => 1,
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b'h' | b's' | b'o' | b'a' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// Fixed byte width of an integer-like scalar, or `None` for everything else.
///
/// `b` counts as a 4-byte integer on the wire (0 or 1).
pub fn fixed_int_size(c: u8) -> Option<usize> {
    match c {
        b'y' => Some(1),
        b'n' | b'q' => Some(2),
        b'b' | b'i' | b'u' | b'h' => Some(4),
        b'x' | b't' => Some(8),
        _ => None,
    }
}

/// Whether the integer type character is signed (`n`, `i`, `x`).
pub fn is_signed_int(c: u8) -> bool {
    matches!(c, b'n' | b'i' | b'x')
}

/// Validate that `sig` is exactly one complete type.
///
/// Handles nested `(`...`)` / `{`...`}` groups by bracket counting and
/// nested arrays by recursing on the remainder after the `a` prefix. The
/// empty signature is not a complete type.
pub fn is_single_complete_type(sig: &str) -> bool {
    let bytes = sig.as_bytes();
    let Some(&first) = bytes.first() else {
        return false;
    };
    match first {
        b'a' => is_single_complete_type(&sig[1..]),
        b'(' => {
            if matching_bracket_end(bytes, 0) != Some(bytes.len()) {
                return false;
            }
            // interior must split into one or more complete members
            let inner = &sig[1..sig.len() - 1];
            !inner.is_empty() && splits_cleanly(inner)
        }
        b'{' => {
            if matching_bracket_end(bytes, 0) != Some(bytes.len()) {
                return false;
            }
            // exactly (basic key, single complete value)
            let inner = &sig[1..sig.len() - 1];
            let inner_bytes = inner.as_bytes();
            if inner_bytes.is_empty() || !is_basic_type(inner_bytes[0]) {
                return false;
            }
            is_single_complete_type(&inner[1..])
        }
        b'v' => bytes.len() == 1,
        c if is_basic_type(c) => bytes.len() == 1,
        _ => false,
    }
}

/// Index immediately after the next single complete type starting at `start`.
///
/// Returns [`INVALID_TYPE_IDX`] when `start` is out of range or the input is
/// malformed (unbalanced brackets, a stray closing bracket, an unknown type
/// character, or an `a` with nothing after it).
pub fn next_single_complete_type_idx(sig: &str, start: usize) -> usize {
    let bytes = sig.as_bytes();
    if start >= bytes.len() {
        return INVALID_TYPE_IDX;
    }
    match bytes[start] {
        b'a' => next_single_complete_type_idx(sig, start + 1),
        b'(' | b'{' => match matching_bracket_end(bytes, start) {
            Some(end) => end,
            None => INVALID_TYPE_IDX,
        },
        b'v' => start + 1,
        c if is_basic_type(c) => start + 1,
        _ => INVALID_TYPE_IDX,
    }
}

/// Partition a multi-argument signature into single complete types.
///
/// `"si"` becomes `["s", "i"]`; `"a{sv}u"` becomes `["a{sv}", "u"]`. Fails
/// with `None` on malformed input. The empty signature partitions into an
/// empty vector.
pub fn split_signature(sig: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    let mut pos = 0;
    while pos < sig.len() {
        let next = next_single_complete_type_idx(sig, pos);
        if next == INVALID_TYPE_IDX {
            return None;
        }
        let part = &sig[pos..next];
        if !is_single_complete_type(part) {
            return None;
        }
        parts.push(part);
        pos = next;
    }
    Some(parts)
}

/// Index one past the bracket matching the opener at `start`, counting both
/// `()` and `{}` pairs so nested groups of either kind are skipped.
fn matching_bracket_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, &c) in bytes.iter().enumerate().skip(start) {
        match c {
            b'(' | b'{' => depth += 1,
            b')' | b'}' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn splits_cleanly(sig: &str) -> bool {
    let mut pos = 0;
    while pos < sig.len() {
        let next = next_single_complete_type_idx(sig, pos);
        if next == INVALID_TYPE_IDX || !is_single_complete_type(&sig[pos..next]) {
            return false;
        }
        pos = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(is_basic_type(b'y'));
        assert!(is_basic_type(b's'));
        assert!(!is_basic_type(b'a'));
        assert!(is_string_like_type(b'o'));
        assert!(!is_string_like_type(b'i'));
        assert!(is_container_type(b'a'));
        assert!(is_container_type(b'v'));
        assert!(!is_container_type(b'd'));
    }

    #[test]
    fn test_single_complete_basic() {
        assert!(is_single_complete_type("i"));
        assert!(is_single_complete_type("v"));
        assert!(!is_single_complete_type(""));
        assert!(!is_single_complete_type("ii"));
        assert!(!is_single_complete_type("a"));
        assert!(!is_single_complete_type(")"));
    }

    #[test]
    fn test_single_complete_containers() {
        assert!(is_single_complete_type("ai"));
        assert!(is_single_complete_type("aai"));
        assert!(is_single_complete_type("(ii)"));
        assert!(is_single_complete_type("(i(ss))"));
        assert!(is_single_complete_type("a{sv}"));
        assert!(is_single_complete_type("a{s(iu)}"));
        assert!(!is_single_complete_type("(ii"));
        assert!(!is_single_complete_type("()"));
        assert!(!is_single_complete_type("{vs}")); // variant key is not basic
        assert!(!is_single_complete_type("{sii}")); // three members
        assert!(!is_single_complete_type("(ii)(ii)"));
    }

    #[test]
    fn test_next_idx_walks_arguments() {
        let sig = "sa{sv}u(ii)ad";
        let mut pos = 0;
        let mut parts = Vec::new();
        while pos < sig.len() {
            let next = next_single_complete_type_idx(sig, pos);
            assert_ne!(next, INVALID_TYPE_IDX);
            parts.push(&sig[pos..next]);
            pos = next;
        }
        assert_eq!(parts, vec!["s", "a{sv}", "u", "(ii)", "ad"]);
    }

    #[test]
    fn test_next_idx_malformed() {
        assert_eq!(next_single_complete_type_idx("", 0), INVALID_TYPE_IDX);
        assert_eq!(next_single_complete_type_idx("a", 0), INVALID_TYPE_IDX);
        assert_eq!(next_single_complete_type_idx("(ii", 0), INVALID_TYPE_IDX);
        assert_eq!(next_single_complete_type_idx("}", 0), INVALID_TYPE_IDX);
        assert_eq!(next_single_complete_type_idx("i", 5), INVALID_TYPE_IDX);
    }

    #[test]
    fn test_split_signature() {
        assert_eq!(split_signature("si").unwrap(), vec!["s", "i"]);
        assert_eq!(split_signature("").unwrap(), Vec::<&str>::new());
        assert_eq!(
            split_signature("aa{s(ii)}v").unwrap(),
            vec!["aa{s(ii)}", "v"]
        );
        assert!(split_signature("a").is_none());
        assert!(split_signature("s)i").is_none());
    }

    #[test]
    fn test_alignments() {
        assert_eq!(alignment_of(b'y'), 1);
        assert_eq!(alignment_of(b'n'), 2);
        assert_eq!(alignment_of(b's'), 4);
        assert_eq!(alignment_of(b'd'), 8);
        assert_eq!(alignment_of(b'('), 8);
        assert_eq!(alignment_of(b'{'), 8);
        assert_eq!(alignment_of(b'a'), 4);
        assert_eq!(alignment_of(b'v'), 1);
    }
}
