//! Lenient base64 for subscription bodies and URI parts.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine as _;

/// Decode standard or URL-safe base64, padded or not, ignoring whitespace.
pub fn decode_auto(input: &str) -> Option<Vec<u8>> {
    let clean: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let clean = clean.trim_end_matches('=');
    if clean.is_empty() {
        return None;
    }
    [&STANDARD_NO_PAD, &URL_SAFE_NO_PAD]
        .into_iter()
        .find_map(|engine| engine.decode(clean).ok())
}

/// [`decode_auto`] followed by strict UTF-8 decoding.
pub fn decode_text(input: &str) -> Option<String> {
    String::from_utf8(decode_auto(input)?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_and_unpadded() {
        assert_eq!(decode_auto("dGVzdA=="), Some(b"test".to_vec()));
        assert_eq!(decode_auto("dGVzdA"), Some(b"test".to_vec()));
        assert_eq!(decode_text("aGVsbG8gd29ybGQ=").as_deref(), Some("hello world"));
    }

    #[test]
    fn url_safe_and_wrapped_lines() {
        // "??>" encodes to "Pz8-" in the url-safe alphabet
        assert_eq!(decode_auto("Pz8-"), Some(b"??>".to_vec()));
        assert_eq!(decode_text("aGVs\nbG8=\n").as_deref(), Some("hello"));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(decode_auto(""), None);
        assert_eq!(decode_auto("!!!"), None);
        assert_eq!(decode_text("//79"), None); // 0xff 0xfe 0xfd is not utf-8
    }
}
