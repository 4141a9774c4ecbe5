use crate::error::ValidationError;

/// Bytes sniffed for binary content.
const SNIFF_LEN: usize = 8 * 1024;

/// Sanity checks before any decoder sees the payload.
pub fn validate_raw(raw: &[u8]) -> Result<(), ValidationError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| ValidationError::Unrecognized(format!("payload is not utf-8 text ({e})")))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyPayload);
    }
    let head = &raw[..raw.len().min(SNIFF_LEN)];
    if head.contains(&0) {
        return Err(ValidationError::Unrecognized("payload contains NUL bytes".into()));
    }
    let control = head
        .iter()
        .filter(|b| b.is_ascii_control() && !matches!(b, b'\n' | b'\r' | b'\t'))
        .count();
    // 控制字符占比过高视为二进制
    if control * 10 > head.len() {
        return Err(ValidationError::Unrecognized("payload looks binary".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_whitespace() {
        assert_eq!(validate_raw(b""), Err(ValidationError::EmptyPayload));
        assert_eq!(validate_raw(b" \n\t "), Err(ValidationError::EmptyPayload));
        assert_eq!(validate_raw("\u{feff}\n".as_bytes()), Err(ValidationError::EmptyPayload));
    }

    #[test]
    fn binary_and_non_utf8() {
        assert!(matches!(validate_raw(b"ab\0cd"), Err(ValidationError::Unrecognized(_))));
        assert!(matches!(validate_raw(&[0xff, 0xfe, 0x41]), Err(ValidationError::Unrecognized(_))));
        assert!(matches!(
            validate_raw(b"\x01\x02\x03\x04ab"),
            Err(ValidationError::Unrecognized(_))
        ));
    }

    #[test]
    fn text_passes() {
        assert!(validate_raw(b"ss://abc@1.1.1.1:1\r\n").is_ok());
        assert!(validate_raw(b"{\"outbounds\":[]}").is_ok());
    }
}
