use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::{DecodeError, Engine};

/// URL-safe base64 without padding, the encoding used for every binary field
/// on the wire (signatures, ciphertexts, wrapped keys).
pub fn encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode, tolerating input that still carries `=` padding.
pub fn decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD.decode(s.trim_end_matches('='))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for sample in [&b""[..], b"A", b"OK", b"hi", b"hello world", b"\x00\xff\x10"] {
            let enc = encode(sample);
            assert!(!enc.contains('='));
            assert_eq!(decode(&enc).unwrap(), sample);
        }
    }

    #[test]
    fn tolerates_padding() {
        assert_eq!(decode("aGk=").unwrap(), b"hi");
        assert_eq!(decode("aGk").unwrap(), b"hi");
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode("not base64!!").is_err());
    }
}
