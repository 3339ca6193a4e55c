//! Multi-string handling for reader lists
//!
//! PC/SC reports reader names as a double-null-terminated multi-string.

/// Decode a double-null-terminated multi-string into its segments.
///
/// Parsing stops at the empty segment that terminates the list; trailing
/// garbage past it is ignored. Non-UTF-8 bytes are replaced lossily.
pub fn decode_multi_string(buf: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        match buf[pos..].iter().position(|&b| b == 0) {
            None | Some(0) => break,
            Some(len) => {
                names.push(String::from_utf8_lossy(&buf[pos..pos + len]).into_owned());
                pos += len + 1;
            }
        }
    }
    names
}

/// Encode segments as a double-null-terminated multi-string.
pub fn encode_multi_string<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
    let mut buf = Vec::new();
    for name in names {
        buf.extend_from_slice(name.as_ref().as_bytes());
        buf.push(0);
    }
    buf.push(0);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_two_readers() {
        let buf = b"Reader A\0Reader B\0\0";
        assert_eq!(decode_multi_string(buf), vec!["Reader A", "Reader B"]);
    }

    #[test]
    fn decode_empty_list() {
        assert_eq!(decode_multi_string(b"\0"), Vec::<String>::new());
        assert_eq!(decode_multi_string(b""), Vec::<String>::new());
    }

    #[test]
    fn encode_decode_round_trip() {
        let original: &[u8] = b"Gemalto PC Twin Reader 00 00\0ACS ACR122U 01 00\0\0";
        let names = decode_multi_string(original);
        assert_eq!(encode_multi_string(&names), original);

        let single: &[u8] = b"SCM SCR 3310 00 00\0\0";
        assert_eq!(encode_multi_string(&decode_multi_string(single)), single);
    }
}
