//! Git packet-line encoding.
//!
//! Each packet line is prefixed with a hex length that includes the prefix
//! itself.  `0000` is the flush packet.  Only encoding is needed here: the
//! service banner in front of a ref advertisement is the one thing the server
//! frames itself, everything else comes straight from `git`.

/// The flush packet (`0000`), marking the end of a section.
pub const FLUSH_PKT: &[u8] = b"0000";

/// Encode `data` as a packet line.
///
/// The length is written in lowercase hex and left-padded with zeros to a
/// multiple of four digits.  Callers include any trailing newline themselves.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    let mut prefix = format!("{total_len:x}");
    let pad = (4 - prefix.len() % 4) % 4;
    prefix.insert_str(0, &"0".repeat(pad));

    let mut buf = Vec::with_capacity(prefix.len() + data.len());
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// The `# service=git-<service>` banner that precedes a protocol v0 ref
/// advertisement, followed by a flush packet.
pub fn service_banner(service: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("# service=git-{service}\n").as_bytes());
    buf.extend_from_slice(FLUSH_PKT);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_pkt_line() {
        assert_eq!(encode_pkt_line(b"hello\n"), b"000ahello\n");
    }

    #[test]
    fn test_encode_pkt_line_empty() {
        assert_eq!(encode_pkt_line(b""), b"0004");
    }

    #[test]
    fn test_length_counts_prefix() {
        let payload = vec![b'x'; 0xfff0 - 4];
        let encoded = encode_pkt_line(&payload);
        assert_eq!(&encoded[..4], b"fff0");
        assert_eq!(encoded.len(), 0xfff0);
    }

    #[test]
    fn test_oversized_payload_pads_to_eight_digits() {
        let payload = vec![b'x'; 0x10000];
        let encoded = encode_pkt_line(&payload);
        assert_eq!(&encoded[..8], b"00010004");
    }

    #[test]
    fn test_service_banner() {
        let banner = service_banner("upload-pack");
        assert_eq!(banner, b"001e# service=git-upload-pack\n0000");
    }
}
