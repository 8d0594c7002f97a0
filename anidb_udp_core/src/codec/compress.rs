//! Raw DEFLATE decompression
//!
//! The server compresses large responses when the session was opened with
//! `comp=1`. A compressed datagram starts with two zero bytes followed by
//! a raw DEFLATE stream. Compression is never applied to requests.

use std::io::Read;

use flate2::read::DeflateDecoder;

use crate::error::{ProtocolError, Result};

/// Length of the two-zero-byte compression marker
pub(crate) const COMPRESSED_PREFIX_LEN: usize = 2;

/// Check for the compression marker.
pub(crate) fn is_compressed(data: &[u8]) -> bool {
    data.len() > COMPRESSED_PREFIX_LEN && data[0] == 0 && data[1] == 0
}

/// Inflate the DEFLATE stream that follows the marker.
pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::framing(format!("inflate: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_is_compressed() {
        assert!(is_compressed(&[0, 0, 1]));
        assert!(!is_compressed(&[0, 0]));
        assert!(!is_compressed(&[0, 1, 2]));
        assert!(!is_compressed(b"7 300 PONG"));
        assert!(!is_compressed(&[]));
    }

    #[test]
    fn test_decompress_roundtrip() {
        let body = b"7 300 PONG";
        assert_eq!(decompress(&deflate(body)).unwrap(), body);
    }

    #[test]
    fn test_decompress_garbage_is_framing_error() {
        let err = decompress(&[0xff, 0xfe, 0xfd, 0xfc]).unwrap_err();
        assert!(matches!(err, ProtocolError::Framing { .. }));
    }
}
