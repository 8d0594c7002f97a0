//! Response parsing
//!
//! A response datagram has the form `<tag> <code> <header>\n<row>\n<row>…`
//! after any decryption and decompression. The tag is split off by the
//! multiplexer before parsing; rows are `|`-separated with the protocol's
//! field escapes.

use crate::error::{ProtocolError, Result, ReturnCode};

/// A parsed server response, without the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Return code from the first line
    pub code: ReturnCode,
    /// Whatever trailed the code on the first line
    pub header: String,
    /// Data rows from subsequent non-empty lines
    pub rows: Vec<Vec<String>>,
}

impl Response {
    /// Check if the return code indicates success
    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Split the tag off the front of a response body.
///
/// If the body contains no space, the whole input is the tag and the
/// payload is empty.
pub(crate) fn split_tag(data: &[u8]) -> (&[u8], &[u8]) {
    match data.iter().position(|&b| b == b' ') {
        Some(i) => (&data[..i], &data[i + 1..]),
        None => (data, &[]),
    }
}

/// Parse a response, without the tag.
///
/// Zero-length input means the multiplexer delivered the empty close
/// payload and is reported as [`ProtocolError::ConnectionClosed`].
pub(crate) fn parse_response(data: &[u8]) -> Result<Response> {
    if data.is_empty() {
        return Err(ProtocolError::ConnectionClosed);
    }
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split('\n');
    let first = lines.next().unwrap_or_default();
    let (code, header) = match first.split_once(' ') {
        Some((code, header)) => (code, header),
        None => (first, ""),
    };
    let code: u16 = code
        .parse()
        .map_err(|_| ProtocolError::framing(format!("invalid return code {code:?}")))?;
    let rows = lines
        .filter(|line| !line.is_empty())
        .map(|line| line.split('|').map(unescape_field).collect())
        .collect();
    Ok(Response {
        code: ReturnCode(code),
        header: header.to_string(),
        rows,
    })
}

/// Unescape one field of a response row.
fn unescape_field(s: &str) -> String {
    s.replace("<br />", "\n").replace('`', "'").replace('/', "|")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_code_header_rows() {
        let resp = parse_response(b"300 PONG\n123").unwrap();
        assert_eq!(resp.code, ReturnCode(300));
        assert_eq!(resp.header, "PONG");
        assert_eq!(resp.rows, vec![vec!["123".to_string()]]);
        assert!(resp.is_success());
    }

    #[test]
    fn test_parse_code_only() {
        let resp = parse_response(b"203").unwrap();
        assert_eq!(resp.code, ReturnCode(203));
        assert_eq!(resp.header, "");
        assert!(resp.rows.is_empty());
    }

    #[test]
    fn test_parse_multiple_rows_and_fields() {
        let resp = parse_response(b"220 FILE\na|b|c\nd|e").unwrap();
        assert_eq!(
            resp.rows,
            vec![
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                vec!["d".to_string(), "e".to_string()],
            ]
        );
    }

    #[test]
    fn test_parse_skips_empty_lines() {
        let resp = parse_response(b"220 FILE\n\nrow\n").unwrap();
        assert_eq!(resp.rows, vec![vec!["row".to_string()]]);
    }

    #[test]
    fn test_parse_unescapes_fields() {
        let resp = parse_response(b"230 ANIME\nline one<br />line two|it`s|a/b").unwrap();
        assert_eq!(
            resp.rows,
            vec![vec![
                "line one\nline two".to_string(),
                "it's".to_string(),
                "a|b".to_string(),
            ]]
        );
    }

    #[test]
    fn test_parse_empty_input_is_closed() {
        let err = parse_response(b"").unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn test_parse_bad_code_is_framing_error() {
        let err = parse_response(b"PONG 300").unwrap_err();
        assert!(matches!(err, ProtocolError::Framing { .. }));
    }

    #[test]
    fn test_split_tag() {
        let (tag, rest) = split_tag(b"5 300 PONG\n123");
        assert_eq!(tag, b"5");
        assert_eq!(rest, b"300 PONG\n123");

        let (tag, rest) = split_tag(b"5");
        assert_eq!(tag, b"5");
        assert_eq!(rest, b"");

        let (tag, rest) = split_tag(b"");
        assert_eq!(tag, b"");
        assert_eq!(rest, b"");
    }

    #[test]
    fn test_unescape_order() {
        // The break escape contains a slash; it must be handled before the
        // pipe escape so it doesn't turn into a literal pipe.
        assert_eq!(unescape_field("a<br />b"), "a\nb");
    }
}
