//! Request parameter maps
//!
//! Requests are sent as `"<CMD> key1=val1&key2=val2"`. Keys are emitted in
//! sorted order so encoded output is deterministic, and values are escaped
//! with the usual query escaping (space as `+`, everything outside the
//! unreserved set percent-encoded).

use std::collections::BTreeMap;

/// An ordered request parameter map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    map: BTreeMap<String, String>,
}

impl Params {
    /// Create an empty parameter map
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing any existing value for the key
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.map.insert(key.into(), value.into());
        self
    }

    /// Get a parameter value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Check whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Encode the parameters as `key1=val1&key2=val2` with sorted keys
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (i, (key, value)) in self.map.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(&escape(key));
            out.push('=');
            out.push_str(&escape(value));
        }
        out
    }
}

/// Query-escape a single key or value.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char);
            }
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push_str(&format!("{b:02X}"));
            }
        }
    }
    out
}
