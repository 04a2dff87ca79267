use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Verb of an observed HTTP request. Unrecognized verbs never reach this type —
/// the decoder rejects them as [`crate::decode::ParseOutcome::NotHttp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
        };
        f.write_str(s)
    }
}

impl HttpMethod {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "DELETE" => HttpMethod::Delete,
            "PATCH" => HttpMethod::Patch,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            _ => return None,
        })
    }
}

/// Direction of an observed message. Requests and responses are captured
/// independently; a response is only attributable to a request by flow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    Request,
    Response,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureKind::Request => f.write_str("request"),
            CaptureKind::Response => f.write_str("response"),
        }
    }
}

/// Textual representation of a captured body: kept lossless regardless of
/// the original encoding (UTF-8, Latin-1, or opaque binary).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "lowercase")]
pub enum BodyText {
    Utf8(String),
    Latin1(String),
    Hex(String),
}

impl BodyText {
    /// Decode raw bytes with the UTF-8 -> Latin-1 -> hex fallback chain.
    /// Never lossy-truncates: every byte is represented in the output.
    pub fn decode(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(s) => BodyText::Utf8(s.to_string()),
            Err(_) => {
                // Latin-1 maps every byte 0..=255 to a codepoint, so this never fails.
                let s: String = bytes.iter().map(|&b| b as char).collect();
                if s.chars().all(|c| !c.is_control() || c == '\n' || c == '\r' || c == '\t') {
                    BodyText::Latin1(s)
                } else {
                    BodyText::Hex(hex_encode(bytes))
                }
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            BodyText::Utf8(s) | BodyText::Latin1(s) | BodyText::Hex(s) => s,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Maximum body size surfaced on a [`Capture`]; longer bodies are truncated
/// after decoding. Framing (Content-Length completeness) is unaffected.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// A single observed HTTP request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capture {
    pub id: String,
    pub kind: CaptureKind,
    pub timestamp: SystemTime,
    pub node: String,
    pub service: String,
    pub method: HttpMethod,
    pub endpoint: String,
    pub url: String,
    pub host: Option<String>,
    pub src_addr: String,
    pub dst_addr: String,
    #[serde(default)]
    pub request_headers: HashMap<String, String>,
    pub request_body: Option<BodyText>,
    pub status_code: Option<u16>,
    pub status_text: Option<String>,
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    pub response_body: Option<BodyText>,
    pub http_version: String,
}

impl Capture {
    pub fn is_request(&self) -> bool {
        self.kind == CaptureKind::Request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_utf8_decodes_as_utf8() {
        let body = BodyText::decode(b"{\"a\":1}");
        match body {
            BodyText::Utf8(s) => assert_eq!(s, "{\"a\":1}"),
            other => panic!("expected Utf8, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_without_control_bytes_decodes_as_latin1() {
        // 0xE9 is a lone continuation-less lead byte: invalid UTF-8 on its
        // own, but every byte maps cleanly onto the Latin-1 codepage with no
        // disallowed control characters.
        let bytes = b"He\xE9llo";
        let body = BodyText::decode(bytes);
        match body {
            BodyText::Latin1(s) => assert_eq!(s, "He\u{e9}llo"),
            other => panic!("expected Latin1, got {other:?}"),
        }
    }

    #[test]
    fn invalid_utf8_with_control_bytes_decodes_as_hex() {
        // 0xFF is invalid UTF-8 on its own, and 0x01 (SOH) is a control byte
        // outside the \n/\r/\t allowance, so this must fall all the way
        // through to the hex representation.
        let bytes = [0xFFu8, 0x01];
        let body = BodyText::decode(&bytes);
        match body {
            BodyText::Hex(s) => assert_eq!(s, "ff01"),
            other => panic!("expected Hex, got {other:?}"),
        }
    }

    #[test]
    fn newline_and_tab_control_bytes_stay_on_latin1_path() {
        // \n, \r, and \t are control characters but explicitly allowed, so a
        // body that is otherwise invalid UTF-8 but only carries these should
        // still land on Latin1 rather than falling to hex.
        let bytes = b"line1\nline2\r\n\tindented\xE9";
        let body = BodyText::decode(bytes);
        assert!(matches!(body, BodyText::Latin1(_)));
    }

    #[test]
    fn every_byte_is_represented_regardless_of_encoding() {
        let utf8_bytes = "héllo".as_bytes();
        let utf8_body = BodyText::decode(utf8_bytes);
        assert!(matches!(utf8_body, BodyText::Utf8(_)));

        let latin1_bytes = b"h\xE9llo";
        let latin1_body = BodyText::decode(latin1_bytes);
        if let BodyText::Latin1(s) = &latin1_body {
            assert_eq!(s.chars().count(), latin1_bytes.len());
        } else {
            panic!("expected Latin1, got {latin1_body:?}");
        }

        let binary_bytes = [0x00u8, 0xFFu8, 0x07u8];
        let hex_body = BodyText::decode(&binary_bytes);
        if let BodyText::Hex(s) = &hex_body {
            assert_eq!(s.len(), binary_bytes.len() * 2);
        } else {
            panic!("expected Hex, got {hex_body:?}");
        }
    }
}
