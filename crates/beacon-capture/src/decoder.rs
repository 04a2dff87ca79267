use std::collections::HashMap;

use beacon_core::decode::ParseOutcome;
use beacon_core::trace::{BodyText, Capture, CaptureKind, HttpMethod, MAX_BODY_BYTES};

use crate::flow_table::RequestContext;

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE", "CONNECT",
];

/// Locate the end of the header block (the byte past the terminating blank
/// line), or `None` if the buffer doesn't contain one yet.
fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_headers(block: &[u8]) -> Option<(String, HashMap<String, String>)> {
    let text = std::str::from_utf8(block).ok()?;
    let mut lines = text.split("\r\n");
    let start_line = lines.next()?.to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some(idx) = line.find(':') else { continue };
        let key = line[..idx].trim().to_string();
        let value = line[idx + 1..].trim().to_string();
        headers.insert(key, value);
    }
    Some((start_line, headers))
}

fn header_ci<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn content_length(headers: &HashMap<String, String>) -> Option<usize> {
    header_ci(headers, "Content-Length")?.trim().parse().ok()
}

/// Attempt to parse one HTTP request out of the front of `buf`. Returns
/// `NotHttp` if the buffer doesn't start with a recognized verb, `Incomplete`
/// if the headers or declared body haven't fully arrived, or `Complete` with
/// the number of bytes to drain from the buffer.
pub fn try_parse_request(
    buf: &[u8],
    src: (std::net::IpAddr, u16),
    dst: (std::net::IpAddr, u16),
    node: &str,
) -> ParseOutcome {
    if !METHODS.iter().any(|m| buf.starts_with(m.as_bytes())) {
        return ParseOutcome::NotHttp;
    }
    let Some(hdr_end) = header_end(buf) else {
        return ParseOutcome::Incomplete;
    };
    let Some((start_line, headers)) = parse_headers(&buf[..hdr_end - 4]) else {
        return ParseOutcome::Incomplete;
    };
    let mut parts = start_line.split_whitespace();
    let Some(method_str) = parts.next() else {
        return ParseOutcome::NotHttp;
    };
    let Some(method) = HttpMethod::parse(method_str) else {
        return ParseOutcome::NotHttp;
    };
    let Some(target) = parts.next() else {
        return ParseOutcome::Incomplete;
    };
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let declared_len = content_length(&headers);
    let available_body = buf.len().saturating_sub(hdr_end);

    let body_needed = declared_len.unwrap_or(0);
    let has_body_requirement = matches!(
        method,
        HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch
    );

    if let Some(needed) = declared_len {
        if available_body < needed {
            return ParseOutcome::Incomplete;
        }
    } else if has_body_requirement && available_body == 0 {
        // No Content-Length and no body yet on a body-bearing verb: headers
        // alone are still treated as complete (body is simply absent).
    }

    let consumed = hdr_end + body_needed;
    let raw_body = &buf[hdr_end..(hdr_end + body_needed).min(buf.len())];

    if has_body_requirement {
        if let Some(needed) = declared_len {
            if raw_body.len() != needed {
                return ParseOutcome::Incomplete;
            }
        }
    }

    let host = header_ci(&headers, "Host").map(str::to_string);
    let url = reconstruct_url(target, host.as_deref());

    let body = if raw_body.is_empty() {
        None
    } else {
        Some(BodyText::decode(&raw_body[..raw_body.len().min(MAX_BODY_BYTES)]))
    };

    let capture = Capture {
        id: capture_id(),
        kind: CaptureKind::Request,
        timestamp: std::time::SystemTime::now(),
        node: node.to_string(),
        service: String::new(),
        method,
        endpoint: target.to_string(),
        url,
        host,
        src_addr: format!("{}:{}", src.0, src.1),
        dst_addr: format!("{}:{}", dst.0, dst.1),
        request_headers: headers,
        request_body: body,
        status_code: None,
        status_text: None,
        response_headers: HashMap::new(),
        response_body: None,
        http_version: version,
    };

    ParseOutcome::Complete {
        capture: Box::new(capture),
        consumed,
    }
}

/// Attempt to parse one HTTP response out of the front of `buf`, stamping
/// method/endpoint/host/service from the reverse flow's last request.
pub fn try_parse_response(
    buf: &[u8],
    src: (std::net::IpAddr, u16),
    dst: (std::net::IpAddr, u16),
    node: &str,
    request_ctx: Option<&RequestContext>,
) -> ParseOutcome {
    if !buf.starts_with(b"HTTP/") {
        return ParseOutcome::NotHttp;
    }
    let Some(hdr_end) = header_end(buf) else {
        return ParseOutcome::Incomplete;
    };
    let Some((start_line, headers)) = parse_headers(&buf[..hdr_end - 4]) else {
        return ParseOutcome::Incomplete;
    };
    let mut parts = start_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();
    let Some(status_str) = parts.next() else {
        return ParseOutcome::Incomplete;
    };
    let Ok(status_code) = status_str.parse::<u16>() else {
        return ParseOutcome::NotHttp;
    };
    let status_text = parts.next().map(str::to_string);

    let declared_len = content_length(&headers);
    let available_body = buf.len().saturating_sub(hdr_end);
    let body_needed = declared_len.unwrap_or(0);

    if let Some(needed) = declared_len {
        if available_body < needed {
            return ParseOutcome::Incomplete;
        }
    }

    let consumed = hdr_end + body_needed;
    let raw_body = &buf[hdr_end..(hdr_end + body_needed).min(buf.len())];
    let body = if raw_body.is_empty() {
        None
    } else {
        Some(BodyText::decode(&raw_body[..raw_body.len().min(MAX_BODY_BYTES)]))
    };

    let (method, endpoint, host, service) = match request_ctx {
        Some(ctx) => (
            ctx.method,
            ctx.endpoint.clone(),
            ctx.host.clone(),
            ctx.service.clone(),
        ),
        None => (HttpMethod::Get, "/".to_string(), None, "unknown".to_string()),
    };

    let url = reconstruct_url(&endpoint, host.as_deref());

    let capture = Capture {
        id: capture_id(),
        kind: CaptureKind::Response,
        timestamp: std::time::SystemTime::now(),
        node: node.to_string(),
        service,
        method,
        endpoint,
        url,
        host,
        src_addr: format!("{}:{}", src.0, src.1),
        dst_addr: format!("{}:{}", dst.0, dst.1),
        request_headers: HashMap::new(),
        request_body: None,
        status_code: Some(status_code),
        status_text,
        response_headers: headers,
        response_body: body,
        http_version: version,
    };

    ParseOutcome::Complete {
        capture: Box::new(capture),
        consumed,
    }
}

fn reconstruct_url(target: &str, host: Option<&str>) -> String {
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.to_string();
    }
    match host {
        Some(h) => format!("http://{h}{target}"),
        None => target.to_string(),
    }
}

fn capture_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("cap-{n:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> (IpAddr, u16) {
        (IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn parses_simple_get() {
        let buf = b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n";
        let outcome = try_parse_request(buf, addr(1), addr(2), "node-a");
        match outcome {
            ParseOutcome::Complete { capture, consumed } => {
                assert_eq!(capture.method, HttpMethod::Get);
                assert_eq!(capture.endpoint, "/x");
                assert_eq!(capture.host.as_deref(), Some("h"));
                assert!(capture.request_body.is_none());
                assert_eq!(consumed, buf.len());
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_post_body_preserves_buffer() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 7\r\n\r\n{\"a\":1";
        let outcome = try_parse_request(buf, addr(1), addr(2), "node-a");
        assert!(matches!(outcome, ParseOutcome::Incomplete));
    }

    #[test]
    fn complete_post_body_matches_content_length() {
        let buf = b"POST /x HTTP/1.1\r\nContent-Length: 7\r\n\r\n{\"a\":1}";
        let outcome = try_parse_request(buf, addr(1), addr(2), "node-a");
        match outcome {
            ParseOutcome::Complete { capture, consumed } => {
                assert_eq!(capture.request_body.unwrap().as_str(), "{\"a\":1}");
                assert_eq!(consumed, buf.len());
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn pipelined_second_request_left_for_next_parse() {
        let buf = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let outcome = try_parse_request(buf, addr(1), addr(2), "node-a");
        match outcome {
            ParseOutcome::Complete { capture, consumed } => {
                assert_eq!(capture.endpoint, "/a");
                assert!(consumed < buf.len());
                let remaining = &buf[consumed..];
                let second = try_parse_request(remaining, addr(1), addr(2), "node-a");
                match second {
                    ParseOutcome::Complete { capture, .. } => assert_eq!(capture.endpoint, "/b"),
                    other => panic!("expected Complete, got {other:?}"),
                }
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn non_http_bytes_rejected() {
        let buf = b"\x16\x03\x01\x00\x50garbage";
        let outcome = try_parse_request(buf, addr(1), addr(2), "node-a");
        assert!(matches!(outcome, ParseOutcome::NotHttp));
    }
}
