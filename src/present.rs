use serde::Serialize;

use crate::{
    headers::HeaderMultimap,
    models::{Event, encode_base64},
};

/// Readable rendering of one captured body. The exact captured bytes always
/// survive in `base64`; `text` is a best-effort display form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresentedBody {
    pub text: String,
    pub encoding: &'static str,
    pub base64: String,
    pub truncated: bool,
}

/// Display form of a stored event returned by the read API when `raw=1` is
/// not requested.
#[derive(Debug, Clone, Serialize)]
pub struct PresentedEvent {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub started_at: String,
    pub ended_at: String,
    pub method: String,
    pub url: String,
    pub status: i64,
    pub req_headers: serde_json::Value,
    pub resp_headers: serde_json::Value,
    pub req_body: PresentedBody,
    pub resp_body: PresentedBody,
    pub redaction_applied: String,
}

pub fn present_event(event: &Event) -> PresentedEvent {
    let req_headers = parse_stored_headers(&event.req_headers);
    let resp_headers = parse_stored_headers(&event.resp_headers);

    PresentedEvent {
        id: event.id.clone(),
        session_id: event.session_id.clone(),
        seq: event.seq,
        started_at: event.started_at.clone(),
        ended_at: event.ended_at.clone(),
        method: event.method.clone(),
        url: event.url.clone(),
        status: event.status,
        req_body: present_body(&event.req_body, &req_headers),
        resp_body: present_body(&event.resp_body, &resp_headers),
        req_headers: headers_json(&event.req_headers, &req_headers),
        resp_headers: headers_json(&event.resp_headers, &resp_headers),
        redaction_applied: event.redaction_applied.clone(),
    }
}

pub fn present_body(bytes: &[u8], headers: &HeaderMultimap) -> PresentedBody {
    // Truncation is judged against Content-Length even when nothing was
    // captured, as for a body dropped entirely at the capture limit.
    let truncated = is_truncated(bytes.len(), headers);

    if bytes.is_empty() {
        return PresentedBody {
            text: String::new(),
            encoding: "empty",
            base64: String::new(),
            truncated,
        };
    }

    let base64 = encode_base64(bytes);
    let content_type = headers.first("Content-Type").unwrap_or("");

    if is_textual_media_type(content_type) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            if is_json_media_type(content_type) {
                if let Some(pretty) = pretty_print_json(text) {
                    return PresentedBody {
                        text: pretty,
                        encoding: "json",
                        base64,
                        truncated,
                    };
                }
            }
            return PresentedBody {
                text: text.to_owned(),
                encoding: "text",
                base64,
                truncated,
            };
        }
    }

    PresentedBody {
        text: String::new(),
        encoding: "base64",
        base64,
        truncated,
    }
}

/// Truncation means the origin declared more bytes than were captured: the
/// Content-Length header parses as a positive integer strictly greater than
/// the stored length.
fn is_truncated(captured_len: usize, headers: &HeaderMultimap) -> bool {
    let Some(declared) = headers.first("Content-Length") else {
        return false;
    };
    match declared.trim().parse::<u64>() {
        Ok(declared) if declared > 0 => declared > captured_len as u64,
        _ => false,
    }
}

/// Media-type classification: parameters are ignored, matching is ASCII
/// case-insensitive.
fn is_textual_media_type(content_type: &str) -> bool {
    let media_type = normalize_media_type(content_type);
    media_type.starts_with("text/")
        || matches!(
            media_type.as_str(),
            "application/json" | "application/xml" | "application/x-www-form-urlencoded"
        )
        || media_type.ends_with("+json")
        || media_type.ends_with("+xml")
}

/// Anything whose media type mentions json, so `text/json` and vendor
/// `+json` suffixes pretty-print too.
fn is_json_media_type(content_type: &str) -> bool {
    normalize_media_type(content_type).contains("json")
}

fn normalize_media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

fn pretty_print_json(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"  ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    serde::Serialize::serialize(&value, &mut serializer).ok()?;
    String::from_utf8(out).ok()
}

fn parse_stored_headers(raw: &str) -> HeaderMultimap {
    HeaderMultimap::from_json(raw).unwrap_or_default()
}

/// Headers as stored, or `{"_raw": ...}` if the stored JSON no longer parses.
fn headers_json(raw: &str, parsed: &HeaderMultimap) -> serde_json::Value {
    if parsed.is_empty() && !matches!(raw.trim(), "" | "{}") {
        if serde_json::from_str::<serde_json::Value>(raw).is_err()
            || HeaderMultimap::from_json(raw).is_err()
        {
            return serde_json::json!({ "_raw": raw });
        }
    }
    serde_json::to_value(parsed).unwrap_or_else(|_| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::{present_body, present_event};
    use crate::{headers::HeaderMultimap, models::{Event, encode_base64, now_rfc3339}};

    fn headers(content_type: Option<&str>, content_length: Option<&str>) -> HeaderMultimap {
        let mut map = HeaderMultimap::new();
        if let Some(content_type) = content_type {
            map.append("Content-Type", content_type);
        }
        if let Some(content_length) = content_length {
            map.append("Content-Length", content_length);
        }
        map
    }

    #[test]
    fn empty_body_presents_as_empty() {
        let body = present_body(b"", &headers(Some("application/json"), None));
        assert_eq!(body.encoding, "empty");
        assert_eq!(body.text, "");
        assert_eq!(body.base64, "");
        assert!(!body.truncated);
    }

    #[test]
    fn json_body_pretty_prints_with_two_space_indent() {
        let body = present_body(
            br#"{"b":2,"a":{"nested":true}}"#,
            &headers(Some("application/json; charset=utf-8"), None),
        );
        assert_eq!(body.encoding, "json");
        assert!(body.text.contains("\n  \"b\": 2"), "text: {}", body.text);
        assert!(body.text.contains("\n    \"nested\": true"), "text: {}", body.text);
        assert_eq!(body.base64, encode_base64(br#"{"b":2,"a":{"nested":true}}"#));
    }

    #[test]
    fn invalid_json_with_json_type_falls_back_to_text() {
        let body = present_body(b"not-json{", &headers(Some("application/json"), None));
        assert_eq!(body.encoding, "text");
        assert_eq!(body.text, "not-json{");
    }

    #[test]
    fn text_json_media_types_pretty_print_as_json() {
        let body = present_body(br#"{"k":1}"#, &headers(Some("text/json"), None));
        assert_eq!(body.encoding, "json");
        assert!(body.text.contains("\"k\": 1"), "text: {}", body.text);

        let body = present_body(br#"{"k":1}"#, &headers(Some("text/x-json; charset=utf-8"), None));
        assert_eq!(body.encoding, "json");
    }

    #[test]
    fn suffix_media_types_classify_as_textual() {
        let body = present_body(br#"{"k":1}"#, &headers(Some("application/vnd.api+json"), None));
        assert_eq!(body.encoding, "json");

        let body = present_body(b"<r/>", &headers(Some("Application/Soap+XML"), None));
        assert_eq!(body.encoding, "text");

        let body = present_body(b"a=1&b=2", &headers(Some("application/x-www-form-urlencoded"), None));
        assert_eq!(body.encoding, "text");
    }

    #[test]
    fn binary_and_invalid_utf8_present_as_base64_only() {
        let raw = [0xff, 0xfe, 0x00, 0x01];
        let body = present_body(&raw, &headers(Some("application/octet-stream"), None));
        assert_eq!(body.encoding, "base64");
        assert_eq!(body.text, "");
        assert_eq!(body.base64, encode_base64(&raw));

        // Textual content type but invalid UTF-8 bytes.
        let body = present_body(&[0xff, 0x80], &headers(Some("text/plain"), None));
        assert_eq!(body.encoding, "base64");
    }

    #[test]
    fn truncation_requires_a_larger_parsed_content_length() {
        let bytes = b"12345";
        assert!(present_body(bytes, &headers(None, Some("9"))).truncated);
        assert!(!present_body(bytes, &headers(None, Some("5"))).truncated);
        assert!(!present_body(bytes, &headers(None, Some("3"))).truncated);
        assert!(!present_body(bytes, &headers(None, None)).truncated);
        assert!(!present_body(bytes, &headers(None, Some("not-a-number"))).truncated);
        assert!(!present_body(bytes, &headers(None, Some("-1"))).truncated);

        // Zero captured bytes still count as truncated when the origin
        // declared a positive length, as in a HEAD-style exchange.
        let empty = present_body(b"", &headers(None, Some("5")));
        assert_eq!(empty.encoding, "empty");
        assert!(empty.truncated);
        assert!(!present_body(b"", &headers(None, Some("0"))).truncated);
        assert!(!present_body(b"", &headers(None, None)).truncated);
    }

    #[test]
    fn content_type_lookup_is_case_insensitive() {
        let mut map = HeaderMultimap::new();
        map.append("CONTENT-TYPE", "application/json");
        let body = present_body(br#"{"k":1}"#, &map);
        assert_eq!(body.encoding, "json");
    }

    #[test]
    fn presented_event_carries_headers_and_both_bodies() {
        let mut req_headers = HeaderMultimap::new();
        req_headers.append("Content-Type", "application/json");
        let event = Event {
            id: "event_1".to_owned(),
            session_id: "sess_1".to_owned(),
            seq: 3,
            started_at: now_rfc3339(),
            ended_at: now_rfc3339(),
            method: "PUT".to_owned(),
            url: "/things/9".to_owned(),
            status: 200,
            req_headers: req_headers.to_json().unwrap(),
            resp_headers: "{}".to_owned(),
            req_body: br#"{"v":1}"#.to_vec(),
            resp_body: Vec::new(),
            redaction_applied: String::new(),
        };

        let presented = present_event(&event);
        assert_eq!(presented.seq, 3);
        assert_eq!(presented.req_body.encoding, "json");
        assert_eq!(presented.resp_body.encoding, "empty");
        assert_eq!(
            presented.req_headers,
            serde_json::json!({"Content-Type": ["application/json"]})
        );
    }

    #[test]
    fn unparsable_stored_headers_surface_as_raw() {
        let event = Event {
            id: "event_1".to_owned(),
            session_id: "sess_1".to_owned(),
            seq: 1,
            started_at: now_rfc3339(),
            ended_at: now_rfc3339(),
            method: "GET".to_owned(),
            url: "/".to_owned(),
            status: 200,
            req_headers: "not-json".to_owned(),
            resp_headers: "{}".to_owned(),
            req_body: Vec::new(),
            resp_body: Vec::new(),
            redaction_applied: String::new(),
        };

        let presented = present_event(&event);
        assert_eq!(
            presented.req_headers,
            serde_json::json!({"_raw": "not-json"})
        );
    }
}
