//! Decoding of the MIME body found inside an extra-payload section.
//!
//! Scripts emit a `multipart/form-data` message with one JSON part. The helper
//! library writes the JSON verbatim even though the part declares
//! `Content-Transfer-Encoding: base64`, so bodies are tried as raw JSON first
//! and base64-decoded only when that fails.

use base64::Engine;
use serde_json::{Map, Value};

use crate::error::FrameError;

type Headers = Vec<(String, String)>;

/// Decode every JSON object carried by `section`.
pub fn decode_payload(section: &str) -> Result<Vec<Map<String, Value>>, FrameError> {
    let trimmed = section.trim_start();
    if trimmed.starts_with('{') {
        return decode_json(trimmed, None).map(|object| vec![object]);
    }

    let (headers, body) = split_message(section);
    let content_type = header(&headers, "content-type").unwrap_or_default();

    if !content_type.to_ascii_lowercase().starts_with("multipart/") {
        return decode_json(body, header(&headers, "content-transfer-encoding")).map(|o| vec![o]);
    }

    let boundary = content_type_param(content_type, "boundary")
        .ok_or_else(|| FrameError::Payload("multipart body without boundary".to_string()))?;

    let mut objects = Vec::new();
    for part in split_parts(body, &boundary) {
        let (part_headers, part_body) = split_message(&part);
        let encoding = header(&part_headers, "content-transfer-encoding");
        objects.push(decode_json(part_body, encoding)?);
    }
    Ok(objects)
}

/// Split a message into its header block and body at the first blank line.
fn split_message(message: &str) -> (Headers, &str) {
    let mut headers: Headers = Vec::new();
    let mut offset = 0;

    for line in message.split_inclusive('\n') {
        offset += line.len();
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return (headers, &message[offset..]);
        }
        match line.split_once(':') {
            Some((name, value)) if !line.starts_with([' ', '\t']) => {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
            // Folded continuation of the previous header.
            _ => {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
            }
        }
    }
    (headers, "")
}

fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn content_type_param(content_type: &str, name: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// Collect the raw text of each part between `--boundary` delimiters.
fn split_parts(body: &str, boundary: &str) -> Vec<String> {
    let delimiter = format!("--{boundary}");
    let closing = format!("--{boundary}--");

    let mut parts = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in body.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim() == closing {
            break;
        }
        if line.trim() == delimiter {
            if let Some(lines) = current.take() {
                parts.push(lines.join("\n"));
            }
            current = Some(Vec::new());
            continue;
        }
        if let Some(lines) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some(lines) = current {
        parts.push(lines.join("\n"));
    }
    parts
}

fn decode_json(body: &str, encoding: Option<&str>) -> Result<Map<String, Value>, FrameError> {
    let body = body.trim();
    let raw_error = match serde_json::from_str::<Value>(body) {
        Ok(value) => return into_object(value),
        Err(e) => e,
    };

    if encoding.is_some_and(|e| e.eq_ignore_ascii_case("base64")) {
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| FrameError::Payload(format!("invalid base64 body: {e}")))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|e| FrameError::Payload(format!("invalid JSON body: {e}")))?;
        return into_object(value);
    }

    Err(FrameError::Payload(format!("invalid JSON body: {raw_error}")))
}

fn into_object(value: Value) -> Result<Map<String, Value>, FrameError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(FrameError::Payload(format!(
            "expected a JSON object, found {other}"
        ))),
    }
}
