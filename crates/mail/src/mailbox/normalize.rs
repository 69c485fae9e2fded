//! Wire response normalization
//!
//! Converts provider message payloads to domain models.

use anyhow::{Context, Result};
use base64::prelude::*;
use chrono::{TimeZone, Utc};

use super::api::{MessagePart, MessagePayload, RemoteMessage};
use crate::models::{EmailAddress, Message, MessageId, ThreadId, labels};

/// Normalize a provider message to a domain Message
pub fn normalize_message(remote: RemoteMessage, account_id: i64) -> Result<Message> {
    let id = MessageId::new(&remote.id);
    let thread_id = ThreadId::new(&remote.thread_id);

    let payload = remote.payload.as_ref().context("Message has no payload")?;

    // Extract headers
    let from = extract_header(payload, "From")
        .map(|s| EmailAddress::parse(&s))
        .unwrap_or_else(|| EmailAddress::new("unknown@unknown.invalid"));

    let to = extract_header(payload, "To")
        .map(|s| EmailAddress::parse_list(&s))
        .unwrap_or_default();

    let cc = extract_header(payload, "Cc")
        .map(|s| EmailAddress::parse_list(&s))
        .unwrap_or_default();

    let bcc = extract_header(payload, "Bcc")
        .map(|s| EmailAddress::parse_list(&s))
        .unwrap_or_default();

    let subject = extract_header(payload, "Subject").unwrap_or_default();

    // Full raw header map, in wire order
    let headers: Vec<(String, String)> = payload
        .headers
        .as_ref()
        .map(|hs| {
            hs.iter()
                .map(|h| (h.name.clone(), h.value.clone()))
                .collect()
        })
        .unwrap_or_default();

    // Parse internal date (milliseconds since epoch)
    let internal_date: i64 = remote.internal_date.parse().unwrap_or(0);
    let received_at = Utc
        .timestamp_millis_opt(internal_date)
        .single()
        .unwrap_or_else(Utc::now);

    // Extract full body content (both text and HTML)
    let body_text = extract_plain_text_body(payload);
    let body_html = extract_html_body(payload);

    // Prefer the provider snippet, fall back to the extracted body
    let snippet = if !remote.snippet.is_empty() {
        decode_html_entities(&remote.snippet)
    } else {
        body_text.clone().unwrap_or_default()
    };

    let label_ids = remote.label_ids.unwrap_or_default();

    // Outbound mail carries the SENT label; its timestamp doubles as the
    // send time
    let sent_at = label_ids
        .iter()
        .any(|l| l == labels::SENT)
        .then_some(received_at);

    let mut builder = Message::builder(id, thread_id)
        .account_id(account_id)
        .from(from)
        .to(to)
        .cc(cc)
        .bcc(bcc)
        .subject(subject)
        .snippet(snippet)
        .body_text(body_text)
        .body_html(body_html)
        .label_ids(label_ids)
        .received_at(received_at)
        .headers(headers);
    if let Some(sent_at) = sent_at {
        builder = builder.sent_at(sent_at);
    }

    Ok(builder.build())
}

/// Extract a header value by name
fn extract_header(payload: &MessagePayload, name: &str) -> Option<String> {
    payload.headers.as_ref()?.iter().find_map(|h| {
        if h.name.eq_ignore_ascii_case(name) {
            Some(h.value.clone())
        } else {
            None
        }
    })
}

/// Extract plain text body from message payload
fn extract_plain_text_body(payload: &MessagePayload) -> Option<String> {
    // Check if this is a simple message with body data
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/plain"))
    {
        return decode_base64_body(data);
    }

    // Check parts for text/plain
    if let Some(parts) = &payload.parts
        && let Some(text) = find_body_in_parts(parts, "text/plain")
    {
        return Some(text);
    }

    // Fall back to any text content
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
    {
        return decode_base64_body(data);
    }

    None
}

/// Extract HTML body from message payload
fn extract_html_body(payload: &MessagePayload) -> Option<String> {
    if let Some(body) = &payload.body
        && let Some(data) = &body.data
        && payload
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with("text/html"))
    {
        return decode_base64_body(data);
    }

    if let Some(parts) = &payload.parts {
        return find_body_in_parts(parts, "text/html");
    }

    None
}

/// Recursively search message parts for a body of the given MIME type
fn find_body_in_parts(parts: &[MessagePart], mime_type: &str) -> Option<String> {
    for part in parts {
        if part
            .mime_type
            .as_ref()
            .is_some_and(|m| m.starts_with(mime_type))
            && let Some(body) = &part.body
            && let Some(data) = &body.data
            && let Some(text) = decode_base64_body(data)
        {
            return Some(text);
        }

        // Recursively check nested parts
        if let Some(nested) = &part.parts
            && let Some(text) = find_body_in_parts(nested, mime_type)
        {
            return Some(text);
        }
    }

    None
}

/// Decode base64-encoded body data
///
/// The provider uses URL-safe base64 but padding can vary, so we try
/// multiple decoders.
fn decode_base64_body(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE};

    let decoders: &[&base64::engine::GeneralPurpose] =
        &[&BASE64_URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD];

    for decoder in decoders {
        if let Ok(decoded) = decoder.decode(data) {
            if let Ok(s) = String::from_utf8(decoded) {
                return Some(s);
            }
        }
    }

    None
}

/// Decode HTML entities in snippet text
fn decode_html_entities(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}
