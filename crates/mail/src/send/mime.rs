//! Outbound MIME composition
//!
//! Builds the RFC 822 message the provider transmits, including reply
//! threading headers and binary attachments, and encodes it the way the
//! send endpoint expects (base64url).

use anyhow::{Context, Result};
use base64::prelude::*;

use super::tracking::random_token;
use crate::mailbox::api::OutboundMessage;
use crate::models::{EmailAddress, OutgoingEmail};

const CRLF: &str = "\r\n";

/// Compose an outbound message for transmission
///
/// Attachment payloads are base64-decoded here; a payload that fails to
/// decode is a caller error surfaced before any transport call.
pub fn compose_outbound(from: &EmailAddress, email: &OutgoingEmail) -> Result<OutboundMessage> {
    // Decode attachments up front so bad payloads fail fast
    let mut attachments = Vec::with_capacity(email.attachments.len());
    for attachment in &email.attachments {
        let data = BASE64_STANDARD
            .decode(attachment.data_base64.trim())
            .with_context(|| format!("Invalid base64 payload for attachment {}", attachment.filename))?;
        attachments.push((attachment, data));
    }

    let mut message = String::new();
    let mut push_header = |name: &str, value: &str| {
        message.push_str(name);
        message.push_str(": ");
        message.push_str(value);
        message.push_str(CRLF);
    };

    push_header("From", &from.display());
    push_header("To", &email.to.join(", "));
    if !email.cc.is_empty() {
        push_header("Cc", &email.cc.join(", "));
    }
    if !email.bcc.is_empty() {
        push_header("Bcc", &email.bcc.join(", "));
    }
    push_header("Subject", &email.subject);
    if let Some(in_reply_to) = &email.in_reply_to {
        push_header("In-Reply-To", in_reply_to);
    }
    if !email.references.is_empty() {
        push_header("References", &email.references.join(" "));
    }
    push_header("MIME-Version", "1.0");

    let body = body_part(email);

    if attachments.is_empty() {
        message.push_str(&body.headers);
        message.push_str(CRLF);
        message.push_str(&body.content);
    } else {
        let boundary = format!("=_mixed_{}", random_token());
        message.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{}\"{}{}",
            boundary, CRLF, CRLF
        ));

        message.push_str(&format!("--{}{}", boundary, CRLF));
        message.push_str(&body.headers);
        message.push_str(CRLF);
        message.push_str(&body.content);
        message.push_str(CRLF);

        for (attachment, data) in &attachments {
            message.push_str(&format!("--{}{}", boundary, CRLF));
            let content_type = attachment
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            message.push_str(&format!(
                "Content-Type: {}; name=\"{}\"{}",
                content_type, attachment.filename, CRLF
            ));
            message.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"{}",
                attachment.filename, CRLF
            ));
            message.push_str(&format!("Content-Transfer-Encoding: base64{}{}", CRLF, CRLF));
            message.push_str(&wrap_base64(&BASE64_STANDARD.encode(data)));
            message.push_str(CRLF);
        }

        message.push_str(&format!("--{}--{}", boundary, CRLF));
    }

    Ok(OutboundMessage {
        raw: BASE64_URL_SAFE_NO_PAD.encode(&message),
        thread_id: email.thread_id.clone(),
    })
}

struct BodyPart {
    headers: String,
    content: String,
}

/// The message body: alternative text/HTML when both exist, otherwise
/// whichever is present
fn body_part(email: &OutgoingEmail) -> BodyPart {
    match (&email.body_text, &email.body_html) {
        (Some(text), Some(html)) => {
            let boundary = format!("=_alt_{}", random_token());
            let mut content = String::new();
            content.push_str(&format!("--{}{}", boundary, CRLF));
            content.push_str(&format!(
                "Content-Type: text/plain; charset=UTF-8{}{}",
                CRLF, CRLF
            ));
            content.push_str(text);
            content.push_str(CRLF);
            content.push_str(&format!("--{}{}", boundary, CRLF));
            content.push_str(&format!(
                "Content-Type: text/html; charset=UTF-8{}{}",
                CRLF, CRLF
            ));
            content.push_str(html);
            content.push_str(CRLF);
            content.push_str(&format!("--{}--{}", boundary, CRLF));

            BodyPart {
                headers: format!(
                    "Content-Type: multipart/alternative; boundary=\"{}\"{}",
                    boundary, CRLF
                ),
                content,
            }
        }
        (None, Some(html)) => BodyPart {
            headers: format!("Content-Type: text/html; charset=UTF-8{}", CRLF),
            content: html.clone(),
        },
        (text, None) => BodyPart {
            headers: format!("Content-Type: text/plain; charset=UTF-8{}", CRLF),
            content: text.clone().unwrap_or_default(),
        },
    }
}

/// Wrap base64 content at the conventional 76 columns
fn wrap_base64(encoded: &str) -> String {
    encoded
        .as_bytes()
        .chunks(76)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(CRLF)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Attachment;

    fn decode_raw(outbound: &OutboundMessage) -> String {
        let bytes = BASE64_URL_SAFE_NO_PAD.decode(&outbound.raw).unwrap();
        String::from_utf8(bytes).unwrap()
    }

    fn sender() -> EmailAddress {
        EmailAddress::with_name("Pat Seller", "pat@harbor.example")
    }

    #[test]
    fn test_simple_text_message() {
        let email = OutgoingEmail::new("to@example.com", "Hello").with_text("Plain body");
        let outbound = compose_outbound(&sender(), &email).unwrap();
        let raw = decode_raw(&outbound);

        assert!(raw.contains("From: Pat Seller <pat@harbor.example>"));
        assert!(raw.contains("To: to@example.com"));
        assert!(raw.contains("Subject: Hello"));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(raw.contains("Plain body"));
        assert!(outbound.thread_id.is_none());
    }

    #[test]
    fn test_alternative_body_when_both_present() {
        let email = OutgoingEmail::new("to@example.com", "Hi")
            .with_text("text")
            .with_html("<p>html</p>");
        let raw = decode_raw(&compose_outbound(&sender(), &email).unwrap());

        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/plain"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn test_reply_threading_headers() {
        let email = OutgoingEmail::new("to@example.com", "Re: Quote").as_reply(
            "thread-9",
            "<orig@mail>",
            vec!["<root@mail>".to_string(), "<orig@mail>".to_string()],
        );
        let outbound = compose_outbound(&sender(), &email).unwrap();
        let raw = decode_raw(&outbound);

        assert!(raw.contains("In-Reply-To: <orig@mail>"));
        assert!(raw.contains("References: <root@mail> <orig@mail>"));
        assert_eq!(outbound.thread_id.as_deref(), Some("thread-9"));
    }

    #[test]
    fn test_attachment_encoding() {
        let mut email = OutgoingEmail::new("to@example.com", "With file").with_text("see attached");
        email.attachments.push(Attachment {
            filename: "report.txt".to_string(),
            content_type: Some("text/plain".to_string()),
            data_base64: BASE64_STANDARD.encode("report contents"),
        });

        let raw = decode_raw(&compose_outbound(&sender(), &email).unwrap());
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("Content-Disposition: attachment; filename=\"report.txt\""));
        assert!(raw.contains(&BASE64_STANDARD.encode("report contents")));
    }

    #[test]
    fn test_bad_attachment_payload_is_an_error() {
        let mut email = OutgoingEmail::new("to@example.com", "Broken");
        email.attachments.push(Attachment {
            filename: "x.bin".to_string(),
            content_type: None,
            data_base64: "!!! not base64 !!!".to_string(),
        });

        let err = compose_outbound(&sender(), &email).unwrap_err();
        assert!(format!("{:#}", err).contains("x.bin"));
    }

    #[test]
    fn test_wrap_base64_column_width() {
        let encoded = "A".repeat(200);
        let wrapped = wrap_base64(&encoded);
        assert!(wrapped.lines().all(|line| line.len() <= 76));
    }
}
