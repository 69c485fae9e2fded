//! Open tracking
//!
//! Outbound HTML bodies can carry an invisible 1x1 image pointing at an
//! open-tracking endpoint keyed by an opaque id. When the pixel is hit,
//! an open event is recorded against the message; the endpoint always
//! serves the fixed image so recipients never see a broken icon.

use anyhow::Result;
use chrono::Utc;

use crate::storage::{MailStore, OpenEvent};

/// Fixed 1x1 transparent GIF served for every pixel hit
pub const TRACKING_PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, // GIF89a
    0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, // 1x1, global color table
    0x00, 0x00, 0x00, 0xff, 0xff, 0xff, // palette: black, white
    0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, // transparency extension
    0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, // image descriptor
    0x02, 0x02, 0x44, 0x01, 0x00, // image data
    0x3b, // trailer
];

/// Generate an opaque random token (32 hex chars)
pub(crate) fn random_token() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let a = RandomState::new().build_hasher().finish();
    let b = RandomState::new().build_hasher().finish();
    format!("{:016x}{:016x}", a, b)
}

/// Generate a fresh tracking pixel id
pub fn new_tracking_id() -> String {
    random_token()
}

/// Inject an invisible tracking image into an HTML body
///
/// The image lands just before the closing body tag when one exists
/// (case-insensitive), otherwise it is appended.
pub fn inject_tracking_pixel(html: &str, pixel_url: &str) -> String {
    let tag = format!(
        "<img src=\"{}\" width=\"1\" height=\"1\" style=\"display:none\" alt=\"\"/>",
        pixel_url
    );

    let lower = html.to_lowercase();
    match lower.rfind("</body>") {
        Some(pos) => {
            let mut result = String::with_capacity(html.len() + tag.len());
            result.push_str(&html[..pos]);
            result.push_str(&tag);
            result.push_str(&html[pos..]);
            result
        }
        None => format!("{}{}", html, tag),
    }
}

/// Record an open event against the message carrying `tracking_id`
///
/// Returns the stored event, or `None` when no message carries the id.
pub fn record_open(
    store: &dyn MailStore,
    tracking_id: &str,
    ip: Option<String>,
    location: Option<String>,
    user_agent: Option<String>,
) -> Result<Option<OpenEvent>> {
    let Some(message) = store.find_message_by_tracking_id(tracking_id)? else {
        return Ok(None);
    };

    let event = store.insert_open_event(OpenEvent {
        id: 0,
        tracking_id: tracking_id.to_string(),
        message_id: message.id,
        opened_at: Utc::now(),
        ip,
        location,
        user_agent,
    })?;

    Ok(Some(event))
}

/// Handle a pixel hit: record the open and serve the image
///
/// Recording failures are logged and swallowed; the response is the
/// fixed transparent image no matter what.
pub fn serve_open_pixel(
    store: &dyn MailStore,
    tracking_id: &str,
    ip: Option<String>,
    location: Option<String>,
    user_agent: Option<String>,
) -> &'static [u8] {
    match record_open(store, tracking_id, ip, location, user_agent) {
        Ok(Some(_)) => {}
        Ok(None) => {
            log::debug!("[TRACK] Pixel hit for unknown tracking id {}", tracking_id);
        }
        Err(e) => {
            log::warn!("[TRACK] Failed to record open for {}: {:#}", tracking_id, e);
        }
    }
    TRACKING_PIXEL_GIF
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Message, MessageId, ThreadId};
    use crate::storage::InMemoryMailStore;

    #[test]
    fn test_tracking_id_shape() {
        let id = new_tracking_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_tracking_id(), new_tracking_id());
    }

    #[test]
    fn test_inject_before_closing_body() {
        let html = "<html><body><p>Hi</p></body></html>";
        let out = inject_tracking_pixel(html, "https://x.test/t/abc");
        assert!(out.contains("https://x.test/t/abc"));
        let img_pos = out.find("<img").unwrap();
        let body_pos = out.find("</body>").unwrap();
        assert!(img_pos < body_pos);
    }

    #[test]
    fn test_inject_case_insensitive_close_tag() {
        let html = "<HTML><BODY>Hi</BODY></HTML>";
        let out = inject_tracking_pixel(html, "u");
        let img_pos = out.find("<img").unwrap();
        let body_pos = out.find("</BODY>").unwrap();
        assert!(img_pos < body_pos);
    }

    #[test]
    fn test_inject_appends_without_close_tag() {
        let html = "<p>No body tag</p>";
        let out = inject_tracking_pixel(html, "u");
        assert!(out.starts_with("<p>No body tag</p>"));
        assert!(out.ends_with("/>"));
    }

    #[test]
    fn test_pixel_bytes_are_a_gif() {
        assert_eq!(&TRACKING_PIXEL_GIF[..6], b"GIF89a");
        assert_eq!(*TRACKING_PIXEL_GIF.last().unwrap(), 0x3b);
    }

    fn store_with_tracked_message(tracking_id: &str) -> InMemoryMailStore {
        let store = InMemoryMailStore::new();
        let msg = Message::builder(MessageId::new("m1"), ThreadId::new("t1"))
            .account_id(1)
            .tracking_pixel_id(Some(tracking_id.to_string()))
            .build();
        store.upsert_message(msg).unwrap();
        store
    }

    #[test]
    fn test_record_open_known_id() {
        let store = store_with_tracked_message("px1");
        let event = record_open(
            &store,
            "px1",
            Some("203.0.113.5".to_string()),
            None,
            Some("UA".to_string()),
        )
        .unwrap()
        .unwrap();

        assert_eq!(event.message_id, MessageId::new("m1"));
        assert_eq!(store.list_open_events(&MessageId::new("m1")).unwrap().len(), 1);
    }

    #[test]
    fn test_record_open_unknown_id() {
        let store = InMemoryMailStore::new();
        assert!(record_open(&store, "nope", None, None, None).unwrap().is_none());
    }

    #[test]
    fn test_serve_pixel_always_returns_image() {
        let store = store_with_tracked_message("px1");
        assert_eq!(serve_open_pixel(&store, "px1", None, None, None), TRACKING_PIXEL_GIF);
        // Unknown id still serves the image
        assert_eq!(serve_open_pixel(&store, "zzz", None, None, None), TRACKING_PIXEL_GIF);
    }
}
