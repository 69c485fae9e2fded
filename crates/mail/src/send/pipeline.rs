//! Send pipeline
//!
//! Composes an outbound message (optionally instrumenting it for open
//! tracking), transmits it through the mailbox client, mirrors the sent
//! message locally, and keeps the SendStatus audit row current through
//! every transition. Transport failures are classified, scheduled for
//! retry, and re-raised to the caller.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};

use super::bounce::{classify_bounce, next_retry_at};
use super::mime::compose_outbound;
use super::tracking::{inject_tracking_pixel, new_tracking_id};
use crate::mailbox::MailboxClient;
use crate::models::{
    Account, EmailAddress, Message, MessageId, OutgoingEmail, SendStatus, ThreadId, labels,
};
use crate::storage::{MailStore, ScheduledSend};
use crate::sync::reconcile_messages;

/// Deferred sends may be at most this far in the future
const MAX_SCHEDULE_AHEAD_DAYS: i64 = 30;

/// The caller-visible result of a successful send
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// The audit row tracking this lineage
    pub status_id: i64,
    /// The persisted parameter set retries send from
    pub draft_id: i64,
    /// The mirrored local message
    pub message_id: MessageId,
    /// The thread the message landed in
    pub thread_id: ThreadId,
}

/// Composes, transmits and records outbound mail
pub struct SendPipeline {
    client: Arc<dyn MailboxClient>,
    store: Arc<dyn MailStore>,
    tracking_base_url: String,
}

impl SendPipeline {
    /// Create a pipeline
    ///
    /// `tracking_base_url` is the externally reachable open-tracking
    /// endpoint; the pixel id is appended as a path segment.
    pub fn new(
        client: Arc<dyn MailboxClient>,
        store: Arc<dyn MailStore>,
        tracking_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            tracking_base_url: tracking_base_url.into(),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    /// Send an outbound message now
    ///
    /// The parameter set is persisted as a draft before the first
    /// attempt so the retry scanner can re-send from the same fields.
    /// Fails with the transport error after recording the classified
    /// failure on the SendStatus row.
    pub fn send(&self, account: &Account, mut email: OutgoingEmail) -> Result<SendOutcome> {
        // Instrument the HTML body before the draft persists, so retries
        // keep the same pixel
        if email.tracking_enabled
            && email.tracking_pixel_id.is_none()
            && let Some(html) = email.body_html.clone()
        {
            let tracking_id = new_tracking_id();
            let pixel_url = format!(
                "{}/{}",
                self.tracking_base_url.trim_end_matches('/'),
                tracking_id
            );
            email.body_html = Some(inject_tracking_pixel(&html, &pixel_url));
            email.tracking_pixel_id = Some(tracking_id);
        }

        let draft = self.store.insert_draft(account.id, &email)?;
        let mut status = self
            .store
            .insert_send_status(SendStatus::new(account.id, Some(draft.id)))?;

        self.transmit(account, &email, &mut status)
    }

    /// Persist a deferred send, due no more than 30 days out
    ///
    /// Durable: the row survives restarts and is dispatched by the
    /// scheduled-send scanner, not an in-process timer.
    pub fn schedule(
        &self,
        account_id: i64,
        email: OutgoingEmail,
        send_at: DateTime<Utc>,
    ) -> Result<ScheduledSend> {
        let ceiling = Utc::now() + Duration::days(MAX_SCHEDULE_AHEAD_DAYS);
        let due_at = send_at.min(ceiling);
        self.store.insert_scheduled_send(account_id, &email, due_at)
    }

    /// The transport step shared by first sends and retries
    ///
    /// On success the sent message is mirrored locally (marked read,
    /// carrying the send timestamp and any tracking pixel id) and the
    /// status row goes terminal `sent`. On failure the error is
    /// classified, the next retry slot is computed from the row's
    /// current retry count, and the error is re-raised.
    pub(crate) fn transmit(
        &self,
        account: &Account,
        email: &OutgoingEmail,
        status: &mut SendStatus,
    ) -> Result<SendOutcome> {
        let outbound = match compose_outbound(&self.sender_address(account), email) {
            Ok(outbound) => outbound,
            Err(e) => {
                // A payload that cannot compose will never transmit;
                // record it with no retry slot and surface immediately
                status.mark_failed(format!("{:#}", e), None, None, None);
                self.store.update_send_status(status)?;
                return Err(e);
            }
        };

        match self.client.send(&outbound) {
            Ok(sent) => {
                let message = self.mirror_sent_message(account, email, &sent.id, sent.thread_id);
                let message_id = message.id.clone();
                let thread_id = message.thread_id.clone();

                reconcile_messages(self.store.as_ref(), account.id, vec![message])?;

                status.mark_sent(message_id.clone());
                self.store.update_send_status(status)?;

                log::info!(
                    "[SEND] Account {} delivered message {} (status {})",
                    account.id,
                    message_id.as_str(),
                    status.id
                );

                Ok(SendOutcome {
                    status_id: status.id,
                    draft_id: status.draft_id.unwrap_or_default(),
                    message_id,
                    thread_id,
                })
            }
            Err(e) => {
                let error_text = format!("{:#}", e);
                let classified = classify_bounce(&error_text);
                let bounce = classified.map(|(kind, _)| kind);
                let reason = classified.map(|(_, phrase)| phrase.to_string());

                // Bounce classification happens on the attempt that
                // failed; the retry count is not consumed here
                let retry_at = if status.retries_exhausted() {
                    None
                } else {
                    Some(next_retry_at(status.retry_count, Utc::now()))
                };

                status.mark_failed(error_text.clone(), bounce, reason, retry_at);
                self.store.update_send_status(status)?;

                log::warn!(
                    "[SEND] Account {} send failed (status {}, bounce {:?}): {}",
                    account.id,
                    status.id,
                    bounce,
                    error_text
                );

                Err(e).context("transport send failed")
            }
        }
    }

    /// Mirror a successfully sent message into the local store
    fn mirror_sent_message(
        &self,
        account: &Account,
        email: &OutgoingEmail,
        remote_id: &str,
        remote_thread_id: Option<String>,
    ) -> Message {
        let now = Utc::now();
        // Without a thread from the provider, the message starts its own
        let thread_id = remote_thread_id.unwrap_or_else(|| remote_id.to_string());

        Message::builder(MessageId::new(remote_id), ThreadId::new(thread_id))
            .account_id(account.id)
            .from(self.sender_address(account))
            .to(email.to.iter().map(|a| EmailAddress::parse(a)).collect())
            .cc(email.cc.iter().map(|a| EmailAddress::parse(a)).collect())
            .bcc(email.bcc.iter().map(|a| EmailAddress::parse(a)).collect())
            .subject(email.subject.clone())
            .snippet(
                email
                    .body_text
                    .clone()
                    .unwrap_or_else(|| email.subject.clone()),
            )
            .body_text(email.body_text.clone())
            .body_html(email.body_html.clone())
            .label_ids(vec![labels::SENT.to_string()])
            .is_read(true)
            .sent_at(now)
            .received_at(now)
            .tracking_pixel_id(email.tracking_pixel_id.clone())
            .build()
    }

    fn sender_address(&self, account: &Account) -> EmailAddress {
        match &account.display_name {
            Some(name) => EmailAddress::with_name(name.clone(), account.email.clone()),
            None => EmailAddress::new(account.email.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::testing::StubTransport;
    use crate::models::{BounceKind, DeliveryState};
    use crate::storage::InMemoryMailStore;

    fn pipeline_with(transport: StubTransport) -> (SendPipeline, Arc<InMemoryMailStore>, Account) {
        let store = Arc::new(InMemoryMailStore::new());
        let account = store
            .insert_account(Account::new("seller@harbor.example").with_display_name("Pat Seller"))
            .unwrap();
        let pipeline = SendPipeline::new(
            Arc::new(transport),
            store.clone(),
            "https://portal.harbor.example/api/email/open",
        );
        (pipeline, store, account)
    }

    fn tracked_email() -> OutgoingEmail {
        OutgoingEmail::new("buyer@example.com", "Your quote")
            .with_html("<html><body><p>Quote attached</p></body></html>")
            .with_tracking(true)
    }

    #[test]
    fn test_successful_send_mirrors_message() {
        let (pipeline, store, account) = pipeline_with(StubTransport::succeeding("thread-1"));

        let outcome = pipeline
            .send(&account, OutgoingEmail::new("buyer@example.com", "Hi").with_text("hello"))
            .unwrap();

        let message = store.get_message(&outcome.message_id).unwrap().unwrap();
        assert!(message.is_read);
        assert!(message.sent_at.is_some());
        assert!(message.label_ids.contains(&"SENT".to_string()));
        assert_eq!(message.thread_id, outcome.thread_id);

        let thread = store.get_thread(account.id, &outcome.thread_id).unwrap();
        assert!(thread.is_some());

        let status = store.get_send_status(outcome.status_id).unwrap().unwrap();
        assert_eq!(status.status, DeliveryState::Sent);
        assert!(status.sent_at.is_some());
        assert_eq!(status.message_id, Some(outcome.message_id));
        assert_eq!(status.retry_count, 0);
    }

    #[test]
    fn test_send_persists_draft_first() {
        let (pipeline, store, account) = pipeline_with(StubTransport::succeeding("t"));

        let outcome = pipeline
            .send(&account, OutgoingEmail::new("buyer@example.com", "Hi"))
            .unwrap();

        let draft = store.get_draft(outcome.draft_id).unwrap().unwrap();
        assert_eq!(draft.email.to, vec!["buyer@example.com".to_string()]);
    }

    #[test]
    fn test_tracking_instrumentation() {
        let (pipeline, store, account) = pipeline_with(StubTransport::succeeding("t"));

        let outcome = pipeline.send(&account, tracked_email()).unwrap();

        let message = store.get_message(&outcome.message_id).unwrap().unwrap();
        let tracking_id = message.tracking_pixel_id.expect("tracking id set");
        assert_eq!(tracking_id.len(), 32);

        let html = message.body_html.unwrap();
        assert!(html.contains(&tracking_id));
        assert!(html.contains("api/email/open"));
        let img_pos = html.find("<img").unwrap();
        assert!(img_pos < html.find("</body>").unwrap());

        // The draft carries the instrumented body, so a retry keeps the
        // same pixel
        let draft = store.get_draft(outcome.draft_id).unwrap().unwrap();
        assert_eq!(draft.email.tracking_pixel_id.as_deref(), Some(tracking_id.as_str()));
    }

    #[test]
    fn test_no_tracking_without_html_body() {
        let (pipeline, store, account) = pipeline_with(StubTransport::succeeding("t"));

        let email = OutgoingEmail::new("buyer@example.com", "Hi")
            .with_text("plain only")
            .with_tracking(true);
        let outcome = pipeline.send(&account, email).unwrap();

        let message = store.get_message(&outcome.message_id).unwrap().unwrap();
        assert!(message.tracking_pixel_id.is_none());
    }

    #[test]
    fn test_classified_hard_bounce() {
        let (pipeline, store, account) =
            pipeline_with(StubTransport::failing("550 5.1.1 user unknown"));

        let err = pipeline
            .send(&account, OutgoingEmail::new("ghost@example.com", "Hi"))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("user unknown"));

        let status = store.list_retry_eligible(Utc::now() + Duration::hours(1), 10).unwrap();
        assert_eq!(status.len(), 1);
        let status = &status[0];
        assert_eq!(status.status, DeliveryState::Hard);
        assert_eq!(status.bounce_type, Some(BounceKind::Hard));
        assert_eq!(status.bounce_reason.as_deref(), Some("user unknown"));
        // Classification happened on the failed attempt, not a retry
        assert_eq!(status.retry_count, 0);
        assert!(status.failed_at.is_some());
    }

    #[test]
    fn test_unclassified_failure_is_generic() {
        let (pipeline, store, account) =
            pipeline_with(StubTransport::failing("connection reset by peer"));

        pipeline
            .send(&account, OutgoingEmail::new("buyer@example.com", "Hi"))
            .unwrap_err();

        let rows = store.list_retry_eligible(Utc::now() + Duration::hours(1), 10).unwrap();
        assert_eq!(rows[0].status, DeliveryState::Failed);
        assert!(rows[0].bounce_type.is_none());
    }

    #[test]
    fn test_first_failure_schedules_one_minute_retry() {
        let (pipeline, store, account) = pipeline_with(StubTransport::failing("mailbox full"));

        let before = Utc::now();
        pipeline
            .send(&account, OutgoingEmail::new("buyer@example.com", "Hi"))
            .unwrap_err();

        let rows = store.list_retry_eligible(before + Duration::minutes(2), 10).unwrap();
        let next = rows[0].next_retry_at.unwrap();
        assert!(next >= before + Duration::minutes(1));
        assert!(next <= Utc::now() + Duration::minutes(1));
    }

    #[test]
    fn test_reply_keeps_thread_linkage() {
        let (pipeline, store, account) = pipeline_with(StubTransport::succeeding("remote-thread"));

        let email = OutgoingEmail::new("buyer@example.com", "Re: Quote").as_reply(
            "remote-thread",
            "<orig@mail>",
            vec!["<orig@mail>".to_string()],
        );
        let outcome = pipeline.send(&account, email).unwrap();

        assert_eq!(outcome.thread_id.as_str(), "remote-thread");
        assert!(store.get_thread(account.id, &outcome.thread_id).unwrap().is_some());
    }

    #[test]
    fn test_schedule_caps_at_thirty_days() {
        let (pipeline, store, _account) = pipeline_with(StubTransport::succeeding("t"));
        let now = Utc::now();

        let row = pipeline
            .schedule(
                1,
                OutgoingEmail::new("buyer@example.com", "Later"),
                now + Duration::days(90),
            )
            .unwrap();

        assert!(row.due_at <= now + Duration::days(30) + Duration::seconds(5));
        assert_eq!(store.list_due_scheduled_sends(now + Duration::days(31), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_bad_attachment_recorded_without_transport_call() {
        let (pipeline, store, account) = pipeline_with(StubTransport::succeeding("t"));

        let mut email = OutgoingEmail::new("buyer@example.com", "Hi");
        email.attachments.push(crate::models::Attachment {
            filename: "x.bin".to_string(),
            content_type: None,
            data_base64: "%%%".to_string(),
        });

        pipeline.send(&account, email).unwrap_err();

        // Recorded as a failure with no retry slot; nothing transmitted
        // (ids: account 1, draft 2, status 3)
        let status = store.get_send_status(3).unwrap().unwrap();
        assert_eq!(status.status, DeliveryState::Failed);
        assert!(status.next_retry_at.is_none());
        assert!(store.list_retry_eligible(Utc::now() + Duration::hours(1), 10).unwrap().is_empty());
    }
}
