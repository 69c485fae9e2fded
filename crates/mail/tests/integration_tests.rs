//! Integration tests for the mail crate
//!
//! These tests verify the complete flows: syncing a mailbox into the
//! SQLite mirror, querying it, sending with failure classification and
//! retries, durable scheduled sends, and open tracking.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use chrono::{Duration, Utc};
use tempfile::TempDir;

use mail::mailbox::api::{
    Header, HistoryPage, HistoryRecord, MailboxProfile, MessageBody, MessageChange,
    MessagePayload, MessageRef, OutboundMessage, RemoteMessage, SentMessage,
};
use mail::{
    Account, DeliveryState, HistoryExpiredError, MailStore, MailboxClient, MessageId,
    OutgoingEmail, RetryScanner, ScheduledSendRunner, SendPipeline, SqliteMailStore,
    SyncCoordinator, SyncOptions, SyncType, ThreadId, TransportError, get_thread_detail,
    list_threads, list_threads_by_label, serve_open_pixel,
};

/// Scripted mailbox double covering both sync and send
struct ScriptedMailbox {
    listing: RwLock<Vec<MessageRef>>,
    messages: RwLock<HashMap<String, RemoteMessage>>,
    history: RwLock<Option<HistoryPage>>,
    history_expired: bool,
    profile_history_id: Option<String>,
    send_error: Option<String>,
    sent_count: Mutex<u32>,
}

impl ScriptedMailbox {
    fn new() -> Self {
        Self {
            listing: RwLock::new(Vec::new()),
            messages: RwLock::new(HashMap::new()),
            history: RwLock::new(None),
            history_expired: false,
            profile_history_id: None,
            send_error: None,
            sent_count: Mutex::new(0),
        }
    }

    fn add_message(&self, id: &str, thread_id: &str, subject: &str, labels: Vec<&str>) {
        self.listing.write().unwrap().push(MessageRef {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
        });
        self.messages.write().unwrap().insert(
            id.to_string(),
            RemoteMessage {
                id: id.to_string(),
                thread_id: thread_id.to_string(),
                label_ids: Some(labels.into_iter().map(String::from).collect()),
                snippet: format!("Snippet of {}", subject),
                internal_date: "1700000000000".to_string(),
                payload: Some(MessagePayload {
                    headers: Some(vec![
                        Header {
                            name: "From".to_string(),
                            value: "Client <client@example.com>".to_string(),
                        },
                        Header {
                            name: "To".to_string(),
                            value: "seller@harbor.example".to_string(),
                        },
                        Header {
                            name: "Subject".to_string(),
                            value: subject.to_string(),
                        },
                    ]),
                    body: Some(MessageBody {
                        size: Some(0),
                        data: None,
                    }),
                    parts: None,
                    mime_type: Some("text/plain".to_string()),
                }),
            },
        );
    }

    fn set_history(&self, page: HistoryPage) {
        *self.history.write().unwrap() = Some(page);
    }
}

impl MailboxClient for ScriptedMailbox {
    fn list_messages(
        &self,
        _query: Option<&str>,
        max_results: usize,
        _label_ids: &[String],
    ) -> Result<Vec<MessageRef>> {
        Ok(self
            .listing
            .read()
            .unwrap()
            .iter()
            .take(max_results)
            .cloned()
            .collect())
    }

    fn get_message(&self, id: &MessageId) -> Result<RemoteMessage> {
        self.messages
            .read()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such message {}", id.as_str()))
    }

    fn get_history(&self, _start: &str, _max_results: usize) -> Result<HistoryPage> {
        if self.history_expired {
            return Err(HistoryExpiredError.into());
        }
        match self.history.read().unwrap().as_ref() {
            Some(page) => Ok(HistoryPage {
                records: page.records.clone(),
                new_history_id: page.new_history_id.clone(),
            }),
            None => anyhow::bail!("history unavailable"),
        }
    }

    fn get_profile(&self) -> Result<MailboxProfile> {
        Ok(MailboxProfile {
            email_address: "seller@harbor.example".to_string(),
            history_id: self.profile_history_id.clone(),
        })
    }

    fn send(&self, outgoing: &OutboundMessage) -> Result<SentMessage> {
        if let Some(error) = &self.send_error {
            return Err(TransportError::new(error.clone()).into());
        }
        let mut count = self.sent_count.lock().unwrap();
        *count += 1;
        Ok(SentMessage {
            id: format!("sent-{}", count),
            thread_id: outgoing.thread_id.clone(),
        })
    }

    fn modify_labels(
        &self,
        _message_ids: &[MessageId],
        _add: &[&str],
        _remove: &[&str],
    ) -> Result<()> {
        Ok(())
    }
}

fn sqlite_store() -> (Arc<SqliteMailStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    // Use .test.sqlite extension to clearly distinguish from production databases
    let db_path = dir.path().join("mail.test.sqlite");
    (Arc::new(SqliteMailStore::new(&db_path).unwrap()), dir)
}

fn connect_account(store: &Arc<SqliteMailStore>) -> Account {
    store
        .insert_account(Account::new("seller@harbor.example").with_display_name("Pat Seller"))
        .unwrap()
}

const TRACKING_URL: &str = "https://portal.harbor.example/api/email/open";

#[test]
fn test_full_sync_into_sqlite_and_query() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    let mailbox = ScriptedMailbox::new();
    mailbox.add_message("m1", "t1", "Policy renewal", vec!["INBOX", "UNREAD"]);
    mailbox.add_message("m2", "t1", "Re: Policy renewal", vec!["INBOX"]);
    mailbox.add_message("m3", "t2", "New quote request", vec!["INBOX", "UNREAD", "STARRED"]);

    let coordinator = SyncCoordinator::new(Arc::new(mailbox), store.clone());
    let report = coordinator.sync(account.id, &SyncOptions::default()).unwrap();

    assert!(report.success);
    assert_eq!(report.sync_type, SyncType::Full);
    assert_eq!(report.threads_processed, 2);
    assert_eq!(report.messages_processed, 3);

    // Query layer sees the mirrored threads, newest first
    let threads = list_threads(store.as_ref(), account.id, 10, 0).unwrap();
    assert_eq!(threads.len(), 2);

    let inbox = list_threads_by_label(store.as_ref(), account.id, "INBOX", 10, 0).unwrap();
    assert_eq!(inbox.len(), 2);
    let starred = list_threads_by_label(store.as_ref(), account.id, "STARRED", 10, 0).unwrap();
    assert_eq!(starred.len(), 1);
    assert_eq!(starred[0].id.as_str(), "t2");

    let detail = get_thread_detail(store.as_ref(), account.id, &ThreadId::new("t1"))
        .unwrap()
        .unwrap();
    assert_eq!(detail.messages.len(), 2);
    assert_eq!(detail.thread.message_count, 2);
    assert_eq!(detail.messages[0].from.email, "client@example.com");
}

#[test]
fn test_sync_is_idempotent_across_runs() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    let mailbox = ScriptedMailbox::new();
    mailbox.add_message("m1", "t1", "Hello", vec!["INBOX"]);
    let coordinator = SyncCoordinator::new(Arc::new(mailbox), store.clone());

    let options = SyncOptions {
        force_full_sync: true,
        ..Default::default()
    };
    let first = coordinator.sync(account.id, &options).unwrap();
    assert_eq!(first.messages_processed, 1);

    let second = coordinator.sync(account.id, &options).unwrap();
    assert!(second.success);
    assert_eq!(second.messages_processed, 0);
    assert_eq!(second.threads_processed, 0);

    assert_eq!(
        store
            .count_messages_in_thread(account.id, &ThreadId::new("t1"))
            .unwrap(),
        1
    );
}

#[test]
fn test_incremental_sync_with_deletion_on_sqlite() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    // First a full sync mirrors two messages
    let mailbox = ScriptedMailbox::new();
    mailbox.add_message("m1", "t1", "Keep me", vec!["INBOX"]);
    mailbox.add_message("m2", "t1", "Delete me", vec!["INBOX"]);
    let mailbox = Arc::new(mailbox);
    let coordinator = SyncCoordinator::new(mailbox.clone(), store.clone());
    coordinator.sync(account.id, &SyncOptions::default()).unwrap();

    // Seed the watermark and script a deletion entry
    let mut state = store.get_sync_state(account.id).unwrap().unwrap();
    state.advance_history("100");
    store.save_sync_state(state).unwrap();

    mailbox.set_history(HistoryPage {
        records: vec![HistoryRecord {
            messages_deleted: vec![MessageChange {
                message: MessageRef {
                    id: "m2".to_string(),
                    thread_id: "t1".to_string(),
                },
            }],
            ..Default::default()
        }],
        new_history_id: Some("200".to_string()),
    });

    let report = coordinator.sync(account.id, &SyncOptions::default()).unwrap();
    assert!(report.success);
    assert_eq!(report.sync_type, SyncType::Incremental);
    assert_eq!(report.messages_processed, 0);

    // The deleted message is tagged, not removed
    let m2 = store.get_message(&MessageId::new("m2")).unwrap().unwrap();
    assert!(m2.is_trashed());
    assert_eq!(
        store
            .count_messages_in_thread(account.id, &ThreadId::new("t1"))
            .unwrap(),
        2
    );

    let state = store.get_sync_state(account.id).unwrap().unwrap();
    assert_eq!(state.history_id.as_deref(), Some("200"));
}

#[test]
fn test_watermark_advances_monotonically() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    let mailbox = Arc::new(ScriptedMailbox::new());
    let coordinator = SyncCoordinator::new(mailbox.clone(), store.clone());

    let mut state = store.get_sync_state(account.id).unwrap().unwrap();
    state.advance_history("500");
    store.save_sync_state(state).unwrap();

    // A remote page reporting an earlier head must not move us backwards
    mailbox.set_history(HistoryPage {
        records: Vec::new(),
        new_history_id: Some("400".to_string()),
    });
    coordinator.sync(account.id, &SyncOptions::default()).unwrap();
    let state = store.get_sync_state(account.id).unwrap().unwrap();
    assert_eq!(state.history_id.as_deref(), Some("500"));

    // A later head advances
    mailbox.set_history(HistoryPage {
        records: Vec::new(),
        new_history_id: Some("600".to_string()),
    });
    coordinator.sync(account.id, &SyncOptions::default()).unwrap();
    let state = store.get_sync_state(account.id).unwrap().unwrap();
    assert_eq!(state.history_id.as_deref(), Some("600"));
}

#[test]
fn test_expired_watermark_falls_back_to_full() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    let mut mailbox = ScriptedMailbox::new();
    mailbox.history_expired = true;
    mailbox.add_message("m1", "t1", "Fresh start", vec!["INBOX"]);
    let coordinator = SyncCoordinator::new(Arc::new(mailbox), store.clone());

    let mut state = store.get_sync_state(account.id).unwrap().unwrap();
    state.advance_history("42");
    store.save_sync_state(state).unwrap();

    // The caller sees a successful full sync, never the expiry
    let report = coordinator.sync(account.id, &SyncOptions::default()).unwrap();
    assert!(report.success);
    assert_eq!(report.sync_type, SyncType::Full);
    assert_eq!(report.messages_processed, 1);
    assert!(report.error.is_none());
}

#[test]
fn test_send_retry_lifecycle_on_sqlite() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    // The first attempt hits a soft bounce
    let mut mailbox = ScriptedMailbox::new();
    mailbox.send_error = Some("452 mailbox full".to_string());
    let pipeline = SendPipeline::new(Arc::new(mailbox), store.clone(), TRACKING_URL);

    let email = OutgoingEmail::new("buyer@example.com", "Your quote").with_text("See attached");
    let err = pipeline.send(&account, email).unwrap_err();
    assert!(format!("{:#}", err).contains("mailbox full"));

    let eligible = store
        .list_retry_eligible(Utc::now() + Duration::minutes(2), 10)
        .unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].status, DeliveryState::Soft);
    assert_eq!(eligible[0].retry_count, 0);
    let status_id = eligible[0].id;

    // Pull the retry slot into the past so the scanner picks it up, and
    // let the transport recover
    let mut row = store.get_send_status(status_id).unwrap().unwrap();
    row.next_retry_at = Some(Utc::now() - Duration::minutes(1));
    store.update_send_status(&row).unwrap();

    let recovered = ScriptedMailbox::new();
    let scanner = RetryScanner::new(SendPipeline::new(
        Arc::new(recovered),
        store.clone(),
        TRACKING_URL,
    ));
    let stats = scanner.run_auto_retry().unwrap();
    assert_eq!(stats.scanned, 1);
    assert_eq!(stats.succeeded, 1);

    let row = store.get_send_status(status_id).unwrap().unwrap();
    assert_eq!(row.status, DeliveryState::Sent);
    assert_eq!(row.retry_count, 1);
    let message_id = row.message_id.unwrap();

    // The delivered message is mirrored locally, marked read
    let message = store.get_message(&message_id).unwrap().unwrap();
    assert!(message.is_read);
    assert!(message.sent_at.is_some());
    assert!(message.label_ids.contains(&"SENT".to_string()));

    // Terminal rows never come back
    assert!(
        store
            .list_retry_eligible(Utc::now() + Duration::days(365), 10)
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_hard_bounce_recorded_with_classification() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    let mut mailbox = ScriptedMailbox::new();
    mailbox.send_error = Some("550 5.1.1 no such user".to_string());
    let pipeline = SendPipeline::new(Arc::new(mailbox), store.clone(), TRACKING_URL);

    pipeline
        .send(&account, OutgoingEmail::new("ghost@example.com", "Hello"))
        .unwrap_err();

    let rows = store
        .list_retry_eligible(Utc::now() + Duration::hours(1), 10)
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, DeliveryState::Hard);
    assert_eq!(rows[0].bounce_reason.as_deref(), Some("no such user"));
    assert!(rows[0].error_message.as_deref().unwrap().contains("550"));
}

#[test]
fn test_open_tracking_round_trip() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    let pipeline = SendPipeline::new(Arc::new(ScriptedMailbox::new()), store.clone(), TRACKING_URL);
    let email = OutgoingEmail::new("buyer@example.com", "Tracked")
        .with_html("<html><body>Hi</body></html>")
        .with_tracking(true);
    let outcome = pipeline.send(&account, email).unwrap();

    let message = store.get_message(&outcome.message_id).unwrap().unwrap();
    let tracking_id = message.tracking_pixel_id.unwrap();
    assert!(message.body_html.unwrap().contains(&tracking_id));

    // A pixel hit records an open event and serves the image
    let body = serve_open_pixel(
        store.as_ref(),
        &tracking_id,
        Some("198.51.100.7".to_string()),
        Some("Toronto, CA".to_string()),
        Some("Mozilla/5.0".to_string()),
    );
    assert_eq!(&body[..6], b"GIF89a");

    let events = store.list_open_events(&outcome.message_id).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tracking_id, tracking_id);

    // An unknown id still serves the image and records nothing
    let body = serve_open_pixel(store.as_ref(), "bogus", None, None, None);
    assert_eq!(&body[..6], b"GIF89a");
    assert_eq!(store.list_open_events(&outcome.message_id).unwrap().len(), 1);
}

#[test]
fn test_scheduled_send_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("mail.test.sqlite");
    let due_at = Utc::now() - Duration::minutes(1);

    // Schedule, then drop the store (simulated restart)
    {
        let store = Arc::new(SqliteMailStore::new(&db_path).unwrap());
        let account = connect_account(&store);
        let pipeline =
            SendPipeline::new(Arc::new(ScriptedMailbox::new()), store.clone(), TRACKING_URL);
        pipeline
            .schedule(
                account.id,
                OutgoingEmail::new("buyer@example.com", "After restart").with_text("hi"),
                due_at,
            )
            .unwrap();
    }

    // A fresh process picks the row up and dispatches it
    {
        let store = Arc::new(SqliteMailStore::new(&db_path).unwrap());
        let runner = ScheduledSendRunner::new(SendPipeline::new(
            Arc::new(ScriptedMailbox::new()),
            store.clone(),
            TRACKING_URL,
        ));

        let stats = runner.run_due().unwrap();
        assert_eq!(stats.scanned, 1);
        assert_eq!(stats.sent, 1);

        assert!(store.list_due_scheduled_sends(Utc::now(), 10).unwrap().is_empty());
        let account = store
            .get_account_by_email("seller@harbor.example")
            .unwrap()
            .unwrap();
        assert_eq!(store.count_threads(account.id).unwrap(), 1);
    }
}

#[test]
fn test_concurrent_sync_claims_are_exclusive() {
    let (store, _dir) = sqlite_store();
    let account = connect_account(&store);

    let mailbox = ScriptedMailbox::new();
    mailbox.add_message("m1", "t1", "Hello", vec!["INBOX"]);
    let coordinator = SyncCoordinator::new(Arc::new(mailbox), store.clone());

    // Another worker holds the lease
    store
        .try_claim_sync(account.id, Utc::now(), 600)
        .unwrap()
        .unwrap();

    let report = coordinator.sync(account.id, &SyncOptions::default()).unwrap();
    assert!(!report.success);
    assert_eq!(report.error.as_deref(), Some("sync already in progress"));
    assert_eq!(store.count_threads(account.id).unwrap(), 0);
}
