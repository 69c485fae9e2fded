//! SQLite-based mail storage

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{MailStore, OpenEvent, ScheduledSend};
use crate::models::{
    Account, BounceKind, DeliveryState, Draft, EmailAddress, Message, MessageId, OutgoingEmail,
    SendStatus, SyncState, SyncStatus, Thread, ThreadId, labels,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Connected mailbox accounts
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT,
                is_primary INTEGER NOT NULL DEFAULT 0,
                added_at TEXT NOT NULL,
                encrypted_tokens TEXT
            );

            -- Sync state per account (1:1)
            CREATE TABLE sync_state (
                account_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'idle',
                history_id TEXT,
                last_synced_at TEXT,
                last_error TEXT,
                lease_expires_at TEXT,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            );

            -- Thread mirror, keyed by (account, remote thread id)
            CREATE TABLE threads (
                account_id INTEGER NOT NULL,
                id TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                participants TEXT NOT NULL DEFAULT '[]',
                is_starred INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                unread_count INTEGER NOT NULL DEFAULT 0,
                last_message_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (account_id, id)
            );

            CREATE INDEX idx_threads_last_message_at
                ON threads(account_id, last_message_at DESC);

            -- Message mirror with zstd-compressed bodies
            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                account_id INTEGER NOT NULL,
                thread_id TEXT NOT NULL,
                from_name TEXT,
                from_email TEXT NOT NULL,
                subject TEXT NOT NULL,
                snippet TEXT NOT NULL,
                body_text BLOB,  -- zstd compressed
                body_html BLOB,  -- zstd compressed
                is_read INTEGER NOT NULL DEFAULT 0,
                is_starred INTEGER NOT NULL DEFAULT 0,
                sent_at TEXT,
                received_at TEXT NOT NULL,
                headers TEXT NOT NULL DEFAULT '[]',
                tracking_pixel_id TEXT
            );

            CREATE INDEX idx_messages_thread
                ON messages(account_id, thread_id, received_at ASC);
            CREATE INDEX idx_messages_tracking ON messages(tracking_pixel_id);

            -- Recipients (normalized, many-to-many)
            CREATE TABLE message_recipients (
                message_id TEXT NOT NULL,
                recipient_type TEXT NOT NULL,
                name TEXT,
                email TEXT NOT NULL,
                position INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (message_id, recipient_type, position),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            -- Labels on messages (many-to-many)
            CREATE TABLE message_labels (
                message_id TEXT NOT NULL,
                label_id TEXT NOT NULL,
                PRIMARY KEY (message_id, label_id),
                FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_message_labels_label ON message_labels(label_id);

            -- Thread-label index for efficient list_threads_by_label
            CREATE TABLE thread_labels (
                account_id INTEGER NOT NULL,
                thread_id TEXT NOT NULL,
                label_id TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                PRIMARY KEY (account_id, thread_id, label_id)
            );

            CREATE INDEX idx_thread_labels_query
                ON thread_labels(account_id, label_id, last_message_at DESC);

            -- Persisted outbound parameter sets
            CREATE TABLE drafts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            -- Delivery lifecycle, one row per send lineage (audit trail)
            CREATE TABLE send_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                error_message TEXT,
                bounce_type TEXT,
                bounce_reason TEXT,
                next_retry_at TEXT,
                sent_at TEXT,
                failed_at TEXT,
                draft_id INTEGER,
                message_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX idx_send_status_retry ON send_status(status, next_retry_at);

            -- Durable deferred sends
            CREATE TABLE scheduled_sends (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                due_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX idx_scheduled_sends_due ON scheduled_sends(due_at ASC);

            -- Open-tracking hits
            CREATE TABLE open_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tracking_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                opened_at TEXT NOT NULL,
                ip TEXT,
                location TEXT,
                user_agent TEXT
            );

            CREATE INDEX idx_open_events_message ON open_events(message_id);
            "#,
        ),
    ])
}

/// SQLite-based mail storage
///
/// Queryable metadata lives in normal columns; message bodies are stored
/// zstd-compressed in place.
pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

/// Parse an RFC 3339 timestamp column, falling back to now on corruption
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

impl SqliteMailStore {
    /// Create a new SQLite mail store at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL for concurrent readers during writes, NORMAL sync as the
        // durability/latency balance WAL allows, generous page cache and
        // mmap for read-heavy thread listing, foreign_keys for CASCADE.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Load recipients for a message
    fn load_recipients(
        conn: &Connection,
        message_id: &str,
        recipient_type: &str,
    ) -> Result<Vec<EmailAddress>> {
        let mut stmt = conn.prepare(
            "SELECT name, email FROM message_recipients
             WHERE message_id = ? AND recipient_type = ?
             ORDER BY position",
        )?;

        let recipients = stmt
            .query_map(params![message_id, recipient_type], |row| {
                Ok(EmailAddress {
                    name: row.get(0)?,
                    email: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(recipients)
    }

    /// Load labels for a message
    fn load_labels(conn: &Connection, message_id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT label_id FROM message_labels WHERE message_id = ?")?;

        let labels = stmt
            .query_map([message_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(labels)
    }

    /// Save recipients for a message
    fn save_recipients(
        conn: &Connection,
        message_id: &str,
        recipient_type: &str,
        recipients: &[EmailAddress],
    ) -> Result<()> {
        let mut stmt = conn.prepare(
            "INSERT INTO message_recipients (message_id, recipient_type, name, email, position)
             VALUES (?, ?, ?, ?, ?)",
        )?;

        for (i, addr) in recipients.iter().enumerate() {
            stmt.execute(params![
                message_id,
                recipient_type,
                addr.name,
                addr.email,
                i as i64
            ])?;
        }

        Ok(())
    }

    /// Save labels for a message
    fn save_labels(conn: &Connection, message_id: &str, label_ids: &[String]) -> Result<()> {
        let mut stmt =
            conn.prepare("INSERT INTO message_labels (message_id, label_id) VALUES (?, ?)")?;

        for label in label_ids {
            stmt.execute(params![message_id, label])?;
        }

        Ok(())
    }

    /// Recompute a thread's aggregates (unread count, starred flag, label
    /// union) from its messages, and rewrite the thread_labels index
    fn refresh_thread_aggregates(
        conn: &Connection,
        account_id: i64,
        thread_id: &str,
    ) -> Result<()> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM threads WHERE account_id = ? AND id = ?)",
            params![account_id, thread_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(());
        }

        let unread_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages
             WHERE account_id = ? AND thread_id = ? AND is_read = 0",
            params![account_id, thread_id],
            |row| row.get(0),
        )?;

        let is_starred: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM messages
                WHERE account_id = ? AND thread_id = ? AND is_starred = 1
             )",
            params![account_id, thread_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "UPDATE threads SET unread_count = ?, is_starred = ?, updated_at = ?
             WHERE account_id = ? AND id = ?",
            params![
                unread_count,
                is_starred,
                Utc::now().to_rfc3339(),
                account_id,
                thread_id
            ],
        )?;

        Self::rebuild_thread_label_index(conn, account_id, thread_id)
    }

    /// Rewrite the thread_labels index from the thread's message labels
    fn rebuild_thread_label_index(
        conn: &Connection,
        account_id: i64,
        thread_id: &str,
    ) -> Result<()> {
        let last_message_at: Option<String> = conn
            .query_row(
                "SELECT last_message_at FROM threads WHERE account_id = ? AND id = ?",
                params![account_id, thread_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(last_message_at) = last_message_at else {
            return Ok(());
        };

        let mut stmt = conn.prepare(
            "SELECT DISTINCT label_id FROM message_labels
             WHERE message_id IN (
                SELECT id FROM messages WHERE account_id = ? AND thread_id = ?
             )",
        )?;
        let label_ids: Vec<String> = stmt
            .query_map(params![account_id, thread_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;

        conn.execute(
            "DELETE FROM thread_labels WHERE account_id = ? AND thread_id = ?",
            params![account_id, thread_id],
        )?;

        let mut insert_stmt = conn.prepare(
            "INSERT INTO thread_labels (account_id, thread_id, label_id, last_message_at)
             VALUES (?, ?, ?, ?)",
        )?;
        for label in &label_ids {
            insert_stmt.execute(params![account_id, thread_id, label, last_message_at])?;
        }

        Ok(())
    }

    /// Load a full message (bodies decompressed) from a row id
    fn load_message(conn: &Connection, message_id: &str) -> Result<Option<Message>> {
        let row: Option<(
            String,
            i64,
            String,
            Option<String>,
            String,
            String,
            String,
            Option<Vec<u8>>,
            Option<Vec<u8>>,
            bool,
            bool,
            Option<String>,
            String,
            String,
            Option<String>,
        )> = conn
            .query_row(
                "SELECT id, account_id, thread_id, from_name, from_email, subject, snippet,
                        body_text, body_html, is_read, is_starred, sent_at, received_at,
                        headers, tracking_pixel_id
                 FROM messages WHERE id = ?",
                [message_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                        row.get(10)?,
                        row.get(11)?,
                        row.get(12)?,
                        row.get(13)?,
                        row.get(14)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            id,
            account_id,
            thread_id,
            from_name,
            from_email,
            subject,
            snippet,
            body_text_compressed,
            body_html_compressed,
            is_read,
            is_starred,
            sent_at,
            received_at,
            headers_json,
            tracking_pixel_id,
        )) = row
        else {
            return Ok(None);
        };

        let body_text = body_text_compressed
            .map(|data| {
                zstd::decode_all(data.as_slice())
                    .context("Failed to decompress body_text")
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
            .transpose()?;

        let body_html = body_html_compressed
            .map(|data| {
                zstd::decode_all(data.as_slice())
                    .context("Failed to decompress body_html")
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            })
            .transpose()?;

        let to = Self::load_recipients(conn, &id, "to")?;
        let cc = Self::load_recipients(conn, &id, "cc")?;
        let bcc = Self::load_recipients(conn, &id, "bcc")?;
        let label_ids = Self::load_labels(conn, &id)?;
        let headers: Vec<(String, String)> =
            serde_json::from_str(&headers_json).unwrap_or_default();

        Ok(Some(Message {
            id: MessageId::new(id),
            thread_id: ThreadId::new(thread_id),
            account_id,
            from: EmailAddress {
                name: from_name,
                email: from_email,
            },
            to,
            cc,
            bcc,
            subject,
            snippet,
            body_text,
            body_html,
            label_ids,
            is_read,
            is_starred,
            sent_at: parse_ts_opt(sent_at),
            received_at: parse_ts(&received_at),
            headers,
            tracking_pixel_id,
        }))
    }

    fn thread_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Thread> {
        let participants_json: String = row.get(4)?;
        let last_message_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        Ok(Thread {
            account_id: row.get(0)?,
            id: ThreadId::new(row.get::<_, String>(1)?),
            subject: row.get(2)?,
            snippet: row.get(3)?,
            participants: serde_json::from_str(&participants_json).unwrap_or_default(),
            label_ids: Vec::new(), // filled in by the caller
            is_starred: row.get(5)?,
            message_count: row.get::<_, i64>(6)? as usize,
            unread_count: row.get::<_, i64>(7)? as usize,
            last_message_at: parse_ts(&last_message_at),
            updated_at: parse_ts(&updated_at),
        })
    }

    /// Fill in a thread's label union from the thread_labels index
    fn attach_thread_labels(conn: &Connection, thread: &mut Thread) -> Result<()> {
        let mut stmt = conn.prepare(
            "SELECT label_id FROM thread_labels WHERE account_id = ? AND thread_id = ?",
        )?;
        thread.label_ids = stmt
            .query_map(params![thread.account_id, thread.id.as_str()], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    fn send_status_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SendStatus> {
        let status: String = row.get(2)?;
        let bounce_type: Option<String> = row.get(6)?;
        let next_retry_at: Option<String> = row.get(8)?;
        let sent_at: Option<String> = row.get(9)?;
        let failed_at: Option<String> = row.get(10)?;
        let message_id: Option<String> = row.get(12)?;
        let created_at: String = row.get(13)?;

        Ok(SendStatus {
            id: row.get(0)?,
            account_id: row.get(1)?,
            status: DeliveryState::parse(&status),
            retry_count: row.get::<_, i64>(3)? as u32,
            max_retries: row.get::<_, i64>(4)? as u32,
            error_message: row.get(5)?,
            bounce_type: bounce_type.as_deref().and_then(BounceKind::parse),
            bounce_reason: row.get(7)?,
            next_retry_at: parse_ts_opt(next_retry_at),
            sent_at: parse_ts_opt(sent_at),
            failed_at: parse_ts_opt(failed_at),
            draft_id: row.get(11)?,
            message_id: message_id.map(MessageId::new),
            created_at: parse_ts(&created_at),
        })
    }

    const SEND_STATUS_COLUMNS: &'static str = "id, account_id, status, retry_count, max_retries, \
         error_message, bounce_type, bounce_reason, next_retry_at, sent_at, failed_at, \
         draft_id, message_id, created_at";
}

impl MailStore for SqliteMailStore {
    fn insert_account(&self, mut account: Account) -> Result<Account> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO accounts (email, display_name, is_primary, added_at, encrypted_tokens)
             VALUES (?, ?, ?, ?, ?)",
            params![
                account.email,
                account.display_name,
                account.is_primary,
                account.added_at.to_rfc3339(),
                account.encrypted_tokens,
            ],
        )?;
        account.id = conn.last_insert_rowid();

        // Sync state is created with the account (1:1) and lives as long
        // as the account does
        conn.execute(
            "INSERT INTO sync_state (account_id, status) VALUES (?, 'idle')",
            [account.id],
        )?;

        Ok(account)
    }

    fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.conn.lock().unwrap();

        let account = conn
            .query_row(
                "SELECT id, email, display_name, is_primary, added_at, encrypted_tokens
                 FROM accounts WHERE id = ?",
                [id],
                |row| {
                    let added_at: String = row.get(4)?;
                    Ok(Account {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        display_name: row.get(2)?,
                        is_primary: row.get(3)?,
                        added_at: parse_ts(&added_at),
                        encrypted_tokens: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(account)
    }

    fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let id: Option<i64> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row("SELECT id FROM accounts WHERE email = ?", [email], |row| {
                row.get(0)
            })
            .optional()?
        };

        match id {
            Some(id) => self.get_account(id),
            None => Ok(None),
        }
    }

    fn update_account_tokens(&self, account_id: i64, ciphertext: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET encrypted_tokens = ? WHERE id = ?",
            params![ciphertext, account_id],
        )?;
        Ok(())
    }

    fn upsert_thread(&self, thread: Thread) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        let participants_json = serde_json::to_string(&thread.participants)?;

        // ON CONFLICT DO UPDATE rather than INSERT OR REPLACE: REPLACE
        // deletes the old row first, which fires CASCADEs
        conn.execute(
            "INSERT INTO threads
             (account_id, id, subject, snippet, participants, is_starred,
              message_count, unread_count, last_message_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id, id) DO UPDATE SET
                subject = excluded.subject,
                snippet = excluded.snippet,
                participants = excluded.participants,
                is_starred = excluded.is_starred,
                message_count = excluded.message_count,
                unread_count = excluded.unread_count,
                last_message_at = excluded.last_message_at,
                updated_at = excluded.updated_at",
            params![
                thread.account_id,
                thread.id.as_str(),
                thread.subject,
                thread.snippet,
                participants_json,
                thread.is_starred,
                thread.message_count as i64,
                thread.unread_count as i64,
                thread.last_message_at.to_rfc3339(),
                thread.updated_at.to_rfc3339(),
            ],
        )?;

        // Keep the label index in step when the thread row lands after
        // its messages (the reconciler upserts messages first)
        Self::rebuild_thread_label_index(&conn, thread.account_id, thread.id.as_str())?;

        Ok(())
    }

    fn get_thread(&self, account_id: i64, id: &ThreadId) -> Result<Option<Thread>> {
        let conn = self.conn.lock().unwrap();

        let thread = conn
            .query_row(
                "SELECT account_id, id, subject, snippet, participants, is_starred,
                        message_count, unread_count, last_message_at, updated_at
                 FROM threads WHERE account_id = ? AND id = ?",
                params![account_id, id.as_str()],
                Self::thread_from_row,
            )
            .optional()?;

        let Some(mut thread) = thread else {
            return Ok(None);
        };
        Self::attach_thread_labels(&conn, &mut thread)?;

        Ok(Some(thread))
    }

    fn has_thread(&self, account_id: i64, id: &ThreadId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE account_id = ? AND id = ?",
            params![account_id, id.as_str()],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    fn list_threads(&self, account_id: i64, limit: usize, offset: usize) -> Result<Vec<Thread>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT account_id, id, subject, snippet, participants, is_starred,
                    message_count, unread_count, last_message_at, updated_at
             FROM threads
             WHERE account_id = ?
             ORDER BY last_message_at DESC
             LIMIT ? OFFSET ?",
        )?;

        let mut threads = stmt
            .query_map(
                params![account_id, limit as i64, offset as i64],
                Self::thread_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for thread in &mut threads {
            Self::attach_thread_labels(&conn, thread)?;
        }

        Ok(threads)
    }

    fn list_threads_by_label(
        &self,
        account_id: i64,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT t.account_id, t.id, t.subject, t.snippet, t.participants, t.is_starred,
                    t.message_count, t.unread_count, t.last_message_at, t.updated_at
             FROM threads t
             INNER JOIN thread_labels tl
                ON t.account_id = tl.account_id AND t.id = tl.thread_id
             WHERE t.account_id = ? AND tl.label_id = ?
             ORDER BY tl.last_message_at DESC
             LIMIT ? OFFSET ?",
        )?;

        let mut threads = stmt
            .query_map(
                params![account_id, label, limit as i64, offset as i64],
                Self::thread_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for thread in &mut threads {
            Self::attach_thread_labels(&conn, thread)?;
        }

        Ok(threads)
    }

    fn count_threads(&self, account_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM threads WHERE account_id = ?",
            [account_id],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }

    fn upsert_message(&self, message: Message) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?)",
            [message.id.as_str()],
            |row| row.get(0),
        )?;

        if exists {
            // Bodies and identifiers are immutable; only labels and flags
            // follow the incoming row
            tx.execute(
                "UPDATE messages SET is_read = ?, is_starred = ? WHERE id = ?",
                params![message.is_read, message.is_starred, message.id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM message_labels WHERE message_id = ?",
                [message.id.as_str()],
            )?;
            Self::save_labels(&tx, message.id.as_str(), &message.label_ids)?;
        } else {
            // zstd level 3: good speed/ratio balance for mail bodies
            let body_text_compressed = message
                .body_text
                .as_ref()
                .map(|text| zstd::encode_all(text.as_bytes(), 3))
                .transpose()
                .context("Failed to compress body_text")?;

            let body_html_compressed = message
                .body_html
                .as_ref()
                .map(|html| zstd::encode_all(html.as_bytes(), 3))
                .transpose()
                .context("Failed to compress body_html")?;

            let headers_json = serde_json::to_string(&message.headers)?;

            tx.execute(
                "INSERT INTO messages
                 (id, account_id, thread_id, from_name, from_email, subject, snippet,
                  body_text, body_html, is_read, is_starred, sent_at, received_at,
                  headers, tracking_pixel_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    message.id.as_str(),
                    message.account_id,
                    message.thread_id.as_str(),
                    message.from.name,
                    message.from.email,
                    message.subject,
                    message.snippet,
                    body_text_compressed,
                    body_html_compressed,
                    message.is_read,
                    message.is_starred,
                    message.sent_at.map(|t| t.to_rfc3339()),
                    message.received_at.to_rfc3339(),
                    headers_json,
                    message.tracking_pixel_id,
                ],
            )?;

            Self::save_recipients(&tx, message.id.as_str(), "to", &message.to)?;
            Self::save_recipients(&tx, message.id.as_str(), "cc", &message.cc)?;
            Self::save_recipients(&tx, message.id.as_str(), "bcc", &message.bcc)?;
            Self::save_labels(&tx, message.id.as_str(), &message.label_ids)?;
        }

        Self::refresh_thread_aggregates(&tx, message.account_id, message.thread_id.as_str())?;

        tx.commit()?;
        Ok(())
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        let conn = self.conn.lock().unwrap();
        Self::load_message(&conn, id.as_str())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?",
            [id.as_str()],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    fn list_messages_for_thread(
        &self,
        account_id: i64,
        thread_id: &ThreadId,
    ) -> Result<Vec<Message>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id FROM messages
             WHERE account_id = ? AND thread_id = ?
             ORDER BY received_at ASC",
        )?;

        let message_ids: Vec<String> = stmt
            .query_map(params![account_id, thread_id.as_str()], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut messages = Vec::new();
        for id in &message_ids {
            if let Some(message) = Self::load_message(&conn, id)? {
                messages.push(message);
            } else {
                log::warn!("[STORE] Failed to load message {}", id);
            }
        }

        Ok(messages)
    }

    fn get_message_ids_for_thread(
        &self,
        account_id: i64,
        thread_id: &ThreadId,
    ) -> Result<Vec<MessageId>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id FROM messages
             WHERE account_id = ? AND thread_id = ?
             ORDER BY received_at ASC",
        )?;

        let ids = stmt
            .query_map(params![account_id, thread_id.as_str()], |row| {
                Ok(MessageId::new(row.get::<_, String>(0)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn count_messages_in_thread(&self, account_id: i64, thread_id: &ThreadId) -> Result<usize> {
        let conn = self.conn.lock().unwrap();

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE account_id = ? AND thread_id = ?",
            params![account_id, thread_id.as_str()],
            |row| row.get(0),
        )?;

        Ok(count as usize)
    }

    fn update_message_labels(&self, id: &MessageId, label_ids: Vec<String>) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let location: Option<(i64, String)> = tx
            .query_row(
                "SELECT account_id, thread_id FROM messages WHERE id = ?",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((account_id, thread_id)) = location else {
            return Ok(()); // Message not found
        };

        let is_read = !label_ids.iter().any(|l| l == labels::UNREAD);
        let is_starred = label_ids.iter().any(|l| l == labels::STARRED);

        tx.execute(
            "UPDATE messages SET is_read = ?, is_starred = ? WHERE id = ?",
            params![is_read, is_starred, id.as_str()],
        )?;

        tx.execute(
            "DELETE FROM message_labels WHERE message_id = ?",
            [id.as_str()],
        )?;
        Self::save_labels(&tx, id.as_str(), &label_ids)?;

        Self::refresh_thread_aggregates(&tx, account_id, &thread_id)?;

        tx.commit()?;
        Ok(())
    }

    fn find_message_by_tracking_id(&self, tracking_id: &str) -> Result<Option<Message>> {
        let id: Option<String> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT id FROM messages WHERE tracking_pixel_id = ?",
                [tracking_id],
                |row| row.get(0),
            )
            .optional()?
        };

        match id {
            Some(id) => self.get_message(&MessageId::new(id)),
            None => Ok(None),
        }
    }

    fn get_sync_state(&self, account_id: i64) -> Result<Option<SyncState>> {
        let conn = self.conn.lock().unwrap();

        let state = conn
            .query_row(
                "SELECT account_id, status, history_id, last_synced_at, last_error,
                        lease_expires_at
                 FROM sync_state WHERE account_id = ?",
                [account_id],
                |row| {
                    let status: String = row.get(1)?;
                    let last_synced_at: Option<String> = row.get(3)?;
                    let lease_expires_at: Option<String> = row.get(5)?;
                    Ok(SyncState {
                        account_id: row.get(0)?,
                        status: SyncStatus::parse(&status),
                        history_id: row.get(2)?,
                        last_synced_at: parse_ts_opt(last_synced_at),
                        last_error: row.get(4)?,
                        lease_expires_at: parse_ts_opt(lease_expires_at),
                    })
                },
            )
            .optional()?;

        Ok(state)
    }

    fn save_sync_state(&self, state: SyncState) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO sync_state
             (account_id, status, history_id, last_synced_at, last_error, lease_expires_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_id) DO UPDATE SET
                status = excluded.status,
                history_id = excluded.history_id,
                last_synced_at = excluded.last_synced_at,
                last_error = excluded.last_error,
                lease_expires_at = excluded.lease_expires_at",
            params![
                state.account_id,
                state.status.as_str(),
                state.history_id,
                state.last_synced_at.map(|t| t.to_rfc3339()),
                state.last_error,
                state.lease_expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        Ok(())
    }

    fn try_claim_sync(
        &self,
        account_id: i64,
        now: DateTime<Utc>,
        lease_secs: i64,
    ) -> Result<Option<SyncState>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT OR IGNORE INTO sync_state (account_id, status) VALUES (?, 'idle')",
            [account_id],
        )?;

        // Claim-row-with-expiry: the update only lands when no live lease
        // is held, so exactly one concurrent caller wins
        let expiry = now + chrono::Duration::seconds(lease_secs);
        let claimed = tx.execute(
            "UPDATE sync_state
             SET status = 'syncing', lease_expires_at = ?
             WHERE account_id = ?
               AND NOT (status = 'syncing' AND lease_expires_at > ?)",
            params![expiry.to_rfc3339(), account_id, now.to_rfc3339()],
        )?;

        if claimed == 0 {
            return Ok(None);
        }

        let state = tx.query_row(
            "SELECT account_id, status, history_id, last_synced_at, last_error, lease_expires_at
             FROM sync_state WHERE account_id = ?",
            [account_id],
            |row| {
                let status: String = row.get(1)?;
                let last_synced_at: Option<String> = row.get(3)?;
                let lease_expires_at: Option<String> = row.get(5)?;
                Ok(SyncState {
                    account_id: row.get(0)?,
                    status: SyncStatus::parse(&status),
                    history_id: row.get(2)?,
                    last_synced_at: parse_ts_opt(last_synced_at),
                    last_error: row.get(4)?,
                    lease_expires_at: parse_ts_opt(lease_expires_at),
                })
            },
        )?;

        tx.commit()?;
        Ok(Some(state))
    }

    fn insert_draft(&self, account_id: i64, email: &OutgoingEmail) -> Result<Draft> {
        let conn = self.conn.lock().unwrap();

        let payload = serde_json::to_string(email)?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO drafts (account_id, payload, created_at) VALUES (?, ?, ?)",
            params![account_id, payload, created_at.to_rfc3339()],
        )?;

        Ok(Draft {
            id: conn.last_insert_rowid(),
            account_id,
            email: email.clone(),
            created_at,
        })
    }

    fn get_draft(&self, id: i64) -> Result<Option<Draft>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(i64, i64, String, String)> = conn
            .query_row(
                "SELECT id, account_id, payload, created_at FROM drafts WHERE id = ?",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((id, account_id, payload, created_at)) = row else {
            return Ok(None);
        };

        let email: OutgoingEmail =
            serde_json::from_str(&payload).context("Failed to parse draft payload")?;

        Ok(Some(Draft {
            id,
            account_id,
            email,
            created_at: parse_ts(&created_at),
        }))
    }

    fn insert_send_status(&self, mut status: SendStatus) -> Result<SendStatus> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO send_status
             (account_id, status, retry_count, max_retries, error_message, bounce_type,
              bounce_reason, next_retry_at, sent_at, failed_at, draft_id, message_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                status.account_id,
                status.status.as_str(),
                status.retry_count as i64,
                status.max_retries as i64,
                status.error_message,
                status.bounce_type.map(|b| b.as_str()),
                status.bounce_reason,
                status.next_retry_at.map(|t| t.to_rfc3339()),
                status.sent_at.map(|t| t.to_rfc3339()),
                status.failed_at.map(|t| t.to_rfc3339()),
                status.draft_id,
                status.message_id.as_ref().map(|m| m.as_str().to_string()),
                status.created_at.to_rfc3339(),
            ],
        )?;

        status.id = conn.last_insert_rowid();
        Ok(status)
    }

    fn get_send_status(&self, id: i64) -> Result<Option<SendStatus>> {
        let conn = self.conn.lock().unwrap();

        let status = conn
            .query_row(
                &format!(
                    "SELECT {} FROM send_status WHERE id = ?",
                    Self::SEND_STATUS_COLUMNS
                ),
                [id],
                Self::send_status_from_row,
            )
            .optional()?;

        Ok(status)
    }

    fn update_send_status(&self, status: &SendStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE send_status SET
                status = ?, retry_count = ?, max_retries = ?, error_message = ?,
                bounce_type = ?, bounce_reason = ?, next_retry_at = ?, sent_at = ?,
                failed_at = ?, draft_id = ?, message_id = ?
             WHERE id = ?",
            params![
                status.status.as_str(),
                status.retry_count as i64,
                status.max_retries as i64,
                status.error_message,
                status.bounce_type.map(|b| b.as_str()),
                status.bounce_reason,
                status.next_retry_at.map(|t| t.to_rfc3339()),
                status.sent_at.map(|t| t.to_rfc3339()),
                status.failed_at.map(|t| t.to_rfc3339()),
                status.draft_id,
                status.message_id.as_ref().map(|m| m.as_str().to_string()),
                status.id,
            ],
        )?;

        Ok(())
    }

    fn list_retry_eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SendStatus>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM send_status
             WHERE status IN ('failed', 'hard', 'soft', 'complaint')
               AND retry_count < max_retries
               AND next_retry_at IS NOT NULL
               AND next_retry_at <= ?
             ORDER BY next_retry_at ASC
             LIMIT ?",
            Self::SEND_STATUS_COLUMNS
        ))?;

        let statuses = stmt
            .query_map(
                params![now.to_rfc3339(), limit as i64],
                Self::send_status_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(statuses)
    }

    fn insert_scheduled_send(
        &self,
        account_id: i64,
        email: &OutgoingEmail,
        due_at: DateTime<Utc>,
    ) -> Result<ScheduledSend> {
        let conn = self.conn.lock().unwrap();

        let payload = serde_json::to_string(email)?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO scheduled_sends (account_id, payload, due_at, created_at)
             VALUES (?, ?, ?, ?)",
            params![
                account_id,
                payload,
                due_at.to_rfc3339(),
                created_at.to_rfc3339()
            ],
        )?;

        Ok(ScheduledSend {
            id: conn.last_insert_rowid(),
            account_id,
            email: email.clone(),
            due_at,
            created_at,
        })
    }

    fn list_due_scheduled_sends(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledSend>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, account_id, payload, due_at, created_at
             FROM scheduled_sends
             WHERE due_at <= ?
             ORDER BY due_at ASC
             LIMIT ?",
        )?;

        let rows: Vec<(i64, i64, String, String, String)> = stmt
            .query_map(params![now.to_rfc3339(), limit as i64], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut result = Vec::new();
        for (id, account_id, payload, due_at, created_at) in rows {
            let email: OutgoingEmail = match serde_json::from_str(&payload) {
                Ok(email) => email,
                Err(e) => {
                    log::warn!("[STORE] Skipping scheduled send {} with bad payload: {}", id, e);
                    continue;
                }
            };
            result.push(ScheduledSend {
                id,
                account_id,
                email,
                due_at: parse_ts(&due_at),
                created_at: parse_ts(&created_at),
            });
        }

        Ok(result)
    }

    fn delete_scheduled_send(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM scheduled_sends WHERE id = ?", [id])?;
        Ok(())
    }

    fn insert_open_event(&self, mut event: OpenEvent) -> Result<OpenEvent> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO open_events (tracking_id, message_id, opened_at, ip, location, user_agent)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                event.tracking_id,
                event.message_id.as_str(),
                event.opened_at.to_rfc3339(),
                event.ip,
                event.location,
                event.user_agent,
            ],
        )?;

        event.id = conn.last_insert_rowid();
        Ok(event)
    }

    fn list_open_events(&self, message_id: &MessageId) -> Result<Vec<OpenEvent>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT id, tracking_id, message_id, opened_at, ip, location, user_agent
             FROM open_events WHERE message_id = ? ORDER BY opened_at ASC",
        )?;

        let events = stmt
            .query_map([message_id.as_str()], |row| {
                let opened_at: String = row.get(3)?;
                Ok(OpenEvent {
                    id: row.get(0)?,
                    tracking_id: row.get(1)?,
                    message_id: MessageId::new(row.get::<_, String>(2)?),
                    opened_at: parse_ts(&opened_at),
                    ip: row.get(4)?,
                    location: row.get(5)?,
                    user_agent: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(
            "DELETE FROM open_events;
             DELETE FROM scheduled_sends;
             DELETE FROM send_status;
             DELETE FROM drafts;
             DELETE FROM thread_labels;
             DELETE FROM message_labels;
             DELETE FROM message_recipients;
             DELETE FROM messages;
             DELETE FROM threads;
             DELETE FROM sync_state;
             DELETE FROM accounts;",
        )?;

        Ok(())
    }
}
