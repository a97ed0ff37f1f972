//! Local datastore for mailboxes, messages and attachments
//!
//! The pipeline only needs create/query operations, expressed by the blocking
//! [`Datastore`] trait. [`MemoryStore`] keeps state behind a mutex and backs
//! the tests; [`SqliteStore`] is the on-disk store shared by every sync
//! process, with `UNIQUE(mailbox_id, uid)` enforced by the database.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::DateTime;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{ErrorCode, OptionalExtension, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::models::{AttachmentRecord, Mailbox, MessageRecord, NewAttachment, NewMessage};

/// Create/query operations the sync pipeline performs on local storage
pub trait Datastore {
    /// Look up a mailbox by id
    ///
    /// # Errors
    ///
    /// `NotFound` if no such mailbox exists.
    fn mailbox(&self, mailbox_id: &str) -> AppResult<Mailbox>;

    /// All mailboxes, ordered by id
    fn mailboxes(&self) -> AppResult<Vec<Mailbox>>;

    /// Register a mailbox with a zero watermark
    fn create_mailbox(&self, account_id: &str, name: &str) -> AppResult<Mailbox>;

    /// Move the watermark forward
    ///
    /// # Errors
    ///
    /// `InvalidInput` if `uid` is lower than the current watermark.
    fn set_last_seen_uid(&self, mailbox_id: &str, uid: u32) -> AppResult<Mailbox>;

    /// UIDs of every message stored for the mailbox
    fn existing_uids(&self, mailbox_id: &str) -> AppResult<BTreeSet<u32>>;

    /// Create a message record
    ///
    /// # Errors
    ///
    /// `Persistence` if `(mailbox_id, uid)` already exists or storage fails.
    fn create_message(&self, message: NewMessage) -> AppResult<MessageRecord>;

    /// Create an attachment record for an existing message
    fn create_attachment(&self, attachment: NewAttachment) -> AppResult<AttachmentRecord>;

    /// Messages stored for the mailbox, ordered by UID
    fn messages(&self, mailbox_id: &str) -> AppResult<Vec<MessageRecord>>;

    /// Attachments stored for a message record
    fn attachments(&self, message_record_id: &str) -> AppResult<Vec<AttachmentRecord>>;
}

impl<T: Datastore + ?Sized> Datastore for Arc<T> {
    fn mailbox(&self, mailbox_id: &str) -> AppResult<Mailbox> {
        (**self).mailbox(mailbox_id)
    }

    fn mailboxes(&self) -> AppResult<Vec<Mailbox>> {
        (**self).mailboxes()
    }

    fn create_mailbox(&self, account_id: &str, name: &str) -> AppResult<Mailbox> {
        (**self).create_mailbox(account_id, name)
    }

    fn set_last_seen_uid(&self, mailbox_id: &str, uid: u32) -> AppResult<Mailbox> {
        (**self).set_last_seen_uid(mailbox_id, uid)
    }

    fn existing_uids(&self, mailbox_id: &str) -> AppResult<BTreeSet<u32>> {
        (**self).existing_uids(mailbox_id)
    }

    fn create_message(&self, message: NewMessage) -> AppResult<MessageRecord> {
        (**self).create_message(message)
    }

    fn create_attachment(&self, attachment: NewAttachment) -> AppResult<AttachmentRecord> {
        (**self).create_attachment(attachment)
    }

    fn messages(&self, mailbox_id: &str) -> AppResult<Vec<MessageRecord>> {
        (**self).messages(mailbox_id)
    }

    fn attachments(&self, message_record_id: &str) -> AppResult<Vec<AttachmentRecord>> {
        (**self).attachments(message_record_id)
    }
}

/// Contents of a [`MemoryStore`]
#[derive(Debug, Default)]
struct StoreState {
    mailboxes: Vec<Mailbox>,
    messages: Vec<MessageRecord>,
    attachments: Vec<AttachmentRecord>,
}

impl StoreState {
    fn mailbox_mut(&mut self, mailbox_id: &str) -> AppResult<&mut Mailbox> {
        self.mailboxes
            .iter_mut()
            .find(|m| m.id == mailbox_id)
            .ok_or_else(|| AppError::NotFound(format!("mailbox '{mailbox_id}' does not exist")))
    }

    fn create_mailbox(&mut self, account_id: &str, name: &str) -> AppResult<Mailbox> {
        validate_mailbox_name(name)?;
        if self
            .mailboxes
            .iter()
            .any(|m| m.account_id == account_id && m.name == name)
        {
            return Err(AppError::invalid(format!(
                "mailbox '{name}' is already registered for account '{account_id}'"
            )));
        }
        let mailbox = Mailbox {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_owned(),
            name: name.to_owned(),
            last_seen_uid: 0,
        };
        self.mailboxes.push(mailbox.clone());
        Ok(mailbox)
    }

    fn set_last_seen_uid(&mut self, mailbox_id: &str, uid: u32) -> AppResult<Mailbox> {
        let mailbox = self.mailbox_mut(mailbox_id)?;
        if uid < mailbox.last_seen_uid {
            return Err(AppError::invalid(format!(
                "watermark for mailbox '{mailbox_id}' cannot move back from {} to {uid}",
                mailbox.last_seen_uid
            )));
        }
        mailbox.last_seen_uid = uid;
        Ok(mailbox.clone())
    }

    fn create_message(&mut self, message: NewMessage) -> AppResult<MessageRecord> {
        self.mailbox_mut(&message.mailbox_id)
            .map_err(|e| AppError::persistence(e.to_string()))?;
        if self
            .messages
            .iter()
            .any(|m| m.message.mailbox_id == message.mailbox_id && m.message.uid == message.uid)
        {
            return Err(AppError::persistence(format!(
                "message uid {} already exists in mailbox '{}'",
                message.uid, message.mailbox_id
            )));
        }
        let record = MessageRecord {
            id: Uuid::new_v4().to_string(),
            message,
        };
        self.messages.push(record.clone());
        Ok(record)
    }

    fn create_attachment(&mut self, attachment: NewAttachment) -> AppResult<AttachmentRecord> {
        if !self
            .messages
            .iter()
            .any(|m| m.id == attachment.message_record_id)
        {
            return Err(AppError::persistence(format!(
                "message record '{}' does not exist",
                attachment.message_record_id
            )));
        }
        let record = AttachmentRecord {
            id: Uuid::new_v4().to_string(),
            attachment,
        };
        self.attachments.push(record.clone());
        Ok(record)
    }
}

/// In-memory datastore
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| AppError::persistence("datastore lock poisoned"))
    }
}

impl Datastore for MemoryStore {
    fn mailbox(&self, mailbox_id: &str) -> AppResult<Mailbox> {
        self.lock()?.mailbox_mut(mailbox_id).map(|m| m.clone())
    }

    fn mailboxes(&self) -> AppResult<Vec<Mailbox>> {
        let mut mailboxes = self.lock()?.mailboxes.clone();
        mailboxes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(mailboxes)
    }

    fn create_mailbox(&self, account_id: &str, name: &str) -> AppResult<Mailbox> {
        self.lock()?.create_mailbox(account_id, name)
    }

    fn set_last_seen_uid(&self, mailbox_id: &str, uid: u32) -> AppResult<Mailbox> {
        self.lock()?.set_last_seen_uid(mailbox_id, uid)
    }

    fn existing_uids(&self, mailbox_id: &str) -> AppResult<BTreeSet<u32>> {
        Ok(self
            .lock()?
            .messages
            .iter()
            .filter(|m| m.message.mailbox_id == mailbox_id)
            .map(|m| m.message.uid)
            .collect())
    }

    fn create_message(&self, message: NewMessage) -> AppResult<MessageRecord> {
        self.lock()?.create_message(message)
    }

    fn create_attachment(&self, attachment: NewAttachment) -> AppResult<AttachmentRecord> {
        self.lock()?.create_attachment(attachment)
    }

    fn messages(&self, mailbox_id: &str) -> AppResult<Vec<MessageRecord>> {
        let mut messages: Vec<MessageRecord> = self
            .lock()?
            .messages
            .iter()
            .filter(|m| m.message.mailbox_id == mailbox_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.message.uid);
        Ok(messages)
    }

    fn attachments(&self, message_record_id: &str) -> AppResult<Vec<AttachmentRecord>> {
        Ok(self
            .lock()?
            .attachments
            .iter()
            .filter(|a| a.attachment.message_record_id == message_record_id)
            .cloned()
            .collect())
    }
}

/// Tables shared by every process opening the same data directory
const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;

    CREATE TABLE IF NOT EXISTS mailboxes (
        id              TEXT PRIMARY KEY,   -- UUID
        account_id      TEXT NOT NULL,
        name            TEXT NOT NULL,
        last_seen_uid   INTEGER NOT NULL DEFAULT 0,
        UNIQUE(account_id, name)
    );

    CREATE TABLE IF NOT EXISTS messages (
        id              TEXT PRIMARY KEY,   -- UUID
        mailbox_id      TEXT NOT NULL REFERENCES mailboxes(id),
        uid             INTEGER NOT NULL,
        message_id      TEXT,
        subject         TEXT,
        timestamp_ms    INTEGER,            -- unix epoch ms
        read            INTEGER NOT NULL,
        flags           TEXT NOT NULL,      -- JSON array
        text_part       TEXT,
        html_part       TEXT,
        sanitized_html  TEXT,
        raw             BLOB NOT NULL,
        participants    TEXT NOT NULL,      -- JSON array
        UNIQUE(mailbox_id, uid)
    );

    CREATE TABLE IF NOT EXISTS attachments (
        id                  TEXT PRIMARY KEY,   -- UUID
        message_record_id   TEXT NOT NULL REFERENCES messages(id),
        filename            TEXT NOT NULL,
        location            TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_record_id);
";

const MESSAGE_COLUMNS: &str = "id, mailbox_id, uid, message_id, subject, timestamp_ms, read, \
     flags, text_part, html_part, sanitized_html, raw, participants";

/// SQLite-backed datastore at `<data_dir>/store.db`
///
/// Every write is a single statement, so a failed write leaves nothing
/// behind. Processes syncing different mailboxes share the file; SQLite
/// serializes their writes and waits up to five seconds for a lock.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Open (or create) the store in `dir`
    ///
    /// # Errors
    ///
    /// `Persistence` if the directory, the database or its schema cannot be
    /// created.
    pub fn open(dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            AppError::persistence(format!("cannot create data dir {}: {e}", dir.display()))
        })?;
        let manager = SqliteConnectionManager::file(dir.join("store.db")).with_init(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| AppError::persistence(format!("cannot open datastore: {e}")))?;

        let store = Self { pool };
        store
            .connection()?
            .execute_batch(SCHEMA)
            .map_err(db_error)?;
        Ok(store)
    }

    fn connection(&self) -> AppResult<PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| AppError::persistence(format!("cannot get datastore connection: {e}")))
    }
}

impl Datastore for SqliteStore {
    fn mailbox(&self, mailbox_id: &str) -> AppResult<Mailbox> {
        find_mailbox(&self.connection()?, mailbox_id)
    }

    fn mailboxes(&self) -> AppResult<Vec<Mailbox>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT id, account_id, name, last_seen_uid FROM mailboxes ORDER BY id")
            .map_err(db_error)?;
        let rows = stmt.query_map([], mailbox_from_row).map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    fn create_mailbox(&self, account_id: &str, name: &str) -> AppResult<Mailbox> {
        validate_mailbox_name(name)?;
        let mailbox = Mailbox {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.to_owned(),
            name: name.to_owned(),
            last_seen_uid: 0,
        };
        self.connection()?
            .execute(
                "INSERT INTO mailboxes (id, account_id, name, last_seen_uid) VALUES (?1, ?2, ?3, 0)",
                params![mailbox.id, mailbox.account_id, mailbox.name],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    AppError::invalid(format!(
                        "mailbox '{name}' is already registered for account '{account_id}'"
                    ))
                } else {
                    db_error(e)
                }
            })?;
        Ok(mailbox)
    }

    fn set_last_seen_uid(&self, mailbox_id: &str, uid: u32) -> AppResult<Mailbox> {
        let conn = self.connection()?;
        let changed = conn
            .execute(
                "UPDATE mailboxes SET last_seen_uid = ?2 WHERE id = ?1 AND last_seen_uid <= ?2",
                params![mailbox_id, uid],
            )
            .map_err(db_error)?;
        let mailbox = find_mailbox(&conn, mailbox_id)?;
        if changed == 0 {
            return Err(AppError::invalid(format!(
                "watermark for mailbox '{mailbox_id}' cannot move back from {} to {uid}",
                mailbox.last_seen_uid
            )));
        }
        Ok(mailbox)
    }

    fn existing_uids(&self, mailbox_id: &str) -> AppResult<BTreeSet<u32>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT uid FROM messages WHERE mailbox_id = ?1")
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![mailbox_id], |row| row.get::<_, u32>(0))
            .map_err(db_error)?;
        rows.collect::<Result<BTreeSet<_>, _>>().map_err(db_error)
    }

    fn create_message(&self, message: NewMessage) -> AppResult<MessageRecord> {
        let flags = to_json(&message.flags)?;
        let participants = to_json(&message.participants)?;
        let id = Uuid::new_v4().to_string();
        self.connection()?
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    id,
                    message.mailbox_id,
                    message.uid,
                    message.message_id,
                    message.subject,
                    message.timestamp.map(|t| t.timestamp_millis()),
                    message.read,
                    flags,
                    message.text_part,
                    message.html_part,
                    message.sanitized_html,
                    message.raw,
                    participants,
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    AppError::persistence(format!(
                        "cannot store uid {} in mailbox '{}': {e}",
                        message.uid, message.mailbox_id
                    ))
                } else {
                    db_error(e)
                }
            })?;
        Ok(MessageRecord { id, message })
    }

    fn create_attachment(&self, attachment: NewAttachment) -> AppResult<AttachmentRecord> {
        let location = attachment.location.to_str().ok_or_else(|| {
            AppError::persistence(format!(
                "attachment path {} is not valid UTF-8",
                attachment.location.display()
            ))
        })?;
        let id = Uuid::new_v4().to_string();
        self.connection()?
            .execute(
                "INSERT INTO attachments (id, message_record_id, filename, location) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, attachment.message_record_id, attachment.filename, location],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    AppError::persistence(format!(
                        "message record '{}' does not exist",
                        attachment.message_record_id
                    ))
                } else {
                    db_error(e)
                }
            })?;
        Ok(AttachmentRecord { id, attachment })
    }

    fn messages(&self, mailbox_id: &str) -> AppResult<Vec<MessageRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE mailbox_id = ?1 ORDER BY uid"
            ))
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![mailbox_id], message_from_row)
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }

    fn attachments(&self, message_record_id: &str) -> AppResult<Vec<AttachmentRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, message_record_id, filename, location FROM attachments \
                 WHERE message_record_id = ?1 ORDER BY rowid",
            )
            .map_err(db_error)?;
        let rows = stmt
            .query_map(params![message_record_id], |row| {
                Ok(AttachmentRecord {
                    id: row.get(0)?,
                    attachment: NewAttachment {
                        message_record_id: row.get(1)?,
                        filename: row.get(2)?,
                        location: PathBuf::from(row.get::<_, String>(3)?),
                    },
                })
            })
            .map_err(db_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_error)
    }
}

fn db_error(e: rusqlite::Error) -> AppError {
    AppError::persistence(format!("datastore error: {e}"))
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation)
}

fn to_json<T: Serialize>(value: &T) -> AppResult<String> {
    serde_json::to_string(value)
        .map_err(|e| AppError::persistence(format!("cannot encode column: {e}")))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn find_mailbox(conn: &rusqlite::Connection, mailbox_id: &str) -> AppResult<Mailbox> {
    conn.query_row(
        "SELECT id, account_id, name, last_seen_uid FROM mailboxes WHERE id = ?1",
        params![mailbox_id],
        mailbox_from_row,
    )
    .optional()
    .map_err(db_error)?
    .ok_or_else(|| AppError::NotFound(format!("mailbox '{mailbox_id}' does not exist")))
}

fn mailbox_from_row(row: &Row<'_>) -> rusqlite::Result<Mailbox> {
    Ok(Mailbox {
        id: row.get(0)?,
        account_id: row.get(1)?,
        name: row.get(2)?,
        last_seen_uid: row.get(3)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        message: NewMessage {
            mailbox_id: row.get(1)?,
            uid: row.get(2)?,
            message_id: row.get(3)?,
            subject: row.get(4)?,
            timestamp: row
                .get::<_, Option<i64>>(5)?
                .and_then(DateTime::from_timestamp_millis),
            read: row.get(6)?,
            flags: json_column(row, 7)?,
            text_part: row.get(8)?,
            html_part: row.get(9)?,
            sanitized_html: row.get(10)?,
            raw: row.get(11)?,
            participants: json_column(row, 12)?,
        },
    })
}

/// Validate mailbox name format
fn validate_mailbox_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.len() > 256 {
        return Err(AppError::InvalidInput(
            "mailbox must be 1..256 characters".to_owned(),
        ));
    }
    if name.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(
            "mailbox must not contain control characters".to_owned(),
        ));
    }
    Ok(())
}
