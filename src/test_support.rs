//! Fixtures shared by unit tests

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::DateTime;
use secrecy::SecretString;

use crate::config::{AccountConfig, SyncConfig};
use crate::errors::{AppError, AppResult};
use crate::models::{
    AttachmentDescriptor, AttachmentRecord, FetchedMessage, Mailbox, MessageRecord, NewAttachment,
    NewMessage, Participant, ParticipantRole, SyncContext,
};
use crate::store::{Datastore, MemoryStore};

pub fn account(account_id: &str, owner: &str) -> AccountConfig {
    AccountConfig {
        account_id: account_id.to_owned(),
        owner: owner.to_owned(),
        host: "imap.example.com".to_owned(),
        port: 993,
        secure: true,
        user: "sync@example.com".to_owned(),
        pass: SecretString::new("secret".into()),
    }
}

pub fn config_with_account(account_id: &str, owner: &str) -> SyncConfig {
    SyncConfig {
        accounts: [(account_id.to_owned(), account(account_id, owner))]
            .into_iter()
            .collect(),
        data_dir: PathBuf::from("data"),
        attachments_dir: PathBuf::from("data/attachments"),
        connect_timeout_ms: 1_000,
        greeting_timeout_ms: 1_000,
        socket_timeout_ms: 1_000,
    }
}

/// Context owned by `user-1` on the mailbox's account
pub fn context(mailbox: Mailbox) -> SyncContext {
    SyncContext {
        account: account(&mailbox.account_id, "user-1"),
        mailbox,
        user_id: "user-1".to_owned(),
    }
}

/// Minimal fetched message without attachments
pub fn fetched(uid: u32) -> FetchedMessage {
    FetchedMessage {
        uid,
        message_id: Some(format!("{uid}@example.com")),
        subject: Some(format!("message {uid}")),
        timestamp: None,
        read: false,
        flags: Vec::new(),
        text_part: Some("body".to_owned()),
        html_part: None,
        sanitized_html: None,
        raw: format!("Subject: message {uid}\r\n\r\nbody").into_bytes(),
        participants: Vec::new(),
        attachments: Vec::new(),
    }
}

/// Deterministic message record fields
pub fn new_message(mailbox_id: &str, uid: u32) -> NewMessage {
    NewMessage {
        mailbox_id: mailbox_id.to_owned(),
        uid,
        message_id: Some(format!("{uid}@example.com")),
        subject: Some(format!("message {uid}")),
        timestamp: DateTime::from_timestamp(1_700_000_000, 0),
        read: true,
        flags: vec!["\\Seen".to_owned()],
        text_part: Some("body".to_owned()),
        html_part: Some("<p>body</p>".to_owned()),
        sanitized_html: Some("<p>body</p>".to_owned()),
        raw: b"Subject: x\r\n\r\nbody".to_vec(),
        participants: vec![Participant {
            role: ParticipantRole::From,
            address: "alice@example.com".to_owned(),
            name: Some("Alice".to_owned()),
        }],
    }
}

pub fn descriptor(filename: &str) -> AttachmentDescriptor {
    AttachmentDescriptor {
        filename: filename.to_owned(),
        content_type: "application/octet-stream".to_owned(),
        part: Vec::new(),
    }
}

/// Single-part text message
pub fn plain_message(body: &str) -> Vec<u8> {
    format!(
        "From: Alice <alice@example.com>\r\n\
         To: bob@example.com\r\n\
         Subject: {body}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    )
    .into_bytes()
}

/// Multipart message with a text body and one base64 attachment per
/// `(filename, encoded body)` pair
pub fn message_with_attachments(parts: &[(&str, &str)]) -> Vec<u8> {
    let mut raw = String::from(
        "From: Alice <alice@example.com>\r\n\
         To: bob@example.com\r\n\
         Message-ID: <attachments@example.com>\r\n\
         Subject: files\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
         \r\n\
         --XYZ\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         see attached\r\n",
    );
    for (filename, body) in parts {
        raw.push_str(&format!(
            "--XYZ\r\n\
             Content-Type: application/octet-stream\r\n\
             Content-Disposition: attachment; filename=\"{filename}\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {body}\r\n"
        ));
    }
    raw.push_str("--XYZ--\r\n");
    raw.into_bytes()
}

/// In-memory store that rejects chosen messages or attachments
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing_uids: Mutex<BTreeSet<u32>>,
    failing_filenames: Mutex<BTreeSet<String>>,
}

impl FailingStore {
    pub fn failing_message(uid: u32) -> Self {
        let store = Self::default();
        store.failing_uids.lock().expect("lock").insert(uid);
        store
    }

    pub fn failing_attachment(filename: &str) -> Self {
        let store = Self::default();
        store
            .failing_filenames
            .lock()
            .expect("lock")
            .insert(filename.to_owned());
        store
    }

    pub fn clear_failures(&self) {
        self.failing_uids.lock().expect("lock").clear();
        self.failing_filenames.lock().expect("lock").clear();
    }
}

impl Datastore for FailingStore {
    fn mailbox(&self, mailbox_id: &str) -> AppResult<Mailbox> {
        self.inner.mailbox(mailbox_id)
    }

    fn mailboxes(&self) -> AppResult<Vec<Mailbox>> {
        self.inner.mailboxes()
    }

    fn create_mailbox(&self, account_id: &str, name: &str) -> AppResult<Mailbox> {
        self.inner.create_mailbox(account_id, name)
    }

    fn set_last_seen_uid(&self, mailbox_id: &str, uid: u32) -> AppResult<Mailbox> {
        self.inner.set_last_seen_uid(mailbox_id, uid)
    }

    fn existing_uids(&self, mailbox_id: &str) -> AppResult<BTreeSet<u32>> {
        self.inner.existing_uids(mailbox_id)
    }

    fn create_message(&self, message: NewMessage) -> AppResult<MessageRecord> {
        if self.failing_uids.lock().expect("lock").contains(&message.uid) {
            return Err(AppError::persistence(format!(
                "simulated failure for uid {}",
                message.uid
            )));
        }
        self.inner.create_message(message)
    }

    fn create_attachment(&self, attachment: NewAttachment) -> AppResult<AttachmentRecord> {
        if self
            .failing_filenames
            .lock()
            .expect("lock")
            .contains(&attachment.filename)
        {
            return Err(AppError::persistence(format!(
                "simulated failure for {}",
                attachment.filename
            )));
        }
        self.inner.create_attachment(attachment)
    }

    fn messages(&self, mailbox_id: &str) -> AppResult<Vec<MessageRecord>> {
        self.inner.messages(mailbox_id)
    }

    fn attachments(&self, message_record_id: &str) -> AppResult<Vec<AttachmentRecord>> {
        self.inner.attachments(message_record_id)
    }
}
