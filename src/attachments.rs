//! Attachment persister with per-attachment failure isolation
//!
//! Each attachment of a stored message is decoded, written below
//! `<root>/<user>/<message record id>/` and recorded in the datastore. Every
//! attachment yields its own [`AttachmentOutcome`]; one failure never stops
//! its siblings.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use mailparse::MailParseError;
use serde::Serialize;
use thiserror::Error;

use crate::errors::AppError;
use crate::models::{
    AttachmentDescriptor, AttachmentRecord, FetchedMessage, MessageRecord, NewAttachment,
    SyncContext,
};
use crate::store::Datastore;

/// Why a single attachment could not be saved
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("cannot decode attachment body: {0}")]
    Decode(#[from] MailParseError),
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot create attachment record: {0}")]
    Record(AppError),
}

/// A failed attachment with enough context to diagnose it
#[derive(Debug)]
pub struct AttachmentFailure {
    pub filename: String,
    pub uid: u32,
    pub message_id: Option<String>,
    pub error: AttachmentError,
}

/// Serializable view of an [`AttachmentFailure`] for run reports
#[derive(Debug, Clone, Serialize)]
pub struct FailedAttachment {
    pub filename: String,
    pub uid: u32,
    pub message_id: Option<String>,
    pub reason: String,
}

impl From<&AttachmentFailure> for FailedAttachment {
    fn from(failure: &AttachmentFailure) -> Self {
        Self {
            filename: failure.filename.clone(),
            uid: failure.uid,
            message_id: failure.message_id.clone(),
            reason: failure.error.to_string(),
        }
    }
}

/// Result of saving one attachment
pub type AttachmentOutcome = Result<AttachmentRecord, AttachmentFailure>;

/// Writes attachments under a root directory and records them
#[derive(Debug, Clone)]
pub struct AttachmentPersister {
    root: PathBuf,
}

impl AttachmentPersister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the attachments of one stored message
    pub fn message_dir(&self, ctx: &SyncContext, record: &MessageRecord) -> PathBuf {
        self.root.join(&ctx.user_id).join(&record.id)
    }

    /// Save every attachment of `fetched`, returning one outcome per attachment
    pub fn save_all<D: Datastore>(
        &self,
        store: &D,
        ctx: &SyncContext,
        record: &MessageRecord,
        fetched: &FetchedMessage,
    ) -> Vec<AttachmentOutcome> {
        let dir = self.message_dir(ctx, record);
        let filenames = unique_filenames(&fetched.attachments);

        fetched
            .attachments
            .iter()
            .zip(filenames)
            .map(|(descriptor, filename)| {
                save_one(store, &dir, &filename, descriptor, record).map_err(|error| {
                    AttachmentFailure {
                        filename,
                        uid: fetched.uid,
                        message_id: fetched.message_id.clone(),
                        error,
                    }
                })
            })
            .collect()
    }
}

fn save_one<D: Datastore>(
    store: &D,
    dir: &Path,
    filename: &str,
    descriptor: &AttachmentDescriptor,
    record: &MessageRecord,
) -> Result<AttachmentRecord, AttachmentError> {
    let body = descriptor.decode()?;
    let path = dir.join(filename);
    fs::create_dir_all(dir)
        .and_then(|()| write_file(&path, &body))
        .map_err(|source| AttachmentError::Write {
            path: path.clone(),
            source,
        })?;

    store
        .create_attachment(NewAttachment {
            message_record_id: record.id.clone(),
            filename: filename.to_owned(),
            location: path,
        })
        .map_err(AttachmentError::Record)
}

fn write_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)
}

/// Reduce a sender-supplied filename to a safe single path component
fn sanitize_filename(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last
        .chars()
        .map(|ch| if ch.is_control() { '_' } else { ch })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned.chars().all(|ch| ch == '.') {
        "attachment".to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// Sanitized filenames, suffixed `-1`, `-2`, ... where they would collide
fn unique_filenames(descriptors: &[AttachmentDescriptor]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    descriptors
        .iter()
        .map(|d| {
            let base = sanitize_filename(&d.filename);
            let mut candidate = base.clone();
            let mut n = 0;
            while seen.contains(&candidate) {
                n += 1;
                candidate = with_suffix(&base, n);
            }
            seen.insert(candidate.clone());
            candidate
        })
        .collect()
}

fn with_suffix(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{}-{n}{}", &name[..idx], &name[idx..]),
        _ => format!("{name}-{n}"),
    }
}
