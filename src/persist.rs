//! Message persister: fetched representation to stored record

use crate::errors::{AppError, AppResult};
use crate::models::{FetchedMessage, MessageRecord, NewMessage, SyncContext};
use crate::store::Datastore;

/// Create the message record for one fetched message
///
/// Fields are copied verbatim. Failures are not isolated: the caller stops
/// its message loop on error.
///
/// # Errors
///
/// Any store failure is reported as `Persistence`.
pub fn persist_message<D: Datastore>(
    store: &D,
    ctx: &SyncContext,
    fetched: &FetchedMessage,
) -> AppResult<MessageRecord> {
    store
        .create_message(new_message_from(ctx, fetched))
        .map_err(|e| match e {
            AppError::Persistence(_) => e,
            other => AppError::persistence(other.to_string()),
        })
}

fn new_message_from(ctx: &SyncContext, fetched: &FetchedMessage) -> NewMessage {
    NewMessage {
        mailbox_id: ctx.mailbox.id.clone(),
        uid: fetched.uid,
        message_id: fetched.message_id.clone(),
        subject: fetched.subject.clone(),
        timestamp: fetched.timestamp,
        read: fetched.read,
        flags: fetched.flags.clone(),
        text_part: fetched.text_part.clone(),
        html_part: fetched.html_part.clone(),
        sanitized_html: fetched.sanitized_html.clone(),
        raw: fetched.raw.clone(),
        participants: fetched.participants.clone(),
    }
}
