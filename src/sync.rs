//! Sync orchestrator
//!
//! Runs one invocation for one mailbox:
//! `Idle → RangeComputed → Fetched → Deduplicated → Persisting → Done`, with
//! `Failed` reached on a fetch error or a message-creation error. "start" is
//! published on entering `Persisting`, "finish" only on reaching `Done`.
//!
//! Callers must not run two invocations for the same mailbox concurrently;
//! the dedup snapshot is not guarded by a lock.

use serde::Serialize;
use tracing::{debug, error, info};

use crate::attachments::{AttachmentPersister, FailedAttachment};
use crate::config::SyncConfig;
use crate::dedup;
use crate::errors::AppResult;
use crate::events::{EventPublisher, SyncEvent, SyncEventKind};
use crate::fetch::FetchClient;
use crate::models::SyncContext;
use crate::persist::persist_message;
use crate::store::Datastore;
use crate::watermark;

/// Invocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    RangeComputed,
    Fetched,
    Deduplicated,
    Persisting,
    Done,
    Failed,
}

/// Outcome of a successful invocation
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub mailbox_id: String,
    /// Sequence set sent to the server
    pub range: String,
    /// Entries returned by the server
    pub fetched: usize,
    /// Entries at or below the watermark, dropped before dedup
    pub out_of_range: usize,
    /// Entries already stored, dropped by dedup
    pub duplicates: usize,
    pub persisted_uids: Vec<u32>,
    pub attachments_saved: usize,
    pub failed_attachments: Vec<FailedAttachment>,
}

/// Tracks and logs state transitions of one invocation
struct Transitions<'a> {
    mailbox_id: &'a str,
    state: SyncState,
}

impl<'a> Transitions<'a> {
    fn new(mailbox_id: &'a str) -> Self {
        Self {
            mailbox_id,
            state: SyncState::Idle,
        }
    }

    fn enter(&mut self, next: SyncState) {
        debug!(mailbox_id = self.mailbox_id, from = ?self.state, to = ?next, "sync state");
        self.state = next;
    }
}

/// Sequences fetch, dedup and persistence for a mailbox
pub struct MessageSync<F, D, P> {
    fetcher: F,
    store: D,
    publisher: P,
    attachments: AttachmentPersister,
}

impl<F, D, P> MessageSync<F, D, P>
where
    F: FetchClient,
    D: Datastore,
    P: EventPublisher,
{
    pub fn new(fetcher: F, store: D, publisher: P, attachments: AttachmentPersister) -> Self {
        Self {
            fetcher,
            store,
            publisher,
            attachments,
        }
    }

    /// Run one invocation
    ///
    /// # Errors
    ///
    /// - connection class if the fetch fails; nothing was persisted
    /// - `Persistence` if reading existing UIDs or creating a message fails;
    ///   messages created earlier in the run are kept
    ///
    /// Attachment failures never surface here; they are logged and listed in
    /// the report.
    pub async fn run(&self, ctx: &SyncContext) -> AppResult<SyncReport> {
        let mailbox_id = ctx.mailbox.id.as_str();
        let mut transitions = Transitions::new(mailbox_id);

        let range = watermark::next_fetch_range(ctx.mailbox.last_seen_uid);
        transitions.enter(SyncState::RangeComputed);

        let mut fetched = match self.fetcher.fetch_range(ctx, &range).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!(mailbox_id, range = %range.sequence_set(), error = %e, "fetch failed");
                transitions.enter(SyncState::Failed);
                return Err(e);
            }
        };
        transitions.enter(SyncState::Fetched);

        let total = fetched.len();
        let out_of_range = range.exclude_outside(&mut fetched);
        if out_of_range > 0 {
            debug!(
                mailbox_id,
                out_of_range,
                last_seen_uid = range.after(),
                "dropped entries at or below watermark"
            );
        }

        let existing = match self.store.existing_uids(mailbox_id) {
            Ok(existing) => existing,
            Err(e) => {
                error!(mailbox_id, error = %e, "cannot read stored uids");
                transitions.enter(SyncState::Failed);
                return Err(e);
            }
        };
        let in_range = fetched.len();
        let new_messages = dedup::retain_new(fetched, &existing);
        transitions.enter(SyncState::Deduplicated);

        let mut report = SyncReport {
            mailbox_id: mailbox_id.to_owned(),
            range: range.sequence_set(),
            fetched: total,
            out_of_range,
            duplicates: in_range - new_messages.len(),
            persisted_uids: Vec::with_capacity(new_messages.len()),
            attachments_saved: 0,
            failed_attachments: Vec::new(),
        };

        transitions.enter(SyncState::Persisting);
        self.publisher
            .publish(&SyncEvent::new(SyncEventKind::Start, ctx));

        for (&uid, message) in &new_messages {
            let record = match persist_message(&self.store, ctx, message) {
                Ok(record) => record,
                Err(e) => {
                    error!(
                        mailbox_id,
                        uid,
                        message_id = ?message.message_id,
                        error = %e,
                        "unable to create message, stopping run"
                    );
                    transitions.enter(SyncState::Failed);
                    return Err(e);
                }
            };
            report.persisted_uids.push(uid);

            for outcome in self.attachments.save_all(&self.store, ctx, &record, message) {
                match outcome {
                    Ok(_) => report.attachments_saved += 1,
                    Err(failure) => {
                        error!(
                            mailbox_id,
                            uid,
                            filename = %failure.filename,
                            message_id = ?failure.message_id,
                            error = %failure.error,
                            "unable to save attachment"
                        );
                        report.failed_attachments.push(FailedAttachment::from(&failure));
                    }
                }
            }
        }

        transitions.enter(SyncState::Done);
        self.publisher
            .publish(&SyncEvent::new(SyncEventKind::Finish, ctx));
        info!(
            mailbox_id,
            fetched = report.fetched,
            persisted = report.persisted_uids.len(),
            attachments_saved = report.attachments_saved,
            attachments_failed = report.failed_attachments.len(),
            "sync finished"
        );
        Ok(report)
    }
}

/// Resolve a mailbox id to the explicit invocation context
///
/// # Errors
///
/// `NotFound` if the mailbox or its account is unknown.
pub fn resolve_context<D: Datastore>(
    store: &D,
    config: &SyncConfig,
    mailbox_id: &str,
) -> AppResult<SyncContext> {
    let mailbox = store.mailbox(mailbox_id)?;
    let account = config.get_account(&mailbox.account_id)?.clone();
    Ok(SyncContext {
        user_id: account.owner.clone(),
        account,
        mailbox,
    })
}
