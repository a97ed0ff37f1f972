//! mail-imap-sync-rs: incremental IMAP mailbox synchronization
//!
//! Each `sync` invocation fetches messages newer than a mailbox's watermark,
//! drops the ones already stored, persists the rest with their attachments
//! and publishes start/finish lifecycle events. The process is meant to be
//! spawned by an external job runner that interprets the exit status.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point, CLI parsing and output envelope
//! - [`config`]: Environment-driven configuration for accounts and storage
//! - [`errors`]: Application error model with exit status mapping
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`models`]: Domain records and transient pipeline types
//! - [`mime`]: Message parsing, participant extraction, sanitization
//! - [`watermark`]: Fetch range computation above the watermark
//! - [`dedup`]: Removal of already-stored UIDs from a fetch result
//! - [`fetch`]: Fetch client seam and its IMAP implementation
//! - [`store`]: Datastore trait with in-memory and SQLite backends
//! - [`persist`]: Message record creation
//! - [`attachments`]: Attachment persistence with per-attachment isolation
//! - [`events`]: Lifecycle event publishers
//! - [`sync`]: Orchestrator state machine

mod attachments;
mod config;
mod dedup;
mod errors;
mod events;
mod fetch;
mod imap;
mod mime;
mod models;
mod persist;
mod store;
mod sync;
#[cfg(test)]
mod test_support;
mod watermark;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use attachments::AttachmentPersister;
use config::SyncConfig;
use errors::{AppError, AppResult};
use events::{EventPublisher, JsonLinesPublisher, TracingPublisher};
use fetch::ImapFetchClient;
use models::{Mailbox, Meta, RunEnvelope};
use store::{Datastore, SqliteStore};
use sync::{MessageSync, SyncReport};

#[derive(Debug, Parser)]
#[command(name = "mail-imap-sync-rs", version, about = "Incremental IMAP mailbox sync")]
struct Cli {
    /// Where lifecycle events are published
    #[arg(long, value_enum, default_value_t = EventSink::Log, global = true)]
    events: EventSink,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventSink {
    /// Log events through tracing (stderr)
    Log,
    /// Write one JSON object per event to stdout
    Jsonl,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch and store messages newer than the mailbox watermark
    Sync {
        mailbox_id: String,
    },
    /// Register a mailbox of a configured account
    AddMailbox {
        #[arg(long)]
        account: String,
        name: String,
    },
    /// List registered mailboxes
    Mailboxes,
    /// Advance the watermark to the highest stored UID
    CommitWatermark {
        mailbox_id: String,
    },
}

#[derive(Debug, Serialize)]
struct MailboxSummary {
    #[serde(flatten)]
    mailbox: Mailbox,
    stored_messages: usize,
}

/// Application entry point
///
/// Loads `.env`, initializes tracing to stderr and runs one command. Errors
/// are logged and mapped to the exit status of [`AppError::exit_code`].
///
/// # Example
///
/// ```no_run
/// MAIL_SYNC_DEFAULT_HOST=imap.example.com \
/// MAIL_SYNC_DEFAULT_USER=user@example.com \
/// MAIL_SYNC_DEFAULT_PASS=secret \
/// cargo run -- sync 6f1c0b9e-3f43-4a57-9d43-1f0c9a0c2e11
/// ```
#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    let started = Instant::now();
    let config = Arc::new(SyncConfig::load_from_env()?);
    let store = SqliteStore::open(&config.data_dir)?;
    let compact = cli.events == EventSink::Jsonl;

    match cli.command {
        Command::Sync { mailbox_id } => {
            let report = match cli.events {
                EventSink::Log => sync_mailbox(&config, store, TracingPublisher, &mailbox_id).await?,
                EventSink::Jsonl => {
                    let publisher = JsonLinesPublisher::new(std::io::stdout());
                    sync_mailbox(&config, store, publisher, &mailbox_id).await?
                }
            };
            let summary = format!(
                "{} new message(s), {} attachment(s) saved, {} attachment failure(s)",
                report.persisted_uids.len(),
                report.attachments_saved,
                report.failed_attachments.len()
            );
            print_envelope(summary, report, started, compact)
        }
        Command::AddMailbox { account, name } => {
            config.get_account(&account)?;
            let mailbox = store.create_mailbox(&account, &name)?;
            info!(mailbox_id = %mailbox.id, account_id = %account, "mailbox registered");
            let summary = format!("registered mailbox {} as {}", mailbox.name, mailbox.id);
            print_envelope(summary, mailbox, started, compact)
        }
        Command::Mailboxes => {
            let mailboxes = store
                .mailboxes()?
                .into_iter()
                .map(|mailbox| {
                    let stored_messages = store.existing_uids(&mailbox.id)?.len();
                    Ok(MailboxSummary {
                        mailbox,
                        stored_messages,
                    })
                })
                .collect::<AppResult<Vec<_>>>()?;
            let summary = format!("{} mailbox(es)", mailboxes.len());
            print_envelope(summary, mailboxes, started, compact)
        }
        Command::CommitWatermark { mailbox_id } => {
            let mailbox = commit_watermark(&store, &mailbox_id)?;
            let summary = format!("watermark of {} is {}", mailbox.id, mailbox.last_seen_uid);
            print_envelope(summary, mailbox, started, compact)
        }
    }
}

async fn sync_mailbox<D, P>(
    config: &Arc<SyncConfig>,
    store: D,
    publisher: P,
    mailbox_id: &str,
) -> AppResult<SyncReport>
where
    D: Datastore,
    P: EventPublisher,
{
    let ctx = sync::resolve_context(&store, config, mailbox_id)?;
    let sync = MessageSync::new(
        ImapFetchClient::new(Arc::clone(config)),
        store,
        publisher,
        AttachmentPersister::new(&config.attachments_dir),
    );
    sync.run(&ctx).await
}

/// Move the watermark to the highest stored UID; never lowers it
fn commit_watermark<D: Datastore>(store: &D, mailbox_id: &str) -> AppResult<Mailbox> {
    let mailbox = store.mailbox(mailbox_id)?;
    let highest = store
        .existing_uids(mailbox_id)?
        .last()
        .copied()
        .unwrap_or(0)
        .max(mailbox.last_seen_uid);
    if highest == mailbox.last_seen_uid {
        return Ok(mailbox);
    }
    let mailbox = store.set_last_seen_uid(mailbox_id, highest)?;
    info!(mailbox_id, last_seen_uid = highest, "watermark advanced");
    Ok(mailbox)
}

fn print_envelope<T: Serialize>(
    summary: String,
    data: T,
    started: Instant,
    compact: bool,
) -> AppResult<()> {
    let envelope = RunEnvelope {
        summary,
        data,
        meta: Meta::now(duration_ms(started)),
    };
    println!("{}", render_envelope(&envelope, compact)?);
    Ok(())
}

/// Compact output keeps stdout one JSON object per line next to `jsonl` events
fn render_envelope<T: Serialize>(envelope: &RunEnvelope<T>, compact: bool) -> AppResult<String> {
    let rendered = if compact {
        serde_json::to_string(envelope)
    } else {
        serde_json::to_string_pretty(envelope)
    };
    rendered.map_err(|e| AppError::Internal(format!("cannot serialize output: {e}")))
}

fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Command, EventSink, commit_watermark, render_envelope};
    use crate::models::{Meta, RunEnvelope};
    use crate::store::{Datastore, MemoryStore};
    use crate::test_support::new_message;

    #[test]
    fn parses_sync_with_jsonl_events() {
        let cli = Cli::try_parse_from(["mail-imap-sync-rs", "sync", "mb-1", "--events", "jsonl"])
            .expect("parses");
        assert_eq!(cli.events, EventSink::Jsonl);
        assert!(matches!(cli.command, Command::Sync { ref mailbox_id } if mailbox_id == "mb-1"));
    }

    #[test]
    fn add_mailbox_requires_account() {
        assert!(Cli::try_parse_from(["mail-imap-sync-rs", "add-mailbox", "INBOX"]).is_err());
    }

    #[test]
    fn commit_watermark_moves_to_highest_stored_uid() {
        let store = MemoryStore::new();
        let mailbox = store.create_mailbox("default", "INBOX").expect("create");
        for uid in [3, 9, 5] {
            store
                .create_message(new_message(&mailbox.id, uid))
                .expect("message");
        }

        let committed = commit_watermark(&store, &mailbox.id).expect("commit");
        assert_eq!(committed.last_seen_uid, 9);

        let empty = store.create_mailbox("default", "Archive").expect("create");
        let unchanged = commit_watermark(&store, &empty.id).expect("commit");
        assert_eq!(unchanged.last_seen_uid, 0);
    }

    #[test]
    fn jsonl_envelope_is_a_single_line() {
        let envelope = RunEnvelope {
            summary: "2 new message(s)".to_owned(),
            data: vec![11, 12],
            meta: Meta::now(5),
        };

        let compact = render_envelope(&envelope, true).expect("renders");
        assert!(!compact.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&compact).expect("valid json");
        assert_eq!(value["data"][1], 12);
        assert_eq!(value["meta"]["duration_ms"], 5);

        let pretty = render_envelope(&envelope, false).expect("renders");
        assert!(pretty.lines().count() > 1);
    }
}
