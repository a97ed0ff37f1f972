//! Fetch range computation from the mailbox watermark
//!
//! RFC 4549 §4.3.1 suggests `UID FETCH <last_seen_uid+1>:*` for new messages.
//! IMAP resolves `*` to the highest UID in the mailbox and treats `n:m` as
//! `m:n`, so when nothing is newer than the watermark the server still
//! returns the newest message. The range therefore keeps the watermark as an
//! exclusive bound and callers must filter with [`UidRange::exclude_outside`].

use serde::Serialize;

use crate::models::FetchResult;

/// Open-ended UID range: every UID strictly greater than `after`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UidRange {
    after: u32,
}

impl UidRange {
    /// Exclusive lower bound (the watermark the range was computed from)
    pub fn after(&self) -> u32 {
        self.after
    }

    /// Whether `uid` lies in the logical range
    pub fn contains(&self, uid: u32) -> bool {
        uid > self.after
    }

    /// IMAP sequence set for `UID FETCH`
    pub fn sequence_set(&self) -> String {
        format!("{}:*", self.after.saturating_add(1))
    }

    /// Drop every entry the server returned outside the logical range
    ///
    /// Returns the number of entries removed.
    pub fn exclude_outside(&self, fetched: &mut FetchResult) -> usize {
        let before = fetched.len();
        fetched.retain(|uid, _| self.contains(*uid));
        before - fetched.len()
    }
}

/// Range covering every UID newer than `last_seen_uid`
pub fn next_fetch_range(last_seen_uid: u32) -> UidRange {
    UidRange {
        after: last_seen_uid,
    }
}
