//! Deduplication of fetched messages against persisted UIDs

use std::collections::BTreeSet;

use crate::models::FetchResult;

/// Keep only fetched entries whose UID is not already persisted
///
/// Set difference of fetched UIDs and `existing`. `existing` must be a
/// snapshot taken right before the call.
pub fn retain_new(fetched: FetchResult, existing: &BTreeSet<u32>) -> FetchResult {
    fetched
        .into_iter()
        .filter(|(uid, _)| !existing.contains(uid))
        .collect()
}
