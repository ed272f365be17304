//! Merging streamed notifications with persisted history.
//!
//! The merged view is newest-first and holds exactly one entry per
//! [`RecordKey`]. A streamed record wins over a persisted record with the same
//! id. A streamed record that never got an id is replaced by the persisted
//! record carrying the same content, since that is the same notification now
//! durably stored.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::record::{ContentSignature, NotificationRecord, RecordKey};

/// Where a merged record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Persisted,
    Streamed,
}

/// A record of the merged view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRecord {
    #[serde(flatten)]
    pub record: NotificationRecord,
    pub origin: RecordOrigin,
}

/// Merge persisted pages and streamed records into one ordered, deduplicated list.
pub fn merge<'a, P, S>(persisted: P, streamed: S) -> Vec<MergedRecord>
where
    P: IntoIterator<Item = &'a NotificationRecord>,
    S: IntoIterator<Item = &'a NotificationRecord>,
{
    let mut by_key: HashMap<RecordKey, MergedRecord> = HashMap::new();
    let mut unpersisted: HashMap<ContentSignature, RecordKey> = HashMap::new();
    let mut identified: Vec<ContentSignature> = Vec::new();

    for record in streamed {
        let key = record.key();
        if by_key.contains_key(&key) {
            continue;
        }
        match record.id {
            None => {
                unpersisted.insert(record.content_signature(), key.clone());
            }
            Some(_) => identified.push(record.content_signature()),
        }
        by_key.insert(
            key,
            MergedRecord {
                record: record.clone(),
                origin: RecordOrigin::Streamed,
            },
        );
    }

    // A replayed copy that carries the id replaces its null-id twin.
    for signature in identified {
        if let Some(stale) = unpersisted.remove(&signature) {
            by_key.remove(&stale);
        }
    }

    for record in persisted {
        if let Some(stale) = unpersisted.remove(&record.content_signature()) {
            by_key.remove(&stale);
        }
        let key = record.key();
        if by_key.contains_key(&key) {
            continue;
        }
        by_key.insert(
            key,
            MergedRecord {
                record: record.clone(),
                origin: RecordOrigin::Persisted,
            },
        );
    }

    let mut merged: Vec<MergedRecord> = by_key.into_values().collect();
    merged.sort_by(|a, b| newest_first(&a.record, &b.record));
    merged
}

fn newest_first(a: &NotificationRecord, b: &NotificationRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
        .then_with(|| a.kind.cmp(&b.kind))
}
