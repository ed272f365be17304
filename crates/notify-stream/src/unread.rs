//! Unread counter derivation.
//!
//! The total is never stored: it is recomputed from the persisted snapshot,
//! the streamed-but-unpersisted records and the externally owned count.

use serde::Serialize;
use std::collections::HashSet;

use crate::record::{ContentSignature, NotificationKind, NotificationRecord};

/// Lookup of what the persisted history already contains.
#[derive(Debug, Clone, Default)]
pub struct PersistedKeys {
    ids: HashSet<i64>,
    signatures: HashSet<ContentSignature>,
}

impl PersistedKeys {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a NotificationRecord>) -> Self {
        let mut keys = Self::default();
        for record in records {
            if let Some(id) = record.id {
                keys.ids.insert(id);
            }
            keys.signatures.insert(record.content_signature());
        }
        keys
    }

    /// Whether a streamed record has landed in the persisted history, by id
    /// or, for records streamed without an id, by content.
    pub fn contains(&self, record: &NotificationRecord) -> bool {
        record.id.is_some_and(|id| self.ids.contains(&id))
            || self.signatures.contains(&record.content_signature())
    }
}

/// Unread streamed records that are not yet part of the persisted history.
///
/// Out-of-band kinds are counted by a sibling subsystem and skipped here.
/// A null-id record whose content was also streamed with an id counts once.
pub fn streamed_unpersisted_unread<'a>(
    streamed: impl IntoIterator<Item = &'a NotificationRecord>,
    persisted: &PersistedKeys,
    out_of_band: &[NotificationKind],
) -> u64 {
    let streamed: Vec<&NotificationRecord> = streamed.into_iter().collect();
    let identified: HashSet<ContentSignature> = streamed
        .iter()
        .filter(|r| r.id.is_some())
        .map(|r| r.content_signature())
        .collect();

    streamed
        .into_iter()
        .filter(|r| !r.is_read)
        .filter(|r| r.id.is_some() || !identified.contains(&r.content_signature()))
        .filter(|r| !out_of_band.contains(&r.kind))
        .filter(|r| !persisted.contains(r))
        .count() as u64
}

/// The three inputs of the unread total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnreadCounts {
    /// Server snapshot from the first persisted page, `None` until it resolved
    pub persisted: Option<u64>,
    /// Streamed records not yet persisted
    pub streamed: u64,
    /// Count owned by a sibling subsystem
    pub external: u64,
}

impl UnreadCounts {
    /// Reported total, forced to zero until the first persisted fetch resolved.
    pub fn total(&self) -> u64 {
        match self.persisted {
            None => 0,
            Some(persisted) => persisted
                .saturating_add(self.streamed)
                .saturating_add(self.external),
        }
    }
}
