// src/dedup.rs

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::info;

use crate::parse::RawRecord;

/// Which record attribute identifies duplicates across periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupKey {
    Id,
    #[default]
    Link,
    Title,
    /// Keep every record, exact duplicates included.
    None,
}

impl DedupKey {
    pub fn as_str(self) -> &'static str {
        match self {
            DedupKey::Id => "id",
            DedupKey::Link => "link",
            DedupKey::Title => "title",
            DedupKey::None => "none",
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized key value, or `None` when the attribute is empty. Titles are
/// matched case-insensitively; ids and links only have whitespace trimmed.
fn key_value(record: &RawRecord, key: DedupKey) -> Option<String> {
    let value = match key {
        DedupKey::Id => record.id.trim().to_string(),
        DedupKey::Link => record.link.trim().to_string(),
        DedupKey::Title => record.title.trim().to_lowercase(),
        DedupKey::None => return None,
    };
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Put records into the canonical pipeline order: period key, then source
/// document, then position within the document. Applied before [`dedup_records`]
/// so the outcome does not depend on which worker finished first.
pub fn sort_records(records: &mut [RawRecord]) {
    records.sort_by(|a, b| {
        (a.period.as_str(), &a.source, a.seq).cmp(&(b.period.as_str(), &b.source, b.seq))
    });
}

/// Deduplicate under `key`, keeping the last record per key value in the
/// order given. With records in canonical order the survivor is always the
/// one from the latest period. Records whose key is empty never merge with
/// each other. `none` returns the input untouched.
pub fn dedup_records(records: Vec<RawRecord>, key: DedupKey) -> Vec<RawRecord> {
    if key == DedupKey::None {
        return records;
    }
    let before = records.len();
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<RawRecord> = Vec::with_capacity(records.len());

    // walk backwards so the last occurrence of each key is the one kept
    for record in records.into_iter().rev() {
        match key_value(&record, key) {
            Some(value) => {
                if seen.insert(value) {
                    kept.push(record);
                }
            }
            None => kept.push(record),
        }
    }
    kept.reverse();

    info!(
        key = %key,
        before,
        after = kept.len(),
        dropped = before - kept.len(),
        "deduplicated records"
    );
    kept
}
