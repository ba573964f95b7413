// src/extract.rs

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::fetch::archives::Archive;

/// Why an inner archive entry was not extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Entry name escapes the extraction directory.
    UnsafeArchiveEntry,
    /// Entry could not be read or written (corrupt data, CRC mismatch, I/O).
    Unreadable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnsafeArchiveEntry => write!(f, "unsafe archive entry"),
            SkipReason::Unreadable(reason) => write!(f, "unreadable: {reason}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: SkipReason,
}

/// Result of unpacking one archive: which documents landed on disk and which
/// entries were passed over, with reasons.
#[derive(Debug, Clone)]
pub struct ExtractOutcome {
    pub period: String,
    pub extracted: Vec<PathBuf>,
    pub skipped: Vec<SkippedEntry>,
}

fn is_feed_document(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".atom") || lower.ends_with(".xml")
}

/// Unpack a validated archive into `dest_dir`, one file per feed document.
///
/// Entries that are not feed documents (directories, checksums, readme
/// noise) are ignored outright. Entries with traversal names or unreadable
/// contents are skipped and reported; one bad entry never aborts the rest.
/// An archive that cannot be opened at all is `ArchiveCorrupt`.
#[instrument(level = "info", skip(archive, dest_dir), fields(period = %archive.period))]
pub fn extract_archive(archive: &Archive, dest_dir: impl AsRef<Path>) -> Result<ExtractOutcome> {
    let dest_dir = dest_dir.as_ref();
    fs::create_dir_all(dest_dir)?;

    let file = File::open(&archive.path)?;
    let mut zip = ZipArchive::new(file).map_err(|e| Error::ArchiveCorrupt {
        period: archive.period.clone(),
        reason: e.to_string(),
    })?;

    let mut extracted = Vec::new();
    let mut skipped = Vec::new();

    for i in 0..zip.len() {
        let mut entry = match zip.by_index(i) {
            Ok(e) => e,
            Err(e) => {
                skipped.push(SkippedEntry {
                    name: format!("entry #{i}"),
                    reason: SkipReason::Unreadable(e.to_string()),
                });
                continue;
            }
        };
        if !entry.is_file() {
            continue;
        }
        let name = entry.name().to_string();
        if !is_feed_document(&name) {
            continue;
        }

        let relative = match entry.enclosed_name() {
            Some(p) => p,
            None => {
                warn!(entry = %name, "skipping entry with unsafe path");
                skipped.push(SkippedEntry {
                    name,
                    reason: SkipReason::UnsafeArchiveEntry,
                });
                continue;
            }
        };
        let out_path = dest_dir.join(relative);

        if let Err(e) = write_entry(&mut entry, &out_path) {
            warn!(entry = %name, error = %e, "skipping unreadable entry");
            let _ = fs::remove_file(&out_path);
            skipped.push(SkippedEntry {
                name,
                reason: SkipReason::Unreadable(e.to_string()),
            });
            continue;
        }
        extracted.push(out_path);
    }

    extracted.sort();
    info!(
        extracted = extracted.len(),
        skipped = skipped.len(),
        "archive extracted"
    );

    Ok(ExtractOutcome {
        period: archive.period.clone(),
        extracted,
        skipped,
    })
}

fn write_entry(entry: &mut impl io::Read, out_path: &Path) -> io::Result<()> {
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(out_path)?;
    io::copy(entry, &mut out)?;
    Ok(())
}
