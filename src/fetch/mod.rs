// src/fetch/mod.rs

pub mod archives;
pub mod periods;

pub use archives::{download_archive, Archive, ArchiveStatus};
pub use periods::{Period, PeriodIndex};
