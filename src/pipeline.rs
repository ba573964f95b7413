// src/pipeline.rs

use rayon::prelude::*;
use reqwest::Client;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::dataset::Dataset;
use crate::dedup;
use crate::error::{Error, Result};
use crate::extract;
use crate::fetch::{download_archive, Period, PeriodIndex};
use crate::mapping::{CodeTables, FieldMap};
use crate::parse::{self, RawRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    /// Every document in the archive parsed cleanly.
    Success,
    /// Records were produced but some entries or documents were dropped.
    Partial,
    /// The period produced nothing.
    Failed,
}

/// Per-period outcome, failure reasons included.
#[derive(Debug, Clone, Serialize)]
pub struct PeriodReport {
    pub period: String,
    pub status: PeriodStatus,
    pub records: usize,
    pub documents: usize,
    pub skipped_entries: usize,
    pub failed_documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PeriodReport {
    fn failed(period: &str, reason: impl Into<String>) -> Self {
        PeriodReport {
            period: period.to_string(),
            status: PeriodStatus::Failed,
            records: 0,
            documents: 0,
            skipped_entries: 0,
            failed_documents: 0,
            error: Some(reason.into()),
        }
    }
}

/// What one run did, period by period plus the dataset totals.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub periods: Vec<PeriodReport>,
    pub records_before_dedup: usize,
    pub records_after_dedup: usize,
    pub outputs: Vec<PathBuf>,
    pub elapsed_secs: f64,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.periods
            .iter()
            .filter(|p| p.status == PeriodStatus::Failed)
            .count()
    }

    pub fn succeeded(&self) -> usize {
        self.periods.len() - self.failed()
    }
}

struct PeriodHarvest {
    records: Vec<RawRecord>,
    documents: usize,
    skipped_entries: usize,
    failed_documents: usize,
}

/// Run the whole pipeline: scrape the index, process each selected period
/// under bounded concurrency, then sort, filter, dedup, optionally project,
/// and write the consolidated dataset.
///
/// One period failing never aborts the others; the run only errors when the
/// source is unusable, every period fails, or the final write cannot happen.
#[instrument(level = "info", skip(cfg))]
pub async fn run(cfg: &Config) -> Result<RunSummary> {
    let started = Instant::now();
    cfg.validate()?;
    let deadline = cfg
        .timeout_secs
        .map(|secs| started + Duration::from_secs(secs));

    let client = Client::new();
    let index = PeriodIndex::fetch(&client, &cfg.index_url).await?;
    info!(periods = index.len(), url = %cfg.index_url, "index scraped");

    let selected = if cfg.periods.is_empty() {
        index.recent_months(cfg.recent_months.unwrap_or(1))
    } else {
        index.select(&cfg.periods)?
    };
    if selected.is_empty() {
        return Err(Error::NoPeriodsFound {
            url: cfg.index_url.clone(),
        });
    }
    info!(selected = selected.len(), "periods selected");

    // one bounded pool for all entry parsing, shared across period tasks
    let pool = Arc::new(
        rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.max_entry_concurrency)
            .thread_name(|i| format!("entry-{i}"))
            .build()?,
    );

    let shared = Arc::new(cfg.clone());
    let sem = Arc::new(Semaphore::new(cfg.max_period_concurrency));
    let mut handles = Vec::with_capacity(selected.len());
    for period in selected.clone() {
        let client = client.clone();
        let cfg = Arc::clone(&shared);
        let pool = Arc::clone(&pool);
        let sem = Arc::clone(&sem);
        let key = period.key.clone();
        handles.push((
            key,
            tokio::spawn(async move {
                let _permit = sem.acquire().await.unwrap();
                process_period(&client, &cfg, pool, &period).await
            }),
        ));
    }

    // aggregate in period order; the deadline cuts off whatever is unfinished
    let mut reports = Vec::with_capacity(handles.len());
    let mut all_records: Vec<RawRecord> = Vec::new();
    for (key, handle) in handles {
        let joined = match deadline {
            Some(d) => {
                let abort = handle.abort_handle();
                match timeout_at(d, handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        error!(period = %key, "run timeout elapsed before period finished");
                        reports.push(PeriodReport::failed(&key, "run timeout elapsed"));
                        continue;
                    }
                }
            }
            None => handle.await,
        };
        match joined {
            Ok(Ok(harvest)) => {
                let status = if harvest.failed_documents == 0 && harvest.skipped_entries == 0 {
                    PeriodStatus::Success
                } else {
                    PeriodStatus::Partial
                };
                reports.push(PeriodReport {
                    period: key,
                    status,
                    records: harvest.records.len(),
                    documents: harvest.documents,
                    skipped_entries: harvest.skipped_entries,
                    failed_documents: harvest.failed_documents,
                    error: None,
                });
                all_records.extend(harvest.records);
            }
            Ok(Err(err)) => {
                error!(period = %key, error = %err, "period failed");
                reports.push(PeriodReport::failed(&key, err.to_string()));
            }
            Err(err) => {
                error!(period = %key, error = %err, "period task aborted");
                reports.push(PeriodReport::failed(&key, format!("task aborted: {err}")));
            }
        }
    }

    if reports.iter().all(|r| r.status == PeriodStatus::Failed) {
        return Err(Error::AllPeriodsFailed {
            attempted: reports.len(),
        });
    }

    dedup::sort_records(&mut all_records);
    if let Some(status) = &cfg.status_filter {
        let before = all_records.len();
        all_records.retain(|r| r.folder_status() == Some(status.as_str()));
        info!(%status, before, after = all_records.len(), "status filter applied");
    }
    let records_before_dedup = all_records.len();
    let records = dedup::dedup_records(all_records, cfg.dedup_key);
    let records_after_dedup = records.len();

    let mut period_keys: Vec<String> = selected.iter().map(|p| p.key.clone()).collect();
    period_keys.sort();

    let dataset = if cfg.apply_mapping {
        let map = match &cfg.mapping_file {
            Some(path) => FieldMap::from_yaml_file(path)?,
            None => FieldMap::builtin(),
        };
        let mut canonical = map.apply_all(&records);
        if cfg.map_codes {
            let tables = match &cfg.code_tables_file {
                Some(path) => CodeTables::from_yaml_file(path)?,
                None => CodeTables::builtin(),
            };
            tables.apply(&mut canonical);
        }
        Dataset::canonical(canonical, period_keys, cfg.dedup_key)
    } else {
        Dataset::raw(records, period_keys, cfg.dedup_key)
    };

    let outputs = dataset.write(
        cfg.output.parquet.as_deref(),
        cfg.output.json.as_deref(),
        cfg.allow_empty,
    )?;

    if cfg.delete_raw_after_processing {
        cleanup_workspace(cfg, &selected);
    }

    let summary = RunSummary {
        periods: reports,
        records_before_dedup,
        records_after_dedup,
        outputs,
        elapsed_secs: started.elapsed().as_secs_f64(),
    };
    info!(
        periods = summary.periods.len(),
        failed = summary.failed(),
        records = summary.records_after_dedup,
        elapsed = ?started.elapsed(),
        "run complete"
    );
    Ok(summary)
}

/// One period unit: download the archive, unpack it, parse every document.
/// Parsing runs on the shared entry pool off the async runtime.
#[instrument(level = "info", skip_all, fields(period = %period.key))]
async fn process_period(
    client: &Client,
    cfg: &Config,
    pool: Arc<rayon::ThreadPool>,
    period: &Period,
) -> Result<PeriodHarvest> {
    let started = Instant::now();
    let archive = download_archive(client, period, cfg.archives_dir()).await?;

    let raw_dir = cfg.raw_dir(&period.key);
    let outcome =
        tokio::task::spawn_blocking(move || extract::extract_archive(&archive, raw_dir)).await??;
    let documents = outcome.extracted.len();
    let skipped_entries = outcome.skipped.len();

    let key = period.key.clone();
    let paths = outcome.extracted;
    let (records, failed_documents) =
        tokio::task::spawn_blocking(move || parse_documents(&pool, &key, &paths)).await?;

    info!(
        documents,
        records = records.len(),
        skipped_entries,
        failed_documents,
        elapsed = ?started.elapsed(),
        "period processed"
    );
    Ok(PeriodHarvest {
        records,
        documents,
        skipped_entries,
        failed_documents,
    })
}

/// Parse extracted documents in parallel on the bounded pool. A document
/// that fails to parse is dropped whole and counted; the rest proceed.
fn parse_documents(
    pool: &rayon::ThreadPool,
    period: &str,
    paths: &[PathBuf],
) -> (Vec<RawRecord>, usize) {
    let results: Vec<Result<Vec<RawRecord>>> = pool.install(|| {
        paths
            .par_iter()
            .map(|path| parse::parse_document(period, path))
            .collect()
    });

    let mut records = Vec::new();
    let mut failed = 0;
    for (path, result) in paths.iter().zip(results) {
        match result {
            Ok(mut parsed) => records.append(&mut parsed),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "document rejected");
                failed += 1;
            }
        }
    }
    (records, failed)
}

/// Remove per-period working files once the dataset is safely on disk.
/// Failures here only warn.
fn cleanup_workspace(cfg: &Config, periods: &[Period]) {
    for period in periods {
        let raw_dir = cfg.raw_dir(&period.key);
        if raw_dir.exists() {
            if let Err(err) = fs::remove_dir_all(&raw_dir) {
                warn!(period = %period.key, error = %err, "failed to remove raw dir");
            }
        }
        let archive = cfg.archives_dir().join(format!("{}.zip", period.key));
        if archive.exists() {
            if let Err(err) = fs::remove_file(&archive) {
                warn!(period = %period.key, error = %err, "failed to remove archive");
            }
        }
    }
    info!(periods = periods.len(), "workspace cleaned");
}
