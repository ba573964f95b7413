// src/fetch/periods.rs

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};

/// Substring the portal puts in every procurement feed link; filters out the
/// page's unrelated downloads.
const FEED_MARKER: &str = "contratacion";

const MAX_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// Archive filenames end in `_<YYYY>.zip` (full year) or `_<YYYYMM>.zip`
/// (one month).
static PERIOD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_(\d{4}|\d{6})\.zip$").expect("period regex is valid"));

static ZIP_LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"a[href$=".zip"]"#).expect("CSS selector for ZIP links should be valid")
});

/// One publication period with its archive download descriptor. Immutable
/// once resolved from the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Period {
    /// Canonical key: `"2024"` or `"202403"`.
    pub key: String,
    /// Absolute archive URL.
    pub url: String,
    /// Filename the archive is stored under locally.
    pub filename: String,
}

impl Period {
    /// Year-month periods carry six digits, full years four.
    pub fn is_month(&self) -> bool {
        self.key.len() == 6
    }
}

/// Mapping of period key to download descriptor, scraped from the portal
/// index page.
#[derive(Debug, Clone)]
pub struct PeriodIndex {
    source_url: String,
    periods: BTreeMap<String, Period>,
}

impl PeriodIndex {
    /// Fetch the index page and parse the period links out of it. Transient
    /// failures are retried with exponential backoff; exhaustion yields
    /// `SourceUnavailable`.
    pub async fn fetch(client: &Client, index_url: &str) -> Result<Self> {
        let html = get_text_with_retry(client, index_url, MAX_ATTEMPTS, INITIAL_BACKOFF_MS)
            .await
            .map_err(|source| Error::SourceUnavailable {
                url: index_url.to_string(),
                source,
            })?;
        Self::parse(index_url, &html)
    }

    /// Extract period-coded archive links from the index HTML. Only anchors
    /// ending in `.zip`, carrying the feed marker and a period-coded filename
    /// are considered; everything else on the page is ignored.
    pub fn parse(index_url: &str, html: &str) -> Result<Self> {
        let base = Url::parse(index_url)?;
        let mut periods = BTreeMap::new();

        for anchor in Html::parse_document(html).select(&ZIP_LINK_SELECTOR) {
            let href = match anchor.value().attr("href") {
                Some(h) => h,
                None => continue,
            };
            let absolute = match base.join(href) {
                Ok(u) => u,
                Err(_) => continue,
            };
            if !absolute.as_str().contains(FEED_MARKER) {
                continue;
            }
            let key = match PERIOD_RE
                .captures(absolute.path())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
            {
                Some(k) => k,
                None => continue,
            };
            let filename = absolute
                .path_segments()
                .and_then(|segments| segments.last())
                .filter(|name| !name.is_empty())
                .unwrap_or("download.zip")
                .to_string();
            debug!(period = %key, url = %absolute, "found archive link");
            // the portal occasionally repeats a link; last one wins
            periods.insert(
                key.clone(),
                Period {
                    key,
                    url: absolute.to_string(),
                    filename,
                },
            );
        }

        if periods.is_empty() {
            return Err(Error::NoPeriodsFound {
                url: index_url.to_string(),
            });
        }

        Ok(Self {
            source_url: index_url.to_string(),
            periods,
        })
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn len(&self) -> usize {
        self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Period> {
        self.periods.get(key)
    }

    /// All period keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.periods.keys().map(String::as_str)
    }

    /// Full-year periods, ascending.
    pub fn years(&self) -> Vec<&Period> {
        self.periods.values().filter(|p| !p.is_month()).collect()
    }

    /// Year-month periods, ascending.
    pub fn months(&self) -> Vec<&Period> {
        self.periods.values().filter(|p| p.is_month()).collect()
    }

    /// The `n` most recent year-month periods, returned in chronological
    /// order. The index publishes months only for the current year, so the
    /// key's numeric order is the publication order.
    pub fn recent_months(&self, n: usize) -> Vec<Period> {
        let months = self.months();
        let skip = months.len().saturating_sub(n);
        months.into_iter().skip(skip).cloned().collect()
    }

    /// Resolve an explicit selection of period keys. Unknown keys are an
    /// error, never a silent skip.
    pub fn select(&self, keys: &[String]) -> Result<Vec<Period>> {
        let mut selected = Vec::with_capacity(keys.len());
        for key in keys {
            match self.periods.get(key) {
                Some(p) => selected.push(p.clone()),
                None => {
                    return Err(Error::PeriodNotFound {
                        period: key.clone(),
                    })
                }
            }
        }
        selected.sort_by(|a, b| a.key.cmp(&b.key));
        selected.dedup_by(|a, b| a.key == b.key);
        Ok(selected)
    }
}

/// GET a page body, retrying transient failures (network errors, 5xx) with
/// exponential backoff. 4xx statuses fail immediately.
async fn get_text_with_retry(
    client: &Client,
    url: &str,
    max_attempts: u32,
    initial_backoff_ms: u64,
) -> std::result::Result<String, reqwest::Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let (error, transient) = match client.get(url).send().await {
            Ok(resp) => match resp.error_for_status() {
                Ok(resp) => match resp.text().await {
                    Ok(text) => return Ok(text),
                    Err(e) => (e, true),
                },
                Err(e) => {
                    let transient = e.status().map(|s| s.is_server_error()).unwrap_or(true);
                    (e, transient)
                }
            },
            Err(e) => (e, true),
        };

        if transient && attempt < max_attempts {
            let backoff = initial_backoff_ms * 2u64.pow(attempt - 1);
            warn!(%url, attempt, delay_ms = backoff, error = %error, "retrying index fetch");
            sleep(Duration::from_millis(backoff)).await;
        } else {
            return Err(error);
        }
    }
}
