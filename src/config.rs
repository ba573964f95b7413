// src/config.rs

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::dedup::DedupKey;
use crate::error::{Error, Result};

/// Default portal index page listing one archive link per period.
pub const DEFAULT_INDEX_URL: &str =
    "https://www.hacienda.gob.es/es-ES/GobiernoAbierto/Datos%20Abiertos/Paginas/LicitacionesContratante.aspx";

/// Output destinations. At least one of the two must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Destination for the columnar dataset.
    #[serde(default = "default_parquet_path")]
    pub parquet: Option<PathBuf>,
    /// Destination for the JSON dataset (metadata envelope + records).
    #[serde(default)]
    pub json: Option<PathBuf>,
}

fn default_parquet_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/procurement.parquet"))
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            parquet: default_parquet_path(),
            json: None,
        }
    }
}

/// Run configuration, loadable from a YAML file. Every option has a default
/// so a minimal file (or none at all) yields a working run over the most
/// recent month.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Portal page scraped for period-coded archive links.
    #[serde(default = "default_index_url")]
    pub index_url: String,
    /// Working area for downloaded archives and extracted documents.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Explicit period keys to process ("2023", "202403", ...). Takes
    /// precedence over `recent_months` when non-empty.
    #[serde(default)]
    pub periods: Vec<String>,
    /// Process the N most recent year-month periods from the index.
    #[serde(default = "default_recent_months")]
    pub recent_months: Option<usize>,
    /// Which record attribute identifies duplicates across periods.
    #[serde(default)]
    pub dedup_key: DedupKey,
    /// Project records onto the canonical column set before writing.
    #[serde(default)]
    pub apply_mapping: bool,
    /// Replace categorical codes with their labels after projection.
    /// Only meaningful together with `apply_mapping`.
    #[serde(default)]
    pub map_codes: bool,
    /// YAML file overriding the built-in canonical column mapping
    /// (collapsed path -> canonical name).
    #[serde(default)]
    pub mapping_file: Option<PathBuf>,
    /// YAML file overriding the built-in code -> label tables.
    #[serde(default)]
    pub code_tables_file: Option<PathBuf>,
    /// Keep only records whose folder status code equals this value
    /// (e.g. "PUB" for open tenders). `null` keeps everything.
    #[serde(default)]
    pub status_filter: Option<String>,
    /// Remove archives and extracted documents once the dataset is written.
    #[serde(default)]
    pub delete_raw_after_processing: bool,
    /// Treat a zero-record dataset as a valid (empty) output instead of an
    /// error.
    #[serde(default)]
    pub allow_empty: bool,
    /// In-flight periods (download + extract + parse).
    #[serde(default = "default_period_concurrency")]
    pub max_period_concurrency: usize,
    /// Worker threads parsing feed documents within a period.
    #[serde(default = "default_entry_concurrency")]
    pub max_entry_concurrency: usize,
    /// Run-level timeout; unfinished periods are reported as errors.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_index_url() -> String {
    DEFAULT_INDEX_URL.to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_recent_months() -> Option<usize> {
    Some(1)
}

fn default_period_concurrency() -> usize {
    3
}

fn default_entry_concurrency() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_url: default_index_url(),
            data_dir: default_data_dir(),
            periods: Vec::new(),
            recent_months: default_recent_months(),
            dedup_key: DedupKey::default(),
            apply_mapping: false,
            map_codes: false,
            mapping_file: None,
            code_tables_file: None,
            status_filter: None,
            delete_raw_after_processing: false,
            allow_empty: false,
            max_period_concurrency: default_period_concurrency(),
            max_entry_concurrency: default_entry_concurrency(),
            timeout_secs: None,
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let cfg: Config = serde_yaml::from_reader(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_period_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "max_period_concurrency must be at least 1".into(),
            ));
        }
        if self.max_entry_concurrency == 0 {
            return Err(Error::InvalidConfig(
                "max_entry_concurrency must be at least 1".into(),
            ));
        }
        if self.timeout_secs == Some(0) {
            return Err(Error::InvalidConfig("timeout_secs must be positive".into()));
        }
        if self.periods.is_empty() && self.recent_months.is_none() {
            return Err(Error::InvalidConfig(
                "select periods explicitly or set recent_months".into(),
            ));
        }
        if self.map_codes && !self.apply_mapping {
            return Err(Error::InvalidConfig(
                "map_codes requires apply_mapping".into(),
            ));
        }
        if self.output.parquet.is_none() && self.output.json.is_none() {
            return Err(Error::InvalidConfig(
                "at least one of output.parquet / output.json must be set".into(),
            ));
        }
        Ok(())
    }

    /// Directory holding one downloaded archive per period.
    pub fn archives_dir(&self) -> PathBuf {
        self.data_dir.join("archives")
    }

    /// Per-period directory of extracted feed documents.
    pub fn raw_dir(&self, period: &str) -> PathBuf {
        self.data_dir.join("raw").join(period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_period_concurrency, 3);
        assert_eq!(cfg.recent_months, Some(1));
        assert!(cfg.output.parquet.is_some());
    }

    #[test]
    fn loads_minimal_yaml() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "periods: [\"2023\", \"202401\"]").unwrap();
        writeln!(f, "dedup_key: id").unwrap();
        writeln!(f, "max_entry_concurrency: 8").unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.periods, vec!["2023", "202401"]);
        assert_eq!(cfg.dedup_key, DedupKey::Id);
        assert_eq!(cfg.max_entry_concurrency, 8);
        // untouched fields keep their defaults
        assert_eq!(cfg.index_url, DEFAULT_INDEX_URL);
    }

    #[test]
    fn rejects_zero_concurrency() {
        let cfg = Config {
            max_period_concurrency: 0,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_missing_outputs() {
        let cfg = Config {
            output: OutputConfig {
                parquet: None,
                json: None,
            },
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_empty_selection() {
        let cfg = Config {
            periods: Vec::new(),
            recent_months: None,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn code_mapping_requires_projection() {
        let cfg = Config {
            map_codes: true,
            apply_mapping: false,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }
}
