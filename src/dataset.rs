// src/dataset.rs

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema as ArrowSchema};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::json;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::dedup::DedupKey;
use crate::error::{Error, Result};
use crate::mapping::CanonicalRecord;
use crate::parse::fields::EXTRACTION_SCHEMA;
use crate::parse::RawRecord;

/// Fixed leading columns of a raw dataset.
const RAW_FIXED: &[&str] = &["period", "source", "id", "link", "title", "updated"];
/// Fixed leading columns of a canonical dataset. The entry id is replaced by
/// the canonical `ID` column the projection supplies.
const CANONICAL_FIXED: &[&str] = &["period", "source", "link", "title", "updated"];

#[derive(Debug, Clone)]
pub enum Records {
    Raw(Vec<RawRecord>),
    Canonical(Vec<CanonicalRecord>),
}

/// The consolidated output collection, tagged with the periods it was built
/// from and the dedup strategy that shaped it. Everything serializes as text;
/// type coercion is left to downstream consumers.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub records: Records,
    pub periods: Vec<String>,
    pub dedup_key: DedupKey,
}

impl Dataset {
    pub fn raw(records: Vec<RawRecord>, periods: Vec<String>, dedup_key: DedupKey) -> Self {
        Dataset {
            records: Records::Raw(records),
            periods,
            dedup_key,
        }
    }

    pub fn canonical(
        records: Vec<CanonicalRecord>,
        periods: Vec<String>,
        dedup_key: DedupKey,
    ) -> Self {
        Dataset {
            records: Records::Canonical(records),
            periods,
            dedup_key,
        }
    }

    pub fn len(&self) -> usize {
        match &self.records {
            Records::Raw(r) => r.len(),
            Records::Canonical(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column names in output order: provenance and entry fields first, then
    /// the extraction-schema paths (raw) or the canonical columns (mapped).
    pub fn columns(&self) -> Vec<String> {
        match &self.records {
            Records::Raw(_) => RAW_FIXED
                .iter()
                .map(|c| c.to_string())
                .chain(EXTRACTION_SCHEMA.iter().map(|s| s.path.to_string()))
                .collect(),
            Records::Canonical(records) => {
                let mut cols: Vec<String> = CANONICAL_FIXED.iter().map(|c| c.to_string()).collect();
                if let Some(first) = records.first() {
                    cols.extend(first.fields.keys().cloned());
                }
                cols
            }
        }
    }

    fn cell(&self, column: &str, idx: usize) -> String {
        match &self.records {
            Records::Raw(records) => {
                let r = &records[idx];
                match column {
                    "period" => r.period.clone(),
                    "source" => r.source.display().to_string(),
                    "id" => r.id.clone(),
                    "link" => r.link.clone(),
                    "title" => r.title.clone(),
                    "updated" => r.updated.clone(),
                    path => r.field(path).unwrap_or("").to_string(),
                }
            }
            Records::Canonical(records) => {
                let r = &records[idx];
                match column {
                    "period" => r.period.clone(),
                    "source" => r.source.display().to_string(),
                    "link" => r.link.clone(),
                    "title" => r.title.clone(),
                    "updated" => r.updated.clone(),
                    name => r.fields.get(name).cloned().unwrap_or_default(),
                }
            }
        }
    }

    fn to_batch(&self) -> Result<RecordBatch> {
        let columns = self.columns();
        let fields: Vec<Field> = columns
            .iter()
            .map(|c| Field::new(c, DataType::Utf8, false))
            .collect();
        let schema = Arc::new(ArrowSchema::new(fields));
        let arrays: Vec<ArrayRef> = columns
            .iter()
            .map(|c| {
                let values: Vec<String> = (0..self.len()).map(|i| self.cell(c, i)).collect();
                Arc::new(StringArray::from(values)) as ArrayRef
            })
            .collect();
        Ok(RecordBatch::try_new(schema, arrays)?)
    }

    fn last_updated(&self) -> Option<String> {
        let timestamps: Vec<&str> = match &self.records {
            Records::Raw(r) => r.iter().map(|r| r.updated.as_str()).collect(),
            Records::Canonical(r) => r.iter().map(|r| r.updated.as_str()).collect(),
        };
        timestamps
            .into_iter()
            .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .max()
            .map(|d| d.to_rfc3339())
    }

    fn metadata(&self) -> serde_json::Value {
        json!({
            "total_records": self.len(),
            "columns": self.columns(),
            "periods": self.periods,
            "dedup_key": self.dedup_key.as_str(),
            "created_at": Utc::now().timestamp(),
            "last_updated": self.last_updated(),
        })
    }

    /// Serialize to every requested destination. A zero-record dataset is
    /// rejected up front unless the caller accepts empty output.
    pub fn write(
        &self,
        parquet: Option<&Path>,
        json: Option<&Path>,
        allow_empty: bool,
    ) -> Result<Vec<PathBuf>> {
        if self.is_empty() && !allow_empty {
            return Err(Error::EmptyDataset);
        }
        let mut written = Vec::new();
        if let Some(path) = parquet {
            self.write_parquet(path)?;
            written.push(path.to_path_buf());
        }
        if let Some(path) = json {
            self.write_json(path)?;
            written.push(path.to_path_buf());
        }
        Ok(written)
    }

    /// Write the whole collection as one SNAPPY-compressed Parquet file, all
    /// columns Utf8. The destination only ever holds a complete file: data
    /// goes to a sibling tmp path first and is renamed into place.
    #[instrument(level = "info", skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn write_parquet(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let batch = self.to_batch()?;

        let tmp = path.with_extension("tmp");
        let file = File::create(&tmp)?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_dictionary_enabled(true)
            .build();
        let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        fs::rename(&tmp, path)?;

        info!(
            rows = batch.num_rows(),
            columns = batch.num_columns(),
            "wrote parquet dataset"
        );
        Ok(())
    }

    /// Write a JSON document with a metadata envelope:
    /// `{ "metadata": {...}, "data": [ {column: value, ...}, ... ] }`.
    #[instrument(level = "info", skip(self, path), fields(path = %path.as_ref().display()))]
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let columns = self.columns();
        let data: Vec<serde_json::Value> = (0..self.len())
            .map(|i| {
                let mut row = serde_json::Map::new();
                for column in &columns {
                    row.insert(
                        column.clone(),
                        serde_json::Value::String(self.cell(column, i)),
                    );
                }
                serde_json::Value::Object(row)
            })
            .collect();
        let doc = json!({ "metadata": self.metadata(), "data": data });

        let tmp = path.with_extension("tmp");
        let mut out = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut out, &doc)?;
        out.flush()?;
        fs::rename(&tmp, path)?;

        info!(rows = data.len(), "wrote json dataset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::FieldMap;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    // three records spanning party, project and award blocks
    fn sample_records() -> Vec<RawRecord> {
        let mut a = RawRecord::new("202401", "202401/doc_1.atom", 0);
        a.id = "n1".into();
        a.link = "https://example.es/licitacion/1".into();
        a.title = "Servicio de limpieza".into();
        a.updated = "2024-01-15T08:30:00+00:00".into();
        a.party.insert(
            "LocatedContractingParty.Party.PartyName.Name".into(),
            "Ayuntamiento de Parla".into(),
        );
        a.project
            .insert("ContractFolderStatusCode".into(), "PUB".into());

        let mut b = RawRecord::new("202401", "202401/doc_2.atom", 0);
        b.id = "n2".into();
        b.link = "https://example.es/licitacion/2".into();
        b.title = "Obras de mejora".into();
        b.updated = "2024-01-20T10:00:00+00:00".into();
        b.project
            .insert("ProcurementProject.BudgetAmount.TotalAmount".into(), "99000".into());

        let mut c = RawRecord::new("202402", "202402/doc_1.atom", 0);
        c.id = "n3".into();
        c.link = "https://example.es/licitacion/3".into();
        c.title = "Suministro de material".into();
        c.updated = "2024-02-05T09:00:00+00:00".into();
        c.award
            .insert("TenderResult.WinningParty.PartyName.Name".into(), "Acme SL".into());

        vec![a, b, c]
    }

    fn read_parquet(path: &Path) -> RecordBatch {
        let file = File::open(path).unwrap();
        let mut reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .with_batch_size(1024)
            .build()
            .unwrap();
        reader.next().unwrap().unwrap()
    }

    fn column<'a>(batch: &'a RecordBatch, name: &str) -> &'a StringArray {
        batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
    }

    #[test]
    fn parquet_round_trip_preserves_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/procurement.parquet");
        let dataset = Dataset::raw(
            sample_records(),
            vec!["202401".into(), "202402".into()],
            DedupKey::Link,
        );
        dataset.write_parquet(&path).unwrap();

        let batch = read_parquet(&path);
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.num_columns(), dataset.columns().len());

        assert_eq!(column(&batch, "id").value(0), "n1");
        assert_eq!(column(&batch, "period").value(2), "202402");
        assert_eq!(
            column(&batch, "LocatedContractingParty.Party.PartyName.Name").value(0),
            "Ayuntamiento de Parla"
        );
        assert_eq!(
            column(&batch, "ProcurementProject.BudgetAmount.TotalAmount").value(1),
            "99000"
        );
        assert_eq!(
            column(&batch, "TenderResult.WinningParty.PartyName.Name").value(2),
            "Acme SL"
        );
        // absent fields come back as empty strings, not nulls
        assert_eq!(column(&batch, "ContractFolderStatusCode").value(1), "");
    }

    #[test]
    fn json_document_carries_metadata_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procurement.json");
        let dataset = Dataset::raw(
            sample_records(),
            vec!["202401".into(), "202402".into()],
            DedupKey::Id,
        );
        dataset.write_json(&path).unwrap();

        let doc: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        let meta = &doc["metadata"];
        assert_eq!(meta["total_records"], 3);
        assert_eq!(meta["dedup_key"], "id");
        assert_eq!(meta["periods"], json!(["202401", "202402"]));
        assert_eq!(
            meta["last_updated"].as_str().unwrap(),
            "2024-02-05T09:00:00+00:00"
        );
        assert!(meta["columns"].as_array().unwrap().len() > 6);

        let data = doc["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["title"], "Servicio de limpieza");
        assert_eq!(data[2]["TenderResult.WinningParty.PartyName.Name"], "Acme SL");
    }

    #[test]
    fn canonical_dataset_uses_canonical_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.parquet");
        let canonical = FieldMap::builtin().apply_all(&sample_records());
        let dataset = Dataset::canonical(canonical, vec!["202401".into(), "202402".into()], DedupKey::Link);
        dataset.write_parquet(&path).unwrap();

        let batch = read_parquet(&path);
        assert_eq!(column(&batch, "StatusCode").value(0), "PUB");
        assert_eq!(column(&batch, "Winner").value(2), "Acme SL");
        assert!(batch.column_by_name("id").is_none());
        assert!(batch
            .column_by_name("LocatedContractingParty.Party.PartyName.Name")
            .is_none());
    }

    #[test]
    fn empty_dataset_is_rejected_unless_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let parquet = dir.path().join("empty.parquet");
        let dataset = Dataset::raw(Vec::new(), vec!["202401".into()], DedupKey::Link);

        let err = dataset.write(Some(&parquet), None, false).unwrap_err();
        assert!(matches!(err, Error::EmptyDataset));
        assert!(!parquet.exists());

        let written = dataset.write(Some(&parquet), None, true).unwrap();
        assert_eq!(written, vec![parquet.clone()]);
        let file = File::open(&parquet).unwrap();
        let mut reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        assert!(reader.next().is_none());
    }

    #[test]
    fn write_replaces_stale_output_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procurement.parquet");
        fs::write(&path, b"stale bytes from an older run").unwrap();

        let dataset = Dataset::raw(sample_records(), vec!["202401".into()], DedupKey::Link);
        dataset.write_parquet(&path).unwrap();

        let batch = read_parquet(&path);
        assert_eq!(batch.num_rows(), 3);
        assert!(!path.with_extension("tmp").exists());
    }
}
