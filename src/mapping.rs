// src/mapping.rs

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Error, Result};
use crate::parse::RawRecord;

/// Canonical column the conditional sub-type table is selected by.
const TYPE_COLUMN: &str = "ProjectTypeCode";
/// Canonical column the selected sub-type table rewrites.
const SUBTYPE_COLUMN: &str = "ProjectSubTypeCode";

/// A record after projection: provenance and entry fields, plus one value per
/// canonical column. Every canonical name is present; columns the source
/// record lacked hold an empty string.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub period: String,
    pub source: PathBuf,
    pub link: String,
    pub title: String,
    pub updated: String,
    pub fields: BTreeMap<String, String>,
}

/// Static projection table: collapsed path -> canonical column name.
/// Paths absent from the table are dropped by [`FieldMap::apply`].
#[derive(Debug, Clone)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    /// The portal's standard open-tenders column set.
    pub fn builtin() -> Self {
        let entries = [
            ("ContractFolderID", "ID"),
            ("ContractFolderStatusCode", "StatusCode"),
            ("LocatedContractingParty.Party.PartyName.Name", "ContractingParty"),
            ("LocatedContractingParty.Party.PostalAddress.CityName", "City"),
            ("LocatedContractingParty.Party.PostalAddress.Country.Name", "Country"),
            ("LocatedContractingParty.Party.PostalAddress.PostalZone", "ZipCode"),
            ("ProcurementProject.Name", "ProjectName"),
            ("ProcurementProject.TypeCode", "ProjectTypeCode"),
            ("ProcurementProject.SubTypeCode", "ProjectSubTypeCode"),
            (
                "ProcurementProject.RequiredCommodityClassification.ItemClassificationCode",
                "CPVCode",
            ),
            (
                "ProcurementProjectLot.ProcurementProject.RequiredCommodityClassification.ItemClassificationCode",
                "CPVLotCode",
            ),
            (
                "ProcurementProject.BudgetAmount.EstimatedOverallContractAmount",
                "EstimatedAmount",
            ),
            ("ProcurementProject.BudgetAmount.TotalAmount", "TotalAmount"),
            (
                "ProcurementProject.BudgetAmount.TaxExclusiveAmount",
                "TaxExclusiveAmount",
            ),
            ("TenderingProcess.ProcedureCode", "ProcessCode"),
            (
                "TenderingProcess.TenderSubmissionDeadlinePeriod.EndDate",
                "ProcessEndDate",
            ),
            ("TenderResult.ResultCode", "ResultCode"),
            ("TenderResult.AwardDate", "AwardDate"),
            ("TenderResult.WinningParty.PartyName.Name", "Winner"),
            (
                "TenderResult.AwardedTenderedProject.LegalMonetaryTotal.PayableAmount",
                "AwardAmount",
            ),
        ];
        FieldMap {
            entries: entries
                .into_iter()
                .map(|(p, n)| (p.to_string(), n.to_string()))
                .collect(),
        }
    }

    /// Load a projection table from a YAML mapping of path -> canonical name.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let table: BTreeMap<String, String> = serde_yaml::from_reader(file)?;
        let map = FieldMap {
            entries: table.into_iter().collect(),
        };
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<()> {
        let mut names = BTreeMap::new();
        for (path, name) in &self.entries {
            if name.trim().is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "mapping for {path} has an empty canonical name"
                )));
            }
            if let Some(other) = names.insert(name.as_str(), path.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "canonical name {name} mapped from both {other} and {path}"
                )));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Project one record onto the canonical columns.
    pub fn apply(&self, record: &RawRecord) -> CanonicalRecord {
        let mut fields = BTreeMap::new();
        for (path, name) in &self.entries {
            let value = record.field(path).unwrap_or("").to_string();
            fields.insert(name.clone(), value);
        }
        CanonicalRecord {
            period: record.period.clone(),
            source: record.source.clone(),
            link: record.link.clone(),
            title: record.title.clone(),
            updated: record.updated.clone(),
            fields,
        }
    }

    pub fn apply_all(&self, records: &[RawRecord]) -> Vec<CanonicalRecord> {
        let out: Vec<_> = records.iter().map(|r| self.apply(r)).collect();
        info!(records = out.len(), columns = self.len(), "projected records onto canonical columns");
        out
    }
}

/// Code -> label lookups, applied per canonical column after projection.
/// `subtypes` tables are keyed by the already-mapped contract type label and
/// rewrite the sub-type column only. Unknown codes pass through unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeTables {
    #[serde(default)]
    pub columns: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub subtypes: BTreeMap<String, BTreeMap<String, String>>,
}

fn table<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(c, l)| (c.to_string(), l.to_string()))
        .collect()
}

impl CodeTables {
    /// Default tables for the portal's categorical codes. Deliberately small;
    /// callers with richer reference data supply their own file.
    pub fn builtin() -> Self {
        let mut columns = BTreeMap::new();
        columns.insert(
            "ProjectTypeCode".to_string(),
            table([
                ("1", "Obras"),
                ("2", "Servicios"),
                ("3", "Suministros"),
                ("7", "Administrativo especial"),
                ("8", "Privado"),
                ("21", "Gestión de Servicios Públicos"),
                ("22", "Concesión de Servicios"),
                ("31", "Concesión de Obras Públicas"),
                ("32", "Concesión de Obras"),
                ("40", "Colaboración público privada"),
                ("50", "Patrimonial"),
            ]),
        );
        columns.insert(
            "ProcessCode".to_string(),
            table([
                ("1", "Abierto"),
                ("2", "Restringido"),
                ("3", "Negociado sin publicidad"),
                ("4", "Negociado con publicidad"),
                ("5", "Diálogo competitivo"),
                ("6", "Normas internas"),
                ("8", "Concurso de proyectos"),
                ("9", "Abierto simplificado"),
                ("100", "Contrato menor"),
            ]),
        );
        columns.insert(
            "ResultCode".to_string(),
            table([
                ("3", "Desierto"),
                ("4", "Desistimiento"),
                ("5", "Renuncia"),
                ("8", "Adjudicado"),
                ("9", "Formalizado"),
            ]),
        );

        let mut subtypes = BTreeMap::new();
        subtypes.insert(
            "Obras".to_string(),
            table([
                ("1", "Primer establecimiento, reforma o gran reparación"),
                ("2", "Reparación simple"),
                ("3", "Conservación y mantenimiento"),
                ("4", "Restauración"),
                ("6", "Demolición"),
            ]),
        );
        subtypes.insert(
            "Servicios".to_string(),
            table([
                ("1", "Servicios de mantenimiento y reparación"),
                ("7", "Servicios de informática"),
                ("14", "Servicios de limpieza de edificios"),
                ("27", "Otros servicios"),
            ]),
        );
        subtypes.insert(
            "Suministros".to_string(),
            table([
                ("1", "Arrendamiento"),
                ("2", "Adquisición"),
                ("3", "Arrendamiento con opción de compra"),
            ]),
        );

        CodeTables { columns, subtypes }
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Substitute labels in place. Per-column tables first, then the sub-type
    /// table selected by the mapped type value.
    pub fn apply(&self, records: &mut [CanonicalRecord]) {
        for record in records.iter_mut() {
            for (column, codes) in &self.columns {
                if let Some(value) = record.fields.get_mut(column) {
                    if let Some(label) = codes.get(value.as_str()) {
                        *value = label.clone();
                    }
                }
            }
            let type_label = record.fields.get(TYPE_COLUMN).cloned();
            if let Some(codes) = type_label.and_then(|t| self.subtypes.get(&t)) {
                if let Some(value) = record.fields.get_mut(SUBTYPE_COLUMN) {
                    if let Some(label) = codes.get(value.as_str()) {
                        *value = label.clone();
                    }
                }
            }
        }
        info!(records = records.len(), "replaced categorical codes with labels");
    }
}
