// src/parse/mod.rs

pub mod fields;

use quick_xml::events::{BytesCData, BytesStart, Event};
use quick_xml::Reader;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::instrument;

use crate::error::{Error, Result};
use fields::{Block, EXTRACTION_SCHEMA};

type XmlResult<T> = std::result::Result<T, quick_xml::Error>;

/// Flat extraction of one procurement notice.
///
/// Entry-level fields are kept as raw strings exactly as published; the three
/// blocks hold the schema-selected notice fields keyed by their collapsed
/// path. `period`, `source` and `seq` (position within the source document)
/// are provenance and are always set.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub period: String,
    pub source: PathBuf,
    pub seq: usize,
    pub id: String,
    pub link: String,
    pub title: String,
    pub updated: String,
    pub party: BTreeMap<String, String>,
    pub project: BTreeMap<String, String>,
    pub award: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(period: impl Into<String>, source: impl Into<PathBuf>, seq: usize) -> Self {
        RawRecord {
            period: period.into(),
            source: source.into(),
            seq,
            id: String::new(),
            link: String::new(),
            title: String::new(),
            updated: String::new(),
            party: BTreeMap::new(),
            project: BTreeMap::new(),
            award: BTreeMap::new(),
        }
    }

    pub fn block(&self, block: Block) -> &BTreeMap<String, String> {
        match block {
            Block::Party => &self.party,
            Block::Project => &self.project,
            Block::Award => &self.award,
        }
    }

    pub fn block_mut(&mut self, block: Block) -> &mut BTreeMap<String, String> {
        match block {
            Block::Party => &mut self.party,
            Block::Project => &mut self.project,
            Block::Award => &mut self.award,
        }
    }

    /// Looks a collapsed path up across all three blocks.
    pub fn field(&self, path: &str) -> Option<&str> {
        self.party
            .get(path)
            .or_else(|| self.project.get(path))
            .or_else(|| self.award.get(path))
            .map(String::as_str)
    }

    /// The notice's publication status code, when present.
    pub fn folder_status(&self) -> Option<&str> {
        self.project
            .get("ContractFolderStatusCode")
            .map(String::as_str)
    }
}

/// Parse one extracted feed document into its notices.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub fn parse_document(period: &str, path: &Path) -> Result<Vec<RawRecord>> {
    let content = fs::read_to_string(path)?;
    let content = content.strip_prefix('\u{feff}').unwrap_or(&content);
    parse_feed(period, path, content)
}

/// Parse a feed document body. Each `<entry>` yields one [`RawRecord`];
/// a document that is not well-formed XML is rejected whole as
/// [`Error::MalformedEntry`].
pub fn parse_feed(period: &str, source: &Path, content: &str) -> Result<Vec<RawRecord>> {
    let mut reader = Reader::from_str(content);
    let mut records = Vec::new();
    let mut in_entry = false;
    let mut scratch = EntryScratch::default();

    loop {
        match reader.read_event().map_err(|e| malformed(source, e))? {
            Event::Start(e) => {
                let local = local_name(&e);
                if !in_entry {
                    if local == "entry" {
                        in_entry = true;
                        scratch = EntryScratch::default();
                    }
                    continue;
                }
                match local.as_str() {
                    "id" => {
                        scratch.id =
                            read_text_content(&mut reader, b"id").map_err(|e| malformed(source, e))?
                    }
                    "title" => {
                        scratch.title = read_text_content(&mut reader, b"title")
                            .map_err(|e| malformed(source, e))?
                    }
                    "updated" => {
                        scratch.updated = read_text_content(&mut reader, b"updated")
                            .map_err(|e| malformed(source, e))?
                    }
                    "link" => {
                        if scratch.link.is_empty() {
                            scratch.link = href_attr(&e).map_err(|e| malformed(source, e))?;
                        }
                        reader
                            .read_to_end(e.name())
                            .map_err(|e| malformed(source, e))?;
                    }
                    "ContractFolderStatus" => {
                        scratch.flat =
                            collapse_subtree(&mut reader).map_err(|e| malformed(source, e))?
                    }
                    // summary and anything else: skip the whole subtree
                    _ => {
                        reader
                            .read_to_end(e.name())
                            .map_err(|e| malformed(source, e))?;
                    }
                }
            }
            Event::Empty(e) => {
                if in_entry && local_name(&e) == "link" && scratch.link.is_empty() {
                    scratch.link = href_attr(&e).map_err(|e| malformed(source, e))?;
                }
            }
            Event::End(e) => {
                if in_entry && e.local_name().as_ref() == b"entry" {
                    let seq = records.len();
                    records.push(build_record(period, source, seq, std::mem::take(&mut scratch)));
                    in_entry = false;
                }
            }
            Event::Eof => {
                if in_entry {
                    return Err(Error::MalformedEntry {
                        path: source.to_path_buf(),
                        reason: "unexpected end of document inside <entry>".to_string(),
                    });
                }
                break;
            }
            _ => {}
        }
    }

    Ok(records)
}

#[derive(Default)]
struct EntryScratch {
    id: String,
    link: String,
    title: String,
    updated: String,
    flat: BTreeMap<String, String>,
}

fn build_record(period: &str, source: &Path, seq: usize, mut scratch: EntryScratch) -> RawRecord {
    let mut record = RawRecord::new(period, source, seq);
    record.id = scratch.id;
    record.link = scratch.link;
    record.title = scratch.title;
    record.updated = scratch.updated;
    for spec in EXTRACTION_SCHEMA {
        if let Some(value) = scratch.flat.remove(spec.path) {
            record.block_mut(spec.block).insert(spec.path.to_string(), value);
        }
    }
    record
}

/// Collapse the element subtree the reader is currently inside into a flat
/// `path -> text` map. Paths are dot-joined local names relative to the
/// subtree root. A repeated path keeps its first occurrence; the repeat's
/// whole subtree is ignored. Elements with child elements contribute no text
/// of their own, and whitespace-only leaves are dropped.
fn collapse_subtree(reader: &mut Reader<&[u8]>) -> XmlResult<BTreeMap<String, String>> {
    struct Frame {
        path: String,
        text: String,
        has_children: bool,
    }

    let mut flat = BTreeMap::new();
    let mut started: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<Frame> = Vec::new();
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                if skip_depth > 0 {
                    skip_depth += 1;
                    continue;
                }
                let path = child_path(stack.last().map(|f| f.path.as_str()), &e);
                if !started.insert(path.clone()) {
                    skip_depth = 1;
                    continue;
                }
                if let Some(parent) = stack.last_mut() {
                    parent.has_children = true;
                }
                stack.push(Frame {
                    path,
                    text: String::new(),
                    has_children: false,
                });
            }
            Event::Empty(e) => {
                if skip_depth > 0 {
                    continue;
                }
                let path = child_path(stack.last().map(|f| f.path.as_str()), &e);
                started.insert(path);
                if let Some(parent) = stack.last_mut() {
                    parent.has_children = true;
                }
            }
            Event::Text(t) => {
                if skip_depth == 0 {
                    if let Some(frame) = stack.last_mut() {
                        push_text(&mut frame.text, &t.unescape()?);
                    }
                }
            }
            Event::CData(c) => {
                if skip_depth == 0 {
                    if let Some(frame) = stack.last_mut() {
                        push_text(&mut frame.text, &cdata_text(&c));
                    }
                }
            }
            Event::End(_) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                    continue;
                }
                match stack.pop() {
                    Some(frame) => {
                        if !frame.has_children && !frame.text.is_empty() {
                            flat.entry(frame.path).or_insert(frame.text);
                        }
                    }
                    // the subtree root's own end tag
                    None => return Ok(flat),
                }
            }
            Event::Eof => {
                return Err(quick_xml::Error::UnexpectedEof(
                    "notice subtree".to_string(),
                ))
            }
            _ => {}
        }
    }
}

/// Text content of the current element, nested markup stripped.
fn read_text_content(reader: &mut Reader<&[u8]>, end: &[u8]) -> XmlResult<String> {
    let mut out = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(e) => {
                if depth == 0 && e.local_name().as_ref() == end {
                    return Ok(out);
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(t) => push_text(&mut out, &t.unescape()?),
            Event::CData(c) => push_text(&mut out, &cdata_text(&c)),
            Event::Eof => return Err(quick_xml::Error::UnexpectedEof("text content".to_string())),
            _ => {}
        }
    }
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn child_path(parent: Option<&str>, e: &BytesStart) -> String {
    let local = local_name(e);
    match parent {
        Some(p) => format!("{p}.{local}"),
        None => local,
    }
}

fn push_text(out: &mut String, raw: &str) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push(' ');
    }
    out.push_str(trimmed);
}

fn cdata_text(c: &BytesCData) -> String {
    String::from_utf8_lossy(c).into_owned()
}

fn href_attr(e: &BytesStart) -> XmlResult<String> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::InvalidAttr)?;
        if attr.key.local_name().as_ref() == b"href" {
            return Ok(attr.unescape_value()?.into_owned());
        }
    }
    Ok(String::new())
}

fn malformed(path: &Path, err: quick_xml::Error) -> Error {
    Error::MalformedEntry {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(entries: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom"
      xmlns:cac-place-ext="urn:dgpe:names:draft:codice-place-ext:schema:xsd:CommonAggregateComponents-2"
      xmlns:cac="urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2"
      xmlns:cbc="urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2">
  <title>Plataforma de Contratacion - licitaciones</title>
  <updated>2024-01-31T12:00:00Z</updated>
{entries}
</feed>"#
        )
    }

    const ENTRY_FULL: &str = r#"  <entry>
    <id>https://contrataciondelestado.es/sindicacion/licitacion/100001</id>
    <link href="https://contrataciondelestado.es/licitacion/100001.html"/>
    <title> Servicio de limpieza </title>
    <updated>2024-01-15T08:30:00Z</updated>
    <summary type="html">resumen irrelevante</summary>
    <cac-place-ext:ContractFolderStatus>
      <cbc:ContractFolderID>EXP-2024-001</cbc:ContractFolderID>
      <cbc:ContractFolderStatusCode>PUB</cbc:ContractFolderStatusCode>
      <cac-place-ext:LocatedContractingParty>
        <cac:Party>
          <cac:PartyName><cbc:Name>Ayuntamiento de Parla</cbc:Name></cac:PartyName>
          <cac:PostalAddress>
            <cbc:CityName>Parla</cbc:CityName>
            <cbc:PostalZone>28981</cbc:PostalZone>
            <cac:Country><cbc:Name>España</cbc:Name></cac:Country>
          </cac:PostalAddress>
        </cac:Party>
      </cac-place-ext:LocatedContractingParty>
      <cac:ProcurementProject>
        <cbc:Name>Limpieza de dependencias municipales</cbc:Name>
        <cbc:TypeCode>2</cbc:TypeCode>
        <cbc:SubTypeCode>1</cbc:SubTypeCode>
        <cac:BudgetAmount>
          <cbc:EstimatedOverallContractAmount>120000</cbc:EstimatedOverallContractAmount>
          <cbc:TotalAmount>145200</cbc:TotalAmount>
          <cbc:TaxExclusiveAmount>120000</cbc:TaxExclusiveAmount>
        </cac:BudgetAmount>
        <cac:RequiredCommodityClassification>
          <cbc:ItemClassificationCode>90910000</cbc:ItemClassificationCode>
        </cac:RequiredCommodityClassification>
      </cac:ProcurementProject>
      <cac:TenderingProcess>
        <cbc:ProcedureCode>1</cbc:ProcedureCode>
        <cac:TenderSubmissionDeadlinePeriod>
          <cbc:EndDate>2024-02-15</cbc:EndDate>
          <cbc:EndTime>14:00:00</cbc:EndTime>
        </cac:TenderSubmissionDeadlinePeriod>
      </cac:TenderingProcess>
      <cac:TenderResult>
        <cbc:ResultCode>8</cbc:ResultCode>
        <cbc:AwardDate>2024-03-01</cbc:AwardDate>
        <cac:WinningParty>
          <cac:PartyName><cbc:Name>Limpiezas Acme SL</cbc:Name></cac:PartyName>
        </cac:WinningParty>
      </cac:TenderResult>
    </cac-place-ext:ContractFolderStatus>
  </entry>"#;

    const ENTRY_BARE: &str = r#"  <entry>
    <id>https://contrataciondelestado.es/sindicacion/licitacion/100002</id>
    <link href="https://contrataciondelestado.es/licitacion/100002.html"/>
    <title>Obras de acondicionamiento</title>
    <updated>2024-01-16T10:00:00Z</updated>
  </entry>"#;

    fn src() -> PathBuf {
        PathBuf::from("202401/licitacionesPerfilesContratanteCompleto3_001.atom")
    }

    #[test]
    fn parses_notices_with_all_blocks() {
        let body = feed(&format!("{ENTRY_FULL}\n{ENTRY_BARE}"));
        let records = parse_feed("202401", &src(), &body).unwrap();
        assert_eq!(records.len(), 2);

        let rec = &records[0];
        assert_eq!(rec.period, "202401");
        assert_eq!(rec.source, src());
        assert_eq!(rec.seq, 0);
        assert_eq!(
            rec.id,
            "https://contrataciondelestado.es/sindicacion/licitacion/100001"
        );
        assert_eq!(
            rec.link,
            "https://contrataciondelestado.es/licitacion/100001.html"
        );
        assert_eq!(rec.title, "Servicio de limpieza");
        assert_eq!(rec.updated, "2024-01-15T08:30:00Z");

        assert_eq!(
            rec.party
                .get("LocatedContractingParty.Party.PartyName.Name")
                .map(String::as_str),
            Some("Ayuntamiento de Parla")
        );
        assert_eq!(
            rec.party
                .get("LocatedContractingParty.Party.PostalAddress.Country.Name")
                .map(String::as_str),
            Some("España")
        );
        assert_eq!(rec.folder_status(), Some("PUB"));
        assert_eq!(
            rec.project
                .get("ProcurementProject.BudgetAmount.TotalAmount")
                .map(String::as_str),
            Some("145200")
        );
        assert_eq!(
            rec.award
                .get("TenderResult.WinningParty.PartyName.Name")
                .map(String::as_str),
            Some("Limpiezas Acme SL")
        );

        assert_eq!(records[1].seq, 1);
        assert_eq!(records[1].title, "Obras de acondicionamiento");
    }

    #[test]
    fn missing_notice_payload_yields_empty_blocks() {
        let body = feed(ENTRY_BARE);
        let records = parse_feed("202401", &src(), &body).unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert!(rec.party.is_empty());
        assert!(rec.project.is_empty());
        assert!(rec.award.is_empty());
        assert_eq!(rec.folder_status(), None);
    }

    #[test]
    fn malformed_document_is_rejected_whole() {
        let body = feed("  <entry><id>x</id><title>mismatched</entry>");
        let err = parse_feed("202401", &src(), &body).unwrap_err();
        assert!(matches!(err, Error::MalformedEntry { .. }));
    }

    #[test]
    fn truncated_document_is_malformed() {
        let body = r#"<?xml version="1.0"?><feed xmlns="http://www.w3.org/2005/Atom"><entry><id>x</id>"#;
        let err = parse_feed("202401", &src(), body).unwrap_err();
        assert!(matches!(err, Error::MalformedEntry { .. }));
    }

    #[test]
    fn repeated_subtree_keeps_first_occurrence() {
        let entry = r#"  <entry>
    <id>n1</id><link href="https://example.es/n1"/><title>t</title><updated>2024-01-01T00:00:00Z</updated>
    <cac-place-ext:ContractFolderStatus>
      <cac:ProcurementProjectLot>
        <cac:ProcurementProject>
          <cac:RequiredCommodityClassification>
            <cbc:ItemClassificationCode>45000000</cbc:ItemClassificationCode>
          </cac:RequiredCommodityClassification>
        </cac:ProcurementProject>
      </cac:ProcurementProjectLot>
      <cac:ProcurementProjectLot>
        <cac:ProcurementProject>
          <cac:RequiredCommodityClassification>
            <cbc:ItemClassificationCode>90910000</cbc:ItemClassificationCode>
          </cac:RequiredCommodityClassification>
        </cac:ProcurementProject>
      </cac:ProcurementProjectLot>
    </cac-place-ext:ContractFolderStatus>
  </entry>"#;
        let records = parse_feed("202401", &src(), &feed(entry)).unwrap();
        assert_eq!(
            records[0].project.get(
                "ProcurementProjectLot.ProcurementProject.RequiredCommodityClassification.ItemClassificationCode"
            ).map(String::as_str),
            Some("45000000")
        );
    }

    #[test]
    fn summary_markup_does_not_leak_into_fields() {
        let entry = r#"  <entry>
    <id>n1</id><link href="https://example.es/n1"/>
    <title>Titulo real</title><updated>2024-01-01T00:00:00Z</updated>
    <summary><embedded><title>titulo falso</title><id>id falso</id></embedded></summary>
  </entry>"#;
        let records = parse_feed("202401", &src(), &feed(entry)).unwrap();
        assert_eq!(records[0].title, "Titulo real");
        assert_eq!(records[0].id, "n1");
    }

    #[test]
    fn entities_and_cdata_are_decoded() {
        let entry = r#"  <entry>
    <id><![CDATA[https://example.es/n?a=1&b=2]]></id>
    <link href="https://example.es/n?a=1&amp;b=2"/>
    <title>Obras &amp; reformas</title><updated>2024-01-01T00:00:00Z</updated>
  </entry>"#;
        let records = parse_feed("202401", &src(), &feed(entry)).unwrap();
        assert_eq!(records[0].id, "https://example.es/n?a=1&b=2");
        assert_eq!(records[0].link, "https://example.es/n?a=1&b=2");
        assert_eq!(records[0].title, "Obras & reformas");
    }

    #[test]
    fn whitespace_only_leaves_are_dropped() {
        let entry = r#"  <entry>
    <id>n1</id><link href="https://example.es/n1"/><title>t</title><updated>2024-01-01T00:00:00Z</updated>
    <cac-place-ext:ContractFolderStatus>
      <cbc:ContractFolderID>
      </cbc:ContractFolderID>
      <cbc:ContractFolderStatusCode>PUB</cbc:ContractFolderStatusCode>
    </cac-place-ext:ContractFolderStatus>
  </entry>"#;
        let records = parse_feed("202401", &src(), &feed(entry)).unwrap();
        assert!(!records[0].project.contains_key("ContractFolderID"));
        assert_eq!(records[0].folder_status(), Some("PUB"));
    }

    #[test]
    fn first_link_wins() {
        let entry = r#"  <entry>
    <id>n1</id>
    <link href="https://example.es/first"/>
    <link href="https://example.es/second"/>
    <title>t</title><updated>2024-01-01T00:00:00Z</updated>
  </entry>"#;
        let records = parse_feed("202401", &src(), &feed(entry)).unwrap();
        assert_eq!(records[0].link, "https://example.es/first");
    }

    #[test]
    fn parse_document_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.atom");
        fs::write(&path, feed(ENTRY_BARE)).unwrap();
        let records = parse_document("202401", &path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, path);
    }
}
