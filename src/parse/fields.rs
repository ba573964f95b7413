// src/parse/fields.rs

//! Fixed extraction schema for the notice payload inside each feed entry.
//!
//! Each spec names a dot-joined path into the collapsed `ContractFolderStatus`
//! subtree (namespace prefixes stripped, nesting preserved) and the record
//! block the value lands in. Anything the schema does not name is ignored by
//! the parser.

/// Which [`RawRecord`](super::RawRecord) block a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    /// Contracting authority publishing the notice.
    Party,
    /// Procurement project and tendering process.
    Project,
    /// Tender outcome, present once a result has been published.
    Award,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub path: &'static str,
    pub block: Block,
}

const fn spec(path: &'static str, block: Block) -> FieldSpec {
    FieldSpec { path, block }
}

pub const EXTRACTION_SCHEMA: &[FieldSpec] = &[
    // contracting party
    spec("LocatedContractingParty.Party.PartyName.Name", Block::Party),
    spec("LocatedContractingParty.Party.PartyIdentification.ID", Block::Party),
    spec("LocatedContractingParty.Party.PostalAddress.CityName", Block::Party),
    spec("LocatedContractingParty.Party.PostalAddress.PostalZone", Block::Party),
    spec("LocatedContractingParty.Party.PostalAddress.Country.Name", Block::Party),
    spec("LocatedContractingParty.Party.WebsiteURI", Block::Party),
    // project and tendering process
    spec("ContractFolderID", Block::Project),
    spec("ContractFolderStatusCode", Block::Project),
    spec("ProcurementProject.Name", Block::Project),
    spec("ProcurementProject.TypeCode", Block::Project),
    spec("ProcurementProject.SubTypeCode", Block::Project),
    spec(
        "ProcurementProject.RequiredCommodityClassification.ItemClassificationCode",
        Block::Project,
    ),
    spec(
        "ProcurementProjectLot.ProcurementProject.RequiredCommodityClassification.ItemClassificationCode",
        Block::Project,
    ),
    spec(
        "ProcurementProject.BudgetAmount.EstimatedOverallContractAmount",
        Block::Project,
    ),
    spec("ProcurementProject.BudgetAmount.TotalAmount", Block::Project),
    spec("ProcurementProject.BudgetAmount.TaxExclusiveAmount", Block::Project),
    spec("ProcurementProject.RealizedLocation.CountrySubentity", Block::Project),
    spec("TenderingProcess.ProcedureCode", Block::Project),
    spec("TenderingProcess.UrgencyCode", Block::Project),
    spec(
        "TenderingProcess.TenderSubmissionDeadlinePeriod.EndDate",
        Block::Project,
    ),
    spec(
        "TenderingProcess.TenderSubmissionDeadlinePeriod.EndTime",
        Block::Project,
    ),
    // award
    spec("TenderResult.ResultCode", Block::Award),
    spec("TenderResult.AwardDate", Block::Award),
    spec("TenderResult.ReceivedTenderQuantity", Block::Award),
    spec("TenderResult.WinningParty.PartyName.Name", Block::Award),
    spec(
        "TenderResult.AwardedTenderedProject.LegalMonetaryTotal.TaxExclusiveAmount",
        Block::Award,
    ),
    spec(
        "TenderResult.AwardedTenderedProject.LegalMonetaryTotal.PayableAmount",
        Block::Award,
    ),
];

/// Block assignment for a collapsed path, if the schema extracts it.
pub fn block_for(path: &str) -> Option<Block> {
    EXTRACTION_SCHEMA
        .iter()
        .find(|s| s.path == path)
        .map(|s| s.block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn schema_paths_are_unique() {
        let unique: BTreeSet<_> = EXTRACTION_SCHEMA.iter().map(|s| s.path).collect();
        assert_eq!(unique.len(), EXTRACTION_SCHEMA.len());
    }

    #[test]
    fn every_block_is_represented() {
        for block in [Block::Party, Block::Project, Block::Award] {
            assert!(
                EXTRACTION_SCHEMA.iter().any(|s| s.block == block),
                "no fields for {block:?}"
            );
        }
    }

    #[test]
    fn block_lookup_matches_schema() {
        assert_eq!(block_for("ContractFolderStatusCode"), Some(Block::Project));
        assert_eq!(
            block_for("LocatedContractingParty.Party.PartyName.Name"),
            Some(Block::Party)
        );
        assert_eq!(block_for("TenderResult.ResultCode"), Some(Block::Award));
        assert_eq!(block_for("NoSuchPath"), None);
    }
}
