//! Catalogue of known recall-publishing agencies.
//!
//! Each entry carries the canonical agency code, a display name, and the
//! default region (ISO 3166 alpha-2, or `EU` for union-wide systems) applied
//! when an agency record does not state its own jurisdiction.

use crate::models::AgencyCode;

#[derive(Debug, Clone, Copy)]
pub struct AgencyInfo {
    pub code: &'static str,
    pub name: &'static str,
    pub region: &'static str,
}

#[rustfmt::skip]
pub const KNOWN_AGENCIES: &[AgencyInfo] = &[
    AgencyInfo { code: "CPSC", name: "U.S. Consumer Product Safety Commission", region: "US" },
    AgencyInfo { code: "FDA", name: "U.S. Food and Drug Administration", region: "US" },
    AgencyInfo { code: "NHTSA", name: "U.S. National Highway Traffic Safety Administration", region: "US" },
    AgencyInfo { code: "USDA_FSIS", name: "USDA Food Safety and Inspection Service", region: "US" },
    AgencyInfo { code: "HEALTH_CANADA", name: "Health Canada", region: "CA" },
    AgencyInfo { code: "CFIA", name: "Canadian Food Inspection Agency", region: "CA" },
    AgencyInfo { code: "TRANSPORT_CANADA", name: "Transport Canada", region: "CA" },
    AgencyInfo { code: "EU_SAFETY_GATE", name: "EU Safety Gate (RAPEX)", region: "EU" },
    AgencyInfo { code: "EU_RASFF", name: "EU Rapid Alert System for Food and Feed", region: "EU" },
    AgencyInfo { code: "UK_OPSS", name: "UK Office for Product Safety and Standards", region: "GB" },
    AgencyInfo { code: "UK_FSA", name: "UK Food Standards Agency", region: "GB" },
    AgencyInfo { code: "UK_MHRA", name: "UK Medicines and Healthcare products Regulatory Agency", region: "GB" },
    AgencyInfo { code: "UK_DVSA", name: "UK Driver and Vehicle Standards Agency", region: "GB" },
    AgencyInfo { code: "ACCC", name: "Australian Competition and Consumer Commission", region: "AU" },
    AgencyInfo { code: "FSANZ", name: "Food Standards Australia New Zealand", region: "AU" },
    AgencyInfo { code: "TGA", name: "Australian Therapeutic Goods Administration", region: "AU" },
    AgencyInfo { code: "NZ_MBIE", name: "New Zealand Ministry of Business, Innovation and Employment", region: "NZ" },
    AgencyInfo { code: "NZ_MPI", name: "New Zealand Ministry for Primary Industries", region: "NZ" },
    AgencyInfo { code: "JP_CAA", name: "Japan Consumer Affairs Agency", region: "JP" },
    AgencyInfo { code: "JP_METI", name: "Japan Ministry of Economy, Trade and Industry", region: "JP" },
    AgencyInfo { code: "KR_KATS", name: "Korean Agency for Technology and Standards", region: "KR" },
    AgencyInfo { code: "CN_SAMR", name: "China State Administration for Market Regulation", region: "CN" },
    AgencyInfo { code: "SG_CPSO", name: "Singapore Consumer Product Safety Office", region: "SG" },
    AgencyInfo { code: "DE_BAUA", name: "German Federal Institute for Occupational Safety and Health", region: "DE" },
    AgencyInfo { code: "DE_BVL", name: "German Federal Office of Consumer Protection and Food Safety", region: "DE" },
    AgencyInfo { code: "FR_DGCCRF", name: "French Directorate-General for Competition, Consumer Affairs and Fraud Control", region: "FR" },
    AgencyInfo { code: "FR_RAPPELCONSO", name: "RappelConso", region: "FR" },
    AgencyInfo { code: "NL_NVWA", name: "Netherlands Food and Consumer Product Safety Authority", region: "NL" },
    AgencyInfo { code: "BE_AFSCA", name: "Belgian Federal Agency for the Safety of the Food Chain", region: "BE" },
    AgencyInfo { code: "IE_CCPC", name: "Irish Competition and Consumer Protection Commission", region: "IE" },
    AgencyInfo { code: "IE_FSAI", name: "Food Safety Authority of Ireland", region: "IE" },
    AgencyInfo { code: "ES_AESAN", name: "Spanish Agency for Food Safety and Nutrition", region: "ES" },
    AgencyInfo { code: "IT_MINSAL", name: "Italian Ministry of Health", region: "IT" },
    AgencyInfo { code: "SE_KOV", name: "Swedish Consumer Agency", region: "SE" },
    AgencyInfo { code: "DK_SIK", name: "Danish Safety Technology Authority", region: "DK" },
    AgencyInfo { code: "NO_DSB", name: "Norwegian Directorate for Civil Protection", region: "NO" },
    AgencyInfo { code: "CH_FCAB", name: "Swiss Federal Consumer Affairs Bureau", region: "CH" },
    AgencyInfo { code: "BR_SENACON", name: "Brazil National Consumer Secretariat", region: "BR" },
    AgencyInfo { code: "MX_PROFECO", name: "Mexico Federal Consumer Protection Agency", region: "MX" },
];

/// Look up a known agency by code (case-insensitive).
pub fn lookup(code: &AgencyCode) -> Option<&'static AgencyInfo> {
    KNOWN_AGENCIES.iter().find(|a| a.code == code.as_str())
}

/// Default region for an agency; `XX` when the agency is not catalogued.
pub fn default_region(code: &AgencyCode) -> &'static str {
    lookup(code).map(|a| a.region).unwrap_or("XX")
}
