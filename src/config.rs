//! Configuration parsing and validation.
//!
//! Recall Index is configured via a TOML file (default `config/recall.toml`).
//! Every section except `[db]` has defaults; agencies are declared one table
//! per agency code under `[agencies.<CODE>]`, tagged by transport `kind`.
//!
//! ```toml
//! [db]
//! path = "./data/recall.sqlite"
//!
//! [ingest]
//! batch_size = 500
//! max_workers = 8
//!
//! [matching]
//! min_confidence = 0.3
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [agencies.CPSC]
//! kind = "cpsc"
//! schedule_mins = 360
//!
//! [agencies.FDA]
//! kind = "openfda"
//! category = "food"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub agencies: BTreeMap<String, AgencyConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_max_error_summary")]
    pub max_error_summary: usize,
    /// Records sharing a dedupe key link only above this field similarity.
    #[serde(default = "default_dedupe_similarity")]
    pub dedupe_similarity: f64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            run_timeout_secs: default_run_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            max_error_summary: default_max_error_summary(),
            dedupe_similarity: default_dedupe_similarity(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_max_workers() -> usize {
    8
}
fn default_run_timeout_secs() -> u64 {
    1800
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_ms() -> u64 {
    2000
}
fn default_retry_cap_ms() -> u64 {
    60_000
}
fn default_max_error_summary() -> usize {
    50
}
fn default_dedupe_similarity() -> f64 {
    0.9
}
fn default_user_agent() -> String {
    format!("recall-index/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_identifier_prefix_weight")]
    pub identifier_prefix_weight: f64,
    #[serde(default = "default_brand_weight")]
    pub brand_weight: f64,
    #[serde(default = "default_name_weight")]
    pub name_weight: f64,
    /// Upper bound on candidates pulled from the similarity index per query.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            identifier_prefix_weight: default_identifier_prefix_weight(),
            brand_weight: default_brand_weight(),
            name_weight: default_name_weight(),
            candidate_k: default_candidate_k(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

fn default_min_confidence() -> f64 {
    0.3
}
fn default_identifier_prefix_weight() -> f64 {
    0.6
}
fn default_brand_weight() -> f64 {
    0.3
}
fn default_name_weight() -> f64 {
    0.45
}
fn default_candidate_k() -> usize {
    500
}
fn default_limit() -> usize {
    20
}
fn default_max_limit() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// One `[agencies.<CODE>]` table.
#[derive(Debug, Deserialize, Clone)]
pub struct AgencyConfig {
    #[serde(flatten)]
    pub source: SourceConfig,
    /// Start a run every N minutes while `recall serve` is up.
    #[serde(default)]
    pub schedule_mins: Option<u64>,
    #[serde(default = "default_max_staleness_hours")]
    pub max_staleness_hours: u64,
}

fn default_max_staleness_hours() -> u64 {
    48
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    Cpsc(CpscSourceConfig),
    Openfda(OpenFdaSourceConfig),
    Json(JsonSourceConfig),
    Rss(RssSourceConfig),
    Html(HtmlSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Cpsc(_) => "cpsc",
            SourceConfig::Openfda(_) => "openfda",
            SourceConfig::Json(_) => "json",
            SourceConfig::Rss(_) => "rss",
            SourceConfig::Html(_) => "html",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CpscSourceConfig {
    #[serde(default = "default_cpsc_url")]
    pub base_url: String,
}

fn default_cpsc_url() -> String {
    "https://www.saferproducts.gov/RestWebServices/Recall".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenFdaSourceConfig {
    #[serde(default = "default_openfda_url")]
    pub base_url: String,
    /// `food`, `drug`, or `device`.
    #[serde(default = "default_openfda_category")]
    pub category: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_openfda_url() -> String {
    "https://api.fda.gov".to_string()
}
fn default_openfda_category() -> String {
    "food".to_string()
}
fn default_page_size() -> usize {
    100
}

/// Generic JSON feed described entirely by configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct JsonSourceConfig {
    /// URL template; `{since}` and `{page}` are substituted per request.
    pub url: String,
    /// Dot path to the record array; empty when the body is the array.
    #[serde(default)]
    pub records_path: String,
    #[serde(default = "default_first_page")]
    pub first_page: u32,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    pub fields: JsonFieldMap,
}

fn default_first_page() -> u32 {
    1
}
fn default_max_pages() -> u32 {
    200
}

/// Dot paths into each record. Only `native_id` and `recall_date` are required.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct JsonFieldMap {
    pub native_id: String,
    pub recall_date: String,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub identifiers: Vec<String>,
    #[serde(default)]
    pub identifier_type: Option<String>,
    #[serde(default)]
    pub hazard: Option<String>,
    #[serde(default)]
    pub remedy: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub risk_category: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    /// Per-record change timestamp used as the watermark; falls back to `recall_date`.
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RssSourceConfig {
    pub url: String,
}

/// CSS selectors for an HTML listing page.
#[derive(Debug, Deserialize, Clone)]
pub struct HtmlSourceConfig {
    pub url: String,
    /// Selects one element per recall.
    pub row_selector: String,
    pub fields: HtmlFieldMap,
}

/// Selectors evaluated within each row. `link` yields the `href` of the
/// first match and doubles as the native id when `native_id` is unset.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HtmlFieldMap {
    #[serde(default)]
    pub native_id: Option<String>,
    pub recall_date: String,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub identifiers: Option<String>,
    #[serde(default)]
    pub hazard: Option<String>,
    #[serde(default)]
    pub remedy: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let ingest = &config.ingest;
    if ingest.batch_size == 0 {
        anyhow::bail!("ingest.batch_size must be > 0");
    }
    if ingest.max_workers == 0 {
        anyhow::bail!("ingest.max_workers must be > 0");
    }
    if ingest.run_timeout_secs == 0 || ingest.request_timeout_secs == 0 {
        anyhow::bail!("ingest timeouts must be > 0");
    }
    if ingest.retry_base_ms > ingest.retry_cap_ms {
        anyhow::bail!("ingest.retry_base_ms must not exceed ingest.retry_cap_ms");
    }
    if !(0.0..=1.0).contains(&ingest.dedupe_similarity) {
        anyhow::bail!("ingest.dedupe_similarity must be in [0.0, 1.0]");
    }

    let matching = &config.matching;
    if !(0.0..=1.0).contains(&matching.min_confidence) {
        anyhow::bail!("matching.min_confidence must be in [0.0, 1.0]");
    }
    for (name, weight) in [
        ("identifier_prefix_weight", matching.identifier_prefix_weight),
        ("brand_weight", matching.brand_weight),
        ("name_weight", matching.name_weight),
    ] {
        if weight <= 0.0 {
            anyhow::bail!("matching.{} must be > 0", name);
        }
    }
    if matching.default_limit == 0 || matching.default_limit > matching.max_limit {
        anyhow::bail!("matching.default_limit must be in [1, max_limit]");
    }
    if matching.candidate_k == 0 {
        anyhow::bail!("matching.candidate_k must be > 0");
    }

    for (code, agency) in &config.agencies {
        if code.trim().is_empty() {
            anyhow::bail!("agency codes must not be empty");
        }
        if agency.schedule_mins == Some(0) {
            anyhow::bail!("agencies.{}.schedule_mins must be > 0", code);
        }
        if let SourceConfig::Openfda(fda) = &agency.source {
            match fda.category.as_str() {
                "food" | "drug" | "device" => {}
                other => anyhow::bail!(
                    "agencies.{}.category: unknown openFDA category '{}'. Must be food, drug, or device.",
                    code,
                    other
                ),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_text)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = parse("[db]\npath = \"x.sqlite\"\n").unwrap();
        assert_eq!(config.ingest.batch_size, 500);
        assert_eq!(config.ingest.max_retries, 5);
        assert_eq!(config.matching.min_confidence, 0.3);
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert!(config.agencies.is_empty());
    }

    #[test]
    fn agencies_are_tagged_by_kind() {
        let config = parse(
            r#"
            [db]
            path = "x.sqlite"

            [agencies.CPSC]
            kind = "cpsc"
            schedule_mins = 360

            [agencies.FDA]
            kind = "openfda"
            category = "drug"

            [agencies.UK_OPSS]
            kind = "json"
            url = "https://example.test/recalls?page={page}"
            records_path = "data"
            [agencies.UK_OPSS.fields]
            native_id = "id"
            recall_date = "published"
            "#,
        )
        .unwrap();

        let cpsc = &config.agencies["CPSC"];
        assert_eq!(cpsc.source.kind(), "cpsc");
        assert_eq!(cpsc.schedule_mins, Some(360));
        assert_eq!(cpsc.max_staleness_hours, 48);

        match &config.agencies["FDA"].source {
            SourceConfig::Openfda(fda) => assert_eq!(fda.category, "drug"),
            other => panic!("unexpected source: {:?}", other),
        }
        match &config.agencies["UK_OPSS"].source {
            SourceConfig::Json(json) => {
                assert_eq!(json.records_path, "data");
                assert_eq!(json.fields.native_id, "id");
                assert_eq!(json.first_page, 1);
            }
            other => panic!("unexpected source: {:?}", other),
        }
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(parse("[db]\npath = \"x\"\n[ingest]\nbatch_size = 0\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[matching]\nmin_confidence = 1.5\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[matching]\nbrand_weight = 0.0\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[agencies.FDA]\nkind = \"openfda\"\ncategory = \"toys\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[agencies.X]\nkind = \"ftp\"\n").is_err());
    }
}
