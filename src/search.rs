//! Search commands: `recall lookup`, `recall similar`, and `recall search`.
//!
//! Thin printers over [`MatchingEngine`](crate::matching::MatchingEngine).
//! Ranking, thresholds, and paging live there.

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::config::Config;
use crate::matching::{LookupOutcome, PageRequest, RecallMatch, SearchPage, SimilarQuery};
use crate::models::AgencyCode;
use crate::services::Services;
use crate::store::SearchFilters;

/// Exact identifier lookup.
pub async fn run_lookup(config: &Config, code: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let outcome = services.matching.lookup_by_identifier(code).await;
    services.close().await;

    match outcome? {
        LookupOutcome::ExactMatch(matches) => {
            println!("{} recall(s) carry {}", matches.len(), code.trim());
            print_matches(&matches, 0);
        }
        LookupOutcome::NoExactMatch => println!("No exact match."),
    }
    Ok(())
}

pub async fn run_similar(config: &Config, query: SimilarQuery, page: PageRequest) -> Result<()> {
    let services = Services::open(config).await?;
    let result = services.matching.search_similar(&query, &page).await;
    services.close().await;
    print_page(&result?, page.offset);
    Ok(())
}

pub struct TextSearchArgs {
    pub agency: Option<String>,
    pub region: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

pub async fn run_search(
    config: &Config,
    query: &str,
    args: TextSearchArgs,
    page: PageRequest,
) -> Result<()> {
    let filters = SearchFilters {
        agency: args.agency.as_deref().map(AgencyCode::new),
        region: args.region,
        date_from: parse_date("--from", args.from.as_deref())?,
        date_to: parse_date("--to", args.to.as_deref())?,
    };

    let services = Services::open(config).await?;
    let result = services.matching.search_text(query, &filters, &page).await;
    services.close().await;
    print_page(&result?, page.offset);
    Ok(())
}

fn parse_date(flag: &str, value: Option<&str>) -> Result<Option<NaiveDate>> {
    value
        .map(|v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .with_context(|| format!("{} must be YYYY-MM-DD, got {}", flag, v))
        })
        .transpose()
}

fn print_page(page: &SearchPage, offset: usize) {
    if page.items.is_empty() {
        println!("No results.");
        return;
    }
    print_matches(&page.items, offset);
    println!();
    println!("showing {} of {} matches", page.items.len(), page.total);
    if let Some(ref cursor) = page.next_cursor {
        println!("next page: --cursor {}", cursor);
    }
}

fn print_matches(matches: &[RecallMatch], offset: usize) {
    for (i, m) in matches.iter().enumerate() {
        let recall = &m.recall;
        let title = if recall.product_name.is_empty() {
            "(unnamed)"
        } else {
            recall.product_name.as_str()
        };
        println!(
            "{}. [{:.2}] {} / {}",
            offset + i + 1,
            m.confidence,
            recall.agency_code,
            title
        );
        println!(
            "    id: {}  date: {}  region: {}  severity: {}",
            recall.recall_id,
            recall.recall_date,
            recall.region,
            recall.severity.as_str()
        );
        if !recall.brand.is_empty() {
            println!("    brand: {}", recall.brand);
        }
        if !recall.hazard_description.is_empty() {
            println!("    hazard: {}", snippet(&recall.hazard_description, 120));
        }
        if !m.linked_recall_ids.is_empty() {
            println!("    linked: {}", m.linked_recall_ids.join(", "));
        }
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_truncates_on_char_boundaries() {
        assert_eq!(snippet("short", 10), "short");
        assert_eq!(snippet("Ünïcödé text here", 7), "Ünïcödé…");
    }

    #[test]
    fn cli_dates_are_validated() {
        assert!(parse_date("--from", Some("03/12/2024")).is_err());
        assert_eq!(
            parse_date("--to", Some("2024-03-12")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 12)
        );
    }
}
