//! Recall retrieval by ID.
//!
//! Prints one canonical recall with its identifiers and duplicate links.
//! The HTTP server exposes the same data at `GET /recalls/{id}`.

use anyhow::Result;

use crate::config::Config;
use crate::matching::RecallDetail;
use crate::services::Services;

/// CLI entry point: fetch the recall and print it to stdout.
pub async fn run_get(config: &Config, recall_id: &str) -> Result<()> {
    let services = Services::open(config).await?;
    let detail = services.matching.get_recall(recall_id).await;
    services.close().await;
    print_detail(&detail?);
    Ok(())
}

fn print_detail(detail: &RecallDetail) {
    let recall = &detail.recall;

    println!("--- Recall ---");
    println!("id:           {}", recall.recall_id);
    println!("agency:       {} ({})", recall.agency_code, recall.agency_native_id);
    println!("product:      {}", display_or(&recall.product_name, "(unnamed)"));
    println!("brand:        {}", display_or(&recall.brand, "-"));
    println!("model:        {}", display_or(&recall.model_number, "-"));
    println!("date:         {}", recall.recall_date);
    println!("region:       {}", recall.region);
    println!("severity:     {}", recall.severity.as_str());
    if !recall.risk_category.is_empty() {
        println!("risk:         {}", recall.risk_category);
    }
    if let Some(ref url) = recall.source_url {
        println!("source_url:   {}", url);
    }
    println!("first_seen:   {}", recall.first_seen_at.format("%Y-%m-%dT%H:%M:%SZ"));
    println!("last_updated: {}", recall.last_updated_at.format("%Y-%m-%dT%H:%M:%SZ"));
    println!();

    println!("--- Hazard ---");
    println!("{}", display_or(&recall.hazard_description, "(none given)"));
    println!();

    if !recall.remedy.is_empty() {
        println!("--- Remedy ---");
        println!("{}", recall.remedy);
        println!();
    }

    println!("--- Identifiers ({}) ---", recall.identifiers.len());
    for identifier in &recall.identifiers {
        println!("{:<8} {}", identifier.id_type.as_str(), identifier.value);
    }
    println!();

    println!("--- Linked duplicates ({}) ---", detail.links.len());
    for link in &detail.links {
        println!(
            "{}  similarity {:.2}",
            link.other(&recall.recall_id),
            link.similarity
        );
    }
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}
