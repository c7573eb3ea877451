//! Index statistics and sync overview.
//!
//! A quick summary of what is indexed: recall, identifier, and duplicate-link
//! counts plus a per-agency breakdown with the last successful sync. Used by
//! `recall stats` to confirm that scheduled syncs are keeping up.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::services::Services;

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let services = Services::open(config).await?;
    let stats = services.store.stats().await;
    let freshness = services.orchestrator.get_freshness(None).await;
    services.close().await;
    let stats = stats?;
    let freshness = freshness?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Recall Index: Database Stats");
    println!("=============================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Recalls:      {}", stats.recalls);
    println!("  Identifiers:  {}", stats.identifiers);
    println!("  Linked pairs: {}", stats.duplicate_links);

    // Agencies with data, plus configured agencies that have not synced yet.
    let mut rows: BTreeMap<String, (u64, Option<DateTime<Utc>>)> = BTreeMap::new();
    for count in &stats.by_agency {
        rows.insert(count.agency_code.to_string(), (count.recalls, None));
    }
    for entry in &freshness {
        rows.entry(entry.agency_code.to_string()).or_insert((0, None)).1 = entry.last_success_at;
    }

    if !rows.is_empty() {
        println!();
        println!("  By agency:");
        println!("  {:<24} {:>8}   {}", "AGENCY", "RECALLS", "LAST SYNC");
        println!("  {}", "-".repeat(52));

        for (agency, (recalls, last_sync)) in &rows {
            let sync_display = match last_sync {
                Some(at) => format_ts_relative(*at),
                None => "never".to_string(),
            };
            println!("  {:<24} {:>8}   {}", agency, recalls, sync_display);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a timestamp relative to now (e.g. "3 hours ago").
pub fn format_ts_relative(at: DateTime<Utc>) -> String {
    relative_to(at, Utc::now())
}

fn relative_to(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - at).num_seconds();

    if delta < 0 {
        return at.format("%Y-%m-%d %H:%M").to_string();
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn relative_times() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(relative_to(now - Duration::seconds(5), now), "just now");
        assert_eq!(relative_to(now - Duration::minutes(1), now), "1 min ago");
        assert_eq!(relative_to(now - Duration::hours(3), now), "3 hours ago");
        assert_eq!(relative_to(now - Duration::days(2), now), "2 days ago");
        assert_eq!(
            relative_to(now - Duration::days(90), now),
            "2024-03-03 12:00"
        );
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
