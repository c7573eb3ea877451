use anyhow::Result;

use crate::agencies::{self, KNOWN_AGENCIES};
use crate::config::Config;
use crate::models::AgencyCode;

/// Print configured agencies, or the whole known-agency catalogue with `catalogue`.
pub fn list_agencies(config: &Config, catalogue: bool) -> Result<()> {
    if catalogue {
        println!("{:<18} {:<7} NAME", "AGENCY", "REGION");
        for info in KNOWN_AGENCIES {
            let marker = if config.agencies.keys().any(|c| AgencyCode::new(c).as_str() == info.code) {
                "*"
            } else {
                " "
            };
            println!("{}{:<17} {:<7} {}", marker, info.code, info.region, info.name);
        }
        return Ok(());
    }

    if config.agencies.is_empty() {
        println!("No agencies configured. Add [agencies.<CODE>] tables to the config.");
        return Ok(());
    }

    println!(
        "{:<18} {:<8} {:<9} {:>9} NAME",
        "AGENCY", "KIND", "SCHEDULE", "MAX AGE"
    );
    for (code, agency) in &config.agencies {
        let code = AgencyCode::new(code);
        let schedule = agency
            .schedule_mins
            .map(|mins| format!("{}m", mins))
            .unwrap_or_else(|| "manual".to_string());
        let name = agencies::lookup(&code)
            .map(|info| info.name)
            .unwrap_or("(not in catalogue)");
        println!(
            "{:<18} {:<8} {:<9} {:>8}h {}",
            code,
            agency.source.kind(),
            schedule,
            agency.max_staleness_hours,
            name
        );
    }

    Ok(())
}
