//! Run management commands: `recall sync`, `runs`, `run`, `cancel`,
//! `freshness`, and `recover`.
//!
//! `sync` queues one run per requested agency through the orchestrator and
//! blocks until every run reaches a terminal state. Ctrl-C asks the runs to
//! stop at their next batch boundary; committed batches are kept.

use anyhow::{bail, Result};
use futures::future::join_all;
use uuid::Uuid;

use crate::config::Config;
use crate::error::IngestError;
use crate::ingest::{CancelOutcome, FetchFrom, Orchestrator};
use crate::models::{AgencyCode, IngestionRun, RunStatus, Watermark};
use crate::services::Services;
use crate::stats::format_ts_relative;

/// Sync one agency, or every configured agency with `all`.
pub async fn run_sync(
    config: &Config,
    target: &str,
    full: bool,
    since: Option<String>,
) -> Result<()> {
    let from = match (full, since) {
        (true, Some(_)) => bail!("--full and --since cannot be combined"),
        (true, None) => FetchFrom::Full,
        (false, Some(since)) => FetchFrom::Since(Watermark::parse(&since)),
        (false, None) => FetchFrom::Resume,
    };

    let services = Services::open(config).await?;
    let sync_all = target.eq_ignore_ascii_case("all");
    let agencies: Vec<AgencyCode> = if sync_all {
        services.orchestrator.registry().agencies().cloned().collect()
    } else {
        vec![AgencyCode::new(target)]
    };
    if agencies.is_empty() {
        services.close().await;
        bail!("no agencies configured; add an [agencies.<CODE>] table to the config");
    }

    let mut run_ids = Vec::with_capacity(agencies.len());
    for agency in &agencies {
        match services.orchestrator.start_run(agency, from.clone()).await {
            Ok(run_id) => run_ids.push(run_id),
            Err(IngestError::Conflict(_)) if sync_all => {
                println!("sync {}: skipped, a run is already active", agency);
            }
            Err(e) => {
                services.close().await;
                return Err(e.into());
            }
        }
    }

    let orchestrator = &services.orchestrator;
    let results = tokio::select! {
        results = wait_all(orchestrator, &run_ids) => results,
        _ = tokio::signal::ctrl_c() => {
            println!("interrupted; stopping runs at the next batch boundary");
            orchestrator.shutdown();
            wait_all(orchestrator, &run_ids).await
        }
    };

    let mut unsuccessful = 0;
    for result in results {
        let run = match result {
            Ok(run) => run,
            Err(e) => {
                services.close().await;
                return Err(e.into());
            }
        };
        print_summary(&run);
        if run.status != RunStatus::Completed {
            unsuccessful += 1;
        }
    }
    services.close().await;

    if unsuccessful > 0 {
        bail!("{} run(s) did not complete", unsuccessful);
    }
    Ok(())
}

async fn wait_all(
    orchestrator: &Orchestrator,
    run_ids: &[Uuid],
) -> Vec<Result<IngestionRun, IngestError>> {
    join_all(run_ids.iter().map(|id| orchestrator.wait_for_run(*id))).await
}

fn print_summary(run: &IngestionRun) {
    println!("sync {}", run.agency_code);
    println!("  run: {}", run.run_id);
    println!("  fetched: {} records", run.records_fetched);
    println!("  upserted: {}", run.records_upserted);
    println!("  linked duplicates: {}", run.records_linked);
    println!("  skipped (errors): {}", run.records_skipped_errors);
    for skip in &run.error_summary {
        println!("    {}: {}", skip.record_ref, skip.reason);
    }
    if let Some(ref failure) = run.failure {
        println!("  failure: {:?}: {}", failure.class, failure.message);
    }
    match run.watermark_after {
        Some(ref watermark) => println!("  watermark: {}", watermark),
        None => println!("  watermark: (unchanged)"),
    }
    println!("{}", run.status.as_str().to_lowercase());
}

/// Print recent runs, newest first.
pub async fn run_runs(config: &Config, agency: Option<String>, limit: usize) -> Result<()> {
    let services = Services::open(config).await?;
    let agency = agency.map(AgencyCode::new);
    let runs = services
        .orchestrator
        .list_runs(agency.as_ref(), limit)
        .await;
    services.close().await;
    let runs = runs?;

    if runs.is_empty() {
        println!("No runs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16} {:<10} {:>8} {:>8} {:>7} {:>7}   {}",
        "RUN", "AGENCY", "STATUS", "FETCHED", "UPSERTED", "LINKED", "SKIPPED", "CREATED"
    );
    for run in &runs {
        println!(
            "{:<36}  {:<16} {:<10} {:>8} {:>8} {:>7} {:>7}   {}",
            run.run_id,
            run.agency_code,
            run.status,
            run.records_fetched,
            run.records_upserted,
            run.records_linked,
            run.records_skipped_errors,
            format_ts_relative(run.created_at)
        );
    }
    Ok(())
}

/// Print one run as JSON.
pub async fn run_run_status(config: &Config, id: &str) -> Result<()> {
    let run_id = parse_run_id(id)?;
    let services = Services::open(config).await?;
    let run = services.orchestrator.get_run_status(run_id).await;
    services.close().await;
    println!("{}", serde_json::to_string_pretty(&run?)?);
    Ok(())
}

pub async fn run_cancel(config: &Config, id: &str) -> Result<()> {
    let run_id = parse_run_id(id)?;
    let services = Services::open(config).await?;
    let outcome = services.orchestrator.cancel_run(run_id).await;
    services.close().await;

    match outcome? {
        CancelOutcome::Cancelled => println!("run {} cancelled", run_id),
        CancelOutcome::CancelRequested => {
            println!("run {}: cancellation requested", run_id)
        }
        CancelOutcome::AlreadyFinished(status) => {
            println!("run {} already finished ({})", run_id, status)
        }
    }
    Ok(())
}

pub async fn run_freshness(config: &Config, agency: Option<String>) -> Result<()> {
    let services = Services::open(config).await?;
    let agency = agency.map(AgencyCode::new);
    let report = services.orchestrator.get_freshness(agency.as_ref()).await;
    services.close().await;
    let report = report?;

    if report.is_empty() {
        println!("No agencies configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<20} {:>9} {:<6} {}",
        "AGENCY", "LAST SUCCESS", "MAX AGE", "STALE", "LAST RUN"
    );
    for entry in &report {
        let last_success = entry
            .last_success_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string());
        let last_run = entry
            .last_run_status
            .map(|status| status.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<20} {:>8}h {:<6} {}",
            entry.agency_code,
            last_success,
            entry.max_staleness_hours,
            if entry.stale { "yes" } else { "no" },
            last_run
        );
    }
    Ok(())
}

/// Fail runs left active by a process that exited without finishing them.
pub async fn run_recover(config: &Config) -> Result<()> {
    let services = Services::open(config).await?;
    let orphans = services.orchestrator.recover_orphans().await;
    services.close().await;
    let orphans = orphans?;

    if orphans.is_empty() {
        println!("No orphaned runs.");
    } else {
        for run_id in &orphans {
            println!("failed orphaned run {}", run_id);
        }
    }
    Ok(())
}

fn parse_run_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| anyhow::anyhow!("invalid run id: {}", id))
}
