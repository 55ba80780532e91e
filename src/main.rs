use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::info;

use linkage_lib::config::MatchingConfig;
use linkage_lib::service::{
    LinkageService, StartEnhancedAssociationRequest, StartMatchTaskRequest,
};
use linkage_lib::store::db_connect::{connect, get_pool_status, load_env_from_file};
use linkage_lib::store::{schema, units};
use linkage_lib::tasks::TaskStatus;

async fn get_memory_usage() -> u64 {
    use sysinfo::System;
    let mut sys = System::new_all();
    sys.refresh_memory();
    sys.used_memory() / (1024 * 1024)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    info!("Starting unit linkage pipeline");
    load_env_from_file(".env")?;

    let config = MatchingConfig::from_env();
    let pool = connect().await.context("Failed to connect to database")?;

    schema::ensure_schema(&pool)
        .await
        .context("Failed to ensure schema")?;
    for table in ["inspection_units", "supervision_units"] {
        let refreshed = units::refresh_normalized_columns(&pool, table)
            .await
            .with_context(|| format!("Failed to refresh normalized columns on {table}"))?;
        if refreshed > 0 {
            info!("Refreshed normalized columns for {} {} rows", refreshed, table);
        }
    }

    let progress_enabled = config.progress_enabled;
    let service = LinkageService::new(pool.clone(), config)
        .await
        .context("Failed to construct linkage service")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("associate") => {
            let summary = service
                .start_enhanced_association(StartEnhancedAssociationRequest {
                    strategy: args.get(1).cloned(),
                    clear_existing: args.iter().any(|a| a == "--clear"),
                })
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            info!(
                "Enhanced association complete: {} groups written",
                summary.groups_written
            );
        }
        mode => {
            let mode = mode.unwrap_or("incremental").to_string();
            run_matching(&service, mode, progress_enabled).await?;
        }
    }

    let stats = service
        .get_statistics()
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("=== Linkage Summary ===");
    info!("Total results: {}", stats.total_results);
    info!(
        "Matched: {} (rate {:.1}%)",
        stats.matched_results,
        stats.match_rate * 100.0
    );
    for (match_type, count) in &stats.by_match_type {
        info!("  {}: {}", match_type, count);
    }
    for (status, count) in &stats.by_review_status {
        info!("  review {}: {}", status, count);
    }
    info!(
        "Associations: {} groups, avg quality {:.3}",
        stats.association_groups, stats.association_avg_quality
    );

    let (pool_size, available) = get_pool_status(service.pool());
    info!(
        "Final DB pool status: total {}, available {}",
        pool_size, available
    );
    info!("Final memory usage: {} MB", get_memory_usage().await);
    info!("Pipeline completed successfully!");
    Ok(())
}

async fn run_matching(
    service: &LinkageService,
    mode: String,
    progress_enabled: bool,
) -> Result<()> {
    let started = service
        .start_match_task(StartMatchTaskRequest {
            mode,
            ..StartMatchTaskRequest::default()
        })
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    info!("Match task started: {}", started.task_id);

    let multi_progress = progress_enabled.then(MultiProgress::new);
    let bar = multi_progress.as_ref().map(|mp| {
        let pb = mp.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
                )
                .unwrap()
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        pb.set_message("Matching...");
        pb
    });

    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let report = service
            .get_task_progress(&started.task_id)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        if let Some(pb) = &bar {
            pb.set_length(report.total);
            pb.set_position(report.processed);
            let eta = report
                .estimated_remaining_seconds
                .map(|s| format!(", ETA {:.0}s", s))
                .unwrap_or_default();
            pb.set_message(format!(
                "{} matched ({:.1}% rate{})",
                report.matched,
                report.match_rate * 100.0,
                eta
            ));
        }

        if report.status.is_terminal() {
            if let Some(pb) = &bar {
                pb.finish_with_message(format!("Task {}", report.status.as_str()));
            }
            info!(
                "Task {}: {} — processed {}, matched {}, skipped {}, errored {} ({:.1}s)",
                report.task_id,
                report.status.as_str(),
                report.processed,
                report.matched,
                report.skipped,
                report.errored,
                report.elapsed_seconds
            );
            if report.status == TaskStatus::Error {
                anyhow::bail!(
                    "match task failed: {}",
                    report.error_message.unwrap_or_else(|| "unknown cause".into())
                );
            }
            break;
        }
    }
    Ok(())
}
