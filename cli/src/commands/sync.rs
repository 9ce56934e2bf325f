use std::path::Path;

use anyhow::{Context, Result};

use tally_core::models::{ExportData, SyncRequest};
use tally_core::service::TrackerService;

/// Write the full database as a JSON payload another device can import.
pub(crate) fn cmd_export(svc: &TrackerService, file: &Path, json: bool) -> Result<()> {
    let data = svc.export_all()?;
    let serialized = serde_json::to_string_pretty(&data)?;
    std::fs::write(file, serialized)
        .with_context(|| format!("Failed to write {}", file.display()))?;
    if json {
        println!(
            "{{\"trackers\":{},\"task_instances\":{}}}",
            data.trackers.len(),
            data.task_instances.len()
        );
    } else {
        println!(
            "Exported {} tracker(s), {} task record(s) to {}",
            data.trackers.len(),
            data.task_instances.len(),
            file.display()
        );
    }
    Ok(())
}

pub(crate) fn cmd_sync_import(svc: &TrackerService, file: &Path, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let data: ExportData =
        serde_json::from_str(&raw).with_context(|| format!("Invalid export file {}", file.display()))?;
    let summary = svc.import_all(&data)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "Imported: {} tracker(s), {} task template(s), {} period(s), {} task record(s), {} goal(s)",
            summary.trackers_imported,
            summary.templates_imported,
            summary.instances_imported,
            summary.task_instances_imported,
            summary.goals_imported
        );
        if summary.tombstones_processed > 0 {
            println!("Applied {} deletion(s)", summary.tombstones_processed);
        }
    }
    Ok(())
}

/// Reconcile against a peer's change payload (a `SyncRequest` JSON file) and
/// write back the answer the peer should apply.
pub(crate) fn cmd_sync_reconcile(
    svc: &TrackerService,
    file: &Path,
    out: Option<&Path>,
    json: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let request: SyncRequest =
        serde_json::from_str(&raw).with_context(|| format!("Invalid sync file {}", file.display()))?;
    let report = svc.reconcile_sync(&request)?;

    if let Some(out) = out {
        std::fs::write(out, serde_json::to_string_pretty(&report.changes)?)
            .with_context(|| format!("Failed to write {}", out.display()))?;
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Applied {} change(s), {} conflict(s)",
            report.applied.len(),
            report.conflicts.len()
        );
        for conflict in &report.conflicts {
            let group = conflict
                .field_group
                .as_deref()
                .map(|g| format!(" ({g})"))
                .unwrap_or_default();
            eprintln!("  conflict: {} {}{group} — server copy kept", conflict.table, conflict.uuid);
        }
        if let Some(out) = out {
            println!("Server changes written to {}", out.display());
        }
    }
    Ok(())
}

pub(crate) fn cmd_import_history(
    svc: &TrackerService,
    file: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let csv_data = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let summary = svc.import_history_csv(&csv_data, dry_run)?;
    let prefix = if dry_run { "Would import" } else { "Imported" };
    if json {
        println!(
            "{{\"rows\":{},\"trackers_created\":{},\"templates_created\":{},\"tasks_updated\":{},\"dry_run\":{dry_run}}}",
            summary.rows_parsed, summary.trackers_created, summary.templates_created, summary.tasks_updated
        );
    } else {
        println!(
            "{prefix} {} row(s): {} new tracker(s), {} new task(s), {} completion(s) across {} day(s)",
            summary.rows_parsed,
            summary.trackers_created,
            summary.templates_created,
            summary.tasks_updated,
            summary.dates_spanned
        );
    }
    Ok(())
}
