use std::collections::{HashMap, HashSet};
use std::io::Read;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;

use crate::db::Database;
use crate::models::{NewTaskTemplate, NewTracker, TaskStatus, TimeMode};

/// A single row parsed from a habit-history CSV export.
#[derive(Debug, Clone)]
pub struct HistoryRow {
    pub date: NaiveDate,
    pub tracker: String,
    pub task: String,
    pub status: TaskStatus,
    pub notes: Option<String>,
}

/// Summary of what a history import would do / did.
#[derive(Debug, Clone)]
pub struct HistoryImportSummary {
    pub rows_parsed: usize,
    pub trackers_created: usize,
    pub templates_created: usize,
    pub instances_touched: usize,
    pub tasks_updated: usize,
    pub dates_spanned: usize,
}

/// Parse a habit-history CSV export from any reader.
///
/// Expected header: `Date,Tracker,Task[,Status][,Notes]` — column order is
/// free and names are case-insensitive. A missing Status column means every
/// row is a completion.
pub fn parse_history_csv<R: Read>(reader: R) -> Result<Vec<HistoryRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    let col =
        |name: &str| -> Option<usize> { headers.iter().position(|h| h.eq_ignore_ascii_case(name)) };

    let idx_date = col("Date").context("Missing 'Date' column")?;
    let idx_tracker = col("Tracker").context("Missing 'Tracker' column")?;
    let idx_task = col("Task").context("Missing 'Task' column")?;
    let idx_status = col("Status");
    let idx_notes = col("Notes");

    let mut rows = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record.with_context(|| format!("Failed to read CSV row {}", line + 2))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").to_string();

        let date_str = field(idx_date);
        let date = parse_history_date(&date_str)
            .with_context(|| format!("Row {}: cannot parse date '{date_str}'", line + 2))?;

        let tracker = field(idx_tracker);
        let task = field(idx_task);
        if tracker.is_empty() || task.is_empty() {
            bail!("Row {}: Tracker and Task must not be empty", line + 2);
        }

        let status = match idx_status.map(field).filter(|s| !s.is_empty()) {
            Some(s) => TaskStatus::parse(&s).with_context(|| format!("Row {}", line + 2))?,
            None => TaskStatus::Done,
        };
        let notes = idx_notes.map(field).filter(|n| !n.is_empty());

        rows.push(HistoryRow {
            date,
            tracker,
            task,
            status,
            notes,
        });
    }

    Ok(rows)
}

/// Accepts `YYYY-MM-DD`, `M/D/YYYY`, and `D.M.YYYY`.
fn parse_history_date(s: &str) -> Result<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%m/%d/%Y") {
        return Ok(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d.%m.%Y") {
        return Ok(d);
    }
    bail!("Cannot parse date: '{s}'")
}

/// Import parsed history rows into the database. Trackers and tasks are
/// matched by name (case-insensitive) and created as daily trackers when
/// missing. Completions are applied with the row's date as the completion
/// time, so streaks and goal windows see the historical dates.
///
/// Returns a `HistoryImportSummary`. When `dry_run` is true, no data is
/// written.
pub fn import_history(db: &Database, rows: &[HistoryRow], dry_run: bool) -> Result<HistoryImportSummary> {
    let mut trackers_created: usize = 0;
    let mut templates_created: usize = 0;
    let mut instances_touched: usize = 0;
    let mut tasks_updated: usize = 0;
    let mut dates: HashSet<NaiveDate> = HashSet::new();

    // Caches: lowercase name → local id, to avoid repeated lookups
    let mut tracker_cache: HashMap<String, i64> = HashMap::new();
    let mut template_cache: HashMap<(i64, String), i64> = HashMap::new();
    let mut seen_instances: HashSet<i64> = HashSet::new();

    for row in rows {
        dates.insert(row.date);

        let tracker_key = row.tracker.to_lowercase();
        let tracker_id = if let Some(&id) = tracker_cache.get(&tracker_key) {
            id
        } else if let Some(existing) = db.get_tracker_by_name(&row.tracker)? {
            tracker_cache.insert(tracker_key, existing.id);
            existing.id
        } else if dry_run {
            trackers_created += 1;
            tracker_cache.insert(tracker_key, 0);
            0 // placeholder
        } else {
            let tracker = db.insert_tracker(&NewTracker {
                name: row.tracker.clone(),
                time_mode: TimeMode::Daily,
                week_start: 0,
            })?;
            tracker_cache.insert(tracker_key, tracker.id);
            trackers_created += 1;
            tracker.id
        };

        let template_key = (tracker_id, row.task.to_lowercase());
        let template_id = if let Some(&id) = template_cache.get(&template_key) {
            id
        } else {
            // A placeholder tracker id means the tracker itself is dry-run
            // only; there is nothing to look up yet.
            let existing = if tracker_id == 0 {
                None
            } else {
                db.find_template(tracker_id, &row.task)?
            };
            if let Some(existing) = existing {
                template_cache.insert(template_key, existing.id);
                existing.id
            } else if dry_run {
                templates_created += 1;
                template_cache.insert(template_key, 0);
                0 // placeholder
            } else {
                let template = db.insert_template(&NewTaskTemplate {
                    tracker_id,
                    description: row.task.clone(),
                    category: None,
                    weight: 1,
                    points: 0,
                    include_in_goal: true,
                    time_of_day: None,
                })?;
                template_cache.insert(template_key, template.id);
                templates_created += 1;
                template.id
            }
        };

        if !dry_run {
            let tracker = db.get_tracker(tracker_id)?;
            let instance = db.get_or_create_instance(&tracker, row.date)?;
            if seen_instances.insert(instance.id) {
                instances_touched += 1;
            }
            // Templates can appear mid-history, after the instance was
            // materialized without them
            let template = db.get_template(template_id)?;
            let task = db.ensure_task_instance(instance.id, &template)?;

            let when = format!("{}T12:00:00+00:00", row.date.format("%Y-%m-%d"));
            db.toggle_task(task.id, row.status, &when)?;
            if let Some(notes) = &row.notes {
                db.set_task_notes(task.id, Some(notes))?;
            }
        }
        tasks_updated += 1;
    }

    Ok(HistoryImportSummary {
        rows_parsed: rows.len(),
        trackers_created,
        templates_created,
        instances_touched: if dry_run { dates.len() } else { instances_touched },
        tasks_updated,
        dates_spanned: dates.len(),
    })
}
