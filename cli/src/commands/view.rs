use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use tally_core::models::RangeOptions;
use tally_core::service::TrackerService;

use super::helpers::{parse_date, print_instance_views, resolve_tracker};

pub(crate) fn cmd_today(svc: &TrackerService, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let views = svc.day_overview(date)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }
    if views.is_empty() {
        eprintln!("No active trackers. Create one with `tally track add <name>`.");
        return Ok(());
    }
    let mut named = Vec::new();
    for view in views {
        let tracker = svc.get_tracker(view.instance.tracker_id)?;
        named.push((tracker.name, view));
    }
    print_instance_views(&named);
    Ok(())
}

pub(crate) fn cmd_streak(
    svc: &TrackerService,
    tracker: &str,
    as_of: Option<String>,
    threshold: Option<i64>,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, tracker)?;
    let as_of = as_of.map(|s| parse_date(Some(s))).transpose()?;
    let streak = svc.compute_streak(tracker.id, as_of, threshold)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&streak)?);
    } else {
        println!(
            "'{}': current streak {}, longest {}",
            tracker.name, streak.current, streak.longest
        );
        if let Some(last) = &streak.last_meeting_date {
            println!("Last qualifying period: {last}");
        }
    }
    Ok(())
}

pub(crate) fn cmd_history(
    svc: &TrackerService,
    tracker: &str,
    days: i64,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, tracker)?;
    let stats = svc.tracker_history(tracker.id, days)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    if stats.is_empty() {
        eprintln!("No history for '{}' in the last {days} days.", tracker.name);
        return Ok(());
    }

    #[derive(Tabled)]
    struct StatRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Done")]
        done: i64,
        #[tabled(rename = "Total")]
        total: i64,
        #[tabled(rename = "Rate")]
        rate: String,
    }

    let rows: Vec<StatRow> = stats
        .iter()
        .map(|s| StatRow {
            date: s.tracking_date.clone(),
            done: s.done_count,
            total: s.total_count,
            rate: format!("{:.0}%", s.completion_rate),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_backfill(
    svc: &TrackerService,
    tracker: &str,
    from: String,
    to: Option<String>,
    mark_missed: bool,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, tracker)?;
    let start = parse_date(Some(from))?;
    let end = parse_date(to)?;
    let report = svc.generate_range(
        tracker.id,
        start,
        end,
        RangeOptions {
            mark_missed_for_past: mark_missed,
        },
    )?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "'{}': created {} period(s), {} already existed",
            tracker.name, report.created, report.existing
        );
    }
    Ok(())
}
