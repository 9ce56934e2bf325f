use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use tally_core::models::TrackerStatus;
use tally_core::service::TrackerService;

use super::helpers::{parse_week_start, resolve_tracker, truncate};

pub(crate) fn cmd_track_add(
    svc: &TrackerService,
    name: &str,
    mode: &str,
    week_start: Option<&str>,
    json: bool,
) -> Result<()> {
    let week_start = week_start.map(parse_week_start).transpose()?;
    let tracker = svc.create_tracker(name, mode, week_start)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tracker)?);
    } else {
        println!(
            "Created tracker #{} '{}' ({})",
            tracker.id,
            tracker.name,
            tracker.time_mode.as_str()
        );
    }
    Ok(())
}

pub(crate) fn cmd_track_list(svc: &TrackerService, all: bool, json: bool) -> Result<()> {
    let trackers = svc.list_trackers(all)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&trackers)?);
        return Ok(());
    }
    if trackers.is_empty() {
        eprintln!("No trackers. Create one with `tally track add <name>`.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct TrackerRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Mode")]
        mode: &'static str,
        #[tabled(rename = "Status")]
        status: &'static str,
        #[tabled(rename = "Tasks")]
        tasks: usize,
    }

    let mut rows = Vec::new();
    for tracker in &trackers {
        rows.push(TrackerRow {
            id: tracker.id,
            name: truncate(&tracker.name, 30),
            mode: tracker.time_mode.as_str(),
            status: tracker.status.as_str(),
            tasks: svc.list_tasks(tracker.id)?.len(),
        });
    }
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_track_set_status(
    svc: &TrackerService,
    name: &str,
    status: TrackerStatus,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, name)?;
    let tracker = svc.set_tracker_status(tracker.id, status)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tracker)?);
    } else {
        println!("'{}' is now {}", tracker.name, tracker.status.as_str());
    }
    Ok(())
}

pub(crate) fn cmd_track_rm(svc: &TrackerService, name: &str, json: bool) -> Result<()> {
    let tracker = resolve_tracker(svc, name)?;
    svc.delete_tracker(tracker.id)?;
    if json {
        println!("{{\"deleted\":{}}}", tracker.id);
    } else {
        println!("Deleted tracker '{}' and its history", tracker.name);
    }
    Ok(())
}

pub(crate) fn cmd_track_share(
    svc: &TrackerService,
    name: &str,
    max_uses: Option<i64>,
    expires: Option<String>,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, name)?;
    let link = svc.create_share_link(tracker.id, max_uses, expires.as_deref())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&link)?);
    } else {
        print!("Share token for '{}': {}", tracker.name, link.token);
        if let Some(max) = link.max_uses {
            print!("  (max {max} uses)");
        }
        println!();
    }
    Ok(())
}
