use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use tally_core::models::GoalStatus;
use tally_core::service::{ChannelSink, NotificationEvent, TrackerService};

use super::helpers::{parse_date, resolve_goal, resolve_tracker, truncate};

pub(crate) fn cmd_goal_add(
    svc: &TrackerService,
    title: &str,
    target: f64,
    unit: Option<String>,
    by: Option<String>,
    priority: i64,
    json: bool,
) -> Result<()> {
    let target_date = by.map(|s| parse_date(Some(s))).transpose()?;
    let goal = svc.create_goal(title, target, unit, target_date, priority)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&goal)?);
    } else {
        print!("Created goal #{} '{}' (target {})", goal.id, goal.title, goal.target_value);
        if let Some(td) = &goal.target_date {
            print!(" by {td}");
        }
        println!();
    }
    Ok(())
}

pub(crate) fn cmd_goal_list(svc: &TrackerService, json: bool) -> Result<()> {
    let goals = svc.list_goals()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&goals)?);
        return Ok(());
    }
    if goals.is_empty() {
        eprintln!("No goals. Create one with `tally goal add <title> <target>`.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct GoalRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Goal")]
        title: String,
        #[tabled(rename = "Progress")]
        progress: String,
        #[tabled(rename = "Status")]
        status: &'static str,
        #[tabled(rename = "By")]
        by: String,
    }

    let rows: Vec<GoalRow> = goals
        .iter()
        .map(|g| GoalRow {
            id: g.id,
            title: truncate(&g.title, 30),
            progress: match &g.unit {
                Some(unit) => format!("{:.1}/{:.1} {unit}", g.current_value, g.target_value),
                None => format!("{:.1}/{:.1}", g.current_value, g.target_value),
            },
            status: g.status.as_str(),
            by: g.target_date.clone().unwrap_or_default(),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_goal_map(
    svc: &TrackerService,
    goal: &str,
    tracker: &str,
    task: &str,
    weight: f64,
    json: bool,
) -> Result<()> {
    let goal = resolve_goal(svc, goal)?;
    let tracker = resolve_tracker(svc, tracker)?;
    let template = svc
        .list_tasks(tracker.id)?
        .into_iter()
        .find(|t| t.description.eq_ignore_ascii_case(task))
        .ok_or_else(|| anyhow::anyhow!("No task '{task}' in '{}'", tracker.name))?;

    let mapping = svc.map_task_to_goal(goal.id, template.id, weight)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&mapping)?);
    } else {
        println!(
            "'{}' now feeds '{}' (weight {})",
            template.description, goal.title, mapping.contribution_weight
        );
    }
    // Pick up completions that happened before the mapping existed
    svc.recompute_goal(goal.id)?;
    Ok(())
}

pub(crate) fn cmd_goal_unmap(
    svc: &TrackerService,
    goal: &str,
    tracker: &str,
    task: &str,
    json: bool,
) -> Result<()> {
    let goal = resolve_goal(svc, goal)?;
    let tracker = resolve_tracker(svc, tracker)?;
    let template = svc
        .list_tasks(tracker.id)?
        .into_iter()
        .find(|t| t.description.eq_ignore_ascii_case(task))
        .ok_or_else(|| anyhow::anyhow!("No task '{task}' in '{}'", tracker.name))?;

    let removed = svc.unmap_task_from_goal(goal.id, template.id)?;
    svc.recompute_goal(goal.id)?;
    if json {
        println!("{{\"removed\":{removed}}}");
    } else if removed {
        println!("'{}' no longer feeds '{}'", template.description, goal.title);
    } else {
        eprintln!("'{}' was not mapped to '{}'", template.description, goal.title);
    }
    Ok(())
}

pub(crate) fn cmd_goal_progress(svc: &TrackerService, goal: &str, json: bool) -> Result<()> {
    let goal = resolve_goal(svc, goal)?;
    let progress = svc.recompute_goal(goal.id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
    } else {
        println!(
            "'{}': {:.1}/{:.1} ({})",
            goal.title,
            progress.current_value,
            goal.target_value,
            progress.status.as_str()
        );
    }
    Ok(())
}

pub(crate) fn cmd_goal_target(
    svc: &TrackerService,
    goal: &str,
    target: f64,
    json: bool,
) -> Result<()> {
    let goal = resolve_goal(svc, goal)?;
    let (tx, rx) = std::sync::mpsc::channel();
    let progress = svc.set_goal_target(goal.id, target, &ChannelSink::new(tx))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
    } else {
        println!(
            "'{}' target is now {target}: {:.1}/{target} ({})",
            goal.title,
            progress.current_value,
            progress.status.as_str()
        );
    }
    for event in rx.try_iter() {
        if let NotificationEvent::GoalAchieved { title, .. } = event {
            eprintln!("Goal achieved: {title}");
        }
    }
    Ok(())
}

pub(crate) fn cmd_goal_set_status(
    svc: &TrackerService,
    goal: &str,
    status: GoalStatus,
    json: bool,
) -> Result<()> {
    let goal = resolve_goal(svc, goal)?;
    let goal = svc.set_goal_status(goal.id, status)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&goal)?);
    } else {
        println!("'{}' is now {}", goal.title, goal.status.as_str());
    }
    Ok(())
}

pub(crate) fn cmd_goal_rm(svc: &TrackerService, goal: &str, json: bool) -> Result<()> {
    let goal = resolve_goal(svc, goal)?;
    svc.delete_goal(goal.id)?;
    if json {
        println!("{{\"deleted\":{}}}", goal.id);
    } else {
        println!("Deleted goal '{}'", goal.title);
    }
    Ok(())
}
