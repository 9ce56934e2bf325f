use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use tally_core::models::{NewTaskTemplate, TaskStatus, UpdateTaskTemplate};
use tally_core::service::{ChannelSink, NotificationEvent, TrackerService};

use super::helpers::{parse_date, resolve_task_instance, resolve_tracker, truncate};

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_task_add(
    svc: &TrackerService,
    tracker: &str,
    description: &str,
    category: Option<String>,
    weight: i64,
    points: i64,
    no_goal: bool,
    time_of_day: Option<String>,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, tracker)?;
    let template = svc.add_task(&NewTaskTemplate {
        tracker_id: tracker.id,
        description: description.to_string(),
        category,
        weight,
        points,
        include_in_goal: !no_goal,
        time_of_day,
    })?;
    if json {
        println!("{}", serde_json::to_string_pretty(&template)?);
    } else {
        println!(
            "Added task #{} '{}' to '{}'",
            template.id, template.description, tracker.name
        );
    }
    Ok(())
}

pub(crate) fn cmd_task_list(svc: &TrackerService, tracker: &str, json: bool) -> Result<()> {
    let tracker = resolve_tracker(svc, tracker)?;
    let templates = svc.list_tasks(tracker.id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(());
    }
    if templates.is_empty() {
        eprintln!("No tasks in '{}'.", tracker.name);
        return Ok(());
    }

    #[derive(Tabled)]
    struct TemplateRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Task")]
        description: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Weight")]
        weight: i64,
        #[tabled(rename = "Pts")]
        points: i64,
        #[tabled(rename = "Goal?")]
        in_goal: &'static str,
    }

    let rows: Vec<TemplateRow> = templates
        .iter()
        .map(|t| TemplateRow {
            id: t.id,
            description: truncate(&t.description, 35),
            category: t.category.clone().unwrap_or_default(),
            weight: t.weight,
            points: t.points,
            in_goal: if t.include_in_goal { "yes" } else { "no" },
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_task_edit(
    svc: &TrackerService,
    id: i64,
    description: Option<String>,
    category: Option<String>,
    weight: Option<i64>,
    points: Option<i64>,
    include_in_goal: Option<bool>,
    time_of_day: Option<String>,
    json: bool,
) -> Result<()> {
    let update = UpdateTaskTemplate {
        description,
        category: category.map(Some),
        weight,
        points,
        include_in_goal,
        time_of_day: time_of_day.map(Some),
    };
    let template = svc.update_task(id, &update)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&template)?);
    } else {
        println!("Updated task #{} '{}'", template.id, template.description);
        eprintln!("Note: existing days keep their original task; only new days pick this up.");
    }
    Ok(())
}

pub(crate) fn cmd_task_rm(svc: &TrackerService, id: i64, json: bool) -> Result<()> {
    svc.delete_task(id)?;
    if json {
        println!("{{\"deleted\":{id}}}");
    } else {
        println!("Removed task #{id}; its history stays visible");
    }
    Ok(())
}

/// Toggle a task's status on a given day. Goal and streak notifications are
/// drained from the channel after the toggle and printed.
pub(crate) fn cmd_log(
    svc: &TrackerService,
    tracker: &str,
    task: &str,
    status: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, tracker)?;
    let date = parse_date(date)?;
    let status = TaskStatus::parse(status)?;
    let task = resolve_task_instance(svc, &tracker, task, date)?;

    let (tx, rx) = std::sync::mpsc::channel();
    let sink = ChannelSink::new(tx);
    let outcome = svc.toggle_task(task.id, status, &sink)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!(
            "'{}' on {date}: {} → {}",
            task.description,
            outcome.old_status.as_str(),
            outcome.new_status.as_str()
        );
    }
    for event in rx.try_iter() {
        match event {
            NotificationEvent::GoalAchieved { title, .. } => {
                eprintln!("Goal achieved: {title}");
            }
            NotificationEvent::StreakMilestone {
                tracker_name,
                length,
                ..
            } => {
                eprintln!("{tracker_name}: {length}-period streak!");
            }
        }
    }
    Ok(())
}

pub(crate) fn cmd_note(
    svc: &TrackerService,
    tracker: &str,
    task: &str,
    notes: &str,
    date: Option<String>,
    json: bool,
) -> Result<()> {
    let tracker = resolve_tracker(svc, tracker)?;
    let date = parse_date(date)?;
    let task = resolve_task_instance(svc, &tracker, task, date)?;
    let task = svc.set_task_notes(task.id, Some(notes))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("Noted on '{}' for {date}", task.description);
    }
    Ok(())
}
