use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use tally_core::models::{Goal, InstanceView, TaskStatus, Tracker};
use tally_core::service::TrackerService;

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

/// Find a tracker by numeric id or (case-insensitive) name.
pub(crate) fn resolve_tracker(svc: &TrackerService, name_or_id: &str) -> Result<Tracker> {
    if let Ok(id) = name_or_id.parse::<i64>() {
        if let Ok(tracker) = svc.get_tracker(id) {
            return Ok(tracker);
        }
    }
    svc.get_tracker_by_name(name_or_id)?
        .with_context(|| format!("No tracker named '{name_or_id}'"))
}

/// Find a goal by numeric id or (case-insensitive) title.
pub(crate) fn resolve_goal(svc: &TrackerService, title_or_id: &str) -> Result<Goal> {
    if let Ok(id) = title_or_id.parse::<i64>() {
        if let Ok(goal) = svc.get_goal(id) {
            return Ok(goal);
        }
    }
    svc.list_goals()?
        .into_iter()
        .find(|g| g.title.eq_ignore_ascii_case(title_or_id))
        .with_context(|| format!("No goal named '{title_or_id}'"))
}

/// Resolve a task instance by tracker, task description, and date, lazily
/// materializing the day's instance.
pub(crate) fn resolve_task_instance(
    svc: &TrackerService,
    tracker: &Tracker,
    task: &str,
    date: NaiveDate,
) -> Result<tally_core::models::TaskInstance> {
    let view = svc.get_or_create_instance(tracker.id, date)?;
    if let Ok(id) = task.parse::<i64>() {
        if let Some(found) = view.tasks.iter().find(|t| t.id == id) {
            return Ok(found.clone());
        }
    }
    view.tasks
        .into_iter()
        .find(|t| t.description.eq_ignore_ascii_case(task))
        .with_context(|| format!("No task '{task}' in '{}' on {date}", tracker.name))
}

pub(crate) fn status_mark(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Todo => "·",
        TaskStatus::InProgress => "~",
        TaskStatus::Done => "✓",
        TaskStatus::Missed => "✗",
        TaskStatus::Skipped => "-",
        TaskStatus::Blocked => "!",
    }
}

pub(crate) fn print_instance_views(views: &[(String, InstanceView)]) {
    #[derive(Tabled)]
    struct TaskRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Tracker")]
        tracker: String,
        #[tabled(rename = "Task")]
        task: String,
        #[tabled(rename = " ")]
        mark: &'static str,
        #[tabled(rename = "Status")]
        status: &'static str,
        #[tabled(rename = "Pts")]
        points: i64,
    }

    let mut rows = Vec::new();
    for (name, view) in views {
        for task in &view.tasks {
            rows.push(TaskRow {
                id: task.id,
                tracker: truncate(name, 24),
                task: truncate(&task.description, 35),
                mark: status_mark(task.status),
                status: task.status.as_str(),
                points: task.points,
            });
        }
    }
    if rows.is_empty() {
        eprintln!("No tasks. Add one with `tally task add <tracker> <description>`.");
        return;
    }

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(5..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    for (name, view) in views {
        if view.total_count > 0 {
            let rate = view.completion_rate;
            println!(
                "{name} ({}): {}/{} done ({rate:.0}%)",
                view.instance.tracking_date, view.done_count, view.total_count
            );
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

pub(crate) fn parse_week_start(s: &str) -> Result<i64> {
    match s.to_lowercase().as_str() {
        "monday" | "mon" | "0" => Ok(0),
        "tuesday" | "tue" | "1" => Ok(1),
        "wednesday" | "wed" | "2" => Ok(2),
        "thursday" | "thu" | "3" => Ok(3),
        "friday" | "fri" | "4" => Ok(4),
        "saturday" | "sat" | "5" => Ok(5),
        "sunday" | "sun" | "6" => Ok(6),
        _ => bail!("Invalid week start '{s}'. Use monday-sunday or 0-6"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_none_is_today() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(None).unwrap(), today);
    }

    #[test]
    fn test_parse_date_keywords() {
        let today = Local::now().date_naive();
        assert_eq!(parse_date(Some("today".to_string())).unwrap(), today);
        assert_eq!(
            parse_date(Some("yesterday".to_string())).unwrap(),
            today - chrono::Duration::days(1)
        );
        assert_eq!(
            parse_date(Some("tomorrow".to_string())).unwrap(),
            today + chrono::Duration::days(1)
        );
    }

    #[test]
    fn test_parse_date_iso() {
        let date = parse_date(Some("2025-01-15".to_string())).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
    }

    #[test]
    fn test_parse_date_invalid() {
        assert!(parse_date(Some("nope".to_string())).is_err());
    }

    #[test]
    fn test_parse_week_start() {
        assert_eq!(parse_week_start("monday").unwrap(), 0);
        assert_eq!(parse_week_start("Sun").unwrap(), 6);
        assert_eq!(parse_week_start("3").unwrap(), 3);
        assert!(parse_week_start("someday").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world this is long", 10), "hello w...");
    }

    #[test]
    fn test_truncate_utf8() {
        assert_eq!(truncate("Müsli und mehr dazu", 10), "Müsli u...");
    }

    #[test]
    fn test_status_mark_covers_all() {
        for status in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::Done,
            TaskStatus::Missed,
            TaskStatus::Skipped,
            TaskStatus::Blocked,
        ] {
            assert!(!status_mark(status).is_empty());
        }
    }

    #[test]
    fn test_resolve_tracker_by_name_and_id() {
        let svc = TrackerService::new_in_memory().unwrap();
        let tracker = svc.create_tracker("Workout", "daily", None).unwrap();
        assert_eq!(resolve_tracker(&svc, "workout").unwrap().id, tracker.id);
        assert_eq!(
            resolve_tracker(&svc, &tracker.id.to_string()).unwrap().id,
            tracker.id
        );
        assert!(resolve_tracker(&svc, "missing").is_err());
    }

    #[test]
    fn test_resolve_goal_by_title() {
        let svc = TrackerService::new_in_memory().unwrap();
        let goal = svc.create_goal("Read 12 books", 12.0, None, None, 0).unwrap();
        assert_eq!(resolve_goal(&svc, "read 12 books").unwrap().id, goal.id);
        assert!(resolve_goal(&svc, "other").is_err());
    }
}
