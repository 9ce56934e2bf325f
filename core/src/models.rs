use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// How a tracker slices time into instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeMode {
    Daily,
    Weekly,
    Monthly,
}

pub const TIME_MODES: &[&str] = &["daily", "weekly", "monthly"];

impl TimeMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TimeMode::Daily => "daily",
            TimeMode::Weekly => "weekly",
            TimeMode::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(TimeMode::Daily),
            "weekly" => Ok(TimeMode::Weekly),
            "monthly" => Ok(TimeMode::Monthly),
            _ => bail!(
                "Invalid time mode '{s}'. Must be one of: {}",
                TIME_MODES.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerStatus {
    Active,
    Paused,
    Archived,
}

impl TrackerStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrackerStatus::Active => "active",
            TrackerStatus::Paused => "paused",
            TrackerStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TrackerStatus::Active),
            "paused" => Ok(TrackerStatus::Paused),
            "archived" => Ok(TrackerStatus::Archived),
            _ => bail!("Invalid tracker status '{s}'. Must be one of: active, paused, archived"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Done,
    Missed,
    Skipped,
    Blocked,
}

pub const TASK_STATUSES: &[&str] =
    &["todo", "in_progress", "done", "missed", "skipped", "blocked"];

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Missed => "missed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" | "in-progress" => Ok(TaskStatus::InProgress),
            "done" => Ok(TaskStatus::Done),
            "missed" => Ok(TaskStatus::Missed),
            "skipped" => Ok(TaskStatus::Skipped),
            "blocked" => Ok(TaskStatus::Blocked),
            _ => bail!(
                "Invalid task status '{s}'. Must be one of: {}",
                TASK_STATUSES.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Achieved,
    Paused,
    Abandoned,
}

impl GoalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GoalStatus::Active => "active",
            GoalStatus::Achieved => "achieved",
            GoalStatus::Paused => "paused",
            GoalStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "active" => Ok(GoalStatus::Active),
            "achieved" => Ok(GoalStatus::Achieved),
            "paused" => Ok(GoalStatus::Paused),
            "abandoned" => Ok(GoalStatus::Abandoned),
            _ => bail!(
                "Invalid goal status '{s}'. Must be one of: active, achieved, paused, abandoned"
            ),
        }
    }
}

// --- Entities ---

#[derive(Debug, Clone, Serialize)]
pub struct Tracker {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub time_mode: TimeMode,
    pub status: TrackerStatus,
    pub week_start: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTracker {
    pub name: String,
    pub time_mode: TimeMode,
    pub week_start: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskTemplate {
    pub id: i64,
    pub uuid: String,
    pub tracker_id: i64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub weight: i64,
    pub points: i64,
    pub include_in_goal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewTaskTemplate {
    pub tracker_id: i64,
    pub description: String,
    pub category: Option<String>,
    pub weight: i64,
    pub points: i64,
    pub include_in_goal: bool,
    pub time_of_day: Option<String>,
}

/// Field-wise template update; `None` leaves a field untouched. The
/// double-`Option` fields distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default)]
pub struct UpdateTaskTemplate {
    pub description: Option<String>,
    pub category: Option<Option<String>>,
    pub weight: Option<i64>,
    pub points: Option<i64>,
    pub include_in_goal: Option<bool>,
    pub time_of_day: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerInstance {
    pub id: i64,
    pub uuid: String,
    pub tracker_id: i64,
    pub tracking_date: String,
    pub period_start: String,
    pub period_end: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskInstance {
    pub id: i64,
    pub uuid: String,
    pub instance_id: i64,
    pub template_id: i64,
    pub status: TaskStatus,
    // Snapshot fields, frozen at instance creation. Template edits never
    // reach back into these.
    pub description: String,
    pub points: i64,
    pub weight: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub status_updated_at: String,
    pub notes_updated_at: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
    /// True when the originating template has since been soft-deleted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub template_removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub instance: TrackerInstance,
    pub tasks: Vec<TaskInstance>,
    pub done_count: i64,
    pub total_count: i64,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Goal {
    pub id: i64,
    pub uuid: String,
    pub title: String,
    pub target_value: f64,
    pub current_value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub status: GoalStatus,
    pub start_date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_date: Option<String>,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewGoal {
    pub title: String,
    pub target_value: f64,
    pub unit: Option<String>,
    pub start_date: NaiveDate,
    pub target_date: Option<NaiveDate>,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalTaskMapping {
    pub id: i64,
    pub uuid: String,
    pub goal_id: i64,
    pub template_id: i64,
    pub contribution_weight: f64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GoalProgress {
    pub goal_id: i64,
    pub current_value: f64,
    pub status: GoalStatus,
    /// Set when this recomputation transitioned the goal into `achieved`.
    pub newly_achieved: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreakSummary {
    pub current: i64,
    pub longest: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_meeting_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToggleOutcome {
    pub task_id: i64,
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    pub tracker_id: i64,
    pub instance_id: i64,
    pub template_id: i64,
    /// Goals mapped from the originating template; the caller recomputes these.
    pub affected_goal_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Preferences {
    pub streak_threshold: i64,
    pub week_start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

pub const DEFAULT_STREAK_THRESHOLD: i64 = 80;

/// Streak lengths (in periods) that trigger a milestone notification.
pub const STREAK_MILESTONES: &[i64] = &[7, 14, 30, 60, 100, 365];

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    /// Initialize tasks of gap instances whose period already ended to
    /// `missed` instead of `todo`.
    pub mark_missed_for_past: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeReport {
    pub created: i64,
    pub existing: i64,
}

/// One period's completion numbers, for history/analytics views.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStat {
    pub tracking_date: String,
    pub done_count: i64,
    pub total_count: i64,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShareLink {
    pub id: i64,
    pub token: String,
    pub tracker_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<i64>,
    pub use_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    pub created_at: String,
}

// --- Sync wire types ---
//
// Sync records are stringly typed: statuses and modes travel as text and are
// validated at the reconcile boundary before anything touches the database.
// Parent references travel as uuids, never local row ids.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTracker {
    pub uuid: String,
    pub name: String,
    pub time_mode: String,
    pub status: String,
    pub week_start: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTemplate {
    pub uuid: String,
    pub tracker_uuid: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub category: Option<String>,
    pub weight: i64,
    pub points: i64,
    pub include_in_goal: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub time_of_day: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncInstance {
    pub uuid: String,
    pub tracker_uuid: String,
    pub tracking_date: String,
    pub period_start: String,
    pub period_end: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncTaskInstance {
    pub uuid: String,
    pub instance_uuid: String,
    pub template_uuid: String,
    pub status: String,
    pub description: String,
    pub points: i64,
    pub weight: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub notes: Option<String>,
    pub status_updated_at: String,
    pub notes_updated_at: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncGoal {
    pub uuid: String,
    pub title: String,
    pub target_value: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unit: Option<String>,
    pub status: String,
    pub start_date: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub target_date: Option<String>,
    pub priority: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMapping {
    pub uuid: String,
    pub goal_uuid: String,
    pub template_uuid: String,
    pub contribution_weight: f64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTombstone {
    pub uuid: String,
    pub table_name: String,
    pub deleted_at: String,
}

/// Valid table names for sync tombstones.
pub const VALID_TOMBSTONE_TABLES: &[&str] = &[
    "trackers",
    "task_templates",
    "tracker_instances",
    "task_instances",
    "goals",
    "goal_task_mappings",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    pub trackers: Vec<SyncTracker>,
    pub templates: Vec<SyncTemplate>,
    pub instances: Vec<SyncInstance>,
    pub task_instances: Vec<SyncTaskInstance>,
    pub goals: Vec<SyncGoal>,
    pub mappings: Vec<SyncMapping>,
    pub tombstones: Vec<SyncTombstone>,
    pub server_timestamp: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub trackers: Vec<SyncTracker>,
    #[serde(default)]
    pub templates: Vec<SyncTemplate>,
    #[serde(default)]
    pub instances: Vec<SyncInstance>,
    #[serde(default)]
    pub task_instances: Vec<SyncTaskInstance>,
    #[serde(default)]
    pub goals: Vec<SyncGoal>,
    #[serde(default)]
    pub mappings: Vec<SyncMapping>,
    #[serde(default)]
    pub tombstones: Vec<SyncTombstone>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedChange {
    pub table: String,
    pub uuid: String,
}

/// A losing client write. Not an error: the caller receives the server's
/// current value through `changes` and reconciles its own state.
#[derive(Debug, Clone, Serialize)]
pub struct SyncConflict {
    pub table: String,
    pub uuid: String,
    /// Which field group lost, for entities synced per group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_group: Option<String>,
    pub client_updated_at: String,
    pub server_updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub applied: Vec<AppliedChange>,
    pub conflicts: Vec<SyncConflict>,
    pub changes: SyncPayload,
}

// --- Export / Import types ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportData {
    pub version: i64,
    pub exported_at: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub trackers: Vec<SyncTracker>,
    pub templates: Vec<SyncTemplate>,
    pub instances: Vec<SyncInstance>,
    pub task_instances: Vec<SyncTaskInstance>,
    pub goals: Vec<SyncGoal>,
    pub mappings: Vec<SyncMapping>,
    #[serde(default)]
    pub tombstones: Vec<SyncTombstone>,
}

pub const EXPORT_VERSION: i64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[allow(clippy::struct_field_names)]
pub struct ImportSummary {
    pub trackers_imported: i64,
    pub templates_imported: i64,
    pub instances_imported: i64,
    pub task_instances_imported: i64,
    pub goals_imported: i64,
    pub mappings_imported: i64,
    pub tombstones_processed: i64,
}

// --- Validation ---

/// Longest span `generate_range` will fill, to prevent runaway generation.
pub const MAX_RANGE_DAYS: i64 = 731;

pub const TIMES_OF_DAY: &[&str] = &["morning", "afternoon", "evening"];

pub fn validate_week_start(week_start: i64) -> Result<()> {
    if !(0..=6).contains(&week_start) {
        bail!("week_start must be between 0 (Monday) and 6 (Sunday)");
    }
    Ok(())
}

pub fn validate_streak_threshold(threshold: i64) -> Result<()> {
    if !(1..=100).contains(&threshold) {
        bail!("Streak threshold must be a percentage between 1 and 100");
    }
    Ok(())
}

/// Validate a template's numeric fields and `time_of_day`. Out-of-range
/// values are rejected, never clamped.
pub fn validate_template_fields(
    weight: i64,
    points: i64,
    time_of_day: Option<&str>,
) -> Result<()> {
    if !(1..=10).contains(&weight) {
        bail!("Task weight must be between 1 and 10");
    }
    if points < 0 {
        bail!("Task points must not be negative");
    }
    if let Some(tod) = time_of_day {
        if !TIMES_OF_DAY.contains(&tod.to_lowercase().as_str()) {
            bail!(
                "Invalid time_of_day '{tod}'. Must be one of: {}",
                TIMES_OF_DAY.join(", ")
            );
        }
    }
    Ok(())
}

pub fn validate_date_range(start: NaiveDate, end: NaiveDate) -> Result<()> {
    if end < start {
        bail!("Invalid date range: end {end} is before start {start}");
    }
    let span = (end - start).num_days() + 1;
    if span > MAX_RANGE_DAYS {
        bail!("Date range spans {span} days; the maximum is {MAX_RANGE_DAYS} (about two years)");
    }
    Ok(())
}

/// Validate a goal's fields at the creation/update boundary. A target date
/// already in the past would create an already-failed goal and is rejected.
pub fn validate_goal_fields(
    target_value: f64,
    target_date: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<()> {
    if target_value <= 0.0 {
        bail!("Goal target_value must be greater than 0");
    }
    if let Some(td) = target_date {
        if td < today {
            bail!("Goal target_date {td} is already in the past");
        }
    }
    Ok(())
}

pub fn validate_contribution_weight(weight: f64) -> Result<()> {
    if weight <= 0.0 {
        bail!("contribution_weight must be greater than 0");
    }
    Ok(())
}

fn validate_date_str(date: &str, what: &str) -> Result<()> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| anyhow::anyhow!("Invalid {what} '{date}'. Must be YYYY-MM-DD"))?;
    Ok(())
}

/// Validate a sync tombstone: `table_name` must be in the allowed list,
/// `deleted_at` must be valid RFC 3339, and future timestamps are capped to now.
pub fn validate_tombstone(tombstone: &mut SyncTombstone) -> Result<()> {
    if !VALID_TOMBSTONE_TABLES.contains(&tombstone.table_name.as_str()) {
        bail!(
            "Invalid tombstone table_name '{}'. Must be one of: {}",
            tombstone.table_name,
            VALID_TOMBSTONE_TABLES.join(", ")
        );
    }
    let ts = chrono::DateTime::parse_from_rfc3339(&tombstone.deleted_at).map_err(|_| {
        anyhow::anyhow!(
            "Invalid tombstone deleted_at '{}'. Must be RFC 3339 format",
            tombstone.deleted_at
        )
    })?;
    let now = chrono::Utc::now();
    if ts > now {
        tombstone.deleted_at = now.to_rfc3339();
    }
    Ok(())
}

pub fn validate_sync_tracker(tracker: &SyncTracker) -> Result<()> {
    if tracker.uuid.is_empty() {
        bail!("Sync tracker is missing a uuid");
    }
    if tracker.name.trim().is_empty() {
        bail!("Tracker name must not be empty");
    }
    TimeMode::parse(&tracker.time_mode)?;
    TrackerStatus::parse(&tracker.status)?;
    validate_week_start(tracker.week_start)?;
    Ok(())
}

pub fn validate_sync_template(template: &SyncTemplate) -> Result<()> {
    if template.uuid.is_empty() {
        bail!("Sync template is missing a uuid");
    }
    if template.description.trim().is_empty() {
        bail!("Task description must not be empty");
    }
    validate_template_fields(
        template.weight,
        template.points,
        template.time_of_day.as_deref(),
    )
}

pub fn validate_sync_instance(instance: &SyncInstance) -> Result<()> {
    if instance.uuid.is_empty() {
        bail!("Sync instance is missing a uuid");
    }
    validate_date_str(&instance.tracking_date, "tracking_date")?;
    validate_date_str(&instance.period_start, "period_start")?;
    validate_date_str(&instance.period_end, "period_end")?;
    Ok(())
}

pub fn validate_sync_task_instance(task: &SyncTaskInstance) -> Result<()> {
    if task.uuid.is_empty() {
        bail!("Sync task instance is missing a uuid");
    }
    TaskStatus::parse(&task.status)?;
    validate_template_fields(task.weight, task.points, None)?;
    Ok(())
}

pub fn validate_sync_goal(goal: &SyncGoal) -> Result<()> {
    if goal.uuid.is_empty() {
        bail!("Sync goal is missing a uuid");
    }
    if goal.title.trim().is_empty() {
        bail!("Goal title must not be empty");
    }
    if goal.target_value <= 0.0 {
        bail!("Goal target_value must be greater than 0");
    }
    GoalStatus::parse(&goal.status)?;
    validate_date_str(&goal.start_date, "start_date")?;
    if let Some(td) = &goal.target_date {
        validate_date_str(td, "target_date")?;
    }
    Ok(())
}

pub fn validate_sync_mapping(mapping: &SyncMapping) -> Result<()> {
    if mapping.uuid.is_empty() {
        bail!("Sync mapping is missing a uuid");
    }
    validate_contribution_weight(mapping.contribution_weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_mode_parse() {
        assert_eq!(TimeMode::parse("daily").unwrap(), TimeMode::Daily);
        assert_eq!(TimeMode::parse("Weekly").unwrap(), TimeMode::Weekly);
        assert_eq!(TimeMode::parse("MONTHLY").unwrap(), TimeMode::Monthly);
    }

    #[test]
    fn test_time_mode_parse_invalid() {
        assert!(TimeMode::parse("fortnightly").is_err());
        assert!(TimeMode::parse("").is_err());
    }

    #[test]
    fn test_time_mode_round_trip() {
        for s in TIME_MODES {
            assert_eq!(TimeMode::parse(s).unwrap().as_str(), *s);
        }
    }

    #[test]
    fn test_task_status_round_trip() {
        for s in TASK_STATUSES {
            assert_eq!(TaskStatus::parse(s).unwrap().as_str(), *s);
        }
    }

    #[test]
    fn test_task_status_hyphen_alias() {
        assert_eq!(
            TaskStatus::parse("in-progress").unwrap(),
            TaskStatus::InProgress
        );
    }

    #[test]
    fn test_task_status_invalid() {
        assert!(TaskStatus::parse("finished").is_err());
    }

    #[test]
    fn test_goal_status_parse() {
        assert_eq!(GoalStatus::parse("achieved").unwrap(), GoalStatus::Achieved);
        assert!(GoalStatus::parse("completed").is_err());
    }

    #[test]
    fn test_validate_week_start() {
        for d in 0..=6 {
            assert!(validate_week_start(d).is_ok());
        }
        assert!(validate_week_start(-1).is_err());
        assert!(validate_week_start(7).is_err());
    }

    #[test]
    fn test_validate_streak_threshold() {
        assert!(validate_streak_threshold(80).is_ok());
        assert!(validate_streak_threshold(1).is_ok());
        assert!(validate_streak_threshold(100).is_ok());
        assert!(validate_streak_threshold(0).is_err());
        assert!(validate_streak_threshold(101).is_err());
    }

    #[test]
    fn test_validate_template_fields() {
        assert!(validate_template_fields(1, 0, None).is_ok());
        assert!(validate_template_fields(10, 50, Some("morning")).is_ok());
        assert!(validate_template_fields(0, 0, None).is_err());
        assert!(validate_template_fields(11, 0, None).is_err());
        assert!(validate_template_fields(-3, 0, None).is_err());
        assert!(validate_template_fields(1, -1, None).is_err());
        assert!(validate_template_fields(1, 0, Some("midnight")).is_err());
    }

    #[test]
    fn test_validate_date_range() {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        assert!(validate_date_range(start, end).is_ok());
        assert!(validate_date_range(start, start).is_ok());
        assert!(validate_date_range(end, start).is_err());
    }

    #[test]
    fn test_validate_date_range_cap() {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2023, 1, 1).unwrap();
        assert!(validate_date_range(start, end).is_err());
        // Exactly the cap is fine
        let end_ok = start + chrono::Duration::days(MAX_RANGE_DAYS - 1);
        assert!(validate_date_range(start, end_ok).is_ok());
    }

    #[test]
    fn test_validate_goal_fields() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(validate_goal_fields(10.0, None, today).is_ok());
        assert!(validate_goal_fields(10.0, Some(today), today).is_ok());
        assert!(
            validate_goal_fields(10.0, Some(today + chrono::Duration::days(30)), today).is_ok()
        );
    }

    #[test]
    fn test_validate_goal_target_date_in_past() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let past = today - chrono::Duration::days(1);
        assert!(validate_goal_fields(10.0, Some(past), today).is_err());
    }

    #[test]
    fn test_validate_goal_nonpositive_target() {
        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert!(validate_goal_fields(0.0, None, today).is_err());
        assert!(validate_goal_fields(-5.0, None, today).is_err());
    }

    #[test]
    fn test_validate_contribution_weight() {
        assert!(validate_contribution_weight(1.0).is_ok());
        assert!(validate_contribution_weight(0.5).is_ok());
        assert!(validate_contribution_weight(0.0).is_err());
        assert!(validate_contribution_weight(-1.0).is_err());
    }

    #[test]
    fn test_validate_tombstone_valid_tables() {
        for table in VALID_TOMBSTONE_TABLES {
            let mut t = SyncTombstone {
                uuid: "test-uuid".to_string(),
                table_name: (*table).to_string(),
                deleted_at: "2024-01-01T00:00:00Z".to_string(),
            };
            assert!(validate_tombstone(&mut t).is_ok());
        }
    }

    #[test]
    fn test_validate_tombstone_invalid_table() {
        let mut t = SyncTombstone {
            uuid: "test-uuid".to_string(),
            table_name: "user_settings".to_string(),
            deleted_at: "2024-01-01T00:00:00Z".to_string(),
        };
        assert!(validate_tombstone(&mut t).is_err());
    }

    #[test]
    fn test_validate_tombstone_caps_future_timestamp() {
        let mut t = SyncTombstone {
            uuid: "test-uuid".to_string(),
            table_name: "trackers".to_string(),
            deleted_at: "2099-01-01T00:00:00Z".to_string(),
        };
        validate_tombstone(&mut t).unwrap();
        assert!(t.deleted_at < "2099-01-01T00:00:00Z".to_string());
    }

    #[test]
    fn test_validate_tombstone_rejects_malformed_timestamp() {
        let mut t = SyncTombstone {
            uuid: "test-uuid".to_string(),
            table_name: "trackers".to_string(),
            deleted_at: "not-a-date".to_string(),
        };
        assert!(validate_tombstone(&mut t).is_err());
    }

    fn sample_sync_tracker() -> SyncTracker {
        SyncTracker {
            uuid: "t-uuid".to_string(),
            name: "Morning routine".to_string(),
            time_mode: "daily".to_string(),
            status: "active".to_string(),
            week_start: 0,
            created_at: "2025-01-01T08:00:00+00:00".to_string(),
            updated_at: "2025-01-01T08:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn test_validate_sync_tracker() {
        assert!(validate_sync_tracker(&sample_sync_tracker()).is_ok());

        let mut bad = sample_sync_tracker();
        bad.time_mode = "hourly".to_string();
        assert!(validate_sync_tracker(&bad).is_err());

        let mut bad = sample_sync_tracker();
        bad.name = "  ".to_string();
        assert!(validate_sync_tracker(&bad).is_err());

        let mut bad = sample_sync_tracker();
        bad.uuid = String::new();
        assert!(validate_sync_tracker(&bad).is_err());
    }

    #[test]
    fn test_validate_sync_task_instance() {
        let task = SyncTaskInstance {
            uuid: "ti-uuid".to_string(),
            instance_uuid: "i-uuid".to_string(),
            template_uuid: "tpl-uuid".to_string(),
            status: "done".to_string(),
            description: "Stretch".to_string(),
            points: 5,
            weight: 2,
            first_completed_at: Some("2025-01-02T07:00:00+00:00".to_string()),
            completed_at: Some("2025-01-02T07:00:00+00:00".to_string()),
            notes: None,
            status_updated_at: "2025-01-02T07:00:00+00:00".to_string(),
            notes_updated_at: "2025-01-01T08:00:00+00:00".to_string(),
            created_at: "2025-01-01T08:00:00+00:00".to_string(),
            updated_at: "2025-01-02T07:00:00+00:00".to_string(),
        };
        assert!(validate_sync_task_instance(&task).is_ok());

        let mut bad = task.clone();
        bad.status = "finished".to_string();
        assert!(validate_sync_task_instance(&bad).is_err());

        let mut bad = task;
        bad.weight = 0;
        assert!(validate_sync_task_instance(&bad).is_err());
    }

    #[test]
    fn test_validate_sync_goal() {
        let goal = SyncGoal {
            uuid: "g-uuid".to_string(),
            title: "Read 12 books".to_string(),
            target_value: 12.0,
            unit: Some("books".to_string()),
            status: "active".to_string(),
            start_date: "2025-01-01".to_string(),
            target_date: Some("2025-12-31".to_string()),
            priority: 1,
            created_at: "2025-01-01T08:00:00+00:00".to_string(),
            updated_at: "2025-01-01T08:00:00+00:00".to_string(),
        };
        assert!(validate_sync_goal(&goal).is_ok());

        let mut bad = goal.clone();
        bad.target_value = 0.0;
        assert!(validate_sync_goal(&bad).is_err());

        let mut bad = goal;
        bad.start_date = "01/01/2025".to_string();
        assert!(validate_sync_goal(&bad).is_err());
    }
}
