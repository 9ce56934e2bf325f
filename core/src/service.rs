use std::collections::HashSet;
use std::path::Path;

use anyhow::{Result, bail};
use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::Database;
use crate::history_import::{self, HistoryImportSummary};
use crate::models::{
    DEFAULT_STREAK_THRESHOLD, EXPORT_VERSION, ExportData, Goal, GoalProgress, GoalStatus,
    GoalTaskMapping, ImportSummary, InstanceStat, InstanceView, NewGoal, NewTaskTemplate,
    NewTracker, Preferences, RangeOptions, RangeReport, STREAK_MILESTONES, ShareLink,
    StreakSummary, SyncReport, SyncRequest, TaskInstance, TaskStatus, TaskTemplate, TimeMode,
    ToggleOutcome, Tracker, TrackerStatus, UpdateTaskTemplate, validate_contribution_weight,
    validate_goal_fields, validate_streak_threshold, validate_sync_goal, validate_sync_instance,
    validate_sync_mapping, validate_sync_task_instance, validate_sync_template,
    validate_sync_tracker, validate_template_fields, validate_tombstone, validate_week_start,
};

/// Events raised by the engine for an external notification dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationEvent {
    GoalAchieved {
        goal_id: i64,
        title: String,
        current_value: f64,
    },
    StreakMilestone {
        tracker_id: i64,
        tracker_name: String,
        length: i64,
    },
}

/// Boundary to the notification dispatcher. Implementations must not block:
/// dispatch is fire-and-forget and runs inside the toggle/recompute path.
///
/// The CLI passes `NullSink`; an app shell would pass `ChannelSink` and
/// drain the receiver from its own delivery loop.
pub trait NotificationSink: Send + Sync {
    fn dispatch(&self, event: NotificationEvent);
}

pub struct NullSink;

impl NotificationSink for NullSink {
    fn dispatch(&self, _event: NotificationEvent) {}
}

/// Hands events to an mpsc channel. A dropped receiver is not an error;
/// undeliverable notifications are simply discarded.
pub struct ChannelSink {
    tx: std::sync::mpsc::Sender<NotificationEvent>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: std::sync::mpsc::Sender<NotificationEvent>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for ChannelSink {
    fn dispatch(&self, event: NotificationEvent) {
        let _ = self.tx.send(event);
    }
}

pub struct TrackerService {
    db: Database,
}

impl TrackerService {
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Database::open(Path::new(db_path))?;
        Ok(Self { db })
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db })
    }

    // --- Trackers ---

    pub fn create_tracker(
        &self,
        name: &str,
        time_mode: &str,
        week_start: Option<i64>,
    ) -> Result<Tracker> {
        if name.trim().is_empty() {
            bail!("Tracker name must not be empty");
        }
        let time_mode = TimeMode::parse(time_mode)?;
        let week_start = match week_start {
            Some(ws) => {
                validate_week_start(ws)?;
                ws
            }
            None => self.get_preferences()?.week_start,
        };
        self.db.insert_tracker(&NewTracker {
            name: name.trim().to_string(),
            time_mode,
            week_start,
        })
    }

    pub fn get_tracker(&self, id: i64) -> Result<Tracker> {
        self.db.get_tracker(id)
    }

    pub fn get_tracker_by_name(&self, name: &str) -> Result<Option<Tracker>> {
        self.db.get_tracker_by_name(name)
    }

    pub fn list_trackers(&self, include_archived: bool) -> Result<Vec<Tracker>> {
        self.db.list_trackers(include_archived)
    }

    pub fn set_tracker_status(&self, id: i64, status: TrackerStatus) -> Result<Tracker> {
        self.db.set_tracker_status(id, status)
    }

    pub fn delete_tracker(&self, id: i64) -> Result<()> {
        for (uuid, table) in self.db.soft_delete_tracker(id)? {
            self.db.record_tombstone(&uuid, table)?;
        }
        Ok(())
    }

    // --- Task templates ---

    pub fn add_task(&self, template: &NewTaskTemplate) -> Result<TaskTemplate> {
        if template.description.trim().is_empty() {
            bail!("Task description must not be empty");
        }
        validate_template_fields(
            template.weight,
            template.points,
            template.time_of_day.as_deref(),
        )?;
        self.db.insert_template(template)
    }

    pub fn update_task(&self, id: i64, update: &UpdateTaskTemplate) -> Result<TaskTemplate> {
        if let Some(ref description) = update.description {
            if description.trim().is_empty() {
                bail!("Task description must not be empty");
            }
        }
        let current = self.db.get_template(id)?;
        let weight = update.weight.unwrap_or(current.weight);
        let points = update.points.unwrap_or(current.points);
        let time_of_day = match &update.time_of_day {
            Some(tod) => tod.clone(),
            None => current.time_of_day.clone(),
        };
        validate_template_fields(weight, points, time_of_day.as_deref())?;
        self.db.update_template(id, update)
    }

    pub fn delete_task(&self, id: i64) -> Result<()> {
        let uuid = self.db.soft_delete_template(id)?;
        self.db.record_tombstone(&uuid, "task_templates")
    }

    pub fn list_tasks(&self, tracker_id: i64) -> Result<Vec<TaskTemplate>> {
        self.db.list_templates(tracker_id)
    }

    // --- Instances ---

    pub fn get_or_create_instance(&self, tracker_id: i64, date: NaiveDate) -> Result<InstanceView> {
        let tracker = self.db.get_tracker(tracker_id)?;
        let instance = self.db.get_or_create_instance(&tracker, date)?;
        self.db.instance_view(instance)
    }

    /// Instances of every active tracker for `date`, lazily materialized.
    pub fn day_overview(&self, date: NaiveDate) -> Result<Vec<InstanceView>> {
        let mut views = Vec::new();
        for tracker in self.db.list_trackers(false)? {
            if tracker.status != TrackerStatus::Active {
                continue;
            }
            let instance = self.db.get_or_create_instance(&tracker, date)?;
            views.push(self.db.instance_view(instance)?);
        }
        Ok(views)
    }

    pub fn generate_range(
        &self,
        tracker_id: i64,
        start: NaiveDate,
        end: NaiveDate,
        options: RangeOptions,
    ) -> Result<RangeReport> {
        let tracker = self.db.get_tracker(tracker_id)?;
        let today = Local::now().date_naive();
        self.db.generate_range(&tracker, start, end, options, today)
    }

    /// Transition a task and run the downstream recomputations: the owning
    /// tracker's streak (for milestone events) and every goal fed by the
    /// task's template. Notification dispatch never blocks this path.
    pub fn toggle_task(
        &self,
        task_id: i64,
        new_status: TaskStatus,
        sink: &dyn NotificationSink,
    ) -> Result<ToggleOutcome> {
        let now = Local::now();
        let outcome = self.db.toggle_task(task_id, new_status, &now.to_rfc3339())?;
        let today = now.date_naive();

        // Milestones only fire on a completing transition
        if outcome.new_status == TaskStatus::Done && outcome.old_status != TaskStatus::Done {
            let tracker = self.db.get_tracker(outcome.tracker_id)?;
            let threshold = self.get_preferences()?.streak_threshold;
            let streak = self.db.compute_streak(&tracker, today, threshold)?;
            if STREAK_MILESTONES.contains(&streak.current) {
                sink.dispatch(NotificationEvent::StreakMilestone {
                    tracker_id: tracker.id,
                    tracker_name: tracker.name,
                    length: streak.current,
                });
            }
        }

        for goal_id in &outcome.affected_goal_ids {
            let progress = self.db.recompute_goal(*goal_id, today)?;
            if progress.newly_achieved {
                let goal = self.db.get_goal(*goal_id)?;
                sink.dispatch(NotificationEvent::GoalAchieved {
                    goal_id: goal.id,
                    title: goal.title,
                    current_value: progress.current_value,
                });
            }
        }

        Ok(outcome)
    }

    pub fn get_task_instance(&self, task_id: i64) -> Result<TaskInstance> {
        self.db.get_task(task_id)
    }

    pub fn set_task_notes(&self, task_id: i64, notes: Option<&str>) -> Result<TaskInstance> {
        self.db.set_task_notes(task_id, notes)
    }

    // --- Streaks & history ---

    pub fn compute_streak(
        &self,
        tracker_id: i64,
        as_of: Option<NaiveDate>,
        threshold: Option<i64>,
    ) -> Result<StreakSummary> {
        let tracker = self.db.get_tracker(tracker_id)?;
        let as_of = as_of.unwrap_or_else(|| Local::now().date_naive());
        let threshold = match threshold {
            Some(t) => {
                validate_streak_threshold(t)?;
                t
            }
            None => self.get_preferences()?.streak_threshold,
        };
        self.db.compute_streak(&tracker, as_of, threshold)
    }

    pub fn tracker_history(&self, tracker_id: i64, days: i64) -> Result<Vec<InstanceStat>> {
        if days <= 0 {
            bail!("History length must be at least 1 day");
        }
        let today = Local::now().date_naive();
        let from = today - chrono::Duration::days(days - 1);
        self.db.tracker_history(tracker_id, from, today)
    }

    // --- Goals ---

    pub fn create_goal(
        &self,
        title: &str,
        target_value: f64,
        unit: Option<String>,
        target_date: Option<NaiveDate>,
        priority: i64,
    ) -> Result<Goal> {
        if title.trim().is_empty() {
            bail!("Goal title must not be empty");
        }
        let today = Local::now().date_naive();
        validate_goal_fields(target_value, target_date, today)?;
        self.db.insert_goal(&NewGoal {
            title: title.trim().to_string(),
            target_value,
            unit,
            start_date: today,
            target_date,
            priority,
        })
    }

    pub fn get_goal(&self, id: i64) -> Result<Goal> {
        self.db.get_goal(id)
    }

    pub fn list_goals(&self) -> Result<Vec<Goal>> {
        self.db.list_goals()
    }

    pub fn map_task_to_goal(
        &self,
        goal_id: i64,
        template_id: i64,
        contribution_weight: f64,
    ) -> Result<GoalTaskMapping> {
        validate_contribution_weight(contribution_weight)?;
        self.db
            .map_task_to_goal(goal_id, template_id, contribution_weight)
    }

    pub fn unmap_task_from_goal(&self, goal_id: i64, template_id: i64) -> Result<bool> {
        match self.db.unmap_task_from_goal(goal_id, template_id)? {
            Some(uuid) => {
                self.db.record_tombstone(&uuid, "goal_task_mappings")?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list_goal_mappings(&self, goal_id: i64) -> Result<Vec<GoalTaskMapping>> {
        self.db.list_goal_mappings(goal_id)
    }

    pub fn recompute_goal(&self, goal_id: i64) -> Result<GoalProgress> {
        self.db.recompute_goal(goal_id, Local::now().date_naive())
    }

    /// Change a goal's target and recompute. Raising the target above the
    /// current value reopens an achieved goal; lowering it below the current
    /// value achieves it (and notifies).
    pub fn set_goal_target(
        &self,
        goal_id: i64,
        target_value: f64,
        sink: &dyn NotificationSink,
    ) -> Result<GoalProgress> {
        if target_value <= 0.0 {
            bail!("Goal target_value must be greater than 0");
        }
        self.db.set_goal_target(goal_id, target_value)?;
        let progress = self.recompute_goal(goal_id)?;
        if progress.newly_achieved {
            let goal = self.db.get_goal(goal_id)?;
            sink.dispatch(NotificationEvent::GoalAchieved {
                goal_id: goal.id,
                title: goal.title,
                current_value: progress.current_value,
            });
        }
        Ok(progress)
    }

    pub fn set_goal_status(&self, goal_id: i64, status: GoalStatus) -> Result<Goal> {
        self.db.set_goal_status(goal_id, status)
    }

    pub fn delete_goal(&self, goal_id: i64) -> Result<()> {
        for (uuid, table) in self.db.soft_delete_goal(goal_id)? {
            self.db.record_tombstone(&uuid, table)?;
        }
        Ok(())
    }

    // --- Preferences ---

    pub fn get_preferences(&self) -> Result<Preferences> {
        let streak_threshold = match self.db.get_setting("streak_threshold")? {
            Some(v) => v.parse::<i64>()?,
            None => DEFAULT_STREAK_THRESHOLD,
        };
        let week_start = match self.db.get_setting("week_start")? {
            Some(v) => v.parse::<i64>()?,
            None => 0,
        };
        let timezone = self.db.get_setting("timezone")?;
        Ok(Preferences {
            streak_threshold,
            week_start,
            timezone,
        })
    }

    pub fn set_streak_threshold(&self, threshold: i64) -> Result<()> {
        validate_streak_threshold(threshold)?;
        self.db.set_setting("streak_threshold", &threshold.to_string())
    }

    pub fn set_week_start(&self, week_start: i64) -> Result<()> {
        validate_week_start(week_start)?;
        self.db.set_setting("week_start", &week_start.to_string())
    }

    pub fn set_timezone(&self, timezone: &str) -> Result<()> {
        self.db.set_setting("timezone", timezone)
    }

    // --- Share links ---

    pub fn create_share_link(
        &self,
        tracker_id: i64,
        max_uses: Option<i64>,
        expires_at: Option<&str>,
    ) -> Result<ShareLink> {
        if max_uses.is_some_and(|m| m <= 0) {
            bail!("max_uses must be at least 1");
        }
        let token = Uuid::new_v4().simple().to_string();
        self.db
            .create_share_link(tracker_id, &token, max_uses, expires_at)
    }

    pub fn claim_share_link(&self, token: &str) -> Result<ShareLink> {
        self.db
            .claim_share_link(token, &Local::now().to_rfc3339())
    }

    // --- Sync ---

    pub fn device_id(&self) -> Result<String> {
        self.db.get_or_create_device_id()
    }

    /// Reconcile a batch of client changes against local state. The whole
    /// batch is validated before any write; merge conflicts are data in the
    /// report, never errors.
    pub fn reconcile_sync(&self, request: &SyncRequest) -> Result<SyncReport> {
        for tracker in &request.trackers {
            validate_sync_tracker(tracker)?;
        }
        for template in &request.templates {
            validate_sync_template(template)?;
        }
        for instance in &request.instances {
            validate_sync_instance(instance)?;
        }
        for task in &request.task_instances {
            validate_sync_task_instance(task)?;
        }
        for goal in &request.goals {
            validate_sync_goal(goal)?;
        }
        for mapping in &request.mappings {
            validate_sync_mapping(mapping)?;
        }
        let mut request = request.clone();
        for tombstone in &mut request.tombstones {
            validate_tombstone(tombstone)?;
        }

        let (applied, conflicts) = self.db.apply_changes(&request)?;

        // Merged completions invalidate goal progress; recompute is total
        // and idempotent, so run it across the board.
        if !request.task_instances.is_empty()
            || !request.goals.is_empty()
            || !request.mappings.is_empty()
            || !request.tombstones.is_empty()
        {
            let today = Local::now().date_naive();
            for goal in self.db.list_goals()? {
                self.db.recompute_goal(goal.id, today)?;
            }
        }

        let server_timestamp = Utc::now().to_rfc3339();
        let mut changes = self
            .db
            .changes_since(request.since.as_deref(), &server_timestamp)?;

        // Don't echo the client's own batch back. Goals are exempt: their
        // status may have shifted during recomputation above.
        let applied_set: HashSet<(&str, &str)> = applied
            .iter()
            .map(|a| (a.table.as_str(), a.uuid.as_str()))
            .collect();
        changes
            .trackers
            .retain(|t| !applied_set.contains(&("trackers", t.uuid.as_str())));
        changes
            .templates
            .retain(|t| !applied_set.contains(&("task_templates", t.uuid.as_str())));
        changes
            .instances
            .retain(|i| !applied_set.contains(&("tracker_instances", i.uuid.as_str())));
        changes
            .task_instances
            .retain(|t| !applied_set.contains(&("task_instances", t.uuid.as_str())));
        changes
            .mappings
            .retain(|m| !applied_set.contains(&("goal_task_mappings", m.uuid.as_str())));

        // Losing writers must receive the server's winning value even when
        // that row predates `since`.
        if !conflicts.is_empty() {
            let full = self.db.changes_since(None, &server_timestamp)?;
            for conflict in &conflicts {
                match conflict.table.as_str() {
                    "trackers" => {
                        if !changes.trackers.iter().any(|t| t.uuid == conflict.uuid) {
                            if let Some(row) =
                                full.trackers.iter().find(|t| t.uuid == conflict.uuid)
                            {
                                changes.trackers.push(row.clone());
                            }
                        }
                    }
                    "task_templates" => {
                        if !changes.templates.iter().any(|t| t.uuid == conflict.uuid) {
                            if let Some(row) =
                                full.templates.iter().find(|t| t.uuid == conflict.uuid)
                            {
                                changes.templates.push(row.clone());
                            }
                        }
                    }
                    "tracker_instances" => {
                        if !changes.instances.iter().any(|i| i.uuid == conflict.uuid) {
                            if let Some(row) =
                                full.instances.iter().find(|i| i.uuid == conflict.uuid)
                            {
                                changes.instances.push(row.clone());
                            }
                        }
                    }
                    "task_instances" => {
                        if !changes.task_instances.iter().any(|t| t.uuid == conflict.uuid) {
                            if let Some(row) =
                                full.task_instances.iter().find(|t| t.uuid == conflict.uuid)
                            {
                                changes.task_instances.push(row.clone());
                            }
                        }
                    }
                    "goals" => {
                        if !changes.goals.iter().any(|g| g.uuid == conflict.uuid) {
                            if let Some(row) = full.goals.iter().find(|g| g.uuid == conflict.uuid)
                            {
                                changes.goals.push(row.clone());
                            }
                        }
                    }
                    "goal_task_mappings" => {
                        if !changes.mappings.iter().any(|m| m.uuid == conflict.uuid) {
                            if let Some(row) =
                                full.mappings.iter().find(|m| m.uuid == conflict.uuid)
                            {
                                changes.mappings.push(row.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(SyncReport {
            applied,
            conflicts,
            changes,
        })
    }

    // --- Export / Import ---

    pub fn export_all(&self) -> Result<ExportData> {
        let now = Utc::now().to_rfc3339();
        let payload = self.db.changes_since(None, &now)?;
        Ok(ExportData {
            version: EXPORT_VERSION,
            exported_at: now,
            device_id: Some(self.db.get_or_create_device_id()?),
            trackers: payload.trackers,
            templates: payload.templates,
            instances: payload.instances,
            task_instances: payload.task_instances,
            goals: payload.goals,
            mappings: payload.mappings,
            tombstones: payload.tombstones,
        })
    }

    pub fn import_all(&self, data: &ExportData) -> Result<ImportSummary> {
        let request = SyncRequest {
            since: None,
            device_id: data.device_id.clone(),
            trackers: data.trackers.clone(),
            templates: data.templates.clone(),
            instances: data.instances.clone(),
            task_instances: data.task_instances.clone(),
            goals: data.goals.clone(),
            mappings: data.mappings.clone(),
            tombstones: data.tombstones.clone(),
        };
        let report = self.reconcile_sync(&request)?;

        let count = |table: &str| -> i64 {
            report.applied.iter().filter(|a| a.table == table).count() as i64
        };
        Ok(ImportSummary {
            trackers_imported: count("trackers"),
            templates_imported: count("task_templates"),
            instances_imported: count("tracker_instances"),
            task_instances_imported: count("task_instances"),
            goals_imported: count("goals"),
            mappings_imported: count("goal_task_mappings"),
            tombstones_processed: data.tombstones.len() as i64,
        })
    }

    // --- History import ---

    pub fn import_history_csv(&self, csv_data: &str, dry_run: bool) -> Result<HistoryImportSummary> {
        let rows = history_import::parse_history_csv(csv_data.as_bytes())?;
        history_import::import_history(&self.db, &rows, dry_run)
    }
}
