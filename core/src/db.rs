use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::models::{
    AppliedChange, Goal, GoalProgress, GoalStatus, GoalTaskMapping, InstanceStat, InstanceView,
    NewGoal, NewTaskTemplate, NewTracker, RangeOptions, RangeReport, ShareLink, StreakSummary,
    SyncConflict, SyncGoal, SyncInstance, SyncMapping, SyncPayload, SyncRequest, SyncTaskInstance,
    SyncTemplate, SyncTombstone, SyncTracker, TaskInstance, TaskStatus, TaskTemplate, TimeMode,
    ToggleOutcome, Tracker, TrackerInstance, TrackerStatus, UpdateTaskTemplate,
    validate_date_range,
};
use crate::period::{period_for, periods_between, previous_tracking_date};

pub struct Database {
    conn: Connection,
}

fn column_parse_err(err: anyhow::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, err.into())
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS trackers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    name TEXT NOT NULL,
                    time_mode TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    week_start INTEGER NOT NULL DEFAULT 0 CHECK (week_start BETWEEN 0 AND 6),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS task_templates (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    tracker_id INTEGER NOT NULL REFERENCES trackers(id),
                    description TEXT NOT NULL,
                    category TEXT,
                    weight INTEGER NOT NULL DEFAULT 1 CHECK (weight BETWEEN 1 AND 10),
                    points INTEGER NOT NULL DEFAULT 0 CHECK (points >= 0),
                    include_in_goal INTEGER NOT NULL DEFAULT 1,
                    time_of_day TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS tracker_instances (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    tracker_id INTEGER NOT NULL REFERENCES trackers(id),
                    tracking_date TEXT NOT NULL,
                    period_start TEXT NOT NULL,
                    period_end TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT,
                    UNIQUE (tracker_id, tracking_date)
                );

                CREATE TABLE IF NOT EXISTS task_instances (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    instance_id INTEGER NOT NULL REFERENCES tracker_instances(id),
                    template_id INTEGER NOT NULL REFERENCES task_templates(id),
                    status TEXT NOT NULL DEFAULT 'todo',
                    description TEXT NOT NULL,
                    points INTEGER NOT NULL DEFAULT 0,
                    weight INTEGER NOT NULL DEFAULT 1,
                    first_completed_at TEXT,
                    completed_at TEXT,
                    notes TEXT,
                    status_updated_at TEXT NOT NULL,
                    notes_updated_at TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT,
                    UNIQUE (instance_id, template_id)
                );

                CREATE TABLE IF NOT EXISTS goals (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    title TEXT NOT NULL,
                    target_value REAL NOT NULL,
                    current_value REAL NOT NULL DEFAULT 0,
                    unit TEXT,
                    status TEXT NOT NULL DEFAULT 'active',
                    start_date TEXT NOT NULL,
                    target_date TEXT,
                    priority INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT
                );

                CREATE TABLE IF NOT EXISTS goal_task_mappings (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    uuid TEXT NOT NULL UNIQUE,
                    goal_id INTEGER NOT NULL REFERENCES goals(id),
                    template_id INTEGER NOT NULL REFERENCES task_templates(id),
                    contribution_weight REAL NOT NULL DEFAULT 1.0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT,
                    UNIQUE (goal_id, template_id)
                );

                CREATE TABLE IF NOT EXISTS share_links (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    token TEXT NOT NULL UNIQUE,
                    tracker_id INTEGER NOT NULL REFERENCES trackers(id),
                    max_uses INTEGER,
                    use_count INTEGER NOT NULL DEFAULT 0,
                    expires_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_tombstones (
                    uuid TEXT NOT NULL,
                    table_name TEXT NOT NULL,
                    deleted_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS user_settings (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS config (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_templates_tracker ON task_templates(tracker_id);
                CREATE INDEX IF NOT EXISTS idx_instances_tracker_date
                    ON tracker_instances(tracker_id, tracking_date);
                CREATE INDEX IF NOT EXISTS idx_task_instances_instance ON task_instances(instance_id);
                CREATE INDEX IF NOT EXISTS idx_task_instances_template ON task_instances(template_id);
                CREATE INDEX IF NOT EXISTS idx_mappings_goal ON goal_task_mappings(goal_id);
                CREATE INDEX IF NOT EXISTS idx_mappings_template ON goal_task_mappings(template_id);
                CREATE INDEX IF NOT EXISTS idx_tombstones_uuid ON sync_tombstones(uuid);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn tracker_from_row(row: &rusqlite::Row) -> rusqlite::Result<Tracker> {
        let time_mode: String = row.get(3)?;
        let status: String = row.get(4)?;
        Ok(Tracker {
            id: row.get(0)?,
            uuid: row.get(1)?,
            name: row.get(2)?,
            time_mode: TimeMode::parse(&time_mode).map_err(column_parse_err)?,
            status: TrackerStatus::parse(&status).map_err(column_parse_err)?,
            week_start: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            deleted_at: row.get(8)?,
        })
    }

    fn template_from_row(row: &rusqlite::Row) -> rusqlite::Result<TaskTemplate> {
        Ok(TaskTemplate {
            id: row.get(0)?,
            uuid: row.get(1)?,
            tracker_id: row.get(2)?,
            description: row.get(3)?,
            category: row.get(4)?,
            weight: row.get(5)?,
            points: row.get(6)?,
            include_in_goal: row.get(7)?,
            time_of_day: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            deleted_at: row.get(11)?,
        })
    }

    fn instance_from_row(row: &rusqlite::Row) -> rusqlite::Result<TrackerInstance> {
        Ok(TrackerInstance {
            id: row.get(0)?,
            uuid: row.get(1)?,
            tracker_id: row.get(2)?,
            tracking_date: row.get(3)?,
            period_start: row.get(4)?,
            period_end: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            deleted_at: row.get(8)?,
        })
    }

    // Expects task_instances.* followed by a template_removed flag column.
    fn task_from_row(row: &rusqlite::Row) -> rusqlite::Result<TaskInstance> {
        let status: String = row.get(4)?;
        Ok(TaskInstance {
            id: row.get(0)?,
            uuid: row.get(1)?,
            instance_id: row.get(2)?,
            template_id: row.get(3)?,
            status: TaskStatus::parse(&status).map_err(column_parse_err)?,
            description: row.get(5)?,
            points: row.get(6)?,
            weight: row.get(7)?,
            first_completed_at: row.get(8)?,
            completed_at: row.get(9)?,
            notes: row.get(10)?,
            status_updated_at: row.get(11)?,
            notes_updated_at: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            deleted_at: row.get(15)?,
            template_removed: row.get(16)?,
        })
    }

    fn goal_from_row(row: &rusqlite::Row) -> rusqlite::Result<Goal> {
        let status: String = row.get(6)?;
        Ok(Goal {
            id: row.get(0)?,
            uuid: row.get(1)?,
            title: row.get(2)?,
            target_value: row.get(3)?,
            current_value: row.get(4)?,
            unit: row.get(5)?,
            status: GoalStatus::parse(&status).map_err(column_parse_err)?,
            start_date: row.get(7)?,
            target_date: row.get(8)?,
            priority: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
            deleted_at: row.get(12)?,
        })
    }

    fn mapping_from_row(row: &rusqlite::Row) -> rusqlite::Result<GoalTaskMapping> {
        Ok(GoalTaskMapping {
            id: row.get(0)?,
            uuid: row.get(1)?,
            goal_id: row.get(2)?,
            template_id: row.get(3)?,
            contribution_weight: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            deleted_at: row.get(7)?,
        })
    }

    fn share_link_from_row(row: &rusqlite::Row) -> rusqlite::Result<ShareLink> {
        Ok(ShareLink {
            id: row.get(0)?,
            token: row.get(1)?,
            tracker_id: row.get(2)?,
            max_uses: row.get(3)?,
            use_count: row.get(4)?,
            expires_at: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    // --- Trackers ---

    pub fn insert_tracker(&self, tracker: &NewTracker) -> Result<Tracker> {
        let now = Local::now().to_rfc3339();
        let uuid = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO trackers (uuid, name, time_mode, status, week_start, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?5)",
            params![
                uuid,
                tracker.name,
                tracker.time_mode.as_str(),
                tracker.week_start,
                now,
            ],
        )?;
        self.get_tracker(self.conn.last_insert_rowid())
    }

    pub fn get_tracker(&self, id: i64) -> Result<Tracker> {
        self.conn
            .query_row(
                "SELECT * FROM trackers WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                Self::tracker_from_row,
            )
            .context("Tracker not found")
    }

    pub fn get_tracker_by_uuid(&self, uuid: &str) -> Result<Option<Tracker>> {
        let mut stmt = self.conn.prepare("SELECT * FROM trackers WHERE uuid = ?1")?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::tracker_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_tracker_by_name(&self, name: &str) -> Result<Option<Tracker>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM trackers WHERE name = ?1 COLLATE NOCASE AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query(params![name])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::tracker_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_trackers(&self, include_archived: bool) -> Result<Vec<Tracker>> {
        let sql = if include_archived {
            "SELECT * FROM trackers WHERE deleted_at IS NULL ORDER BY name"
        } else {
            "SELECT * FROM trackers WHERE deleted_at IS NULL AND status != 'archived' ORDER BY name"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let trackers = stmt
            .query_map([], Self::tracker_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trackers)
    }

    pub fn set_tracker_status(&self, id: i64, status: TrackerStatus) -> Result<Tracker> {
        let now = Local::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE trackers SET status = ?1, updated_at = ?2 WHERE id = ?3 AND deleted_at IS NULL",
            params![status.as_str(), now, id],
        )?;
        if changed == 0 {
            bail!("Tracker not found");
        }
        self.get_tracker(id)
    }

    /// Soft-delete a tracker and cascade to its templates, instances, and
    /// task instances. Returns (uuid, table) pairs for tombstone recording.
    pub fn soft_delete_tracker(&self, id: i64) -> Result<Vec<(String, &'static str)>> {
        let tracker = self.get_tracker(id)?;
        let now = Local::now().to_rfc3339();
        let mut deleted: Vec<(String, &'static str)> = vec![(tracker.uuid.clone(), "trackers")];

        {
            let mut stmt = self.conn.prepare(
                "SELECT uuid FROM task_templates WHERE tracker_id = ?1 AND deleted_at IS NULL",
            )?;
            for uuid in stmt.query_map(params![id], |r| r.get::<_, String>(0))? {
                deleted.push((uuid?, "task_templates"));
            }
            let mut stmt = self.conn.prepare(
                "SELECT uuid FROM tracker_instances WHERE tracker_id = ?1 AND deleted_at IS NULL",
            )?;
            for uuid in stmt.query_map(params![id], |r| r.get::<_, String>(0))? {
                deleted.push((uuid?, "tracker_instances"));
            }
            let mut stmt = self.conn.prepare(
                "SELECT t.uuid FROM task_instances t
                 JOIN tracker_instances i ON i.id = t.instance_id
                 WHERE i.tracker_id = ?1 AND t.deleted_at IS NULL",
            )?;
            for uuid in stmt.query_map(params![id], |r| r.get::<_, String>(0))? {
                deleted.push((uuid?, "task_instances"));
            }
        }

        self.conn.execute(
            "UPDATE task_instances SET deleted_at = ?1, updated_at = ?1
             WHERE deleted_at IS NULL AND instance_id IN
                 (SELECT id FROM tracker_instances WHERE tracker_id = ?2)",
            params![now, id],
        )?;
        self.conn.execute(
            "UPDATE tracker_instances SET deleted_at = ?1, updated_at = ?1
             WHERE tracker_id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        self.conn.execute(
            "UPDATE task_templates SET deleted_at = ?1, updated_at = ?1
             WHERE tracker_id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        self.conn.execute(
            "UPDATE trackers SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;

        Ok(deleted)
    }

    // --- Task templates ---

    pub fn insert_template(&self, template: &NewTaskTemplate) -> Result<TaskTemplate> {
        // Parent must exist and be live
        self.get_tracker(template.tracker_id)?;
        let now = Local::now().to_rfc3339();
        let uuid = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO task_templates
                 (uuid, tracker_id, description, category, weight, points,
                  include_in_goal, time_of_day, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                uuid,
                template.tracker_id,
                template.description,
                template.category,
                template.weight,
                template.points,
                template.include_in_goal,
                template.time_of_day,
                now,
            ],
        )?;
        self.get_template(self.conn.last_insert_rowid())
    }

    pub fn get_template(&self, id: i64) -> Result<TaskTemplate> {
        self.conn
            .query_row(
                "SELECT * FROM task_templates WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                Self::template_from_row,
            )
            .context("Task template not found")
    }

    pub fn get_template_by_uuid(&self, uuid: &str) -> Result<Option<TaskTemplate>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM task_templates WHERE uuid = ?1")?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::template_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_templates(&self, tracker_id: i64) -> Result<Vec<TaskTemplate>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM task_templates
             WHERE tracker_id = ?1 AND deleted_at IS NULL ORDER BY id",
        )?;
        let templates = stmt
            .query_map(params![tracker_id], Self::template_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    pub fn find_template(&self, tracker_id: i64, description: &str) -> Result<Option<TaskTemplate>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM task_templates
             WHERE tracker_id = ?1 AND description = ?2 COLLATE NOCASE AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query(params![tracker_id, description])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::template_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn update_template(&self, id: i64, update: &UpdateTaskTemplate) -> Result<TaskTemplate> {
        self.get_template(id)?;

        let now = Local::now().to_rfc3339();
        if let Some(ref description) = update.description {
            self.conn.execute(
                "UPDATE task_templates SET description = ?1, updated_at = ?2 WHERE id = ?3",
                params![description, now, id],
            )?;
        }
        if let Some(ref category) = update.category {
            self.conn.execute(
                "UPDATE task_templates SET category = ?1, updated_at = ?2 WHERE id = ?3",
                params![category, now, id],
            )?;
        }
        if let Some(weight) = update.weight {
            self.conn.execute(
                "UPDATE task_templates SET weight = ?1, updated_at = ?2 WHERE id = ?3",
                params![weight, now, id],
            )?;
        }
        if let Some(points) = update.points {
            self.conn.execute(
                "UPDATE task_templates SET points = ?1, updated_at = ?2 WHERE id = ?3",
                params![points, now, id],
            )?;
        }
        if let Some(include_in_goal) = update.include_in_goal {
            self.conn.execute(
                "UPDATE task_templates SET include_in_goal = ?1, updated_at = ?2 WHERE id = ?3",
                params![include_in_goal, now, id],
            )?;
        }
        if let Some(ref time_of_day) = update.time_of_day {
            self.conn.execute(
                "UPDATE task_templates SET time_of_day = ?1, updated_at = ?2 WHERE id = ?3",
                params![time_of_day, now, id],
            )?;
        }

        self.get_template(id)
    }

    /// Soft-delete a template. Future instances stop including it; its
    /// historical task instances stay intact. Returns the uuid for tombstoning.
    pub fn soft_delete_template(&self, id: i64) -> Result<String> {
        let template = self.get_template(id)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE task_templates SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(template.uuid)
    }

    // --- Tracker instances & task instances ---

    pub fn get_instance(&self, tracker_id: i64, tracking_date: &str) -> Result<Option<TrackerInstance>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM tracker_instances
             WHERE tracker_id = ?1 AND tracking_date = ?2 AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query(params![tracker_id, tracking_date])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::instance_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_instance_by_id(&self, id: i64) -> Result<TrackerInstance> {
        self.conn
            .query_row(
                "SELECT * FROM tracker_instances WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                Self::instance_from_row,
            )
            .context("Tracker instance not found")
    }

    pub fn get_instance_by_uuid(&self, uuid: &str) -> Result<Option<TrackerInstance>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM tracker_instances WHERE uuid = ?1")?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::instance_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_or_create_instance(&self, tracker: &Tracker, date: NaiveDate) -> Result<TrackerInstance> {
        self.get_or_create_instance_with_status(tracker, date, TaskStatus::Todo)
            .map(|(instance, _)| instance)
    }

    /// Get the instance covering `date`, creating it (plus one task instance
    /// per live template, with snapshot fields frozen) if missing. The bool
    /// is true when this call created the row.
    ///
    /// Creation races resolve through the (tracker_id, tracking_date)
    /// uniqueness constraint: the insert is `ON CONFLICT DO NOTHING` and the
    /// winning row is re-fetched, so concurrent callers all converge on one
    /// instance and never see a constraint error.
    pub fn get_or_create_instance_with_status(
        &self,
        tracker: &Tracker,
        date: NaiveDate,
        initial_status: TaskStatus,
    ) -> Result<(TrackerInstance, bool)> {
        let period = period_for(date, tracker.time_mode, tracker.week_start);
        let tracking_date = period.tracking_date.format("%Y-%m-%d").to_string();

        if let Some(existing) = self.get_instance(tracker.id, &tracking_date)? {
            return Ok((existing, false));
        }

        let now = Local::now().to_rfc3339();
        let uuid = Uuid::new_v4().to_string();
        let tx = self.conn.unchecked_transaction()?;
        let inserted = self.conn.execute(
            "INSERT INTO tracker_instances
                 (uuid, tracker_id, tracking_date, period_start, period_end, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT (tracker_id, tracking_date) DO NOTHING",
            params![
                uuid,
                tracker.id,
                tracking_date,
                period.start.format("%Y-%m-%d").to_string(),
                period.end.format("%Y-%m-%d").to_string(),
                now,
            ],
        )?;
        if inserted == 1 {
            let instance_id = self.conn.last_insert_rowid();
            for template in self.list_templates(tracker.id)? {
                self.insert_task_instance(instance_id, &template, initial_status, &now)?;
            }
        }
        tx.commit()?;

        // A concurrent creator may have won the slot; fetch whatever row
        // holds it now instead of surfacing the constraint violation.
        let instance = self
            .conn
            .query_row(
                "SELECT * FROM tracker_instances WHERE tracker_id = ?1 AND tracking_date = ?2",
                params![tracker.id, tracking_date],
                Self::instance_from_row,
            )
            .context("Instance missing after get-or-create")?;
        Ok((instance, inserted == 1))
    }

    fn insert_task_instance(
        &self,
        instance_id: i64,
        template: &TaskTemplate,
        status: TaskStatus,
        now: &str,
    ) -> Result<()> {
        let uuid = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO task_instances
                 (uuid, instance_id, template_id, status, description, points, weight,
                  status_updated_at, notes_updated_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?8, ?8)
             ON CONFLICT (instance_id, template_id) DO NOTHING",
            params![
                uuid,
                instance_id,
                template.id,
                status.as_str(),
                template.description,
                template.points,
                template.weight,
                now,
            ],
        )?;
        Ok(())
    }

    /// Get-or-create the task instance for a template inside an existing
    /// instance. Used by history import, where templates can appear after
    /// the instance was materialized.
    pub fn ensure_task_instance(
        &self,
        instance_id: i64,
        template: &TaskTemplate,
    ) -> Result<TaskInstance> {
        if let Some(task) = self.get_task_by_slot(instance_id, template.id)? {
            return Ok(task);
        }
        let now = Local::now().to_rfc3339();
        self.insert_task_instance(instance_id, template, TaskStatus::Todo, &now)?;
        self.get_task_by_slot(instance_id, template.id)?
            .context("Task instance missing after insert")
    }

    const TASK_SELECT: &str =
        "SELECT t.*, (tpl.deleted_at IS NOT NULL) AS template_removed
         FROM task_instances t
         JOIN task_templates tpl ON tpl.id = t.template_id";

    pub fn get_task(&self, id: i64) -> Result<TaskInstance> {
        self.conn
            .query_row(
                &format!("{} WHERE t.id = ?1 AND t.deleted_at IS NULL", Self::TASK_SELECT),
                params![id],
                Self::task_from_row,
            )
            .context("Task instance not found")
    }

    pub fn get_task_by_uuid(&self, uuid: &str) -> Result<Option<TaskInstance>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE t.uuid = ?1", Self::TASK_SELECT))?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::task_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_task_by_slot(&self, instance_id: i64, template_id: i64) -> Result<Option<TaskInstance>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE t.instance_id = ?1 AND t.template_id = ?2",
            Self::TASK_SELECT
        ))?;
        let mut rows = stmt.query(params![instance_id, template_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::task_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_instance_tasks(&self, instance_id: i64) -> Result<Vec<TaskInstance>> {
        let mut stmt = self.conn.prepare(&format!(
            "{} WHERE t.instance_id = ?1 AND t.deleted_at IS NULL ORDER BY t.id",
            Self::TASK_SELECT
        ))?;
        let tasks = stmt
            .query_map(params![instance_id], Self::task_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn instance_view(&self, instance: TrackerInstance) -> Result<InstanceView> {
        let tasks = self.list_instance_tasks(instance.id)?;
        let total_count = tasks.len() as i64;
        let done_count = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .count() as i64;
        let completion_rate = if total_count == 0 {
            0.0
        } else {
            done_count as f64 * 100.0 / total_count as f64
        };
        Ok(InstanceView {
            instance,
            tasks,
            done_count,
            total_count,
            completion_rate,
        })
    }

    /// Fill instances for every period intersecting [start, end]. Existing
    /// instances are left alone; only gaps are materialized. With
    /// `mark_missed_for_past`, gap instances whose period ended before
    /// `today` start life as `missed` rather than `todo`.
    pub fn generate_range(
        &self,
        tracker: &Tracker,
        start: NaiveDate,
        end: NaiveDate,
        options: RangeOptions,
        today: NaiveDate,
    ) -> Result<RangeReport> {
        validate_date_range(start, end)?;

        let mut created = 0;
        let mut existing = 0;
        for period in periods_between(start, end, tracker.time_mode, tracker.week_start) {
            let initial_status = if options.mark_missed_for_past && period.end < today {
                TaskStatus::Missed
            } else {
                TaskStatus::Todo
            };
            let (_, was_created) =
                self.get_or_create_instance_with_status(tracker, period.tracking_date, initial_status)?;
            if was_created {
                created += 1;
            } else {
                existing += 1;
            }
        }
        Ok(RangeReport { created, existing })
    }

    /// Transition a task instance's status. Entering `done` stamps
    /// `completed_at` and backfills `first_completed_at` once; leaving `done`
    /// clears `completed_at` but `first_completed_at` is permanent.
    ///
    /// Streak and goal recomputation is the caller's job; the returned
    /// outcome carries the affected tracker and goal ids for it.
    pub fn toggle_task(&self, task_id: i64, new_status: TaskStatus, now: &str) -> Result<ToggleOutcome> {
        let task = self.get_task(task_id)?;
        let old_status = task.status;

        if old_status != new_status {
            if new_status == TaskStatus::Done {
                self.conn.execute(
                    "UPDATE task_instances
                     SET status = ?1, completed_at = ?2,
                         first_completed_at = COALESCE(first_completed_at, ?2),
                         status_updated_at = ?2, updated_at = ?2
                     WHERE id = ?3",
                    params![new_status.as_str(), now, task_id],
                )?;
            } else if old_status == TaskStatus::Done {
                self.conn.execute(
                    "UPDATE task_instances
                     SET status = ?1, completed_at = NULL,
                         status_updated_at = ?2, updated_at = ?2
                     WHERE id = ?3",
                    params![new_status.as_str(), now, task_id],
                )?;
            } else {
                self.conn.execute(
                    "UPDATE task_instances
                     SET status = ?1, status_updated_at = ?2, updated_at = ?2
                     WHERE id = ?3",
                    params![new_status.as_str(), now, task_id],
                )?;
            }
        }

        let instance = self.get_instance_by_id(task.instance_id)?;
        let affected_goal_ids = self.goals_for_template(task.template_id)?;
        Ok(ToggleOutcome {
            task_id,
            old_status,
            new_status,
            tracker_id: instance.tracker_id,
            instance_id: task.instance_id,
            template_id: task.template_id,
            affected_goal_ids,
        })
    }

    pub fn set_task_notes(&self, task_id: i64, notes: Option<&str>) -> Result<TaskInstance> {
        self.get_task(task_id)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE task_instances SET notes = ?1, notes_updated_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![notes, now, task_id],
        )?;
        self.get_task(task_id)
    }

    // --- Streaks & history ---

    /// Per-period done/total counts for a tracker, newest first.
    fn instance_completion_counts(&self, tracker_id: i64) -> Result<Vec<(String, i64, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.tracking_date,
                    COALESCE(SUM(CASE WHEN t.status = 'done' THEN 1 ELSE 0 END), 0) AS done,
                    COUNT(t.id) AS total
             FROM tracker_instances i
             LEFT JOIN task_instances t ON t.instance_id = i.id AND t.deleted_at IS NULL
             WHERE i.tracker_id = ?1 AND i.deleted_at IS NULL
             GROUP BY i.tracking_date
             ORDER BY i.tracking_date DESC",
        )?;
        let counts = stmt
            .query_map(params![tracker_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    /// Walk instance history backward from `as_of` and compute the current
    /// and longest streak of periods whose completion rate met the threshold.
    ///
    /// The current streak is always a fresh backward scan: a gap (no
    /// instance) or a below-threshold period stops it immediately, so
    /// backdated edits are reflected only through the scan itself. Instances
    /// with zero tasks are transparent: skipped without extending or
    /// breaking either streak.
    pub fn compute_streak(
        &self,
        tracker: &Tracker,
        as_of: NaiveDate,
        threshold_pct: i64,
    ) -> Result<StreakSummary> {
        let mut by_date: BTreeMap<NaiveDate, (i64, i64)> = BTreeMap::new();
        for (date_str, done, total) in self.instance_completion_counts(tracker.id)? {
            let date = NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
                .with_context(|| format!("Corrupt tracking_date '{date_str}'"))?;
            by_date.insert(date, (done, total));
        }

        let meets = |done: i64, total: i64| total > 0 && done * 100 >= total * threshold_pct;
        let mode = tracker.time_mode;
        let week_start = tracker.week_start;

        let Some(earliest) = by_date.keys().next().copied() else {
            return Ok(StreakSummary {
                current: 0,
                longest: 0,
                last_meeting_date: None,
            });
        };

        let mut current = 0;
        let mut cursor = period_for(as_of, mode, week_start).tracking_date;
        while cursor >= earliest {
            match by_date.get(&cursor) {
                None => break,
                Some(&(_, 0)) => {}
                Some(&(done, total)) if meets(done, total) => current += 1,
                Some(_) => break,
            }
            cursor = previous_tracking_date(cursor, mode, week_start);
        }

        let mut longest = 0;
        let mut run = 0;
        let mut last_meeting_date: Option<NaiveDate> = None;
        if let Some(latest) = by_date.keys().last().copied() {
            let mut cursor = latest;
            while cursor >= earliest {
                match by_date.get(&cursor) {
                    None => run = 0,
                    Some(&(_, 0)) => {}
                    Some(&(done, total)) if meets(done, total) => {
                        run += 1;
                        longest = longest.max(run);
                        if last_meeting_date.is_none() {
                            last_meeting_date = Some(cursor);
                        }
                    }
                    Some(_) => run = 0,
                }
                cursor = previous_tracking_date(cursor, mode, week_start);
            }
        }

        Ok(StreakSummary {
            current,
            longest,
            last_meeting_date: last_meeting_date.map(|d| d.format("%Y-%m-%d").to_string()),
        })
    }

    /// Per-period completion stats in a date window, oldest first.
    #[allow(clippy::cast_precision_loss)]
    pub fn tracker_history(
        &self,
        tracker_id: i64,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<InstanceStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.tracking_date,
                    COALESCE(SUM(CASE WHEN t.status = 'done' THEN 1 ELSE 0 END), 0) AS done,
                    COUNT(t.id) AS total
             FROM tracker_instances i
             LEFT JOIN task_instances t ON t.instance_id = i.id AND t.deleted_at IS NULL
             WHERE i.tracker_id = ?1 AND i.deleted_at IS NULL
               AND i.tracking_date >= ?2 AND i.tracking_date <= ?3
             GROUP BY i.tracking_date
             ORDER BY i.tracking_date",
        )?;
        let stats = stmt
            .query_map(
                params![
                    tracker_id,
                    from.format("%Y-%m-%d").to_string(),
                    to.format("%Y-%m-%d").to_string()
                ],
                |row| {
                    let done_count: i64 = row.get(1)?;
                    let total_count: i64 = row.get(2)?;
                    Ok(InstanceStat {
                        tracking_date: row.get(0)?,
                        done_count,
                        total_count,
                        completion_rate: if total_count == 0 {
                            0.0
                        } else {
                            done_count as f64 * 100.0 / total_count as f64
                        },
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    // --- Goals ---

    pub fn insert_goal(&self, goal: &NewGoal) -> Result<Goal> {
        let now = Local::now().to_rfc3339();
        let uuid = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO goals
                 (uuid, title, target_value, current_value, unit, status,
                  start_date, target_date, priority, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, 'active', ?5, ?6, ?7, ?8, ?8)",
            params![
                uuid,
                goal.title,
                goal.target_value,
                goal.unit,
                goal.start_date.format("%Y-%m-%d").to_string(),
                goal.target_date.map(|d| d.format("%Y-%m-%d").to_string()),
                goal.priority,
                now,
            ],
        )?;
        self.get_goal(self.conn.last_insert_rowid())
    }

    pub fn get_goal(&self, id: i64) -> Result<Goal> {
        self.conn
            .query_row(
                "SELECT * FROM goals WHERE id = ?1 AND deleted_at IS NULL",
                params![id],
                Self::goal_from_row,
            )
            .context("Goal not found")
    }

    pub fn get_goal_by_uuid(&self, uuid: &str) -> Result<Option<Goal>> {
        let mut stmt = self.conn.prepare("SELECT * FROM goals WHERE uuid = ?1")?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::goal_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_goals(&self) -> Result<Vec<Goal>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM goals WHERE deleted_at IS NULL ORDER BY priority DESC, id",
        )?;
        let goals = stmt
            .query_map([], Self::goal_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn set_goal_target(&self, id: i64, target_value: f64) -> Result<Goal> {
        self.get_goal(id)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE goals SET target_value = ?1, updated_at = ?2 WHERE id = ?3",
            params![target_value, now, id],
        )?;
        self.get_goal(id)
    }

    pub fn set_goal_status(&self, id: i64, status: GoalStatus) -> Result<Goal> {
        self.get_goal(id)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE goals SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )?;
        self.get_goal(id)
    }

    /// Soft-delete a goal and its mappings. Returns (uuid, table) pairs for
    /// tombstone recording.
    pub fn soft_delete_goal(&self, id: i64) -> Result<Vec<(String, &'static str)>> {
        let goal = self.get_goal(id)?;
        let now = Local::now().to_rfc3339();
        let mut deleted: Vec<(String, &'static str)> = vec![(goal.uuid.clone(), "goals")];
        {
            let mut stmt = self.conn.prepare(
                "SELECT uuid FROM goal_task_mappings WHERE goal_id = ?1 AND deleted_at IS NULL",
            )?;
            for uuid in stmt.query_map(params![id], |r| r.get::<_, String>(0))? {
                deleted.push((uuid?, "goal_task_mappings"));
            }
        }
        self.conn.execute(
            "UPDATE goal_task_mappings SET deleted_at = ?1, updated_at = ?1
             WHERE goal_id = ?2 AND deleted_at IS NULL",
            params![now, id],
        )?;
        self.conn.execute(
            "UPDATE goals SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        Ok(deleted)
    }

    /// Map a template into a goal. Re-mapping an existing pair updates the
    /// weight (and revives a soft-deleted mapping).
    pub fn map_task_to_goal(
        &self,
        goal_id: i64,
        template_id: i64,
        contribution_weight: f64,
    ) -> Result<GoalTaskMapping> {
        self.get_goal(goal_id)?;
        self.get_template(template_id)?;
        let now = Local::now().to_rfc3339();
        let uuid = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO goal_task_mappings
                 (uuid, goal_id, template_id, contribution_weight, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT (goal_id, template_id) DO UPDATE SET
                 contribution_weight = excluded.contribution_weight,
                 updated_at = excluded.updated_at,
                 deleted_at = NULL",
            params![uuid, goal_id, template_id, contribution_weight, now],
        )?;
        self.conn
            .query_row(
                "SELECT * FROM goal_task_mappings WHERE goal_id = ?1 AND template_id = ?2",
                params![goal_id, template_id],
                Self::mapping_from_row,
            )
            .context("Mapping missing after upsert")
    }

    pub fn unmap_task_from_goal(&self, goal_id: i64, template_id: i64) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid FROM goal_task_mappings
             WHERE goal_id = ?1 AND template_id = ?2 AND deleted_at IS NULL",
        )?;
        let mut rows = stmt.query(params![goal_id, template_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let uuid: String = row.get(0)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "UPDATE goal_task_mappings SET deleted_at = ?1, updated_at = ?1
             WHERE goal_id = ?2 AND template_id = ?3",
            params![now, goal_id, template_id],
        )?;
        Ok(Some(uuid))
    }

    pub fn list_goal_mappings(&self, goal_id: i64) -> Result<Vec<GoalTaskMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM goal_task_mappings
             WHERE goal_id = ?1 AND deleted_at IS NULL ORDER BY id",
        )?;
        let mappings = stmt
            .query_map(params![goal_id], Self::mapping_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mappings)
    }

    pub fn goals_for_template(&self, template_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT g.id FROM goals g
             JOIN goal_task_mappings m ON m.goal_id = g.id
             WHERE m.template_id = ?1 AND m.deleted_at IS NULL AND g.deleted_at IS NULL
             ORDER BY g.id",
        )?;
        let ids = stmt
            .query_map(params![template_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Recompute a goal's `current_value` from its mappings and apply the
    /// status transitions. Completions count per mapping: a template feeding
    /// several goals contributes fully to each. The applicable window runs
    /// from the goal's start date through its target date, or `today` when
    /// no target date is set.
    ///
    /// This is a total recomputation and therefore safe to run redundantly.
    #[allow(clippy::cast_precision_loss)]
    pub fn recompute_goal(&self, goal_id: i64, today: NaiveDate) -> Result<GoalProgress> {
        let goal = self.get_goal(goal_id)?;
        let window_end = goal
            .target_date
            .clone()
            .unwrap_or_else(|| today.format("%Y-%m-%d").to_string());

        // Timestamps are RFC 3339 in local time, so the first 10 chars are
        // the completer's local calendar date.
        let mut stmt = self.conn.prepare(
            "SELECT m.contribution_weight, COUNT(t.id)
             FROM goal_task_mappings m
             JOIN task_templates tpl ON tpl.id = m.template_id
                  AND tpl.deleted_at IS NULL AND tpl.include_in_goal = 1
             LEFT JOIN task_instances t ON t.template_id = m.template_id
                  AND t.deleted_at IS NULL
                  AND t.status = 'done'
                  AND t.completed_at IS NOT NULL
                  AND substr(t.completed_at, 1, 10) >= ?2
                  AND substr(t.completed_at, 1, 10) <= ?3
             WHERE m.goal_id = ?1 AND m.deleted_at IS NULL
             GROUP BY m.id, m.contribution_weight",
        )?;
        let rows: Vec<(f64, i64)> = stmt
            .query_map(params![goal_id, goal.start_date, window_end], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let current_value: f64 = rows.iter().map(|(w, count)| w * *count as f64).sum();

        let mut status = goal.status;
        let mut newly_achieved = false;
        match goal.status {
            GoalStatus::Active if current_value >= goal.target_value => {
                status = GoalStatus::Achieved;
                newly_achieved = true;
            }
            GoalStatus::Achieved if current_value < goal.target_value => {
                status = GoalStatus::Active;
            }
            _ => {}
        }

        if (current_value - goal.current_value).abs() > f64::EPSILON || status != goal.status {
            let now = Local::now().to_rfc3339();
            self.conn.execute(
                "UPDATE goals SET current_value = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
                params![current_value, status.as_str(), now, goal_id],
            )?;
        }

        Ok(GoalProgress {
            goal_id,
            current_value,
            status,
            newly_achieved,
        })
    }

    // --- Settings & config ---

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO user_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM user_settings WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM user_settings WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    fn get_config(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self.conn.prepare("SELECT value FROM config WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    pub fn get_or_create_device_id(&self) -> Result<String> {
        if let Some(id) = self.get_config("device_id")? {
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES ('device_id', ?1)",
            params![id],
        )?;
        Ok(id)
    }

    // --- Share links ---

    pub fn create_share_link(
        &self,
        tracker_id: i64,
        token: &str,
        max_uses: Option<i64>,
        expires_at: Option<&str>,
    ) -> Result<ShareLink> {
        self.get_tracker(tracker_id)?;
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO share_links (token, tracker_id, max_uses, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![token, tracker_id, max_uses, expires_at, now],
        )?;
        self.get_share_link(token)?
            .context("Share link missing after insert")
    }

    pub fn get_share_link(&self, token: &str) -> Result<Option<ShareLink>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM share_links WHERE token = ?1")?;
        let mut rows = stmt.query(params![token])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::share_link_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Claim one use of a share link. The increment and the max-uses check
    /// are a single conditional UPDATE, so concurrent claimers cannot
    /// overshoot the limit.
    pub fn claim_share_link(&self, token: &str, now: &str) -> Result<ShareLink> {
        let claimed = self.conn.execute(
            "UPDATE share_links SET use_count = use_count + 1
             WHERE token = ?1
               AND (max_uses IS NULL OR use_count < max_uses)
               AND (expires_at IS NULL OR expires_at > ?2)",
            params![token, now],
        )?;
        if claimed == 0 {
            match self.get_share_link(token)? {
                None => bail!("Share link not found"),
                Some(link) => {
                    if link.expires_at.as_deref().is_some_and(|e| e <= now) {
                        bail!("Share link has expired");
                    }
                    bail!("Share link has reached its maximum number of uses");
                }
            }
        }
        self.get_share_link(token)?
            .context("Share link missing after claim")
    }

    // --- Tombstones ---

    pub fn record_tombstone(&self, uuid: &str, table_name: &str) -> Result<()> {
        let now = Local::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO sync_tombstones (uuid, table_name, deleted_at) VALUES (?1, ?2, ?3)",
            params![uuid, table_name, now],
        )?;
        Ok(())
    }

    pub fn get_tombstones(&self) -> Result<Vec<SyncTombstone>> {
        let mut stmt = self
            .conn
            .prepare("SELECT uuid, table_name, deleted_at FROM sync_tombstones")?;
        let tombstones = stmt
            .query_map([], Self::tombstone_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tombstones)
    }

    pub fn get_tombstones_since(&self, since: &str) -> Result<Vec<SyncTombstone>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, table_name, deleted_at FROM sync_tombstones WHERE deleted_at > ?1",
        )?;
        let tombstones = stmt
            .query_map(params![since], Self::tombstone_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tombstones)
    }

    fn tombstone_from_row(row: &rusqlite::Row) -> rusqlite::Result<SyncTombstone> {
        Ok(SyncTombstone {
            uuid: row.get(0)?,
            table_name: row.get(1)?,
            deleted_at: row.get(2)?,
        })
    }

    pub fn clear_tombstones(&self) -> Result<()> {
        self.conn.execute("DELETE FROM sync_tombstones", [])?;
        Ok(())
    }

    /// Apply an incoming tombstone as a soft delete, cascading the same way
    /// local deletes do. Unknown uuids are fine: the tombstone is still
    /// stored for onward propagation.
    fn apply_tombstone(&self, tombstone: &SyncTombstone) -> Result<()> {
        let ts = &tombstone.deleted_at;
        match tombstone.table_name.as_str() {
            "trackers" => {
                if let Some(tracker) = self.get_tracker_by_uuid(&tombstone.uuid)? {
                    if tracker.deleted_at.is_none() {
                        for (uuid, table) in self.soft_delete_tracker(tracker.id)? {
                            self.record_tombstone_if_missing(&uuid, table, ts)?;
                        }
                    }
                }
            }
            "task_templates" => {
                self.conn.execute(
                    "UPDATE task_templates SET deleted_at = ?1, updated_at = ?1
                     WHERE uuid = ?2 AND deleted_at IS NULL",
                    params![ts, tombstone.uuid],
                )?;
            }
            "tracker_instances" => {
                self.conn.execute(
                    "UPDATE task_instances SET deleted_at = ?1, updated_at = ?1
                     WHERE deleted_at IS NULL AND instance_id IN
                         (SELECT id FROM tracker_instances WHERE uuid = ?2)",
                    params![ts, tombstone.uuid],
                )?;
                self.conn.execute(
                    "UPDATE tracker_instances SET deleted_at = ?1, updated_at = ?1
                     WHERE uuid = ?2 AND deleted_at IS NULL",
                    params![ts, tombstone.uuid],
                )?;
            }
            "task_instances" => {
                self.conn.execute(
                    "UPDATE task_instances SET deleted_at = ?1, updated_at = ?1
                     WHERE uuid = ?2 AND deleted_at IS NULL",
                    params![ts, tombstone.uuid],
                )?;
            }
            "goals" => {
                if let Some(goal) = self.get_goal_by_uuid(&tombstone.uuid)? {
                    if goal.deleted_at.is_none() {
                        for (uuid, table) in self.soft_delete_goal(goal.id)? {
                            self.record_tombstone_if_missing(&uuid, table, ts)?;
                        }
                    }
                }
            }
            "goal_task_mappings" => {
                self.conn.execute(
                    "UPDATE goal_task_mappings SET deleted_at = ?1, updated_at = ?1
                     WHERE uuid = ?2 AND deleted_at IS NULL",
                    params![ts, tombstone.uuid],
                )?;
            }
            _ => {}
        }

        self.record_tombstone_if_missing(&tombstone.uuid, &tombstone.table_name, ts)
    }

    fn record_tombstone_if_missing(&self, uuid: &str, table_name: &str, deleted_at: &str) -> Result<()> {
        let known: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sync_tombstones WHERE uuid = ?1 AND table_name = ?2",
            params![uuid, table_name],
            |row| row.get(0),
        )?;
        if known == 0 {
            self.conn.execute(
                "INSERT INTO sync_tombstones (uuid, table_name, deleted_at) VALUES (?1, ?2, ?3)",
                params![uuid, table_name, deleted_at],
            )?;
        }
        Ok(())
    }

    // --- Delta sync: outbound queries ---
    //
    // Soft-deleted rows are excluded everywhere; deletions travel as
    // tombstones. Parent references travel as uuids.

    pub fn get_trackers_since(&self, since: Option<&str>) -> Result<Vec<SyncTracker>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, name, time_mode, status, week_start, created_at, updated_at
             FROM trackers
             WHERE deleted_at IS NULL AND (?1 IS NULL OR updated_at > ?1)
             ORDER BY id",
        )?;
        let trackers = stmt
            .query_map(params![since], |row| {
                Ok(SyncTracker {
                    uuid: row.get(0)?,
                    name: row.get(1)?,
                    time_mode: row.get(2)?,
                    status: row.get(3)?,
                    week_start: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trackers)
    }

    pub fn get_templates_since(&self, since: Option<&str>) -> Result<Vec<SyncTemplate>> {
        let mut stmt = self.conn.prepare(
            "SELECT tpl.uuid, tr.uuid, tpl.description, tpl.category, tpl.weight, tpl.points,
                    tpl.include_in_goal, tpl.time_of_day, tpl.created_at, tpl.updated_at
             FROM task_templates tpl
             JOIN trackers tr ON tr.id = tpl.tracker_id
             WHERE tpl.deleted_at IS NULL AND (?1 IS NULL OR tpl.updated_at > ?1)
             ORDER BY tpl.id",
        )?;
        let templates = stmt
            .query_map(params![since], |row| {
                Ok(SyncTemplate {
                    uuid: row.get(0)?,
                    tracker_uuid: row.get(1)?,
                    description: row.get(2)?,
                    category: row.get(3)?,
                    weight: row.get(4)?,
                    points: row.get(5)?,
                    include_in_goal: row.get(6)?,
                    time_of_day: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(templates)
    }

    pub fn get_instances_since(&self, since: Option<&str>) -> Result<Vec<SyncInstance>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.uuid, tr.uuid, i.tracking_date, i.period_start, i.period_end,
                    i.created_at, i.updated_at
             FROM tracker_instances i
             JOIN trackers tr ON tr.id = i.tracker_id
             WHERE i.deleted_at IS NULL AND (?1 IS NULL OR i.updated_at > ?1)
             ORDER BY i.id",
        )?;
        let instances = stmt
            .query_map(params![since], |row| {
                Ok(SyncInstance {
                    uuid: row.get(0)?,
                    tracker_uuid: row.get(1)?,
                    tracking_date: row.get(2)?,
                    period_start: row.get(3)?,
                    period_end: row.get(4)?,
                    created_at: row.get(5)?,
                    updated_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    pub fn get_task_instances_since(&self, since: Option<&str>) -> Result<Vec<SyncTaskInstance>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.uuid, i.uuid, tpl.uuid, t.status, t.description, t.points, t.weight,
                    t.first_completed_at, t.completed_at, t.notes,
                    t.status_updated_at, t.notes_updated_at, t.created_at, t.updated_at
             FROM task_instances t
             JOIN tracker_instances i ON i.id = t.instance_id
             JOIN task_templates tpl ON tpl.id = t.template_id
             WHERE t.deleted_at IS NULL AND (?1 IS NULL OR t.updated_at > ?1)
             ORDER BY t.id",
        )?;
        let tasks = stmt
            .query_map(params![since], |row| {
                Ok(SyncTaskInstance {
                    uuid: row.get(0)?,
                    instance_uuid: row.get(1)?,
                    template_uuid: row.get(2)?,
                    status: row.get(3)?,
                    description: row.get(4)?,
                    points: row.get(5)?,
                    weight: row.get(6)?,
                    first_completed_at: row.get(7)?,
                    completed_at: row.get(8)?,
                    notes: row.get(9)?,
                    status_updated_at: row.get(10)?,
                    notes_updated_at: row.get(11)?,
                    created_at: row.get(12)?,
                    updated_at: row.get(13)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    pub fn get_goals_since(&self, since: Option<&str>) -> Result<Vec<SyncGoal>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid, title, target_value, unit, status, start_date, target_date,
                    priority, created_at, updated_at
             FROM goals
             WHERE deleted_at IS NULL AND (?1 IS NULL OR updated_at > ?1)
             ORDER BY id",
        )?;
        let goals = stmt
            .query_map(params![since], |row| {
                Ok(SyncGoal {
                    uuid: row.get(0)?,
                    title: row.get(1)?,
                    target_value: row.get(2)?,
                    unit: row.get(3)?,
                    status: row.get(4)?,
                    start_date: row.get(5)?,
                    target_date: row.get(6)?,
                    priority: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(goals)
    }

    pub fn get_mappings_since(&self, since: Option<&str>) -> Result<Vec<SyncMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT m.uuid, g.uuid, tpl.uuid, m.contribution_weight, m.created_at, m.updated_at
             FROM goal_task_mappings m
             JOIN goals g ON g.id = m.goal_id
             JOIN task_templates tpl ON tpl.id = m.template_id
             WHERE m.deleted_at IS NULL AND (?1 IS NULL OR m.updated_at > ?1)
             ORDER BY m.id",
        )?;
        let mappings = stmt
            .query_map(params![since], |row| {
                Ok(SyncMapping {
                    uuid: row.get(0)?,
                    goal_uuid: row.get(1)?,
                    template_uuid: row.get(2)?,
                    contribution_weight: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(mappings)
    }

    pub fn changes_since(&self, since: Option<&str>, server_timestamp: &str) -> Result<SyncPayload> {
        Ok(SyncPayload {
            trackers: self.get_trackers_since(since)?,
            templates: self.get_templates_since(since)?,
            instances: self.get_instances_since(since)?,
            task_instances: self.get_task_instances_since(since)?,
            goals: self.get_goals_since(since)?,
            mappings: self.get_mappings_since(since)?,
            tombstones: match since {
                Some(ts) => self.get_tombstones_since(ts)?,
                None => self.get_tombstones()?,
            },
            server_timestamp: server_timestamp.to_string(),
        })
    }

    // --- Delta sync: inbound merge ---

    /// Merge a batch of client changes, last-writer-wins per record (per
    /// field group for task instances). Returns what was applied and what
    /// lost. Replaying an already-applied batch is a no-op on both lists.
    #[allow(clippy::too_many_lines)]
    pub fn apply_changes(&self, req: &SyncRequest) -> Result<(Vec<AppliedChange>, Vec<SyncConflict>)> {
        let mut applied: Vec<AppliedChange> = Vec::new();
        let mut conflicts: Vec<SyncConflict> = Vec::new();
        let tx = self.conn.unchecked_transaction()?;

        // Step 1: trackers — build uuid → local id map for children
        let mut tracker_ids: HashMap<String, i64> = HashMap::new();
        for tracker in &req.trackers {
            if tracker.uuid.is_empty() {
                continue;
            }
            if let Some(existing) = self.get_tracker_by_uuid(&tracker.uuid)? {
                tracker_ids.insert(tracker.uuid.clone(), existing.id);
                if newer_or_differs(
                    &tracker.updated_at,
                    &existing.updated_at,
                    sync_tracker_matches(tracker, &existing),
                ) {
                    self.conn.execute(
                        "UPDATE trackers SET name = ?1, time_mode = ?2, status = ?3,
                             week_start = ?4, updated_at = ?5, deleted_at = NULL
                         WHERE uuid = ?6",
                        params![
                            tracker.name,
                            tracker.time_mode,
                            tracker.status,
                            tracker.week_start,
                            tracker.updated_at,
                            tracker.uuid,
                        ],
                    )?;
                    push_applied(&mut applied, "trackers", &tracker.uuid);
                } else if tracker.updated_at < existing.updated_at {
                    conflicts.push(conflict(
                        "trackers",
                        &tracker.uuid,
                        None,
                        &tracker.updated_at,
                        &existing.updated_at,
                    ));
                }
            } else {
                self.conn.execute(
                    "INSERT INTO trackers
                         (uuid, name, time_mode, status, week_start, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        tracker.uuid,
                        tracker.name,
                        tracker.time_mode,
                        tracker.status,
                        tracker.week_start,
                        tracker.created_at,
                        tracker.updated_at,
                    ],
                )?;
                tracker_ids.insert(tracker.uuid.clone(), self.conn.last_insert_rowid());
                push_applied(&mut applied, "trackers", &tracker.uuid);
            }
        }

        // Step 2: templates
        let mut template_ids: HashMap<String, i64> = HashMap::new();
        for template in &req.templates {
            if template.uuid.is_empty() {
                continue;
            }
            let Some(tracker_id) =
                self.resolve_parent(&tracker_ids, &template.tracker_uuid, "trackers")?
            else {
                continue;
            };
            if let Some(existing) = self.get_template_by_uuid(&template.uuid)? {
                template_ids.insert(template.uuid.clone(), existing.id);
                if newer_or_differs(
                    &template.updated_at,
                    &existing.updated_at,
                    sync_template_matches(template, &existing),
                ) {
                    self.conn.execute(
                        "UPDATE task_templates SET description = ?1, category = ?2, weight = ?3,
                             points = ?4, include_in_goal = ?5, time_of_day = ?6,
                             updated_at = ?7, deleted_at = NULL
                         WHERE uuid = ?8",
                        params![
                            template.description,
                            template.category,
                            template.weight,
                            template.points,
                            template.include_in_goal,
                            template.time_of_day,
                            template.updated_at,
                            template.uuid,
                        ],
                    )?;
                    push_applied(&mut applied, "task_templates", &template.uuid);
                } else if template.updated_at < existing.updated_at {
                    conflicts.push(conflict(
                        "task_templates",
                        &template.uuid,
                        None,
                        &template.updated_at,
                        &existing.updated_at,
                    ));
                }
            } else {
                self.conn.execute(
                    "INSERT INTO task_templates
                         (uuid, tracker_id, description, category, weight, points,
                          include_in_goal, time_of_day, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        template.uuid,
                        tracker_id,
                        template.description,
                        template.category,
                        template.weight,
                        template.points,
                        template.include_in_goal,
                        template.time_of_day,
                        template.created_at,
                        template.updated_at,
                    ],
                )?;
                template_ids.insert(template.uuid.clone(), self.conn.last_insert_rowid());
                push_applied(&mut applied, "task_templates", &template.uuid);
            }
        }

        // Step 3: instances. Two devices can lazily materialize the same
        // period under different uuids; the (tracker_id, tracking_date) slot
        // identifies the logical instance, so an unknown uuid landing on an
        // occupied slot merges onto the existing row.
        let mut instance_ids: HashMap<String, i64> = HashMap::new();
        for instance in &req.instances {
            if instance.uuid.is_empty() {
                continue;
            }
            let Some(tracker_id) =
                self.resolve_parent(&tracker_ids, &instance.tracker_uuid, "trackers")?
            else {
                continue;
            };
            let existing = match self.get_instance_by_uuid(&instance.uuid)? {
                Some(row) => Some(row),
                None => self.get_instance_any(tracker_id, &instance.tracking_date)?,
            };
            if let Some(existing) = existing {
                instance_ids.insert(instance.uuid.clone(), existing.id);
                if newer_or_differs(
                    &instance.updated_at,
                    &existing.updated_at,
                    sync_instance_matches(instance, &existing),
                ) {
                    self.conn.execute(
                        "UPDATE tracker_instances SET period_start = ?1, period_end = ?2,
                             updated_at = ?3, deleted_at = NULL
                         WHERE id = ?4",
                        params![
                            instance.period_start,
                            instance.period_end,
                            instance.updated_at,
                            existing.id,
                        ],
                    )?;
                    push_applied(&mut applied, "tracker_instances", &instance.uuid);
                } else if instance.updated_at < existing.updated_at {
                    conflicts.push(conflict(
                        "tracker_instances",
                        &instance.uuid,
                        None,
                        &instance.updated_at,
                        &existing.updated_at,
                    ));
                }
            } else {
                self.conn.execute(
                    "INSERT INTO tracker_instances
                         (uuid, tracker_id, tracking_date, period_start, period_end,
                          created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        instance.uuid,
                        tracker_id,
                        instance.tracking_date,
                        instance.period_start,
                        instance.period_end,
                        instance.created_at,
                        instance.updated_at,
                    ],
                )?;
                instance_ids.insert(instance.uuid.clone(), self.conn.last_insert_rowid());
                push_applied(&mut applied, "tracker_instances", &instance.uuid);
            }
        }

        // Step 4: task instances — LWW per field group (status vs notes), so
        // a toggle on one device and a note edit on another merge cleanly.
        for task in &req.task_instances {
            if task.uuid.is_empty() {
                continue;
            }
            let Some(instance_id) =
                self.resolve_parent(&instance_ids, &task.instance_uuid, "tracker_instances")?
            else {
                continue;
            };
            let Some(template_id) =
                self.resolve_parent(&template_ids, &task.template_uuid, "task_templates")?
            else {
                continue;
            };
            let existing = match self.get_task_by_uuid(&task.uuid)? {
                Some(row) => Some(row),
                None => self.get_task_by_slot(instance_id, template_id)?,
            };
            if let Some(existing) = existing {
                let mut touched = false;

                let status_matches = task.status == existing.status.as_str()
                    && task.completed_at == existing.completed_at;
                if newer_or_differs(
                    &task.status_updated_at,
                    &existing.status_updated_at,
                    status_matches,
                ) {
                    self.conn.execute(
                        "UPDATE task_instances SET status = ?1, completed_at = ?2,
                             first_completed_at = COALESCE(first_completed_at, ?3),
                             status_updated_at = ?4,
                             updated_at = MAX(updated_at, ?4),
                             deleted_at = NULL
                         WHERE id = ?5",
                        params![
                            task.status,
                            task.completed_at,
                            task.first_completed_at,
                            task.status_updated_at,
                            existing.id,
                        ],
                    )?;
                    touched = true;
                } else if task.status_updated_at < existing.status_updated_at {
                    conflicts.push(conflict(
                        "task_instances",
                        &task.uuid,
                        Some("status"),
                        &task.status_updated_at,
                        &existing.status_updated_at,
                    ));
                }

                let notes_match = task.notes == existing.notes;
                if newer_or_differs(&task.notes_updated_at, &existing.notes_updated_at, notes_match)
                {
                    self.conn.execute(
                        "UPDATE task_instances SET notes = ?1, notes_updated_at = ?2,
                             updated_at = MAX(updated_at, ?2)
                         WHERE id = ?3",
                        params![task.notes, task.notes_updated_at, existing.id],
                    )?;
                    touched = true;
                } else if task.notes_updated_at < existing.notes_updated_at {
                    conflicts.push(conflict(
                        "task_instances",
                        &task.uuid,
                        Some("notes"),
                        &task.notes_updated_at,
                        &existing.notes_updated_at,
                    ));
                }

                if touched {
                    push_applied(&mut applied, "task_instances", &task.uuid);
                }
            } else {
                self.conn.execute(
                    "INSERT INTO task_instances
                         (uuid, instance_id, template_id, status, description, points, weight,
                          first_completed_at, completed_at, notes,
                          status_updated_at, notes_updated_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        task.uuid,
                        instance_id,
                        template_id,
                        task.status,
                        task.description,
                        task.points,
                        task.weight,
                        task.first_completed_at,
                        task.completed_at,
                        task.notes,
                        task.status_updated_at,
                        task.notes_updated_at,
                        task.created_at,
                        task.updated_at,
                    ],
                )?;
                push_applied(&mut applied, "task_instances", &task.uuid);
            }
        }

        // Step 5: goals. current_value is never synced; it is recomputed
        // from merged task instances after the batch lands.
        let mut goal_ids: HashMap<String, i64> = HashMap::new();
        for goal in &req.goals {
            if goal.uuid.is_empty() {
                continue;
            }
            if let Some(existing) = self.get_goal_by_uuid(&goal.uuid)? {
                goal_ids.insert(goal.uuid.clone(), existing.id);
                if newer_or_differs(
                    &goal.updated_at,
                    &existing.updated_at,
                    sync_goal_matches(goal, &existing),
                ) {
                    self.conn.execute(
                        "UPDATE goals SET title = ?1, target_value = ?2, unit = ?3, status = ?4,
                             start_date = ?5, target_date = ?6, priority = ?7,
                             updated_at = ?8, deleted_at = NULL
                         WHERE uuid = ?9",
                        params![
                            goal.title,
                            goal.target_value,
                            goal.unit,
                            goal.status,
                            goal.start_date,
                            goal.target_date,
                            goal.priority,
                            goal.updated_at,
                            goal.uuid,
                        ],
                    )?;
                    push_applied(&mut applied, "goals", &goal.uuid);
                } else if goal.updated_at < existing.updated_at {
                    conflicts.push(conflict(
                        "goals",
                        &goal.uuid,
                        None,
                        &goal.updated_at,
                        &existing.updated_at,
                    ));
                }
            } else {
                self.conn.execute(
                    "INSERT INTO goals
                         (uuid, title, target_value, current_value, unit, status,
                          start_date, target_date, priority, created_at, updated_at)
                     VALUES (?1, ?2, ?3, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        goal.uuid,
                        goal.title,
                        goal.target_value,
                        goal.unit,
                        goal.status,
                        goal.start_date,
                        goal.target_date,
                        goal.priority,
                        goal.created_at,
                        goal.updated_at,
                    ],
                )?;
                goal_ids.insert(goal.uuid.clone(), self.conn.last_insert_rowid());
                push_applied(&mut applied, "goals", &goal.uuid);
            }
        }

        // Step 6: mappings — the (goal_id, template_id) slot identifies the
        // logical mapping, as with instance slots.
        for mapping in &req.mappings {
            if mapping.uuid.is_empty() {
                continue;
            }
            let Some(goal_id) = self.resolve_parent(&goal_ids, &mapping.goal_uuid, "goals")? else {
                continue;
            };
            let Some(template_id) =
                self.resolve_parent(&template_ids, &mapping.template_uuid, "task_templates")?
            else {
                continue;
            };
            let existing = match self.get_mapping_by_uuid(&mapping.uuid)? {
                Some(row) => Some(row),
                None => self.get_mapping_by_slot(goal_id, template_id)?,
            };
            if let Some(existing) = existing {
                let matches = (mapping.contribution_weight - existing.contribution_weight).abs()
                    < f64::EPSILON;
                if newer_or_differs(&mapping.updated_at, &existing.updated_at, matches) {
                    self.conn.execute(
                        "UPDATE goal_task_mappings SET contribution_weight = ?1,
                             updated_at = ?2, deleted_at = NULL
                         WHERE id = ?3",
                        params![mapping.contribution_weight, mapping.updated_at, existing.id],
                    )?;
                    push_applied(&mut applied, "goal_task_mappings", &mapping.uuid);
                } else if mapping.updated_at < existing.updated_at {
                    conflicts.push(conflict(
                        "goal_task_mappings",
                        &mapping.uuid,
                        None,
                        &mapping.updated_at,
                        &existing.updated_at,
                    ));
                }
            } else {
                self.conn.execute(
                    "INSERT INTO goal_task_mappings
                         (uuid, goal_id, template_id, contribution_weight, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        mapping.uuid,
                        goal_id,
                        template_id,
                        mapping.contribution_weight,
                        mapping.created_at,
                        mapping.updated_at,
                    ],
                )?;
                push_applied(&mut applied, "goal_task_mappings", &mapping.uuid);
            }
        }

        // Step 7: tombstones — deletions win over the merged rows above.
        for tombstone in &req.tombstones {
            self.apply_tombstone(tombstone)?;
        }

        tx.commit()?;
        Ok((applied, conflicts))
    }

    fn get_instance_any(&self, tracker_id: i64, tracking_date: &str) -> Result<Option<TrackerInstance>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM tracker_instances WHERE tracker_id = ?1 AND tracking_date = ?2",
        )?;
        let mut rows = stmt.query(params![tracker_id, tracking_date])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::instance_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_mapping_by_uuid(&self, uuid: &str) -> Result<Option<GoalTaskMapping>> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM goal_task_mappings WHERE uuid = ?1")?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::mapping_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_mapping_by_slot(&self, goal_id: i64, template_id: i64) -> Result<Option<GoalTaskMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM goal_task_mappings WHERE goal_id = ?1 AND template_id = ?2",
        )?;
        let mut rows = stmt.query(params![goal_id, template_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::mapping_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Resolve a parent uuid to a local row id, preferring the ids assigned
    /// earlier in this batch. Dangling references resolve to `None` and the
    /// child record is skipped, not an error.
    fn resolve_parent(
        &self,
        batch_ids: &HashMap<String, i64>,
        uuid: &str,
        table: &str,
    ) -> Result<Option<i64>> {
        if uuid.is_empty() {
            return Ok(None);
        }
        if let Some(&id) = batch_ids.get(uuid) {
            return Ok(Some(id));
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {table} WHERE uuid = ?1"))?;
        let mut rows = stmt.query(params![uuid])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

// --- Merge helpers ---

/// True when the client's write should be applied: its timestamp is strictly
/// newer, or equal with a payload that differs (ties go to the client).
/// Equal timestamp and equal payload is the idempotent-replay case.
fn newer_or_differs(client_ts: &str, server_ts: &str, payload_matches: bool) -> bool {
    client_ts > server_ts || (client_ts == server_ts && !payload_matches)
}

fn push_applied(applied: &mut Vec<AppliedChange>, table: &str, uuid: &str) {
    applied.push(AppliedChange {
        table: table.to_string(),
        uuid: uuid.to_string(),
    });
}

fn conflict(
    table: &str,
    uuid: &str,
    field_group: Option<&str>,
    client_ts: &str,
    server_ts: &str,
) -> SyncConflict {
    SyncConflict {
        table: table.to_string(),
        uuid: uuid.to_string(),
        field_group: field_group.map(ToString::to_string),
        client_updated_at: client_ts.to_string(),
        server_updated_at: server_ts.to_string(),
    }
}

fn sync_tracker_matches(client: &SyncTracker, server: &Tracker) -> bool {
    client.name == server.name
        && client.time_mode == server.time_mode.as_str()
        && client.status == server.status.as_str()
        && client.week_start == server.week_start
        && server.deleted_at.is_none()
}

fn sync_template_matches(client: &SyncTemplate, server: &TaskTemplate) -> bool {
    client.description == server.description
        && client.category == server.category
        && client.weight == server.weight
        && client.points == server.points
        && client.include_in_goal == server.include_in_goal
        && client.time_of_day == server.time_of_day
        && server.deleted_at.is_none()
}

fn sync_instance_matches(client: &SyncInstance, server: &TrackerInstance) -> bool {
    client.period_start == server.period_start
        && client.period_end == server.period_end
        && server.deleted_at.is_none()
}

fn sync_goal_matches(client: &SyncGoal, server: &Goal) -> bool {
    client.title == server.title
        && (client.target_value - server.target_value).abs() < f64::EPSILON
        && client.unit == server.unit
        && client.status == server.status.as_str()
        && client.start_date == server.start_date
        && client.target_date == server.target_date
        && client.priority == server.priority
        && server.deleted_at.is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewTaskTemplate, RangeOptions};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn daily_tracker(db: &Database, name: &str) -> Tracker {
        db.insert_tracker(&NewTracker {
            name: name.to_string(),
            time_mode: TimeMode::Daily,
            week_start: 0,
        })
        .unwrap()
    }

    fn add_task(db: &Database, tracker_id: i64, description: &str) -> TaskTemplate {
        db.insert_template(&NewTaskTemplate {
            tracker_id,
            description: description.to_string(),
            category: None,
            weight: 1,
            points: 0,
            include_in_goal: true,
            time_of_day: None,
        })
        .unwrap()
    }

    fn sample_goal(db: &Database, title: &str, target: f64) -> Goal {
        db.insert_goal(&NewGoal {
            title: title.to_string(),
            target_value: target,
            unit: None,
            start_date: d(2025, 1, 1),
            target_date: None,
            priority: 0,
        })
        .unwrap()
    }

    /// Toggle the first `n` tasks of an instance to done at `when`.
    fn complete_n(db: &Database, instance_id: i64, n: usize, when: &str) {
        for task in db.list_instance_tasks(instance_id).unwrap().iter().take(n) {
            db.toggle_task(task.id, TaskStatus::Done, when).unwrap();
        }
    }

    fn complete_all(db: &Database, instance_id: i64, when: &str) {
        let count = db.list_instance_tasks(instance_id).unwrap().len();
        complete_n(db, instance_id, count, when);
    }

    // --- Trackers & templates ---

    #[test]
    fn test_insert_tracker_generates_uuid() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        assert!(uuid::Uuid::parse_str(&tracker.uuid).is_ok());
        assert!(!tracker.created_at.is_empty());
        assert_eq!(tracker.status, TrackerStatus::Active);
        assert_eq!(tracker.time_mode, TimeMode::Daily);
    }

    #[test]
    fn test_get_tracker_by_name_case_insensitive() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Morning Routine");
        let found = db.get_tracker_by_name("morning routine").unwrap().unwrap();
        assert_eq!(found.id, tracker.id);
        assert!(db.get_tracker_by_name("nope").unwrap().is_none());
    }

    #[test]
    fn test_list_trackers_excludes_archived_by_default() {
        let db = Database::open_in_memory().unwrap();
        let a = daily_tracker(&db, "A");
        let _b = daily_tracker(&db, "B");
        db.set_tracker_status(a.id, TrackerStatus::Archived).unwrap();
        assert_eq!(db.list_trackers(false).unwrap().len(), 1);
        assert_eq!(db.list_trackers(true).unwrap().len(), 2);
    }

    // --- Instances: lazy creation, snapshots, uniqueness ---

    #[test]
    fn test_get_or_create_snapshots_templates() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        db.insert_template(&NewTaskTemplate {
            tracker_id: tracker.id,
            description: "Pushups".to_string(),
            category: Some("strength".to_string()),
            weight: 3,
            points: 10,
            include_in_goal: true,
            time_of_day: Some("morning".to_string()),
        })
        .unwrap();
        add_task(&db, tracker.id, "Stretch");

        let (instance, created) = db
            .get_or_create_instance_with_status(&tracker, d(2025, 1, 15), TaskStatus::Todo)
            .unwrap();
        assert!(created);
        assert_eq!(instance.tracking_date, "2025-01-15");
        assert_eq!(instance.period_start, "2025-01-15");
        assert_eq!(instance.period_end, "2025-01-15");

        let tasks = db.list_instance_tasks(instance.id).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].description, "Pushups");
        assert_eq!(tasks[0].weight, 3);
        assert_eq!(tasks[0].points, 10);
        assert_eq!(tasks[0].status, TaskStatus::Todo);
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");

        let (first, created) = db
            .get_or_create_instance_with_status(&tracker, d(2025, 1, 15), TaskStatus::Todo)
            .unwrap();
        assert!(created);
        let (second, created) = db
            .get_or_create_instance_with_status(&tracker, d(2025, 1, 15), TaskStatus::Todo)
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(db.list_instance_tasks(first.id).unwrap().len(), 1);
    }

    #[test]
    fn test_weekly_instance_shares_period() {
        let db = Database::open_in_memory().unwrap();
        let tracker = db
            .insert_tracker(&NewTracker {
                name: "Review".to_string(),
                time_mode: TimeMode::Weekly,
                week_start: 0,
            })
            .unwrap();
        add_task(&db, tracker.id, "Weekly review");

        // Wednesday and Friday of the same week resolve to one instance
        let (a, _) = db
            .get_or_create_instance_with_status(&tracker, d(2025, 3, 12), TaskStatus::Todo)
            .unwrap();
        let (b, created) = db
            .get_or_create_instance_with_status(&tracker, d(2025, 3, 14), TaskStatus::Todo)
            .unwrap();
        assert!(!created);
        assert_eq!(a.id, b.id);
        assert_eq!(a.tracking_date, "2025-03-10");
        assert_eq!(a.period_end, "2025-03-16");
    }

    #[test]
    fn test_snapshot_immutable_after_template_edit() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        let template = add_task(&db, tracker.id, "Pushups");
        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();

        db.update_template(
            template.id,
            &UpdateTaskTemplate {
                description: Some("Pullups".to_string()),
                weight: Some(9),
                ..Default::default()
            },
        )
        .unwrap();

        let tasks = db.list_instance_tasks(instance.id).unwrap();
        assert_eq!(tasks[0].description, "Pushups");
        assert_eq!(tasks[0].weight, 1);

        // New instances pick up the edit
        let later = db.get_or_create_instance(&tracker, d(2025, 1, 16)).unwrap();
        let tasks = db.list_instance_tasks(later.id).unwrap();
        assert_eq!(tasks[0].description, "Pullups");
        assert_eq!(tasks[0].weight, 9);
    }

    #[test]
    fn test_soft_deleted_template_excluded_from_new_instances() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        let template = add_task(&db, tracker.id, "Pushups");
        add_task(&db, tracker.id, "Stretch");
        let before = db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();

        db.soft_delete_template(template.id).unwrap();

        // Historical tasks survive, flagged
        let tasks = db.list_instance_tasks(before.id).unwrap();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].template_removed);
        assert!(!tasks[1].template_removed);

        // New instances only materialize the live template
        let after = db.get_or_create_instance(&tracker, d(2025, 1, 16)).unwrap();
        let tasks = db.list_instance_tasks(after.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "Stretch");
    }

    // --- Toggle semantics ---

    #[test]
    fn test_toggle_sets_completion_timestamps() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");
        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();
        let task = db.list_instance_tasks(instance.id).unwrap().remove(0);

        let t1 = "2025-01-15T08:00:00+00:00";
        let outcome = db.toggle_task(task.id, TaskStatus::Done, t1).unwrap();
        assert_eq!(outcome.old_status, TaskStatus::Todo);
        assert_eq!(outcome.new_status, TaskStatus::Done);
        assert_eq!(outcome.tracker_id, tracker.id);
        let task = db.get_task(task.id).unwrap();
        assert_eq!(task.completed_at.as_deref(), Some(t1));
        assert_eq!(task.first_completed_at.as_deref(), Some(t1));

        // Leaving done clears completed_at; first_completed_at is permanent
        let t2 = "2025-01-15T09:00:00+00:00";
        db.toggle_task(task.id, TaskStatus::Todo, t2).unwrap();
        let task = db.get_task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert!(task.completed_at.is_none());
        assert_eq!(task.first_completed_at.as_deref(), Some(t1));

        // Completing again moves completed_at but not first_completed_at
        let t3 = "2025-01-15T10:00:00+00:00";
        db.toggle_task(task.id, TaskStatus::Done, t3).unwrap();
        let task = db.get_task(task.id).unwrap();
        assert_eq!(task.completed_at.as_deref(), Some(t3));
        assert_eq!(task.first_completed_at.as_deref(), Some(t1));
    }

    #[test]
    fn test_toggle_between_non_done_states() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");
        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();
        let task = db.list_instance_tasks(instance.id).unwrap().remove(0);

        db.toggle_task(task.id, TaskStatus::Blocked, "2025-01-15T08:00:00+00:00")
            .unwrap();
        let task = db.get_task(task.id).unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert!(task.completed_at.is_none());
        assert!(task.first_completed_at.is_none());
    }

    #[test]
    fn test_toggle_same_status_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");
        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();
        let task = db.list_instance_tasks(instance.id).unwrap().remove(0);

        let t1 = "2025-01-15T08:00:00+00:00";
        db.toggle_task(task.id, TaskStatus::Done, t1).unwrap();
        db.toggle_task(task.id, TaskStatus::Done, "2025-01-15T11:00:00+00:00")
            .unwrap();
        let task = db.get_task(task.id).unwrap();
        assert_eq!(task.completed_at.as_deref(), Some(t1));
    }

    #[test]
    fn test_toggle_reports_affected_goals() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Reading");
        let template = add_task(&db, tracker.id, "Read a chapter");
        let goal_a = sample_goal(&db, "Finish the series", 20.0);
        let goal_b = sample_goal(&db, "Read daily", 300.0);
        db.map_task_to_goal(goal_a.id, template.id, 1.0).unwrap();
        db.map_task_to_goal(goal_b.id, template.id, 1.0).unwrap();

        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();
        let task = db.list_instance_tasks(instance.id).unwrap().remove(0);
        let outcome = db
            .toggle_task(task.id, TaskStatus::Done, "2025-01-15T08:00:00+00:00")
            .unwrap();
        assert_eq!(outcome.affected_goal_ids, vec![goal_a.id, goal_b.id]);
    }

    // --- Range generation ---

    #[test]
    fn test_generate_range_fills_only_gaps() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");

        let report = db
            .generate_range(&tracker, d(2025, 1, 1), d(2025, 1, 5), RangeOptions::default(), d(2025, 1, 10))
            .unwrap();
        assert_eq!(report.created, 5);
        assert_eq!(report.existing, 0);

        // Overlapping second call only fills the remaining gap
        let report = db
            .generate_range(&tracker, d(2025, 1, 3), d(2025, 1, 8), RangeOptions::default(), d(2025, 1, 10))
            .unwrap();
        assert_eq!(report.created, 3);
        assert_eq!(report.existing, 3);
    }

    #[test]
    fn test_generate_range_marks_past_missed() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");

        db.generate_range(
            &tracker,
            d(2025, 1, 1),
            d(2025, 1, 3),
            RangeOptions { mark_missed_for_past: true },
            d(2025, 1, 3),
        )
        .unwrap();

        let jan1 = db.get_instance(tracker.id, "2025-01-01").unwrap().unwrap();
        assert_eq!(db.list_instance_tasks(jan1.id).unwrap()[0].status, TaskStatus::Missed);
        // Today's period has not ended; it stays todo
        let jan3 = db.get_instance(tracker.id, "2025-01-03").unwrap().unwrap();
        assert_eq!(db.list_instance_tasks(jan3.id).unwrap()[0].status, TaskStatus::Todo);
    }

    #[test]
    fn test_generate_range_rejects_bad_ranges() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        assert!(
            db.generate_range(&tracker, d(2025, 1, 5), d(2025, 1, 1), RangeOptions::default(), d(2025, 1, 10))
                .is_err()
        );
        assert!(
            db.generate_range(&tracker, d(2020, 1, 1), d(2023, 1, 1), RangeOptions::default(), d(2025, 1, 10))
                .is_err()
        );
        // No partial generation happened
        assert!(db.get_instance(tracker.id, "2020-01-01").unwrap().is_none());
    }

    // --- Streaks ---

    fn streak_fixture(db: &Database, rates: &[usize]) -> Tracker {
        // One daily tracker with 4 tasks; `rates[i]` tasks are completed on
        // 2025-01-(i+1).
        let tracker = daily_tracker(db, "Habits");
        for i in 0..4 {
            add_task(db, tracker.id, &format!("Task {i}"));
        }
        for (i, &done) in rates.iter().enumerate() {
            let date = d(2025, 1, (i + 1) as u32);
            let instance = db.get_or_create_instance(&tracker, date).unwrap();
            let when = format!("{}T12:00:00+00:00", date.format("%Y-%m-%d"));
            complete_n(db, instance.id, done, &when);
        }
        tracker
    }

    #[test]
    fn test_streak_threshold_sequence() {
        let db = Database::open_in_memory().unwrap();
        // Rates 100,100,100,50,100 against a threshold of 80
        let tracker = streak_fixture(&db, &[4, 4, 4, 2, 4]);
        let streak = db.compute_streak(&tracker, d(2025, 1, 5), 80).unwrap();
        assert_eq!(streak.current, 1);
        assert_eq!(streak.longest, 3);
        assert_eq!(streak.last_meeting_date.as_deref(), Some("2025-01-05"));
    }

    #[test]
    fn test_streak_concrete_three_day_scenario() {
        let db = Database::open_in_memory().unwrap();
        // 100%, 75%, 100% — 75 misses an 80% threshold
        let tracker = streak_fixture(&db, &[4, 3, 4]);
        let streak = db.compute_streak(&tracker, d(2025, 1, 3), 80).unwrap();
        assert_eq!(streak.current, 1);
        assert_eq!(streak.longest, 1);
    }

    #[test]
    fn test_streak_lower_threshold_spans_all() {
        let db = Database::open_in_memory().unwrap();
        let tracker = streak_fixture(&db, &[4, 3, 4]);
        let streak = db.compute_streak(&tracker, d(2025, 1, 3), 75).unwrap();
        assert_eq!(streak.current, 3);
        assert_eq!(streak.longest, 3);
    }

    #[test]
    fn test_streak_gap_breaks_current() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Habits");
        add_task(&db, tracker.id, "Task");
        for day in [1, 3] {
            let instance = db.get_or_create_instance(&tracker, d(2025, 1, day)).unwrap();
            complete_all(&db, instance.id, "2025-01-03T12:00:00+00:00");
        }
        let streak = db.compute_streak(&tracker, d(2025, 1, 3), 80).unwrap();
        assert_eq!(streak.current, 1);
        assert_eq!(streak.longest, 1);
    }

    #[test]
    fn test_streak_backdated_completion_recomputes() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Habits");
        add_task(&db, tracker.id, "Task");
        for day in [1, 3] {
            let instance = db.get_or_create_instance(&tracker, d(2025, 1, day)).unwrap();
            complete_all(&db, instance.id, "2025-01-03T12:00:00+00:00");
        }
        assert_eq!(db.compute_streak(&tracker, d(2025, 1, 3), 80).unwrap().current, 1);

        // Backfill the gap; the next scan sees the full run
        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 2)).unwrap();
        complete_all(&db, instance.id, "2025-01-04T12:00:00+00:00");
        let streak = db.compute_streak(&tracker, d(2025, 1, 3), 80).unwrap();
        assert_eq!(streak.current, 3);
        assert_eq!(streak.longest, 3);
    }

    #[test]
    fn test_streak_zero_task_instance_is_transparent() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Habits");
        // Jan 2's instance exists before any template does, so it has no tasks
        db.get_or_create_instance(&tracker, d(2025, 1, 2)).unwrap();
        add_task(&db, tracker.id, "Task");
        for day in [1, 3] {
            let instance = db.get_or_create_instance(&tracker, d(2025, 1, day)).unwrap();
            complete_all(&db, instance.id, "2025-01-03T12:00:00+00:00");
        }
        let streak = db.compute_streak(&tracker, d(2025, 1, 3), 80).unwrap();
        assert_eq!(streak.current, 2);
        assert_eq!(streak.longest, 2);
    }

    #[test]
    fn test_streak_as_of_incomplete_day_is_zero() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Habits");
        add_task(&db, tracker.id, "Task");
        let jan1 = db.get_or_create_instance(&tracker, d(2025, 1, 1)).unwrap();
        complete_all(&db, jan1.id, "2025-01-01T12:00:00+00:00");
        db.get_or_create_instance(&tracker, d(2025, 1, 2)).unwrap();

        let streak = db.compute_streak(&tracker, d(2025, 1, 2), 80).unwrap();
        assert_eq!(streak.current, 0);
        assert_eq!(streak.longest, 1);
        assert_eq!(streak.last_meeting_date.as_deref(), Some("2025-01-01"));
    }

    #[test]
    fn test_streak_no_instances() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Habits");
        let streak = db.compute_streak(&tracker, d(2025, 1, 1), 80).unwrap();
        assert_eq!(streak.current, 0);
        assert_eq!(streak.longest, 0);
        assert!(streak.last_meeting_date.is_none());
    }

    #[test]
    fn test_weekly_streak() {
        let db = Database::open_in_memory().unwrap();
        let tracker = db
            .insert_tracker(&NewTracker {
                name: "Review".to_string(),
                time_mode: TimeMode::Weekly,
                week_start: 0,
            })
            .unwrap();
        add_task(&db, tracker.id, "Weekly review");
        for date in [d(2025, 3, 4), d(2025, 3, 11), d(2025, 3, 18)] {
            let instance = db.get_or_create_instance(&tracker, date).unwrap();
            complete_all(&db, instance.id, "2025-03-18T12:00:00+00:00");
        }
        // Mid-week as-of resolves to the current week's anchor
        let streak = db.compute_streak(&tracker, d(2025, 3, 19), 80).unwrap();
        assert_eq!(streak.current, 3);
        assert_eq!(streak.longest, 3);
    }

    #[test]
    fn test_monthly_streak_across_year_boundary() {
        let db = Database::open_in_memory().unwrap();
        let tracker = db
            .insert_tracker(&NewTracker {
                name: "Budget".to_string(),
                time_mode: TimeMode::Monthly,
                week_start: 0,
            })
            .unwrap();
        add_task(&db, tracker.id, "Close the books");
        for date in [d(2024, 11, 5), d(2024, 12, 20), d(2025, 1, 3)] {
            let instance = db.get_or_create_instance(&tracker, date).unwrap();
            complete_all(&db, instance.id, "2025-01-15T12:00:00+00:00");
        }
        let streak = db.compute_streak(&tracker, d(2025, 1, 15), 80).unwrap();
        assert_eq!(streak.current, 3);
    }

    #[test]
    fn test_tracker_history_stats() {
        let db = Database::open_in_memory().unwrap();
        let tracker = streak_fixture(&db, &[4, 2, 4]);
        let stats = db.tracker_history(tracker.id, d(2025, 1, 1), d(2025, 1, 3)).unwrap();
        assert_eq!(stats.len(), 3);
        assert!((stats[0].completion_rate - 100.0).abs() < 0.01);
        assert!((stats[1].completion_rate - 50.0).abs() < 0.01);
        assert_eq!(stats[1].done_count, 2);
        assert_eq!(stats[1].total_count, 4);
    }

    // --- Goals ---

    #[test]
    fn test_goal_additive_sharing() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Reading");
        let template = add_task(&db, tracker.id, "Read a chapter");
        let goal_a = sample_goal(&db, "Goal A", 10.0);
        let goal_b = sample_goal(&db, "Goal B", 10.0);
        db.map_task_to_goal(goal_a.id, template.id, 1.0).unwrap();
        db.map_task_to_goal(goal_b.id, template.id, 1.0).unwrap();

        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 2)).unwrap();
        complete_all(&db, instance.id, "2025-01-02T09:00:00+00:00");

        // Both goals receive the full contribution, not half each
        let a = db.recompute_goal(goal_a.id, d(2025, 1, 31)).unwrap();
        let b = db.recompute_goal(goal_b.id, d(2025, 1, 31)).unwrap();
        assert!((a.current_value - 1.0).abs() < f64::EPSILON);
        assert!((b.current_value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_goal_partial_credit_weight() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Reading");
        let template = add_task(&db, tracker.id, "Read a chapter");
        let goal = sample_goal(&db, "Goal", 10.0);
        db.map_task_to_goal(goal.id, template.id, 0.5).unwrap();

        for day in 2..=3 {
            let instance = db.get_or_create_instance(&tracker, d(2025, 1, day)).unwrap();
            complete_all(&db, instance.id, &format!("2025-01-0{day}T09:00:00+00:00"));
        }
        let progress = db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap();
        assert!((progress.current_value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_goal_achievement_and_reopen() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Reading");
        let template = add_task(&db, tracker.id, "Read a chapter");
        let goal = sample_goal(&db, "Goal", 1.0);
        db.map_task_to_goal(goal.id, template.id, 1.0).unwrap();

        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 2)).unwrap();
        complete_all(&db, instance.id, "2025-01-02T09:00:00+00:00");

        let progress = db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap();
        assert_eq!(progress.status, GoalStatus::Achieved);
        assert!(progress.newly_achieved);

        // Redundant recomputation keeps the status without re-signaling
        let progress = db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap();
        assert_eq!(progress.status, GoalStatus::Achieved);
        assert!(!progress.newly_achieved);

        // Raising the target above current reopens the goal
        db.set_goal_target(goal.id, 5.0).unwrap();
        let progress = db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap();
        assert_eq!(progress.status, GoalStatus::Active);
        assert!(!progress.newly_achieved);
        assert!((progress.current_value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_goal_window_excludes_completions_outside() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Reading");
        let template = add_task(&db, tracker.id, "Read a chapter");
        let goal = db
            .insert_goal(&NewGoal {
                title: "Windowed".to_string(),
                target_value: 10.0,
                unit: None,
                start_date: d(2025, 1, 10),
                target_date: Some(d(2025, 1, 20)),
                priority: 0,
            })
            .unwrap();
        db.map_task_to_goal(goal.id, template.id, 1.0).unwrap();

        // Before the window, inside it, and after it
        for (day, when) in [
            (2, "2025-01-02T09:00:00+00:00"),
            (15, "2025-01-15T09:00:00+00:00"),
            (25, "2025-01-25T09:00:00+00:00"),
        ] {
            let instance = db.get_or_create_instance(&tracker, d(2025, 1, day)).unwrap();
            complete_all(&db, instance.id, when);
        }

        let progress = db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap();
        assert!((progress.current_value - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_goal_excludes_deleted_and_non_goal_templates() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Mixed");
        let counted = add_task(&db, tracker.id, "Counted");
        let excluded = db
            .insert_template(&NewTaskTemplate {
                tracker_id: tracker.id,
                description: "Excluded".to_string(),
                category: None,
                weight: 1,
                points: 0,
                include_in_goal: false,
                time_of_day: None,
            })
            .unwrap();
        let goal = sample_goal(&db, "Goal", 10.0);
        db.map_task_to_goal(goal.id, counted.id, 1.0).unwrap();
        db.map_task_to_goal(goal.id, excluded.id, 1.0).unwrap();

        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 2)).unwrap();
        complete_all(&db, instance.id, "2025-01-02T09:00:00+00:00");

        let progress = db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap();
        assert!((progress.current_value - 1.0).abs() < f64::EPSILON);

        // Soft-deleting the counted template zeroes its contribution too
        db.soft_delete_template(counted.id).unwrap();
        let progress = db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap();
        assert!(progress.current_value.abs() < f64::EPSILON);
    }

    #[test]
    fn test_unmap_task_stops_contribution() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Reading");
        let template = add_task(&db, tracker.id, "Read");
        let goal = sample_goal(&db, "Goal", 10.0);
        db.map_task_to_goal(goal.id, template.id, 1.0).unwrap();
        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 2)).unwrap();
        complete_all(&db, instance.id, "2025-01-02T09:00:00+00:00");
        assert!((db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap().current_value - 1.0).abs() < f64::EPSILON);

        assert!(db.unmap_task_from_goal(goal.id, template.id).unwrap().is_some());
        assert!(db.recompute_goal(goal.id, d(2025, 1, 31)).unwrap().current_value.abs() < f64::EPSILON);
        assert!(db.goals_for_template(template.id).unwrap().is_empty());
    }

    // --- Soft delete cascade ---

    #[test]
    fn test_soft_delete_tracker_cascades() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");
        let instance = db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();
        let task = db.list_instance_tasks(instance.id).unwrap().remove(0);

        let deleted = db.soft_delete_tracker(tracker.id).unwrap();
        // tracker + template + instance + task instance
        assert_eq!(deleted.len(), 4);

        assert!(db.get_tracker(tracker.id).is_err());
        assert!(db.list_templates(tracker.id).unwrap().is_empty());
        assert!(db.get_instance(tracker.id, "2025-01-15").unwrap().is_none());
        assert!(db.get_task(task.id).is_err());
    }

    // --- Share links ---

    #[test]
    fn test_share_link_atomic_max_uses() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        db.create_share_link(tracker.id, "tok123", Some(2), None).unwrap();

        let now = "2025-01-15T08:00:00+00:00";
        assert_eq!(db.claim_share_link("tok123", now).unwrap().use_count, 1);
        assert_eq!(db.claim_share_link("tok123", now).unwrap().use_count, 2);
        let err = db.claim_share_link("tok123", now).unwrap_err();
        assert!(err.to_string().contains("maximum"));
        // The counter never overshoots
        assert_eq!(db.get_share_link("tok123").unwrap().unwrap().use_count, 2);
    }

    #[test]
    fn test_share_link_expiry_and_missing() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        db.create_share_link(tracker.id, "tok456", None, Some("2025-01-10T00:00:00+00:00"))
            .unwrap();
        let err = db
            .claim_share_link("tok456", "2025-01-15T08:00:00+00:00")
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
        assert!(db.claim_share_link("nope", "2025-01-15T08:00:00+00:00").is_err());
    }

    // --- Settings & device id ---

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_setting("streak_threshold").unwrap().is_none());
        db.set_setting("streak_threshold", "90").unwrap();
        assert_eq!(db.get_setting("streak_threshold").unwrap().as_deref(), Some("90"));
        db.set_setting("streak_threshold", "70").unwrap();
        assert_eq!(db.get_setting("streak_threshold").unwrap().as_deref(), Some("70"));
        assert!(db.delete_setting("streak_threshold").unwrap());
        assert!(!db.delete_setting("streak_threshold").unwrap());
    }

    #[test]
    fn test_device_id_is_stable() {
        let db = Database::open_in_memory().unwrap();
        let id = db.get_or_create_device_id().unwrap();
        assert_eq!(db.get_or_create_device_id().unwrap(), id);
    }

    // --- Sync: outbound ---

    #[test]
    fn test_changes_since_full_and_incremental() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");
        db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();

        let full = db.changes_since(None, "now").unwrap();
        assert_eq!(full.trackers.len(), 1);
        assert_eq!(full.templates.len(), 1);
        assert_eq!(full.instances.len(), 1);
        assert_eq!(full.task_instances.len(), 1);
        assert_eq!(full.templates[0].tracker_uuid, tracker.uuid);

        let empty = db.changes_since(Some("2099-01-01T00:00:00+00:00"), "now").unwrap();
        assert!(empty.trackers.is_empty());
        assert!(empty.task_instances.is_empty());

        let all = db.changes_since(Some("1970-01-01T00:00:00+00:00"), "now").unwrap();
        assert_eq!(all.trackers.len(), 1);
    }

    #[test]
    fn test_changes_since_excludes_soft_deleted() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        let template = add_task(&db, tracker.id, "Run");
        db.soft_delete_template(template.id).unwrap();

        let payload = db.changes_since(None, "now").unwrap();
        assert!(payload.templates.is_empty());
    }

    // --- Sync: inbound merge ---

    fn incoming_tracker(uuid: &str, name: &str, ts: &str) -> SyncTracker {
        SyncTracker {
            uuid: uuid.to_string(),
            name: name.to_string(),
            time_mode: "daily".to_string(),
            status: "active".to_string(),
            week_start: 0,
            created_at: ts.to_string(),
            updated_at: ts.to_string(),
        }
    }

    #[test]
    fn test_apply_changes_inserts_full_tree() {
        let db = Database::open_in_memory().unwrap();
        let ts = "2025-01-15T08:00:00+00:00";
        let req = SyncRequest {
            trackers: vec![incoming_tracker("tr-1", "Remote", ts)],
            templates: vec![SyncTemplate {
                uuid: "tpl-1".to_string(),
                tracker_uuid: "tr-1".to_string(),
                description: "Run".to_string(),
                category: None,
                weight: 1,
                points: 0,
                include_in_goal: true,
                time_of_day: None,
                created_at: ts.to_string(),
                updated_at: ts.to_string(),
            }],
            instances: vec![SyncInstance {
                uuid: "in-1".to_string(),
                tracker_uuid: "tr-1".to_string(),
                tracking_date: "2025-01-15".to_string(),
                period_start: "2025-01-15".to_string(),
                period_end: "2025-01-15".to_string(),
                created_at: ts.to_string(),
                updated_at: ts.to_string(),
            }],
            task_instances: vec![SyncTaskInstance {
                uuid: "ti-1".to_string(),
                instance_uuid: "in-1".to_string(),
                template_uuid: "tpl-1".to_string(),
                status: "done".to_string(),
                description: "Run".to_string(),
                points: 0,
                weight: 1,
                first_completed_at: Some(ts.to_string()),
                completed_at: Some(ts.to_string()),
                notes: None,
                status_updated_at: ts.to_string(),
                notes_updated_at: ts.to_string(),
                created_at: ts.to_string(),
                updated_at: ts.to_string(),
            }],
            ..Default::default()
        };

        let (applied, conflicts) = db.apply_changes(&req).unwrap();
        assert_eq!(applied.len(), 4);
        assert!(conflicts.is_empty());

        let tracker = db.get_tracker_by_uuid("tr-1").unwrap().unwrap();
        assert_eq!(tracker.name, "Remote");
        let task = db.get_task_by_uuid("ti-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);

        // Replaying the identical batch is a no-op on both lists
        let (applied, conflicts) = db.apply_changes(&req).unwrap();
        assert!(applied.is_empty());
        assert!(conflicts.is_empty());
    }

    #[test]
    fn test_apply_changes_last_writer_wins() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Local");

        // Older client write loses and is reported as a conflict
        let req = SyncRequest {
            trackers: vec![incoming_tracker(&tracker.uuid, "Stale", "2000-01-01T00:00:00+00:00")],
            ..Default::default()
        };
        let (applied, conflicts) = db.apply_changes(&req).unwrap();
        assert!(applied.is_empty());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].table, "trackers");
        assert_eq!(db.get_tracker(tracker.id).unwrap().name, "Local");

        // Newer client write wins
        let req = SyncRequest {
            trackers: vec![incoming_tracker(&tracker.uuid, "Fresh", "2099-01-01T00:00:00+00:00")],
            ..Default::default()
        };
        let (applied, conflicts) = db.apply_changes(&req).unwrap();
        assert_eq!(applied.len(), 1);
        assert!(conflicts.is_empty());
        assert_eq!(db.get_tracker(tracker.id).unwrap().name, "Fresh");
    }

    #[test]
    fn test_apply_changes_field_group_merge() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        let template = add_task(&db, tracker.id, "Run");
        let instance = db.get_or_create_instance(&tracker, d(2025, 6, 1)).unwrap();
        let task = db.list_instance_tasks(instance.id).unwrap().remove(0);
        db.toggle_task(task.id, TaskStatus::Done, "2025-06-01T09:00:00+00:00").unwrap();

        // Client has a stale status toggle but a fresh note
        let req = SyncRequest {
            task_instances: vec![SyncTaskInstance {
                uuid: task.uuid.clone(),
                instance_uuid: instance.uuid.clone(),
                template_uuid: template.uuid.clone(),
                status: "todo".to_string(),
                description: "Run".to_string(),
                points: 0,
                weight: 1,
                first_completed_at: None,
                completed_at: None,
                notes: Some("left knee felt off".to_string()),
                status_updated_at: "2025-06-01T08:00:00+00:00".to_string(),
                notes_updated_at: "2099-01-01T00:00:00+00:00".to_string(),
                created_at: task.created_at.clone(),
                updated_at: "2099-01-01T00:00:00+00:00".to_string(),
            }],
            ..Default::default()
        };
        let (applied, conflicts) = db.apply_changes(&req).unwrap();

        // The note landed, the stale toggle did not clobber the status
        assert_eq!(applied.len(), 1);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field_group.as_deref(), Some("status"));
        let merged = db.get_task(task.id).unwrap();
        assert_eq!(merged.status, TaskStatus::Done);
        assert_eq!(merged.notes.as_deref(), Some("left knee felt off"));
    }

    #[test]
    fn test_apply_changes_merges_instance_slot() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");
        db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();

        // Another device materialized the same period under its own uuid
        let req = SyncRequest {
            instances: vec![SyncInstance {
                uuid: "other-device-uuid".to_string(),
                tracker_uuid: tracker.uuid.clone(),
                tracking_date: "2025-01-15".to_string(),
                period_start: "2025-01-15".to_string(),
                period_end: "2025-01-15".to_string(),
                created_at: "2025-01-15T08:00:00+00:00".to_string(),
                updated_at: "2025-01-15T08:00:00+00:00".to_string(),
            }],
            ..Default::default()
        };
        db.apply_changes(&req).unwrap();
        assert_eq!(db.get_instances_since(None).unwrap().len(), 1);
    }

    #[test]
    fn test_apply_tombstone_cascades() {
        let db = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&db, "Workout");
        add_task(&db, tracker.id, "Run");
        db.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();

        let req = SyncRequest {
            tombstones: vec![SyncTombstone {
                uuid: tracker.uuid.clone(),
                table_name: "trackers".to_string(),
                deleted_at: "2025-01-16T00:00:00+00:00".to_string(),
            }],
            ..Default::default()
        };
        db.apply_changes(&req).unwrap();

        assert!(db.get_tracker(tracker.id).is_err());
        assert!(db.get_instance(tracker.id, "2025-01-15").unwrap().is_none());
        // Stored for onward propagation, without duplicating
        assert_eq!(db.get_tombstones().unwrap().len(), 4);
        db.apply_changes(&req).unwrap();
        assert_eq!(
            db.get_tombstones()
                .unwrap()
                .iter()
                .filter(|t| t.uuid == tracker.uuid)
                .count(),
            1
        );
    }

    #[test]
    fn test_two_database_round_trip() {
        let source = Database::open_in_memory().unwrap();
        let tracker = daily_tracker(&source, "Workout");
        let template = add_task(&source, tracker.id, "Run");
        let goal = sample_goal(&source, "Run 100 times", 100.0);
        source.map_task_to_goal(goal.id, template.id, 1.0).unwrap();
        let instance = source.get_or_create_instance(&tracker, d(2025, 1, 15)).unwrap();
        complete_all(&source, instance.id, "2025-01-15T09:00:00+00:00");

        let payload = source.changes_since(None, "now").unwrap();
        let req = SyncRequest {
            trackers: payload.trackers,
            templates: payload.templates,
            instances: payload.instances,
            task_instances: payload.task_instances,
            goals: payload.goals,
            mappings: payload.mappings,
            tombstones: payload.tombstones,
            ..Default::default()
        };

        let dest = Database::open_in_memory().unwrap();
        let (applied, conflicts) = dest.apply_changes(&req).unwrap();
        assert_eq!(applied.len(), 6);
        assert!(conflicts.is_empty());

        let mirrored = dest.get_tracker_by_uuid(&tracker.uuid).unwrap().unwrap();
        let streak = dest.compute_streak(&mirrored, d(2025, 1, 15), 80).unwrap();
        assert_eq!(streak.current, 1);
        let mirrored_goal = dest.get_goal_by_uuid(&goal.uuid).unwrap().unwrap();
        let progress = dest.recompute_goal(mirrored_goal.id, d(2025, 1, 31)).unwrap();
        assert!((progress.current_value - 1.0).abs() < f64::EPSILON);
    }
}
