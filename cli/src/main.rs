mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process;

use crate::commands::{
    cmd_backfill, cmd_export, cmd_goal_add, cmd_goal_list, cmd_goal_map, cmd_goal_progress,
    cmd_goal_rm, cmd_goal_set_status, cmd_goal_target, cmd_goal_unmap, cmd_history,
    cmd_import_history, cmd_log, cmd_note, cmd_prefs_set, cmd_prefs_show, cmd_streak,
    cmd_sync_import, cmd_sync_reconcile, cmd_task_add, cmd_task_edit, cmd_task_list, cmd_task_rm,
    cmd_today, cmd_track_add, cmd_track_list, cmd_track_rm, cmd_track_set_status, cmd_track_share,
};
use crate::config::Config;
use tally_core::models::{GoalStatus, TrackerStatus};
use tally_core::service::TrackerService;

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "A simple habit tracker CLI",
    long_about = "\n\n  ▀█▀ ▄▀█ █   █   █▄█
   █  █▀█ █▄▄ █▄▄  █
      every day counts.
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mark a task done (or another status) for a day
    Log {
        /// Tracker name or ID
        tracker: String,
        /// Task description or task-record ID
        task: String,
        /// New status: todo, in_progress, done, missed, skipped, blocked
        #[arg(short, long, default_value = "done")]
        status: String,
        /// Date to log for (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Attach a note to a task on a day
    Note {
        /// Tracker name or ID
        tracker: String,
        /// Task description or task-record ID
        task: String,
        /// The note text
        notes: String,
        /// Date (YYYY-MM-DD or today/yesterday, default: today)
        #[arg(long)]
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show all active trackers for a day (defaults to today)
    Today {
        /// Date to show (YYYY-MM-DD or today/yesterday, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a tracker's current and longest streak
    Streak {
        /// Tracker name or ID
        tracker: String,
        /// Compute as of this date (default: today)
        #[arg(long)]
        as_of: Option<String>,
        /// Completion threshold percentage (default: preference)
        #[arg(long)]
        threshold: Option<i64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show per-period completion history
    History {
        /// Tracker name or ID
        tracker: String,
        /// Number of days to cover
        #[arg(short, long, default_value = "14")]
        days: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fill period records across a date range (e.g. after an absence)
    Backfill {
        /// Tracker name or ID
        tracker: String,
        /// Range start (YYYY-MM-DD)
        from: String,
        /// Range end (YYYY-MM-DD, default: today)
        to: Option<String>,
        /// Initialize past periods' tasks as missed instead of todo
        #[arg(long)]
        mark_missed: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage trackers
    Track {
        #[command(subcommand)]
        command: TrackCommands,
    },
    /// Manage a tracker's tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Manage goals fed by task completions
    Goal {
        #[command(subcommand)]
        command: GoalCommands,
    },
    /// Show or change preferences
    Prefs {
        #[command(subcommand)]
        command: PrefsCommands,
    },
    /// Import data from external sources
    Import {
        #[command(subcommand)]
        command: ImportCommands,
    },
    /// Exchange data with other devices
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
}

#[derive(Subcommand)]
enum TrackCommands {
    /// Create a tracker
    Add {
        /// Tracker name
        name: String,
        /// Time mode: daily, weekly, monthly
        #[arg(short, long, default_value = "daily")]
        mode: String,
        /// Week anchor day for weekly mode: monday-sunday or 0-6
        #[arg(long)]
        week_start: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List trackers
    List {
        /// Include archived trackers
        #[arg(short, long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pause a tracker (kept, but hidden from the daily view)
    Pause {
        /// Tracker name or ID
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Resume a paused tracker
    Resume {
        /// Tracker name or ID
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Archive a tracker
    Archive {
        /// Tracker name or ID
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a tracker and its history
    Rm {
        /// Tracker name or ID
        name: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a share token for a tracker
    Share {
        /// Tracker name or ID
        name: String,
        /// Maximum number of uses
        #[arg(long)]
        max_uses: Option<i64>,
        /// Expiry timestamp (RFC 3339)
        #[arg(long)]
        expires: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Add a task to a tracker
    Add {
        /// Tracker name or ID
        tracker: String,
        /// Task description
        description: String,
        /// Category label
        #[arg(long)]
        category: Option<String>,
        /// Weight 1-10 (how much this task matters)
        #[arg(short, long, default_value = "1")]
        weight: i64,
        /// Points awarded per completion
        #[arg(short, long, default_value = "0")]
        points: i64,
        /// Exclude completions from goal progress
        #[arg(long)]
        no_goal: bool,
        /// Time of day: morning, afternoon, evening
        #[arg(long)]
        time: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List a tracker's tasks
    List {
        /// Tracker name or ID
        tracker: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a task blueprint (existing days keep their snapshot)
    Edit {
        /// Task template ID
        id: i64,
        /// New description
        #[arg(long)]
        description: Option<String>,
        /// New category
        #[arg(long)]
        category: Option<String>,
        /// New weight 1-10
        #[arg(long)]
        weight: Option<i64>,
        /// New points
        #[arg(long)]
        points: Option<i64>,
        /// Count toward goals
        #[arg(long)]
        include_in_goal: Option<bool>,
        /// New time of day
        #[arg(long)]
        time: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a task (history stays visible)
    Rm {
        /// Task template ID
        id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum GoalCommands {
    /// Create a goal
    Add {
        /// Goal title
        title: String,
        /// Target value
        target: f64,
        /// Unit label (e.g. "books", "sessions")
        #[arg(long)]
        unit: Option<String>,
        /// Target date (YYYY-MM-DD)
        #[arg(long)]
        by: Option<String>,
        /// Priority (higher sorts first)
        #[arg(long, default_value = "0")]
        priority: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List goals with progress
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Feed a task's completions into a goal
    Map {
        /// Goal title or ID
        goal: String,
        /// Tracker name or ID
        tracker: String,
        /// Task description
        task: String,
        /// Contribution per completion (values below 1 give partial credit)
        #[arg(long, default_value = "1.0")]
        weight: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Stop a task from feeding a goal
    Unmap {
        /// Goal title or ID
        goal: String,
        /// Tracker name or ID
        tracker: String,
        /// Task description
        task: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recompute and show a goal's progress
    Progress {
        /// Goal title or ID
        goal: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change a goal's target value
    Target {
        /// Goal title or ID
        goal: String,
        /// New target value
        target: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Pause a goal
    Pause {
        /// Goal title or ID
        goal: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Abandon a goal
    Abandon {
        /// Goal title or ID
        goal: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a goal
    Rm {
        /// Goal title or ID
        goal: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PrefsCommands {
    /// Show preferences
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change preferences
    Set {
        /// Streak completion threshold percentage (1-100)
        #[arg(long)]
        threshold: Option<i64>,
        /// Default week anchor day: monday-sunday or 0-6
        #[arg(long)]
        week_start: Option<String>,
        /// IANA timezone name
        #[arg(long)]
        timezone: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ImportCommands {
    /// Import completion history from a CSV export
    History {
        /// Path to the CSV file (Date,Tracker,Task[,Status][,Notes])
        file: std::path::PathBuf,
        /// Preview import without making changes
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Export everything to a JSON payload file
    Export {
        /// Output file
        file: std::path::PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a payload file exported on another device
    Import {
        /// Payload file
        file: std::path::PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile a peer's change batch and emit the server answer
    Reconcile {
        /// Peer change batch (JSON)
        file: std::path::PathBuf,
        /// Where to write the changes the peer should apply
        #[arg(long)]
        out: Option<std::path::PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_lines)]
fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let svc = TrackerService::new(&config.db_path.to_string_lossy())?;

    match cli.command {
        Commands::Log {
            tracker,
            task,
            status,
            date,
            json,
        } => cmd_log(&svc, &tracker, &task, &status, date, json),
        Commands::Note {
            tracker,
            task,
            notes,
            date,
            json,
        } => cmd_note(&svc, &tracker, &task, &notes, date, json),
        Commands::Today { date, json } => cmd_today(&svc, date, json),
        Commands::Streak {
            tracker,
            as_of,
            threshold,
            json,
        } => cmd_streak(&svc, &tracker, as_of, threshold, json),
        Commands::History { tracker, days, json } => cmd_history(&svc, &tracker, days, json),
        Commands::Backfill {
            tracker,
            from,
            to,
            mark_missed,
            json,
        } => cmd_backfill(&svc, &tracker, from, to, mark_missed, json),
        Commands::Track { command } => match command {
            TrackCommands::Add {
                name,
                mode,
                week_start,
                json,
            } => cmd_track_add(&svc, &name, &mode, week_start.as_deref(), json),
            TrackCommands::List { all, json } => cmd_track_list(&svc, all, json),
            TrackCommands::Pause { name, json } => {
                cmd_track_set_status(&svc, &name, TrackerStatus::Paused, json)
            }
            TrackCommands::Resume { name, json } => {
                cmd_track_set_status(&svc, &name, TrackerStatus::Active, json)
            }
            TrackCommands::Archive { name, json } => {
                cmd_track_set_status(&svc, &name, TrackerStatus::Archived, json)
            }
            TrackCommands::Rm { name, json } => cmd_track_rm(&svc, &name, json),
            TrackCommands::Share {
                name,
                max_uses,
                expires,
                json,
            } => cmd_track_share(&svc, &name, max_uses, expires, json),
        },
        Commands::Task { command } => match command {
            TaskCommands::Add {
                tracker,
                description,
                category,
                weight,
                points,
                no_goal,
                time,
                json,
            } => cmd_task_add(
                &svc, &tracker, &description, category, weight, points, no_goal, time, json,
            ),
            TaskCommands::List { tracker, json } => cmd_task_list(&svc, &tracker, json),
            TaskCommands::Edit {
                id,
                description,
                category,
                weight,
                points,
                include_in_goal,
                time,
                json,
            } => cmd_task_edit(
                &svc,
                id,
                description,
                category,
                weight,
                points,
                include_in_goal,
                time,
                json,
            ),
            TaskCommands::Rm { id, json } => cmd_task_rm(&svc, id, json),
        },
        Commands::Goal { command } => match command {
            GoalCommands::Add {
                title,
                target,
                unit,
                by,
                priority,
                json,
            } => cmd_goal_add(&svc, &title, target, unit, by, priority, json),
            GoalCommands::List { json } => cmd_goal_list(&svc, json),
            GoalCommands::Map {
                goal,
                tracker,
                task,
                weight,
                json,
            } => cmd_goal_map(&svc, &goal, &tracker, &task, weight, json),
            GoalCommands::Unmap {
                goal,
                tracker,
                task,
                json,
            } => cmd_goal_unmap(&svc, &goal, &tracker, &task, json),
            GoalCommands::Progress { goal, json } => cmd_goal_progress(&svc, &goal, json),
            GoalCommands::Target { goal, target, json } => {
                cmd_goal_target(&svc, &goal, target, json)
            }
            GoalCommands::Pause { goal, json } => {
                cmd_goal_set_status(&svc, &goal, GoalStatus::Paused, json)
            }
            GoalCommands::Abandon { goal, json } => {
                cmd_goal_set_status(&svc, &goal, GoalStatus::Abandoned, json)
            }
            GoalCommands::Rm { goal, json } => cmd_goal_rm(&svc, &goal, json),
        },
        Commands::Prefs { command } => match command {
            PrefsCommands::Show { json } => cmd_prefs_show(&svc, json),
            PrefsCommands::Set {
                threshold,
                week_start,
                timezone,
                json,
            } => cmd_prefs_set(&svc, threshold, week_start, timezone, json),
        },
        Commands::Import { command } => match command {
            ImportCommands::History { file, dry_run, json } => {
                cmd_import_history(&svc, &file, dry_run, json)
            }
        },
        Commands::Sync { command } => match command {
            SyncCommands::Export { file, json } => cmd_export(&svc, &file, json),
            SyncCommands::Import { file, json } => cmd_sync_import(&svc, &file, json),
            SyncCommands::Reconcile { file, out, json } => {
                cmd_sync_reconcile(&svc, &file, out.as_deref(), json)
            }
        },
    }
}
