mod goal;
mod helpers;
mod prefs;
mod sync;
mod task;
mod tracker;
mod view;

pub(crate) use goal::{
    cmd_goal_add, cmd_goal_list, cmd_goal_map, cmd_goal_progress, cmd_goal_rm,
    cmd_goal_set_status, cmd_goal_target, cmd_goal_unmap,
};
pub(crate) use prefs::{cmd_prefs_set, cmd_prefs_show};
pub(crate) use sync::{cmd_export, cmd_import_history, cmd_sync_import, cmd_sync_reconcile};
pub(crate) use task::{cmd_log, cmd_note, cmd_task_add, cmd_task_edit, cmd_task_list, cmd_task_rm};
pub(crate) use tracker::{
    cmd_track_add, cmd_track_list, cmd_track_rm, cmd_track_set_status, cmd_track_share,
};
pub(crate) use view::{cmd_backfill, cmd_history, cmd_streak, cmd_today};
