//! Observation hooks.
//!
//! Hooks are called at each lifecycle boundary of a pipeline. They return
//! nothing and cannot influence the transfer; they exist for tests and
//! monitoring.

use std::fmt;
use std::sync::Arc;

/// Hook receiving a task rank
pub type RankHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Hook receiving the current progress
pub type ProgressHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Hook without arguments
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Set of optional hooks
#[derive(Clone, Default)]
pub struct Trace {
    /// Before each pre-task
    pub on_pre_task: Option<RankHook>,
    /// Before each post-task
    pub on_post_task: Option<RankHook>,
    /// Before each error-task
    pub on_error_task: Option<RankHook>,
    /// Once the file stream is open
    pub on_data_start: Option<Hook>,
    /// After each read, with the new progress
    pub on_read: Option<ProgressHook>,
    /// After each write, with the new progress
    pub on_write: Option<ProgressHook>,
    /// After the file is closed
    pub on_close: Option<Hook>,
    /// After the file is moved to its destination
    pub on_move: Option<Hook>,
    /// When a pause is requested
    pub on_pause: Option<Hook>,
    /// When an interruption is requested
    pub on_interruption: Option<Hook>,
    /// When a cancellation is requested
    pub on_cancel: Option<Hook>,
    /// Once the transfer reached a terminal state
    pub on_transfer_end: Option<Hook>,
}

impl Trace {
    pub(crate) fn rank(hook: &Option<RankHook>, rank: u32) {
        if let Some(hook) = hook {
            hook(rank);
        }
    }

    pub(crate) fn progress(hook: &Option<ProgressHook>, progress: u64) {
        if let Some(hook) = hook {
            hook(progress);
        }
    }

    pub(crate) fn fire(hook: &Option<Hook>) {
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = [
            ("on_pre_task", self.on_pre_task.is_some()),
            ("on_post_task", self.on_post_task.is_some()),
            ("on_error_task", self.on_error_task.is_some()),
            ("on_data_start", self.on_data_start.is_some()),
            ("on_read", self.on_read.is_some()),
            ("on_write", self.on_write.is_some()),
            ("on_close", self.on_close.is_some()),
            ("on_move", self.on_move.is_some()),
            ("on_pause", self.on_pause.is_some()),
            ("on_interruption", self.on_interruption.is_some()),
            ("on_cancel", self.on_cancel.is_some()),
            ("on_transfer_end", self.on_transfer_end.is_some()),
        ];
        f.debug_list()
            .entries(set.iter().filter(|(_, s)| *s).map(|(name, _)| name))
            .finish()
    }
}
