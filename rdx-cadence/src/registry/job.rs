//! A task bound to a pattern, with the flags that guard its execution.

use crate::common::{RegistryId, TaskHandle};
use crate::components::task::Task;
use crate::error::{Error, Result};
use crate::events::{Event, UserData};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// A registered (task, pattern, priority) triple.
///
/// Jobs are shared between their registry and any view that selected them,
/// so the mutable flags live in `Cell`s.
pub struct Job {
    task: Rc<dyn Task>,
    pattern: Event,
    priority: u32,
    handle: TaskHandle,
    owner: RegistryId,
    enabled: Cell<bool>,
    busy: Cell<bool>,
    marked_for_delete: Cell<bool>,
}

impl Job {
    /// Starts describing a job for `TaskRegistry::add_job`.
    pub fn builder(task: Rc<dyn Task>) -> JobBuilder {
        JobBuilder {
            task,
            pattern: Event::any(),
            priority: 0,
            enabled: true,
        }
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn owner(&self) -> RegistryId {
        self.owner
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn task(&self) -> &Rc<dyn Task> {
        &self.task
    }

    pub fn pattern(&self) -> &Event {
        &self.pattern
    }

    pub fn user_data(&self) -> Option<UserData> {
        self.pattern.user_data.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.get()
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.marked_for_delete.get()
    }

    pub(crate) fn mark_for_delete(&self) {
        self.marked_for_delete.set(true);
    }

    pub fn matches(&self, probe: &Event) -> bool {
        self.pattern.matches(probe)
    }

    /// Runs the task with `event`.
    ///
    /// Fails with `Error::Aborted`, without calling the task, when the job is
    /// already running, disabled, or waiting to be reaped. The task's own
    /// result is returned unchanged.
    pub fn execute(&self, event: &mut Event) -> Result<()> {
        if self.busy.get() || !self.enabled.get() || self.marked_for_delete.get() {
            return Err(Error::Aborted);
        }
        let _busy = BusyGuard::enter(&self.busy);

        event.user_data = self.pattern.user_data.clone();
        event.handle = self.handle;
        event.owner = Some(self.owner);
        event.priority = self.priority;

        self.task.execute(event)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("handle", &self.handle)
            .field("owner", &self.owner)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled.get())
            .field("busy", &self.busy.get())
            .field("marked_for_delete", &self.marked_for_delete.get())
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// A job that has not been handed a handle yet.
pub struct JobBuilder {
    task: Rc<dyn Task>,
    pattern: Event,
    priority: u32,
    enabled: bool,
}

impl JobBuilder {
    pub fn pattern(mut self, pattern: Event) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub(crate) fn build(self, handle: TaskHandle, owner: RegistryId) -> Job {
        let mut pattern = self.pattern;
        pattern.handle = handle;
        pattern.owner = Some(owner);
        pattern.priority = self.priority;
        Job {
            task: self.task,
            pattern,
            priority: self.priority,
            handle,
            owner,
            enabled: Cell::new(self.enabled),
            busy: Cell::new(false),
            marked_for_delete: Cell::new(false),
        }
    }
}

/// Holds a job's busy flag for the duration of one execution, including unwinds.
struct BusyGuard<'a>(&'a Cell<bool>);

impl<'a> BusyGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
