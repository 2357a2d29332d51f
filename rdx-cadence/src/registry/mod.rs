//! The job registry: owns registered jobs and builds views over them.
//!
//! Jobs live in a `slotmap` arena linked into a doubly linked list, newest
//! first. Handles come from the `HandleAllocator` shared by every registry
//! of one scheduler root, so a handle names exactly one job anywhere in
//! that root. A per-registry index maps handles back to arena slots.

pub mod job;
pub mod view;

pub use job::{Job, JobBuilder};
pub use view::{DispatchReport, ErrorSink, PoolStats, TaskView};

use crate::common::{HandleAllocator, JobKey, RegistryId, TaskHandle};
use crate::components::task::Task;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::events::Event;
use slotmap::SlotMap;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace};
use view::ViewPool;

struct JobNode {
    job: Rc<Job>,
    prev: Option<JobKey>,
    next: Option<JobKey>,
}

/// A list of jobs sharing one handle space with its sibling registries.
pub struct TaskRegistry {
    id: RegistryId,
    handles: HandleAllocator,
    jobs: SlotMap<JobKey, JobNode>,
    head: Option<JobKey>,
    index: HashMap<TaskHandle, JobKey>,
    pool: Rc<RefCell<ViewPool>>,
}

impl TaskRegistry {
    /// Creates an empty registry drawing handles from `handles`.
    pub fn new(handles: HandleAllocator) -> Self {
        Self::with_config(handles, &SchedulerConfig::default())
    }

    /// Creates an empty registry sized by the view settings in `config`.
    pub fn with_config(handles: HandleAllocator, config: &SchedulerConfig) -> Self {
        let id = handles.next_registry_id();
        Self {
            id,
            handles,
            jobs: SlotMap::with_key(),
            head: None,
            index: HashMap::new(),
            pool: Rc::new(RefCell::new(ViewPool::new(
                config.view_pool_capacity,
                config.view_step_size,
            ))),
        }
    }

    pub fn id(&self) -> RegistryId {
        self.id
    }

    pub fn handles(&self) -> &HandleAllocator {
        &self.handles
    }

    /// Registers `task` against `pattern` and returns its new handle.
    pub fn add_task(&mut self, task: Rc<dyn Task>, pattern: Event, priority: u32) -> Result<TaskHandle> {
        self.add_job(Job::builder(task).pattern(pattern).priority(priority))
    }

    /// Registers a pre-configured job. The registry still assigns the handle.
    pub fn add_job(&mut self, builder: JobBuilder) -> Result<TaskHandle> {
        let handle = self.handles.next_handle()?;
        let job = Rc::new(builder.build(handle, self.id));

        let old_head = self.head;
        let key = self.jobs.insert(JobNode {
            job,
            prev: None,
            next: old_head,
        });
        if let Some(old) = old_head {
            if let Some(node) = self.jobs.get_mut(old) {
                node.prev = Some(key);
            }
        }
        self.head = Some(key);
        self.index.insert(handle, key);

        trace!("{}: added job {}", self.id, handle);
        Ok(handle)
    }

    /// Removes the job registered under `handle`.
    ///
    /// A job that is executing right now is only marked and is reaped by
    /// the next `sweep`. A job already marked counts as removed.
    pub fn remove_task(&mut self, handle: TaskHandle) -> Result<()> {
        let key = self.lookup(handle)?;
        let job = &self.jobs[key].job;
        if job.is_marked_for_delete() {
            return Err(Error::NotFound("task"));
        }
        if job.is_busy() {
            job.mark_for_delete();
            debug!("{}: job {} is busy, removal deferred", self.id, handle);
            return Ok(());
        }
        self.unlink(key);
        trace!("{}: removed job {}", self.id, handle);
        Ok(())
    }

    /// Flags a job for removal at the next `sweep`. Marked jobs no longer
    /// appear in new views and abort if executed from an old one.
    pub fn mark_for_delete(&mut self, handle: TaskHandle) -> Result<()> {
        let key = self.lookup(handle)?;
        self.jobs[key].job.mark_for_delete();
        Ok(())
    }

    /// Reaps every marked job that is not running. Returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        let reaped: Vec<JobKey> = self
            .jobs
            .iter()
            .filter(|(_, node)| node.job.is_marked_for_delete() && !node.job.is_busy())
            .map(|(key, _)| key)
            .collect();
        for key in &reaped {
            self.unlink(*key);
        }
        if !reaped.is_empty() {
            debug!("{}: swept {} job(s)", self.id, reaped.len());
        }
        reaped.len()
    }

    pub fn get_task(&self, handle: TaskHandle) -> Result<Rc<Job>> {
        let key = self.lookup(handle)?;
        Ok(self.jobs[key].job.clone())
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.index.contains_key(&handle)
    }

    /// Collects every job whose pattern matches `probe`.
    ///
    /// Jobs pending removal are skipped. The result is ordered by
    /// descending priority; equal priorities keep list order, newest first.
    pub fn create_view(&self, probe: &Event) -> TaskView {
        let (buffer, step_size) = {
            let mut pool = self.pool.borrow_mut();
            (pool.checkout(), pool.step_size())
        };
        let mut view = TaskView::new(buffer, step_size, Rc::downgrade(&self.pool));
        for job in self.iter() {
            if !job.is_marked_for_delete() && job.matches(probe) {
                view.push(job.clone());
            }
        }
        view.sort_by_priority();
        view
    }

    /// Jobs in list order, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Job>> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.jobs.get(cursor?)?;
            cursor = node.next;
            Some(&node.job)
        })
    }

    /// Drops every job. Handles already issued stay retired.
    pub fn reset(&mut self) {
        let count = self.jobs.len();
        self.jobs.clear();
        self.index.clear();
        self.head = None;
        debug!("{}: reset, {} job(s) released", self.id, count);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.borrow().stats()
    }

    fn lookup(&self, handle: TaskHandle) -> Result<JobKey> {
        if !self.handles.was_issued(handle) {
            return Err(Error::InvalidHandle(handle));
        }
        self.index.get(&handle).copied().ok_or(Error::NotFound("task"))
    }

    fn unlink(&mut self, key: JobKey) -> Option<Rc<Job>> {
        let node = self.jobs.remove(key)?;
        match node.prev {
            Some(prev) => {
                if let Some(p) = self.jobs.get_mut(prev) {
                    p.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        if let Some(next) = node.next {
            if let Some(n) = self.jobs.get_mut(next) {
                n.prev = node.prev;
            }
        }
        self.index.remove(&node.job.handle());
        Some(node.job)
    }
}
