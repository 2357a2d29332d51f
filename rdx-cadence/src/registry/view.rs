//! Pooled snapshots of the jobs that match one event.

use super::job::Job;
use crate::common::TaskHandle;
use crate::error::{Error, Result};
use crate::events::{ErrorInfo, Event};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use tracing::{debug, trace, warn};

/// Receives failures collected by `TaskView::execute_all`.
pub trait ErrorSink {
    fn submit_error(&self, info: ErrorInfo) -> Result<DispatchReport>;
}

/// Outcome of executing one view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Jobs in the view.
    pub matched: usize,
    /// Jobs whose task was invoked, successfully or not.
    pub executed: usize,
    /// Jobs skipped because they were busy, disabled or pending removal.
    pub aborted: usize,
    /// Invoked jobs that returned an error other than `Aborted`.
    pub failed: usize,
}

impl DispatchReport {
    pub fn merge(&mut self, other: DispatchReport) {
        self.matched += other.matched;
        self.executed += other.executed;
        self.aborted += other.aborted;
        self.failed += other.failed;
    }
}

/// Element buffers waiting to be reused by the next `create_view`.
#[derive(Debug)]
pub(crate) struct ViewPool {
    free: Vec<Vec<Rc<Job>>>,
    capacity: usize,
    step_size: usize,
    checked_out: usize,
    allocations: usize,
}

/// Counters describing a registry's view pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers ready for reuse.
    pub free: usize,
    /// Views currently held outside the registry.
    pub checked_out: usize,
    /// Buffers allocated over the pool's lifetime.
    pub allocations: usize,
}

impl ViewPool {
    pub(crate) fn new(capacity: usize, step_size: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
            step_size: step_size.max(1),
            checked_out: 0,
            allocations: 0,
        }
    }

    pub(crate) fn step_size(&self) -> usize {
        self.step_size
    }

    pub(crate) fn checkout(&mut self) -> Vec<Rc<Job>> {
        self.checked_out += 1;
        self.free.pop().unwrap_or_else(|| {
            self.allocations += 1;
            Vec::with_capacity(self.step_size)
        })
    }

    fn give_back(&mut self, mut buffer: Vec<Rc<Job>>) {
        buffer.clear();
        self.checked_out = self.checked_out.saturating_sub(1);
        if self.free.len() < self.capacity {
            self.free.push(buffer);
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            free: self.free.len(),
            checked_out: self.checked_out,
            allocations: self.allocations,
        }
    }
}

/// An ordered snapshot of matching jobs.
///
/// A view is owned by whoever asked for it and is never touched by the
/// registry afterwards: adding or removing jobs does not change a view
/// already handed out. Dropping the view returns its buffer, emptied but
/// with its capacity intact, to the registry's pool.
pub struct TaskView {
    elements: Vec<Rc<Job>>,
    step_size: usize,
    pool: Weak<RefCell<ViewPool>>,
}

impl TaskView {
    pub(crate) fn new(elements: Vec<Rc<Job>>, step_size: usize, pool: Weak<RefCell<ViewPool>>) -> Self {
        Self {
            elements,
            step_size,
            pool,
        }
    }

    /// Appends a job, growing the buffer by `step_size` slots when full.
    pub(crate) fn push(&mut self, job: Rc<Job>) {
        if self.elements.len() == self.elements.capacity() {
            self.elements.reserve_exact(self.step_size);
        }
        self.elements.push(job);
    }

    /// Highest priority first; equal priorities keep registry order.
    pub(crate) fn sort_by_priority(&mut self) {
        self.elements.sort_by(|a, b| b.priority().cmp(&a.priority()));
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Slots currently allocated in the backing buffer.
    pub fn allocated(&self) -> usize {
        self.elements.capacity()
    }

    pub fn step_size(&self) -> usize {
        self.step_size
    }

    pub fn get(&self, index: usize) -> Option<&Rc<Job>> {
        self.elements.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<Job>> {
        self.elements.iter()
    }

    pub fn handles(&self) -> Vec<TaskHandle> {
        self.elements.iter().map(|job| job.handle()).collect()
    }

    /// Executes every job in view order.
    ///
    /// A failing job never stops the pass. Failures other than `Aborted`
    /// are collected and, when `sink` is given, forwarded once the whole
    /// pass has finished, so an error handler is never entered from inside
    /// the loop that produced the error.
    pub fn execute_all(&self, event: &mut Event, sink: Option<&dyn ErrorSink>) -> DispatchReport {
        let mut report = DispatchReport {
            matched: self.elements.len(),
            ..DispatchReport::default()
        };
        let mut failures = Vec::new();

        for job in &self.elements {
            match job.execute(event) {
                Ok(()) => report.executed += 1,
                Err(Error::Aborted) => {
                    trace!("Job {} aborted (busy or disabled).", job.handle());
                    report.aborted += 1;
                }
                Err(error) => {
                    debug!("Job {} failed: {}", job.handle(), error);
                    report.executed += 1;
                    report.failed += 1;
                    failures.push(ErrorInfo {
                        task: job.task().clone(),
                        handle: job.handle(),
                        error,
                        time: event.time,
                        user_data: job.user_data(),
                    });
                }
            }
        }

        if let Some(sink) = sink {
            for info in failures {
                let handle = info.handle;
                if let Err(e) = sink.submit_error(info) {
                    warn!("Could not forward failure of job {}: {}", handle, e);
                }
            }
        }
        report
    }
}

impl Drop for TaskView {
    fn drop(&mut self) {
        let elements = std::mem::take(&mut self.elements);
        if let Some(pool) = self.pool.upgrade() {
            if let Ok(mut pool) = pool.try_borrow_mut() {
                pool.give_back(elements);
            }
        }
    }
}
