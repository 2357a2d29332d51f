//! Defines the unit of executable behavior the scheduler invokes.

use crate::error::{Error, Result};
use crate::events::Event;
use std::cell::RefCell;
use std::rc::Rc;

/// Something that can be registered against a tick or a notification.
///
/// `execute` receives the live event, with the registration's user data
/// already merged in. Tasks are shared (`Rc<dyn Task>`) and may be invoked
/// re-entrantly through different jobs, so implementations that keep state
/// use interior mutability.
pub trait Task {
    fn execute(&self, event: &mut Event) -> Result<()>;
}

/// A closure invoked as a task.
pub type TaskFn = Box<dyn FnMut(&mut Event) -> Result<()>>;

/// Adapts a closure into a `Task`.
///
/// A closure cannot be re-entered while it is running; a nested invocation
/// returns `Error::Aborted` instead.
pub struct FnTask {
    logic: RefCell<TaskFn>,
}

impl FnTask {
    pub fn new(logic: impl FnMut(&mut Event) -> Result<()> + 'static) -> Self {
        Self {
            logic: RefCell::new(Box::new(logic)),
        }
    }
}

impl Task for FnTask {
    fn execute(&self, event: &mut Event) -> Result<()> {
        let mut logic = self.logic.try_borrow_mut().map_err(|_| Error::Aborted)?;
        (logic)(event)
    }
}

/// Shorthand for `Rc::new(FnTask::new(logic))`.
pub fn task_fn(logic: impl FnMut(&mut Event) -> Result<()> + 'static) -> Rc<dyn Task> {
    Rc::new(FnTask::new(logic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn closure_tasks_keep_state_between_calls() {
        let count = Rc::new(Cell::new(0));
        let seen = count.clone();
        let task = task_fn(move |_| {
            seen.set(seen.get() + 1);
            Ok(())
        });

        task.execute(&mut Event::any()).unwrap();
        task.execute(&mut Event::any()).unwrap();
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn nested_invocation_of_a_closure_aborts() {
        let slot: Rc<RefCell<Option<Rc<dyn Task>>>> = Rc::new(RefCell::new(None));
        let inner = slot.clone();
        let nested = Rc::new(Cell::new(None));
        let nested_seen = nested.clone();
        let task = task_fn(move |event| {
            let me = inner.borrow().clone();
            if let Some(me) = me {
                nested_seen.set(Some(me.execute(event).is_err()));
            }
            Ok(())
        });
        *slot.borrow_mut() = Some(task.clone());

        task.execute(&mut Event::any()).unwrap();
        assert_eq!(nested.get(), Some(true));
        slot.borrow_mut().take();
    }
}
