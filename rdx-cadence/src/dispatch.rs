//! Routes application-defined notifications to the jobs waiting for them.
//!
//! The dispatcher owns its own `TaskRegistry`. Submitting an event builds a
//! view of the matching jobs and executes it; failures reported by those
//! jobs come back through `submit_error` as `ERROR` notifications, so error
//! handlers are ordinary jobs registered against `NotificationType::ERROR`.

use crate::common::{HandleAllocator, NotificationId, NotificationType, ObjectId, TaskHandle};
use crate::components::task::Task;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::events::{ErrorInfo, Event, EventPayload, Origin, UserData};
use crate::registry::{DispatchReport, ErrorSink, Job, TaskRegistry};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// What a job registered with the dispatcher listens for.
#[derive(Clone, Default)]
pub struct Registration {
    pub notification_type: Option<NotificationType>,
    pub notification_id: Option<NotificationId>,
    pub key_filter: Option<u32>,
    pub object_filter: Option<ObjectId>,
    pub user_data: Option<UserData>,
    pub priority: u32,
}

impl Registration {
    pub fn new(notification_type: Option<NotificationType>, notification_id: Option<NotificationId>) -> Self {
        Self {
            notification_type,
            notification_id,
            ..Self::default()
        }
    }

    pub fn key_filter(mut self, key: u32) -> Self {
        self.key_filter = Some(key);
        self
    }

    pub fn object_filter(mut self, object: ObjectId) -> Self {
        self.object_filter = Some(object);
        self
    }

    pub fn user_data(mut self, data: Option<UserData>) -> Self {
        self.user_data = data;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    fn pattern(&self) -> Event {
        Event {
            notification_type: self.notification_type,
            notification_id: self.notification_id,
            key_filter: self.key_filter,
            object_filter: self.object_filter,
            user_data: self.user_data.clone(),
            ..Event::default()
        }
    }
}

pub struct EventDispatcher {
    registry: RefCell<TaskRegistry>,
    next_type: Cell<u32>,
    next_id: Cell<u32>,
    event_ids: RefCell<HashMap<u32, NotificationId>>,
    error_depth: Cell<u32>,
    max_error_depth: u32,
}

impl EventDispatcher {
    pub fn new(handles: HandleAllocator, config: &SchedulerConfig) -> Self {
        Self {
            registry: RefCell::new(TaskRegistry::with_config(handles, config)),
            next_type: Cell::new(NotificationType::AUTO.0),
            next_id: Cell::new(NotificationId::AUTO.0),
            event_ids: RefCell::new(HashMap::new()),
            error_depth: Cell::new(0),
            max_error_depth: config.max_error_depth,
        }
    }

    /// Mints a notification type no other caller of this dispatcher has seen.
    pub fn next_type(&self) -> Result<NotificationType> {
        let raw = self.next_type.get();
        let following = raw.checked_add(1).ok_or(Error::Exhausted("notification types"))?;
        self.next_type.set(following);
        Ok(NotificationType(raw))
    }

    /// Mints a notification id no other caller of this dispatcher has seen.
    pub fn next_id(&self) -> Result<NotificationId> {
        let raw = self.next_id.get();
        let following = raw.checked_add(1).ok_or(Error::Exhausted("notification ids"))?;
        self.next_id.set(following);
        Ok(NotificationId(raw))
    }

    pub fn register_task(
        &self,
        task: Rc<dyn Task>,
        notification_type: Option<NotificationType>,
        notification_id: Option<NotificationId>,
    ) -> Result<TaskHandle> {
        self.register_task_with(task, Registration::new(notification_type, notification_id))
    }

    pub fn register_task_with(&self, task: Rc<dyn Task>, registration: Registration) -> Result<TaskHandle> {
        let handle = self
            .registry
            .borrow_mut()
            .add_task(task, registration.pattern(), registration.priority)?;
        trace!(
            "Dispatcher: job {} listens for {:?}/{:?}",
            handle,
            registration.notification_type,
            registration.notification_id
        );
        Ok(handle)
    }

    pub fn unregister_task(&self, handle: TaskHandle) -> Result<()> {
        self.registry.borrow_mut().remove_task(handle)
    }

    pub fn get_task(&self, handle: TaskHandle) -> Result<Rc<Job>> {
        self.registry.borrow().get_task(handle)
    }

    /// Delivers `event` to every matching job, forwarding their failures.
    ///
    /// The registry is not borrowed while jobs run, so a job may register,
    /// unregister or submit further events from inside its task.
    pub fn submit_event(&self, mut event: Event) -> Result<DispatchReport> {
        if event.origin == Origin::Unknown {
            event.origin = Origin::Dispatcher;
        }
        let view = self.registry.borrow().create_view(&event);
        trace!(
            "Dispatching {:?}/{:?} to {} job(s)",
            event.notification_type,
            event.notification_id,
            view.len()
        );
        Ok(view.execute_all(&mut event, Some(self)))
    }

    /// Shorthand for a plain notification.
    pub fn submit(
        &self,
        notification_type: NotificationType,
        notification_id: NotificationId,
        time: u32,
        data: Option<UserData>,
    ) -> Result<DispatchReport> {
        let event = Event::notification(Some(notification_type), Some(notification_id))
            .with_time(time)
            .with_notification_data(data);
        self.submit_event(event)
    }

    /// Maps an application key to a previously minted notification id.
    pub fn add_event_id(&self, key: u32, id: NotificationId) -> Result<()> {
        let mut ids = self.event_ids.borrow_mut();
        if ids.contains_key(&key) {
            return Err(Error::AlreadyExists("event id"));
        }
        ids.insert(key, id);
        Ok(())
    }

    pub fn find_event_id(&self, key: u32) -> Result<NotificationId> {
        self.event_ids
            .borrow()
            .get(&key)
            .copied()
            .ok_or(Error::NotFound("event id"))
    }

    pub fn sweep(&self) -> usize {
        self.registry.borrow_mut().sweep()
    }

    pub fn len(&self) -> usize {
        self.registry.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.borrow().is_empty()
    }

    /// Drops every registration and the event-id table. Minted types and ids
    /// stay retired.
    pub fn reset(&self) {
        self.registry.borrow_mut().reset();
        self.event_ids.borrow_mut().clear();
    }
}

impl ErrorSink for EventDispatcher {
    fn submit_error(&self, info: ErrorInfo) -> Result<DispatchReport> {
        let depth = self.error_depth.get();
        if depth >= self.max_error_depth {
            warn!(
                "Dropping error {:#x} from job {}: nested error dispatch at depth {}",
                info.code(),
                info.handle,
                depth
            );
            return Err(Error::ErrorStorm { depth });
        }
        debug!("Job {} reported {}", info.handle, info.error);

        let mut event = Event {
            origin: Origin::Dispatcher,
            notification_type: Some(NotificationType::ERROR),
            notification_id: Some(NotificationId(info.handle.get())),
            key_filter: Some(info.code()),
            object_filter: Some(ObjectId::of(&info.task)),
            notification_data: info.user_data.clone(),
            time: info.time,
            ..Event::default()
        };
        event.payload = EventPayload::Error(Rc::new(info));

        self.error_depth.set(depth + 1);
        let _depth = DepthGuard(&self.error_depth);
        let view = self.registry.borrow().create_view(&event);
        Ok(view.execute_all(&mut event, Some(self)))
    }
}

struct DepthGuard<'a>(&'a Cell<u32>);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::task::task_fn;

    fn dispatcher() -> EventDispatcher {
        EventDispatcher::new(HandleAllocator::new(), &SchedulerConfig::default())
    }

    #[test]
    fn minted_types_and_ids_start_above_the_reserved_range() {
        let d = dispatcher();
        assert_eq!(d.next_type().unwrap(), NotificationType::AUTO);
        assert_eq!(d.next_type().unwrap(), NotificationType(0x101));
        assert_eq!(d.next_id().unwrap(), NotificationId::AUTO);

        d.reset();
        assert_eq!(d.next_id().unwrap(), NotificationId(0x101));
    }

    #[test]
    fn event_id_table_rejects_duplicates() {
        let d = dispatcher();
        d.add_event_id(7, NotificationId(0x120)).unwrap();

        assert!(matches!(d.add_event_id(7, NotificationId(1)), Err(Error::AlreadyExists(_))));
        assert_eq!(d.find_event_id(7).unwrap(), NotificationId(0x120));
        assert!(matches!(d.find_event_id(8), Err(Error::NotFound(_))));
    }

    #[test]
    fn submitted_data_reaches_listeners() {
        let d = dispatcher();
        let seen = Rc::new(Cell::new(0_u32));
        let sink = seen.clone();
        let kind = d.next_type().unwrap();
        d.register_task(
            task_fn(move |event| {
                sink.set(*event.notification_data_as::<u32>().unwrap_or(&0));
                Ok(())
            }),
            Some(kind),
            None,
        )
        .unwrap();

        let report = d.submit(kind, NotificationId(3), 50, Some(Rc::new(99_u32))).unwrap();
        assert_eq!(report.executed, 1);
        assert_eq!(seen.get(), 99);

        let other = d.submit(NotificationType(0x999), NotificationId(3), 50, None).unwrap();
        assert_eq!(other.matched, 0);
    }

    #[test]
    fn failures_become_one_error_notification() {
        let d = dispatcher();
        let kind = d.next_type().unwrap();
        let failing = d
            .register_task(task_fn(|_| Err(Error::task(0x77, "no mesh"))), Some(kind), None)
            .unwrap();
        let received = Rc::new(RefCell::new(Vec::new()));
        let log = received.clone();
        d.register_task(
            task_fn(move |event| {
                let info = event.error_info().ok_or(Error::NotFound("error info"))?;
                log.borrow_mut().push((info.handle, info.code(), event.key_filter));
                Ok(())
            }),
            Some(NotificationType::ERROR),
            None,
        )
        .unwrap();

        d.submit(kind, NotificationId(1), 0, None).unwrap();

        assert_eq!(*received.borrow(), vec![(failing, 0x77, Some(0x77))]);
    }

    #[test]
    fn error_handlers_can_filter_by_code() {
        let d = dispatcher();
        let kind = d.next_type().unwrap();
        d.register_task(task_fn(|_| Err(Error::task(5, "x"))), Some(kind), None)
            .unwrap();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        d.register_task_with(
            task_fn(move |_| {
                counter.set(counter.get() + 1);
                Ok(())
            }),
            Registration::new(Some(NotificationType::ERROR), None).key_filter(6),
        )
        .unwrap();

        d.submit(kind, NotificationId(1), 0, None).unwrap();
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn failing_error_handlers_stop_at_the_depth_limit() {
        let d = dispatcher();
        let kind = d.next_type().unwrap();
        d.register_task(task_fn(|_| Err(Error::task(1, "first"))), Some(kind), None)
            .unwrap();
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        d.register_task(
            task_fn(move |_| {
                counter.set(counter.get() + 1);
                Err(Error::task(2, "handler failed too"))
            }),
            Some(NotificationType::ERROR),
            None,
        )
        .unwrap();

        d.submit(kind, NotificationId(1), 0, None).unwrap();

        assert_eq!(runs.get(), SchedulerConfig::default().max_error_depth);
        assert_eq!(d.error_depth.get(), 0);
    }
}
