//! Defines the event record passed to every task, and the payloads it can carry.
//!
//! An `Event` plays two roles. As a live occurrence it is handed to
//! `Task::execute`. As a pattern it is stored inside a job at registration
//! time, and dispatch compares the two: every matching field that is `None`
//! on either side is a wildcard, every field set on both sides must be equal.

use crate::common::{NotificationId, NotificationType, ObjectId, RegistryId, TaskHandle};
use crate::components::task::Task;
use crate::error::Error;
use std::any::Any;
use std::fmt;
use std::rc::Rc;

/// Opaque data attached to a registration or an occurrence.
///
/// The scheduler never looks inside; receivers downcast it with
/// `Event::user_data_as` / `Event::notification_data_as`.
pub type UserData = Rc<dyn Any>;

/// Who raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Unknown,
    Scheduler,
    SystemManager,
    SimulationManager,
    Dispatcher,
    Timers,
    Object(ObjectId),
}

/// Per-tick information handed to system-domain and root jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerInfo {
    pub frame: u32,
    pub system_time: u32,
}

/// The two halves of a simulation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMsg {
    /// "How far can you advance?" The task lowers `max_time` if it must
    /// act before `end`.
    Query,
    /// "Advance from `start` to `end`."
    Advance,
}

/// Simulation stepping interval, sent to simulation-domain jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationInfo {
    pub msg: SimulationMsg,
    pub start: u32,
    pub end: u32,
    pub max_time: u32,
}

impl SimulationInfo {
    pub fn query(start: u32, end: u32) -> Self {
        Self {
            msg: SimulationMsg::Query,
            start,
            end,
            max_time: end,
        }
    }

    pub fn advance(start: u32, end: u32) -> Self {
        Self {
            msg: SimulationMsg::Advance,
            start,
            end,
            max_time: end,
        }
    }

    /// Reports that the simulation must not pass `time` before the answering
    /// task gets to act again.
    pub fn limit_to(&mut self, time: u32) {
        self.max_time = self.max_time.min(time);
    }
}

/// Describes a job failure forwarded to the error channel.
pub struct ErrorInfo {
    pub task: Rc<dyn Task>,
    pub handle: TaskHandle,
    pub error: Error,
    pub time: u32,
    pub user_data: Option<UserData>,
}

impl ErrorInfo {
    pub fn code(&self) -> u32 {
        self.error.code()
    }
}

impl fmt::Debug for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorInfo")
            .field("handle", &self.handle)
            .field("error", &self.error)
            .field("time", &self.time)
            .finish_non_exhaustive()
    }
}

/// The typed part of an event. Each variant is a capability a task can
/// look for; anything it does not understand it ignores.
#[derive(Debug, Clone, Default)]
pub enum EventPayload {
    #[default]
    Notification,
    Scheduler(SchedulerInfo),
    Simulation(SimulationInfo),
    Error(Rc<ErrorInfo>),
}

/// A single occurrence, or a template to match occurrences against.
#[derive(Clone, Default)]
pub struct Event {
    pub origin: Origin,
    pub notification_type: Option<NotificationType>,
    pub notification_id: Option<NotificationId>,
    pub key_filter: Option<u32>,
    pub object_filter: Option<ObjectId>,
    /// Registration data of the job currently executing.
    pub user_data: Option<UserData>,
    /// Data supplied by whoever submitted the occurrence.
    pub notification_data: Option<UserData>,
    pub time: u32,
    pub owner: Option<RegistryId>,
    pub handle: TaskHandle,
    pub priority: u32,
    pub payload: EventPayload,
}

impl Event {
    /// A pattern that matches every event.
    pub fn any() -> Self {
        Self::default()
    }

    /// A notification of the given type and id; `None` on either is a wildcard.
    pub fn notification(
        notification_type: Option<NotificationType>,
        notification_id: Option<NotificationId>,
    ) -> Self {
        Self {
            notification_type,
            notification_id,
            ..Self::default()
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_time(mut self, time: u32) -> Self {
        self.time = time;
        self
    }

    pub fn with_key_filter(mut self, key: u32) -> Self {
        self.key_filter = Some(key);
        self
    }

    pub fn with_object_filter(mut self, object: ObjectId) -> Self {
        self.object_filter = Some(object);
        self
    }

    pub fn with_user_data(mut self, data: Option<UserData>) -> Self {
        self.user_data = data;
        self
    }

    pub fn with_notification_data(mut self, data: Option<UserData>) -> Self {
        self.notification_data = data;
        self
    }

    pub fn with_payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Whether this pattern accepts `probe`.
    ///
    /// Symmetric: a `None` field on either side matches anything.
    pub fn matches(&self, probe: &Event) -> bool {
        fn field<T: PartialEq>(pattern: &Option<T>, probe: &Option<T>) -> bool {
            match (pattern, probe) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }

        field(&self.notification_type, &probe.notification_type)
            && field(&self.notification_id, &probe.notification_id)
            && field(&self.key_filter, &probe.key_filter)
            && field(&self.object_filter, &probe.object_filter)
    }

    pub fn user_data_as<T: Any>(&self) -> Option<&T> {
        self.user_data.as_deref()?.downcast_ref()
    }

    pub fn notification_data_as<T: Any>(&self) -> Option<&T> {
        self.notification_data.as_deref()?.downcast_ref()
    }

    pub fn scheduler_info(&self) -> Option<&SchedulerInfo> {
        match &self.payload {
            EventPayload::Scheduler(info) => Some(info),
            _ => None,
        }
    }

    pub fn simulation(&self) -> Option<&SimulationInfo> {
        match &self.payload {
            EventPayload::Simulation(info) => Some(info),
            _ => None,
        }
    }

    pub fn simulation_mut(&mut self) -> Option<&mut SimulationInfo> {
        match &mut self.payload {
            EventPayload::Simulation(info) => Some(info),
            _ => None,
        }
    }

    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match &self.payload {
            EventPayload::Error(info) => Some(info),
            _ => None,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("origin", &self.origin)
            .field("type", &self.notification_type)
            .field("id", &self.notification_id)
            .field("key", &self.key_filter)
            .field("object", &self.object_filter)
            .field("time", &self.time)
            .field("handle", &self.handle)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}
