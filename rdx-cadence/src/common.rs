//! Contains common, primitive types used across the scheduler.
//!
//! This module defines the identifier types used to name registrations,
//! registries, notification channels, and timers. Using distinct types
//! improves type safety and keeps "a handle" from being confused with
//! "a notification id" at call sites.

use crate::error::{Error, Result};
use slotmap::new_key_type;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

new_key_type! {
    /// Arena slot of a job inside a single `TaskRegistry`.
    ///
    /// Slot keys are private to the registry that produced them. Callers
    /// identify jobs by `TaskHandle`, which is unique across registries.
    pub struct JobKey;

    /// Identifies an observer subscribed to a `Clock`.
    pub struct ObserverId;
}

/// Uniquely identifies a registered job across every registry of one scheduler root.
///
/// Handles are minted from a shared `HandleAllocator` and are never reused
/// while the root lives, even after the job is removed or its registry reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TaskHandle(pub(crate) u32);

impl TaskHandle {
    /// The handle carried by events and patterns that are not bound to a job.
    pub const INVALID: TaskHandle = TaskHandle(0);

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one `TaskRegistry` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryId(pub(crate) u32);

impl fmt::Display for RegistryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "registry-{}", self.0)
    }
}

/// The category of a notification, e.g. "timer fired" or "error".
///
/// Values below `AUTO` are reserved by the scheduler. Subsystems mint their
/// own types with `EventDispatcher::next_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationType(pub u32);

impl NotificationType {
    /// Scheduler-level control notifications (see `NotificationId::TASK_RESET`).
    pub const TASK: NotificationType = NotificationType(1);
    /// Failures reported by jobs, carrying an `ErrorInfo` payload.
    pub const ERROR: NotificationType = NotificationType(2);
    /// Timer expirations.
    pub const TIME: NotificationType = NotificationType(3);
    /// First value handed out by `EventDispatcher::next_type`.
    pub const AUTO: NotificationType = NotificationType(0x100);
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::TASK => f.write_str("task"),
            Self::ERROR => f.write_str("error"),
            Self::TIME => f.write_str("time"),
            NotificationType(raw) => write!(f, "type-{raw}"),
        }
    }
}

/// Distinguishes notifications of the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(pub u32);

impl NotificationId {
    /// Sent with `NotificationType::TASK` when the simulation is reset.
    pub const TASK_RESET: NotificationId = NotificationId(1);
    /// First value handed out by `EventDispatcher::next_id`.
    pub const AUTO: NotificationId = NotificationId(0x100);

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id-{}", self.0)
    }
}

/// Identifies a timer owned by the `TimerManager`. Zero is never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u32);

impl TimerId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// A non-owning identity of some object, compared by address.
///
/// Used as the "object filter" of a pattern and as an event origin, so a
/// job can listen only to events concerning one particular object without
/// keeping that object alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// The identity of the value behind a shared pointer.
    pub fn of<T: ?Sized>(value: &Rc<T>) -> Self {
        Self(Rc::as_ptr(value).cast::<()>() as usize)
    }
}

/// Mints task handles and registry ids for one scheduler root.
///
/// Every `TaskRegistry` created under a root holds a clone of the same
/// allocator, so handles never collide across registries. The counter is
/// never rewound.
#[derive(Debug, Clone)]
pub struct HandleAllocator {
    state: Rc<AllocatorState>,
}

#[derive(Debug)]
struct AllocatorState {
    next_handle: Cell<u32>,
    next_registry: Cell<u32>,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            state: Rc::new(AllocatorState {
                next_handle: Cell::new(1),
                next_registry: Cell::new(1),
            }),
        }
    }

    /// Issues the next unused handle.
    pub fn next_handle(&self) -> Result<TaskHandle> {
        let raw = self.state.next_handle.get();
        if raw == u32::MAX {
            return Err(Error::Exhausted("task handles"));
        }
        self.state.next_handle.set(raw + 1);
        Ok(TaskHandle(raw))
    }

    /// Whether `handle` was ever issued by this allocator.
    pub fn was_issued(&self, handle: TaskHandle) -> bool {
        handle.is_valid() && handle.0 < self.state.next_handle.get()
    }

    /// Number of handles issued so far.
    pub fn issued(&self) -> u32 {
        self.state.next_handle.get() - 1
    }

    pub(crate) fn next_registry_id(&self) -> RegistryId {
        let raw = self.state.next_registry.get();
        self.state.next_registry.set(raw.wrapping_add(1));
        RegistryId(raw)
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_sequential_and_never_invalid() {
        let handles = HandleAllocator::new();
        let first = handles.next_handle().unwrap();
        let second = handles.next_handle().unwrap();

        assert!(first.is_valid());
        assert_eq!(second.get(), first.get() + 1);
        assert_eq!(handles.issued(), 2);
    }

    #[test]
    fn clones_share_one_counter() {
        let a = HandleAllocator::new();
        let b = a.clone();
        let from_a = a.next_handle().unwrap();
        let from_b = b.next_handle().unwrap();

        assert_ne!(from_a, from_b);
        assert!(a.was_issued(from_b));
        assert!(!a.was_issued(TaskHandle::INVALID));
        assert!(!a.was_issued(TaskHandle(99)));
    }

    #[test]
    fn object_ids_compare_by_address() {
        let one = Rc::new(5_u8);
        let alias = one.clone();
        let other = Rc::new(5_u8);

        assert_eq!(ObjectId::of(&one), ObjectId::of(&alias));
        assert_ne!(ObjectId::of(&one), ObjectId::of(&other));
    }
}
