//! One-shot and periodic timers, fired as `TIME` notifications.
//!
//! Pending timers are kept sorted by their next due time. Each timer belongs
//! to a time domain: system-domain timers are advanced once per tick against
//! system time, simulation-domain timers are advanced by the simulation
//! manager's query/advance stepping and so stop while the simulation is
//! paused.

use crate::common::{NotificationId, NotificationType, TaskHandle, TimerId};
use crate::components::task::Task;
use crate::dispatch::{EventDispatcher, Registration};
use crate::error::{Error, Result};
use crate::events::{Event, SimulationMsg};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Which clock a timer follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeDomain {
    #[default]
    System,
    Simulation,
}

#[derive(Debug, Clone)]
pub struct Timer {
    pub id: TimerId,
    pub notification_id: NotificationId,
    pub start: u32,
    pub period: u32,
    /// Zero runs forever.
    pub duration: u32,
    pub last_time: u32,
    pub next_time: u32,
    pub domain: TimeDomain,
    /// Job to unregister when the timer runs out.
    pub auto: Option<TaskHandle>,
}

impl Timer {
    /// Due time of the firing after the one at `time`, or `None` once the
    /// timer is spent. A timer never fires past `start + duration` and never
    /// wraps around the end of the millisecond range.
    fn next_after(&self, time: u32) -> Option<u32> {
        if self.period == 0 {
            return None;
        }
        let next = time.checked_add(self.period)?;
        if self.duration > 0 && next.saturating_sub(self.start) > self.duration {
            return None;
        }
        Some(next)
    }
}

/// First due time of a timer, checked against its duration and the time range.
fn first_due(start: u32, period: u32, duration: u32) -> Result<u32> {
    if period == 0 {
        return Ok(start);
    }
    if duration > 0 && period > duration {
        return Err(Error::InvalidRange("timer period exceeds its duration"));
    }
    start
        .checked_add(period)
        .ok_or(Error::InvalidRange("timer start"))
}

struct TimerQueue {
    pending: Vec<Timer>,
    free: Vec<Timer>,
    max_free: usize,
    next_id: u32,
    firing: Option<(TimerId, Option<TaskHandle>)>,
    kill_firing: bool,
}

impl TimerQueue {
    fn insert(&mut self, timer: Timer) {
        let at = self
            .pending
            .partition_point(|t| t.next_time <= timer.next_time);
        self.pending.insert(at, timer);
    }

    fn recycle(&mut self, timer: Timer) {
        if self.free.len() < self.max_free {
            self.free.push(timer);
        }
    }
}

pub struct TimerManager {
    dispatcher: Rc<EventDispatcher>,
    queue: RefCell<TimerQueue>,
    advancing: Cell<bool>,
}

impl TimerManager {
    pub fn new(dispatcher: Rc<EventDispatcher>, max_free_timers: usize) -> Self {
        Self {
            dispatcher,
            queue: RefCell::new(TimerQueue {
                pending: Vec::new(),
                free: Vec::new(),
                max_free: max_free_timers,
                next_id: 1,
                firing: None,
                kill_firing: false,
            }),
            advancing: Cell::new(false),
        }
    }

    /// Arms a system-domain timer.
    pub fn set_timer(
        &self,
        notification_id: NotificationId,
        start: u32,
        period: u32,
        duration: u32,
    ) -> Result<TimerId> {
        self.set_timer_in(TimeDomain::System, notification_id, start, period, duration)
    }

    /// Arms a timer that fires `(TIME, notification_id)`.
    ///
    /// A periodic timer first fires at `start + period`; with `period == 0`
    /// it fires once, at `start`.
    pub fn set_timer_in(
        &self,
        domain: TimeDomain,
        notification_id: NotificationId,
        start: u32,
        period: u32,
        duration: u32,
    ) -> Result<TimerId> {
        self.arm(domain, notification_id, start, period, duration, None, None)
    }

    /// Arms a timer that unregisters `handle` from the dispatcher when it expires.
    pub fn set_auto_timer(
        &self,
        domain: TimeDomain,
        notification_id: NotificationId,
        start: u32,
        period: u32,
        duration: u32,
        handle: TaskHandle,
    ) -> Result<TimerId> {
        self.arm(domain, notification_id, start, period, duration, Some(handle), None)
    }

    /// Registers `task` to be run by its own system-domain timer.
    pub fn register_task(&self, task: Rc<dyn Task>, start: u32, period: u32, duration: u32) -> Result<TaskHandle> {
        self.register_task_in(TimeDomain::System, task, start, period, duration)
    }

    /// Registers `task` to be run by its own timer.
    ///
    /// The task's user data is the `TimerId`, so it can kill its own timer.
    /// The registration goes away with the timer.
    pub fn register_task_in(
        &self,
        domain: TimeDomain,
        task: Rc<dyn Task>,
        start: u32,
        period: u32,
        duration: u32,
    ) -> Result<TaskHandle> {
        first_due(start, period, duration)?;
        let notification_id = self.dispatcher.next_id()?;
        let id = self.mint_id()?;
        let registration = Registration::new(Some(NotificationType::TIME), Some(notification_id))
            .user_data(Some(Rc::new(id)));
        let handle = self.dispatcher.register_task_with(task, registration)?;
        self.arm(domain, notification_id, start, period, duration, Some(handle), Some(id))?;
        Ok(handle)
    }

    /// Removes a job registered with `register_task` and its timer.
    pub fn unregister_task(&self, handle: TaskHandle) -> Result<()> {
        self.dispatcher.unregister_task(handle)?;
        let timer = {
            let q = self.queue.borrow();
            q.pending
                .iter()
                .find(|t| t.auto == Some(handle))
                .map(|t| t.id)
                .or_else(|| q.firing.filter(|(_, auto)| *auto == Some(handle)).map(|(id, _)| id))
        };
        match timer.map(|id| self.kill_timer(id)) {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Cancels a timer. Killing the timer that is firing right now takes
    /// effect once its dispatch returns.
    pub fn kill_timer(&self, id: TimerId) -> Result<()> {
        if id.0 == 0 {
            return Err(Error::InvalidRange("timer id"));
        }
        let mut q = self.queue.borrow_mut();
        if let Some(at) = q.pending.iter().position(|t| t.id == id) {
            let timer = q.pending.remove(at);
            q.recycle(timer);
            trace!("Killed {}", id);
            return Ok(());
        }
        if matches!(q.firing, Some((firing, _)) if firing == id) {
            q.kill_firing = true;
            trace!("Killing {} after it fires", id);
            return Ok(());
        }
        Err(Error::NotFound("timer"))
    }

    /// Fires, in due order, every timer of `domain` due at or before `end`.
    /// Returns how many firings happened.
    pub fn advance(&self, domain: TimeDomain, end: u32) -> Result<usize> {
        if self.advancing.replace(true) {
            return Err(Error::Aborted);
        }
        let _advancing = AdvanceGuard(&self.advancing);

        let mut fired = 0;
        loop {
            let mut timer = {
                let mut q = self.queue.borrow_mut();
                let due = q
                    .pending
                    .iter()
                    .position(|t| t.domain == domain)
                    .filter(|&at| q.pending[at].next_time <= end);
                let Some(at) = due else { break };
                let timer = q.pending.remove(at);
                q.firing = Some((timer.id, timer.auto));
                q.kill_firing = false;
                timer
            };

            let time = timer.next_time;
            trace!("{} fires at {} ms", timer.id, time);
            if let Err(e) = self.dispatcher.submit(
                NotificationType::TIME,
                timer.notification_id,
                time,
                Some(Rc::new(timer.id)),
            ) {
                warn!("Dispatch of {} failed: {}", timer.id, e);
            }
            fired += 1;

            let killed = {
                let mut q = self.queue.borrow_mut();
                q.firing = None;
                std::mem::take(&mut q.kill_firing)
            };
            if killed {
                self.queue.borrow_mut().recycle(timer);
                continue;
            }
            match timer.next_after(time) {
                Some(next) => {
                    timer.last_time = time;
                    timer.next_time = next;
                    self.queue.borrow_mut().insert(timer);
                }
                None => {
                    debug!("{} expired at {} ms", timer.id, time);
                    let auto = timer.auto;
                    self.queue.borrow_mut().recycle(timer);
                    if let Some(handle) = auto {
                        match self.dispatcher.unregister_task(handle) {
                            Ok(()) | Err(Error::NotFound(_)) => {}
                            Err(e) => warn!("Could not release job {}: {}", handle, e),
                        }
                    }
                }
            }
        }
        Ok(fired)
    }

    /// Earliest due time of `domain`, capped at `end`.
    pub fn query(&self, domain: TimeDomain, end: u32) -> u32 {
        self.queue
            .borrow()
            .pending
            .iter()
            .find(|t| t.domain == domain)
            .map_or(end, |t| t.next_time.min(end))
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().pending.len()
    }

    pub fn timer(&self, id: TimerId) -> Option<Timer> {
        self.queue.borrow().pending.iter().find(|t| t.id == id).cloned()
    }

    /// Pending timers in due order.
    pub fn timers(&self) -> Vec<Timer> {
        self.queue.borrow().pending.clone()
    }

    /// Drops every timer. A timer firing right now is dropped once it returns.
    pub fn reset(&self) {
        let mut q = self.queue.borrow_mut();
        let pending = std::mem::take(&mut q.pending);
        let count = pending.len();
        for timer in pending {
            q.recycle(timer);
        }
        if q.firing.is_some() {
            q.kill_firing = true;
        }
        debug!("Timers reset, {} dropped", count);
    }

    fn mint_id(&self) -> Result<TimerId> {
        let mut q = self.queue.borrow_mut();
        let raw = q.next_id;
        q.next_id = raw.checked_add(1).ok_or(Error::Exhausted("timer ids"))?;
        Ok(TimerId(raw))
    }

    #[allow(clippy::too_many_arguments)]
    fn arm(
        &self,
        domain: TimeDomain,
        notification_id: NotificationId,
        start: u32,
        period: u32,
        duration: u32,
        auto: Option<TaskHandle>,
        id: Option<TimerId>,
    ) -> Result<TimerId> {
        if notification_id.0 == 0 {
            return Err(Error::InvalidRange("notification id"));
        }
        let next_time = first_due(start, period, duration)?;
        let id = match id {
            Some(id) => id,
            None => self.mint_id()?,
        };

        let mut q = self.queue.borrow_mut();
        let mut timer = q.free.pop().unwrap_or_else(|| Timer {
            id,
            notification_id,
            start,
            period,
            duration,
            last_time: start,
            next_time,
            domain,
            auto,
        });
        timer.id = id;
        timer.notification_id = notification_id;
        timer.start = start;
        timer.period = period;
        timer.duration = duration;
        timer.last_time = start;
        timer.next_time = next_time;
        timer.domain = domain;
        timer.auto = auto;
        q.insert(timer);

        trace!("Armed {} ({:?}) due at {} ms", id, domain, next_time);
        Ok(id)
    }
}

/// Answers simulation stepping for simulation-domain timers.
impl Task for TimerManager {
    fn execute(&self, event: &mut Event) -> Result<()> {
        let Some(info) = event.simulation().copied() else {
            return Ok(());
        };
        match info.msg {
            SimulationMsg::Query => {
                let due = self.query(TimeDomain::Simulation, info.end);
                if let Some(step) = event.simulation_mut() {
                    step.limit_to(due);
                }
            }
            SimulationMsg::Advance => {
                self.advance(TimeDomain::Simulation, info.end)?;
            }
        }
        Ok(())
    }
}

struct AdvanceGuard<'a>(&'a Cell<bool>);

impl Drop for AdvanceGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::HandleAllocator;
    use crate::components::task::task_fn;
    use crate::config::SchedulerConfig;
    use crate::events::{EventPayload, SimulationInfo};

    fn setup() -> (Rc<EventDispatcher>, Rc<TimerManager>) {
        let dispatcher = Rc::new(EventDispatcher::new(
            HandleAllocator::new(),
            &SchedulerConfig::default(),
        ));
        let timers = Rc::new(TimerManager::new(dispatcher.clone(), 4));
        (dispatcher, timers)
    }

    fn record_times(dispatcher: &EventDispatcher, id: NotificationId) -> Rc<RefCell<Vec<u32>>> {
        let times = Rc::new(RefCell::new(Vec::new()));
        let log = times.clone();
        dispatcher
            .register_task(
                task_fn(move |event| {
                    log.borrow_mut().push(event.time);
                    Ok(())
                }),
                Some(NotificationType::TIME),
                Some(id),
            )
            .unwrap();
        times
    }

    #[test]
    fn periodic_timer_expires_after_its_duration() {
        let (dispatcher, timers) = setup();
        let times = record_times(&dispatcher, NotificationId(42));
        timers.set_timer(NotificationId(42), 0, 100, 300).unwrap();

        for now in [100, 200, 300, 400] {
            timers.advance(TimeDomain::System, now).unwrap();
        }

        assert_eq!(*times.borrow(), vec![100, 200, 300]);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn timer_never_fires_past_its_duration() {
        let (dispatcher, timers) = setup();
        let times = record_times(&dispatcher, NotificationId(42));
        timers.set_timer(NotificationId(42), 0, 100, 250).unwrap();

        timers.advance(TimeDomain::System, 600).unwrap();

        assert_eq!(*times.borrow(), vec![100, 200]);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn period_longer_than_duration_is_rejected() {
        let (dispatcher, timers) = setup();
        assert!(matches!(
            timers.set_timer(NotificationId(42), 0, 100, 50),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(
            timers.register_task(task_fn(|_| Ok(())), 0, 100, 50),
            Err(Error::InvalidRange(_))
        ));
        assert_eq!(timers.pending(), 0);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn rescheduling_past_the_time_range_expires_the_timer() {
        let (dispatcher, timers) = setup();
        let times = record_times(&dispatcher, NotificationId(42));
        timers
            .set_timer(NotificationId(42), u32::MAX - 150, 100, 0)
            .unwrap();

        assert_eq!(timers.advance(TimeDomain::System, u32::MAX - 10).unwrap(), 1);
        assert_eq!(timers.advance(TimeDomain::System, u32::MAX).unwrap(), 0);
        assert_eq!(*times.borrow(), vec![u32::MAX - 50]);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn first_due_time_past_the_time_range_is_rejected() {
        let (_dispatcher, timers) = setup();
        assert!(matches!(
            timers.set_timer(NotificationId(42), u32::MAX - 5, 10, 0),
            Err(Error::InvalidRange(_))
        ));
        assert!(timers.set_timer(NotificationId(42), u32::MAX, 0, 0).is_ok());
    }

    #[test]
    fn one_shot_fires_once_at_start() {
        let (dispatcher, timers) = setup();
        let times = record_times(&dispatcher, NotificationId(7));
        timers.set_timer(NotificationId(7), 50, 0, 0).unwrap();

        assert_eq!(timers.advance(TimeDomain::System, 49).unwrap(), 0);
        assert_eq!(timers.advance(TimeDomain::System, 1000).unwrap(), 1);
        assert_eq!(*times.borrow(), vec![50]);
    }

    #[test]
    fn catching_up_fires_every_missed_period() {
        let (dispatcher, timers) = setup();
        let times = record_times(&dispatcher, NotificationId(9));
        timers.set_timer(NotificationId(9), 0, 10, 0).unwrap();

        assert_eq!(timers.advance(TimeDomain::System, 35).unwrap(), 3);
        assert_eq!(*times.borrow(), vec![10, 20, 30]);
        assert_eq!(timers.pending(), 1);
    }

    #[test]
    fn equal_due_times_fire_in_arming_order() {
        let (dispatcher, timers) = setup();
        let order = Rc::new(RefCell::new(Vec::new()));
        let log = order.clone();
        dispatcher
            .register_task(
                task_fn(move |event| {
                    log.borrow_mut().push(*event.notification_data_as::<TimerId>().unwrap());
                    Ok(())
                }),
                Some(NotificationType::TIME),
                None,
            )
            .unwrap();
        let first = timers.set_timer(NotificationId(1), 10, 0, 0).unwrap();
        let second = timers.set_timer(NotificationId(2), 10, 0, 0).unwrap();

        timers.advance(TimeDomain::System, 10).unwrap();
        assert_eq!(*order.borrow(), vec![first, second]);
    }

    #[test]
    fn invalid_and_unknown_timers_are_rejected() {
        let (_dispatcher, timers) = setup();
        assert!(matches!(
            timers.set_timer(NotificationId(0), 0, 1, 0),
            Err(Error::InvalidRange(_))
        ));
        assert!(matches!(timers.kill_timer(TimerId(0)), Err(Error::InvalidRange(_))));
        assert!(matches!(timers.kill_timer(TimerId(77)), Err(Error::NotFound(_))));
    }

    #[test]
    fn a_timer_can_kill_itself_while_firing() {
        let (dispatcher, timers) = setup();
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let inner = timers.clone();
        let handle = timers
            .register_task(
                task_fn(move |event| {
                    counter.set(counter.get() + 1);
                    let id = *event.user_data_as::<TimerId>().ok_or(Error::NotFound("timer id"))?;
                    inner.kill_timer(id)
                }),
                0,
                10,
                0,
            )
            .unwrap();

        timers.advance(TimeDomain::System, 100).unwrap();

        assert_eq!(runs.get(), 1);
        assert_eq!(timers.pending(), 0);
        assert!(dispatcher.get_task(handle).is_ok());
    }

    #[test]
    fn expired_auto_timers_release_their_job() {
        let (dispatcher, timers) = setup();
        let handle = timers
            .register_task(task_fn(|_| Ok(())), 0, 10, 20)
            .unwrap();

        timers.advance(TimeDomain::System, 20).unwrap();

        assert!(matches!(dispatcher.get_task(handle), Err(Error::NotFound(_))));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn unregistering_a_timer_task_kills_its_timer() {
        let (dispatcher, timers) = setup();
        let handle = timers.register_task(task_fn(|_| Ok(())), 0, 10, 0).unwrap();

        timers.unregister_task(handle).unwrap();
        assert_eq!(timers.pending(), 0);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn domains_advance_independently() {
        let (dispatcher, timers) = setup();
        let system = record_times(&dispatcher, NotificationId(1));
        let simulation = record_times(&dispatcher, NotificationId(2));
        timers.set_timer(NotificationId(1), 0, 10, 0).unwrap();
        timers
            .set_timer_in(TimeDomain::Simulation, NotificationId(2), 0, 15, 0)
            .unwrap();

        assert_eq!(timers.query(TimeDomain::Simulation, 100), 15);
        timers.advance(TimeDomain::System, 20).unwrap();

        assert_eq!(*system.borrow(), vec![10, 20]);
        assert!(simulation.borrow().is_empty());
    }

    #[test]
    fn simulation_query_limits_the_step() {
        let (_dispatcher, timers) = setup();
        timers
            .set_timer_in(TimeDomain::Simulation, NotificationId(3), 0, 40, 0)
            .unwrap();

        let mut query = Event::any().with_payload(EventPayload::Simulation(SimulationInfo::query(0, 100)));
        timers.execute(&mut query).unwrap();
        assert_eq!(query.simulation().map(|s| s.max_time), Some(40));

        let mut advance = Event::any().with_payload(EventPayload::Simulation(SimulationInfo::advance(0, 40)));
        timers.execute(&mut advance).unwrap();
        assert_eq!(timers.timers()[0].next_time, 80);
    }

    #[test]
    fn nested_advance_is_aborted() {
        let (dispatcher, timers) = setup();
        let nested = Rc::new(RefCell::new(None));
        let result = nested.clone();
        let inner = timers.clone();
        dispatcher
            .register_task(
                task_fn(move |_| {
                    *result.borrow_mut() = Some(inner.advance(TimeDomain::System, 1000).is_err());
                    Ok(())
                }),
                Some(NotificationType::TIME),
                None,
            )
            .unwrap();
        timers.set_timer(NotificationId(5), 1, 0, 0).unwrap();

        timers.advance(TimeDomain::System, 1).unwrap();
        assert_eq!(*nested.borrow(), Some(true));
    }
}
