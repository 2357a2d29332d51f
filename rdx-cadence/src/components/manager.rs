//! Per-frame job registries for the two time domains.
//!
//! The `SystemManager` runs its jobs once per tick whether or not the
//! simulation is paused. The `SimulationManager` runs only while the clock
//! is running, and splits each frame into steps no longer than any of its
//! jobs allows, so an event due mid-frame is handled at its own time.

use crate::clock::Clock;
use crate::common::{HandleAllocator, TaskHandle};
use crate::components::task::Task;
use crate::config::SchedulerConfig;
use crate::dispatch::EventDispatcher;
use crate::error::{Error, Result};
use crate::events::{Event, EventPayload, Origin, SchedulerInfo, SimulationInfo, UserData};
use crate::registry::{DispatchReport, ErrorSink, TaskRegistry};
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use tracing::{debug, trace};

/// State shared by both managers.
struct ManagerCore {
    registry: RefCell<TaskRegistry>,
    clock: Rc<Clock>,
    dispatcher: Rc<EventDispatcher>,
    forward_errors: bool,
}

impl ManagerCore {
    fn new(
        handles: HandleAllocator,
        clock: Rc<Clock>,
        dispatcher: Rc<EventDispatcher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            registry: RefCell::new(TaskRegistry::with_config(handles, config)),
            clock,
            dispatcher,
            forward_errors: config.forward_manager_errors,
        }
    }

    fn register_task(&self, task: Rc<dyn Task>, priority: u32, user_data: Option<UserData>) -> Result<TaskHandle> {
        let pattern = Event::any().with_user_data(user_data);
        self.registry.borrow_mut().add_task(task, pattern, priority)
    }

    fn sink(&self) -> Option<&dyn ErrorSink> {
        if self.forward_errors {
            let sink: &dyn ErrorSink = &*self.dispatcher;
            Some(sink)
        } else {
            None
        }
    }

    fn run(&self, event: &mut Event) -> DispatchReport {
        let view = self.registry.borrow().create_view(event);
        view.execute_all(event, self.sink())
    }
}

pub struct SystemManager {
    core: ManagerCore,
}

impl SystemManager {
    pub fn new(
        handles: HandleAllocator,
        clock: Rc<Clock>,
        dispatcher: Rc<EventDispatcher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            core: ManagerCore::new(handles, clock, dispatcher, config),
        }
    }

    /// Registers `task` to run once per tick. `user_data` is handed back on
    /// every run.
    pub fn register_task(&self, task: Rc<dyn Task>, priority: u32, user_data: Option<UserData>) -> Result<TaskHandle> {
        self.core.register_task(task, priority, user_data)
    }

    pub fn unregister_task(&self, handle: TaskHandle) -> Result<()> {
        self.core.registry.borrow_mut().remove_task(handle)
    }

    pub fn registry(&self) -> Ref<'_, TaskRegistry> {
        self.core.registry.borrow()
    }

    pub fn clock(&self) -> &Rc<Clock> {
        &self.core.clock
    }

    pub fn sweep(&self) -> usize {
        self.core.registry.borrow_mut().sweep()
    }

    pub fn reset(&self) {
        self.core.registry.borrow_mut().reset();
    }

    /// Runs every job with the current frame number and system time.
    pub fn dispatch(&self) -> Result<DispatchReport> {
        let clock = &self.core.clock;
        let info = SchedulerInfo {
            frame: clock.current_frame()?,
            system_time: clock.system_time()?,
        };
        let mut event = Event::any()
            .with_origin(Origin::SystemManager)
            .with_time(info.system_time)
            .with_payload(EventPayload::Scheduler(info));
        Ok(self.core.run(&mut event))
    }
}

impl Task for SystemManager {
    fn execute(&self, event: &mut Event) -> Result<()> {
        if event.scheduler_info().is_some() {
            self.dispatch()?;
        }
        Ok(())
    }
}

pub struct SimulationManager {
    core: ManagerCore,
}

impl SimulationManager {
    pub fn new(
        handles: HandleAllocator,
        clock: Rc<Clock>,
        dispatcher: Rc<EventDispatcher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            core: ManagerCore::new(handles, clock, dispatcher, config),
        }
    }

    /// Registers `task` to receive `Query` and `Advance` steps while the
    /// simulation runs.
    pub fn register_task(&self, task: Rc<dyn Task>, priority: u32, user_data: Option<UserData>) -> Result<TaskHandle> {
        self.core.register_task(task, priority, user_data)
    }

    pub fn unregister_task(&self, handle: TaskHandle) -> Result<()> {
        self.core.registry.borrow_mut().remove_task(handle)
    }

    pub fn registry(&self) -> Ref<'_, TaskRegistry> {
        self.core.registry.borrow()
    }

    pub fn clock(&self) -> &Rc<Clock> {
        &self.core.clock
    }

    pub fn sweep(&self) -> usize {
        self.core.registry.borrow_mut().sweep()
    }

    pub fn reset(&self) {
        self.core.registry.borrow_mut().reset();
    }

    pub fn simulation_frame(&self) -> Result<u32> {
        self.core.clock.current_frame()
    }

    pub fn simulation_time(&self) -> Result<u32> {
        self.core.clock.simulation_time()
    }

    pub fn simulation_time_delta(&self) -> Result<u32> {
        self.core.clock.simulation_time_delta()
    }

    /// Current system time, re-read from the time source.
    pub fn system_time(&self) -> Result<u32> {
        self.core.clock.update()?;
        self.core.clock.system_time()
    }

    /// `(running, auto_toggle)`.
    pub fn simulation_state(&self) -> Result<(bool, bool)> {
        Ok((self.core.clock.is_running()?, self.core.clock.is_auto()))
    }

    pub fn set_simulation_state(&self, running: bool, auto_toggle: bool) -> Result<()> {
        self.core.clock.set_running(running)?;
        self.core.clock.set_auto(auto_toggle);
        Ok(())
    }

    /// Steps simulation time through the current frame.
    ///
    /// Each step asks every job how far it may go (`Query`), advances all
    /// of them to the earliest answer (`Advance`), then moves the clock
    /// there. Steps always make progress by at least one millisecond.
    pub fn dispatch(&self) -> Result<DispatchReport> {
        let clock = &self.core.clock;
        let mut report = DispatchReport::default();
        if !clock.is_running()? {
            return Ok(report);
        }

        let end = clock.frame_end()?;
        loop {
            let curr = clock.simulation_time()?.max(clock.frame_start()?);
            if curr >= end {
                break;
            }

            let mut query = self.step(SimulationInfo::query(curr, end));
            let view = self.core.registry.borrow().create_view(&query);
            report.merge(view.execute_all(&mut query, self.core.sink()));

            let limit = query.simulation().map_or(end, |step| step.max_time);
            let next = limit.clamp(curr + 1, end);
            trace!("Simulation step [{}, {}] ms", curr, next);

            let mut advance = self.step(SimulationInfo::advance(curr, next));
            report.merge(view.execute_all(&mut advance, self.core.sink()));
            drop(view);

            match clock.advance_to(next) {
                Ok(()) => {}
                Err(Error::Aborted) => {
                    debug!("Simulation paused mid-frame at {} ms", curr);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        if clock.is_running()? && clock.simulation_time()? < end {
            clock.advance_to_end()?;
        }
        Ok(report)
    }

    fn step(&self, info: SimulationInfo) -> Event {
        Event::any()
            .with_origin(Origin::SimulationManager)
            .with_time(info.start)
            .with_payload(EventPayload::Simulation(info))
    }
}

impl Task for SimulationManager {
    fn execute(&self, event: &mut Event) -> Result<()> {
        if event.scheduler_info().is_some() {
            self.dispatch()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::common::{NotificationId, NotificationType};
    use crate::components::task::task_fn;
    use crate::components::timer::{TimeDomain, TimerManager};
    use crate::events::SimulationMsg;

    struct Fixture {
        source: ManualTimeSource,
        clock: Rc<Clock>,
        dispatcher: Rc<EventDispatcher>,
        system: SystemManager,
        simulation: SimulationManager,
    }

    fn fixture() -> Fixture {
        let config = SchedulerConfig::default();
        let handles = HandleAllocator::new();
        let source = ManualTimeSource::new();
        let clock = Rc::new(Clock::new(Rc::new(source.clone())));
        clock.initialize().unwrap();
        let dispatcher = Rc::new(EventDispatcher::new(handles.clone(), &config));
        let system = SystemManager::new(handles.clone(), clock.clone(), dispatcher.clone(), &config);
        let simulation = SimulationManager::new(handles, clock.clone(), dispatcher.clone(), &config);
        Fixture {
            source,
            clock,
            dispatcher,
            system,
            simulation,
        }
    }

    fn tick(f: &Fixture, ms: u32) {
        f.source.advance(ms);
        f.clock.increment_frame().unwrap();
        f.system.dispatch().unwrap();
        f.simulation.dispatch().unwrap();
    }

    #[test]
    fn system_jobs_run_while_paused() {
        let f = fixture();
        let frames = Rc::new(RefCell::new(Vec::new()));
        let log = frames.clone();
        f.system
            .register_task(
                task_fn(move |event| {
                    let info = event.scheduler_info().copied().ok_or(Error::NotFound("scheduler info"))?;
                    log.borrow_mut().push(info.system_time);
                    Ok(())
                }),
                0,
                None,
            )
            .unwrap();

        tick(&f, 10);
        f.simulation.set_simulation_state(false, false).unwrap();
        tick(&f, 10);

        assert_eq!(*frames.borrow(), vec![10, 20]);
        assert_eq!(f.simulation.simulation_time().unwrap(), 10);
    }

    #[test]
    fn simulation_jobs_receive_user_data_and_stop_when_paused() {
        let f = fixture();
        let steps = Rc::new(RefCell::new(Vec::new()));
        let log = steps.clone();
        f.simulation
            .register_task(
                task_fn(move |event| {
                    let tag = *event.user_data_as::<&str>().ok_or(Error::NotFound("tag"))?;
                    if let Some(step) = event.simulation().filter(|s| s.msg == SimulationMsg::Advance) {
                        log.borrow_mut().push((tag, step.start, step.end));
                    }
                    Ok(())
                }),
                0,
                Some(Rc::new("physics")),
            )
            .unwrap();

        tick(&f, 16);
        f.simulation.set_simulation_state(false, false).unwrap();
        tick(&f, 16);

        assert_eq!(*steps.borrow(), vec![("physics", 0, 16)]);
    }

    #[test]
    fn frames_are_split_at_simulation_timer_boundaries() {
        let f = fixture();
        let timers = Rc::new(TimerManager::new(f.dispatcher.clone(), 4));
        f.simulation.register_task(timers.clone(), 0, None).unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let fired_log = fired.clone();
        let clock = f.clock.clone();
        f.dispatcher
            .register_task(
                task_fn(move |event| {
                    fired_log.borrow_mut().push((event.time, clock.simulation_time()?));
                    Ok(())
                }),
                Some(NotificationType::TIME),
                Some(NotificationId(0x500)),
            )
            .unwrap();
        timers
            .set_timer_in(TimeDomain::Simulation, NotificationId(0x500), 0, 40, 0)
            .unwrap();

        let steps = Rc::new(RefCell::new(Vec::new()));
        let log = steps.clone();
        f.simulation
            .register_task(
                task_fn(move |event| {
                    if let Some(step) = event.simulation().filter(|s| s.msg == SimulationMsg::Advance) {
                        log.borrow_mut().push((step.start, step.end));
                    }
                    Ok(())
                }),
                0,
                None,
            )
            .unwrap();

        tick(&f, 100);

        assert_eq!(*steps.borrow(), vec![(0, 40), (40, 80), (80, 100)]);
        assert_eq!(*fired.borrow(), vec![(40, 0), (80, 40)]);
        assert_eq!(f.simulation.simulation_time().unwrap(), 100);
    }

    #[test]
    fn manager_failures_reach_error_listeners() {
        let f = fixture();
        let failing = f
            .system
            .register_task(task_fn(|_| Err(Error::task(0x31, "render failed"))), 0, None)
            .unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        f.dispatcher
            .register_task(
                task_fn(move |event| {
                    if let Some(info) = event.error_info() {
                        log.borrow_mut().push(info.handle);
                    }
                    Ok(())
                }),
                Some(NotificationType::ERROR),
                None,
            )
            .unwrap();

        tick(&f, 5);
        assert_eq!(*seen.borrow(), vec![failing]);
    }

    #[test]
    fn system_time_rereads_the_source() {
        let f = fixture();
        f.source.advance(250);
        assert_eq!(f.simulation.system_time().unwrap(), 250);
        assert_eq!(f.simulation.simulation_state().unwrap(), (true, false));
    }
}
