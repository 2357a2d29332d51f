//! The root object that owns and drives every scheduling subsystem.

use crate::clock::{Clock, MonotonicTimeSource, TimeSource};
use crate::common::{HandleAllocator, NotificationId, NotificationType};
use crate::components::manager::{SimulationManager, SystemManager};
use crate::components::timer::{TimeDomain, TimerManager};
use crate::config::SchedulerConfig;
use crate::dispatch::EventDispatcher;
use crate::error::{Error, Result};
use crate::events::{Event, EventPayload, Origin, SchedulerInfo};
use crate::registry::{DispatchReport, TaskRegistry};
use std::cell::{OnceCell, RefCell};
use std::rc::Rc;
use tracing::{debug, error, info};

/// What one call to `Scheduler::service` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub frame: u32,
    pub system_time: u32,
    pub simulation_time: u32,
    /// Jobs reaped before the tick.
    pub swept: usize,
    /// Outcome of running the root registry (the two managers).
    pub root: DispatchReport,
    pub timers_fired: usize,
}

struct Subsystems {
    clock: Rc<Clock>,
    dispatcher: Rc<EventDispatcher>,
    timers: Rc<TimerManager>,
    system: Rc<SystemManager>,
    simulation: Rc<SimulationManager>,
    root: RefCell<TaskRegistry>,
}

/// The scheduler root.
///
/// Owns the handle counter shared by every registry below it, the clock, and
/// the subsystems. The root registry holds the system manager (priority 2)
/// and the simulation manager (priority 1), so each tick runs system jobs
/// first. The `Scheduler` is cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Scheduler {
    config: Rc<SchedulerConfig>,
    handles: HandleAllocator,
    source: Rc<dyn TimeSource>,
    core: Rc<OnceCell<Subsystems>>,
}

impl Scheduler {
    /// Creates a scheduler reading real elapsed time.
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_time_source(config, Rc::new(MonotonicTimeSource::new()))
    }

    pub fn with_time_source(config: SchedulerConfig, source: Rc<dyn TimeSource>) -> Self {
        Self {
            config: Rc::new(config),
            handles: HandleAllocator::new(),
            source,
            core: Rc::new(OnceCell::new()),
        }
    }

    /// Builds the clock and every subsystem.
    pub fn initialize(&self) -> Result<()> {
        if self.core.get().is_some() {
            return Err(Error::AlreadyInitialized);
        }
        let config = self.config.as_ref();

        let clock = Rc::new(Clock::new(self.source.clone()));
        clock.initialize()?;
        if config.simulation.autostart {
            clock.set_running(false)?;
            clock.set_auto(true);
        }

        let dispatcher = Rc::new(EventDispatcher::new(self.handles.clone(), config));
        let timers = Rc::new(TimerManager::new(dispatcher.clone(), config.max_free_timers));
        let system = Rc::new(SystemManager::new(
            self.handles.clone(),
            clock.clone(),
            dispatcher.clone(),
            config,
        ));
        let simulation = Rc::new(SimulationManager::new(
            self.handles.clone(),
            clock.clone(),
            dispatcher.clone(),
            config,
        ));
        simulation.register_task(timers.clone(), 0, None)?;

        let mut root = TaskRegistry::with_config(self.handles.clone(), config);
        root.add_task(system.clone(), Event::any(), 2)?;
        root.add_task(simulation.clone(), Event::any(), 1)?;

        self.core
            .set(Subsystems {
                clock,
                dispatcher,
                timers,
                system,
                simulation,
                root: RefCell::new(root),
            })
            .map_err(|_| Error::AlreadyInitialized)?;

        info!(
            "Scheduler initialized (resolution: {:?}, autostart: {})",
            config.resolution, config.simulation.autostart
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.core.get().is_some()
    }

    /// Performs one tick: reap removed jobs, open the next frame, run the
    /// system and simulation managers, then fire due system-domain timers.
    pub fn service(&self) -> Result<TickReport> {
        let core = self.core()?;

        let swept = core.root.borrow_mut().sweep()
            + core.dispatcher.sweep()
            + core.system.sweep()
            + core.simulation.sweep();

        core.clock.increment_frame()?;
        let info = SchedulerInfo {
            frame: core.clock.current_frame()?,
            system_time: core.clock.system_time()?,
        };
        let mut event = Event::any()
            .with_origin(Origin::Scheduler)
            .with_time(info.system_time)
            .with_payload(EventPayload::Scheduler(info));

        let view = core.root.borrow().create_view(&event);
        let root = view.execute_all(&mut event, None);
        drop(view);
        if root.failed > 0 {
            error!("Frame {}: {} manager(s) failed to dispatch", info.frame, root.failed);
        }

        let timers_fired = core
            .timers
            .advance(TimeDomain::System, core.clock.system_time()?)?;

        Ok(TickReport {
            frame: info.frame,
            system_time: info.system_time,
            simulation_time: core.clock.simulation_time()?,
            swept,
            root,
            timers_fired,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn handles(&self) -> &HandleAllocator {
        &self.handles
    }

    pub fn clock(&self) -> Result<Rc<Clock>> {
        Ok(self.core()?.clock.clone())
    }

    pub fn dispatcher(&self) -> Result<Rc<EventDispatcher>> {
        Ok(self.core()?.dispatcher.clone())
    }

    pub fn timers(&self) -> Result<Rc<TimerManager>> {
        Ok(self.core()?.timers.clone())
    }

    pub fn system_manager(&self) -> Result<Rc<SystemManager>> {
        Ok(self.core()?.system.clone())
    }

    pub fn simulation_manager(&self) -> Result<Rc<SimulationManager>> {
        Ok(self.core()?.simulation.clone())
    }

    pub fn advance_to(&self, time: u32) -> Result<()> {
        self.core()?.clock.advance_to(time)
    }

    pub fn simulation_frame(&self) -> Result<u32> {
        self.core()?.simulation.simulation_frame()
    }

    pub fn simulation_time(&self) -> Result<u32> {
        self.core()?.simulation.simulation_time()
    }

    pub fn simulation_time_delta(&self) -> Result<u32> {
        self.core()?.simulation.simulation_time_delta()
    }

    pub fn system_time(&self) -> Result<u32> {
        self.core()?.simulation.system_time()
    }

    pub fn simulation_state(&self) -> Result<(bool, bool)> {
        self.core()?.simulation.simulation_state()
    }

    pub fn set_simulation_state(&self, running: bool, auto_toggle: bool) -> Result<()> {
        self.core()?.simulation.set_simulation_state(running, auto_toggle)
    }

    pub fn notify_pause(&self) -> Result<()> {
        self.core()?.clock.notify_pause()
    }

    /// Restarts the simulation from zero: drops every timer, resets the
    /// clock and broadcasts `(TASK, TASK_RESET)`.
    pub fn reset_simulation(&self) -> Result<()> {
        let core = self.core()?;
        core.timers.reset();
        core.clock.reset()?;
        core.dispatcher.submit(
            NotificationType::TASK,
            NotificationId::TASK_RESET,
            0,
            None,
        )?;
        info!("Simulation reset");
        Ok(())
    }

    /// Resets the clock only.
    pub fn reset_simulation_time(&self) -> Result<()> {
        self.core()?.clock.reset()
    }

    /// Drops every job and timer registered since initialization.
    /// Issued handles stay retired.
    pub fn reset(&self) -> Result<()> {
        let core = self.core()?;
        core.timers.reset();
        core.dispatcher.reset();
        core.system.reset();
        core.simulation.reset();
        core.simulation.register_task(core.timers.clone(), 0, None)?;
        debug!("Scheduler registries cleared");
        Ok(())
    }

    fn core(&self) -> Result<&Subsystems> {
        self.core.get().ok_or(Error::NotInitialized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeSource;
    use crate::components::task::task_fn;

    fn manual(autostart: bool) -> (ManualTimeSource, Scheduler) {
        let mut config = SchedulerConfig::default();
        config.simulation.autostart = autostart;
        let source = ManualTimeSource::new();
        let scheduler = Scheduler::with_time_source(config, Rc::new(source.clone()));
        scheduler.initialize().unwrap();
        (source, scheduler)
    }

    #[test]
    fn subsystems_require_initialization() {
        let scheduler = Scheduler::with_time_source(
            SchedulerConfig::default(),
            Rc::new(ManualTimeSource::new()),
        );
        assert!(matches!(scheduler.clock(), Err(Error::NotInitialized)));
        assert!(matches!(scheduler.service(), Err(Error::NotInitialized)));

        scheduler.initialize().unwrap();
        assert!(matches!(scheduler.initialize(), Err(Error::AlreadyInitialized)));
        assert!(scheduler.clone().dispatcher().is_ok());
    }

    #[test]
    fn autostart_begins_simulating_on_the_first_tick() {
        let (source, scheduler) = manual(true);
        assert_eq!(scheduler.simulation_state().unwrap(), (false, true));

        source.advance(30);
        scheduler.service().unwrap();
        assert_eq!(scheduler.simulation_state().unwrap(), (true, false));
        assert_eq!(scheduler.simulation_time().unwrap(), 0);

        source.advance(16);
        let tick = scheduler.service().unwrap();
        assert_eq!(tick.simulation_time, 16);
        assert_eq!(tick.frame, 2);
    }

    #[test]
    fn system_jobs_run_before_simulation_jobs() {
        let (source, scheduler) = manual(false);
        let order = Rc::new(RefCell::new(Vec::new()));
        let system_log = order.clone();
        let simulation_log = order.clone();
        scheduler
            .system_manager()
            .unwrap()
            .register_task(
                task_fn(move |_| {
                    system_log.borrow_mut().push("system");
                    Ok(())
                }),
                0,
                None,
            )
            .unwrap();
        scheduler
            .simulation_manager()
            .unwrap()
            .register_task(
                task_fn(move |event| {
                    if event.simulation().is_some() {
                        simulation_log.borrow_mut().push("simulation");
                    }
                    Ok(())
                }),
                0,
                None,
            )
            .unwrap();

        source.advance(10);
        scheduler.service().unwrap();

        // One query and one advance.
        assert_eq!(*order.borrow(), vec!["system", "simulation", "simulation"]);
    }

    #[test]
    fn reset_simulation_broadcasts_task_reset() {
        let (source, scheduler) = manual(false);
        let resets = Rc::new(RefCell::new(0));
        let counter = resets.clone();
        scheduler
            .dispatcher()
            .unwrap()
            .register_task(
                task_fn(move |_| {
                    *counter.borrow_mut() += 1;
                    Ok(())
                }),
                Some(NotificationType::TASK),
                Some(NotificationId::TASK_RESET),
            )
            .unwrap();
        scheduler
            .timers()
            .unwrap()
            .set_timer(NotificationId(0x300), 0, 10, 0)
            .unwrap();

        source.advance(50);
        scheduler.service().unwrap();
        scheduler.reset_simulation().unwrap();

        assert_eq!(*resets.borrow(), 1);
        assert_eq!(scheduler.simulation_time().unwrap(), 0);
        assert_eq!(scheduler.timers().unwrap().pending(), 0);
    }

    #[test]
    fn reset_keeps_simulation_timers_working() {
        let (source, scheduler) = manual(false);
        let dispatcher = scheduler.dispatcher().unwrap();
        dispatcher
            .register_task(task_fn(|_| Ok(())), None, None)
            .unwrap();
        scheduler.reset().unwrap();
        assert!(dispatcher.is_empty());

        let fired = Rc::new(RefCell::new(Vec::new()));
        let log = fired.clone();
        dispatcher
            .register_task(
                task_fn(move |event| {
                    log.borrow_mut().push(event.time);
                    Ok(())
                }),
                Some(NotificationType::TIME),
                Some(NotificationId(0x400)),
            )
            .unwrap();
        scheduler
            .timers()
            .unwrap()
            .set_timer_in(TimeDomain::Simulation, NotificationId(0x400), 0, 25, 0)
            .unwrap();

        source.advance(60);
        scheduler.service().unwrap();
        assert_eq!(*fired.borrow(), vec![25, 50]);
    }
}
