use anyhow::Result;
use cadence::prelude::*;
use std::cell::Cell;
use std::rc::Rc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // 1. Initialize structured logging. RUST_LOG overrides the default level.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // 2. Load the configuration. An optional path may be passed as the first argument.
    let config = match std::env::args().nth(1) {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig {
            resolution: ClockResolution::Low,
            ..SchedulerConfig::default()
        },
    };

    // 3. Create and initialize the scheduler.
    let scheduler = Scheduler::new(config);
    scheduler.initialize()?;
    info!("{} v{} starting up.", cadence::ENGINE_NAME, cadence::VERSION);

    // 4. Register a handful of demo jobs.
    register_demo_tasks(&scheduler)?;

    // 5. Run until Ctrl+C.
    let ticks = Driver::from_config(scheduler).run().await?;
    info!("Serviced {} ticks.", ticks);
    Ok(())
}

fn register_demo_tasks(scheduler: &Scheduler) -> Result<()> {
    let dispatcher = scheduler.dispatcher()?;
    let timers = scheduler.timers()?;

    // A system job, run every tick even while the simulation is paused.
    scheduler.system_manager()?.register_task(
        task_fn(|event| {
            if let Some(info) = event.scheduler_info() {
                info!("[SYSTEM] frame {} at {} ms", info.frame, info.system_time);
            }
            Ok(())
        }),
        0,
        None,
    )?;

    // A simulation job that reports every step it is advanced through.
    scheduler.simulation_manager()?.register_task(
        task_fn(|event| {
            if let Some(step) = event.simulation().filter(|s| s.msg == SimulationMsg::Advance) {
                info!("[SIMULATION] advanced [{}, {}] ms", step.start, step.end);
            }
            Ok(())
        }),
        0,
        None,
    )?;

    // A job run by its own timer every 3 seconds of simulation time, for 12 seconds.
    timers.register_task_in(
        TimeDomain::Simulation,
        task_fn(|event| {
            info!("[TIMER] simulation timer fired at {} ms", event.time);
            Ok(())
        }),
        0,
        3_000,
        12_000,
    )?;

    // A notification job that fails every other time it runs.
    let kind = dispatcher.next_type()?;
    let attempts = Rc::new(Cell::new(0_u32));
    dispatcher.register_task(
        task_fn(move |_| {
            attempts.set(attempts.get() + 1);
            if attempts.get() % 2 == 0 {
                return Err(Error::task(0xD0, "flaky collaborator"));
            }
            info!("[NOTIFY] attempt {} succeeded", attempts.get());
            Ok(())
        }),
        Some(kind),
        None,
    )?;

    // Raise that notification from a system-domain timer.
    let raise = dispatcher.clone();
    timers.register_task(
        task_fn(move |event| {
            raise.submit(kind, NotificationId(1), event.time, None)?;
            Ok(())
        }),
        2_000,
        2_000,
        0,
    )?;

    // Report every failure that reaches the error channel.
    dispatcher.register_task(
        task_fn(|event| {
            if let Some(failure) = event.error_info() {
                warn!(
                    "[ERROR] job {} failed at {} ms: {}",
                    failure.handle, failure.time, failure.error
                );
            }
            Ok(())
        }),
        Some(NotificationType::ERROR),
        None,
    )?;

    Ok(())
}
