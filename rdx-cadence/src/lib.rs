//! # Cadence
//!
//! A cooperative task-scheduling and event-notification engine.
//!
//! Cadence lets independent subsystems (rendering, simulation, I/O) register
//! jobs against either the per-frame tick or an application-defined
//! notification, and invokes them in a controlled, priority-ordered,
//! re-entrancy-safe way. Everything runs on one thread.
//!
//! ## Core Concepts
//!
//! - **Clock**: keeps wall-derived *system time* and pausable *simulation
//!   time*, advanced one frame per tick.
//! - **Jobs and registries**: a job binds a `Task` to an `Event` pattern and
//!   a priority. Handles are unique across every registry of one scheduler.
//! - **Views**: the ordered snapshot of jobs matching one event, recycled
//!   through a pool.
//! - **Dispatcher**: delivers notifications and turns job failures into
//!   `ERROR` notifications.
//! - **Timers**: one-shot and periodic `TIME` notifications, in system or
//!   simulation time.
//! - **Managers**: per-frame jobs for the system domain (always) and the
//!   simulation domain (only while running).
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use cadence::prelude::*;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     // 1. Create and initialize the scheduler.
//!     let scheduler = Scheduler::new(SchedulerConfig::default());
//!     scheduler.initialize()?;
//!
//!     // 2. Register a job that runs every simulated frame.
//!     scheduler.simulation_manager()?.register_task(
//!         task_fn(|event| {
//!             if let Some(step) = event.simulation() {
//!                 println!("simulating [{}, {}] ms", step.start, step.end);
//!             }
//!             Ok(())
//!         }),
//!         0,
//!         None,
//!     )?;
//!
//!     // 3. Tick it in real time. Stops on Ctrl+C.
//!     Driver::from_config(scheduler).run().await?;
//!     Ok(())
//! }
//! ```

pub const ENGINE_NAME: &str = "Cadence";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod clock;
pub mod common;
pub mod components;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod registry;

/// A prelude module for easy importing of the most common Cadence types.
pub mod prelude {
    pub use crate::clock::{Clock, ManualTimeSource, MonotonicTimeSource, TimeSource};
    pub use crate::common::{NotificationId, NotificationType, ObjectId, TaskHandle, TimerId};
    pub use crate::components::task::{task_fn, FnTask, Task};
    pub use crate::components::timer::TimeDomain;
    pub use crate::config::{ClockResolution, SchedulerConfig};
    pub use crate::dispatch::Registration;
    pub use crate::driver::Driver;
    pub use crate::engine::{Scheduler, TickReport};
    pub use crate::error::{Error, Result};
    pub use crate::events::{Event, EventPayload, Origin, SimulationMsg};
}
