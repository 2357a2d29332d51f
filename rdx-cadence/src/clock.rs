//! The dual-time clock: wall-derived system time and pausable simulation time.
//!
//! System time keeps moving while the simulation is paused. Simulation time
//! only moves through `advance_to`, and only inside the window
//! `[frame_start, frame_end]` opened by the latest `increment_frame`.
//! Paused intervals are folded into `simulation_offset` on resume, so the
//! simulation picks up where it stopped instead of jumping ahead.
//!
//! All times are milliseconds in a `u32`.

use crate::common::ObserverId;
use crate::error::{Error, Result};
use slotmap::SlotMap;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;
use tracing::{debug, trace};

/// Where the clock reads the current time from.
pub trait TimeSource {
    /// Milliseconds since an arbitrary, fixed origin.
    fn now_ms(&self) -> u32;
}

/// Real elapsed time, from `std::time::Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTimeSource {
    origin: Instant,
}

impl MonotonicTimeSource {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTimeSource {
    fn now_ms(&self) -> u32 {
        // Wraps after ~49 days, like the millisecond counters it stands in for.
        self.origin.elapsed().as_millis() as u32
    }
}

/// A time source moved by hand. Clones share the same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Rc<Cell<u32>>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ms: u32) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: u32) {
        self.now.set(self.now.get().wrapping_add(ms));
    }

    pub fn now(&self) -> u32 {
        self.now.get()
    }
}

impl TimeSource for ManualTimeSource {
    fn now_ms(&self) -> u32 {
        self.now.get()
    }
}

/// What changed, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockChange {
    TimeAdvanced { from: u32, to: u32 },
    FrameAdvanced { frame: u32 },
    Paused { at: u32 },
    Resumed { at: u32 },
    /// Someone asked observers to get ready for a pause; no state changed.
    PauseRequested,
    Reset,
}

pub trait ClockObserver {
    fn clock_changed(&self, clock: &Clock, change: ClockChange);
}

#[derive(Debug, Clone, Copy, Default)]
struct ClockState {
    initialized: bool,
    /// Last raw reading of the source.
    reading: u32,
    system_time: u32,
    simulation_time: u32,
    frame_start: u32,
    frame_end: u32,
    current_frame: u32,
    running: bool,
    auto_toggle: bool,
    simulation_offset: u32,
    pause_time: u32,
}

pub struct Clock {
    source: Rc<dyn TimeSource>,
    state: Cell<ClockState>,
    observers: RefCell<SlotMap<ObserverId, Rc<dyn ClockObserver>>>,
}

impl Clock {
    /// Creates a running, uninitialized clock.
    pub fn new(source: Rc<dyn TimeSource>) -> Self {
        Self {
            source,
            state: Cell::new(ClockState {
                running: true,
                ..ClockState::default()
            }),
            observers: RefCell::new(SlotMap::with_key()),
        }
    }

    pub fn initialize(&self) -> Result<()> {
        let s = self.state.get();
        if s.initialized {
            return Err(Error::AlreadyInitialized);
        }
        self.state.set(ClockState {
            initialized: true,
            reading: self.source.now_ms(),
            running: s.running,
            auto_toggle: s.auto_toggle,
            ..ClockState::default()
        });
        debug!("Clock initialized (running: {})", s.running);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get().initialized
    }

    /// Zeroes every time and frame counter and re-bases on the source.
    /// The running and auto-toggle flags survive.
    pub fn reset(&self) -> Result<()> {
        let s = self.checked()?;
        self.state.set(ClockState {
            initialized: true,
            reading: self.source.now_ms(),
            running: s.running,
            auto_toggle: s.auto_toggle,
            ..ClockState::default()
        });
        debug!("Clock reset");
        self.notify(ClockChange::Reset);
        Ok(())
    }

    /// Re-reads system time from the source.
    ///
    /// Only the elapsed reading is added, so a source that wraps keeps system
    /// time moving forward. System time saturates at `u32::MAX`.
    pub fn update(&self) -> Result<()> {
        let mut s = self.checked()?;
        let now = self.source.now_ms();
        s.system_time = s.system_time.saturating_add(now.wrapping_sub(s.reading));
        s.reading = now;
        self.state.set(s);
        Ok(())
    }

    /// Opens the next frame.
    ///
    /// A pending auto toggle is applied first. While running, the new frame
    /// spans from the previous frame's end to the current simulation-domain
    /// reading of system time.
    pub fn increment_frame(&self) -> Result<()> {
        let s = self.checked()?;
        if s.auto_toggle {
            self.set_running(!s.running)?;
        }
        self.update()?;

        let mut s = self.state.get();
        if !s.running {
            return Ok(());
        }
        s.frame_start = s.frame_end;
        s.frame_end = s
            .system_time
            .saturating_sub(s.simulation_offset)
            .max(s.frame_start);
        s.current_frame = s.current_frame.wrapping_add(1);
        self.state.set(s);

        trace!(
            "Frame {}: [{}, {}] ms",
            s.current_frame,
            s.frame_start,
            s.frame_end
        );
        self.notify(ClockChange::FrameAdvanced {
            frame: s.current_frame,
        });
        Ok(())
    }

    /// Moves simulation time to `time` within the current frame.
    pub fn advance_to(&self, time: u32) -> Result<()> {
        let mut s = self.checked()?;
        if !s.running {
            return Err(Error::Aborted);
        }
        if time < s.frame_start.max(s.simulation_time) || time > s.frame_end {
            return Err(Error::InvalidRange("simulation time"));
        }
        let from = s.simulation_time;
        s.simulation_time = time;
        self.state.set(s);
        if from != time {
            self.notify(ClockChange::TimeAdvanced { from, to: time });
        }
        Ok(())
    }

    pub fn advance_to_end(&self) -> Result<()> {
        let s = self.checked()?;
        self.advance_to(s.frame_end)
    }

    /// Pushes system time forward by `offset` ms. Simulation time catches
    /// up at the next frame.
    pub fn jump_forward(&self, offset: u32) -> Result<()> {
        let mut s = self.checked()?;
        s.system_time = s.system_time.saturating_add(offset);
        self.state.set(s);
        Ok(())
    }

    /// Pauses or resumes simulation time. Cancels any pending auto toggle.
    pub fn set_running(&self, running: bool) -> Result<()> {
        self.update()?;
        let mut s = self.state.get();
        s.auto_toggle = false;
        if s.running == running {
            self.state.set(s);
            return Ok(());
        }

        let change = if running {
            s.simulation_offset = s
                .simulation_offset
                .saturating_add(s.system_time.saturating_sub(s.pause_time));
            ClockChange::Resumed { at: s.system_time }
        } else {
            s.pause_time = s.system_time;
            ClockChange::Paused { at: s.system_time }
        };
        s.running = running;
        self.state.set(s);

        debug!("Clock {:?}", change);
        self.notify(change);
        Ok(())
    }

    /// Arms (or disarms) a flip of the running state at the next frame.
    pub fn set_auto(&self, auto_toggle: bool) {
        let mut s = self.state.get();
        s.auto_toggle = auto_toggle;
        self.state.set(s);
    }

    pub fn notify_pause(&self) -> Result<()> {
        self.checked()?;
        self.notify(ClockChange::PauseRequested);
        Ok(())
    }

    pub fn system_time(&self) -> Result<u32> {
        Ok(self.checked()?.system_time)
    }

    pub fn simulation_time(&self) -> Result<u32> {
        Ok(self.checked()?.simulation_time)
    }

    /// Simulation time elapsed since the start of the current frame.
    pub fn simulation_time_delta(&self) -> Result<u32> {
        let s = self.checked()?;
        Ok(s.simulation_time.saturating_sub(s.frame_start))
    }

    pub fn current_frame(&self) -> Result<u32> {
        Ok(self.checked()?.current_frame)
    }

    pub fn frame_start(&self) -> Result<u32> {
        Ok(self.checked()?.frame_start)
    }

    pub fn frame_end(&self) -> Result<u32> {
        Ok(self.checked()?.frame_end)
    }

    pub fn is_running(&self) -> Result<bool> {
        Ok(self.checked()?.running)
    }

    pub fn is_auto(&self) -> bool {
        self.state.get().auto_toggle
    }

    pub fn subscribe(&self, observer: Rc<dyn ClockObserver>) -> ObserverId {
        self.observers.borrow_mut().insert(observer)
    }

    pub fn unsubscribe(&self, id: ObserverId) -> Result<()> {
        self.observers
            .borrow_mut()
            .remove(id)
            .map(|_| ())
            .ok_or(Error::NotFound("clock observer"))
    }

    fn checked(&self) -> Result<ClockState> {
        let s = self.state.get();
        if !s.initialized {
            return Err(Error::NotInitialized);
        }
        Ok(s)
    }

    fn notify(&self, change: ClockChange) {
        let observers: Vec<_> = self.observers.borrow().values().cloned().collect();
        for observer in observers {
            observer.clock_changed(self, change);
        }
    }
}
