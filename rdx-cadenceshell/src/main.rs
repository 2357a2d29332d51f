use anyhow::Result;
use cadence::prelude::*;
use cadence::{ENGINE_NAME, VERSION as LIB_VERSION};
use colored::Colorize;
use rustyline::highlight::Highlighter;
use rustyline::Editor;
use rustyline_derive::{Completer, Helper, Hinter, Validator};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::env;
use std::rc::Rc;
use tracing::info;

const SHELL_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_STEP_MS: u32 = 16;

/// A custom helper struct for rustyline that enables syntax highlighting.
#[derive(Completer, Helper, Hinter, Validator)]
struct ShellHighlighter;

impl Highlighter for ShellHighlighter {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if let Some((command, rest)) = line.split_once(' ') {
            Cow::Owned(format!("{} {}", command.yellow().bold(), rest.yellow()))
        } else {
            Cow::Owned(line.yellow().bold().to_string())
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

fn print_banner() {
    if env::var("QUIET_MODE").is_ok() {
        return;
    }
    println!("{}", "-------------------------------------------------------------".dimmed());
    println!(
        "          {}   Shell v{:<8} Library v{:<8}",
        ENGINE_NAME.cyan().bold(),
        SHELL_VERSION,
        LIB_VERSION
    );
    println!(
        "{}",
        "    Distributed under the MIT OR Apache-2.0 license. Use at your own risk.".dimmed()
    );
    println!("{}", "-------------------------------------------------------------".dimmed());
}

/// Where a job registered from the shell lives, so `off` can remove it.
#[derive(Debug, Clone, Copy)]
enum Owner {
    System,
    Simulation,
    Dispatcher,
    Timer,
}

#[derive(Debug)]
struct Registered {
    handle: TaskHandle,
    owner: Owner,
    label: String,
}

struct Shell {
    scheduler: Scheduler,
    source: ManualTimeSource,
    active: BTreeMap<usize, Registered>,
    next_id: usize,
}

impl Shell {
    fn new(config: SchedulerConfig) -> Result<Self> {
        let source = ManualTimeSource::new();
        let scheduler = Scheduler::with_time_source(config, Rc::new(source.clone()));
        scheduler.initialize()?;
        Ok(Self {
            scheduler,
            source,
            active: BTreeMap::new(),
            next_id: 0,
        })
    }

    fn track(&mut self, handle: TaskHandle, owner: Owner, label: String) {
        let id = self.next_id;
        self.next_id += 1;
        println!("--> Registered {} as #{} ({})", label, id, handle);
        self.active.insert(id, Registered { handle, owner, label });
    }

    fn execute(&mut self, args: &[&str]) -> Result<()> {
        match args {
            ["tick", rest @ ..] => {
                let count = parse_or(rest.first(), 1_u32)?;
                let step = parse_or(rest.get(1), DEFAULT_STEP_MS)?;
                for _ in 0..count {
                    self.source.advance(step);
                    let tick = self.scheduler.service()?;
                    println!(
                        "{}",
                        format!(
                            "<-- [TICK] frame {} system {} ms simulation {} ms ({} job(s), {} timer(s))",
                            tick.frame,
                            tick.system_time,
                            tick.simulation_time,
                            tick.root.executed,
                            tick.timers_fired
                        )
                        .dimmed()
                    );
                }
            }
            ["jump", ms] => {
                let ms: u32 = ms.parse()?;
                self.scheduler.clock()?.jump_forward(ms)?;
                println!("--> System time jumped forward {} ms.", ms);
            }
            ["pause"] => {
                self.scheduler.set_simulation_state(false, false)?;
                println!("--> Simulation paused.");
            }
            ["resume"] => {
                self.scheduler.set_simulation_state(true, false)?;
                println!("--> Simulation resumed.");
            }
            ["reset"] => {
                self.scheduler.reset_simulation()?;
                println!("--> Simulation reset.");
            }
            ["status"] => self.status()?,
            ["sys", rest @ ..] => {
                let priority = parse_or(rest.first(), 0_u32)?;
                let handle = self.scheduler.system_manager()?.register_task(
                    task_fn(|event| {
                        if let Some(info) = event.scheduler_info() {
                            println!("<-- [SYSTEM {}] frame {} at {} ms", event.handle, info.frame, info.system_time);
                        }
                        Ok(())
                    }),
                    priority,
                    None,
                )?;
                self.track(handle, Owner::System, format!("system job (priority {})", priority));
            }
            ["sim", rest @ ..] => {
                let priority = parse_or(rest.first(), 0_u32)?;
                let handle = self.scheduler.simulation_manager()?.register_task(
                    task_fn(|event| {
                        if let Some(step) = event.simulation().filter(|s| s.msg == SimulationMsg::Advance) {
                            println!("<-- [SIMULATION {}] [{}, {}] ms", event.handle, step.start, step.end);
                        }
                        Ok(())
                    }),
                    priority,
                    None,
                )?;
                self.track(handle, Owner::Simulation, format!("simulation job (priority {})", priority));
            }
            ["on", kind, rest @ ..] => {
                let kind = parse_type(kind)?;
                let id = rest.first().map(|s| parse_id(s)).transpose()?.flatten();
                let priority = parse_or(rest.get(1), 0_u32)?;
                let handle = self.scheduler.dispatcher()?.register_task_with(
                    task_fn(|event| {
                        match event.error_info() {
                            Some(failure) => println!(
                                "<-- [{} {}] job {} failed: {}",
                                "ERROR".red().bold(),
                                event.handle,
                                failure.handle,
                                failure.error
                            ),
                            None => println!(
                                "<-- [NOTIFY {}] {:?}/{:?} at {} ms",
                                event.handle, event.notification_type, event.notification_id, event.time
                            ),
                        }
                        Ok(())
                    }),
                    Registration::new(kind, id).priority(priority),
                )?;
                self.track(handle, Owner::Dispatcher, format!("listener {:?}/{:?}", kind, id));
            }
            ["fail", kind, code] => {
                let kind = parse_type(kind)?;
                let code: u32 = code.parse()?;
                let handle = self.scheduler.dispatcher()?.register_task(
                    task_fn(move |_| Err(Error::task(code, "requested from the shell"))),
                    kind,
                    None,
                )?;
                self.track(handle, Owner::Dispatcher, format!("failing listener {:?} (code {})", kind, code));
            }
            ["emit", kind, id] => {
                let kind = parse_type(kind)?.ok_or_else(|| anyhow::anyhow!("emit needs a concrete type"))?;
                let id = parse_id(id)?.ok_or_else(|| anyhow::anyhow!("emit needs a concrete id"))?;
                let time = self.scheduler.system_time()?;
                let report = self.scheduler.dispatcher()?.submit(kind, id, time, None)?;
                println!(
                    "--> Delivered to {} job(s): {} ran, {} aborted, {} failed.",
                    report.matched, report.executed, report.aborted, report.failed
                );
            }
            ["timer", start, period, duration, rest @ ..] => {
                let (start, period, duration): (u32, u32, u32) = (start.parse()?, period.parse()?, duration.parse()?);
                let domain = match rest.first() {
                    Some(&"sim") => TimeDomain::Simulation,
                    _ => TimeDomain::System,
                };
                let handle = self.scheduler.timers()?.register_task_in(
                    domain,
                    task_fn(move |event| {
                        let timer = event.user_data_as::<TimerId>().copied();
                        println!("<-- [TIMER {:?}] {:?} fired at {} ms", domain, timer, event.time);
                        Ok(())
                    }),
                    start,
                    period,
                    duration,
                )?;
                self.track(
                    handle,
                    Owner::Timer,
                    format!("{:?} timer ({}, every {} ms, for {} ms)", domain, start, period, duration),
                );
            }
            ["kill", raw] => {
                let raw: u32 = raw.parse()?;
                let timers = self.scheduler.timers()?;
                match timers.timers().into_iter().find(|t| t.id.get() == raw) {
                    Some(timer) => {
                        timers.kill_timer(timer.id)?;
                        println!("--> Killed {}.", timer.id);
                    }
                    None => println!("Error: no pending timer {}.", raw),
                }
            }
            ["off", id] => {
                let id: usize = id.trim_start_matches('#').parse()?;
                let Some(entry) = self.active.remove(&id) else {
                    println!("Error: Invalid handle #{}. Use 'list' to see active jobs.", id);
                    return Ok(());
                };
                let removed = match entry.owner {
                    Owner::System => self.scheduler.system_manager()?.unregister_task(entry.handle),
                    Owner::Simulation => self.scheduler.simulation_manager()?.unregister_task(entry.handle),
                    Owner::Dispatcher => self.scheduler.dispatcher()?.unregister_task(entry.handle),
                    Owner::Timer => self.scheduler.timers()?.unregister_task(entry.handle),
                };
                match removed {
                    Ok(()) => println!("--> Removed {}.", entry.label),
                    Err(e) => println!("--> {} was already gone: {}", entry.label, e),
                }
            }
            ["list"] => {
                println!("Active jobs:");
                for (id, entry) in &self.active {
                    println!("  #{:<3} {:<10} {:?} {}", id, entry.handle, entry.owner, entry.label);
                }
                for timer in self.scheduler.timers()?.timers() {
                    println!(
                        "  {} {:?} next at {} ms (period {}, duration {})",
                        timer.id, timer.domain, timer.next_time, timer.period, timer.duration
                    );
                }
            }
            ["help"] => print_help(),
            _ => println!("Unknown command: '{}'. Type 'help'.", args.join(" ")),
        }
        Ok(())
    }

    fn status(&self) -> Result<()> {
        let clock = self.scheduler.clock()?;
        let (running, auto) = self.scheduler.simulation_state()?;
        println!("Frame           {}", clock.current_frame()?);
        println!("System time     {} ms", clock.system_time()?);
        println!(
            "Simulation time {} ms (frame [{}, {}])",
            clock.simulation_time()?,
            clock.frame_start()?,
            clock.frame_end()?
        );
        println!(
            "Simulation      {}{}",
            if running { "running".green() } else { "paused".red() },
            if auto { " (toggles next tick)" } else { "" }
        );
        println!("Pending timers  {}", self.scheduler.timers()?.pending());
        println!("Handles issued  {}", self.scheduler.handles().issued());
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(arg: Option<&&str>, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(match arg {
        Some(raw) => raw.parse()?,
        None => default,
    })
}

fn parse_type(raw: &str) -> Result<Option<NotificationType>> {
    Ok(match raw {
        "*" => None,
        "task" => Some(NotificationType::TASK),
        "error" => Some(NotificationType::ERROR),
        "time" => Some(NotificationType::TIME),
        other => Some(NotificationType(other.parse()?)),
    })
}

fn parse_id(raw: &str) -> Result<Option<NotificationId>> {
    Ok(match raw {
        "*" => None,
        other => Some(NotificationId(other.parse()?)),
    })
}

fn print_help() {
    println!("Available commands:");
    println!("  tick [N] [MS]            - Advances time by MS (default {}) and services N ticks.", DEFAULT_STEP_MS);
    println!("  jump <MS>                - Pushes system time forward.");
    println!("  pause | resume           - Stops or restarts simulation time.");
    println!("  reset                    - Resets the simulation and its timers.");
    println!("  status                   - Shows the clock.");
    println!("  sys [PRIO]               - Adds a system job that prints every tick.");
    println!("  sim [PRIO]               - Adds a simulation job that prints every step.");
    println!("  on <TYPE> [ID] [PRIO]    - Adds a listener. TYPE: task|error|time|<n>|*");
    println!("  fail <TYPE> <CODE>       - Adds a listener that always fails with CODE.");
    println!("  emit <TYPE> <ID>         - Submits a notification.");
    println!("  timer <S> <P> <D> [sim]  - Adds a timer job: start, period, duration.");
    println!("  kill <TIMER>             - Kills a pending timer by id.");
    println!("  off <#>                  - Removes a job by its shell handle.");
    println!("  list                     - Shows registered jobs and pending timers.");
    println!("  exit                     - Quits the shell.");
}

fn main() -> Result<()> {
    print_banner();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let config = match env::args().nth(1) {
        Some(path) => SchedulerConfig::load(path)?,
        None => SchedulerConfig::default(),
    };
    let mut shell = Shell::new(config)?;
    info!("{} ready; time only moves when you 'tick'.", ENGINE_NAME.cyan());

    let mut rl = Editor::new()?;
    rl.set_helper(Some(ShellHighlighter));

    loop {
        let prompt = format!("{}", ">> ".cyan().bold());
        match rl.readline(&prompt) {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                let args = line.split_whitespace().collect::<Vec<_>>();
                match args.as_slice() {
                    [] => {}
                    ["exit"] => break,
                    args => {
                        if let Err(e) = shell.execute(args) {
                            println!("{} {}", "Error:".red().bold(), e);
                        }
                    }
                }
            }
            Err(_) => {
                println!("Exiting cadenceshell...");
                break;
            }
        }
    }

    Ok(())
}
