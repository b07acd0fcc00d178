//! The burst scheduler.
//!
//! A [`Scheduler`] owns a single slot that holds at most one running burst
//! task. The task wakes once per configured interval and writes one burst
//! through the [`Emitter`], until it is stopped, replaced, reaches its
//! deadline or the process shuts down.
//!
//! Replacing or stopping the task is serialized on the slot lock and always
//! waits for the old task to exit before returning, so two tasks never emit
//! into the same counter epoch.
//!
//! ## Metrics
//!
//! `scheduler_ticks`: Ticks that produced a burst
//! `scheduler_starts`: Burst tasks started
//!

use std::{sync::Arc, time::Duration};

use dotter_signal::{Broadcaster, Watcher};
use metrics::counter;
use time::OffsetDateTime;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{self as tokio_time, Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, error, info, info_span};

use crate::{
    counter::LineCounter,
    emitter::{self, Emitter, Sink},
};

/// The largest burst a single tick may emit.
pub const MAX_BURST_SIZE: u32 = 150_000;

/// Default burst size.
pub const DEFAULT_BURST_SIZE: u32 = MAX_BURST_SIZE;

/// Errors produced by [`Scheduler`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The tick interval was zero.
    #[error("interval must be greater than zero")]
    ZeroInterval,
    /// The timeout was zero.
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    /// The burst size exceeded [`MAX_BURST_SIZE`].
    #[error("burst size {0} exceeds the maximum of {MAX_BURST_SIZE}")]
    BurstTooLarge(u32),
    /// The tick interval cannot be represented as a point in time.
    #[error("interval of {0} milliseconds is too large")]
    IntervalTooLarge(u64),
    /// The timeout cannot be represented as a point in time.
    #[error("timeout of {0} minutes is too large")]
    TimeoutTooLarge(u64),
    /// The process is shutting down and no new task may start.
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Receives fatal emission errors from burst tasks.
pub type Failures = mpsc::Receiver<emitter::Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Configuration of a burst task.
pub struct Config {
    /// Time between ticks, in milliseconds
    pub interval_millis: u64,
    /// Lifetime of the task, in minutes
    pub timeout_minutes: u64,
    /// Records emitted per tick
    pub burst_size: u32,
}

impl Config {
    /// Create a new [`Config`] with the default burst size.
    #[must_use]
    pub fn new(interval_millis: u64, timeout_minutes: u64) -> Self {
        Self {
            interval_millis,
            timeout_minutes,
            burst_size: DEFAULT_BURST_SIZE,
        }
    }

    /// Replace the burst size.
    #[must_use]
    pub fn with_burst_size(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }

    /// Check the configuration can be started.
    ///
    /// # Errors
    ///
    /// Returns an error if interval or timeout are zero or the burst size is
    /// above [`MAX_BURST_SIZE`].
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval_millis == 0 {
            return Err(Error::ZeroInterval);
        }
        if self.timeout_minutes == 0 {
            return Err(Error::ZeroTimeout);
        }
        if self.burst_size > MAX_BURST_SIZE {
            return Err(Error::BurstTooLarge(self.burst_size));
        }
        Ok(())
    }

    /// The tick interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_millis)
    }

    /// The task lifetime.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The configuration of a started task and when it expires.
pub struct Snapshot {
    /// Slot generation of the task, strictly increasing per [`Scheduler`]
    pub generation: u64,
    /// Wall-clock time at which the task stops on its own
    pub deadline: OffsetDateTime,
    /// Time between ticks, in milliseconds
    pub interval_millis: u64,
    /// Lifetime of the task, in minutes
    pub timeout_minutes: u64,
    /// Records emitted per tick
    pub burst_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a burst task stopped.
pub enum StopReason {
    /// Stopped by [`Scheduler::stop`]
    Requested,
    /// The task reached its deadline
    Deadline,
    /// The process is shutting down
    Shutdown,
    /// The sink refused records
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Observable state of the [`Scheduler`] slot.
pub enum State {
    /// No task has been started
    Idle,
    /// A task is running
    Running(Snapshot),
    /// The most recent task stopped
    Stopped {
        /// The stopped task
        snapshot: Snapshot,
        /// Why it stopped
        reason: StopReason,
    },
}

impl State {
    /// Whether a task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    /// The snapshot of the most recently started task, if any.
    #[must_use]
    pub fn snapshot(&self) -> Option<Snapshot> {
        match *self {
            Self::Idle => None,
            Self::Running(snapshot) | Self::Stopped { snapshot, .. } => Some(snapshot),
        }
    }

    /// Short name of the state.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running(_) => "running",
            Self::Stopped { .. } => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What [`Scheduler::restart`] does with the line counter.
pub enum CounterReset {
    /// Set the counter to zero once the old task has exited
    Reset,
    /// Leave the counter as it is
    Keep,
}

/// When a task started now ticks first and expires.
#[derive(Debug, Clone, Copy)]
struct Schedule {
    first_tick: Instant,
    expires_at: Instant,
    deadline: OffsetDateTime,
}

impl Schedule {
    fn from_now(config: &Config) -> Result<Self, Error> {
        let now = Instant::now();
        let first_tick = now
            .checked_add(config.interval())
            .ok_or(Error::IntervalTooLarge(config.interval_millis))?;
        let expires_at = now
            .checked_add(config.timeout())
            .ok_or(Error::TimeoutTooLarge(config.timeout_minutes))?;
        let deadline = time::Duration::try_from(config.timeout())
            .ok()
            .and_then(|timeout| OffsetDateTime::now_utc().checked_add(timeout))
            .ok_or(Error::TimeoutTooLarge(config.timeout_minutes))?;

        Ok(Self {
            first_tick,
            expires_at,
            deadline,
        })
    }
}

#[derive(Debug)]
struct Handle {
    snapshot: Snapshot,
    cancel: Broadcaster,
    join: JoinHandle<StopReason>,
}

#[derive(Debug, Default)]
struct Slot {
    handle: Option<Handle>,
    generation: u64,
}

#[derive(Debug)]
/// Owner of the single burst task slot.
pub struct Scheduler {
    slot: Mutex<Slot>,
    state: Arc<watch::Sender<State>>,
    emitter: Emitter,
    shutdown: Watcher,
    failures: mpsc::Sender<emitter::Error>,
}

impl Scheduler {
    /// Create a new, idle [`Scheduler`].
    ///
    /// Tasks started by the scheduler stop when `shutdown` is signaled. The
    /// returned [`Failures`] receives fatal sink errors from any task; the
    /// caller is expected to end the process on receipt.
    ///
    /// The scheduler holds a registered `shutdown` watcher for as long as it
    /// lives, drop it before waiting on the shutdown broadcast.
    #[must_use]
    pub fn new(
        sink: Arc<dyn Sink>,
        counter: Arc<LineCounter>,
        shutdown: Watcher,
    ) -> (Self, Failures) {
        let (failures, failures_rcv) = mpsc::channel(1);
        let (state, _) = watch::channel(State::Idle);

        let scheduler = Self {
            slot: Mutex::new(Slot::default()),
            state: Arc::new(state),
            emitter: Emitter::new(sink, counter),
            shutdown,
            failures,
        };
        (scheduler, failures_rcv)
    }

    /// Start a burst task.
    ///
    /// If a task is already running it is replaced, exactly as
    /// [`Scheduler::restart`] without a counter reset.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the process is shutting
    /// down. No task is started and any running task is left untouched.
    pub async fn start(&self, config: Config) -> Result<Snapshot, Error> {
        self.restart(config, CounterReset::Keep).await
    }

    /// Replace the running task, if any, with a new one.
    ///
    /// The old task is cancelled and has exited before the counter is reset
    /// and the new task spawned.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid or the process is shutting
    /// down. No task is started and any running task is left untouched.
    pub async fn restart(&self, config: Config, reset: CounterReset) -> Result<Snapshot, Error> {
        config.validate()?;
        Schedule::from_now(&config)?;

        let mut slot = self.slot.lock().await;
        let shutdown = self.shutdown.register().map_err(|_| Error::ShuttingDown)?;

        let previous = Self::retire(&mut slot).await;
        if let Some(previous) = previous {
            debug!(generation = previous.generation, "burst task superseded");
        }

        // The old task may have been mid-burst, the new schedule starts once
        // it has exited.
        let schedule = match Schedule::from_now(&config) {
            Ok(schedule) => schedule,
            Err(err) => {
                if let Some(snapshot) = previous {
                    self.state.send_replace(State::Stopped {
                        snapshot,
                        reason: StopReason::Requested,
                    });
                }
                return Err(err);
            }
        };
        if reset == CounterReset::Reset {
            self.emitter.counter().reset();
        }

        slot.generation += 1;
        let snapshot = Snapshot {
            generation: slot.generation,
            deadline: schedule.deadline,
            interval_millis: config.interval_millis,
            timeout_minutes: config.timeout_minutes,
            burst_size: config.burst_size,
        };

        let (cancel_watcher, cancel) = dotter_signal::signal();
        let task = Task {
            generation: snapshot.generation,
            config,
            first_tick: schedule.first_tick,
            expires_at: schedule.expires_at,
            emitter: self.emitter.clone(),
            cancel: cancel_watcher,
            shutdown,
            state: Arc::clone(&self.state),
            failures: self.failures.clone(),
        };

        // Publish before spawning so a task that finishes immediately cannot
        // have its stop overwritten.
        self.state.send_replace(State::Running(snapshot));
        let join = tokio::spawn(
            task.run()
                .instrument(info_span!("burst_task", generation = snapshot.generation)),
        );
        counter!("scheduler_starts").increment(1);

        slot.handle = Some(Handle {
            snapshot,
            cancel,
            join,
        });
        Ok(snapshot)
    }

    /// Stop the running task.
    ///
    /// Returns once the task has exited. Returns `false` if no task was
    /// running, which is not an error.
    pub async fn stop(&self) -> bool {
        let mut slot = self.slot.lock().await;
        match Self::retire(&mut slot).await {
            Some(snapshot) => {
                self.state.send_replace(State::Stopped {
                    snapshot,
                    reason: StopReason::Requested,
                });
                info!(generation = snapshot.generation, "burst task stopped");
                true
            }
            None => {
                debug!("stop requested with no running burst task");
                false
            }
        }
    }

    /// The configuration of the most recently started task, running or
    /// stopped. `None` until a task has been started.
    #[must_use]
    pub fn current_config(&self) -> Option<Snapshot> {
        self.state().snapshot()
    }

    /// The current slot state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Subscribe to slot state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.state.subscribe()
    }

    /// The line counter bursts are accounted in.
    #[must_use]
    pub fn counter(&self) -> &LineCounter {
        self.emitter.counter()
    }

    /// Cancel the slot's task and wait for it to exit. Returns the snapshot of
    /// the task if it was still running when cancelled.
    async fn retire(slot: &mut Slot) -> Option<Snapshot> {
        let handle = slot.handle.take()?;

        handle.cancel.signal_and_wait().await;
        match handle.join.await {
            Ok(StopReason::Requested) => Some(handle.snapshot),
            Ok(reason) => {
                debug!(
                    generation = handle.snapshot.generation,
                    ?reason,
                    "burst task had already stopped"
                );
                None
            }
            Err(err) => {
                error!("Could not join the burst task: {err}");
                None
            }
        }
    }
}

struct Task {
    generation: u64,
    config: Config,
    first_tick: Instant,
    expires_at: Instant,
    emitter: Emitter,
    cancel: Watcher,
    shutdown: Watcher,
    state: Arc<watch::Sender<State>>,
    failures: mpsc::Sender<emitter::Error>,
}

impl Task {
    async fn run(self) -> StopReason {
        let Self {
            generation,
            config,
            first_tick,
            expires_at,
            emitter,
            cancel,
            shutdown,
            state,
            failures,
        } = self;

        let mut ticker = tokio_time::interval_at(first_tick, config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let shutdown_wait = shutdown.recv();
        let cancel_wait = cancel.recv();
        let deadline_wait = tokio_time::sleep_until(expires_at);
        tokio::pin!(shutdown_wait, cancel_wait, deadline_wait);

        info!(
            interval_millis = config.interval_millis,
            timeout_minutes = config.timeout_minutes,
            burst_size = config.burst_size,
            "burst task started"
        );
        let reason = loop {
            tokio::select! {
                biased;

                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    break StopReason::Shutdown;
                }
                () = &mut cancel_wait => {
                    debug!("cancellation received");
                    break StopReason::Requested;
                }
                () = &mut deadline_wait => {
                    info!("deadline reached, burst task stopped");
                    break StopReason::Deadline;
                }
                _ = ticker.tick() => {
                    counter!("scheduler_ticks").increment(1);
                    if let Err(err) = emitter.burst(config.burst_size) {
                        error!("Burst emission failed: {err}");
                        if failures.try_send(err).is_err() {
                            debug!("a fatal emission error is already pending");
                        }
                        break StopReason::Failed;
                    }
                }
            }
        };

        // A requested stop is published by the slot once it has joined the
        // task. Everything else is published here, unless a newer task owns
        // the slot already.
        if reason != StopReason::Requested {
            state.send_if_modified(|current| match *current {
                State::Running(snapshot) if snapshot.generation == generation => {
                    *current = State::Stopped { snapshot, reason };
                    true
                }
                _ => false,
            });
        }
        reason
    }
}
