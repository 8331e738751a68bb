use crate::error::ReduceError;
use crate::watchdog::{CancelToken, Watchdog};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// A long-running loop owned by one supervisor slot.
pub trait PoolWorker: Send {
    fn run(self: Box<Self>) -> Result<(), ReduceError>;
}

/// Builds a fresh worker for a slot. The worker must arm `watchdog` once per iteration.
pub trait WorkerFactory: Send + Sync {
    fn build(&self, watchdog: Arc<Watchdog>) -> Result<Box<dyn PoolWorker>, ReduceError>;
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub thread_limit: usize,
    pub job_time_limit: Duration,
    pub interval: Duration,
    pub restart_backoff: Duration,
    pub max_backoff: Duration,
}

impl SupervisorSettings {
    pub fn new(job_time_limit: Duration) -> Self {
        let thread_limit = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            thread_limit,
            job_time_limit,
            interval: Duration::from_secs(1),
            restart_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reaped: usize,
    pub crashed: usize,
    pub abandoned: usize,
    pub started: usize,
}

struct Slot {
    serial: u64,
    handle: JoinHandle<Result<(), ReduceError>>,
    watchdog: Arc<Watchdog>,
}

/// Keeps up to `thread_limit` worker loops running.
///
/// A slot whose watchdog passes its deadline is cancelled and detached: the stuck thread
/// keeps its cancelled token and exits at its next check, while a fresh loop takes the slot.
pub struct Supervisor {
    factory: Arc<dyn WorkerFactory>,
    settings: SupervisorSettings,
    slots: Vec<Slot>,
    detached: Vec<Slot>,
    next_serial: u64,
    consecutive_crashes: u32,
    hold_until: Option<Instant>,
}

impl Supervisor {
    pub fn new(factory: Arc<dyn WorkerFactory>, settings: SupervisorSettings) -> Self {
        Self {
            factory,
            settings,
            slots: Vec::new(),
            detached: Vec::new(),
            next_serial: 0,
            consecutive_crashes: 0,
            hold_until: None,
        }
    }

    pub fn running(&self) -> usize {
        self.slots.len()
    }

    pub fn detached(&self) -> usize {
        self.detached.len()
    }

    /// One supervision pass: reap finished loops, abandon expired ones, refill empty slots.
    pub fn reconcile(&mut self, now: Instant) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut kept = Vec::with_capacity(self.slots.len());
        for slot in self.slots.drain(..) {
            if slot.handle.is_finished() {
                report.reaped += 1;
                if !reap(slot) {
                    report.crashed += 1;
                }
            } else if slot.watchdog.fire(now) {
                warn!(worker = slot.serial, limit = ?slot.watchdog.limit(), "killing worker thread, time limit expired");
                report.abandoned += 1;
                self.detached.push(slot);
            } else {
                kept.push(slot);
            }
        }
        self.slots = kept;

        let (finished, still_running): (Vec<Slot>, Vec<Slot>) =
            self.detached.drain(..).partition(|s| s.handle.is_finished());
        self.detached = still_running;
        for slot in finished {
            reap(slot);
        }

        if report.crashed > 0 {
            self.consecutive_crashes += 1;
            let delay = self.backoff();
            warn!(crashes = self.consecutive_crashes, delay = ?delay, "holding restarts after crash");
            self.hold_until = Some(now + delay);
        } else if self.slots.len() == self.settings.thread_limit {
            self.consecutive_crashes = 0;
        }

        if self.hold_until.is_some_and(|until| now < until) {
            return report;
        }
        self.hold_until = None;

        while self.slots.len() < self.settings.thread_limit {
            match self.start_slot() {
                Ok(slot) => {
                    self.slots.push(slot);
                    report.started += 1;
                }
                Err(e) => {
                    error!(error = %e, "unable to start worker");
                    self.consecutive_crashes += 1;
                    self.hold_until = Some(now + self.backoff());
                    break;
                }
            }
        }
        report
    }

    /// Supervise until `shutdown` is cancelled, then cancel every running loop.
    pub fn run(&mut self, shutdown: &CancelToken) {
        info!(threads = self.settings.thread_limit, "supervisor started");
        while !shutdown.is_cancelled() {
            let report = self.reconcile(Instant::now());
            if report != ReconcileReport::default() {
                info!(
                    running = self.slots.len(),
                    started = report.started,
                    crashed = report.crashed,
                    abandoned = report.abandoned,
                    "reconciled worker pool"
                );
            }
            thread::sleep(self.settings.interval);
        }
        for slot in self.slots.iter().chain(self.detached.iter()) {
            slot.watchdog.token().cancel();
        }
        info!("supervisor stopped");
    }

    fn backoff(&self) -> Duration {
        let exponent = self.consecutive_crashes.saturating_sub(1).min(16);
        self.settings
            .restart_backoff
            .saturating_mul(1 << exponent)
            .min(self.settings.max_backoff)
    }

    fn start_slot(&mut self) -> Result<Slot, ReduceError> {
        let serial = self.next_serial;
        self.next_serial += 1;
        let watchdog = Arc::new(Watchdog::new(self.settings.job_time_limit));
        let worker = self.factory.build(watchdog.clone())?;
        let handle = thread::Builder::new()
            .name(format!("worker-{}", serial))
            .spawn(move || worker.run())?;
        info!(worker = serial, "started worker");
        Ok(Slot {
            serial,
            handle,
            watchdog,
        })
    }
}

/// Join a finished slot. Returns false when it crashed.
fn reap(slot: Slot) -> bool {
    let cancelled = slot.watchdog.token().is_cancelled();
    match slot.handle.join() {
        Ok(Ok(())) => {
            if cancelled {
                info!(worker = slot.serial, "abandoned worker exited");
            } else {
                info!(worker = slot.serial, "worker exited");
            }
            true
        }
        Ok(Err(e)) => {
            error!(worker = slot.serial, error = %e, "worker crashed");
            cancelled
        }
        Err(_) => {
            error!(worker = slot.serial, "worker panicked");
            cancelled
        }
    }
}
