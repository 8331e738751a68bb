use crate::error::ReduceError;
use crate::fleet::{FleetProviderLike, FleetStatus};
use crate::queue::JobQueueLike;
use crate::watchdog::CancelToken;
use std::collections::VecDeque;
use std::io::Write;
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(120);
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub at: Instant,
    pub visible: u64,
    pub in_flight: u64,
}

/// Queue depth samples over a sliding time window.
#[derive(Debug)]
pub struct DrainWindow {
    window: Duration,
    samples: VecDeque<QueueSnapshot>,
}

impl DrainWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append a sample and evict everything older than the window, measured from it.
    pub fn push(&mut self, snapshot: QueueSnapshot) {
        while let Some(oldest) = self.samples.front() {
            if snapshot.at.saturating_duration_since(oldest.at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back(snapshot);
    }

    pub fn newest(&self) -> Option<&QueueSnapshot> {
        self.samples.back()
    }

    /// Messages drained per second between the oldest and newest sample.
    pub fn rate(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let oldest = self.samples.front()?;
        let newest = self.samples.back()?;
        let elapsed = newest.at.saturating_duration_since(oldest.at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some((oldest.visible as f64 - newest.visible as f64) / elapsed)
    }

    /// Time until the visible backlog is gone at the current rate. Only defined while draining.
    pub fn eta(&self) -> Option<Duration> {
        let rate = self.rate().filter(|r| *r > 0.0)?;
        let newest = self.newest()?;
        Some(Duration::from_secs_f64(newest.visible as f64 / rate))
    }
}

pub fn status_line(window: &DrainWindow, fleet: FleetStatus) -> String {
    let Some(newest) = window.newest() else {
        return format!("N: {}/{}", fleet.active, fleet.requested);
    };
    match (window.rate(), window.eta()) {
        (Some(rate), Some(eta)) if rate > 0.0 => format!(
            "Q: {} ({}), R: {:.2} m/min, ETA: {:.2} h, N: {}/{}",
            newest.visible,
            newest.in_flight,
            rate * 60.0,
            eta.as_secs_f64() / 3600.0,
            fleet.active,
            fleet.requested
        ),
        _ => format!(
            "Q: {} ({}), N: {}/{}",
            newest.visible, newest.in_flight, fleet.active, fleet.requested
        ),
    }
}

/// Operator-facing progress loop over queue depth and fleet size.
pub struct Monitor<'a> {
    queue: &'a dyn JobQueueLike,
    fleet: &'a dyn FleetProviderLike,
    window: DrainWindow,
    tick: Duration,
}

impl<'a> Monitor<'a> {
    pub fn new(queue: &'a dyn JobQueueLike, fleet: &'a dyn FleetProviderLike) -> Self {
        Self {
            queue,
            fleet,
            window: DrainWindow::new(DEFAULT_WINDOW),
            tick: DEFAULT_TICK,
        }
    }

    pub fn with_timing(mut self, window: Duration, tick: Duration) -> Self {
        self.window = DrainWindow::new(window);
        self.tick = tick;
        self
    }

    pub fn tick_once(&mut self, now: Instant) -> Result<String, ReduceError> {
        let fleet = FleetStatus::from_requests(&self.fleet.describe_requests()?);
        let attributes = self.queue.attributes()?;
        self.window.push(QueueSnapshot {
            at: now,
            visible: attributes.visible,
            in_flight: attributes.in_flight,
        });
        Ok(status_line(&self.window, fleet))
    }

    /// Overwrite one status line per tick until `stop` is cancelled. Provider errors only
    /// print a marker.
    pub fn run<W: Write>(&mut self, out: &mut W, stop: &CancelToken) -> std::io::Result<()> {
        writeln!(out, "Monitoring job queue, extraction rate and running instances.")?;
        writeln!(out)?;
        while !stop.is_cancelled() {
            match self.tick_once(Instant::now()) {
                Ok(line) => write!(out, "\r{:<80}", line)?,
                Err(_) => write!(out, "\r! // ")?,
            }
            out.flush()?;
            std::thread::sleep(self.tick);
        }
        writeln!(out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{FleetController, InMemoryFleet};
    use crate::queue::InMemoryQueue;

    fn snapshot(at: Instant, visible: u64) -> QueueSnapshot {
        QueueSnapshot { at, visible, in_flight: 0 }
    }

    #[test]
    fn test_rate_and_eta_from_two_samples() {
        let t0 = Instant::now();
        let mut window = DrainWindow::new(DEFAULT_WINDOW);
        window.push(snapshot(t0, 1000));
        window.push(snapshot(t0 + Duration::from_secs(60), 700));
        assert_eq!(window.rate(), Some(5.0));
        assert_eq!(window.eta(), Some(Duration::from_secs(140)));
    }

    #[test]
    fn test_single_sample_has_no_rate() {
        let mut window = DrainWindow::new(DEFAULT_WINDOW);
        window.push(snapshot(Instant::now(), 10));
        assert_eq!(window.rate(), None);
        assert_eq!(window.eta(), None);
    }

    #[test]
    fn test_old_samples_evicted() {
        let t0 = Instant::now();
        let mut window = DrainWindow::new(Duration::from_secs(120));
        window.push(snapshot(t0, 1000));
        window.push(snapshot(t0 + Duration::from_secs(100), 900));
        window.push(snapshot(t0 + Duration::from_secs(130), 800));
        assert_eq!(window.len(), 2);
        assert_eq!(window.rate(), Some(100.0 / 30.0));
    }

    #[test]
    fn test_growing_queue_shows_counts_only() {
        let t0 = Instant::now();
        let mut window = DrainWindow::new(DEFAULT_WINDOW);
        window.push(snapshot(t0, 10));
        window.push(snapshot(t0 + Duration::from_secs(10), 20));
        assert_eq!(window.eta(), None);
        let line = status_line(&window, FleetStatus { active: 1, requested: 2 });
        assert_eq!(line, "Q: 20 (0), N: 1/2");
    }

    #[test]
    fn test_status_line_with_rate() {
        let t0 = Instant::now();
        let mut window = DrainWindow::new(DEFAULT_WINDOW);
        window.push(snapshot(t0, 1000));
        window.push(snapshot(t0 + Duration::from_secs(60), 700));
        let line = status_line(&window, FleetStatus { active: 2, requested: 3 });
        assert_eq!(line, "Q: 700 (0), R: 300.00 m/min, ETA: 0.04 h, N: 2/3");
    }

    #[test]
    fn test_tick_samples_queue_and_fleet() {
        let queue = InMemoryQueue::new();
        queue.enqueue_batch(&["a".to_string(), "b".to_string()]).unwrap();
        let fleet = InMemoryFleet::new();
        FleetController::new(&fleet)
            .create(&crate::config::test_config(), 2, 0.1)
            .unwrap();
        fleet.activate(1);

        let mut monitor = Monitor::new(&queue, &fleet);
        let line = monitor.tick_once(Instant::now()).unwrap();
        assert_eq!(line, "Q: 2 (0), N: 1/2");
    }

    #[test]
    fn test_provider_error_surfaces_and_run_stops_when_cancelled() {
        let queue = InMemoryQueue::new();
        let fleet = InMemoryFleet::new();
        fleet.set_failing(true);
        let mut monitor = Monitor::new(&queue, &fleet).with_timing(DEFAULT_WINDOW, Duration::ZERO);
        assert!(monitor.tick_once(Instant::now()).is_err());

        let stop = CancelToken::new();
        stop.cancel();
        let mut out = Vec::new();
        monitor.run(&mut out, &stop).unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("Monitoring job queue"));
    }
}
