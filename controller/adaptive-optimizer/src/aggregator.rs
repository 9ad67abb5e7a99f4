//! Windowed metrics aggregation.
//!
//! Samples are bucketed by their timestamp into fixed windows of
//! `metrics_aggregation_window`. Each closed window produces one
//! [`WindowSummary`]; windows with no samples still produce a summary with
//! `sample_count == 0` and no latency percentiles. Latency is kept in a
//! bounded reservoir per window so memory stays flat under heavy traffic,
//! while request and error counts stay exact.

use crate::model::PointId;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

/// One observed request on an integration point.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSample {
    pub point_id: PointId,
    pub timestamp: DateTime<Utc>,
    pub latency: Duration,
    pub success: bool,
}

impl MetricsSample {
    pub fn new(
        point_id: impl Into<PointId>,
        timestamp: DateTime<Utc>,
        latency: Duration,
        success: bool,
    ) -> Self {
        Self {
            point_id: point_id.into(),
            timestamp,
            latency,
            success,
        }
    }
}

/// Nearest-rank latency percentiles for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    #[serde(with = "nexus_config::duration")]
    pub p50: Duration,
    #[serde(with = "nexus_config::duration")]
    pub p95: Duration,
    #[serde(with = "nexus_config::duration")]
    pub p99: Duration,
}

/// Aggregate performance of one point over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub point_id: PointId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Requests per second over the window.
    pub throughput: f64,
    /// `None` when the window saw no samples.
    pub latency: Option<LatencyPercentiles>,
    pub error_rate: f64,
    pub sample_count: u64,
}

impl WindowSummary {
    pub fn has_data(&self) -> bool {
        self.sample_count > 0
    }

    pub fn p95(&self) -> Option<Duration> {
        self.latency.map(|l| l.p95)
    }
}

/// Tunables for [`MetricsAggregator`].
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub window: Duration,
    pub history: usize,
    pub max_samples_per_window: usize,
    pub seed: Option<u64>,
}

impl AggregatorSettings {
    pub fn from_config(config: &nexus_config::NexusConfig) -> Self {
        Self {
            window: config.metrics_aggregation_window,
            history: config.summary_history,
            max_samples_per_window: config.max_samples_per_window,
            seed: config.rng_seed,
        }
    }
}

/// Upper bound on summaries a single `close_elapsed` call returns.
pub const MAX_WINDOWS_PER_CLOSE: usize = 1024;

/// Exact counters plus a latency reservoir for the open window.
#[derive(Debug)]
struct Accumulator {
    count: u64,
    errors: u64,
    reservoir: Vec<Duration>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            count: 0,
            errors: 0,
            reservoir: Vec::new(),
        }
    }

    fn add(&mut self, latency: Duration, success: bool, cap: usize, rng: &mut StdRng) {
        self.count += 1;
        if !success {
            self.errors += 1;
        }

        if self.reservoir.len() < cap {
            self.reservoir.push(latency);
        } else if cap > 0 {
            let slot = rng.gen_range(0..self.count) as usize;
            if slot < cap {
                self.reservoir[slot] = latency;
            }
        }
    }

    fn summarize(
        self,
        point_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> WindowSummary {
        let elapsed = (window_end - window_start)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let throughput = if elapsed > 0.0 {
            self.count as f64 / elapsed
        } else {
            0.0
        };
        let error_rate = if self.count > 0 {
            self.errors as f64 / self.count as f64
        } else {
            0.0
        };

        WindowSummary {
            point_id: point_id.to_string(),
            window_start,
            window_end,
            throughput,
            latency: percentiles(self.reservoir),
            error_rate,
            sample_count: self.count,
        }
    }
}

fn percentiles(mut latencies: Vec<Duration>) -> Option<LatencyPercentiles> {
    if latencies.is_empty() {
        return None;
    }
    latencies.sort_unstable();

    // nearest rank: ceil(p * n / 100), 1-based
    let rank = |pct: usize| -> Duration {
        let n = latencies.len();
        let idx = (pct * n).div_ceil(100);
        latencies[idx.clamp(1, n) - 1]
    };

    Some(LatencyPercentiles {
        p50: rank(50),
        p95: rank(95),
        p99: rank(99),
    })
}

#[derive(Debug)]
struct PointWindows {
    window_start: DateTime<Utc>,
    current: Accumulator,
    /// Samples stamped past the end of the open window.
    early: Vec<(DateTime<Utc>, Duration, bool)>,
    history: VecDeque<WindowSummary>,
    late_dropped: u64,
    rng: StdRng,
}

impl PointWindows {
    fn push_history(&mut self, summary: WindowSummary, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Start a new window at `start`, pulling in early samples that belong to it.
    fn advance(&mut self, start: DateTime<Utc>, width: chrono::Duration, cap: usize) {
        self.window_start = start;
        self.current = Accumulator::new();

        let end = start + width;
        let early = std::mem::take(&mut self.early);
        for (ts, latency, success) in early {
            if ts < start {
                self.late_dropped += 1;
            } else if ts < end {
                self.current.add(latency, success, cap, &mut self.rng);
            } else {
                self.early.push((ts, latency, success));
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turns raw samples into per-window summaries for every registered point.
///
/// `record` is safe to call concurrently from request paths; each point has
/// its own lock so traffic on one point never waits on another.
#[derive(Debug)]
pub struct MetricsAggregator {
    settings: AggregatorSettings,
    width: chrono::Duration,
    points: RwLock<HashMap<PointId, Arc<Mutex<PointWindows>>>>,
}

impl MetricsAggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        let width = chrono::Duration::milliseconds(settings.window.as_millis().max(1) as i64);
        Self {
            settings,
            width,
            points: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.settings.window
    }

    /// Start tracking a point; its first window opens at `now`.
    pub fn register(&self, point_id: &str, now: DateTime<Utc>) {
        let rng = match self.settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let windows = PointWindows {
            window_start: now,
            current: Accumulator::new(),
            early: Vec::new(),
            history: VecDeque::new(),
            late_dropped: 0,
            rng,
        };

        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        points
            .entry(point_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(windows)));
    }

    pub fn deregister(&self, point_id: &str) -> bool {
        let mut points = self.points.write().unwrap_or_else(PoisonError::into_inner);
        points.remove(point_id).is_some()
    }

    pub fn is_registered(&self, point_id: &str) -> bool {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        points.contains_key(point_id)
    }

    fn windows(&self, point_id: &str) -> Option<Arc<Mutex<PointWindows>>> {
        let points = self.points.read().unwrap_or_else(PoisonError::into_inner);
        points.get(point_id).cloned()
    }

    /// Add a sample to the window its timestamp falls in.
    ///
    /// Returns `false` when the point is unknown or the sample belongs to a
    /// window that has already been closed.
    pub fn record(&self, sample: MetricsSample) -> bool {
        let Some(windows) = self.windows(&sample.point_id) else {
            debug!(point_id = %sample.point_id, "Dropping sample for unregistered point");
            return false;
        };
        let cap = self.settings.max_samples_per_window;
        let mut w = lock(&windows);

        if sample.timestamp < w.window_start {
            w.late_dropped += 1;
            return false;
        }

        if sample.timestamp < w.window_start + self.width {
            let PointWindows { current, rng, .. } = &mut *w;
            current.add(sample.latency, sample.success, cap, rng);
        } else if w.early.len() < cap {
            w.early.push((sample.timestamp, sample.latency, sample.success));
        } else {
            w.late_dropped += 1;
            return false;
        }
        true
    }

    /// Close the open window at `now` regardless of its configured width.
    ///
    /// The next window opens at `now`. Returns `None` for unknown points.
    pub fn flush(&self, point_id: &str, now: DateTime<Utc>) -> Option<WindowSummary> {
        let windows = self.windows(point_id)?;
        let mut w = lock(&windows);

        let start = w.window_start;
        let end = now.max(start);
        let current = std::mem::replace(&mut w.current, Accumulator::new());
        let summary = current.summarize(point_id, start, end);

        w.push_history(summary.clone(), self.settings.history);
        w.advance(end, self.width, self.settings.max_samples_per_window);
        Some(summary)
    }

    /// Close every window that ended at or before `now`, oldest first.
    ///
    /// Silent windows yield empty summaries. At most
    /// [`MAX_WINDOWS_PER_CLOSE`] windows are closed per call; after a long gap
    /// the rest are returned by the following calls, so every elapsed window
    /// is still reported exactly once.
    pub fn close_elapsed(&self, point_id: &str, now: DateTime<Utc>) -> Vec<WindowSummary> {
        let Some(windows) = self.windows(point_id) else {
            return Vec::new();
        };
        let cap = self.settings.max_samples_per_window;
        let mut w = lock(&windows);
        let mut closed = Vec::new();

        while w.window_start + self.width <= now {
            if closed.len() == MAX_WINDOWS_PER_CLOSE {
                let backlog = (now - w.window_start).num_milliseconds()
                    / self.width.num_milliseconds().max(1);
                warn!(
                    point_id = %point_id,
                    backlog_windows = backlog,
                    "Aggregation is behind; remaining windows close on the next call"
                );
                break;
            }
            let start = w.window_start;
            let end = start + self.width;
            let current = std::mem::replace(&mut w.current, Accumulator::new());
            let summary = current.summarize(point_id, start, end);
            w.push_history(summary.clone(), self.settings.history);
            closed.push(summary);
            w.advance(end, self.width, cap);
        }

        if w.late_dropped > 0 && !closed.is_empty() {
            debug!(
                point_id = %point_id,
                dropped = w.late_dropped,
                "Samples dropped outside their window"
            );
            w.late_dropped = 0;
        }
        closed
    }

    /// Closed summaries for a point, oldest first.
    pub fn history(&self, point_id: &str) -> Vec<WindowSummary> {
        self.windows(point_id)
            .map(|w| lock(&w).history.iter().cloned().collect())
            .unwrap_or_default()
    }
}
