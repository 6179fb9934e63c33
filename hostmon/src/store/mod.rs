//! In-memory metric store.
//!
//! The store is a label-indexed registry over XOR-compressed point series
//! with a short retention horizon. Producers push [`MetricPoint`] batches;
//! accepted points are fanned out to registered notifiees (uplink
//! forwarder, API adapters). A background garbage collector evicts old
//! points and idle metrics.
//!
//! # Locking
//!
//! Three mutexes, never nested the wrong way around:
//!
//! * the registry mutex guards metrics and encoded points,
//! * the notifiee mutex guards the id→callback map,
//! * the new-metric mutex guards the new-metric callback.
//!
//! Callbacks are invoked with **no lock held** (the callback list is
//! snapshotted first). Notifiees must not call back into
//! [`Store::push_points`], [`Store::add_notifiee`] or
//! [`Store::remove_notifiee`] from inside their callback.

pub mod buffer;
pub mod chunk;
pub mod filtered;
pub mod labels;

use crate::check::Status;
use crate::telemetry::log;
use buffer::{PointBuffer, Pushed};
use chrono::{DateTime, Utc};
use chunk::ChunkError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use labels::{LabelSet, NAME_LABEL, fingerprint, label_set};

/// The Prometheus staleness marker bit pattern.
///
/// Writing a point with this exact value is an in-band deletion request for
/// the metric. It is compared by bit pattern: an ordinary NaN is not a
/// deletion.
pub const STALE_NAN_BITS: u64 = 0x7ff0_0000_0000_0002;

/// Returns the staleness marker value.
pub fn stale_nan() -> f64 {
    f64::from_bits(STALE_NAN_BITS)
}

/// Returns whether `value` is the staleness marker.
pub fn is_stale_nan(value: f64) -> bool {
    value.to_bits() == STALE_NAN_BITS
}

/// Auxiliary structured metadata attached to a metric.
///
/// Not part of the metric identity; the latest pushed value wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Annotations {
    /// Container the metric belongs to, if any.
    pub container_id: Option<String>,

    /// Service the metric belongs to, if any.
    pub service_id: Option<String>,

    /// Check status carried by the point, if any.
    pub status: Option<Status>,
}

/// A `(timestamp, value)` pair of one time series.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Sample time, millisecond resolution.
    pub time: DateTime<Utc>,

    /// Sample value.
    pub value: f64,
}

/// One labelled sample on its way into the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Label set identifying the metric.
    pub labels: LabelSet,

    /// Metadata update carried along with the sample.
    #[serde(default)]
    pub annotations: Annotations,

    /// Sample time.
    pub time: DateTime<Utc>,

    /// Sample value.
    pub value: f64,
}

/// A registered metric.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// Fingerprint of the canonicalized label set.
    pub id: u64,

    /// The metric's labels.
    pub labels: LabelSet,

    /// Latest annotations.
    pub annotations: Annotations,

    /// When the metric was first seen.
    pub created_at: DateTime<Utc>,

    /// Time of the most recent accepted point. Monotonically non-decreasing.
    pub last_point_at: DateTime<Utc>,
}

impl Metric {
    /// The metric name (`__name__` label), or an empty string.
    pub fn name(&self) -> &str {
        self.labels.get(NAME_LABEL).map(String::as_str).unwrap_or("")
    }
}

/// Store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A stored chunk could not be decoded.
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}

/// Callback invoked with every accepted batch of points.
pub type NotifieeFn = Arc<dyn Fn(&[MetricPoint]) + Send + Sync>;

/// Callback invoked with metrics seen for the first time.
pub type NewMetricFn = Arc<dyn Fn(&[Metric]) + Send + Sync>;

#[derive(Clone, Debug)]
struct MetricEntry {
    labels: LabelSet,
    annotations: Annotations,
    created_at: DateTime<Utc>,
    last_point_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    metrics: HashMap<u64, MetricEntry>,
    points: PointBuffer,
}

#[derive(Default)]
struct Notifiees {
    next_id: u32,
    callbacks: HashMap<u32, NotifieeFn>,
}

/// The metric store. Cheap to share behind an [`Arc`].
pub struct Store {
    registry: Mutex<Registry>,
    notifiees: Mutex<Notifiees>,
    new_metric: Mutex<Option<NewMetricFn>>,
    max_points_age: Duration,
    max_metrics_age: Duration,
}

impl Store {
    /// Creates a store with the given retention horizons.
    pub fn new(max_points_age: Duration, max_metrics_age: Duration) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            notifiees: Mutex::new(Notifiees::default()),
            new_metric: Mutex::new(None),
            max_points_age,
            max_metrics_age,
        }
    }

    /// Ingests a batch of points.
    ///
    /// Per point: the labels are hashed, the metric is upserted, annotations
    /// and `last_point_at` are updated. A point whose timestamp already
    /// exists for the metric is dropped (the stored value wins). A point
    /// carrying the staleness marker deletes the metric instead. Accepted
    /// points are forwarded, deduplicated, to every notifiee, and metrics
    /// seen for the first time are reported to the new-metric callback
    /// afterwards.
    pub fn push_points(&self, points: Vec<MetricPoint>) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut accepted = Vec::new();
        let mut seen = HashSet::new();
        let mut new_metrics = Vec::new();
        let mut first_error = None;

        {
            let mut registry = self.registry.lock();

            for mut point in points {
                point.time = truncate_to_millis(point.time);

                let id = fingerprint(&point.labels);

                if is_stale_nan(point.value) {
                    registry.metrics.remove(&id);
                    registry.points.drop_series(id);
                    continue;
                }

                let pushed =
                    match registry
                        .points
                        .push(id, point.time.timestamp_millis(), point.value)
                    {
                        Ok(pushed) => pushed,
                        Err(err) => {
                            if first_error.is_none() {
                                first_error = Some(err);
                            }
                            continue;
                        }
                    };

                if pushed == Pushed::DuplicateTimestamp {
                    continue;
                }

                match registry.metrics.get_mut(&id) {
                    Some(entry) => {
                        entry.annotations = point.annotations.clone();
                        entry.last_point_at = entry.last_point_at.max(point.time);
                    }
                    None => {
                        let entry = MetricEntry {
                            labels: point.labels.clone(),
                            annotations: point.annotations.clone(),
                            created_at: now,
                            last_point_at: point.time,
                        };

                        new_metrics.push(metric_from_entry(id, &entry));
                        registry.metrics.insert(id, entry);
                    }
                }

                if seen.insert((id, point.time.timestamp_millis())) {
                    accepted.push(point);
                }
            }
        }

        if !accepted.is_empty() {
            for (id, callback) in self.snapshot_notifiees() {
                if catch_unwind(AssertUnwindSafe(|| callback(&accepted))).is_err() {
                    log::error!("metric notifiee panicked"; "notifiee_id" => id);
                }
            }
        }

        if !new_metrics.is_empty() {
            let callback = self.new_metric.lock().clone();

            if let Some(callback) = callback {
                if catch_unwind(AssertUnwindSafe(|| callback(&new_metrics))).is_err() {
                    log::error!("new-metric callback panicked");
                }
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Returns every metric whose labels are a superset of `filter`.
    pub fn metrics(&self, filter: &LabelSet) -> Vec<Metric> {
        let registry = self.registry.lock();

        registry
            .metrics
            .iter()
            .filter(|(_, entry)| labels::matches(&entry.labels, filter))
            .map(|(id, entry)| metric_from_entry(*id, entry))
            .collect()
    }

    /// Returns the samples of the metric with the given labels within
    /// `[start, end]` inclusive.
    pub fn points(
        &self,
        metric_labels: &LabelSet,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Point>, StoreError> {
        let id = fingerprint(metric_labels);
        let samples = self.registry.lock().points.get_all(id)?;

        Ok(samples
            .into_iter()
            .filter_map(|(t, value)| {
                let time = DateTime::from_timestamp_millis(t)?;

                (start <= time && time <= end).then_some(Point { time, value })
            })
            .collect())
    }

    /// Deletes exactly the metrics whose label set equals one of the
    /// arguments.
    pub fn drop_metrics(&self, label_sets: &[LabelSet]) {
        let mut registry = self.registry.lock();

        for labels in label_sets {
            let id = fingerprint(labels);

            registry.metrics.remove(&id);
            registry.points.drop_series(id);
        }
    }

    /// Deletes every metric.
    pub fn drop_all(&self) {
        let mut registry = self.registry.lock();

        registry.metrics.clear();
        registry.points.clear();
    }

    /// Number of registered metrics.
    pub fn metrics_count(&self) -> usize {
        self.registry.lock().metrics.len()
    }

    /// Registers a callback invoked with every accepted batch. Returns the
    /// notifiee id, a small positive integer unique per store instance.
    pub fn add_notifiee(&self, callback: NotifieeFn) -> u32 {
        let mut notifiees = self.notifiees.lock();

        notifiees.next_id += 1;
        let id = notifiees.next_id;
        notifiees.callbacks.insert(id, callback);

        id
    }

    /// Unregisters a notifiee.
    pub fn remove_notifiee(&self, id: u32) {
        self.notifiees.lock().callbacks.remove(&id);
    }

    /// Sets the callback reporting metrics seen for the first time.
    pub fn set_new_metric_callback(&self, callback: Option<NewMetricFn>) {
        *self.new_metric.lock() = callback;
    }

    /// Runs one garbage collection pass with `now` as the reference time.
    ///
    /// Evicts points older than `max_points_age`; purges metrics with no
    /// remaining points that have been idle for at least `max_metrics_age`.
    pub fn run_once(&self, now: DateTime<Utc>) {
        let points_cutoff = now - self.max_points_age;
        let mut registry = self.registry.lock();

        let ids: Vec<u64> = registry.metrics.keys().copied().collect();

        for id in ids {
            let samples = match registry.points.get_all(id) {
                Ok(samples) => samples,
                Err(err) => {
                    log::warn!("dropping undecodable series"; "metric_id" => id, "error" => %err);
                    registry.points.drop_series(id);
                    Vec::new()
                }
            };

            let kept: Vec<(i64, f64)> = samples
                .into_iter()
                .filter(|(t, _)| *t >= points_cutoff.timestamp_millis())
                .collect();

            if kept.is_empty() {
                registry.points.drop_series(id);

                let idle_since = registry
                    .metrics
                    .get(&id)
                    .map(|entry| entry.last_point_at)
                    .unwrap_or(now);

                let idle_for = (now - idle_since).to_std().unwrap_or_default();
                if idle_for >= self.max_metrics_age {
                    registry.metrics.remove(&id);
                }
            } else {
                registry.points.set_all(id, &kept);
            }
        }
    }

    /// Runs the periodic garbage collector until cancellation.
    pub async fn run_gc(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_once(Utc::now()),
                _ = token.cancelled() => return,
            }
        }
    }

    fn snapshot_notifiees(&self) -> Vec<(u32, NotifieeFn)> {
        let notifiees = self.notifiees.lock();

        let mut snapshot: Vec<_> = notifiees
            .callbacks
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        // Registration order, for deterministic fan-out.
        snapshot.sort_by_key(|(id, _)| *id);
        snapshot
    }
}

fn metric_from_entry(id: u64, entry: &MetricEntry) -> Metric {
    Metric {
        id,
        labels: entry.labels.clone(),
        annotations: entry.annotations.clone(),
        created_at: entry.created_at,
        last_point_at: entry.last_point_at,
    }
}

fn truncate_to_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time)
}
