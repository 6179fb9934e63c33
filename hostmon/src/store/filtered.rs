//! Filtering decorator over a [`Store`].
//!
//! Applies a label predicate (and optional point mapper) on every push and
//! on `metrics()` results. Everything else, including drop and notifiee
//! management, is delegated unchanged.

use super::{LabelSet, Metric, MetricPoint, NewMetricFn, NotifieeFn, Store, StoreError, labels};
use std::sync::Arc;

/// Label predicate deciding which metrics pass the filter.
pub type LabelFilterFn = Arc<dyn Fn(&LabelSet) -> bool + Send + Sync>;

/// Optional point rewriter applied before delegation.
pub type PointMapperFn = Arc<dyn Fn(MetricPoint) -> MetricPoint + Send + Sync>;

/// A thin decorator restricting what reaches (and is visible in) a store.
#[derive(Clone)]
pub struct FilteredStore {
    inner: Arc<Store>,
    filter: LabelFilterFn,
    mapper: Option<PointMapperFn>,
}

impl FilteredStore {
    /// Wraps `inner` with a label predicate.
    pub fn new(inner: Arc<Store>, filter: LabelFilterFn) -> Self {
        Self {
            inner,
            filter,
            mapper: None,
        }
    }

    /// Adds a point mapper applied after filtering, before delegation.
    pub fn with_mapper(mut self, mapper: PointMapperFn) -> Self {
        self.mapper = Some(mapper);
        self
    }

    /// Pushes the points passing the filter, mapped if a mapper is set.
    pub fn push_points(&self, points: Vec<MetricPoint>) -> Result<(), StoreError> {
        let points: Vec<MetricPoint> = points
            .into_iter()
            .filter(|point| (self.filter)(&point.labels))
            .map(|point| match &self.mapper {
                Some(mapper) => mapper(point),
                None => point,
            })
            .collect();

        if points.is_empty() {
            return Ok(());
        }

        self.inner.push_points(points)
    }

    /// Returns the matching metrics that also pass the filter.
    pub fn metrics(&self, filter: &LabelSet) -> Vec<Metric> {
        self.inner
            .metrics(filter)
            .into_iter()
            .filter(|metric| (self.filter)(&metric.labels))
            .collect()
    }

    /// Delegates to [`Store::drop_metrics`].
    pub fn drop_metrics(&self, label_sets: &[LabelSet]) {
        self.inner.drop_metrics(label_sets);
    }

    /// Delegates to [`Store::add_notifiee`].
    pub fn add_notifiee(&self, callback: NotifieeFn) -> u32 {
        self.inner.add_notifiee(callback)
    }

    /// Delegates to [`Store::remove_notifiee`].
    pub fn remove_notifiee(&self, id: u32) {
        self.inner.remove_notifiee(id);
    }

    /// Delegates to [`Store::set_new_metric_callback`].
    pub fn set_new_metric_callback(&self, callback: Option<NewMetricFn>) {
        self.inner.set_new_metric_callback(callback);
    }

    /// Convenience constructor keeping only metrics with a given name.
    pub fn with_name(inner: Arc<Store>, name: impl Into<String>) -> Self {
        let name = name.into();

        Self::new(
            inner,
            Arc::new(move |label_set: &LabelSet| {
                label_set.get(labels::NAME_LABEL) == Some(&name)
            }),
        )
    }
}
