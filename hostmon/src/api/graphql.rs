//! GraphQL schema over the metric store. Translation only: resolvers read
//! the store and reshape, no business logic.

use crate::store::{LabelSet, NAME_LABEL, Store};
use async_graphql::{Context, EmptyMutation, EmptySubscription, InputObject, Object, Schema, SimpleObject};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The agent's GraphQL schema.
pub type ApiSchema = Schema<QueryRoot, EmptyMutation, EmptySubscription>;

/// Builds the schema with the store injected as context data.
pub fn build_schema(store: Arc<Store>) -> ApiSchema {
    Schema::build(QueryRoot, EmptyMutation, EmptySubscription)
        .data(store)
        .finish()
}

/// One label of a metric.
#[derive(SimpleObject)]
#[graphql(name = "Label")]
pub struct LabelObject {
    /// Label name.
    pub key: String,
    /// Label value.
    pub value: String,
}

/// One sample of a time series.
#[derive(SimpleObject)]
#[graphql(name = "Point")]
pub struct PointObject {
    /// Sample time.
    pub time: DateTime<Utc>,
    /// Sample value.
    pub value: f64,
}

/// A metric with its labels and points.
#[derive(SimpleObject)]
#[graphql(name = "Metric")]
pub struct MetricObject {
    /// Metric name (the `__name__` label).
    pub name: String,
    /// All labels, including `__name__`.
    pub labels: Vec<LabelObject>,
    /// Points within the queried window, oldest first.
    pub points: Vec<PointObject>,
}

/// Label equality filter.
#[derive(InputObject)]
pub struct LabelInput {
    /// Label name.
    pub key: String,
    /// Label value.
    pub value: String,
}

/// Container filter.
#[derive(InputObject)]
pub struct ContainerInput {
    /// Container id carried in the metric annotations.
    pub id: String,
}

/// Offset/limit pagination.
#[derive(InputObject)]
pub struct Pagination {
    /// Metrics to skip.
    pub offset: u64,
    /// Maximum metrics to return.
    pub limit: u64,
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// Metrics whose labels are a superset of the given filter, with their
    /// points within `[start, end]`.
    async fn metrics(
        &self,
        ctx: &Context<'_>,
        labels: Option<Vec<LabelInput>>,
        container: Option<ContainerInput>,
        pagination: Option<Pagination>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> async_graphql::Result<Vec<MetricObject>> {
        let store = ctx.data_unchecked::<Arc<Store>>();

        let filter: LabelSet = labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| (label.key, label.value))
            .collect();

        let mut metrics = store.metrics(&filter);

        if let Some(container) = &container {
            metrics.retain(|metric| {
                metric.annotations.container_id.as_deref() == Some(container.id.as_str())
            });
        }

        metrics.sort_by(|a, b| {
            a.name()
                .cmp(b.name())
                .then_with(|| a.labels.cmp(&b.labels))
        });

        if let Some(pagination) = &pagination {
            let offset = usize::try_from(pagination.offset).unwrap_or(usize::MAX);
            let limit = usize::try_from(pagination.limit).unwrap_or(usize::MAX);

            metrics = metrics
                .into_iter()
                .skip(offset)
                .take(limit)
                .collect();
        }

        let start = start.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = end.unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut out = Vec::with_capacity(metrics.len());

        for metric in metrics {
            let points = store
                .points(&metric.labels, start, end)?
                .into_iter()
                .map(|point| PointObject {
                    time: point.time,
                    value: point.value,
                })
                .collect();

            out.push(MetricObject {
                name: metric.name().to_owned(),
                labels: metric
                    .labels
                    .iter()
                    .map(|(key, value)| LabelObject {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                points,
            });
        }

        Ok(out)
    }

    /// Number of registered metrics.
    async fn metrics_count(&self, ctx: &Context<'_>) -> usize {
        ctx.data_unchecked::<Arc<Store>>().metrics_count()
    }

    /// Points of one metric, identified by its full label set.
    async fn points(
        &self,
        ctx: &Context<'_>,
        labels: Vec<LabelInput>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> async_graphql::Result<Vec<PointObject>> {
        let store = ctx.data_unchecked::<Arc<Store>>();

        let mut metric_labels = LabelSet::new();
        for label in labels {
            metric_labels.insert(label.key, label.value);
        }

        if !metric_labels.contains_key(NAME_LABEL) {
            return Err("labels must include __name__".into());
        }

        Ok(store
            .points(&metric_labels, start, end)?
            .into_iter()
            .map(|point| PointObject {
                time: point.time,
                value: point.value,
            })
            .collect())
    }
}
