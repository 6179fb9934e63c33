//! Store-to-uplink glue.
//!
//! A store notifiee drops accepted batches into the bounded FIFO without
//! ever blocking the store (`put_nowait`; a full queue sheds the batch).
//! The forwarder task drains the queue and POSTs each batch to the vendor
//! API. Delivery is at-most-once: a failed POST is logged and the batch is
//! dropped.

use super::client::Client;
use crate::queue::Queue;
use crate::store::{MetricPoint, Store};
use crate::telemetry::log;
use reqwest::Method;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const METRIC_POINT_RESOURCE: &str = "v1/metricpoint/";

/// Registers the queue-feeding notifiee on `store`; returns the notifiee id.
pub fn attach(store: &Store, queue: Arc<Queue<Vec<MetricPoint>>>) -> u32 {
    store.add_notifiee(Arc::new(move |points: &[MetricPoint]| {
        if !queue.put_nowait(points.to_vec()) {
            log::debug!("uplink queue full, shedding batch"; "points" => points.len());
        }
    }))
}

/// Drains the queue into the vendor API until cancellation (or until the
/// queue is closed and empty).
pub async fn run(
    queue: Arc<Queue<Vec<MetricPoint>>>,
    client: Arc<Client>,
    token: CancellationToken,
) {
    while let Some(batch) = queue.get(&token).await {
        match client
            .request::<_, serde_json::Value>(Method::POST, METRIC_POINT_RESOURCE, Some(&batch))
            .await
        {
            Ok(_) => {
                log::debug!("forwarded metric batch"; "points" => batch.len());
            }
            Err(err) => {
                log::warn!("failed to forward metric batch"; "points" => batch.len(), "error" => %err);
            }
        }
    }
}
