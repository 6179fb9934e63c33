use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hostmon::store::{
    Annotations, LabelSet, MetricPoint, Store, label_set, stale_nan,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn new_store() -> Store {
    Store::new(Duration::from_secs(600), Duration::from_secs(3600))
}

fn point(labels: LabelSet, time: DateTime<Utc>, value: f64) -> MetricPoint {
    MetricPoint {
        labels,
        annotations: Annotations::default(),
        time,
        value,
    }
}

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
}

#[test]
fn metric_identity_ignores_label_order_and_distinguishes_sets() {
    let store = new_store();

    // Same pairs, different insertion order: one metric.
    let mut forward = LabelSet::new();
    forward.insert("__name__".into(), "cpu_used".into());
    forward.insert("core".into(), "0".into());

    let mut reverse = LabelSet::new();
    reverse.insert("core".into(), "0".into());
    reverse.insert("__name__".into(), "cpu_used".into());

    store
        .push_points(vec![
            point(forward, t0(), 1.0),
            point(reverse, t0() + ChronoDuration::seconds(10), 2.0),
        ])
        .unwrap();

    assert_eq!(store.metrics_count(), 1);

    // A differing value pair is a different metric.
    store
        .push_points(vec![point(
            label_set([("__name__", "cpu_used"), ("core", "1")]),
            t0(),
            1.0,
        )])
        .unwrap();

    assert_eq!(store.metrics_count(), 2);
}

#[test]
fn push_is_idempotent_per_timestamp_and_keeps_the_first_value() {
    let store = new_store();
    let labels = label_set([("__name__", "cpu_used")]);

    store.push_points(vec![point(labels.clone(), t0(), 0.5)]).unwrap();
    store.push_points(vec![point(labels.clone(), t0(), 9.9)]).unwrap();

    let points = store
        .points(&labels, t0() - ChronoDuration::hours(1), Utc::now())
        .unwrap();

    assert_eq!(points.len(), 1);
    assert_eq!(points[0].value, 0.5);
}

#[test]
fn stale_nan_deletes_the_metric() {
    let store = new_store();
    let labels = label_set([("__name__", "cpu_used")]);

    store.push_points(vec![point(labels.clone(), t0(), 0.5)]).unwrap();
    assert_eq!(store.metrics(&label_set([("__name__", "cpu_used")])).len(), 1);

    store
        .push_points(vec![point(
            labels.clone(),
            t0() + ChronoDuration::seconds(10),
            stale_nan(),
        )])
        .unwrap();

    assert!(store.metrics(&label_set([("__name__", "cpu_used")])).is_empty());
    assert_eq!(store.metrics_count(), 0);

    // An ordinary NaN is data, not a deletion request.
    store
        .push_points(vec![point(labels, t0() + ChronoDuration::seconds(20), f64::NAN)])
        .unwrap();
    assert_eq!(store.metrics_count(), 1);
}

#[test]
fn gc_evicts_old_points_and_idle_metrics() {
    let store = Store::new(Duration::from_secs(600), Duration::from_secs(3600));
    let now = Utc::now();
    let labels = label_set([("__name__", "cpu_used")]);

    store
        .push_points(vec![
            point(labels.clone(), now - ChronoDuration::minutes(20), 1.0),
            point(labels.clone(), now - ChronoDuration::minutes(1), 2.0),
        ])
        .unwrap();

    store.run_once(now);

    let points = store
        .points(&labels, now - ChronoDuration::hours(2), now)
        .unwrap();
    assert_eq!(points.len(), 1, "points older than 10m must be evicted");
    assert_eq!(points[0].value, 2.0);
    assert_eq!(store.metrics_count(), 1);

    // Pointless and idle for a whole hour: gone.
    store.run_once(now + ChronoDuration::hours(2));
    assert_eq!(store.metrics_count(), 0);
}

#[test]
fn gc_keeps_recently_idle_metrics_without_points() {
    let store = Store::new(Duration::from_secs(600), Duration::from_secs(3600));
    let now = Utc::now();
    let labels = label_set([("__name__", "cpu_used")]);

    store
        .push_points(vec![point(labels, now - ChronoDuration::minutes(20), 1.0)])
        .unwrap();

    // The only point ages out, but the metric was active less than
    // max_metrics_age ago, so the registry entry stays.
    store.run_once(now);
    assert_eq!(store.metrics_count(), 1);
}

#[test]
fn two_points_one_metric_scenario() {
    let store = new_store();
    let labels = label_set([("__name__", "cpu")]);

    store
        .push_points(vec![point(labels.clone(), t0(), 0.5)])
        .unwrap();
    store
        .push_points(vec![point(
            labels.clone(),
            t0() + ChronoDuration::seconds(10),
            0.7,
        )])
        .unwrap();

    let metrics = store.metrics(&label_set([("__name__", "cpu")]));
    assert_eq!(metrics.len(), 1);

    let points = store
        .points(&labels, t0(), t0() + ChronoDuration::seconds(10))
        .unwrap();

    assert_eq!(points.len(), 2);
    assert_eq!(points[0].value, 0.5);
    assert_eq!(points[1].value, 0.7);
}

#[test]
fn notifiees_receive_accepted_points_only() {
    let store = new_store();
    let received: Arc<Mutex<Vec<MetricPoint>>> = Arc::new(Mutex::new(Vec::new()));

    let id = {
        let received = Arc::clone(&received);

        store.add_notifiee(Arc::new(move |points: &[MetricPoint]| {
            received.lock().extend_from_slice(points);
        }))
    };

    let labels = label_set([("__name__", "cpu_used")]);

    // Second push of the same (labels, time) is dropped, so it must not
    // reach the notifiee either.
    store.push_points(vec![point(labels.clone(), t0(), 1.0)]).unwrap();
    store.push_points(vec![point(labels.clone(), t0(), 2.0)]).unwrap();

    assert_eq!(received.lock().len(), 1);

    store.remove_notifiee(id);
    store
        .push_points(vec![point(labels, t0() + ChronoDuration::seconds(10), 3.0)])
        .unwrap();

    assert_eq!(received.lock().len(), 1, "removed notifiee must not fire");
}

#[test]
fn new_metric_callback_fires_once_per_metric() {
    let store = new_store();
    let new_count = Arc::new(AtomicUsize::new(0));

    {
        let new_count = Arc::clone(&new_count);

        store.set_new_metric_callback(Some(Arc::new(move |metrics: &[hostmon::store::Metric]| {
            new_count.fetch_add(metrics.len(), Ordering::SeqCst);
        })));
    }

    let labels = label_set([("__name__", "cpu_used")]);

    store.push_points(vec![point(labels.clone(), t0(), 1.0)]).unwrap();
    store
        .push_points(vec![point(labels, t0() + ChronoDuration::seconds(10), 2.0)])
        .unwrap();

    assert_eq!(new_count.load(Ordering::SeqCst), 1);
}

#[test]
fn panicking_notifiee_does_not_corrupt_the_store() {
    let store = new_store();

    store.add_notifiee(Arc::new(|_: &[MetricPoint]| {
        panic!("misbehaving notifiee");
    }));

    let delivered = Arc::new(AtomicUsize::new(0));
    {
        let delivered = Arc::clone(&delivered);

        store.add_notifiee(Arc::new(move |points: &[MetricPoint]| {
            delivered.fetch_add(points.len(), Ordering::SeqCst);
        }));
    }

    let labels = label_set([("__name__", "cpu_used")]);
    store.push_points(vec![point(labels.clone(), t0(), 1.0)]).unwrap();

    // The push survived, later notifiees ran, and the store still works.
    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(store.metrics_count(), 1);
    store
        .push_points(vec![point(labels, t0() + ChronoDuration::seconds(10), 2.0)])
        .unwrap();
}

#[test]
fn drop_metrics_requires_exact_label_match() {
    let store = new_store();

    store
        .push_points(vec![
            point(label_set([("__name__", "cpu_used"), ("core", "0")]), t0(), 1.0),
            point(label_set([("__name__", "cpu_used"), ("core", "1")]), t0(), 2.0),
        ])
        .unwrap();

    // A subset of the labels does not match anything.
    store.drop_metrics(&[label_set([("__name__", "cpu_used")])]);
    assert_eq!(store.metrics_count(), 2);

    store.drop_metrics(&[label_set([("__name__", "cpu_used"), ("core", "0")])]);
    assert_eq!(store.metrics_count(), 1);

    store.drop_all();
    assert_eq!(store.metrics_count(), 0);
}

#[test]
fn annotations_latest_value_wins() {
    let store = new_store();
    let labels = label_set([("__name__", "service_status")]);

    let mut first = point(labels.clone(), t0(), 0.0);
    first.annotations.service_id = Some("svc-1".to_owned());

    let mut second = point(labels.clone(), t0() + ChronoDuration::seconds(10), 0.0);
    second.annotations.service_id = Some("svc-2".to_owned());

    store.push_points(vec![first]).unwrap();
    store.push_points(vec![second]).unwrap();

    let metrics = store.metrics(&labels);
    assert_eq!(metrics[0].annotations.service_id.as_deref(), Some("svc-2"));
}
