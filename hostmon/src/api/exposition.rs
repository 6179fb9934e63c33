//! Prometheus text exposition over the metric store.
//!
//! Renders the latest sample of every registered metric. Pure translation:
//! no aggregation, no typing metadata, dynamic label sets as stored.

use crate::Result;
use crate::store::{LabelSet, Store};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;

/// Renders the store in the Prometheus text format.
pub fn render(store: &Store) -> Result<String> {
    let mut metrics = store.metrics(&LabelSet::new());

    metrics.sort_by(|a, b| {
        a.name()
            .cmp(b.name())
            .then_with(|| a.labels.cmp(&b.labels))
    });

    let mut out = String::with_capacity(metrics.len() * 64);

    for metric in metrics {
        let points = store.points(
            &metric.labels,
            DateTime::<Utc>::MIN_UTC,
            DateTime::<Utc>::MAX_UTC,
        )?;

        let last = match points.last() {
            Some(last) => last,
            None => continue,
        };

        out.push_str(metric.name());

        let labels: Vec<_> = metric
            .labels
            .iter()
            .filter(|(key, _)| key.as_str() != "__name__")
            .collect();

        if !labels.is_empty() {
            out.push('{');

            for (i, (key, value)) in labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }

                let _ = write!(out, "{key}=\"{}\"", escape_label_value(value));
            }

            out.push('}');
        }

        let _ = writeln!(
            out,
            " {} {}",
            format_value(last.value),
            last.time.timestamp_millis()
        );
    }

    Ok(out)
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_owned()
    } else if value == f64::INFINITY {
        "+Inf".to_owned()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_owned()
    } else {
        format!("{value}")
    }
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }

    escaped
}
