//! Per-metric encoded point storage.
//!
//! Each metric owns one XOR-compressed chunk plus a small descriptor with
//! the sample count and timestamp bounds. Appending re-encodes the chunk
//! (decode, replay, append, compact); that is O(n) per push but the store
//! retains at most `max_points_age / scrape_interval` samples per metric,
//! so n stays in the low hundreds and the compression ratio pays for it.
//!
//! The buffer owns all returned data; decoded samples are handed out as
//! fresh vectors, never as views into the encoded bytes.

use super::chunk::{ChunkError, XorDecoder, XorEncoder};
use std::collections::HashMap;

#[derive(Debug)]
struct EncodedSeries {
    bytes: Vec<u8>,
    count: usize,
    oldest: i64,
    youngest: i64,
}

/// Outcome of a push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pushed {
    /// The sample was appended.
    Appended,
    /// A sample with the same timestamp already exists; the new one was
    /// dropped and the stored value kept.
    DuplicateTimestamp,
}

/// Map of metric id to encoded series.
#[derive(Debug, Default)]
pub struct PointBuffer {
    series: HashMap<u64, EncodedSeries>,
}

impl PointBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one sample to the series of `metric_id`.
    pub fn push(&mut self, metric_id: u64, t: i64, value: f64) -> Result<Pushed, ChunkError> {
        let mut encoder = XorEncoder::new();
        let (mut oldest, mut youngest) = (t, t);

        if let Some(series) = self.series.get(&metric_id) {
            for sample in XorDecoder::new(&series.bytes)? {
                let (sample_t, sample_v) = sample?;

                if sample_t == t {
                    return Ok(Pushed::DuplicateTimestamp);
                }

                encoder.append(sample_t, sample_v);
            }

            oldest = oldest.min(series.oldest);
            youngest = youngest.max(series.youngest);
        }

        encoder.append(t, value);

        let count = usize::from(encoder.count());
        self.series.insert(
            metric_id,
            EncodedSeries {
                bytes: encoder.finish(),
                count,
                oldest,
                youngest,
            },
        );

        Ok(Pushed::Appended)
    }

    /// Returns every sample of `metric_id` in insertion order.
    pub fn get_all(&self, metric_id: u64) -> Result<Vec<(i64, f64)>, ChunkError> {
        match self.series.get(&metric_id) {
            Some(series) => XorDecoder::new(&series.bytes)?.collect(),
            None => Ok(Vec::new()),
        }
    }

    /// Returns the `index`-th sample of `metric_id`, in insertion order.
    pub fn get_one(&self, metric_id: u64, index: usize) -> Result<Option<(i64, f64)>, ChunkError> {
        let series = match self.series.get(&metric_id) {
            Some(series) => series,
            None => return Ok(None),
        };

        for (i, sample) in XorDecoder::new(&series.bytes)?.enumerate() {
            let sample = sample?;

            if i == index {
                return Ok(Some(sample));
            }
        }

        Ok(None)
    }

    /// Replaces the series of `metric_id` with the given samples. An empty
    /// slice drops the series.
    pub fn set_all(&mut self, metric_id: u64, samples: &[(i64, f64)]) {
        if samples.is_empty() {
            self.series.remove(&metric_id);
            return;
        }

        let mut encoder = XorEncoder::new();
        let mut oldest = i64::MAX;
        let mut youngest = i64::MIN;

        for (t, value) in samples {
            encoder.append(*t, *value);
            oldest = oldest.min(*t);
            youngest = youngest.max(*t);
        }

        self.series.insert(
            metric_id,
            EncodedSeries {
                bytes: encoder.finish(),
                count: samples.len(),
                oldest,
                youngest,
            },
        );
    }

    /// Drops the series of `metric_id`.
    pub fn drop_series(&mut self, metric_id: u64) {
        self.series.remove(&metric_id);
    }

    /// Drops every series.
    pub fn clear(&mut self) {
        self.series.clear();
    }

    /// Number of samples stored for `metric_id`.
    pub fn count(&self, metric_id: u64) -> usize {
        self.series.get(&metric_id).map_or(0, |series| series.count)
    }

    /// `(oldest, youngest)` timestamps of `metric_id`, if any.
    pub fn time_bounds(&self, metric_id: u64) -> Option<(i64, i64)> {
        self.series
            .get(&metric_id)
            .map(|series| (series.oldest, series.youngest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_get_all() {
        let mut buffer = PointBuffer::new();

        buffer.push(1, 1_000, 0.5).unwrap();
        buffer.push(1, 2_000, 0.7).unwrap();
        buffer.push(2, 1_500, 9.0).unwrap();

        assert_eq!(buffer.get_all(1).unwrap(), vec![(1_000, 0.5), (2_000, 0.7)]);
        assert_eq!(buffer.get_all(2).unwrap(), vec![(1_500, 9.0)]);
        assert_eq!(buffer.get_all(3).unwrap(), vec![]);
        assert_eq!(buffer.count(1), 2);
        assert_eq!(buffer.time_bounds(1), Some((1_000, 2_000)));
    }

    #[test]
    fn duplicate_timestamp_keeps_first_value() {
        let mut buffer = PointBuffer::new();

        assert_eq!(buffer.push(1, 1_000, 0.5).unwrap(), Pushed::Appended);
        assert_eq!(
            buffer.push(1, 1_000, 9.9).unwrap(),
            Pushed::DuplicateTimestamp
        );

        assert_eq!(buffer.get_all(1).unwrap(), vec![(1_000, 0.5)]);
    }

    #[test]
    fn get_one_by_index() {
        let mut buffer = PointBuffer::new();

        buffer.push(1, 1_000, 0.5).unwrap();
        buffer.push(1, 2_000, 0.7).unwrap();

        assert_eq!(buffer.get_one(1, 1).unwrap(), Some((2_000, 0.7)));
        assert_eq!(buffer.get_one(1, 2).unwrap(), None);
        assert_eq!(buffer.get_one(9, 0).unwrap(), None);
    }

    #[test]
    fn set_all_replaces_and_empty_drops() {
        let mut buffer = PointBuffer::new();

        buffer.push(1, 1_000, 0.5).unwrap();
        buffer.set_all(1, &[(5_000, 1.0), (6_000, 2.0)]);

        assert_eq!(buffer.get_all(1).unwrap(), vec![(5_000, 1.0), (6_000, 2.0)]);
        assert_eq!(buffer.time_bounds(1), Some((5_000, 6_000)));

        buffer.set_all(1, &[]);
        assert_eq!(buffer.count(1), 0);
        assert_eq!(buffer.time_bounds(1), None);
    }

    #[test]
    fn drop_series_forgets_the_metric() {
        let mut buffer = PointBuffer::new();

        buffer.push(1, 1_000, 0.5).unwrap();
        buffer.drop_series(1);

        assert_eq!(buffer.get_all(1).unwrap(), vec![]);
    }
}
