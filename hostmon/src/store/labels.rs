//! Label sets and metric identity.
//!
//! A label set is an unordered string map; two metrics are the same metric
//! iff their label sets are equal. Identity is the 64-bit FNV-1a hash of the
//! canonical (key-sorted) label sequence, the same convention Prometheus
//! uses for fingerprints. Collisions are not handled: the hash *is* the
//! identity.

use std::collections::BTreeMap;

/// Reserved label carrying the metric name.
pub const NAME_LABEL: &str = "__name__";

/// An unordered mapping from label names to values with unique keys.
///
/// `BTreeMap` keeps the pairs key-sorted, which is exactly the canonical
/// order fingerprinting requires.
pub type LabelSet = BTreeMap<String, String>;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
const SEPARATOR: u8 = 0xff;

/// Computes the metric identity of a label set.
pub fn fingerprint(labels: &LabelSet) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;

    for (key, value) in labels {
        for byte in key.as_bytes() {
            hash = (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME);
        }

        hash = (hash ^ u64::from(SEPARATOR)).wrapping_mul(FNV_PRIME);

        for byte in value.as_bytes() {
            hash = (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME);
        }

        hash = (hash ^ u64::from(SEPARATOR)).wrapping_mul(FNV_PRIME);
    }

    hash
}

/// Returns whether `labels` contains every pair of `filter`.
///
/// An empty filter matches everything.
pub fn matches(labels: &LabelSet, filter: &LabelSet) -> bool {
    filter
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Builds a label set from `(name, value)` pairs. Test and call-site sugar.
pub fn label_set<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> LabelSet
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}
