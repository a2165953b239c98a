//! Core data model shared by the write and read paths.

use std::collections::BTreeMap;

/// Name of the label that carries the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A metric identity: label name to label value.
///
/// A `BTreeMap` keeps labels sorted by name, which is the order the default
/// Carbon path encodes them in. The metric name lives under
/// [`METRIC_NAME_LABEL`] like any other label.
pub type Metric = BTreeMap<String, String>;

/// Returns the metric name, or `""` when the name label is missing.
pub fn metric_name(metric: &Metric) -> &str {
    metric
        .get(METRIC_NAME_LABEL)
        .map_or("", String::as_str)
}

/// A single sample on the write path.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Labels identifying the series.
    pub metric: Metric,
    /// The sample value.
    pub value: f64,
    /// Timestamp in milliseconds since epoch.
    pub timestamp_ms: i64,
}

impl Sample {
    /// Creates a sample from a metric name, labels, value and timestamp.
    pub fn new<I, K, V>(name: &str, labels: I, value: f64, timestamp_ms: i64) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut metric: Metric = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        metric.insert(METRIC_NAME_LABEL.to_string(), name.to_string());
        Self {
            metric,
            value,
            timestamp_ms,
        }
    }

    /// Timestamp truncated to whole seconds, as Carbon expects it.
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp_ms / 1000
    }
}
