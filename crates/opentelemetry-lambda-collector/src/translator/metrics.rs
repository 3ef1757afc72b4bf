//! FaaS metric aggregation.
//!
//! Platform events are folded into in-memory counters and histograms that
//! are emitted after every batch. Under cumulative temporality a series is
//! only emitted in the batch that updated it; under delta temporality every
//! series is emitted and the aggregation restarts at the emission time.

use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Histogram, HistogramDataPoint, Metric, NumberDataPoint, Sum,
    metric::Data, number_data_point,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const MIB: f64 = (1u64 << 20) as f64;
const GIB: f64 = (1u64 << 30) as f64;

/// Bounds used when a histogram does not specify its own.
pub const DEFAULT_BOUNDS: [f64; 15] = [
    0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0, 7500.0,
    10000.0,
];

/// Bounds for durations in seconds.
pub const DURATION_BOUNDS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Bounds for memory usage in bytes.
pub const MEMORY_BOUNDS: [f64; 13] = [
    16.0 * MIB,
    32.0 * MIB,
    64.0 * MIB,
    128.0 * MIB,
    256.0 * MIB,
    512.0 * MIB,
    768.0 * MIB,
    GIB,
    2.0 * GIB,
    3.0 * GIB,
    4.0 * GIB,
    6.0 * GIB,
    8.0 * GIB,
];

/// Aggregation temporality of the emitted sums and histograms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temporality {
    /// Values accumulate from process start.
    #[default]
    Cumulative,
    /// Values cover only the interval since the previous emission.
    Delta,
}

impl Temporality {
    fn to_proto(self) -> i32 {
        match self {
            Temporality::Cumulative => AggregationTemporality::Cumulative as i32,
            Temporality::Delta => AggregationTemporality::Delta as i32,
        }
    }
}

impl FromStr for Temporality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cumulative" => Ok(Temporality::Cumulative),
            "delta" => Ok(Temporality::Delta),
            other => Err(format!("unknown temporality '{other}'")),
        }
    }
}

impl fmt::Display for Temporality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Temporality::Cumulative => "cumulative",
            Temporality::Delta => "delta",
        })
    }
}

/// Returns the index of the bucket `value` falls into.
///
/// Bucket `i` covers `(bounds[i-1], bounds[i]]`; values above the last bound
/// land in the overflow bucket at `bounds.len()`.
pub fn bucket_index(bounds: &[f64], value: f64) -> usize {
    bounds.partition_point(|bound| *bound < value)
}

/// Series are keyed by their attributes, encoded as sorted `key=value` pairs.
type SeriesKey = Vec<(String, String)>;

fn series_key(attributes: &[KeyValue]) -> SeriesKey {
    let mut key: SeriesKey = attributes
        .iter()
        .map(|kv| (kv.key.clone(), format!("{:?}", kv.value)))
        .collect();
    key.sort();
    key
}

#[derive(Debug, Clone)]
struct HistogramPoint {
    attributes: Vec<KeyValue>,
    counts: Vec<u64>,
    count: u64,
    sum: f64,
    start_time: u64,
    last_updated: u64,
}

/// Aggregates observations into an explicit-bucket histogram.
#[derive(Debug, Clone)]
pub struct HistogramBuilder {
    name: &'static str,
    description: &'static str,
    unit: &'static str,
    bounds: Vec<f64>,
    points: BTreeMap<SeriesKey, HistogramPoint>,
    temporality: Temporality,
    start_time: u64,
    epoch: u64,
}

impl HistogramBuilder {
    /// Creates a histogram. `None` bounds selects [`DEFAULT_BOUNDS`].
    pub fn new(
        name: &'static str,
        description: &'static str,
        unit: &'static str,
        bounds: Option<&[f64]>,
        temporality: Temporality,
        start_time: u64,
    ) -> Self {
        Self {
            name,
            description,
            unit,
            bounds: bounds.unwrap_or(&DEFAULT_BOUNDS).to_vec(),
            points: BTreeMap::new(),
            temporality,
            start_time,
            epoch: 0,
        }
    }

    /// Records one observation without attributes.
    pub fn record(&mut self, value: f64) {
        self.record_with_attributes(value, Vec::new());
    }

    /// Records one observation for the series identified by `attributes`.
    pub fn record_with_attributes(&mut self, value: f64, attributes: Vec<KeyValue>) {
        let buckets = self.bounds.len() + 1;
        let bucket = bucket_index(&self.bounds, value);
        let (start_time, epoch) = (self.start_time, self.epoch);

        let point = self
            .points
            .entry(series_key(&attributes))
            .or_insert_with(|| HistogramPoint {
                attributes,
                counts: vec![0; buckets],
                count: 0,
                sum: 0.0,
                start_time,
                last_updated: epoch,
            });
        point.counts[bucket] += 1;
        point.count += 1;
        point.sum += value;
        point.last_updated = epoch;
    }

    /// Emits the histogram at `timestamp`, or `None` when nothing is due.
    pub fn collect(&mut self, timestamp: u64) -> Option<Metric> {
        let epoch = self.epoch;
        let data_points: Vec<HistogramDataPoint> = self
            .points
            .values()
            .filter(|p| self.temporality == Temporality::Delta || p.last_updated == epoch)
            .map(|p| HistogramDataPoint {
                attributes: p.attributes.clone(),
                start_time_unix_nano: p.start_time,
                time_unix_nano: timestamp,
                count: p.count,
                sum: Some(p.sum),
                bucket_counts: p.counts.clone(),
                explicit_bounds: self.bounds.clone(),
                ..Default::default()
            })
            .collect();

        self.advance(timestamp);

        if data_points.is_empty() {
            return None;
        }

        Some(Metric {
            name: self.name.to_string(),
            description: self.description.to_string(),
            unit: self.unit.to_string(),
            data: Some(Data::Histogram(Histogram {
                data_points,
                aggregation_temporality: self.temporality.to_proto(),
            })),
            ..Default::default()
        })
    }

    fn advance(&mut self, timestamp: u64) {
        match self.temporality {
            Temporality::Delta => {
                self.points.clear();
                self.start_time = timestamp;
                self.epoch = 0;
            }
            Temporality::Cumulative => self.epoch += 1,
        }
    }
}

#[derive(Debug, Clone)]
struct CounterPoint {
    attributes: Vec<KeyValue>,
    total: i64,
    start_time: u64,
    last_updated: u64,
}

/// Aggregates increments into a monotonic integer sum.
#[derive(Debug, Clone)]
pub struct CounterBuilder {
    name: &'static str,
    description: &'static str,
    unit: &'static str,
    points: BTreeMap<SeriesKey, CounterPoint>,
    temporality: Temporality,
    start_time: u64,
    epoch: u64,
}

impl CounterBuilder {
    /// Creates a counter.
    pub fn new(
        name: &'static str,
        description: &'static str,
        unit: &'static str,
        temporality: Temporality,
        start_time: u64,
    ) -> Self {
        Self {
            name,
            description,
            unit,
            points: BTreeMap::new(),
            temporality,
            start_time,
            epoch: 0,
        }
    }

    /// Adds `value` to the series without attributes.
    pub fn add(&mut self, value: i64) {
        self.add_with_attributes(value, Vec::new());
    }

    /// Adds `value` to the series identified by `attributes`.
    pub fn add_with_attributes(&mut self, value: i64, attributes: Vec<KeyValue>) {
        let (start_time, epoch) = (self.start_time, self.epoch);
        let point = self
            .points
            .entry(series_key(&attributes))
            .or_insert_with(|| CounterPoint {
                attributes,
                total: 0,
                start_time,
                last_updated: epoch,
            });
        point.total += value;
        point.last_updated = epoch;
    }

    /// Emits the sum at `timestamp`, or `None` when nothing is due.
    pub fn collect(&mut self, timestamp: u64) -> Option<Metric> {
        let epoch = self.epoch;
        let data_points: Vec<NumberDataPoint> = self
            .points
            .values()
            .filter(|p| self.temporality == Temporality::Delta || p.last_updated == epoch)
            .map(|p| NumberDataPoint {
                attributes: p.attributes.clone(),
                start_time_unix_nano: p.start_time,
                time_unix_nano: timestamp,
                value: Some(number_data_point::Value::AsInt(p.total)),
                ..Default::default()
            })
            .collect();

        match self.temporality {
            Temporality::Delta => {
                self.points.clear();
                self.start_time = timestamp;
                self.epoch = 0;
            }
            Temporality::Cumulative => self.epoch += 1,
        }

        if data_points.is_empty() {
            return None;
        }

        Some(Metric {
            name: self.name.to_string(),
            description: self.description.to_string(),
            unit: self.unit.to_string(),
            data: Some(Data::Sum(Sum {
                data_points,
                aggregation_temporality: self.temporality.to_proto(),
                is_monotonic: true,
            })),
            ..Default::default()
        })
    }
}

/// The FaaS metric set derived from platform events.
#[derive(Debug, Clone)]
pub struct FaasMetrics {
    /// `faas.invoke_duration`, seconds.
    pub invoke_duration: HistogramBuilder,
    /// `faas.init_duration`, seconds.
    pub init_duration: HistogramBuilder,
    /// `faas.mem_usage`, bytes.
    pub mem_usage: HistogramBuilder,
    /// `faas.coldstarts`.
    pub coldstarts: CounterBuilder,
    /// `faas.errors`.
    pub errors: CounterBuilder,
    /// `faas.invocations`.
    pub invocations: CounterBuilder,
    /// `faas.timeouts`.
    pub timeouts: CounterBuilder,
}

impl FaasMetrics {
    /// Creates the metric set, with every series starting at `start_time`.
    pub fn new(temporality: Temporality, start_time: u64) -> Self {
        Self {
            invoke_duration: HistogramBuilder::new(
                "faas.invoke_duration",
                "Measures the duration of the function's logic execution",
                "s",
                Some(&DURATION_BOUNDS),
                temporality,
                start_time,
            ),
            init_duration: HistogramBuilder::new(
                "faas.init_duration",
                "Measures the duration of the function's initialization, such as a cold start",
                "s",
                Some(&DURATION_BOUNDS),
                temporality,
                start_time,
            ),
            mem_usage: HistogramBuilder::new(
                "faas.mem_usage",
                "Distribution of max memory usage per invocation",
                "By",
                Some(&MEMORY_BOUNDS),
                temporality,
                start_time,
            ),
            coldstarts: CounterBuilder::new(
                "faas.coldstarts",
                "Number of invocation cold starts",
                "{coldstart}",
                temporality,
                start_time,
            ),
            errors: CounterBuilder::new(
                "faas.errors",
                "Number of invocation errors",
                "{error}",
                temporality,
                start_time,
            ),
            invocations: CounterBuilder::new(
                "faas.invocations",
                "Number of successful invocations",
                "{invocation}",
                temporality,
                start_time,
            ),
            timeouts: CounterBuilder::new(
                "faas.timeouts",
                "Number of invocation timeouts",
                "{timeout}",
                temporality,
                start_time,
            ),
        }
    }

    /// Collects every metric that is due at `timestamp`.
    pub fn collect(&mut self, timestamp: u64) -> Vec<Metric> {
        [
            self.invoke_duration.collect(timestamp),
            self.init_duration.collect(timestamp),
            self.mem_usage.collect(timestamp),
            self.coldstarts.collect(timestamp),
            self.errors.collect(timestamp),
            self.invocations.collect(timestamp),
            self.timeouts.collect(timestamp),
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn histogram_points(metric: &Metric) -> &[HistogramDataPoint] {
        match &metric.data {
            Some(Data::Histogram(h)) => &h.data_points,
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    fn sum_points(metric: &Metric) -> &[NumberDataPoint] {
        match &metric.data {
            Some(Data::Sum(s)) => &s.data_points,
            other => panic!("expected sum, got {other:?}"),
        }
    }

    #[test]
    fn test_bucket_upper_bound_inclusive() {
        assert_eq!(bucket_index(&DURATION_BOUNDS, 0.001), 0);
        assert_eq!(bucket_index(&DURATION_BOUNDS, 0.005), 0);
        assert_eq!(bucket_index(&DURATION_BOUNDS, 0.006), 1);
        assert_eq!(bucket_index(&DURATION_BOUNDS, 10.0), 13);
        assert_eq!(bucket_index(&DURATION_BOUNDS, 10.5), 14);
    }

    #[test]
    fn test_memory_bucket() {
        // 128 MB lands in the (64 MiB, 128 MiB] bucket.
        assert_eq!(bucket_index(&MEMORY_BOUNDS, 128_000_000.0), 3);
    }

    #[test]
    fn test_default_bounds_selected() {
        let mut h = HistogramBuilder::new("h", "", "", None, Temporality::Cumulative, 0);
        h.record(7.0);
        let metric = h.collect(1).unwrap();
        let point = &histogram_points(&metric)[0];
        assert_eq!(point.explicit_bounds, DEFAULT_BOUNDS.to_vec());
        assert_eq!(point.bucket_counts.len(), DEFAULT_BOUNDS.len() + 1);
        assert_eq!(point.bucket_counts[2], 1);
    }

    #[test]
    fn test_cumulative_emits_only_updated_series() {
        let mut c = CounterBuilder::new("c", "", "{x}", Temporality::Cumulative, 10);
        c.add(1);
        let first = c.collect(20).unwrap();
        assert_eq!(sum_points(&first)[0].value, Some(number_data_point::Value::AsInt(1)));

        assert!(c.collect(30).is_none());

        c.add(2);
        let third = c.collect(40).unwrap();
        let point = &sum_points(&third)[0];
        assert_eq!(point.value, Some(number_data_point::Value::AsInt(3)));
        assert_eq!(point.start_time_unix_nano, 10);
    }

    #[test]
    fn test_cumulative_series_are_independent() {
        let mut c = CounterBuilder::new("c", "", "{x}", Temporality::Cumulative, 0);
        c.add_with_attributes(1, vec![crate::translator::kv_string("k", "a")]);
        c.add_with_attributes(1, vec![crate::translator::kv_string("k", "b")]);
        c.collect(1);

        c.add_with_attributes(1, vec![crate::translator::kv_string("k", "a")]);
        let metric = c.collect(2).unwrap();
        let points = sum_points(&metric);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, Some(number_data_point::Value::AsInt(2)));
    }

    #[test]
    fn test_delta_resets_and_advances_start() {
        let mut h = HistogramBuilder::new(
            "h",
            "",
            "s",
            Some(&DURATION_BOUNDS),
            Temporality::Delta,
            100,
        );
        h.record(0.2);
        h.record(0.3);
        let metric = h.collect(200).unwrap();
        let point = &histogram_points(&metric)[0];
        assert_eq!(point.count, 2);
        assert_eq!(point.start_time_unix_nano, 100);

        h.record(1.0);
        let metric = h.collect(300).unwrap();
        let point = &histogram_points(&metric)[0];
        assert_eq!(point.count, 1);
        assert_eq!(point.sum, Some(1.0));
        assert_eq!(point.start_time_unix_nano, 200);
        assert_eq!(
            metric.data.as_ref().map(|d| match d {
                Data::Histogram(h) => h.aggregation_temporality,
                _ => 0,
            }),
            Some(AggregationTemporality::Delta as i32)
        );
    }

    #[test]
    fn test_faas_metrics_collect_only_touched() {
        let mut metrics = FaasMetrics::new(Temporality::Cumulative, 0);
        metrics.coldstarts.add(1);
        metrics.mem_usage.record(128_000_000.0);

        let collected = metrics.collect(1);
        let names: Vec<_> = collected.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["faas.mem_usage", "faas.coldstarts"]);
        assert_eq!(collected[0].unit, "By");
        assert_eq!(collected[1].unit, "{coldstart}");
    }

    #[test]
    fn test_temporality_parse() {
        assert_eq!("DELTA".parse::<Temporality>(), Ok(Temporality::Delta));
        assert_eq!(" cumulative".parse::<Temporality>(), Ok(Temporality::Cumulative));
        assert!("lowmemory".parse::<Temporality>().is_err());
    }

    proptest! {
        #[test]
        fn bucket_counts_sum_to_count(values in prop::collection::vec(0.0f64..20.0, 1..50)) {
            let mut h = HistogramBuilder::new(
                "h", "", "s", Some(&DURATION_BOUNDS), Temporality::Cumulative, 0,
            );
            for v in &values {
                h.record(*v);
            }
            let metric = h.collect(1).unwrap();
            let point = &histogram_points(&metric)[0];
            prop_assert_eq!(point.bucket_counts.iter().sum::<u64>(), values.len() as u64);
            prop_assert_eq!(point.count, values.len() as u64);
        }
    }
}
