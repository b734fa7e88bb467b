// vigil: Metric registry

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::metrics::ring::{aggregate, Sample, SampleRing, TimeFrame};

/// Metric kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

/// Summary quantile with its allowed error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantile {
    pub quantile: f64,
    pub tolerance: f64,
}

/// Immutable identity and shape of a registered metric
///
/// Identity is (name, subsystem, label-key-set); shape additionally carries
/// the kind, histogram buckets, and summary quantiles. Help text is not part
/// of the shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricShape {
    pub kind: MetricKind,
    pub name: String,
    #[serde(default)]
    pub subsystem: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub label_keys: Vec<String>,
    /// Histogram buckets, ascending upper bounds (histograms only)
    #[serde(default)]
    pub buckets: Vec<f64>,
    /// Summary quantiles (summaries only)
    #[serde(default)]
    pub quantiles: Vec<Quantile>,
}

impl MetricShape {
    pub fn counter(name: &str, help: &str) -> Self {
        Self {
            kind: MetricKind::Counter,
            name: name.to_string(),
            subsystem: String::new(),
            help: help.to_string(),
            label_keys: Vec::new(),
            buckets: Vec::new(),
            quantiles: Vec::new(),
        }
    }

    pub fn gauge(name: &str, help: &str) -> Self {
        Self {
            kind: MetricKind::Gauge,
            ..Self::counter(name, help)
        }
    }

    pub fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Self {
        Self {
            kind: MetricKind::Histogram,
            buckets,
            ..Self::counter(name, help)
        }
    }

    pub fn summary(name: &str, help: &str, quantiles: Vec<Quantile>) -> Self {
        Self {
            kind: MetricKind::Summary,
            quantiles,
            ..Self::counter(name, help)
        }
    }

    pub fn with_labels(mut self, keys: &[&str]) -> Self {
        self.label_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_subsystem(mut self, subsystem: &str) -> Self {
        self.subsystem = subsystem.to_string();
        self
    }

    fn same_shape(&self, other: &MetricShape) -> bool {
        self.kind == other.kind
            && self.name == other.name
            && self.subsystem == other.subsystem
            && self.label_keys == other.label_keys
            && self.buckets == other.buckets
            && self.quantiles == other.quantiles
    }

    fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::InvalidInput("metric name is empty".to_string()));
        }
        match self.kind {
            MetricKind::Histogram => {
                if self.buckets.is_empty() {
                    return Err(CoreError::InvalidInput(format!(
                        "histogram {} has no buckets",
                        self.name
                    )));
                }
                if self.buckets.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(CoreError::InvalidInput(format!(
                        "histogram {} buckets must be strictly ascending",
                        self.name
                    )));
                }
            }
            MetricKind::Summary => {
                if self.quantiles.is_empty() {
                    return Err(CoreError::InvalidInput(format!(
                        "summary {} has no quantiles",
                        self.name
                    )));
                }
                for q in &self.quantiles {
                    if !(0.0..=1.0).contains(&q.quantile) {
                        return Err(CoreError::InvalidInput(format!(
                            "summary {} quantile {} out of range",
                            self.name, q.quantile
                        )));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Handle returned by registration; cheap to clone
#[derive(Debug, Clone)]
pub struct MetricHandle {
    name: Arc<str>,
}

impl MetricHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

const SUMMARY_WINDOW: usize = 512;

#[derive(Debug)]
enum Series {
    Counter(f64),
    Gauge(f64),
    Histogram {
        bucket_counts: Vec<u64>,
        sum: f64,
        count: u64,
    },
    Summary {
        window: std::collections::VecDeque<f64>,
        sum: f64,
        count: u64,
    },
}

impl Series {
    fn new(shape: &MetricShape) -> Self {
        match shape.kind {
            MetricKind::Counter => Series::Counter(0.0),
            MetricKind::Gauge => Series::Gauge(0.0),
            MetricKind::Histogram => Series::Histogram {
                bucket_counts: vec![0; shape.buckets.len() + 1],
                sum: 0.0,
                count: 0,
            },
            MetricKind::Summary => Series::Summary {
                window: std::collections::VecDeque::with_capacity(SUMMARY_WINDOW),
                sum: 0.0,
                count: 0,
            },
        }
    }

    fn observe(&mut self, buckets: &[f64], value: f64) -> CoreResult<()> {
        match self {
            Series::Counter(total) => {
                if value < 0.0 {
                    return Err(CoreError::InvalidInput(
                        "counter increment must be non-negative".to_string(),
                    ));
                }
                *total += value;
            }
            Series::Gauge(current) => *current = value,
            Series::Histogram {
                bucket_counts,
                sum,
                count,
            } => {
                let idx = buckets
                    .iter()
                    .position(|b| value <= *b)
                    .unwrap_or(buckets.len());
                bucket_counts[idx] += 1;
                *sum += value;
                *count += 1;
            }
            Series::Summary { window, sum, count } => {
                if window.len() == SUMMARY_WINDOW {
                    window.pop_front();
                }
                window.push_back(value);
                *sum += value;
                *count += 1;
            }
        }
        Ok(())
    }
}

struct Metric {
    shape: MetricShape,
    series: Mutex<HashMap<Vec<String>, Series>>,
    ring: Mutex<SampleRing>,
}

/// Exported view of one series
#[derive(Debug, Clone, Serialize)]
pub struct SeriesSnapshot {
    pub label_values: Vec<String>,
    pub value: SeriesValue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        /// Cumulative counts per upper bound, +Inf last
        cumulative: Vec<u64>,
        sum: f64,
        count: u64,
    },
    Summary {
        /// (quantile, estimated value)
        quantiles: Vec<(f64, f64)>,
        sum: f64,
        count: u64,
    },
}

/// Exported view of one metric with all its series
#[derive(Debug, Clone, Serialize)]
pub struct MetricFamily {
    pub shape: MetricShape,
    pub series: Vec<SeriesSnapshot>,
}

/// Compact per-metric overview for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct MetricOverview {
    pub name: String,
    pub kind: MetricKind,
    pub sample_count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub last: Option<f64>,
}

/// Metric registry and per-name sample rings
///
/// Registration is idempotent for an identical shape and a conflict for a
/// differing one. Observations update the typed series and append to the
/// metric's bounded ring, which backs `history` and `query`.
pub struct MetricRegistry {
    metrics: RwLock<HashMap<String, Arc<Metric>>>,
    ring_capacity: usize,
}

impl MetricRegistry {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            metrics: RwLock::new(HashMap::new()),
            ring_capacity: ring_capacity.max(1),
        }
    }

    /// Register a metric, failing with Conflict if the name is taken with a
    /// different shape
    pub fn register(&self, shape: MetricShape) -> CoreResult<MetricHandle> {
        shape.validate()?;
        let mut metrics = self.metrics.write();
        if let Some(existing) = metrics.get(&shape.name) {
            if existing.shape.same_shape(&shape) {
                return Ok(MetricHandle {
                    name: Arc::from(shape.name.as_str()),
                });
            }
            return Err(CoreError::Conflict(format!(
                "metric {} already registered with a different shape",
                shape.name
            )));
        }
        let name = shape.name.clone();
        metrics.insert(
            name.clone(),
            Arc::new(Metric {
                shape,
                series: Mutex::new(HashMap::new()),
                ring: Mutex::new(SampleRing::new(self.ring_capacity)),
            }),
        );
        Ok(MetricHandle {
            name: Arc::from(name.as_str()),
        })
    }

    /// Remove a metric and its ring
    pub fn unregister(&self, name: &str) -> CoreResult<()> {
        if self.metrics.write().remove(name).is_none() {
            return Err(CoreError::NotFound(format!("metric {}", name)));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.metrics.read().contains_key(name)
    }

    /// Record an observation at now
    pub fn observe(&self, handle: &MetricHandle, label_values: &[&str], value: f64) -> CoreResult<()> {
        self.observe_at(handle, label_values, value, Utc::now())
    }

    /// Record an observation with an explicit timestamp (back-dating is
    /// allowed for tests; queries assume insertion order)
    pub fn observe_at(
        &self,
        handle: &MetricHandle,
        label_values: &[&str],
        value: f64,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let metric = self
            .metrics
            .read()
            .get(handle.name())
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("metric {}", handle.name())))?;

        if label_values.len() != metric.shape.label_keys.len() {
            return Err(CoreError::InvalidInput(format!(
                "metric {} expects {} label values, got {}",
                metric.shape.name,
                metric.shape.label_keys.len(),
                label_values.len()
            )));
        }

        {
            let mut series = metric.series.lock();
            let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
            series
                .entry(key)
                .or_insert_with(|| Series::new(&metric.shape))
                .observe(&metric.shape.buckets, value)?;
        }
        metric.ring.lock().push(Sample::at(value, at));
        Ok(())
    }

    /// Ordered samples with timestamp >= now - duration
    pub fn history(&self, name: &str, duration: chrono::Duration) -> Vec<Sample> {
        let metric = match self.metrics.read().get(name).cloned() {
            Some(m) => m,
            None => return Vec::new(),
        };
        let since = Utc::now() - duration;
        let result = metric.ring.lock().since(since);
        result
    }

    /// Aggregated scalar over the timeframe's window; None means no data
    pub fn query(&self, name: &str, timeframe: &TimeFrame) -> Option<f64> {
        let metric = self.metrics.read().get(name).cloned()?;
        let since = timeframe.window_start(Utc::now());
        let samples = metric.ring.lock().since(since);
        aggregate(&samples, timeframe.aggregation)
    }

    /// Most recent sample value for a metric
    pub fn last_value(&self, name: &str) -> Option<f64> {
        let metric = self.metrics.read().get(name).cloned()?;
        let ring = metric.ring.lock();
        ring.last().map(|s| s.value)
    }

    /// Snapshot of every metric and series, suitable for export
    pub fn gather(&self) -> Vec<MetricFamily> {
        let metrics: Vec<Arc<Metric>> = self.metrics.read().values().cloned().collect();
        let mut families: Vec<MetricFamily> = metrics
            .iter()
            .map(|metric| {
                let series = metric.series.lock();
                let mut snapshots: Vec<SeriesSnapshot> = series
                    .iter()
                    .map(|(labels, s)| SeriesSnapshot {
                        label_values: labels.clone(),
                        value: snapshot_series(s, &metric.shape),
                    })
                    .collect();
                snapshots.sort_by(|a, b| a.label_values.cmp(&b.label_values));
                MetricFamily {
                    shape: metric.shape.clone(),
                    series: snapshots,
                }
            })
            .collect();
        families.sort_by(|a, b| a.shape.name.cmp(&b.shape.name));
        families
    }

    /// Per-metric overview built from the sample rings
    pub fn overview(&self) -> Vec<MetricOverview> {
        let metrics: Vec<Arc<Metric>> = self.metrics.read().values().cloned().collect();
        let mut out: Vec<MetricOverview> = metrics
            .iter()
            .map(|metric| {
                let ring = metric.ring.lock();
                let samples = ring.all();
                MetricOverview {
                    name: metric.shape.name.clone(),
                    kind: metric.shape.kind,
                    sample_count: samples.len(),
                    min: aggregate(&samples, crate::metrics::ring::Aggregation::Min),
                    max: aggregate(&samples, crate::metrics::ring::Aggregation::Max),
                    avg: aggregate(&samples, crate::metrics::ring::Aggregation::Avg),
                    last: aggregate(&samples, crate::metrics::ring::Aggregation::Last),
                }
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn snapshot_series(series: &Series, shape: &MetricShape) -> SeriesValue {
    match series {
        Series::Counter(v) => SeriesValue::Counter(*v),
        Series::Gauge(v) => SeriesValue::Gauge(*v),
        Series::Histogram {
            bucket_counts,
            sum,
            count,
        } => {
            let mut cumulative = Vec::with_capacity(bucket_counts.len());
            let mut running = 0u64;
            for c in bucket_counts {
                running += c;
                cumulative.push(running);
            }
            SeriesValue::Histogram {
                cumulative,
                sum: *sum,
                count: *count,
            }
        }
        Series::Summary { window, sum, count } => {
            let mut sorted: Vec<f64> = window.iter().copied().filter(|v| !v.is_nan()).collect();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let quantiles = shape
                .quantiles
                .iter()
                .map(|q| {
                    let value = if sorted.is_empty() {
                        f64::NAN
                    } else {
                        let rank = (q.quantile * (sorted.len() - 1) as f64).round() as usize;
                        sorted[rank.min(sorted.len() - 1)]
                    };
                    (q.quantile, value)
                })
                .collect();
            SeriesValue::Summary {
                quantiles,
                sum: *sum,
                count: *count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ring::{Aggregation, WindowKind};

    fn registry() -> MetricRegistry {
        MetricRegistry::new(1000)
    }

    #[test]
    fn test_register_idempotent_same_shape() {
        let reg = registry();
        let first = reg.register(MetricShape::gauge("cpu", "cpu usage")).unwrap();
        let second = reg.register(MetricShape::gauge("cpu", "cpu usage again")).unwrap();
        assert_eq!(first.name(), second.name());
    }

    #[test]
    fn test_register_conflicting_shape_fails() {
        let reg = registry();
        reg.register(MetricShape::gauge("cpu", "cpu usage")).unwrap();
        let err = reg
            .register(MetricShape::counter("cpu", "cpu usage"))
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn test_observe_rejects_label_cardinality_mismatch() {
        let reg = registry();
        let h = reg
            .register(MetricShape::counter("requests", "req count").with_labels(&["method"]))
            .unwrap();
        let err = reg.observe(&h, &[], 1.0).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
        reg.observe(&h, &["GET"], 1.0).unwrap();
    }

    #[test]
    fn test_counter_rejects_negative_and_accumulates() {
        let reg = registry();
        let h = reg.register(MetricShape::counter("hits", "hits")).unwrap();
        reg.observe(&h, &[], 2.0).unwrap();
        reg.observe(&h, &[], 3.0).unwrap();
        assert!(reg.observe(&h, &[], -1.0).is_err());

        let families = reg.gather();
        match &families[0].series[0].value {
            SeriesValue::Counter(v) => assert_eq!(*v, 5.0),
            other => panic!("unexpected series: {:?}", other),
        }
    }

    #[test]
    fn test_register_observe_gather_roundtrip() {
        let reg = registry();
        let h = reg
            .register(MetricShape::gauge("queue_depth", "queue depth").with_labels(&["queue"]))
            .unwrap();
        reg.observe(&h, &["deliveries"], 7.0).unwrap();

        let families = reg.gather();
        assert_eq!(families.len(), 1);
        let snap = &families[0].series[0];
        assert_eq!(snap.label_values, vec!["deliveries".to_string()]);
        match &snap.value {
            SeriesValue::Gauge(v) => assert_eq!(*v, 7.0),
            other => panic!("unexpected series: {:?}", other),
        }
    }

    #[test]
    fn test_histogram_buckets_cumulative() {
        let reg = registry();
        let h = reg
            .register(MetricShape::histogram(
                "latency",
                "latency seconds",
                vec![0.1, 0.5, 1.0],
            ))
            .unwrap();
        for v in [0.05, 0.2, 0.7, 5.0] {
            reg.observe(&h, &[], v).unwrap();
        }
        let families = reg.gather();
        match &families[0].series[0].value {
            SeriesValue::Histogram {
                cumulative,
                sum,
                count,
            } => {
                assert_eq!(cumulative, &vec![1, 2, 3, 4]);
                assert!((sum - 5.95).abs() < 1e-9);
                assert_eq!(*count, 4);
            }
            other => panic!("unexpected series: {:?}", other),
        }
    }

    #[test]
    fn test_summary_quantiles() {
        let reg = registry();
        let h = reg
            .register(MetricShape::summary(
                "resp",
                "response time",
                vec![
                    Quantile {
                        quantile: 0.5,
                        tolerance: 0.05,
                    },
                    Quantile {
                        quantile: 0.99,
                        tolerance: 0.001,
                    },
                ],
            ))
            .unwrap();
        for v in 1..=100 {
            reg.observe(&h, &[], v as f64).unwrap();
        }
        let families = reg.gather();
        match &families[0].series[0].value {
            SeriesValue::Summary {
                quantiles, count, ..
            } => {
                assert_eq!(*count, 100);
                let median = quantiles.iter().find(|(q, _)| *q == 0.5).unwrap().1;
                assert!((49.0..=52.0).contains(&median));
            }
            other => panic!("unexpected series: {:?}", other),
        }
    }

    #[test]
    fn test_query_last_on_empty_history_is_no_data() {
        let reg = registry();
        reg.register(MetricShape::gauge("idle", "idle")).unwrap();
        let tf = TimeFrame {
            duration_secs: 60,
            aggregation: Aggregation::Last,
            window: WindowKind::Sliding,
        };
        assert_eq!(reg.query("idle", &tf), None);
        assert_eq!(reg.query("missing", &tf), None);
    }

    #[test]
    fn test_history_window() {
        let reg = registry();
        let h = reg.register(MetricShape::gauge("mem", "memory")).unwrap();
        let now = Utc::now();
        reg.observe_at(&h, &[], 1.0, now - chrono::Duration::minutes(10))
            .unwrap();
        reg.observe_at(&h, &[], 2.0, now - chrono::Duration::minutes(2))
            .unwrap();
        reg.observe_at(&h, &[], 3.0, now).unwrap();

        let recent = reg.history("mem", chrono::Duration::minutes(5));
        let values: Vec<f64> = recent.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
    }
}
