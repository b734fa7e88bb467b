// vigil: Per-metric sample ring and aggregation

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One recorded observation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Sample {
    pub fn new(value: f64) -> Self {
        Self {
            at: Utc::now(),
            value,
            metadata: None,
        }
    }

    pub fn at(value: f64, at: DateTime<Utc>) -> Self {
        Self {
            at,
            value,
            metadata: None,
        }
    }
}

/// Aggregation applied to a window of samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Avg,
    Max,
    Min,
    Sum,
    Count,
    Last,
}

/// Window placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Fixed-length window ending at now
    Sliding,
    /// Aligned window containing now
    Tumbling,
}

impl Default for WindowKind {
    fn default() -> Self {
        WindowKind::Sliding
    }
}

/// Time window plus aggregation for queries and time-based conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeFrame {
    pub duration_secs: u64,
    pub aggregation: Aggregation,
    #[serde(default)]
    pub window: WindowKind,
}

impl TimeFrame {
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_secs as i64)
    }

    /// Start of the window containing `now`
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.window {
            WindowKind::Sliding => now - self.duration(),
            WindowKind::Tumbling => {
                let d = self.duration_secs.max(1) as i64;
                let aligned = now.timestamp() - now.timestamp().rem_euclid(d);
                DateTime::from_timestamp(aligned, 0).unwrap_or(now - self.duration())
            }
        }
    }
}

/// Bounded FIFO ring of samples for one metric name
///
/// Oldest samples are discarded on overflow; readers must tolerate
/// truncation. Insertion order is the query order.
#[derive(Debug)]
pub struct SampleRing {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples with timestamp >= since, in insertion order
    pub fn since(&self, since: DateTime<Utc>) -> Vec<Sample> {
        self.samples
            .iter()
            .filter(|s| s.at >= since)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Sample> {
        self.samples.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.back()
    }
}

/// Aggregate a window of samples; empty input yields no data
pub fn aggregate(samples: &[Sample], aggregation: Aggregation) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    match aggregation {
        Aggregation::Avg => {
            let sum: f64 = samples.iter().map(|s| s.value).sum();
            Some(sum / samples.len() as f64)
        }
        Aggregation::Sum => Some(samples.iter().map(|s| s.value).sum()),
        Aggregation::Count => Some(samples.len() as f64),
        Aggregation::Last => samples.last().map(|s| s.value),
        // max/min ignore NaN samples
        Aggregation::Max => samples
            .iter()
            .map(|s| s.value)
            .filter(|v| !v.is_nan())
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.max(v)))
            }),
        Aggregation::Min => samples
            .iter()
            .map(|s| s.value)
            .filter(|v| !v.is_nan())
            .fold(None, |acc: Option<f64>, v| {
                Some(acc.map_or(v, |a| a.min(v)))
            }),
    }
}
