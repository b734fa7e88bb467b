// vigil: Condition evaluation

use chrono::Duration;

use crate::alerts::rule::{Condition, LogicalOp};
use crate::metrics::ring::{aggregate, Sample, TimeFrame};
use crate::metrics::MetricRegistry;

/// Read access the evaluator needs; kept narrow so evaluation stays pure
pub trait MetricProvider {
    /// Current value of a metric: the latest sample, or the timeframe
    /// aggregate when one is given
    fn sample(&self, metric: &str, time_frame: Option<&TimeFrame>) -> Option<f64>;

    /// Samples within the trailing duration, insertion order
    fn history(&self, metric: &str, duration: Duration) -> Vec<Sample>;
}

impl MetricProvider for MetricRegistry {
    fn sample(&self, metric: &str, time_frame: Option<&TimeFrame>) -> Option<f64> {
        match time_frame {
            Some(tf) => self.query(metric, tf),
            None => self.last_value(metric),
        }
    }

    fn history(&self, metric: &str, duration: Duration) -> Vec<Sample> {
        MetricRegistry::history(self, metric, duration)
    }
}

/// Evaluate a condition tree against a provider
///
/// Missing samples, empty history, and NaN aggregates all evaluate to false;
/// evaluation never faults the caller.
pub fn evaluate(condition: &Condition, provider: &dyn MetricProvider) -> bool {
    match condition {
        Condition::Simple {
            metric,
            threshold,
            time_frame,
        } => match provider.sample(metric, time_frame.as_ref()) {
            Some(v) => threshold.matches(v),
            None => false,
        },
        Condition::Composite { operator, children } => match operator {
            LogicalOp::And => children.iter().all(|c| evaluate(c, provider)),
            LogicalOp::Or => children.iter().any(|c| evaluate(c, provider)),
            LogicalOp::Not => {
                // validation guarantees one child; anything else is a no-match
                if children.len() == 1 {
                    !evaluate(&children[0], provider)
                } else {
                    false
                }
            }
        },
        Condition::TimeBased {
            metric,
            time_frame,
            threshold,
        } => {
            let history = provider.history(metric, time_frame.duration());
            match aggregate(&history, time_frame.aggregation) {
                Some(v) => threshold.matches(v),
                None => false,
            }
        }
    }
}
