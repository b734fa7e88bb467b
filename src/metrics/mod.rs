// vigil: Metric registry, sample rings, and exposition

pub mod custom;
pub mod encode;
pub mod internal;
pub mod registry;
pub mod ring;
pub mod samplers;

pub use custom::{CustomMetricDef, CustomMetrics, RecordAction};
pub use encode::encode_text;
pub use internal::InternalMetrics;
pub use registry::{
    MetricFamily, MetricHandle, MetricKind, MetricOverview, MetricRegistry, MetricShape, Quantile,
};
pub use ring::{aggregate, Aggregation, Sample, SampleRing, TimeFrame, WindowKind};
