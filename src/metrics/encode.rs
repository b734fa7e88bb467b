// vigil: Text exposition encoding

use std::fmt::Write as _;

use crate::metrics::registry::{MetricFamily, MetricKind, SeriesValue};

/// Encode gathered metric families into the Prometheus text exposition format
pub fn encode_text(families: &[MetricFamily]) -> String {
    let mut out = String::new();
    for family in families {
        let name = full_name(family);
        let _ = writeln!(out, "# HELP {} {}", name, escape_help(&family.shape.help));
        let _ = writeln!(out, "# TYPE {} {}", name, type_name(family.shape.kind));

        for series in &family.series {
            let labels = &series.label_values;
            match &series.value {
                SeriesValue::Counter(v) | SeriesValue::Gauge(v) => {
                    let _ = writeln!(
                        out,
                        "{}{} {}",
                        name,
                        label_block(&family.shape.label_keys, labels, &[]),
                        fmt_value(*v)
                    );
                }
                SeriesValue::Histogram {
                    cumulative,
                    sum,
                    count,
                } => {
                    for (idx, cum) in cumulative.iter().enumerate() {
                        let le = family
                            .shape
                            .buckets
                            .get(idx)
                            .map(|b| fmt_value(*b))
                            .unwrap_or_else(|| "+Inf".to_string());
                        let _ = writeln!(
                            out,
                            "{}_bucket{} {}",
                            name,
                            label_block(&family.shape.label_keys, labels, &[("le", &le)]),
                            cum
                        );
                    }
                    let _ = writeln!(
                        out,
                        "{}_sum{} {}",
                        name,
                        label_block(&family.shape.label_keys, labels, &[]),
                        fmt_value(*sum)
                    );
                    let _ = writeln!(
                        out,
                        "{}_count{} {}",
                        name,
                        label_block(&family.shape.label_keys, labels, &[]),
                        count
                    );
                }
                SeriesValue::Summary {
                    quantiles,
                    sum,
                    count,
                } => {
                    for (q, v) in quantiles {
                        let qs = fmt_value(*q);
                        let _ = writeln!(
                            out,
                            "{}{} {}",
                            name,
                            label_block(&family.shape.label_keys, labels, &[("quantile", &qs)]),
                            fmt_value(*v)
                        );
                    }
                    let _ = writeln!(
                        out,
                        "{}_sum{} {}",
                        name,
                        label_block(&family.shape.label_keys, labels, &[]),
                        fmt_value(*sum)
                    );
                    let _ = writeln!(
                        out,
                        "{}_count{} {}",
                        name,
                        label_block(&family.shape.label_keys, labels, &[]),
                        count
                    );
                }
            }
        }
    }
    out
}

fn full_name(family: &MetricFamily) -> String {
    if family.shape.subsystem.is_empty() {
        family.shape.name.clone()
    } else {
        format!("{}_{}", family.shape.subsystem, family.shape.name)
    }
}

fn type_name(kind: MetricKind) -> &'static str {
    match kind {
        MetricKind::Counter => "counter",
        MetricKind::Gauge => "gauge",
        MetricKind::Histogram => "histogram",
        MetricKind::Summary => "summary",
    }
}

fn label_block(keys: &[String], values: &[String], extra: &[(&str, &str)]) -> String {
    let mut pairs: Vec<String> = keys
        .iter()
        .zip(values.iter())
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    for (k, v) in extra {
        pairs.push(format!("{}=\"{}\"", k, escape_label(v)));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn fmt_value(v: f64) -> String {
    if v.is_infinite() {
        if v > 0.0 {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if v.is_nan() {
        "NaN".to_string()
    } else {
        // integral values print without a trailing .0
        if v.fract() == 0.0 && v.abs() < 1e15 {
            format!("{}", v as i64)
        } else {
            format!("{}", v)
        }
    }
}
