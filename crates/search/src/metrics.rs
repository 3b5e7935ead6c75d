//! Span duration metrics
//!
//! Durations are recorded into a [`LatencyHistogram`] with 64 power-of-two
//! buckets. Percentiles interpolate exponentially inside the bucket that
//! holds the requested sample, which keeps the estimate within a factor of
//! two of the true value.

use serde::{Deserialize, Serialize};
use spanstore_core::{AttrValue, Resource, Span, StatusCode, SERVICE_NAME_KEY};
use std::collections::BTreeMap;

/// Number of histogram buckets.
pub const BUCKETS: usize = 64;

/// Log2 latency histogram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    count: u64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: vec![0; BUCKETS],
            count: 0,
        }
    }
}

impl LatencyHistogram {
    /// Empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket of a duration: `ceil(log2 d)` for d >= 2, else 0.
    pub fn bucket(duration_nanos: u64) -> usize {
        if duration_nanos < 2 {
            return 0;
        }
        let bucket = (u64::BITS - (duration_nanos - 1).leading_zeros()) as usize;
        bucket.min(BUCKETS - 1)
    }

    /// Record one duration.
    pub fn record(&mut self, duration_nanos: u64) {
        self.buckets[Self::bucket(duration_nanos)] += 1;
        self.count += 1;
    }

    /// Samples recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Per-bucket counts.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Estimated value at quantile `p` in `[0, 1]`. 0 when empty.
    pub fn percentile(&self, p: f64) -> u64 {
        if p.is_nan() || !(0.0..=1.0).contains(&p) || self.count == 0 {
            return 0;
        }
        let needed = ((p * self.count as f64).ceil() as u64).max(1);

        let mut below = 0u64;
        let mut bucket = 0usize;
        for (b, &n) in self.buckets.iter().enumerate() {
            bucket = b;
            if below + n < needed {
                below += n;
                continue;
            }
            break;
        }
        let in_bucket = self.buckets[bucket];
        if in_bucket == 0 {
            return 0;
        }
        let interp = (needed - below) as f64 / in_bucket as f64;
        (2f64.powf(bucket as f64 - 1.0) * 2f64.powf(interp)) as u64
    }

    /// Add another histogram's samples.
    pub fn combine(&mut self, other: &LatencyHistogram) {
        for (a, b) in self.buckets.iter_mut().zip(&other.buckets) {
            *a += b;
        }
        self.count += other.count;
    }
}

/// Span metrics request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanMetricsRequest {
    /// Optional span filter
    pub query: Option<String>,
    /// Attribute to group by (`span.x`, `resource.x`, `.x`, `name`,
    /// `status` or `kind`); empty = one group
    pub group_by: String,
    /// Range start, unix seconds (0 = unbounded)
    pub start: u64,
    /// Range end, unix seconds (0 = unbounded)
    pub end: u64,
}

/// One group's samples
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSeries {
    /// Span durations
    pub latency: LatencyHistogram,
    /// Spans with error status
    pub errors: u64,
}

/// Span metrics grouped by attribute value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsResults {
    /// Series by rendered group value
    pub series: BTreeMap<String, MetricSeries>,
    /// Spans recorded
    pub span_count: u64,
}

impl MetricsResults {
    /// Empty results.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one span.
    pub fn record(&mut self, group: String, duration_nanos: u64, is_error: bool) {
        let series = self.series.entry(group).or_default();
        series.latency.record(duration_nanos);
        if is_error {
            series.errors += 1;
        }
        self.span_count += 1;
    }

    /// Record `span` under its value of `group_by`.
    pub fn record_span(&mut self, group_by: &str, resource: &Resource, span: &Span) {
        self.record(
            group_value(group_by, resource, span),
            span.duration_nano(),
            span.status_code == StatusCode::Error,
        );
    }

    /// Merge another result set.
    pub fn combine(&mut self, other: &MetricsResults) {
        for (group, series) in &other.series {
            let mine = self.series.entry(group.clone()).or_default();
            mine.latency.combine(&series.latency);
            mine.errors += series.errors;
        }
        self.span_count += other.span_count;
    }

    /// Summaries with p50/p90/p99, ordered by group value.
    pub fn into_response(self) -> SpanMetricsResponse {
        SpanMetricsResponse {
            span_count: self.span_count,
            metrics: self
                .series
                .into_iter()
                .map(|(group, s)| SpanMetricsSummary {
                    group_value: group,
                    span_count: s.latency.count(),
                    error_span_count: s.errors,
                    p50: s.latency.percentile(0.5),
                    p90: s.latency.percentile(0.9),
                    p99: s.latency.percentile(0.99),
                })
                .collect(),
        }
    }
}

/// One group's summary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanMetricsSummary {
    /// Group value
    pub group_value: String,
    /// Spans in the group
    pub span_count: u64,
    /// Error spans in the group
    pub error_span_count: u64,
    /// Median duration (ns)
    pub p50: u64,
    /// 90th percentile duration (ns)
    pub p90: u64,
    /// 99th percentile duration (ns)
    pub p99: u64,
}

/// Span metrics result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanMetricsResponse {
    /// Spans recorded
    pub span_count: u64,
    /// One summary per group
    pub metrics: Vec<SpanMetricsSummary>,
}

/// Rendered value of `group_by` on a span; empty when absent.
pub fn group_value(group_by: &str, resource: &Resource, span: &Span) -> String {
    match group_by {
        "" => return String::new(),
        "name" => return span.name.clone(),
        "status" => return span.status_code.as_str().to_string(),
        "kind" => return span.kind.as_str().to_string(),
        _ => {}
    }
    let (key, span_scope, resource_scope) = if let Some(k) = group_by.strip_prefix("span.") {
        (k, true, false)
    } else if let Some(k) = group_by.strip_prefix("resource.") {
        (k, false, true)
    } else {
        (group_by.strip_prefix('.').unwrap_or(group_by), true, true)
    };

    let from_span = span_scope
        .then(|| span.attrs.iter().find(|a| a.key == key))
        .flatten()
        .map(|a| a.value.to_string());
    from_span
        .or_else(|| {
            if !resource_scope {
                return None;
            }
            if key == SERVICE_NAME_KEY {
                return Some(AttrValue::Str(resource.service_name.clone()).to_string());
            }
            resource
                .attrs
                .iter()
                .find(|a| a.key == key)
                .map(|a| a.value.to_string())
        })
        .unwrap_or_default()
}
