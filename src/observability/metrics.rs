//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Declare counter and histogram families with a fixed label schema
//! - Record request counts and latencies from concurrent handlers
//! - Render a Prometheus-compatible text snapshot for scraping
//!
//! # Metrics
//! - `app_requests_total` (counter): requests by path, method, status
//! - `app_request_latency_seconds` (histogram): latency by path, method
//!
//! # Design Decisions
//! - The registry is an owned value shared through `Arc`, never a global
//! - Counter series are plain atomics; a histogram series sits behind one
//!   mutex so its buckets, sum and count always move together
//! - Export sorts families by name and series by label values so two
//!   snapshots of the same state are byte-identical

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use dashmap::DashMap;
use thiserror::Error;

/// Counter incremented once per instrumented request.
pub const REQUESTS_TOTAL: &str = "app_requests_total";

/// Histogram observed once per instrumented request, in seconds.
pub const REQUEST_LATENCY_SECONDS: &str = "app_request_latency_seconds";

/// Label schema of [`REQUESTS_TOTAL`].
pub const REQUEST_LABELS: [&str; 3] = ["path", "method", "status"];

/// Label schema of [`REQUEST_LATENCY_SECONDS`].
pub const LATENCY_LABELS: [&str; 2] = ["path", "method"];

/// Histogram buckets tuned for typical web latencies (seconds).
pub const DEFAULT_LATENCY_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Content type of the text exposition produced by [`MetricsRegistry::export`].
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors raised by the metrics registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MetricsError {
    /// A metric was declared with an invalid or conflicting schema.
    #[error("invalid metric configuration for {name}: {reason}")]
    Configuration { name: String, reason: String },

    /// The metric does not exist, has another kind, or the label count is wrong.
    #[error("unknown metric series {name}: {reason}")]
    UnknownMetric { name: String, reason: String },

    /// An observation was negative or not finite.
    #[error("invalid value {value} observed for {name}")]
    InvalidValue { name: String, value: f64 },
}

impl MetricsError {
    fn configuration(name: &str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    fn unknown(name: &str, reason: impl Into<String>) -> Self {
        Self::UnknownMetric {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Point-in-time view of one histogram series.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramSnapshot {
    /// Cumulative counts per upper bound, `+Inf` last.
    pub buckets: Vec<(f64, u64)>,
    pub sum: f64,
    pub count: u64,
}

#[derive(Debug, Clone)]
struct HistogramState {
    /// Per-bucket (non-cumulative) counts; the last slot is `+Inf`.
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramState {
    fn new(bounds: usize) -> Self {
        Self {
            counts: vec![0; bounds + 1],
            sum: 0.0,
            count: 0,
        }
    }

    fn observe(&mut self, bounds: &[f64], value: f64) {
        let idx = bounds
            .iter()
            .position(|upper| value <= *upper)
            .unwrap_or(bounds.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.count += 1;
    }

    fn snapshot(&self, bounds: &[f64]) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = bounds
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(&self.counts)
            .map(|(upper, n)| {
                cumulative += n;
                (upper, cumulative)
            })
            .collect();
        HistogramSnapshot {
            buckets,
            sum: self.sum,
            count: self.count,
        }
    }
}

enum Series {
    Counter(DashMap<Vec<String>, Arc<AtomicU64>>),
    Histogram {
        bounds: Vec<f64>,
        series: DashMap<Vec<String>, Arc<Mutex<HistogramState>>>,
    },
}

struct Family {
    help: String,
    label_names: Vec<String>,
    series: Series,
}

impl Family {
    fn kind(&self) -> &'static str {
        match self.series {
            Series::Counter(_) => "counter",
            Series::Histogram { .. } => "histogram",
        }
    }

    fn key(&self, name: &str, label_values: &[&str]) -> Result<Vec<String>, MetricsError> {
        if label_values.len() != self.label_names.len() {
            return Err(MetricsError::unknown(
                name,
                format!(
                    "expected {} label values, got {}",
                    self.label_names.len(),
                    label_values.len()
                ),
            ));
        }
        Ok(label_values.iter().map(|v| v.to_string()).collect())
    }
}

/// In-process registry of labelled counters and histograms.
#[derive(Default)]
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Arc<Family>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a counter family.
    pub fn register_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<(), MetricsError> {
        validate_schema(name, label_names, false)?;
        self.register(name, help, label_names, || Series::Counter(DashMap::new()), |s| {
            matches!(s, Series::Counter(_))
        })
    }

    /// Declare a histogram family. `buckets` are strictly ascending finite
    /// upper bounds; `+Inf` is always appended.
    pub fn register_histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: &[f64],
    ) -> Result<(), MetricsError> {
        validate_schema(name, label_names, true)?;
        if buckets.iter().any(|b| !b.is_finite()) {
            return Err(MetricsError::configuration(name, "bucket bounds must be finite"));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MetricsError::configuration(
                name,
                "bucket bounds must be strictly ascending",
            ));
        }
        self.register(
            name,
            help,
            label_names,
            || Series::Histogram {
                bounds: buckets.to_vec(),
                series: DashMap::new(),
            },
            |s| matches!(s, Series::Histogram { bounds, .. } if bounds.as_slice() == buckets),
        )
    }

    fn register(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        make: impl FnOnce() -> Series,
        same_kind: impl FnOnce(&Series) -> bool,
    ) -> Result<(), MetricsError> {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = families.get(name) {
            let same_labels = existing.label_names.iter().map(String::as_str).eq(label_names.iter().copied());
            if same_labels && same_kind(&existing.series) {
                return Ok(());
            }
            return Err(MetricsError::configuration(
                name,
                format!(
                    "already registered as {} with labels {:?}",
                    existing.kind(),
                    existing.label_names
                ),
            ));
        }
        families.insert(
            name.to_string(),
            Arc::new(Family {
                help: help.to_string(),
                label_names: label_names.iter().map(|l| l.to_string()).collect(),
                series: make(),
            }),
        );
        Ok(())
    }

    fn family(&self, name: &str) -> Result<Arc<Family>, MetricsError> {
        self.families
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| MetricsError::unknown(name, "not registered"))
    }

    /// Increment a counter series by one.
    pub fn increment(&self, name: &str, label_values: &[&str]) -> Result<(), MetricsError> {
        self.increment_by(name, label_values, 1)
    }

    /// Increment a counter series by `delta`.
    pub fn increment_by(
        &self,
        name: &str,
        label_values: &[&str],
        delta: u64,
    ) -> Result<(), MetricsError> {
        let family = self.family(name)?;
        let Series::Counter(series) = &family.series else {
            return Err(MetricsError::unknown(name, "not a counter"));
        };
        let key = family.key(name, label_values)?;
        let counter = series.entry(key).or_default().clone();
        counter.fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    /// Record one observation into a histogram series.
    ///
    /// The series is resolved before the value is checked, so an unknown
    /// name is always reported as [`MetricsError::UnknownMetric`].
    pub fn observe(&self, name: &str, label_values: &[&str], value: f64) -> Result<(), MetricsError> {
        let (family, key) = self.histogram_series(name, label_values)?;
        let Series::Histogram { bounds, series } = &family.series else {
            return Err(MetricsError::unknown(name, "not a histogram"));
        };
        if !value.is_finite() || value < 0.0 {
            return Err(MetricsError::InvalidValue {
                name: name.to_string(),
                value,
            });
        }
        let state = series
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(HistogramState::new(bounds.len()))))
            .clone();
        state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(bounds, value);
        Ok(())
    }

    /// Check that `name` is a histogram taking `label_values`, recording nothing.
    pub fn check_histogram(&self, name: &str, label_values: &[&str]) -> Result<(), MetricsError> {
        self.histogram_series(name, label_values).map(|_| ())
    }

    fn histogram_series(
        &self,
        name: &str,
        label_values: &[&str],
    ) -> Result<(Arc<Family>, Vec<String>), MetricsError> {
        let family = self.family(name)?;
        if !matches!(family.series, Series::Histogram { .. }) {
            return Err(MetricsError::unknown(name, "not a histogram"));
        }
        let key = family.key(name, label_values)?;
        Ok((family, key))
    }

    /// Current value of a counter series; `None` if it was never incremented.
    pub fn counter_value(&self, name: &str, label_values: &[&str]) -> Option<u64> {
        let family = self.family(name).ok()?;
        let Series::Counter(series) = &family.series else {
            return None;
        };
        let key = family.key(name, label_values).ok()?;
        series.get(&key).map(|c| c.load(Ordering::Relaxed))
    }

    /// Snapshot of a histogram series; `None` if it was never observed.
    pub fn histogram_snapshot(&self, name: &str, label_values: &[&str]) -> Option<HistogramSnapshot> {
        let family = self.family(name).ok()?;
        let Series::Histogram { bounds, series } = &family.series else {
            return None;
        };
        let key = family.key(name, label_values).ok()?;
        let state = series.get(&key)?.clone();
        let guard = state.lock().unwrap_or_else(PoisonError::into_inner);
        Some(guard.snapshot(bounds))
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let families: Vec<(String, Arc<Family>)> = self
            .families
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, family)| (name.clone(), family.clone()))
            .collect();

        let mut out = String::new();
        for (name, family) in &families {
            let _ = writeln!(out, "# HELP {} {}", name, escape_help(&family.help));
            let _ = writeln!(out, "# TYPE {} {}", name, family.kind());

            match &family.series {
                Series::Counter(series) => {
                    let mut rows: Vec<(Vec<String>, u64)> = series
                        .iter()
                        .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                        .collect();
                    rows.sort_by(|a, b| a.0.cmp(&b.0));
                    for (values, count) in rows {
                        let labels = format_labels(&family.label_names, &values, None);
                        let _ = writeln!(out, "{name}{labels} {count}");
                    }
                }
                Series::Histogram { bounds, series } => {
                    let mut rows: Vec<(Vec<String>, Arc<Mutex<HistogramState>>)> = series
                        .iter()
                        .map(|e| (e.key().clone(), e.value().clone()))
                        .collect();
                    rows.sort_by(|a, b| a.0.cmp(&b.0));
                    for (values, state) in rows {
                        let snapshot = state
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .snapshot(bounds);
                        for (upper, cumulative) in &snapshot.buckets {
                            let le = if upper.is_infinite() {
                                "+Inf".to_string()
                            } else {
                                format_float(*upper)
                            };
                            let labels = format_labels(&family.label_names, &values, Some(&le));
                            let _ = writeln!(out, "{name}_bucket{labels} {cumulative}");
                        }
                        let labels = format_labels(&family.label_names, &values, None);
                        let _ = writeln!(out, "{name}_count{labels} {}", snapshot.count);
                        let _ = writeln!(out, "{name}_sum{labels} {}", format_float(snapshot.sum));
                    }
                }
            }
        }
        out
    }
}

fn validate_schema(name: &str, label_names: &[&str], histogram: bool) -> Result<(), MetricsError> {
    if !is_valid_name(name, true) {
        return Err(MetricsError::configuration(name, "invalid metric name"));
    }
    for (i, label) in label_names.iter().enumerate() {
        if !is_valid_name(label, false) || label.starts_with("__") {
            return Err(MetricsError::configuration(name, format!("invalid label name {label:?}")));
        }
        if histogram && *label == "le" {
            return Err(MetricsError::configuration(name, "label name \"le\" is reserved"));
        }
        if label_names[..i].contains(label) {
            return Err(MetricsError::configuration(name, format!("duplicate label name {label:?}")));
        }
    }
    Ok(())
}

fn is_valid_name(name: &str, allow_colon: bool) -> bool {
    let valid = |c: char, first: bool| {
        c.is_ascii_alphabetic() || c == '_' || (allow_colon && c == ':') || (!first && c.is_ascii_digit())
    };
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if valid(c, true) => chars.all(|c| valid(c, false)),
        _ => false,
    }
}

fn format_labels(names: &[String], values: &[String], le: Option<&str>) -> String {
    let mut pairs: Vec<String> = names
        .iter()
        .zip(values)
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();
    if let Some(le) = le {
        pairs.push(format!("le=\"{le}\""));
    }
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Integral values keep one decimal place (`1.0`), others use the shortest form.
fn format_float(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}
