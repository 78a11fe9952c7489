use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Most recent observations kept per histogram for percentiles. Count and sum
/// cover every observation.
const RESERVOIR: usize = 2048;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Histogram,
}

/// One series as captured by [`MetricsRecorder::snapshot`].
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    /// Counter total, or the histogram's p50.
    pub value: f64,
    pub labels: Vec<(String, String)>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Default)]
struct Samples {
    count: u64,
    sum: f64,
    recent: Vec<f64>,
    next: usize,
}

impl Samples {
    fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        if self.recent.len() < RESERVOIR {
            self.recent.push(value);
        } else {
            self.recent[self.next] = value;
        }
        self.next = (self.next + 1) % RESERVOIR;
    }

    fn summary(&self) -> HistogramSummary {
        if self.recent.is_empty() {
            return HistogramSummary::default();
        }
        let mut sorted = self.recent.clone();
        sorted.sort_by(f64::total_cmp);
        // nearest rank
        let rank = |q: f64| {
            let idx = (q * sorted.len() as f64).ceil() as usize;
            sorted[idx.clamp(1, sorted.len()) - 1]
        };
        HistogramSummary {
            count: self.count,
            sum: self.sum,
            p50: rank(0.50),
            p95: rank(0.95),
            p99: rank(0.99),
        }
    }
}

enum Series {
    Counter(AtomicU64),
    Histogram(Mutex<Samples>),
}

impl Series {
    fn metric_type(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Histogram(_) => MetricType::Histogram,
        }
    }
}

/// Name plus labels sorted by label name.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct SeriesKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        labels.sort();
        Self {
            name: name.to_owned(),
            labels,
        }
    }
}

/// In-process recorder for labeled counters and histograms.
///
/// A name keeps the type it was first recorded with; recording the other kind
/// under the same name and labels is ignored.
#[derive(Default)]
pub struct MetricsRecorder {
    series: RwLock<HashMap<SeriesKey, Series>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_series(&self, key: SeriesKey, make: fn() -> Series, f: impl FnOnce(&Series)) {
        if let Some(series) = self.series.read().get(&key) {
            f(series);
            return;
        }
        let mut all = self.series.write();
        f(all.entry(key).or_insert_with(make));
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        self.with_series(
            SeriesKey::new(name, labels),
            || Series::Counter(AtomicU64::new(0)),
            |series| {
                if let Series::Counter(value) = series {
                    value.fetch_add(n, Ordering::Relaxed);
                }
            },
        );
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Counter(value)) => value.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        if !value.is_finite() {
            return;
        }
        self.with_series(
            SeriesKey::new(name, labels),
            || Series::Histogram(Mutex::new(Samples::default())),
            |series| {
                if let Series::Histogram(samples) = series {
                    samples.lock().push(value);
                }
            },
        );
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        match self.series.read().get(&SeriesKey::new(name, labels)) {
            Some(Series::Histogram(samples)) => samples.lock().summary(),
            _ => HistogramSummary::default(),
        }
    }

    /// Every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<MetricsSnapshot> {
        let timestamp = Utc::now();
        let mut out: Vec<MetricsSnapshot> = self
            .series
            .read()
            .iter()
            .map(|(key, series)| MetricsSnapshot {
                timestamp,
                name: key.name.clone(),
                value: match series {
                    Series::Counter(value) => value.load(Ordering::Relaxed) as f64,
                    Series::Histogram(samples) => samples.lock().summary().p50,
                },
                labels: key.labels.clone(),
                metric_type: series.metric_type(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.labels.cmp(&b.labels)));
        out
    }
}
