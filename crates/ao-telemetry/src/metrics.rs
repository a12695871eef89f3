use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Metric names recorded by the orchestrator.
pub mod names {
    pub const TASKS_TOTAL: &str = "tasks_total";
    pub const TASK_ATTEMPTS_TOTAL: &str = "task_attempts_total";
    pub const TASK_LATENCY_SECONDS: &str = "task_latency_seconds";
    pub const BREAKER_TRANSITIONS_TOTAL: &str = "breaker_transitions_total";
    pub const HEALTH_TRANSITIONS_TOTAL: &str = "health_transitions_total";
    pub const INSTANCES_RUNNING: &str = "instances_running";
    pub const INSTANCE_STARTS_TOTAL: &str = "instance_starts_total";
    pub const SCALE_EVENTS_TOTAL: &str = "scale_events_total";
    pub const API_REQUESTS_TOTAL: &str = "api_requests_total";
    pub const API_REQUEST_DURATION_SECONDS: &str = "api_request_duration_seconds";
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Histogram {
    pub buckets: Vec<f64>,
    pub counts: Vec<AtomicU64>,
    pub sum: AtomicU64,
    pub count: AtomicU64,
}

impl Histogram {
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        // f64 sum stored as bits for atomic add.
        let _ = self
            .sum
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + value).to_bits())
            });
        if let Some(i) = self.buckets.iter().position(|b| value <= *b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Cumulative counts per bucket boundary, as Prometheus expects.
    pub fn cumulative(&self) -> Vec<(f64, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .zip(&self.counts)
            .map(|(b, c)| {
                running += c.load(Ordering::Relaxed);
                (*b, running)
            })
            .collect()
    }
}

/// Latency buckets in seconds, from sub-millisecond in-process calls up to
/// the default task deadline.
fn default_duration_buckets() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
    ]
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted key=value pairs distinguishing series within a metric family.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// `{key="value",...}` with Prometheus escaping, or empty.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| {
                let escaped = v
                    .replace('\\', "\\\\")
                    .replace('"', "\\\"")
                    .replace('\n', "\\n");
                format!("{k}=\"{escaped}\"")
            })
            .collect();
        format!("{{{}}}", inner.join(","))
    }

    /// Same as [`prometheus_str`](Self::prometheus_str) with an extra `le` label.
    fn with_le(&self, le: &str) -> String {
        let mut pairs = self.0.clone();
        pairs.push(("le".to_string(), le.to_string()));
        Labels(pairs).prometheus_str()
    }
}

type SeriesKey = (String, Labels);

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Counters, gauges and histograms, each keyed by name and label set.
#[derive(Debug)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<SeriesKey, AtomicU64>>,
    gauges: RwLock<AHashMap<SeriesKey, AtomicI64>>,
    histograms: RwLock<AHashMap<SeriesKey, Histogram>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(AHashMap::new()),
            gauges: RwLock::new(AHashMap::new()),
            histograms: RwLock::new(AHashMap::new()),
        }
    }

    /// Collector with the request-duration histograms pre-registered.
    pub fn with_defaults() -> Self {
        let collector = Self::new();
        {
            let mut h = write(&collector.histograms);
            for name in [names::TASK_LATENCY_SECONDS, names::API_REQUEST_DURATION_SECONDS] {
                h.insert(
                    (name.to_string(), Labels::empty()),
                    Histogram::new(default_duration_buckets()),
                );
            }
        }
        collector
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.counters);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        write(&self.counters)
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.counters)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        self.with_gauge(name, labels, |g| g.store(value, Ordering::Relaxed));
    }

    pub fn add_gauge(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        self.with_gauge(name, labels, |g| {
            g.fetch_add(delta, Ordering::Relaxed);
        });
    }

    fn with_gauge(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&AtomicI64)) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.gauges);
            if let Some(g) = map.get(&key) {
                f(g);
                return;
            }
        }
        let mut map = write(&self.gauges);
        f(map.entry(key).or_insert_with(|| AtomicI64::new(0)));
    }

    pub fn get_gauge(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.gauges)
            .get(&key)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Histograms ---------------------------------------------------------

    /// Record into a histogram, creating it with default buckets on first use.
    pub fn record_histogram(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = read(&self.histograms);
            if let Some(h) = map.get(&key) {
                h.observe(value);
                return;
            }
        }
        write(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram::new(default_duration_buckets()))
            .observe(value);
    }

    pub fn histogram_count(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        read(&self.histograms)
            .get(&key)
            .map(Histogram::get_count)
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, families sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = read(&self.counters);
            let mut series: Vec<_> = map
                .iter()
                .map(|((n, l), v)| (n.as_str(), l, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            let mut current = "";
            for (name, labels, value) in series {
                if name != current {
                    out.push_str(&format!("# TYPE {name} counter\n"));
                    current = name;
                }
                out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
            }
        }

        {
            let map = read(&self.gauges);
            let mut series: Vec<_> = map
                .iter()
                .map(|((n, l), v)| (n.as_str(), l, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
            let mut current = "";
            for (name, labels, value) in series {
                if name != current {
                    out.push_str(&format!("# TYPE {name} gauge\n"));
                    current = name;
                }
                out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
            }
        }

        {
            let map = read(&self.histograms);
            let mut keys: Vec<&SeriesKey> = map.keys().collect();
            keys.sort();
            let mut current = "";
            for key in keys {
                let (name, labels) = key;
                let h = &map[key];
                if name != current {
                    out.push_str(&format!("# TYPE {name} histogram\n"));
                    current = name.as_str();
                }
                for (boundary, cumulative) in h.cumulative() {
                    out.push_str(&format!(
                        "{name}_bucket{} {cumulative}\n",
                        labels.with_le(&boundary.to_string())
                    ));
                }
                out.push_str(&format!(
                    "{name}_bucket{} {}\n",
                    labels.with_le("+Inf"),
                    h.get_count()
                ));
                out.push_str(&format!("{name}_sum{} {}\n", labels.prometheus_str(), h.get_sum()));
                out.push_str(&format!(
                    "{name}_count{} {}\n",
                    labels.prometheus_str(),
                    h.get_count()
                ));
            }
        }

        out
    }

    pub fn export_json(&self) -> serde_json::Value {
        let series_key = |name: &String, labels: &Labels| format!("{name}{}", labels.prometheus_str());

        let counters: serde_json::Map<_, _> = read(&self.counters)
            .iter()
            .map(|((n, l), v)| (series_key(n, l), serde_json::json!(v.load(Ordering::Relaxed))))
            .collect();

        let gauges: serde_json::Map<_, _> = read(&self.gauges)
            .iter()
            .map(|((n, l), v)| (series_key(n, l), serde_json::json!(v.load(Ordering::Relaxed))))
            .collect();

        let histograms: serde_json::Map<_, _> = read(&self.histograms)
            .iter()
            .map(|((n, l), h)| {
                let buckets: Vec<serde_json::Value> = h
                    .cumulative()
                    .into_iter()
                    .map(|(le, count)| serde_json::json!({ "le": le, "count": count }))
                    .collect();
                (
                    series_key(n, l),
                    serde_json::json!({
                        "buckets": buckets,
                        "sum": h.get_sum(),
                        "count": h.get_count(),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// Process-wide collector shared by the orchestrator and the HTTP layer.
pub fn global_metrics() -> &'static MetricsCollector {
    use std::sync::OnceLock;
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::with_defaults)
}
