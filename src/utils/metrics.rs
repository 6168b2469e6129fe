use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per series; older samples are dropped
pub const LATENCY_WINDOW: usize = 1024;

/// Pipeline stages with their own latency series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detection,
    Preparation,
    Recognition,
    Extraction,
    Grading,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Detection,
        Stage::Preparation,
        Stage::Recognition,
        Stage::Extraction,
        Stage::Grading,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Detection => "detection",
            Stage::Preparation => "preparation",
            Stage::Recognition => "recognition",
            Stage::Extraction => "extraction",
            Stage::Grading => "grading",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Process-wide metrics collector.
///
/// Cheap to clone; all clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Scan outcomes, keyed by outcome label
    scans: DashMap<String, AtomicUsize>,
    regions_detected: AtomicUsize,
    candidates_evaluated: AtomicUsize,

    stage_latency_ms: [RwLock<VecDeque<u64>>; 5],

    // Text-understanding service
    llm_calls_success: AtomicUsize,
    llm_calls_failed: AtomicUsize,
    llm_latency_ms: RwLock<VecDeque<u64>>,

    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_size: AtomicUsize,

    grades_predicted: AtomicUsize,
    circuit_breaker_trips: AtomicUsize,

    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                scans: DashMap::new(),
                regions_detected: AtomicUsize::new(0),
                candidates_evaluated: AtomicUsize::new(0),
                stage_latency_ms: Default::default(),
                llm_calls_success: AtomicUsize::new(0),
                llm_calls_failed: AtomicUsize::new(0),
                llm_latency_ms: RwLock::new(VecDeque::with_capacity(LATENCY_WINDOW)),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                cache_size: AtomicUsize::new(0),
                grades_predicted: AtomicUsize::new(0),
                circuit_breaker_trips: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Scan Metrics
    pub fn record_scan(&self, outcome: &str) {
        bump(&self.inner.scans, outcome);
    }

    pub fn record_regions(&self, count: usize) {
        self.inner.regions_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_candidate(&self) {
        self.inner.candidates_evaluated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage(&self, stage: Stage, duration: Duration) {
        push_sample(&self.inner.stage_latency_ms[stage.index()], duration);
    }

    // LLM Metrics
    pub fn record_llm_call(&self, success: bool, duration: Duration) {
        if success {
            self.inner.llm_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.llm_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&self.inner.llm_latency_ms, duration);
    }

    // Cache Metrics
    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_cache_size(&self, size: usize) {
        self.inner.cache_size.store(size, Ordering::Relaxed);
    }

    pub fn record_grade_predicted(&self) {
        self.inner.grades_predicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        bump(&self.inner.endpoint_counters, endpoint);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let llm_latency = self.inner.llm_latency_ms.read();
        let llm_latency_avg_ms = avg(&llm_latency);
        let llm_latency_p50_ms = percentile(&llm_latency, 0.5);
        let llm_latency_p95_ms = percentile(&llm_latency, 0.95);
        let llm_latency_p99_ms = percentile(&llm_latency, 0.99);
        drop(llm_latency);

        let stage_avg_ms = Stage::ALL
            .iter()
            .map(|stage| {
                let values = self.inner.stage_latency_ms[stage.index()].read();
                (stage.as_str().to_string(), avg(&values))
            })
            .collect();

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        let llm_calls_success = self.inner.llm_calls_success.load(Ordering::Relaxed);
        let llm_calls_failed = self.inner.llm_calls_failed.load(Ordering::Relaxed);

        MetricsSnapshot {
            scans: counts(&self.inner.scans),
            regions_detected: self.inner.regions_detected.load(Ordering::Relaxed),
            candidates_evaluated: self.inner.candidates_evaluated.load(Ordering::Relaxed),
            stage_avg_ms,
            llm_calls_total: llm_calls_success + llm_calls_failed,
            llm_calls_success,
            llm_calls_failed,
            llm_latency_avg_ms,
            llm_latency_p50_ms,
            llm_latency_p95_ms,
            llm_latency_p99_ms,
            cache_hits,
            cache_misses,
            cache_hit_rate,
            cache_size: self.inner.cache_size.load(Ordering::Relaxed),
            grades_predicted: self.inner.grades_predicted.load(Ordering::Relaxed),
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            endpoints: counts(&self.inner.endpoint_counters),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        out.push_str("# HELP scans_total Scans by outcome\n# TYPE scans_total counter\n");
        for (outcome, count) in &s.scans {
            out.push_str(&format!("scans_total{{outcome=\"{}\"}} {}\n", outcome, count));
        }

        out.push_str(&format!(
            r#"
# HELP regions_detected_total Candidate regions returned by the detector
# TYPE regions_detected_total counter
regions_detected_total {}

# HELP candidates_evaluated_total Candidate regions run through the pipeline
# TYPE candidates_evaluated_total counter
candidates_evaluated_total {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
"#,
            s.regions_detected, s.candidates_evaluated,
        ));
        for (stage, ms) in &s.stage_avg_ms {
            out.push_str(&format!("stage_avg_duration_ms{{stage=\"{}\"}} {}\n", stage, ms));
        }

        out.push_str(&format!(
            r#"
# HELP llm_calls_total Calls to the text-understanding service
# TYPE llm_calls_total counter
llm_calls_total{{result="success"}} {}
llm_calls_total{{result="failure"}} {}

# HELP llm_latency_ms Text-understanding service latency in milliseconds
# TYPE llm_latency_ms gauge
llm_latency_ms{{quantile="avg"}} {}
llm_latency_ms{{quantile="0.5"}} {}
llm_latency_ms{{quantile="0.95"}} {}
llm_latency_ms{{quantile="0.99"}} {}

# HELP extraction_cache_hit_rate Extraction cache hit rate (0.0 to 1.0)
# TYPE extraction_cache_hit_rate gauge
extraction_cache_hit_rate {}

# HELP extraction_cache_size Current extraction cache size
# TYPE extraction_cache_size gauge
extraction_cache_size {}

# HELP grades_predicted_total Grades produced by the classifier
# TYPE grades_predicted_total counter
grades_predicted_total {}

# HELP circuit_breaker_trips_total Total circuit breaker trips
# TYPE circuit_breaker_trips_total counter
circuit_breaker_trips_total {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {}
"#,
            s.llm_calls_success,
            s.llm_calls_failed,
            s.llm_latency_avg_ms,
            s.llm_latency_p50_ms,
            s.llm_latency_p95_ms,
            s.llm_latency_p99_ms,
            s.cache_hit_rate,
            s.cache_size,
            s.grades_predicted,
            s.circuit_breaker_trips,
            s.uptime_seconds,
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub scans: BTreeMap<String, usize>,
    pub regions_detected: usize,
    pub candidates_evaluated: usize,
    pub stage_avg_ms: BTreeMap<String, u64>,
    pub llm_calls_total: usize,
    pub llm_calls_success: usize,
    pub llm_calls_failed: usize,
    pub llm_latency_avg_ms: u64,
    pub llm_latency_p50_ms: u64,
    pub llm_latency_p95_ms: u64,
    pub llm_latency_p99_ms: u64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub grades_predicted: usize,
    pub circuit_breaker_trips: usize,
    pub endpoints: BTreeMap<String, usize>,
    pub uptime_seconds: u64,
}

fn bump(map: &DashMap<String, AtomicUsize>, key: &str) {
    if let Some(counter) = map.get(key) {
        counter.fetch_add(1, Ordering::Relaxed);
        return;
    }
    map.entry(key.to_string())
        .or_insert_with(|| AtomicUsize::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn counts(map: &DashMap<String, AtomicUsize>) -> BTreeMap<String, usize> {
    map.iter()
        .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
        .collect()
}

fn push_sample(series: &RwLock<VecDeque<u64>>, duration: Duration) {
    let mut series = series.write();
    if series.len() >= LATENCY_WINDOW {
        series.pop_front();
    }
    series.push_back(duration.as_millis() as u64);
}

fn percentile(values: &VecDeque<u64>, p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = values.iter().copied().collect();
    sorted.sort_unstable();
    let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &VecDeque<u64>) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
