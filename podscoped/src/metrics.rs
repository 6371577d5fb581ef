use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

/// Record-side metrics for the tracer.
///
/// Counters are updated from the hot path so all fields are atomic; the
/// per-type error map takes a short write lock off the hot path.
pub struct Metrics {
    pub start_time: SystemTime,
    events_observed: AtomicU64,
    events_consumed: AtomicU64,
    ring_buffer_drops: AtomicU64,
    decode_errors: AtomicU64,
    invalid_pid: AtomicU64,
    filtered_cgroup: AtomicU64,
    filtered_category: AtomicU64,
    process_cache_hits: AtomicU64,
    process_cache_misses: AtomicU64,
    pid_cache_hits: AtomicU64,
    pid_cache_misses: AtomicU64,
    enrich_timeouts: AtomicU64,
    read_errors: AtomicU64,
    processing_latency_ns: AtomicU64,
    processing_latency_samples: AtomicU64,
    // Per-second tracking
    events_this_sec: AtomicU64,
    events_per_sec: AtomicU64,
    errors_by_type: RwLock<HashMap<String, u64>>,
}

/// Point-in-time view of the pipeline accounting counters. Every record the
/// reader observes ends up in exactly one of the non-`observed` buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineAccounting {
    pub observed: u64,
    pub consumed: u64,
    pub dropped: u64,
    pub decode_rejected: u64,
    pub invalid_pid: u64,
    pub filtered_cgroup: u64,
    pub filtered_category: u64,
}

impl PipelineAccounting {
    pub fn balances(&self) -> bool {
        self.observed
            == self.consumed
                + self.dropped
                + self.decode_rejected
                + self.invalid_pid
                + self.filtered_cgroup
                + self.filtered_category
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            events_observed: AtomicU64::new(0),
            events_consumed: AtomicU64::new(0),
            ring_buffer_drops: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            invalid_pid: AtomicU64::new(0),
            filtered_cgroup: AtomicU64::new(0),
            filtered_category: AtomicU64::new(0),
            process_cache_hits: AtomicU64::new(0),
            process_cache_misses: AtomicU64::new(0),
            pid_cache_hits: AtomicU64::new(0),
            pid_cache_misses: AtomicU64::new(0),
            enrich_timeouts: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            processing_latency_ns: AtomicU64::new(0),
            processing_latency_samples: AtomicU64::new(0),
            events_this_sec: AtomicU64::new(0),
            events_per_sec: AtomicU64::new(0),
            errors_by_type: RwLock::new(HashMap::new()),
        }
    }

    /// Record a raw record arriving from the ring buffer.
    pub fn record_event_observed(&self) {
        self.events_observed.fetch_add(1, Ordering::Relaxed);
        self.events_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_consumed(&self) {
        self.events_consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// A decoded event was dropped because the handoff queue was full.
    pub fn record_ring_buffer_drop(&self) {
        self.ring_buffer_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_pid(&self) {
        self.invalid_pid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered_cgroup(&self) {
        self.filtered_cgroup.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered_category(&self) {
        self.filtered_category.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_cache_hit(&self) {
        self.process_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process_cache_miss(&self) {
        self.process_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pid_cache_hit(&self) {
        self.pid_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pid_cache_miss(&self) {
        self.pid_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enrich_timeout(&self) {
        self.enrich_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_processing_latency(&self, elapsed: Duration) {
        self.processing_latency_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.processing_latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, kind: &str, code: i32) {
        let mut map = self.errors_by_type.write().unwrap();
        *map.entry(kind.to_string()).or_insert(0) += 1;
        drop(map);
        log::debug!("error recorded: type={kind} code={code}");
    }

    /// Called once a second to refresh the events-per-second gauge.
    pub fn rollup(&self) {
        let per_sec = self.events_this_sec.swap(0, Ordering::Relaxed);
        self.events_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn events_per_sec(&self) -> u64 {
        self.events_per_sec.load(Ordering::Relaxed)
    }

    pub fn events_observed(&self) -> u64 {
        self.events_observed.load(Ordering::Relaxed)
    }

    pub fn events_consumed(&self) -> u64 {
        self.events_consumed.load(Ordering::Relaxed)
    }

    pub fn ring_buffer_drops(&self) -> u64 {
        self.ring_buffer_drops.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn enrich_timeouts(&self) -> u64 {
        self.enrich_timeouts.load(Ordering::Relaxed)
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors.load(Ordering::Relaxed)
    }

    pub fn process_cache_hits(&self) -> u64 {
        self.process_cache_hits.load(Ordering::Relaxed)
    }

    pub fn process_cache_misses(&self) -> u64 {
        self.process_cache_misses.load(Ordering::Relaxed)
    }

    pub fn pid_cache_hits(&self) -> u64 {
        self.pid_cache_hits.load(Ordering::Relaxed)
    }

    pub fn pid_cache_misses(&self) -> u64 {
        self.pid_cache_misses.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    /// Mean per-event processing time in the consumer, in microseconds.
    pub fn mean_processing_latency_us(&self) -> f64 {
        let samples = self.processing_latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 0.0;
        }
        let total = self.processing_latency_ns.load(Ordering::Relaxed);
        total as f64 / samples as f64 / 1_000.0
    }

    pub fn errors_by_type(&self) -> Vec<(String, u64)> {
        let map = self.errors_by_type.read().unwrap();
        let mut out: Vec<(String, u64)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort();
        out
    }

    pub fn accounting(&self) -> PipelineAccounting {
        PipelineAccounting {
            observed: self.events_observed(),
            consumed: self.events_consumed(),
            dropped: self.ring_buffer_drops(),
            decode_rejected: self.decode_errors(),
            invalid_pid: self.invalid_pid.load(Ordering::Relaxed),
            filtered_cgroup: self.filtered_cgroup.load(Ordering::Relaxed),
            filtered_category: self.filtered_category.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_balances_over_a_synthetic_run() {
        let m = Metrics::new();
        for _ in 0..10 {
            m.record_event_observed();
        }
        for _ in 0..4 {
            m.record_event_consumed();
        }
        m.record_ring_buffer_drop();
        m.record_decode_error();
        m.record_invalid_pid();
        m.record_filtered_cgroup();
        m.record_filtered_cgroup();
        m.record_filtered_category();
        let acct = m.accounting();
        assert!(acct.balances(), "accounting out of balance: {acct:?}");
    }

    #[test]
    fn rollup_resets_per_second_counter() {
        let m = Metrics::new();
        m.record_event_observed();
        m.record_event_observed();
        m.rollup();
        assert_eq!(m.events_per_sec(), 2);
        m.rollup();
        assert_eq!(m.events_per_sec(), 0);
    }

    #[test]
    fn error_types_are_counted() {
        let m = Metrics::new();
        m.record_error("read", -11);
        m.record_error("read", -11);
        m.record_error("decode", 0);
        let errors = m.errors_by_type();
        assert_eq!(errors, vec![("decode".into(), 1), ("read".into(), 2)]);
    }
}
