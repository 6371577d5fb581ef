use std::collections::HashMap;

const BUCKETS: usize = 64;

/// Bounded log-scale latency sketch: one bucket per power of two of
/// nanoseconds. Quantiles come back as the upper bound of the bucket the
/// rank falls in, clamped to the true maximum, which keeps the error within
/// a factor of two while the memory stays fixed.
#[derive(Clone)]
pub struct LatencySketch {
    buckets: [u64; BUCKETS],
    count: u64,
    sum_ns: u64,
    max_ns: u64,
}

impl Default for LatencySketch {
    fn default() -> Self {
        Self {
            buckets: [0; BUCKETS],
            count: 0,
            sum_ns: 0,
            max_ns: 0,
        }
    }
}

impl LatencySketch {
    pub fn record(&mut self, latency_ns: u64) {
        self.buckets[bucket_index(latency_ns)] += 1;
        self.count += 1;
        self.sum_ns = self.sum_ns.saturating_add(latency_ns);
        self.max_ns = self.max_ns.max(latency_ns);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum_ns(&self) -> u64 {
        self.sum_ns
    }

    pub fn max_ns(&self) -> u64 {
        self.max_ns
    }

    /// Latency at quantile `q` in nanoseconds (0 when empty).
    pub fn quantile_ns(&self, q: f64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        let rank = ((q * self.count as f64).ceil() as u64).clamp(1, self.count);
        let mut seen = 0u64;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket;
            if seen >= rank {
                return bucket_upper_bound(idx).min(self.max_ns);
            }
        }
        self.max_ns
    }

    pub fn quantile_ms(&self, q: f64) -> f64 {
        self.quantile_ns(q) as f64 / 1_000_000.0
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ns as f64 / 1_000_000.0
    }
}

fn bucket_index(latency_ns: u64) -> usize {
    if latency_ns == 0 {
        return 0;
    }
    (63 - latency_ns.leading_zeros() as usize).min(BUCKETS - 1)
}

fn bucket_upper_bound(idx: usize) -> u64 {
    if idx >= 63 {
        u64::MAX
    } else {
        (1u64 << (idx + 1)) - 1
    }
}

/// Per-second ring of (total, errors) used for windowed error-rate
/// detection. Bucket assignment uses the caller's clock seconds, never
/// event timestamps.
#[derive(Clone)]
pub struct SlidingWindow {
    slots: Vec<WindowSlot>,
}

#[derive(Clone, Copy, Default)]
struct WindowSlot {
    epoch_sec: u64,
    total: u64,
    errors: u64,
}

impl SlidingWindow {
    pub fn new(window_secs: usize) -> Self {
        Self {
            slots: vec![WindowSlot::default(); window_secs.max(1)],
        }
    }

    pub fn record(&mut self, now_sec: u64, error: bool) {
        let len = self.slots.len() as u64;
        let slot = &mut self.slots[(now_sec % len) as usize];
        if slot.epoch_sec != now_sec {
            *slot = WindowSlot {
                epoch_sec: now_sec,
                total: 0,
                errors: 0,
            };
        }
        slot.total += 1;
        if error {
            slot.errors += 1;
        }
    }

    /// (total, errors) across slots still inside the window at `now_sec`.
    pub fn totals(&self, now_sec: u64) -> (u64, u64) {
        let window = self.slots.len() as u64;
        let oldest = now_sec.saturating_sub(window - 1);
        let mut total = 0;
        let mut errors = 0;
        for slot in &self.slots {
            if slot.epoch_sec >= oldest && slot.epoch_sec <= now_sec {
                total += slot.total;
                errors += slot.errors;
            }
        }
        (total, errors)
    }
}

/// Aggregated per-target statistics within one category.
#[derive(Clone, Default)]
pub struct TargetStats {
    pub count: u64,
    pub errors: u64,
    pub latency: LatencySketch,
    pub bytes: u64,
    pub retransmits: u64,
    pub connect_failures: u64,
    pub state_changes: u64,
    pub rtt_spikes: u64,
    pub slow_ops: u64,
    pub blocked_ns: u64,
    /// Minute bucket for spike-rate escalation.
    pub spike_minute: u64,
    pub spikes_this_minute: u64,
    /// Service annotation picked up from enrichment, when one resolved.
    pub service: String,
}

impl TargetStats {
    /// Counts one RTT spike and returns the per-minute rate so the caller
    /// can decide on escalation.
    pub fn record_spike(&mut self, now_min: u64) -> u64 {
        self.rtt_spikes += 1;
        if self.spike_minute != now_min {
            self.spike_minute = now_min;
            self.spikes_this_minute = 0;
        }
        self.spikes_this_minute += 1;
        self.spikes_this_minute
    }
}

/// Bounded map of per-target statistics. Once full, previously unseen
/// targets aggregate under a single overflow key instead of growing the
/// map.
#[derive(Clone)]
pub struct TopTable {
    entries: HashMap<String, TargetStats>,
    max_entries: usize,
}

pub const OVERFLOW_KEY: &str = "(other)";

impl TopTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    pub fn entry(&mut self, key: &str) -> &mut TargetStats {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            return self.entries.entry(OVERFLOW_KEY.to_string()).or_default();
        }
        self.entries.entry(key.to_string()).or_default()
    }

    pub fn get(&self, key: &str) -> Option<&TargetStats> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows ordered by count descending, then key, for deterministic
    /// rendering.
    pub fn ranked(&self) -> Vec<(&str, &TargetStats)> {
        let mut rows: Vec<(&str, &TargetStats)> = self
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect();
        rows.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));
        rows
    }
}
