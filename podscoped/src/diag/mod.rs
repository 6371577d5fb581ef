use std::sync::Mutex;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;

pub mod anomaly;
pub mod export;
pub mod report;
pub mod stats;

pub use anomaly::{Anomaly, AnomalyBook, Severity};
pub use stats::{LatencySketch, SlidingWindow, TargetStats, TopTable};

use crate::config::ThresholdConfig;
use crate::event::{Category, Event, EventKind};
use crate::k8s::KubernetesContext;

/// Error-rate anomalies need at least this many samples in the window.
const MIN_ERROR_RATE_SAMPLES: u64 = 10;
const ERROR_WINDOW_SECS: usize = 60;
const MAX_TARGETS_PER_CATEGORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Collecting,
    Finished,
    Reported,
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub error_rate_pct: f64,
    pub rtt_spike_ns: u64,
    pub fs_slow_ns: u64,
    pub spike_escalation_per_min: u64,
}

impl From<&ThresholdConfig> for Thresholds {
    fn from(cfg: &ThresholdConfig) -> Self {
        Self {
            error_rate_pct: cfg.error_rate_pct,
            rtt_spike_ns: cfg.rtt_spike_ms * 1_000_000,
            fs_slow_ns: cfg.fs_slow_ms * 1_000_000,
            spike_escalation_per_min: cfg.spike_escalation_per_min,
        }
    }
}

#[derive(Clone, Default)]
struct CategoryStats {
    total: u64,
    errors: u64,
    sketch: LatencySketch,
}

struct DiagState {
    phase: Phase,
    consumed: u64,
    external_hits: u64,
    categories: Vec<CategoryStats>,
    windows: Vec<SlidingWindow>,
    tables: Vec<TopTable>,
    anomalies: AnomalyBook,
}

/// The stateful aggregator: consumes enriched events, keeps per-category
/// statistics and top-target tables, flags anomalies against the
/// thresholds, and renders reports from a snapshot.
///
/// State machine: Collecting -> Finished -> Reported. `add_event` only acts
/// in Collecting; `generate_report` snapshots under one lock acquisition
/// and renders outside it, so repeated calls without intervening events
/// produce byte-identical output. Events are never retained, only their
/// aggregates.
pub struct Diagnostician {
    title: String,
    thresholds: Thresholds,
    origin: Instant,
    state: Mutex<DiagState>,
}

impl Diagnostician {
    pub fn new(title: impl Into<String>, thresholds: Thresholds) -> Self {
        Self {
            title: title.into(),
            thresholds,
            origin: Instant::now(),
            state: Mutex::new(DiagState {
                phase: Phase::Collecting,
                consumed: 0,
                external_hits: 0,
                categories: vec![CategoryStats::default(); Category::ALL.len()],
                windows: vec![SlidingWindow::new(ERROR_WINDOW_SECS); Category::ALL.len()],
                tables: vec![TopTable::new(MAX_TARGETS_PER_CATEGORY); Category::ALL.len()],
                anomalies: AnomalyBook::new(),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().unwrap().phase
    }

    pub fn consumed(&self) -> u64 {
        self.state.lock().unwrap().consumed
    }

    pub fn add_event(&self, event: &Event, ctx: &KubernetesContext) {
        let now_sec = self.origin.elapsed().as_secs();
        let now_min = now_sec / 60;

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        if state.phase != Phase::Collecting {
            return;
        }
        state.consumed += 1;
        if ctx.is_external {
            state.external_hits += 1;
        }

        let category = event.category();
        let idx = category.index();
        let is_error = event.error != 0;

        let cat_stats = &mut state.categories[idx];
        cat_stats.total += 1;
        if is_error {
            cat_stats.errors += 1;
        }
        if event.latency_ns > 0 {
            cat_stats.sketch.record(event.latency_ns);
        }

        state.windows[idx].record(now_sec, is_error);

        let key = attribution_key(event);
        let target = state.tables[idx].entry(&key);
        target.count += 1;
        if is_error {
            target.errors += 1;
        }
        if event.latency_ns > 0 {
            target.latency.record(event.latency_ns);
        }
        target.bytes += event.bytes;
        if target.service.is_empty() && !ctx.service_name.is_empty() {
            target.service = format!("{}/{}", ctx.service_namespace, ctx.service_name);
        }

        match event.kind {
            EventKind::Connect if is_error => {
                target.connect_failures += 1;
            }
            EventKind::TcpRetrans => {
                target.retransmits += 1;
            }
            EventKind::TcpState => {
                target.state_changes += 1;
            }
            EventKind::TcpSend | EventKind::TcpRecv => {
                if event.latency_ns >= self.thresholds.rtt_spike_ns && event.latency_ns > 0 {
                    let per_minute = target.record_spike(now_min);
                    let total_spikes = target.rtt_spikes;
                    let severity = if per_minute > self.thresholds.spike_escalation_per_min {
                        Severity::Error
                    } else {
                        Severity::Warning
                    };
                    state.anomalies.upsert(
                        category,
                        &key,
                        severity,
                        format!(
                            "rtt {:.1} ms at or above {} ms spike threshold ({} spikes)",
                            event.latency_ns as f64 / 1_000_000.0,
                            self.thresholds.rtt_spike_ns / 1_000_000,
                            total_spikes
                        ),
                    );
                }
            }
            EventKind::Read | EventKind::Write | EventKind::Fsync => {
                if event.latency_ns > self.thresholds.fs_slow_ns {
                    target.slow_ops += 1;
                    let slow_ops = target.slow_ops;
                    state.anomalies.upsert(
                        category,
                        &key,
                        Severity::Warning,
                        format!(
                            "{} slow op(s) above {} ms",
                            slow_ops,
                            self.thresholds.fs_slow_ns / 1_000_000
                        ),
                    );
                }
            }
            EventKind::SchedSwitch => {
                target.blocked_ns += event.latency_ns;
            }
            _ => {}
        }

        // Windowed error-rate check, attributed to the target whose event
        // crossed (or sustains) the threshold.
        let (total, errors) = state.windows[idx].totals(now_sec);
        if total >= MIN_ERROR_RATE_SAMPLES && errors > 0 {
            let rate = errors as f64 * 100.0 / total as f64;
            if rate >= self.thresholds.error_rate_pct {
                let severity = severity_for_rate(rate, self.thresholds.error_rate_pct);
                state.anomalies.upsert(
                    category,
                    &key,
                    severity,
                    format!("error rate {rate:.1}% ({errors}/{total} in the last {ERROR_WINDOW_SECS}s)"),
                );
            }
        }
    }

    /// Ends collection. Idempotent; events arriving afterwards are ignored.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Collecting {
            state.phase = Phase::Finished;
        }
    }

    /// Snapshot taken under a single lock acquisition; rendering happens on
    /// the copy.
    pub fn snapshot(&self) -> DiagSnapshot {
        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Finished {
            state.phase = Phase::Reported;
        }
        let categories = Category::ALL
            .iter()
            .map(|category| {
                let idx = category.index();
                let stats = &state.categories[idx];
                let targets = state.tables[idx]
                    .ranked()
                    .into_iter()
                    .map(|(key, t)| TargetRow {
                        target: key.to_string(),
                        count: t.count,
                        errors: t.errors,
                        p50_ms: t.latency.quantile_ms(0.50),
                        p95_ms: t.latency.quantile_ms(0.95),
                        p99_ms: t.latency.quantile_ms(0.99),
                        max_ms: t.latency.max_ms(),
                        bytes: t.bytes,
                        retransmits: t.retransmits,
                        connect_failures: t.connect_failures,
                        state_changes: t.state_changes,
                        rtt_spikes: t.rtt_spikes,
                        slow_ops: t.slow_ops,
                        blocked_ms: t.blocked_ns as f64 / 1_000_000.0,
                        service: t.service.clone(),
                    })
                    .collect();
                CategorySummary {
                    category: *category,
                    total: stats.total,
                    errors: stats.errors,
                    p50_ms: stats.sketch.quantile_ms(0.50),
                    p95_ms: stats.sketch.quantile_ms(0.95),
                    p99_ms: stats.sketch.quantile_ms(0.99),
                    max_ms: stats.sketch.max_ms(),
                    targets,
                }
            })
            .collect();
        DiagSnapshot {
            consumed: state.consumed,
            external_hits: state.external_hits,
            categories,
            anomalies: state.anomalies.sorted(),
        }
    }

    pub fn generate_report(&self) -> String {
        report::render(&self.title, &self.snapshot())
    }

    pub fn export_json(&self) -> serde_json::Value {
        export::to_json(&self.snapshot(), Utc::now())
    }

    pub fn export_csv(&self) -> String {
        export::to_csv(&self.snapshot())
    }
}

fn severity_for_rate(rate: f64, threshold: f64) -> Severity {
    if rate >= threshold * 5.0 {
        Severity::Critical
    } else if rate >= threshold * 2.5 {
        Severity::Error
    } else {
        Severity::Warning
    }
}

/// Attribution key within a category: network-ish events go by target, file
/// operations by process and directory, scheduler and process events by
/// process name.
fn attribution_key(event: &Event) -> String {
    match event.category() {
        Category::Dns | Category::Network => {
            if event.target.is_empty() {
                "unknown".to_string()
            } else {
                event.target.clone()
            }
        }
        Category::Filesystem => {
            let prefix = path_prefix(&event.target);
            if event.process_name.is_empty() {
                prefix.to_string()
            } else {
                format!("{}:{}", event.process_name, prefix)
            }
        }
        Category::Cpu | Category::Process => {
            if event.process_name.is_empty() {
                format!("pid:{}", event.pid)
            } else {
                event.process_name.clone()
            }
        }
    }
}

fn path_prefix(path: &str) -> &str {
    if path.is_empty() {
        return "unknown";
    }
    if !path.starts_with('/') {
        return path;
    }
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => path,
    }
}

#[derive(Clone, Serialize)]
pub struct DiagSnapshot {
    pub consumed: u64,
    pub external_hits: u64,
    pub categories: Vec<CategorySummary>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Clone, Serialize)]
pub struct CategorySummary {
    pub category: Category,
    pub total: u64,
    pub errors: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub targets: Vec<TargetRow>,
}

#[derive(Clone, Serialize)]
pub struct TargetRow {
    pub target: String,
    pub count: u64,
    pub errors: u64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub bytes: u64,
    pub retransmits: u64,
    pub connect_failures: u64,
    pub state_changes: u64,
    pub rtt_spikes: u64,
    pub slow_ops: u64,
    pub blocked_ms: f64,
    pub service: String,
}
