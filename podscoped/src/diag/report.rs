use std::fmt::Write;

use super::{CategorySummary, DiagSnapshot};

const TOP_N: usize = 5;

/// Renders the text report from a snapshot. Pure: same snapshot, same
/// bytes. Sections appear in a fixed order and categories in their enum
/// order.
pub fn render(title: &str, snapshot: &DiagSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {title} ===");
    let _ = writeln!(out);

    render_summary(&mut out, snapshot);
    render_latency(&mut out, snapshot);
    render_top_targets(&mut out, snapshot);
    render_rtt_spikes(&mut out, snapshot);
    render_slow_fs(&mut out, snapshot);
    render_anomalies(&mut out, snapshot);

    out
}

fn render_summary(out: &mut String, snapshot: &DiagSnapshot) {
    let _ = writeln!(out, "Summary");
    let _ = writeln!(out, "  events: {}", snapshot.consumed);
    let _ = writeln!(out, "  anomalies: {}", snapshot.anomalies.len());
    let _ = writeln!(out, "  external targets hit: {}", snapshot.external_hits);
    for category in &snapshot.categories {
        let _ = writeln!(
            out,
            "  {}: total={} errors={}",
            category.category.label(),
            category.total,
            category.errors
        );
    }
    let _ = writeln!(out);
}

fn render_latency(out: &mut String, snapshot: &DiagSnapshot) {
    let _ = writeln!(out, "Latency percentiles (ms)");
    let _ = writeln!(
        out,
        "  {:<12} {:>10} {:>10} {:>10} {:>10}",
        "category", "p50", "p95", "p99", "max"
    );
    for category in &snapshot.categories {
        if category.total == 0 {
            continue;
        }
        let _ = writeln!(
            out,
            "  {:<12} {:>10.2} {:>10.2} {:>10.2} {:>10.2}",
            category.category.label(),
            category.p50_ms,
            category.p95_ms,
            category.p99_ms,
            category.max_ms
        );
    }
    let _ = writeln!(out);
}

fn render_top_targets(out: &mut String, snapshot: &DiagSnapshot) {
    let _ = writeln!(out, "Top targets");
    for category in &snapshot.categories {
        if category.targets.is_empty() {
            continue;
        }
        let _ = writeln!(out, "  [{}]", category.category.label());
        for row in category.targets.iter().take(TOP_N) {
            let mut line = format!("    {}: count={} errors={}", row.target, row.count, row.errors);
            if row.bytes > 0 {
                let _ = write!(line, " bytes={}", row.bytes);
            }
            if row.retransmits > 0 {
                let _ = write!(line, " retransmits={}", row.retransmits);
            }
            if row.connect_failures > 0 {
                let _ = write!(line, " connect_failures={}", row.connect_failures);
            }
            if row.state_changes > 0 {
                let _ = write!(line, " state_changes={}", row.state_changes);
            }
            if row.blocked_ms > 0.0 {
                let _ = write!(line, " blocked_ms={:.2}", row.blocked_ms);
            }
            if !row.service.is_empty() {
                let _ = write!(line, " service={}", row.service);
            }
            let _ = writeln!(out, "{line}");
        }
    }
    let _ = writeln!(out);
}

fn render_rtt_spikes(out: &mut String, snapshot: &DiagSnapshot) {
    let network = network_summary(snapshot);
    let mut spiky: Vec<_> = network
        .map(|c| c.targets.iter().filter(|t| t.rtt_spikes > 0).collect::<Vec<_>>())
        .unwrap_or_default();
    if spiky.is_empty() {
        return;
    }
    spiky.sort_by(|a, b| b.rtt_spikes.cmp(&a.rtt_spikes).then_with(|| a.target.cmp(&b.target)));
    let _ = writeln!(out, "RTT spikes");
    for row in spiky.iter().take(TOP_N) {
        let _ = writeln!(out, "  {}: spike_count={}", row.target, row.rtt_spikes);
    }
    let _ = writeln!(out);
}

fn render_slow_fs(out: &mut String, snapshot: &DiagSnapshot) {
    let fs = snapshot
        .categories
        .iter()
        .find(|c| c.category == crate::event::Category::Filesystem);
    let mut slow: Vec<_> = fs
        .map(|c| c.targets.iter().filter(|t| t.slow_ops > 0).collect::<Vec<_>>())
        .unwrap_or_default();
    if slow.is_empty() {
        return;
    }
    slow.sort_by(|a, b| b.slow_ops.cmp(&a.slow_ops).then_with(|| a.target.cmp(&b.target)));
    let _ = writeln!(out, "Slow filesystem operations");
    for row in slow.iter().take(TOP_N) {
        let _ = writeln!(
            out,
            "  {}: slow_ops={} max_ms={:.2}",
            row.target, row.slow_ops, row.max_ms
        );
    }
    let _ = writeln!(out);
}

fn render_anomalies(out: &mut String, snapshot: &DiagSnapshot) {
    let _ = writeln!(out, "Anomalies");
    if snapshot.anomalies.is_empty() {
        let _ = writeln!(out, "  none detected");
        return;
    }
    for anomaly in &snapshot.anomalies {
        let _ = writeln!(
            out,
            "  [{}] {} {}: {}",
            anomaly.severity.label(),
            anomaly.category.label(),
            anomaly.target,
            anomaly.description
        );
    }
}

fn network_summary(snapshot: &DiagSnapshot) -> Option<&CategorySummary> {
    snapshot
        .categories
        .iter()
        .find(|c| c.category == crate::event::Category::Network)
}
