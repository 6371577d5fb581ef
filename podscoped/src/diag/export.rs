use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};

use super::DiagSnapshot;

/// Canonical JSON export shape:
/// `{ "summary": {...}, "categories": {"dns": {...}, ...},
///    "anomalies": [...], "generated_at": "<RFC3339>" }`.
pub fn to_json(snapshot: &DiagSnapshot, generated_at: DateTime<Utc>) -> Value {
    let mut categories = Map::new();
    for category in &snapshot.categories {
        categories.insert(
            category.category.label().to_string(),
            json!({
                "total": category.total,
                "errors": category.errors,
                "p50_ms": category.p50_ms,
                "p95_ms": category.p95_ms,
                "p99_ms": category.p99_ms,
                "max_ms": category.max_ms,
                "targets": category.targets,
            }),
        );
    }

    json!({
        "summary": {
            "events": snapshot.consumed,
            "anomalies": snapshot.anomalies.len(),
            "external_targets": snapshot.external_hits,
        },
        "categories": Value::Object(categories),
        "anomalies": snapshot.anomalies,
        "generated_at": generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
}

/// One CSV row per aggregated (category, target) tuple.
pub fn to_csv(snapshot: &DiagSnapshot) -> String {
    let mut out = String::from("category,target,count,errors,p50_ms,p95_ms,p99_ms,max_ms\n");
    for category in &snapshot.categories {
        for row in &category.targets {
            out.push_str(&format!(
                "{},{},{},{},{:.3},{:.3},{:.3},{:.3}\n",
                escape_csv(category.category.label()),
                escape_csv(&row.target),
                row.count,
                row.errors,
                row.p50_ms,
                row.p95_ms,
                row.p99_ms,
                row.max_ms
            ));
        }
    }
    out
}

/// RFC 4180 quoting: fields containing a comma, quote, CR, or LF are
/// wrapped in double quotes with inner quotes doubled.
fn escape_csv(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::{Diagnostician, Thresholds};
    use crate::event::{Event, EventKind};
    use crate::k8s::KubernetesContext;
    use chrono::TimeZone;

    fn diag_with_events() -> Diagnostician {
        let d = Diagnostician::new(
            "Pod Diagnostics",
            Thresholds {
                error_rate_pct: 10.0,
                rtt_spike_ns: 100_000_000,
                fs_slow_ns: 100_000_000,
                spike_escalation_per_min: 60,
            },
        );
        let mut e = Event::blank();
        e.kind = EventKind::Dns;
        e.pid = 5;
        e.target.push_str("example.com");
        e.latency_ns = 1_500_000;
        d.add_event(&e, &KubernetesContext::default());
        d
    }

    #[test]
    fn json_has_the_canonical_shape() {
        let snapshot = diag_with_events().snapshot();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let value = to_json(&snapshot, at);
        assert_eq!(value["summary"]["events"], 1);
        assert!(value["categories"]["dns"].is_object());
        assert_eq!(value["categories"]["dns"]["total"], 1);
        assert!(value["categories"]["network"].is_object());
        assert!(value["anomalies"].is_array());
        assert_eq!(value["generated_at"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn csv_has_header_and_rows() {
        let csv = to_csv(&diag_with_events().snapshot());
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("category,target,count,errors,p50_ms,p95_ms,p99_ms,max_ms")
        );
        let row = lines.next().expect("one data row");
        assert!(row.starts_with("dns,example.com,1,0,"));
    }

    #[test]
    fn csv_fields_are_rfc4180_quoted() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_csv("line\nbreak"), "\"line\nbreak\"");
        assert_eq!(escape_csv("cr\rhere"), "\"cr\rhere\"");
    }

    #[test]
    fn csv_quoted_fields_round_trip() {
        // A minimal RFC4180 read-back of one quoted field.
        let original = "target,with \"quotes\"\nand newline";
        let escaped = escape_csv(original);
        assert!(escaped.starts_with('"') && escaped.ends_with('"'));
        let inner = &escaped[1..escaped.len() - 1];
        let unescaped = inner.replace("\"\"", "\"");
        assert_eq!(unescaped, original);
    }
}
