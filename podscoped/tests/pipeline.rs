use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointPort, EndpointSlice};
use kube::core::ObjectMeta;
use podscope_wire::RawRecord;
use tempfile::TempDir;

use podscoped::cgroup::{CgroupMembership, CgroupMembershipOptions};
use podscoped::diag::{Diagnostician, Severity, Thresholds};
use podscoped::event::{Category, Event, EventKind};
use podscoped::filter::EventFilter;
use podscoped::ingest::codec::EventCodec;
use podscoped::ingest::source::{ChannelSource, NoStacks};
use podscoped::k8s::{
    ClusterIndex, Enricher, K8sEnricher, K8sEnricherOptions, NoopEnricher, SourceIdentity,
    SERVICE_NAME_LABEL,
};
use podscoped::metrics::Metrics;
use podscoped::procname::ProcessNameCache;
use podscoped::runtime::{PipelineHandles, RuntimeOptions, TracerRuntime};

fn record(kind: EventKind, pid: u32, target: &str, error: i32, latency_ns: u64) -> Bytes {
    let mut raw = RawRecord::zeroed();
    raw.kind = kind as u32;
    raw.pid = pid;
    raw.tid = pid;
    raw.error = error;
    raw.latency_ns = latency_ns;
    raw.set_target(target.as_bytes());
    Bytes::copy_from_slice(bytemuck::bytes_of(&raw))
}

fn default_thresholds() -> Thresholds {
    Thresholds {
        error_rate_pct: 10.0,
        rtt_spike_ns: 100 * 1_000_000,
        fs_slow_ns: 100 * 1_000_000,
        spike_escalation_per_min: 60,
    }
}

struct Fixture {
    handles: PipelineHandles,
    metrics: Arc<Metrics>,
    diagnostician: Arc<Diagnostician>,
    codec: Arc<EventCodec>,
}

fn fixture(filter: EventFilter, proc_base: PathBuf, target_cgroup: Option<&str>) -> Fixture {
    let metrics = Arc::new(Metrics::new());
    let diagnostician = Arc::new(Diagnostician::new("Pod Diagnostics", default_thresholds()));
    let codec = Arc::new(EventCodec::new(64, Arc::clone(&metrics)));
    let handles = PipelineHandles {
        codec: Arc::clone(&codec),
        membership: Arc::new(CgroupMembership::new(
            target_cgroup,
            CgroupMembershipOptions {
                proc_base: proc_base.clone(),
                cgroup_base: "/sys/fs/cgroup".into(),
                capacity: 64,
                eviction_ratio: 0.9,
                ttl: Duration::from_secs(60),
                max_file_path_len: 4096,
            },
            Arc::clone(&metrics),
        )),
        names: Arc::new(ProcessNameCache::new(
            proc_base,
            64,
            0.9,
            Duration::from_secs(60),
            Arc::clone(&metrics),
        )),
        filter,
        stacks: Arc::new(NoStacks),
        enricher: Arc::new(NoopEnricher::new(SourceIdentity::default())),
        diagnostician: Arc::clone(&diagnostician),
        metrics: Arc::clone(&metrics),
    };
    Fixture {
        handles,
        metrics,
        diagnostician,
        codec,
    }
}

fn options(queue: usize) -> RuntimeOptions {
    RuntimeOptions {
        event_channel_buffer: queue,
        report_interval: Duration::from_secs(3600),
        error_log_interval: Duration::from_secs(5),
        high_error_count_threshold: 100,
    }
}

async fn run_pipeline(fixture: Fixture, records: Vec<Bytes>, queue: usize) -> Fixture {
    let (tx, source) = ChannelSource::pair(records.len().max(1));
    for rec in records {
        tx.send(rec).await.unwrap();
    }
    drop(tx);

    let reader_handles = PipelineHandles {
        codec: Arc::clone(&fixture.handles.codec),
        membership: Arc::clone(&fixture.handles.membership),
        names: Arc::clone(&fixture.handles.names),
        filter: fixture.handles.filter,
        stacks: Arc::clone(&fixture.handles.stacks),
        enricher: Arc::clone(&fixture.handles.enricher),
        diagnostician: Arc::clone(&fixture.handles.diagnostician),
        metrics: Arc::clone(&fixture.handles.metrics),
    };
    let runtime = TracerRuntime::spawn(Box::new(source), reader_handles, options(queue));
    assert!(runtime.join().await, "pipeline task panicked");
    fixture
}

// S1: a DNS target failing 20 of 25 lookups crosses the 10% error-rate
// threshold with exactly one anomaly at 80%.
#[tokio::test]
async fn s1_dns_error_rate_anomaly() {
    let mut records = Vec::new();
    for _ in 0..20 {
        records.push(record(EventKind::Dns, 100, "example.com", 3, 2_000_000));
    }
    for _ in 0..5 {
        records.push(record(EventKind::Dns, 100, "example.com", 0, 2_000_000));
    }
    let fx = run_pipeline(fixture(EventFilter::all(), PathBuf::from("/nonexistent"), None), records, 100).await;

    fx.diagnostician.finish();
    let snapshot = fx.diagnostician.snapshot();
    let dns_anomalies: Vec<_> = snapshot
        .anomalies
        .iter()
        .filter(|a| a.category == Category::Dns)
        .collect();
    assert_eq!(dns_anomalies.len(), 1, "expected exactly one DNS anomaly");
    let anomaly = dns_anomalies[0];
    assert_eq!(anomaly.target, "example.com");
    assert!(anomaly.severity >= Severity::Warning);
    assert!(
        anomaly.description.contains("80.0%"),
        "description should carry the 80% rate: {}",
        anomaly.description
    );
}

// S2: 100 TCP sends at 200ms against a 100ms spike threshold all count as
// RTT spikes for the target.
#[tokio::test]
async fn s2_rtt_spike_detection() {
    let records = (0..100)
        .map(|_| record(EventKind::TcpSend, 100, "10.0.0.5:443", 0, 200_000_000))
        .collect();
    let fx = run_pipeline(fixture(EventFilter::all(), PathBuf::from("/nonexistent"), None), records, 200).await;

    fx.diagnostician.finish();
    let report = fx.diagnostician.generate_report();
    assert!(report.contains("RTT spikes"), "report:\n{report}");
    assert!(
        report.contains("10.0.0.5:443: spike_count=100"),
        "report:\n{report}"
    );
}

// S3: a PID whose cgroup is another pod's never reaches the diagnostician.
#[tokio::test]
async fn s3_cgroup_filter_excludes_outsider() {
    let proc_root = TempDir::new().unwrap();
    let pid_dir = proc_root.path().join("1234");
    std::fs::create_dir_all(&pid_dir).unwrap();
    std::fs::write(pid_dir.join("cgroup"), "0::/kubepods/podB/container1\n").unwrap();

    let fx = fixture(
        EventFilter::all(),
        proc_root.path().to_path_buf(),
        Some("/kubepods/podA"),
    );
    let records = vec![record(EventKind::TcpSend, 1234, "10.0.0.9:80", 0, 0)];
    let fx = run_pipeline(fx, records, 16).await;

    assert_eq!(fx.diagnostician.consumed(), 0);
    assert_eq!(fx.metrics.accounting().filtered_cgroup, 1);
    assert!(fx.metrics.accounting().balances());
}

// S4: an event rejected by the category filter goes back to the pool; the
// pool size is unchanged over the full cycle.
#[tokio::test]
async fn s4_filtered_event_returns_to_pool() {
    let fx = fixture(
        EventFilter::parse("fs").unwrap(),
        PathBuf::from("/nonexistent"),
        None,
    );
    // Seed the pool so the decode takes its event from there.
    fx.codec.recycle(Event::blank());
    assert_eq!(fx.codec.pool_len(), 1);

    let records = vec![record(EventKind::Dns, 100, "example.com", 0, 0)];
    let fx = run_pipeline(fx, records, 16).await;

    assert_eq!(fx.metrics.accounting().filtered_category, 1);
    assert_eq!(fx.diagnostician.consumed(), 0);
    assert_eq!(fx.codec.pool_len(), 1, "pool size changed over the cycle");
}

fn slice(addr: &str, port: u16, service: &str, namespace: &str) -> EndpointSlice {
    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(format!("{service}-abc12")),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [(SERVICE_NAME_LABEL.to_string(), service.to_string())]
                    .into_iter()
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints: vec![Endpoint {
            addresses: vec![addr.to_string()],
            ..Default::default()
        }],
        ports: Some(vec![EndpointPort {
            port: Some(i32::from(port)),
            ..Default::default()
        }]),
    }
}

fn index_enricher(index: Arc<ClusterIndex>) -> K8sEnricher {
    K8sEnricher::new(
        SourceIdentity {
            namespace: "observability".into(),
            labels: BTreeMap::new(),
        },
        index,
        None,
        K8sEnricherOptions {
            api_timeout: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(300),
            cache_size: 128,
            eviction_ratio: 0.9,
        },
        Arc::new(Metrics::new()),
    )
}

// S5: an EndpointSlice carrying the service-name label resolves the target
// to a service, with no pod match.
#[tokio::test]
async fn s5_enrichment_by_service() {
    let index = Arc::new(ClusterIndex::new());
    index.apply_slice(&slice("10.1.2.3", 80, "api", "prod"));
    let enricher = index_enricher(index);

    let mut event = Event::blank();
    event.kind = EventKind::TcpSend;
    event.pid = 100;
    event.target.push_str("10.1.2.3:80");

    let ctx = enricher.enrich(&event).await;
    assert_eq!(ctx.service_name, "api");
    assert_eq!(ctx.service_namespace, "prod");
    assert_eq!(ctx.service_port, 80);
    assert_eq!(ctx.target_pod, "");
    assert!(!ctx.is_external);
}

// S6: a globally routable address with no informer match classifies as
// external.
#[tokio::test]
async fn s6_external_classification() {
    let enricher = index_enricher(Arc::new(ClusterIndex::new()));

    let mut event = Event::blank();
    event.kind = EventKind::UdpSend;
    event.pid = 100;
    event.target.push_str("8.8.8.8:53");

    let ctx = enricher.enrich(&event).await;
    assert!(ctx.is_external);
    assert_eq!(ctx.target_pod, "");
    assert_eq!(ctx.service_name, "");
}

// Drop accounting: everything the reader observes lands in exactly one
// bucket, even when the queue overflows.
#[tokio::test]
async fn drop_accounting_balances_under_overload() {
    let mut records = Vec::new();
    for i in 0..50 {
        records.push(record(EventKind::Dns, 100 + i, "example.com", 0, 0));
    }
    // Some rejects too: invalid pid and an unknown discriminant.
    records.push(record(EventKind::Dns, 0, "x", 0, 0));
    let mut bogus = RawRecord::zeroed();
    bogus.kind = 999;
    records.push(Bytes::copy_from_slice(bytemuck::bytes_of(&bogus)));

    let fx = run_pipeline(
        fixture(EventFilter::all(), PathBuf::from("/nonexistent"), None),
        records,
        1,
    )
    .await;

    let acct = fx.metrics.accounting();
    assert_eq!(acct.observed, 52);
    assert_eq!(acct.decode_rejected, 1);
    assert_eq!(acct.invalid_pid, 1);
    assert!(acct.balances(), "accounting out of balance: {acct:?}");
}

// Report idempotence through the full pipeline: no events between two
// renders means byte-identical output.
#[tokio::test]
async fn report_is_stable_between_renders() {
    let records = (0..30)
        .map(|_| record(EventKind::Dns, 100, "example.com", 3, 1_000_000))
        .collect();
    let fx = run_pipeline(
        fixture(EventFilter::all(), PathBuf::from("/nonexistent"), None),
        records,
        100,
    )
    .await;
    fx.diagnostician.finish();
    assert_eq!(
        fx.diagnostician.generate_report(),
        fx.diagnostician.generate_report()
    );
}

// CSV injection defense end to end: a hostile target string stays inside
// one quoted field.
#[tokio::test]
async fn csv_export_quotes_hostile_targets() {
    let records = vec![record(
        EventKind::Dns,
        100,
        "evil,\"name\"\ninjected",
        0,
        1_000_000,
    )];
    let fx = run_pipeline(
        fixture(EventFilter::all(), PathBuf::from("/nonexistent"), None),
        records,
        16,
    )
    .await;
    fx.diagnostician.finish();
    let csv = fx.diagnostician.export_csv();
    assert!(
        csv.contains("\"evil,\"\"name\"\"\ninjected\""),
        "csv:\n{csv}"
    );
    // Header plus exactly one logical record (the quoted field spans lines).
    assert!(csv.starts_with("category,target,count,errors,p50_ms,p95_ms,p99_ms,max_ms\n"));
}
