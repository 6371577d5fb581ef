use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use log::{info, warn};
use once_cell::sync::Lazy;
use podscope_wire::RAW_RECORD_LEN;
use tokio::time::sleep;

use podscoped::cgroup::{CgroupMembership, CgroupMembershipOptions};
use podscoped::config::{validate_k8s_name, Config};
use podscoped::diag::{Diagnostician, Thresholds};
use podscoped::filter::EventFilter;
use podscoped::ingest::codec::EventCodec;
use podscoped::ingest::source::{
    ChannelSource, KernelStackResolver, NoStacks, RecordSource, RingBufSource, StackResolver,
};
use podscoped::k8s::{
    connect_enricher, Enricher, K8sEnricherOptions, NoopEnricher, SourceIdentity,
};
use podscoped::metrics::Metrics;
use podscoped::procname::ProcessNameCache;
use podscoped::runtime::{PipelineHandles, RuntimeOptions, TracerRuntime};

// Cache hostname to avoid repeated syscalls
static HOSTNAME: Lazy<Option<String>> =
    Lazy::new(|| hostname::get().ok().and_then(|h| h.into_string().ok()));

#[derive(Parser, Debug)]
#[command(name = "podscoped")]
#[command(about = "Per-pod eBPF diagnostic tracer")]
struct Args {
    /// Target pod name (identity for the report header)
    #[arg(long)]
    pod: Option<String>,
    /// Target pod namespace
    #[arg(long, default_value = "default")]
    namespace: String,
    /// Target container name
    #[arg(long)]
    container: Option<String>,
    /// Resolved cgroup path of the target container; without it every PID
    /// on the node is traced
    #[arg(long, value_name = "PATH")]
    cgroup_path: Option<String>,
    /// Enabled event categories, comma separated
    #[arg(long, default_value = "dns,net,fs,cpu,proc")]
    filter: String,
    /// Stop after this many seconds (0 = run until interrupted)
    #[arg(long, default_value_t = 0)]
    duration: u64,
    /// Pinned ring buffer map written by the loader
    #[arg(long, value_name = "PATH", default_value = "/sys/fs/bpf/podscope/events")]
    ringbuf_pin: PathBuf,
    /// Pinned stack-trace map (optional)
    #[arg(long, value_name = "PATH")]
    stacks_pin: Option<PathBuf>,
    /// Replay raw records from a file instead of the ring buffer
    #[arg(long, value_name = "PATH")]
    replay: Option<PathBuf>,
    /// Write the JSON export here on exit
    #[arg(long, value_name = "PATH")]
    json: Option<PathBuf>,
    /// Write the CSV export here on exit
    #[arg(long, value_name = "PATH")]
    csv: Option<PathBuf>,
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override thresholds.error_rate_pct
    #[arg(long)]
    error_rate_threshold: Option<f64>,
    /// Override thresholds.rtt_spike_ms
    #[arg(long)]
    rtt_spike_ms: Option<u64>,
    /// Override thresholds.fs_slow_ms
    #[arg(long)]
    fs_slow_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    // --- Validate user input before touching anything else ---
    if let Some(pod) = &args.pod {
        validate_k8s_name("pod", pod)?;
    }
    validate_k8s_name("namespace", &args.namespace)?;
    if let Some(container) = &args.container {
        validate_k8s_name("container", container)?;
    }
    let filter = EventFilter::parse(&args.filter)?;
    if filter.is_empty() {
        warn!("[podscoped] empty filter: every event will be dropped");
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(v) = args.error_rate_threshold {
        config.thresholds.error_rate_pct = v;
    }
    if let Some(v) = args.rtt_spike_ms {
        config.thresholds.rtt_spike_ms = v;
    }
    if let Some(v) = args.fs_slow_ms {
        config.thresholds.fs_slow_ms = v;
    }
    config.validate()?;

    println!("[podscoped] starting per-pod tracer...");

    let metrics = Arc::new(Metrics::new());

    let membership = Arc::new(CgroupMembership::new(
        args.cgroup_path.as_deref(),
        CgroupMembershipOptions {
            proc_base: config.paths.proc_base_path.clone(),
            cgroup_base: config.paths.cgroup_base_path.clone(),
            capacity: config.caches.max_pid_cache_size,
            eviction_ratio: config.caches.eviction_ratio,
            ttl: Duration::from_secs(config.caches.cgroup_ttl_secs),
            max_file_path_len: config.caches.max_cgroup_file_path_len,
        },
        Arc::clone(&metrics),
    ));
    if args.cgroup_path.is_none() {
        warn!("[podscoped] no --cgroup-path given; tracing every PID on this node");
    }

    let names = Arc::new(ProcessNameCache::new(
        config.paths.proc_base_path.clone(),
        config.caches.max_process_cache_size,
        config.caches.eviction_ratio,
        Duration::from_secs(config.caches.process_name_ttl_secs),
        Arc::clone(&metrics),
    ));

    // --- Event source: replay file or the loader's pinned ring buffer ---
    let source: Box<dyn RecordSource> = match &args.replay {
        Some(path) => Box::new(spawn_replay(path.clone())?),
        None => Box::new(
            RingBufSource::from_pin(&args.ringbuf_pin).with_context(|| {
                format!(
                    "cannot open pinned ring buffer {} (is the loader running?)",
                    args.ringbuf_pin.display()
                )
            })?,
        ),
    };

    // --- Optional stack-trace capability ---
    let stacks: Arc<dyn StackResolver> = match &args.stacks_pin {
        Some(path) => match KernelStackResolver::from_pin(path) {
            Ok(resolver) => Arc::new(resolver),
            Err(err) => {
                warn!(
                    "[podscoped] stack map {} unavailable ({err}); stacks disabled",
                    path.display()
                );
                Arc::new(NoStacks)
            }
        },
        None => Arc::new(NoStacks),
    };

    // --- Kubernetes enrichment, degrading to source-identity only ---
    let source_identity = SourceIdentity::detect();
    let enricher: Arc<dyn Enricher> = if config.k8s.enabled {
        match connect_enricher(
            source_identity.clone(),
            K8sEnricherOptions {
                api_timeout: config.k8s.api_timeout(),
                cache_ttl: config.k8s.cache_ttl(),
                cache_size: config.k8s.cache_size,
                eviction_ratio: config.caches.eviction_ratio,
            },
            config.k8s.informer_sync_timeout(),
            Arc::clone(&metrics),
        )
        .await
        {
            Ok(enricher) => Arc::new(enricher),
            Err(err) => {
                warn!("[podscoped] kubernetes unavailable ({err}); enrichment disabled");
                Arc::new(NoopEnricher::new(source_identity))
            }
        }
    } else {
        Arc::new(NoopEnricher::new(source_identity))
    };

    let title = match &args.pod {
        Some(pod) => format!("Pod Diagnostics: {}/{}", args.namespace, pod),
        None => format!(
            "Pod Diagnostics: {}",
            HOSTNAME.clone().unwrap_or_else(|| "local".to_string())
        ),
    };
    let diagnostician = Arc::new(Diagnostician::new(
        title,
        Thresholds::from(&config.thresholds),
    ));

    let codec = Arc::new(EventCodec::new(
        config.runtime.event_pool_size,
        Arc::clone(&metrics),
    ));

    let mut runtime = TracerRuntime::spawn(
        source,
        PipelineHandles {
            codec,
            membership,
            names,
            filter,
            stacks,
            enricher,
            diagnostician: Arc::clone(&diagnostician),
            metrics: Arc::clone(&metrics),
        },
        RuntimeOptions {
            event_channel_buffer: config.runtime.event_channel_buffer,
            report_interval: Duration::from_secs(config.runtime.report_interval_secs),
            error_log_interval: Duration::from_secs(config.logging.error_log_interval_secs),
            high_error_count_threshold: config.logging.high_error_count_threshold,
        },
    );

    spawn_self_guard(config.runtime.cpu_target_pct, config.runtime.rss_cap_mb);

    println!("[podscoped] running. Press Ctrl+C for the final report.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("[podscoped] interrupt received");
        }
        _ = deadline(args.duration) => {
            info!("[podscoped] run duration elapsed");
        }
        _ = runtime.wait_reader() => {
            info!("[podscoped] event stream ended");
        }
    }

    runtime.shutdown();
    let healthy = runtime.join().await;
    if !healthy {
        log::error!("[podscoped] a pipeline task panicked during the run");
    }

    diagnostician.finish();
    println!("{}", diagnostician.generate_report());

    let accounting = metrics.accounting();
    info!(
        "[podscoped] observed={} consumed={} dropped={} decode_rejected={}",
        accounting.observed, accounting.consumed, accounting.dropped, accounting.decode_rejected
    );

    if let Some(path) = &args.json {
        let value = diagnostician.export_json();
        std::fs::write(path, serde_json::to_string_pretty(&value)?)
            .with_context(|| format!("cannot write JSON export to {}", path.display()))?;
        println!("[podscoped] JSON export written to {}", path.display());
    }
    if let Some(path) = &args.csv {
        std::fs::write(path, diagnostician.export_csv())
            .with_context(|| format!("cannot write CSV export to {}", path.display()))?;
        println!("[podscoped] CSV export written to {}", path.display());
    }

    Ok(())
}

async fn deadline(duration_secs: u64) {
    if duration_secs == 0 {
        std::future::pending::<()>().await;
    } else {
        sleep(Duration::from_secs(duration_secs)).await;
    }
}

/// Feeds fixed-size raw records from a capture file through a channel
/// source. A trailing partial record is rejected by the codec like any
/// other short read.
fn spawn_replay(path: PathBuf) -> anyhow::Result<ChannelSource> {
    let data = std::fs::read(&path)
        .with_context(|| format!("cannot read replay file {}", path.display()))?;
    info!(
        "[podscoped] replaying {} records from {}",
        data.len() / RAW_RECORD_LEN,
        path.display()
    );
    let (tx, source) = ChannelSource::pair(1024);
    tokio::spawn(async move {
        for chunk in data.chunks(RAW_RECORD_LEN) {
            if tx.send(Bytes::copy_from_slice(chunk)).await.is_err() {
                break;
            }
        }
    });
    Ok(source)
}

/// Watches the tracer's own CPU and RSS so the observer never becomes the
/// problem it is diagnosing. Warn-only.
fn spawn_self_guard(cpu_target_pct: u64, rss_cap_mb: u64) {
    tokio::spawn(async move {
        use procfs::{page_size, process::Process, ticks_per_second};
        let ticks = ticks_per_second() as f64;
        let page_kb = page_size() / 1024;
        let mut prev_total = 0u64;
        loop {
            if let Ok(stat) = Process::myself().and_then(|proc| proc.stat()) {
                let total = stat.utime + stat.stime;
                let dt = total.saturating_sub(prev_total);
                prev_total = total;
                let cpu_pct = (dt as f64 / ticks) * 100.0;
                let rss_mb = stat.rss * page_kb / 1024;
                if cpu_pct > cpu_target_pct as f64 {
                    warn!("cpu usage {:.1}% exceeds target {}", cpu_pct, cpu_target_pct);
                }
                if rss_mb > rss_cap_mb {
                    warn!("rss {}MB exceeds cap {}", rss_mb, rss_cap_mb);
                }
            }
            sleep(Duration::from_secs(1)).await;
        }
    });
}
