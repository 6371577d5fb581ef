use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::cgroup::CgroupMembership;
use crate::diag::Diagnostician;
use crate::event::Event;
use crate::filter::EventFilter;
use crate::ingest::codec::EventCodec;
use crate::ingest::reader::{run_reader, ReaderConfig, ReaderHandles};
use crate::ingest::source::{RecordSource, StackResolver};
use crate::k8s::Enricher;
use crate::metrics::Metrics;
use crate::procname::ProcessNameCache;

pub struct RuntimeOptions {
    pub event_channel_buffer: usize,
    pub report_interval: Duration,
    pub error_log_interval: Duration,
    pub high_error_count_threshold: u64,
}

/// Owned handles for every pipeline stage. The runtime passes these down to
/// its tasks; nothing in the pipeline reaches for process-wide state.
pub struct PipelineHandles {
    pub codec: Arc<EventCodec>,
    pub membership: Arc<CgroupMembership>,
    pub names: Arc<ProcessNameCache>,
    pub filter: EventFilter,
    pub stacks: Arc<dyn StackResolver>,
    pub enricher: Arc<dyn Enricher>,
    pub diagnostician: Arc<Diagnostician>,
    pub metrics: Arc<Metrics>,
}

/// Orchestrates the pipeline: one reader task feeding the bounded queue,
/// one consumer task driving enrichment and the diagnostician, and a ticker
/// for metrics rollup and interim reports.
///
/// Cancellation: `shutdown()` (or source EOF) stops the reader, which
/// closes the queue; the consumer drains what is left and returns. A panic
/// in either task marks the runtime unhealthy instead of taking the
/// process down.
pub struct TracerRuntime {
    shutdown: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
    ticker: JoinHandle<()>,
    unhealthy: Arc<AtomicBool>,
}

impl TracerRuntime {
    pub fn spawn(
        source: Box<dyn RecordSource>,
        handles: PipelineHandles,
        options: RuntimeOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::channel::<Event>(options.event_channel_buffer);
        let unhealthy = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(run_reader(
            source,
            ReaderHandles {
                codec: Arc::clone(&handles.codec),
                membership: Arc::clone(&handles.membership),
                names: Arc::clone(&handles.names),
                filter: handles.filter,
                stacks: Arc::clone(&handles.stacks),
                metrics: Arc::clone(&handles.metrics),
            },
            event_tx,
            shutdown_rx.clone(),
            ReaderConfig {
                error_log_interval: options.error_log_interval,
                high_error_count_threshold: options.high_error_count_threshold,
            },
        ));
        let reader = supervise("reader", reader_task, Arc::clone(&unhealthy));

        let consumer_task = tokio::spawn(run_consumer(
            event_rx,
            Arc::clone(&handles.enricher),
            Arc::clone(&handles.diagnostician),
            Arc::clone(&handles.codec),
            Arc::clone(&handles.metrics),
        ));
        let consumer = supervise("consumer", consumer_task, Arc::clone(&unhealthy));

        let ticker = tokio::spawn(run_ticker(
            Arc::clone(&handles.diagnostician),
            Arc::clone(&handles.metrics),
            options.report_interval,
            shutdown_rx,
        ));

        Self {
            shutdown: shutdown_tx,
            reader: Some(reader),
            consumer: Some(consumer),
            ticker,
            unhealthy,
        }
    }

    /// Requests a clean stop: reader exits, queue closes, consumer drains.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Relaxed)
    }

    /// Resolves when the reader task ends (EOF or shutdown). Pends forever
    /// if the reader was already awaited.
    pub async fn wait_reader(&mut self) {
        match self.reader.as_mut() {
            Some(handle) => {
                let _ = handle.await;
                self.reader = None;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Waits for the pipeline to wind down. Returns false when a task
    /// panicked along the way.
    pub async fn join(mut self) -> bool {
        if let Some(handle) = self.reader.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.consumer.take() {
            let _ = handle.await;
        }
        self.shutdown.send_replace(true);
        let _ = self.ticker.await;
        !self.unhealthy.load(Ordering::Relaxed)
    }
}

fn supervise(
    name: &'static str,
    task: JoinHandle<()>,
    unhealthy: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = task.await {
            if err.is_panic() {
                unhealthy.store(true, Ordering::Relaxed);
                error!("[runtime] {name} task panicked: {err}");
            }
        }
    })
}

async fn run_consumer(
    mut rx: mpsc::Receiver<Event>,
    enricher: Arc<dyn Enricher>,
    diagnostician: Arc<Diagnostician>,
    codec: Arc<EventCodec>,
    metrics: Arc<Metrics>,
) {
    while let Some(event) = rx.recv().await {
        let started = Instant::now();
        let ctx = enricher.enrich(&event).await;
        diagnostician.add_event(&event, &ctx);
        metrics.record_event_consumed();
        metrics.record_event_processing_latency(started.elapsed());
        codec.recycle(event);
    }
    info!("[runtime] consumer drained, queue closed");
}

async fn run_ticker(
    diagnostician: Arc<Diagnostician>,
    metrics: Arc<Metrics>,
    report_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rollup = tokio::time::interval(Duration::from_secs(1));
    let mut report = tokio::time::interval(report_interval);
    report.tick().await; // the first tick fires immediately; skip it
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = rollup.tick() => {
                metrics.rollup();
            }
            _ = report.tick() => {
                info!(
                    "[runtime] events/s={} consumed={} drops={} decode_errors={}",
                    metrics.events_per_sec(),
                    metrics.events_consumed(),
                    metrics.ring_buffer_drops(),
                    metrics.decode_errors()
                );
                println!("{}", diagnostician.generate_report());
            }
        }
    }
}
