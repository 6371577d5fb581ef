use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use crate::cgroup::CgroupMembership;
use crate::event::{pid_is_valid, Event};
use crate::filter::EventFilter;
use crate::ingest::codec::EventCodec;
use crate::ingest::source::{RecordSource, StackResolver};
use crate::metrics::Metrics;
use crate::procname::ProcessNameCache;

pub struct ReaderConfig {
    pub error_log_interval: Duration,
    pub high_error_count_threshold: u64,
}

/// Everything the reader loop needs, passed down as owned handles from the
/// runtime; the reader holds no global state.
pub struct ReaderHandles {
    pub codec: Arc<EventCodec>,
    pub membership: Arc<CgroupMembership>,
    pub names: Arc<ProcessNameCache>,
    pub filter: EventFilter,
    pub stacks: Arc<dyn StackResolver>,
    pub metrics: Arc<Metrics>,
}

/// Collapses bursts of consecutive read errors into one representative log
/// line per interval, escalating to a warning when the burst is large.
struct ErrorLogLimiter {
    interval: Duration,
    high_threshold: u64,
    window_start: Option<Instant>,
    count_in_window: u64,
}

impl ErrorLogLimiter {
    fn new(interval: Duration, high_threshold: u64) -> Self {
        Self {
            interval,
            high_threshold,
            window_start: None,
            count_in_window: 0,
        }
    }

    fn observe(&mut self, err: &io::Error) {
        match self.window_start {
            None => {
                info!("[reader] ring buffer read error: {err}");
                self.window_start = Some(Instant::now());
                self.count_in_window = 1;
            }
            Some(start) if start.elapsed() >= self.interval => {
                if self.count_in_window > self.high_threshold {
                    warn!(
                        "[reader] {} read errors in the last {:?}, most recent: {err}",
                        self.count_in_window, self.interval
                    );
                } else {
                    info!(
                        "[reader] {} read errors in the last {:?}, most recent: {err}",
                        self.count_in_window, self.interval
                    );
                }
                self.window_start = Some(Instant::now());
                self.count_in_window = 1;
            }
            Some(_) => {
                self.count_in_window += 1;
            }
        }
    }
}

/// The ingestion loop: read, decode, filter by cgroup, resolve the process
/// name, filter by category, attach stacks, and hand off through the bounded
/// queue. Enqueue never blocks; a full queue drops the event with
/// accounting. EOF on the source ends the loop cleanly, which closes the
/// queue and lets the consumer drain.
pub async fn run_reader(
    mut source: Box<dyn RecordSource>,
    handles: ReaderHandles,
    tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
    config: ReaderConfig,
) {
    let mut limiter =
        ErrorLogLimiter::new(config.error_log_interval, config.high_error_count_threshold);
    loop {
        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("[reader] shutdown requested");
                    break;
                }
                continue;
            }
            record = source.next_record() => record,
        };
        match next {
            Ok(Some(data)) => {
                if !handle_record(&handles, &tx, &data) {
                    // Queue closed: the consumer is gone and nothing more
                    // can be delivered.
                    break;
                }
            }
            Ok(None) => {
                info!("[reader] event stream ended");
                break;
            }
            Err(err) => {
                handles.metrics.record_read_error();
                handles
                    .metrics
                    .record_error("read", err.raw_os_error().unwrap_or(0));
                limiter.observe(&err);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    // Dropping tx here closes the handoff queue.
}

/// Runs one record through the pipeline stages. Returns false only when the
/// handoff queue is closed.
fn handle_record(handles: &ReaderHandles, tx: &mpsc::Sender<Event>, data: &[u8]) -> bool {
    handles.metrics.record_event_observed();

    let Some(mut event) = handles.codec.decode(data) else {
        return true;
    };
    if !pid_is_valid(event.pid) {
        handles.metrics.record_invalid_pid();
        handles.codec.recycle(event);
        return true;
    }
    if !handles.membership.is_in_cgroup(event.pid) {
        handles.metrics.record_filtered_cgroup();
        handles.codec.recycle(event);
        return true;
    }
    let name = handles.names.lookup(event.pid);
    if !name.is_empty() {
        event.process_name.push_str(&name);
    }
    if !handles.filter.allows(event.kind) {
        handles.metrics.record_filtered_category();
        handles.codec.recycle(event);
        return true;
    }
    if event.stack_key != 0 {
        if let Some(frames) = handles.stacks.resolve(event.stack_key) {
            event.stack = frames;
        }
    }
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            handles.metrics.record_ring_buffer_drop();
            handles.codec.recycle(event);
            true
        }
        Err(TrySendError::Closed(event)) => {
            handles.codec.recycle(event);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupMembershipOptions;
    use crate::event::EventKind;
    use crate::ingest::source::{ChannelSource, NoStacks};
    use bytes::Bytes;
    use podscope_wire::RawRecord;
    use std::path::PathBuf;

    fn record_bytes(kind: EventKind, pid: u32, target: &[u8]) -> Bytes {
        let mut raw = RawRecord::zeroed();
        raw.kind = kind as u32;
        raw.pid = pid;
        raw.tid = pid;
        raw.set_target(target);
        Bytes::copy_from_slice(bytemuck::bytes_of(&raw))
    }

    async fn run_to_completion(
        source_records: Vec<Bytes>,
        filter: EventFilter,
        queue: usize,
    ) -> (ReaderHandles, mpsc::Receiver<Event>) {
        let (src_tx, source) = ChannelSource::pair(source_records.len().max(1));
        for record in source_records {
            src_tx.send(record).await.unwrap();
        }
        drop(src_tx);

        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = mpsc::channel(queue);
        let handles = ReaderHandles {
            codec: Arc::new(EventCodec::new(16, Arc::clone(&metrics))),
            membership: Arc::new(CgroupMembership::new(
                None,
                CgroupMembershipOptions {
                    proc_base: PathBuf::from("/nonexistent"),
                    cgroup_base: "/sys/fs/cgroup".into(),
                    capacity: 16,
                    eviction_ratio: 0.9,
                    ttl: Duration::from_secs(60),
                    max_file_path_len: 4096,
                },
                Arc::clone(&metrics),
            )),
            names: Arc::new(ProcessNameCache::new(
                PathBuf::from("/nonexistent"),
                16,
                0.9,
                Duration::from_secs(60),
                Arc::clone(&metrics),
            )),
            filter,
            stacks: Arc::new(NoStacks),
            metrics: Arc::clone(&metrics),
        };
        let reader_handles = ReaderHandles {
            codec: Arc::clone(&handles.codec),
            membership: Arc::clone(&handles.membership),
            names: Arc::clone(&handles.names),
            filter: handles.filter,
            stacks: Arc::clone(&handles.stacks),
            metrics: Arc::clone(&handles.metrics),
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        run_reader(
            Box::new(source),
            reader_handles,
            tx,
            shutdown_rx,
            ReaderConfig {
                error_log_interval: Duration::from_secs(5),
                high_error_count_threshold: 100,
            },
        )
        .await;
        (handles, rx)
    }

    #[tokio::test]
    async fn events_flow_through_to_the_queue() {
        let records = vec![record_bytes(EventKind::Dns, 10, b"example.com")];
        let (handles, mut rx) = run_to_completion(records, EventFilter::all(), 4).await;
        let event = rx.recv().await.expect("event should be queued");
        assert_eq!(event.kind, EventKind::Dns);
        assert_eq!(event.target, "example.com");
        assert_eq!(handles.metrics.events_observed(), 1);
        assert_eq!(handles.metrics.ring_buffer_drops(), 0);
    }

    #[tokio::test]
    async fn filtered_kind_is_returned_to_the_pool() {
        // DNS event against an fs-only filter: rejected, pool regains it.
        let records = vec![record_bytes(EventKind::Dns, 10, b"example.com")];
        let (handles, mut rx) = run_to_completion(records, EventFilter::parse("fs").unwrap(), 4).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(handles.metrics.accounting().filtered_category, 1);
        assert_eq!(handles.codec.pool_len(), 1);
    }

    #[tokio::test]
    async fn full_queue_drops_with_accounting() {
        let records = vec![
            record_bytes(EventKind::Dns, 10, b"a.example"),
            record_bytes(EventKind::Dns, 10, b"b.example"),
            record_bytes(EventKind::Dns, 10, b"c.example"),
        ];
        let (handles, mut rx) = run_to_completion(records, EventFilter::all(), 1).await;
        // Queue capacity 1: exactly one delivered, the rest dropped.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert_eq!(handles.metrics.ring_buffer_drops(), 2);
    }

    #[tokio::test]
    async fn invalid_pid_is_dropped() {
        let records = vec![
            record_bytes(EventKind::Dns, 0, b"x"),
            record_bytes(EventKind::Dns, 1 << 22, b"y"),
        ];
        let (handles, mut rx) = run_to_completion(records, EventFilter::all(), 4).await;
        assert!(rx.recv().await.is_none());
        assert_eq!(handles.metrics.accounting().invalid_pid, 2);
    }

    #[test]
    fn error_limiter_logs_once_per_window() {
        let mut limiter = ErrorLogLimiter::new(Duration::from_secs(5), 10);
        for _ in 0..100 {
            limiter.observe(&io::Error::new(io::ErrorKind::Other, "retry"));
        }
        assert_eq!(limiter.count_in_window, 100);
    }
}
