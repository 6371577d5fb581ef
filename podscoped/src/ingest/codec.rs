use std::sync::{Arc, Mutex};

use podscope_wire::{RawRecord, RecordKind, RAW_RECORD_LEN};

use crate::event::Event;
use crate::metrics::Metrics;

/// Decodes raw ring-buffer records into typed events and owns the event
/// allocation lifecycle through a fixed-size object pool.
///
/// Decoding is side-effect-free apart from pool allocation: a rejected
/// record increments the decode-error counter and nothing else. The pool is
/// strictly an optimization; under lock contention it falls back to fresh
/// allocation.
pub struct EventCodec {
    pool: Mutex<Vec<Event>>,
    pool_capacity: usize,
    metrics: Arc<Metrics>,
}

impl EventCodec {
    pub fn new(pool_capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            pool: Mutex::new(Vec::with_capacity(pool_capacity)),
            pool_capacity,
            metrics,
        }
    }

    /// Decode one raw record. Rejects short records and unknown type
    /// discriminants; invalid UTF-8 in the target is replaced, not fatal.
    pub fn decode(&self, data: &[u8]) -> Option<Event> {
        if data.len() < RAW_RECORD_LEN {
            self.metrics.record_decode_error();
            return None;
        }
        let raw: RawRecord = bytemuck::pod_read_unaligned(&data[..RAW_RECORD_LEN]);
        let Some(kind) = RecordKind::from_u32(raw.kind) else {
            self.metrics.record_decode_error();
            return None;
        };

        let mut event = self.get();
        event.kind = kind;
        event.timestamp_ns = raw.timestamp_ns;
        event.pid = raw.pid;
        event.tid = raw.tid;
        event.error = raw.error;
        event.latency_ns = raw.latency_ns;
        event.bytes = raw.bytes;
        event.tcp_state = raw.tcp_state;
        event.stack_key = raw.stack_key;
        event
            .target
            .push_str(&String::from_utf8_lossy(raw.target_bytes()));
        Some(event)
    }

    /// A cleared event from the pool, or a fresh allocation when the pool is
    /// empty or contended.
    pub fn get(&self) -> Event {
        match self.pool.try_lock() {
            Ok(mut pool) => pool.pop().unwrap_or_else(Event::blank),
            Err(_) => Event::blank(),
        }
    }

    /// Clears the event and returns it to the pool. Events beyond the pool
    /// capacity are simply dropped.
    pub fn recycle(&self, mut event: Event) {
        event.clear();
        if let Ok(mut pool) = self.pool.try_lock() {
            if pool.len() < self.pool_capacity {
                pool.push(event);
            }
        }
    }

    pub fn pool_len(&self) -> usize {
        self.pool.lock().unwrap().len()
    }
}
