use std::collections::HashMap;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use aya::maps::{Map, MapData, RingBuf, StackTraceMap};
use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

/// Where raw event records come from. The production implementation wraps
/// the kernel ring buffer; tests and replay feed records through a channel.
///
/// `Ok(None)` is end-of-stream and terminates the reader cleanly; errors are
/// transient and the reader retries with rate-limited logging.
#[async_trait]
pub trait RecordSource: Send {
    async fn next_record(&mut self) -> io::Result<Option<Bytes>>;
}

/// Ring buffer source over an `aya` map opened by the (external) loader,
/// typically from a pinned path. Readiness is driven through `AsyncFd`, so
/// waiting for kernel records never spins.
pub struct RingBufSource {
    fd: AsyncFd<RingBuf<MapData>>,
}

impl RingBufSource {
    pub fn new(ring: RingBuf<MapData>) -> io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(ring)?,
        })
    }

    /// Opens the ring buffer the loader pinned under bpffs.
    pub fn from_pin<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = MapData::from_pin(path.as_ref())?;
        let ring = RingBuf::try_from(Map::RingBuf(data))?;
        Ok(Self::new(ring)?)
    }
}

#[async_trait]
impl RecordSource for RingBufSource {
    async fn next_record(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Drain whatever is already in the buffer before waiting.
            if let Some(bytes) = {
                let ring = self.fd.get_mut();
                ring.next().map(|item| Bytes::copy_from_slice(&item))
            } {
                return Ok(Some(bytes));
            }
            let mut guard = self.fd.readable_mut().await?;
            let ready = {
                let ring = guard.get_inner_mut();
                ring.next().map(|item| Bytes::copy_from_slice(&item))
            };
            match ready {
                Some(bytes) => return Ok(Some(bytes)),
                None => guard.clear_ready(),
            }
        }
    }
}

/// Channel-backed source for tests and offline replay. The stream ends when
/// every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    pub fn pair(buffer: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl RecordSource for ChannelSource {
    async fn next_record(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}

/// Optional capability: resolves a record's stack key into decoded frame
/// instruction pointers. Presence is checked once at construction; the
/// reader dispatches through the trait, never through a null check.
pub trait StackResolver: Send + Sync {
    fn resolve(&self, stack_key: u32) -> Option<Vec<u64>>;
}

/// The no-stacks capability: every key resolves to nothing.
pub struct NoStacks;

impl StackResolver for NoStacks {
    fn resolve(&self, _stack_key: u32) -> Option<Vec<u64>> {
        None
    }
}

/// Stack resolution over the kernel stack-trace map pinned by the loader.
pub struct KernelStackResolver {
    map: StackTraceMap<MapData>,
}

impl KernelStackResolver {
    pub fn from_pin<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let data = MapData::from_pin(path.as_ref())?;
        let map = StackTraceMap::try_from(Map::StackTraceMap(data))?;
        Ok(Self { map })
    }
}

impl StackResolver for KernelStackResolver {
    fn resolve(&self, stack_key: u32) -> Option<Vec<u64>> {
        let trace = self.map.get(&stack_key, 0).ok()?;
        Some(trace.frames().iter().map(|frame| frame.ip).collect())
    }
}

impl StackResolver for HashMap<u32, Vec<u64>> {
    fn resolve(&self, stack_key: u32) -> Option<Vec<u64>> {
        self.get(&stack_key).cloned()
    }
}
