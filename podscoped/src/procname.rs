use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::BoundedTtlCache;
use crate::event::pid_is_valid;
use crate::metrics::Metrics;

/// PID to process-name resolution backed by /proc, with a bounded LRU+TTL
/// cache so each PID is scanned at most once per TTL window.
///
/// Lookup order on a miss: `cmdline` (basename of arg0), `stat` (the text
/// inside the parentheses), `comm`. A PID whose files cannot be read caches
/// the empty string so repeated lookups do not keep hitting the filesystem.
pub struct ProcessNameCache {
    cache: BoundedTtlCache<u32, String>,
    proc_base: PathBuf,
    metrics: Arc<Metrics>,
}

impl ProcessNameCache {
    pub fn new(
        proc_base: PathBuf,
        capacity: usize,
        eviction_ratio: f64,
        ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            cache: BoundedTtlCache::new(capacity, eviction_ratio, ttl),
            proc_base,
            metrics,
        }
    }

    /// Resolved, sanitized process name; empty when the PID is invalid or
    /// nothing in /proc yields a usable name.
    pub fn lookup(&self, pid: u32) -> String {
        if !pid_is_valid(pid) {
            return String::new();
        }
        if let Some(name) = self.cache.get(&pid) {
            self.metrics.record_process_cache_hit();
            return name;
        }
        self.metrics.record_process_cache_miss();
        let name = self.resolve(pid);
        self.cache.insert(pid, name.clone());
        name
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn resolve(&self, pid: u32) -> String {
        let dir = self.proc_base.join(pid.to_string());
        if let Some(name) = read_cmdline_name(&dir.join("cmdline")) {
            return name;
        }
        if let Some(name) = read_stat_name(&dir.join("stat")) {
            return name;
        }
        read_comm_name(&dir.join("comm")).unwrap_or_default()
    }
}

fn read_cmdline_name(path: &Path) -> Option<String> {
    let raw = fs::read(path).ok()?;
    let arg0 = raw.split(|b| *b == 0).next()?;
    let base = arg0.rsplit(|b| *b == b'/').next()?;
    let name = sanitize(base);
    (!name.is_empty()).then_some(name)
}

fn read_stat_name(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let open = raw.rfind('(')?;
    let close = raw.rfind(')')?;
    if close <= open {
        return None;
    }
    let name = sanitize(raw[open + 1..close].as_bytes());
    (!name.is_empty()).then_some(name)
}

fn read_comm_name(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let name = sanitize(raw.trim().as_bytes());
    (!name.is_empty()).then_some(name)
}

/// Keeps printable ASCII minus `%`, then trims surrounding whitespace. The
/// result feeds log lines and report keys, so control bytes never survive.
pub fn sanitize(raw: &[u8]) -> String {
    let kept: String = raw
        .iter()
        .filter(|b| (32..127).contains(*b) && **b != b'%')
        .map(|b| *b as char)
        .collect();
    kept.trim().to_string()
}
