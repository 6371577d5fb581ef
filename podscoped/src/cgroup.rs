use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::BoundedTtlCache;
use crate::event::pid_is_valid;
use crate::metrics::Metrics;

/// Decides whether a PID belongs to the traced cgroup subtree.
///
/// With no target configured every PID is accepted. Otherwise the PID's
/// cgroup path is read from `/proc/<pid>/cgroup`, normalized against the
/// cgroup base path, and matched: member iff the PID's path equals the
/// target or is nested strictly below it. Lookup failures and malformed
/// content cache a negative answer.
pub struct CgroupMembership {
    cache: BoundedTtlCache<u32, bool>,
    /// Normalized target path; None means "accept everything".
    target: Option<String>,
    proc_base: PathBuf,
    cgroup_base: String,
    max_file_path_len: usize,
    metrics: Arc<Metrics>,
}

pub struct CgroupMembershipOptions {
    pub proc_base: PathBuf,
    pub cgroup_base: String,
    pub capacity: usize,
    pub eviction_ratio: f64,
    pub ttl: Duration,
    pub max_file_path_len: usize,
}

impl CgroupMembership {
    pub fn new(
        target: Option<&str>,
        opts: CgroupMembershipOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        let target = target.map(|t| normalize(t, &opts.cgroup_base));
        Self {
            cache: BoundedTtlCache::new(opts.capacity, opts.eviction_ratio, opts.ttl),
            target,
            proc_base: opts.proc_base,
            cgroup_base: opts.cgroup_base,
            max_file_path_len: opts.max_file_path_len,
            metrics,
        }
    }

    pub fn is_in_cgroup(&self, pid: u32) -> bool {
        let Some(target) = self.target.as_deref() else {
            return true;
        };
        // An empty normalized target can never match; don't touch /proc.
        if target.is_empty() {
            return false;
        }
        if !pid_is_valid(pid) {
            return false;
        }
        if let Some(member) = self.cache.get(&pid) {
            self.metrics.record_pid_cache_hit();
            return member;
        }
        self.metrics.record_pid_cache_miss();
        let member = self.probe(pid, target);
        self.cache.insert(pid, member);
        member
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn probe(&self, pid: u32, target: &str) -> bool {
        let path = self.proc_base.join(pid.to_string()).join("cgroup");
        if path.as_os_str().len() > self.max_file_path_len {
            return false;
        }
        let Ok(content) = fs::read_to_string(&path) else {
            return false;
        };
        let Some(raw) = extract_cgroup_path(&content) else {
            return false;
        };
        is_member(&normalize(&raw, &self.cgroup_base), target)
    }
}

/// Picks the PID's cgroup path out of `/proc/<pid>/cgroup` content: the
/// unified v2 line (`0::<path>`) wins if present anywhere; for v1 the line
/// whose controller list contains `cpu` is preferred, falling back to the
/// last non-empty line.
pub fn extract_cgroup_path(content: &str) -> Option<String> {
    let mut cpu_line: Option<&str> = None;
    let mut last_line: Option<&str> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(path) = line.strip_prefix("0::") {
            return Some(path.to_string());
        }
        let mut fields = line.splitn(3, ':');
        let _hierarchy = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        if cpu_line.is_none() && controllers.split(',').any(|c| c == "cpu") {
            cpu_line = Some(path);
        }
        last_line = Some(path);
    }

    cpu_line.or(last_line).map(str::to_string)
}

/// Strips the cgroup base prefix, forces a leading `/`, drops trailing `/`.
/// Idempotent: normalizing an already-normalized path is a no-op.
pub fn normalize(path: &str, base: &str) -> String {
    let mut p = path.trim();
    if !base.is_empty() {
        if let Some(stripped) = p.strip_prefix(base) {
            p = stripped;
        }
    }
    let mut out = if p.starts_with('/') {
        p.to_string()
    } else {
        format!("/{p}")
    };
    while out.ends_with('/') {
        out.pop();
    }
    out
}

/// Membership semantics: the PID's cgroup is the target or nested below it.
/// A target nested below the PID's cgroup is not a match, and an empty
/// target matches nothing.
pub fn is_member(pid_path: &str, target: &str) -> bool {
    if target.is_empty() {
        return false;
    }
    pid_path == target || pid_path.starts_with(&format!("{target}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn membership(root: &TempDir, target: Option<&str>) -> CgroupMembership {
        CgroupMembership::new(
            target,
            CgroupMembershipOptions {
                proc_base: root.path().to_path_buf(),
                cgroup_base: "/sys/fs/cgroup".to_string(),
                capacity: 64,
                eviction_ratio: 0.9,
                ttl: Duration::from_secs(60),
                max_file_path_len: 4096,
            },
            Arc::new(Metrics::new()),
        )
    }

    fn write_cgroup(root: &TempDir, pid: u32, content: &str) {
        let dir = root.path().join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let mut f = fs::File::create(dir.join("cgroup")).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn v2_line_wins_wherever_it_appears() {
        let content = "3:cpu,cpuacct:/v1path\n0::/kubepods/podA/c1\n2:memory:/other\n";
        assert_eq!(
            extract_cgroup_path(content).as_deref(),
            Some("/kubepods/podA/c1")
        );
    }

    #[test]
    fn v1_prefers_cpu_controller_line() {
        let content = "4:memory:/mem\n3:cpu,cpuacct:/cpu-path\n2:blkio:/blk\n";
        assert_eq!(extract_cgroup_path(content).as_deref(), Some("/cpu-path"));
    }

    #[test]
    fn v1_falls_back_to_last_nonempty_line() {
        let content = "4:memory:/mem\n2:blkio:/blk\n\n";
        assert_eq!(extract_cgroup_path(content).as_deref(), Some("/blk"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let base = "/sys/fs/cgroup";
        for p in [
            "/sys/fs/cgroup/kubepods/podA/",
            "kubepods/podA",
            "/kubepods/podA",
            "/",
            "",
        ] {
            let once = normalize(p, base);
            assert_eq!(normalize(&once, base), once, "not idempotent for {p:?}");
        }
    }

    #[test]
    fn membership_is_at_or_below_target() {
        assert!(is_member("/kubepods/podA", "/kubepods/podA"));
        assert!(is_member("/kubepods/podA/c1", "/kubepods/podA"));
        assert!(!is_member("/kubepods/podAB", "/kubepods/podA"));
        // Target nested under the PID's cgroup is not membership.
        assert!(!is_member("/kubepods", "/kubepods/podA"));
        assert!(!is_member("/kubepods/podA", ""));
    }

    #[test]
    fn no_target_accepts_everything() {
        let root = TempDir::new().unwrap();
        let m = membership(&root, None);
        assert!(m.is_in_cgroup(1234));
        assert_eq!(m.cache_len(), 0);
    }

    #[test]
    fn outsider_pid_is_rejected_and_cached() {
        let root = TempDir::new().unwrap();
        write_cgroup(&root, 1234, "0::/kubepods/podB/container1\n");
        let m = membership(&root, Some("/kubepods/podA"));
        assert!(!m.is_in_cgroup(1234));
        assert!(!m.is_in_cgroup(1234));
        assert_eq!(m.metrics.pid_cache_hits(), 1);
        assert_eq!(m.metrics.pid_cache_misses(), 1);
    }

    #[test]
    fn member_pid_is_accepted() {
        let root = TempDir::new().unwrap();
        write_cgroup(&root, 55, "0::/kubepods/podA/container1\n");
        let m = membership(&root, Some("/kubepods/podA"));
        assert!(m.is_in_cgroup(55));
    }

    #[test]
    fn unreadable_proc_caches_false() {
        let root = TempDir::new().unwrap();
        let m = membership(&root, Some("/kubepods/podA"));
        assert!(!m.is_in_cgroup(77));
        assert_eq!(m.cache_len(), 1);
    }

    #[test]
    fn base_prefix_is_stripped_from_both_sides() {
        let root = TempDir::new().unwrap();
        write_cgroup(&root, 88, "0::/kubepods/podA/c0\n");
        let m = membership(&root, Some("/sys/fs/cgroup/kubepods/podA"));
        assert!(m.is_in_cgroup(88));
    }

    #[test]
    fn root_target_matches_nothing() {
        let root = TempDir::new().unwrap();
        write_cgroup(&root, 99, "0::/kubepods/podA\n");
        let m = membership(&root, Some("/"));
        assert!(!m.is_in_cgroup(99));
    }
}
