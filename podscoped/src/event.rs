use std::net::{IpAddr, SocketAddr};

use serde::Serialize;

pub use podscope_wire::RecordKind as EventKind;
pub use podscope_wire::{pid_is_valid, PID_MAX};

/// Diagnostic category an event is attributed to. The declaration order is
/// the stable ordering used by reports and exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Dns,
    Network,
    Filesystem,
    Cpu,
    Process,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Dns,
        Category::Network,
        Category::Filesystem,
        Category::Cpu,
        Category::Process,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::Dns => "dns",
            Category::Network => "network",
            Category::Filesystem => "filesystem",
            Category::Cpu => "cpu",
            Category::Process => "process",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Category::Dns => "DNS",
            Category::Network => "Network",
            Category::Filesystem => "Filesystem",
            Category::Cpu => "CPU",
            Category::Process => "Process",
        }
    }

    pub const fn index(&self) -> usize {
        *self as usize
    }
}

pub fn category_of(kind: EventKind) -> Category {
    match kind {
        EventKind::Dns => Category::Dns,
        EventKind::Connect
        | EventKind::TcpSend
        | EventKind::TcpRecv
        | EventKind::UdpSend
        | EventKind::UdpRecv
        | EventKind::TcpState
        | EventKind::TcpRetrans => Category::Network,
        EventKind::Read | EventKind::Write | EventKind::Fsync => Category::Filesystem,
        EventKind::SchedSwitch => Category::Cpu,
        EventKind::Exec | EventKind::Fork | EventKind::Open | EventKind::Close => Category::Process,
        EventKind::ResourceLimit => Category::Process,
    }
}

/// A single decoded kernel observation. Created by the codec from a raw ring
/// buffer record, mutated only along the ingestion chain (process name,
/// stack frames) and either consumed by the diagnostician or returned to the
/// codec's pool.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub target: String,
    pub latency_ns: u64,
    pub bytes: u64,
    pub error: i32,
    pub tcp_state: u32,
    pub stack_key: u32,
    pub stack: Vec<u64>,
    pub process_name: String,
}

impl Event {
    pub fn blank() -> Self {
        Self {
            kind: EventKind::Connect,
            timestamp_ns: 0,
            pid: 0,
            tid: 0,
            target: String::new(),
            latency_ns: 0,
            bytes: 0,
            error: 0,
            tcp_state: 0,
            stack_key: 0,
            stack: Vec::new(),
            process_name: String::new(),
        }
    }

    /// Resets to the blank state, keeping string/vec capacity for reuse.
    pub fn clear(&mut self) {
        self.kind = EventKind::Connect;
        self.timestamp_ns = 0;
        self.pid = 0;
        self.tid = 0;
        self.target.clear();
        self.latency_ns = 0;
        self.bytes = 0;
        self.error = 0;
        self.tcp_state = 0;
        self.stack_key = 0;
        self.stack.clear();
        self.process_name.clear();
    }

    pub fn category(&self) -> Category {
        category_of(self.kind)
    }

    /// True for the socket-level network kinds whose target may carry an
    /// `ip:port` worth enriching with Kubernetes identity.
    pub fn is_network(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Connect
                | EventKind::TcpSend
                | EventKind::TcpRecv
                | EventKind::UdpSend
                | EventKind::UdpRecv
                | EventKind::TcpState
                | EventKind::TcpRetrans
        )
    }

    /// Parses the target as `ip:port`, `[v6]:port`, or a bare IP (port 0).
    /// Domains, file paths, and placeholders yield None.
    pub fn ip_port(&self) -> Option<(IpAddr, u16)> {
        parse_ip_port(&self.target)
    }
}

pub fn parse_ip_port(target: &str) -> Option<(IpAddr, u16)> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Some((addr.ip(), addr.port()));
    }
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some((ip, 0));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_category() {
        for kind in EventKind::ALL {
            // Category order drives report sections; just exercise the map.
            let _ = category_of(kind);
        }
        assert_eq!(category_of(EventKind::Dns), Category::Dns);
        assert_eq!(category_of(EventKind::TcpRetrans), Category::Network);
        assert_eq!(category_of(EventKind::Fsync), Category::Filesystem);
        assert_eq!(category_of(EventKind::SchedSwitch), Category::Cpu);
        assert_eq!(category_of(EventKind::Open), Category::Process);
    }

    #[test]
    fn target_parsing() {
        assert_eq!(
            parse_ip_port("10.0.0.5:443"),
            Some(("10.0.0.5".parse().unwrap(), 443))
        );
        assert_eq!(
            parse_ip_port("[2001:db8::1]:80"),
            Some(("2001:db8::1".parse().unwrap(), 80))
        );
        assert_eq!(
            parse_ip_port("8.8.8.8"),
            Some(("8.8.8.8".parse().unwrap(), 0))
        );
        assert_eq!(parse_ip_port("example.com:443"), None);
        assert_eq!(parse_ip_port("/var/log/syslog"), None);
        assert_eq!(parse_ip_port("?"), None);
        assert_eq!(parse_ip_port(""), None);
    }

    #[test]
    fn clear_resets_everything() {
        let mut event = Event::blank();
        event.kind = EventKind::Dns;
        event.pid = 42;
        event.target.push_str("example.com");
        event.stack.push(0xdead);
        event.process_name.push_str("resolver");

        event.clear();
        assert_eq!(event.pid, 0);
        assert!(event.target.is_empty());
        assert!(event.stack.is_empty());
        assert!(event.process_name.is_empty());
    }
}
