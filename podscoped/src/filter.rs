use anyhow::bail;

use crate::event::EventKind;

/// A set of enabled event categories, parsed once at startup from a filter
/// string such as "dns,net,fs". The hot path is a pure bitmask test; an
/// empty set drops everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
    mask: u8,
}

const DNS: u8 = 1 << 0;
const NET: u8 = 1 << 1;
const FS: u8 = 1 << 2;
const CPU: u8 = 1 << 3;
const PROC: u8 = 1 << 4;

impl EventFilter {
    pub const fn empty() -> Self {
        Self { mask: 0 }
    }

    pub const fn all() -> Self {
        Self {
            mask: DNS | NET | FS | CPU | PROC,
        }
    }

    /// Parses a comma-separated filter string. Unknown tokens are startup
    /// errors; an empty string yields the empty (drop-everything) filter.
    pub fn parse(expr: &str) -> anyhow::Result<Self> {
        let mut mask = 0u8;
        for token in expr.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            mask |= match token {
                "dns" => DNS,
                "net" => NET,
                "fs" => FS,
                "cpu" => CPU,
                "proc" => PROC,
                other => bail!(
                    "unknown filter category {other:?} (expected dns, net, fs, cpu, proc)"
                ),
            };
        }
        Ok(Self { mask })
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// True when events of this kind pass the filter.
    pub fn allows(&self, kind: EventKind) -> bool {
        self.mask & kind_bit(kind) != 0
    }
}

fn kind_bit(kind: EventKind) -> u8 {
    match kind {
        EventKind::Dns => DNS,
        EventKind::Connect
        | EventKind::TcpSend
        | EventKind::TcpRecv
        | EventKind::UdpSend
        | EventKind::UdpRecv
        | EventKind::TcpState
        | EventKind::TcpRetrans => NET,
        EventKind::Read | EventKind::Write | EventKind::Fsync => FS,
        EventKind::SchedSwitch => CPU,
        EventKind::Exec | EventKind::Fork | EventKind::Open | EventKind::Close => PROC,
        // Not part of any filter category; only reaches consumers when
        // filtering is bypassed.
        EventKind::ResourceLimit => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_known_tokens() {
        let f = EventFilter::parse("dns,net,fs,cpu,proc").unwrap();
        assert_eq!(f, EventFilter::all());
        let f = EventFilter::parse(" dns , fs ").unwrap();
        assert!(f.allows(EventKind::Dns));
        assert!(f.allows(EventKind::Read));
        assert!(!f.allows(EventKind::Connect));
    }

    #[test]
    fn unknown_token_is_an_error() {
        assert!(EventFilter::parse("dns,bogus").is_err());
    }

    #[test]
    fn empty_filter_drops_everything() {
        let f = EventFilter::parse("").unwrap();
        assert!(f.is_empty());
        for kind in EventKind::ALL {
            assert!(!f.allows(kind), "{kind:?} passed an empty filter");
        }
    }

    #[test]
    fn category_mapping_is_sound() {
        // Every kind a single-category filter passes must belong to that
        // category's mapped set.
        let net_kinds = [
            EventKind::Connect,
            EventKind::TcpSend,
            EventKind::TcpRecv,
            EventKind::UdpSend,
            EventKind::UdpRecv,
            EventKind::TcpState,
            EventKind::TcpRetrans,
        ];
        let f = EventFilter::parse("net").unwrap();
        for kind in EventKind::ALL {
            assert_eq!(f.allows(kind), net_kinds.contains(&kind));
        }

        let f = EventFilter::parse("proc").unwrap();
        let proc_kinds = [
            EventKind::Exec,
            EventKind::Fork,
            EventKind::Open,
            EventKind::Close,
        ];
        for kind in EventKind::ALL {
            assert_eq!(f.allows(kind), proc_kinds.contains(&kind));
        }
    }

    #[test]
    fn resource_limit_passes_no_filter() {
        assert!(!EventFilter::all().allows(EventKind::ResourceLimit));
    }
}
