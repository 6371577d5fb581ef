#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

// =============================================================================
// RING BUFFER RECORD - Shared Wire Protocol Definitions
// =============================================================================
//
// This defines the memory layout for the records the kernel probes publish
// into the BPF ring buffer. The userspace daemon (podscoped) decodes these
// records; the kernel side fills them in. Both sides compile this crate, so
// the layout can never drift.
//
// RECORD LAYOUT (184 bytes, 8-byte aligned, host endianness):
//   [0..4]     kind: u32          - Event type discriminant (0 reserved)
//   [4..8]     pid: u32
//   [8..12]    tid: u32
//   [12..16]   error: i32         - Kernel error code, 0 = success
//   [16..24]   latency_ns: u64
//   [24..32]   bytes: u64
//   [32..40]   timestamp_ns: u64  - ktime_get_ns at capture
//   [40..44]   stack_key: u32     - Key into the stack-trace map, 0 = none
//   [44..48]   tcp_state: u32
//   [48..176]  target: [u8; 128]  - NUL-terminated destination string
//   [176..184] reserved + padding
// =============================================================================

/// Length of the fixed destination buffer in a record.
pub const TARGET_BUF_LEN: usize = 128;

/// PIDs at or above this value never come from the kernel and are rejected
/// unconditionally, as is PID 0.
pub const PID_MAX: u32 = 1 << 22;

/// Returns true for a PID the tracer is willing to look at.
pub const fn pid_is_valid(pid: u32) -> bool {
    pid != 0 && pid < PID_MAX
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RawRecord {
    pub kind: u32,
    pub pid: u32,
    pub tid: u32,
    /// Kernel error code for the traced operation; 0 on success. DNS
    /// responses surface their rcode (NXDOMAIN, SERVFAIL, ...) here.
    pub error: i32,
    pub latency_ns: u64,
    pub bytes: u64,
    pub timestamp_ns: u64,
    /// Key into the optional stack-trace map; 0 means no stack captured.
    pub stack_key: u32,
    pub tcp_state: u32,
    /// Destination of the operation: `ip:port`, `[v6]:port`, a domain, a
    /// file path, or one of the placeholders `?`, `unknown`, `file`.
    /// NUL-terminated within the fixed buffer.
    pub target: [u8; TARGET_BUF_LEN],
    pub _reserved: u32,
    pub _pad: u32,
}

/// Size of one wire record in bytes.
pub const RAW_RECORD_LEN: usize = core::mem::size_of::<RawRecord>();

// Record must stay exactly 184 bytes; the kernel side writes this layout.
const _: () = {
    assert!(core::mem::size_of::<RawRecord>() == 184);
    assert!(core::mem::align_of::<RawRecord>() == 8);
};

impl RawRecord {
    pub const fn zeroed() -> Self {
        Self {
            kind: 0,
            pid: 0,
            tid: 0,
            error: 0,
            latency_ns: 0,
            bytes: 0,
            timestamp_ns: 0,
            stack_key: 0,
            tcp_state: 0,
            target: [0; TARGET_BUF_LEN],
            _reserved: 0,
            _pad: 0,
        }
    }

    /// The target bytes up to the first NUL.
    pub fn target_bytes(&self) -> &[u8] {
        let nul = self
            .target
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(TARGET_BUF_LEN);
        &self.target[..nul]
    }

    /// Copies `target` into the fixed buffer, truncating and always leaving
    /// a terminating NUL.
    pub fn set_target(&mut self, target: &[u8]) {
        let len = target.len().min(TARGET_BUF_LEN - 1);
        self.target[..len].copy_from_slice(&target[..len]);
        self.target[len..].iter_mut().for_each(|b| *b = 0);
    }
}

/// Event type discriminants. Dense from 1; 0 is reserved so a zeroed record
/// never decodes to a valid event.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum RecordKind {
    Connect = 1,
    TcpSend = 2,
    TcpRecv = 3,
    UdpSend = 4,
    UdpRecv = 5,
    TcpState = 6,
    TcpRetrans = 7,
    Dns = 8,
    Read = 9,
    Write = 10,
    Fsync = 11,
    Open = 12,
    Close = 13,
    SchedSwitch = 14,
    Exec = 15,
    Fork = 16,
    ResourceLimit = 17,
}

impl RecordKind {
    pub const ALL: [RecordKind; 17] = [
        RecordKind::Connect,
        RecordKind::TcpSend,
        RecordKind::TcpRecv,
        RecordKind::UdpSend,
        RecordKind::UdpRecv,
        RecordKind::TcpState,
        RecordKind::TcpRetrans,
        RecordKind::Dns,
        RecordKind::Read,
        RecordKind::Write,
        RecordKind::Fsync,
        RecordKind::Open,
        RecordKind::Close,
        RecordKind::SchedSwitch,
        RecordKind::Exec,
        RecordKind::Fork,
        RecordKind::ResourceLimit,
    ];

    pub const fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => RecordKind::Connect,
            2 => RecordKind::TcpSend,
            3 => RecordKind::TcpRecv,
            4 => RecordKind::UdpSend,
            5 => RecordKind::UdpRecv,
            6 => RecordKind::TcpState,
            7 => RecordKind::TcpRetrans,
            8 => RecordKind::Dns,
            9 => RecordKind::Read,
            10 => RecordKind::Write,
            11 => RecordKind::Fsync,
            12 => RecordKind::Open,
            13 => RecordKind::Close,
            14 => RecordKind::SchedSwitch,
            15 => RecordKind::Exec,
            16 => RecordKind::Fork,
            17 => RecordKind::ResourceLimit,
            _ => return None,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            RecordKind::Connect => "connect",
            RecordKind::TcpSend => "tcp_send",
            RecordKind::TcpRecv => "tcp_recv",
            RecordKind::UdpSend => "udp_send",
            RecordKind::UdpRecv => "udp_recv",
            RecordKind::TcpState => "tcp_state",
            RecordKind::TcpRetrans => "tcp_retrans",
            RecordKind::Dns => "dns",
            RecordKind::Read => "read",
            RecordKind::Write => "write",
            RecordKind::Fsync => "fsync",
            RecordKind::Open => "open",
            RecordKind::Close => "close",
            RecordKind::SchedSwitch => "sched_switch",
            RecordKind::Exec => "exec",
            RecordKind::Fork => "fork",
            RecordKind::ResourceLimit => "resource_limit",
        }
    }
}
