//! Synthetic capture generator for offline work with `podscoped --replay`.
//! Produces a file of fixed-size raw records shaped like the traffic
//! patterns the diagnostician is meant to flag.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use podscope_wire::{RawRecord, RecordKind};
use rand::Rng;

#[derive(Clone, ValueEnum, Debug)]
#[value(rename_all = "kebab-case")]
enum Profile {
    /// DNS lookups where most answers come back NXDOMAIN
    DnsErrors,
    /// TCP sends with round-trip latency far above the spike threshold
    RttSpikes,
    /// fsync calls slow enough to cross the filesystem threshold
    FsSlow,
    /// A blend of everything, mostly healthy
    Mixed,
}

#[derive(Parser, Debug)]
#[command(name = "record-gen")]
#[command(about = "Generate synthetic raw-record capture files")]
struct Args {
    #[arg(long, value_enum, default_value = "mixed")]
    profile: Profile,
    /// Number of records to write
    #[arg(long, default_value_t = 1000)]
    count: u64,
    #[arg(long, value_name = "PATH", default_value = "podscope-capture.bin")]
    out: PathBuf,
    /// PID stamped into every record
    #[arg(long, default_value_t = 4242)]
    pid: u32,
}

fn base_record(kind: RecordKind, pid: u32, seq: u64) -> RawRecord {
    let mut rec = RawRecord::zeroed();
    rec.kind = kind as u32;
    rec.pid = pid;
    rec.tid = pid;
    rec.timestamp_ns = seq * 1_000_000;
    rec
}

fn dns_error(pid: u32, seq: u64, rng: &mut impl Rng) -> RawRecord {
    let mut rec = base_record(RecordKind::Dns, pid, seq);
    rec.latency_ns = rng.gen_range(500_000..5_000_000);
    // 3 = NXDOMAIN, 2 = SERVFAIL; one in five resolves cleanly.
    rec.error = if rng.gen_range(0..5) == 0 {
        0
    } else if rng.gen_bool(0.5) {
        3
    } else {
        2
    };
    rec.set_target(b"shop.internal.example");
    rec
}

fn rtt_spike(pid: u32, seq: u64, rng: &mut impl Rng) -> RawRecord {
    let mut rec = base_record(RecordKind::TcpSend, pid, seq);
    rec.latency_ns = rng.gen_range(150_000_000..400_000_000);
    rec.bytes = rng.gen_range(64..16_384);
    rec.set_target(b"10.0.0.5:443");
    rec
}

fn fs_slow(pid: u32, seq: u64, rng: &mut impl Rng) -> RawRecord {
    let mut rec = base_record(RecordKind::Fsync, pid, seq);
    rec.latency_ns = rng.gen_range(120_000_000..900_000_000);
    rec.set_target(b"/var/lib/data/wal.log");
    rec
}

fn healthy(pid: u32, seq: u64, rng: &mut impl Rng) -> RawRecord {
    let kinds = [
        RecordKind::Connect,
        RecordKind::TcpSend,
        RecordKind::TcpRecv,
        RecordKind::Read,
        RecordKind::Write,
        RecordKind::SchedSwitch,
        RecordKind::Exec,
    ];
    let kind = kinds[rng.gen_range(0..kinds.len())];
    let mut rec = base_record(kind, pid, seq);
    rec.latency_ns = rng.gen_range(10_000..2_000_000);
    rec.bytes = rng.gen_range(0..8_192);
    match kind {
        RecordKind::Read | RecordKind::Write => rec.set_target(b"/var/log/app.log"),
        RecordKind::SchedSwitch | RecordKind::Exec => rec.set_target(b""),
        _ => rec.set_target(b"10.0.0.7:8080"),
    }
    rec
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut rng = rand::thread_rng();

    let mut out = Vec::with_capacity(args.count as usize * std::mem::size_of::<RawRecord>());
    for seq in 0..args.count {
        let rec = match args.profile {
            Profile::DnsErrors => dns_error(args.pid, seq, &mut rng),
            Profile::RttSpikes => rtt_spike(args.pid, seq, &mut rng),
            Profile::FsSlow => fs_slow(args.pid, seq, &mut rng),
            Profile::Mixed => match rng.gen_range(0..10) {
                0 => dns_error(args.pid, seq, &mut rng),
                1 => rtt_spike(args.pid, seq, &mut rng),
                2 => fs_slow(args.pid, seq, &mut rng),
                _ => healthy(args.pid, seq, &mut rng),
            },
        };
        out.extend_from_slice(bytemuck::bytes_of(&rec));
    }

    std::fs::write(&args.out, &out)
        .with_context(|| format!("cannot write capture to {}", args.out.display()))?;
    println!(
        "[record-gen] wrote {} records ({} bytes) to {}",
        args.count,
        out.len(),
        args.out.display()
    );
    Ok(())
}
