// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;

use anyhow::{bail, Context, Result};
use log::warn;

/// One row of per-CPU processor time accounting. All counters are
/// monotonically non-decreasing ticks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcStatCpu {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
    pub guest: u64,
    pub softirq_ctr: u64,
}

impl ProcStatCpu {
    fn parse(line: &str) -> Result<Self> {
        let fields = line
            .split_whitespace()
            .skip(1)
            .map(|s| s.parse::<u64>().with_context(|| format!("bad counter {:?}", s)))
            .collect::<Result<Vec<u64>>>()?;
        if fields.len() < 4 {
            bail!("truncated cpu row: {:?}", line);
        }
        // Trailing fields are absent on older kernels and read as zero.
        let f = |i: usize| fields.get(i).copied().unwrap_or(0);
        Ok(Self {
            user: f(0),
            nice: f(1),
            system: f(2),
            idle: f(3),
            iowait: f(4),
            irq: f(5),
            softirq: f(6),
            steal: f(7),
            guest: f(8),
            softirq_ctr: f(9),
        })
    }
}

/// System-wide snapshot of the processor time source. Transient, one per
/// poll cycle.
#[derive(Debug, Default)]
pub struct ProcStat {
    pub ctxt: u64,
    pub btime: u64,
    pub processes: u64,
    pub procs_running: u64,
    pub procs_blocked: u64,
    pub cpu_total: ProcStatCpu,
    /// One entry per logical CPU; None marks a row that failed to parse.
    pub cpus: Vec<Option<ProcStatCpu>>,
}

impl ProcStat {
    /// Reads `{prefix}/proc/stat`. An unreadable file is an error; a
    /// malformed row is recoverable and parses to None.
    pub fn read(prefix: &str) -> Result<Self> {
        let path = format!("{}/proc/stat", prefix);
        let buf =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
        Ok(Self::parse(&buf))
    }

    fn parse(buf: &str) -> Self {
        let mut ps = Self::default();
        for line in buf.lines() {
            let Some(key) = line.split_whitespace().next() else {
                continue;
            };
            match key {
                "cpu" => ps.cpu_total = ProcStatCpu::parse(line).unwrap_or_default(),
                _ if key.starts_with("cpu") => {
                    let Ok(num) = key[3..].parse::<usize>() else {
                        warn!("unrecognized stat row {:?}", key);
                        continue;
                    };
                    if ps.cpus.len() <= num {
                        ps.cpus.resize(num + 1, None);
                    }
                    ps.cpus[num] = ProcStatCpu::parse(line).ok();
                }
                "ctxt" => ps.ctxt = scalar(line),
                "btime" => ps.btime = scalar(line),
                "processes" => ps.processes = scalar(line),
                "procs_running" => ps.procs_running = scalar(line),
                "procs_blocked" => ps.procs_blocked = scalar(line),
                _ => {}
            }
        }
        ps
    }
}

fn scalar(line: &str) -> u64 {
    match line.split_whitespace().nth(1).map(|s| s.parse::<u64>()) {
        Some(Ok(val)) => val,
        _ => {
            warn!("unparseable stat row: {:?}", line);
            0
        }
    }
}

/// One row of the per-CPU packet processing source. The kernel prints
/// fixed-width hex columns; total, dropped and time_squeeze are the first
/// three, cpu_collision is column 8.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SoftnetStat {
    pub total: u32,
    pub dropped: u32,
    pub time_squeeze: u32,
    pub cpu_collision: u32,
}

impl SoftnetStat {
    fn parse(line: &str) -> Result<Self> {
        let cols = line
            .split_whitespace()
            .map(|s| u32::from_str_radix(s, 16).with_context(|| format!("bad column {:?}", s)))
            .collect::<Result<Vec<u32>>>()?;
        if cols.len() < 9 {
            bail!("truncated softnet row: {:?}", line);
        }
        Ok(Self {
            total: cols[0],
            dropped: cols[1],
            time_squeeze: cols[2],
            cpu_collision: cols[8],
        })
    }

    /// Reads `{prefix}/proc/net/softnet_stat`, one row per CPU in CPU
    /// order. An unreadable file is an error; a malformed row is
    /// recoverable and parses to None.
    pub fn read_all(prefix: &str) -> Result<Vec<Option<SoftnetStat>>> {
        let path = format!("{}/proc/net/softnet_stat", prefix);
        let buf =
            fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
        Ok(buf.lines().map(|line| Self::parse(line).ok()).collect())
    }
}
