// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::{debug, info, warn};
use ordered_float::OrderedFloat;

use crate::cpuset::Cpuset;
use crate::stats::{ProcStat, ProcStatCpu, SoftnetStat};

/// Logical CPUs per physical core under the fixed hyperthread pairing.
pub const HT_PER_CPU: usize = 2;

const OLD: usize = 0;
const NEW: usize = 1;

/// Back-reference to a queue owned by the interface subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRef {
    pub iface: String,
    pub qnum: usize,
}

/// One logical CPU's balancing state: its assigned queues, the derived
/// softirq load and two generations of kernel counters.
#[derive(Debug, Default)]
pub struct CpuInfo {
    num: usize,
    queues: Vec<QueueRef>,
    /// Softirq load in percent, derived by do_stat.
    si_load: f64,
    psc: [ProcStatCpu; 2],
    ss: [SoftnetStat; 2],
}

impl CpuInfo {
    pub fn num(&self) -> usize {
        self.num
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn queues(&self) -> &[QueueRef] {
        &self.queues
    }

    pub fn si_load(&self) -> f64 {
        self.si_load
    }

    /// Counters are monotonic; a new value below old (an external reset)
    /// counts as a zero delta rather than wrapping.
    fn psc_diff(&self, field: fn(&ProcStatCpu) -> u64) -> u64 {
        field(&self.psc[NEW]).saturating_sub(field(&self.psc[OLD]))
    }

    fn ss_diff(&self, field: fn(&SoftnetStat) -> u32) -> u32 {
        field(&self.ss[NEW]).saturating_sub(field(&self.ss[OLD]))
    }
}

/// The registry owns one record per logical CPU plus the two orderings
/// the balancer works from. Created once at startup, sized from the
/// detected CPU count.
pub struct CpuRegistry {
    prefix: String,
    cpus: Vec<CpuInfo>,
    /// Recency of assignment, head is the least recently assigned CPU.
    lru: Vec<usize>,
    /// Ascending measured load. Rotated on assignment between stat
    /// cycles; restored to measured order by do_stat.
    by_load: Vec<usize>,
    /// CPUs that never receive queue interrupts.
    banned: Cpuset,
    /// Most loaded CPU as of the last do_stat, for the sibling hint.
    max_loaded: Option<usize>,
}

impl CpuRegistry {
    /// Detects the logical CPU count from the per-CPU rows of the
    /// processor time source and seeds both counter generations with the
    /// current values. Fails when the count cannot be determined.
    pub fn init(prefix: &str, banned_mask: Option<&str>) -> Result<Self> {
        let ps = ProcStat::read(prefix)?;
        let count = ps.cpus.len();
        if count == 0 {
            bail!("Could not determine CPU count from {}/proc/stat", prefix);
        }
        debug!("{} cpus, btime {}", count, ps.btime);

        let mut banned = match banned_mask {
            Some(mask) => Cpuset::from_hex_str(mask, count)?,
            None => Cpuset::new(count),
        };
        if banned.population() == banned.capacity() {
            if let Some(cpu) = banned.first_set() {
                warn!("banned mask covers all {} cpus, re-enabling CPU{}", count, cpu);
                banned.clear(cpu)?;
            }
        }
        if !banned.is_empty() {
            info!(
                "{} cpus kept out of balancing (mask {:x})",
                banned.population(),
                banned.to_u64_mask()
            );
        }

        let mut cpus: Vec<CpuInfo> = (0..count)
            .map(|num| CpuInfo {
                num,
                ..Default::default()
            })
            .collect();
        for (ci, row) in cpus.iter_mut().zip(&ps.cpus) {
            if let Some(psc) = row {
                ci.psc = [*psc; 2];
            }
        }
        let ss = SoftnetStat::read_all(prefix)?;
        for (ci, row) in cpus.iter_mut().zip(&ss) {
            if let Some(s) = row {
                ci.ss = [*s; 2];
            }
        }

        Ok(Self {
            prefix: prefix.to_string(),
            lru: (0..count).collect(),
            by_load: (0..count).collect(),
            cpus,
            banned,
            max_loaded: None,
        })
    }

    pub fn count(&self) -> usize {
        self.cpus.len()
    }

    pub fn nth(&self, num: usize) -> Result<&CpuInfo> {
        self.cpus
            .get(num)
            .ok_or_else(|| anyhow!("no such cpu: {}", num))
    }

    /// Diagnostic snapshot of the queue to CPU mapping. Read-only.
    pub fn dump_map(&self) {
        for ci in &self.cpus {
            let queues = ci
                .queues()
                .iter()
                .map(|q| format!("{}:{}", q.iface, q.qnum))
                .collect::<Vec<_>>()
                .join(" ");
            debug!(
                "CPU{:02} load={:5.1} queues={} [{}]",
                ci.num(),
                ci.si_load(),
                ci.num_queues(),
                queues
            );
        }
    }

    /// Refreshes the counter double buffer: rotates NEW into OLD, then
    /// stores the freshly read row into NEW. A row that is missing or
    /// failed to parse leaves NEW equal to OLD, so the cycle contributes
    /// a zero delta for that CPU. An unreadable source aborts the whole
    /// cycle with both generations untouched.
    ///
    /// Returns the transient system-wide snapshot for diagnostics.
    pub fn read_stat(&mut self) -> Result<ProcStat> {
        let ps = ProcStat::read(&self.prefix)?;
        let ss = SoftnetStat::read_all(&self.prefix)?;

        for ci in self.cpus.iter_mut() {
            ci.psc[OLD] = ci.psc[NEW];
            match ps.cpus.get(ci.num).copied().flatten() {
                Some(psc) => ci.psc[NEW] = psc,
                None => warn!("cpu{}: unusable stat row, zero delta this cycle", ci.num),
            }

            ci.ss[OLD] = ci.ss[NEW];
            match ss.get(ci.num).copied().flatten() {
                Some(row) => ci.ss[NEW] = row,
                None => warn!("cpu{}: unusable softnet row, zero delta this cycle", ci.num),
            }
        }
        Ok(ps)
    }

    /// Derives every CPU's softirq load from the current counter deltas
    /// and restores the load ordering to measured order.
    ///
    /// The load combines the softirq share of the total tick delta with
    /// the softnet drop and time-squeeze rate over the poll interval,
    /// clamped to [0, 100]. An idle CPU scores 0.
    pub fn do_stat(&mut self, interval: Duration) {
        let secs = interval.as_secs_f64();
        for ci in self.cpus.iter_mut() {
            let si_ticks = ci.psc_diff(|p| p.softirq);
            let total_ticks = si_ticks
                + ci.psc_diff(|p| p.user)
                + ci.psc_diff(|p| p.nice)
                + ci.psc_diff(|p| p.system)
                + ci.psc_diff(|p| p.idle)
                + ci.psc_diff(|p| p.iowait)
                + ci.psc_diff(|p| p.irq)
                + ci.psc_diff(|p| p.steal)
                + ci.psc_diff(|p| p.guest);
            let si_pct = if total_ticks > 0 {
                si_ticks as f64 * 100.0 / total_ticks as f64
            } else {
                0.0
            };

            let pressure = ci.ss_diff(|s| s.dropped) + ci.ss_diff(|s| s.time_squeeze);
            let pressure_pct = if secs > 0.0 {
                (pressure as f64 / secs).min(100.0)
            } else {
                0.0
            };

            ci.si_load = (si_pct + pressure_pct).min(100.0);
        }
        self.resort_loads();
    }

    fn resort_loads(&mut self) {
        let cpus = &self.cpus;
        self.by_load
            .sort_by_key(|&num| (OrderedFloat(cpus[num].si_load), num));
        self.max_loaded = self
            .by_load
            .last()
            .copied()
            .filter(|&num| cpus[num].si_load > 0.0);
    }

    /// Hyperthread sibling under the fixed pairs-of-two grouping.
    fn sibling(num: usize) -> usize {
        num ^ (HT_PER_CPU - 1)
    }

    fn sibling_is_max_loaded(&self, num: usize) -> bool {
        self.max_loaded == Some(Self::sibling(num))
    }

    fn touch_lru(&mut self, num: usize) {
        if let Some(pos) = self.lru.iter().position(|&n| n == num) {
            self.lru.remove(pos);
        }
        self.lru.push(num);
    }

    /// Attaches a queue to an explicitly named CPU; any target that does
    /// not name a valid CPU index delegates to LRU selection. Returns the
    /// CPU the queue landed on.
    pub fn add_queue(&mut self, target: i32, queue: QueueRef) -> Result<usize> {
        if target >= 0 && (target as usize) < self.cpus.len() {
            let num = target as usize;
            self.cpus[num].queues.push(queue);
            self.touch_lru(num);
            Ok(num)
        } else {
            self.add_queue_lru(queue)
        }
    }

    /// Selects the least loaded CPU for a new queue. An equal-load run at
    /// the head of the load ordering breaks ties by assignment recency,
    /// preferring a CPU whose hyperthread sibling is not the most loaded
    /// CPU. The chosen CPU moves to the back of both orderings, so
    /// consecutive assignments between stat cycles spread across CPUs;
    /// measured load order returns on the next do_stat.
    pub fn add_queue_lru(&mut self, queue: QueueRef) -> Result<usize> {
        let head = self
            .by_load
            .iter()
            .copied()
            .find(|&num| !self.banned.is_set(num))
            .ok_or_else(|| anyhow!("all {} cpus are banned from balancing", self.cpus.len()))?;

        let head_load = self.cpus[head].si_load;
        let candidates: Vec<usize> = self
            .by_load
            .iter()
            .copied()
            .filter(|&num| !self.banned.is_set(num))
            .take_while(|&num| self.cpus[num].si_load == head_load)
            .collect();

        let num = if candidates.len() == 1 {
            candidates[0]
        } else {
            // Least recently assigned first among the tied CPUs.
            let tied: Vec<usize> = self
                .lru
                .iter()
                .copied()
                .filter(|n| candidates.contains(n))
                .collect();
            tied.iter()
                .copied()
                .find(|&n| !self.sibling_is_max_loaded(n))
                .unwrap_or(tied[0])
        };

        self.cpus[num].queues.push(queue);
        self.touch_lru(num);
        if let Some(pos) = self.by_load.iter().position(|&n| n == num) {
            self.by_load.remove(pos);
            self.by_load.push(num);
        }
        Ok(num)
    }

    /// Detaches a queue from the named CPU. A queue that is not attached
    /// there is a caller error and leaves the CPU's queue list unchanged.
    pub fn del_queue(&mut self, num: usize, queue: &QueueRef) -> Result<()> {
        let ci = self
            .cpus
            .get_mut(num)
            .ok_or_else(|| anyhow!("no such cpu: {}", num))?;
        let pos = ci
            .queues
            .iter()
            .position(|q| q == queue)
            .ok_or_else(|| {
                anyhow!("{}:{} is not attached to CPU{}", queue.iface, queue.qnum, num)
            })?;
        ci.queues.remove(pos);
        Ok(())
    }
}
