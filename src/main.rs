// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod cpu;
mod cpuset;
mod iface;
mod irq;
mod stats;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{debug, info, warn};

use crate::cpu::{CpuRegistry, QueueRef};
use crate::cpuset::Cpuset;
use crate::stats::ProcStatCpu;

/// irqbal balances network interface queue interrupts across logical
/// CPUs. It measures per-CPU softirq load from the kernel's time
/// accounting and softnet counters and steers each hardware queue's
/// interrupt lines to the least loaded CPU, spreading assignments over
/// the least recently used CPUs among equals.
#[derive(Debug, Parser)]
struct Opts {
    /// Monitoring and balancing interval in seconds.
    #[clap(short, long, default_value = "2.0")]
    interval: f64,

    /// Stay in the foreground instead of detaching from the terminal.
    #[clap(short = 'd', long)]
    foreground: bool,

    /// Prefix for the kernel /proc and /sys trees, for running against a
    /// redirected copy.
    #[clap(long, env = "IRQBAL_PREFIX", default_value = "")]
    prefix: String,

    /// PID file guarding against a second instance.
    #[clap(long, default_value = "/var/run/irqbal.pid")]
    pidfile: String,

    /// Hexadecimal mask of CPUs that never receive queue interrupts,
    /// e.g. 0x5 to keep CPUs 0 and 2 out of balancing.
    #[clap(short, long)]
    banned_cpus: Option<String>,

    /// Report version information. Currently has no effect.
    #[clap(long)]
    version: bool,

    /// Enable verbose output. Specify multiple times to increase
    /// verbosity.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn now_monotonic() -> u64 {
    let mut time = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut time) };
    assert!(ret == 0);
    time.tv_sec as u64 * 1_000_000_000 + time.tv_nsec as u64
}

/// Single-instance lock. Creation fails while another instance's file
/// exists. The recorded PID is not checked for liveness, so a file left
/// behind by a crash blocks startup until removed.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &str) -> Result<Self> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("already running? {} exists or is not creatable", path))?;
        writeln!(file, "{}", unsafe { libc::getpid() })
            .with_context(|| format!("Failed to write {}", path))?;
        Ok(Self {
            path: PathBuf::from(path),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn daemonize() -> Result<()> {
    match unsafe { libc::fork() } {
        -1 => bail!("fork failed"),
        0 => {}
        _ => std::process::exit(0),
    }
    if unsafe { libc::setsid() } == -1 {
        bail!("setsid failed");
    }
    std::env::set_current_dir("/")?;

    let null = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("Failed to open /dev/null")?;
    for fd in 0..=2 {
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } == -1 {
            bail!("dup2 failed for fd {}", fd);
        }
    }
    Ok(())
}

/// A queue assignment as decided by the balancer. `applied` goes true
/// once every interrupt line of the queue accepted the affinity write.
#[derive(Debug)]
struct Assignment {
    irqs: Vec<u32>,
    cpu: usize,
    applied: bool,
}

struct Balancer {
    registry: CpuRegistry,
    prefix: String,
    assigned: BTreeMap<(String, usize), Assignment>,
    prev_total_cpu: ProcStatCpu,
    prev_at: u64,
}

impl Balancer {
    fn init(opts: &Opts) -> Result<Self> {
        let registry = CpuRegistry::init(&opts.prefix, opts.banned_cpus.as_deref())?;
        let prev_total_cpu = stats::ProcStat::read(&opts.prefix)?.cpu_total;
        Ok(Self {
            registry,
            prefix: opts.prefix.clone(),
            assigned: BTreeMap::new(),
            prev_total_cpu,
            prev_at: now_monotonic(),
        })
    }

    /// Applies one queue decision to the kernel: a fresh cpuset for the
    /// chosen CPU, rendered as a 64-bit mask, written to every interrupt
    /// line of the queue.
    fn apply(&self, irqs: &[u32], num: usize) -> Result<()> {
        let mut set = Cpuset::new(self.registry.count());
        set.set(num)?;
        for &irq in irqs {
            irq::set_affinity(&self.prefix, irq, set.to_u64_mask())?;
        }
        Ok(())
    }

    /// Reconciles discovered queues against current assignments: newly
    /// appeared queues get a CPU, vanished queues are detached, and
    /// affinity writes that failed earlier are retried.
    fn rescan(&mut self) -> Result<()> {
        let ifaces = iface::list_interfaces(&self.prefix)?;
        let found = iface::discover_queues(&self.prefix, &ifaces)?;
        let seen: BTreeSet<(String, usize)> =
            found.iter().map(|qi| (qi.iface.clone(), qi.qnum)).collect();
        let mut changed = false;

        for qi in &found {
            let key = (qi.iface.clone(), qi.qnum);
            if self.assigned.contains_key(&key) {
                continue;
            }
            let num = self.registry.add_queue(
                -1,
                QueueRef {
                    iface: qi.iface.clone(),
                    qnum: qi.qnum,
                },
            )?;
            let applied = match self.apply(&qi.irqs, num) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{}:{}: affinity not applied: {:#}", qi.iface, qi.qnum, e);
                    false
                }
            };
            let ci = self.registry.nth(num)?;
            info!(
                "{}:{} irqs {:?} -> CPU{} (load {:.1}, {} queues)",
                qi.iface,
                qi.qnum,
                qi.irqs,
                ci.num(),
                ci.si_load(),
                ci.num_queues()
            );
            self.assigned.insert(
                key,
                Assignment {
                    irqs: qi.irqs.clone(),
                    cpu: num,
                    applied,
                },
            );
            changed = true;
        }

        let gone: Vec<(String, usize)> = self
            .assigned
            .keys()
            .filter(|&key| !seen.contains(key))
            .cloned()
            .collect();
        for key in gone {
            if let Some(asg) = self.assigned.remove(&key) {
                let queue = QueueRef {
                    iface: key.0.clone(),
                    qnum: key.1,
                };
                if let Err(e) = self.registry.del_queue(asg.cpu, &queue) {
                    warn!("stale queue {}:{}: {:#}", key.0, key.1, e);
                }
                info!("{}:{} gone from CPU{}", key.0, key.1, asg.cpu);
                changed = true;
            }
        }

        // Kernel-side affinity still holds the old mask for writes that
        // failed; retry until one goes through.
        let retries: Vec<(String, usize)> = self
            .assigned
            .iter()
            .filter(|(_, asg)| !asg.applied)
            .map(|(key, _)| key.clone())
            .collect();
        for key in retries {
            let (irqs, cpu) = {
                let asg = &self.assigned[&key];
                (asg.irqs.clone(), asg.cpu)
            };
            match self.apply(&irqs, cpu) {
                Ok(()) => {
                    if let Some(asg) = self.assigned.get_mut(&key) {
                        asg.applied = true;
                    }
                    info!("{}:{} affinity applied on retry", key.0, key.1);
                }
                Err(e) => warn!("{}:{}: affinity still not applied: {:#}", key.0, key.1, e),
            }
        }

        if changed {
            self.registry.dump_map();
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let now = now_monotonic();
        let interval = Duration::from_nanos(now - self.prev_at);
        self.prev_at = now;

        let ps = self.registry.read_stat()?;
        self.registry.do_stat(interval);

        let busy = cpu_busy(&self.prev_total_cpu, &ps.cpu_total);
        self.prev_total_cpu = ps.cpu_total;
        debug!(
            "cpu={:5.1} ctxt={} procs={} running={} blocked={}",
            busy * 100.0,
            ps.ctxt,
            ps.processes,
            ps.procs_running,
            ps.procs_blocked
        );

        self.rescan()
    }
}

/// Aggregate busy share of all CPUs between two total-row snapshots.
fn cpu_busy(prev: &ProcStatCpu, curr: &ProcStatCpu) -> f64 {
    let diff = |field: fn(&ProcStatCpu) -> u64| field(curr).saturating_sub(field(prev));
    let busy = diff(|p| p.user)
        + diff(|p| p.nice)
        + diff(|p| p.system)
        + diff(|p| p.irq)
        + diff(|p| p.softirq)
        + diff(|p| p.steal);
    let total = busy + diff(|p| p.idle) + diff(|p| p.iowait);
    if total == 0 {
        return 0.0;
    }
    busy as f64 / total as f64
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    if opts.prefix.is_empty() && unsafe { libc::geteuid() } != 0 {
        bail!("root required to steer interrupt affinity");
    }

    let mut balancer = Balancer::init(&opts)?;
    if balancer.registry.count() == 1 {
        info!("terminating because single CPU");
        return Ok(());
    }

    if !opts.foreground {
        daemonize()?;
    }
    let _pidfile = PidFile::create(&opts.pidfile)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Err(e) = balancer.rescan() {
        warn!("initial queue scan failed: {:#}", e);
    }
    info!(
        "balancing {} interface queues across {} cpus",
        balancer.assigned.len(),
        balancer.registry.count()
    );

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_secs_f64(opts.interval));
        if let Err(e) = balancer.step() {
            warn!("balance cycle skipped: {:#}", e);
        }
    }

    info!("exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_blocks_second_instance() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("irqbal.pid");
        let path_str = path.to_str().unwrap();

        let first = PidFile::create(path_str).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), unsafe {
            libc::getpid() as u32
        });

        // A present file blocks a second instance, live or not.
        assert!(PidFile::create(path_str).is_err());

        drop(first);
        assert!(!path.exists());
        PidFile::create(path_str).unwrap();
    }

    #[test]
    fn busy_share_between_snapshots() {
        let prev = ProcStatCpu {
            user: 100,
            idle: 800,
            softirq: 50,
            ..Default::default()
        };
        let curr = ProcStatCpu {
            user: 150,
            idle: 850,
            softirq: 100,
            ..Default::default()
        };
        assert!((cpu_busy(&prev, &curr) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(cpu_busy(&curr, &curr), 0.0);
    }
}
