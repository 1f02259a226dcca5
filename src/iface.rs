// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::fs;

use anyhow::{Context, Result};

/// A hardware queue of a network interface and the interrupt lines that
/// service it. RX and TX interrupts of the same queue index merge into
/// one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub iface: String,
    pub qnum: usize,
    pub irqs: Vec<u32>,
}

/// Interface names under `{prefix}/sys/class/net`, loopback excluded.
pub fn list_interfaces(prefix: &str) -> Result<Vec<String>> {
    let path = format!("{}/sys/class/net", prefix);
    let mut names = Vec::new();
    for entry in fs::read_dir(&path).with_context(|| format!("Failed to read {}", path))? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name == "lo" {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Scans `{prefix}/proc/interrupts` for interrupt lines whose action name
/// belongs to one of the given interfaces. Recognized name forms:
/// `eth0`, `eth0-3`, `eth0-rx-3`, `eth0-tx-3`, `eth0-TxRx-3`.
pub fn discover_queues(prefix: &str, ifaces: &[String]) -> Result<Vec<QueueInfo>> {
    let path = format!("{}/proc/interrupts", prefix);
    let buf = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;

    let mut queues: BTreeMap<(String, usize), Vec<u32>> = BTreeMap::new();
    for line in buf.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        // Header and named rows (NMI, LOC, ...) carry no usable line number.
        let Some(irq) = label.strip_suffix(':').and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        for token in fields {
            let action = token.trim_end_matches(',');
            for iface in ifaces {
                if let Some(qnum) = match_queue(action, iface) {
                    queues.entry((iface.clone(), qnum)).or_default().push(irq);
                }
            }
        }
    }

    Ok(queues
        .into_iter()
        .map(|((iface, qnum), irqs)| QueueInfo { iface, qnum, irqs })
        .collect())
}

fn match_queue(action: &str, iface: &str) -> Option<usize> {
    if action == iface {
        return Some(0);
    }
    let rest = action.strip_prefix(iface)?.strip_prefix('-')?;
    rest.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERRUPTS: &str = "\
            CPU0       CPU1
   0:        163          0   IO-APIC-edge      timer
  24:       1000          0   PCI-MSI-edge      eth0-rx-0
  25:        500          0   PCI-MSI-edge      eth0-tx-0
  26:          0          0   PCI-MSI-edge      eth0-rx-1
  27:          0          0   PCI-MSI-edge      eth0-tx-1
  28:          0          0   PCI-MSI-edge      eth1-TxRx-0
  29:          0        900   PCI-MSI-edge      eth2
 NMI:          0          0   Non-maskable interrupts
 LOC:     870188     860101   Local timer interrupts
";

    fn write_interrupts(dir: &std::path::Path) -> String {
        let proc = dir.join("proc");
        fs::create_dir_all(&proc).unwrap();
        fs::write(proc.join("interrupts"), INTERRUPTS).unwrap();
        dir.to_str().unwrap().to_string()
    }

    #[test]
    fn queues_merge_rx_and_tx() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let prefix = write_interrupts(dir.path());
        let ifaces = vec!["eth0".to_string(), "eth1".to_string(), "eth2".to_string()];

        let queues = discover_queues(&prefix, &ifaces).unwrap();
        assert_eq!(
            queues,
            vec![
                QueueInfo {
                    iface: "eth0".to_string(),
                    qnum: 0,
                    irqs: vec![24, 25],
                },
                QueueInfo {
                    iface: "eth0".to_string(),
                    qnum: 1,
                    irqs: vec![26, 27],
                },
                QueueInfo {
                    iface: "eth1".to_string(),
                    qnum: 0,
                    irqs: vec![28],
                },
                QueueInfo {
                    iface: "eth2".to_string(),
                    qnum: 0,
                    irqs: vec![29],
                },
            ]
        );
    }

    #[test]
    fn unknown_interfaces_are_ignored() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let prefix = write_interrupts(dir.path());

        let queues = discover_queues(&prefix, &["eth9".to_string()]).unwrap();
        assert!(queues.is_empty());
    }

    #[test]
    fn list_interfaces_skips_loopback() {
        let dir = tempfile::tempdir().expect("tmpdir");
        for name in ["lo", "eth0", "wlan0"] {
            fs::create_dir_all(dir.path().join("sys/class/net").join(name)).unwrap();
        }

        let names = list_interfaces(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(names, vec!["eth0".to_string(), "wlan0".to_string()]);
    }

    #[test]
    fn action_name_matching() {
        assert_eq!(match_queue("eth0", "eth0"), Some(0));
        assert_eq!(match_queue("eth0-3", "eth0"), Some(3));
        assert_eq!(match_queue("eth0-rx-3", "eth0"), Some(3));
        assert_eq!(match_queue("eth0-TxRx-7", "eth0"), Some(7));
        assert_eq!(match_queue("eth01", "eth0"), None);
        assert_eq!(match_queue("eth0-event", "eth0"), None);
        assert_eq!(match_queue("timer", "eth0"), None);
    }
}
