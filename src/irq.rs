// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs::OpenOptions;
use std::io::Write;

use anyhow::{Context, Result};

/// Writes an affinity mask for one interrupt line, rendered as a hex
/// string, to `{prefix}/proc/irq/{irq}/smp_affinity`. One bounded
/// open/write/close; the control file is never created, so a failure
/// leaves the kernel-side affinity as it was.
pub fn set_affinity(prefix: &str, irq: u32, mask: u64) -> Result<()> {
    let path = format!("{}/proc/irq/{}/smp_affinity", prefix, irq);
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path))?;
    file.write_all(format!("{:x}\n", mask).as_bytes())
        .with_context(|| format!("Failed to write {}", path))?;
    Ok(())
}
