// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use anyhow::{bail, Context, Result};
use bitvec::prelude::*;

/// A set of logical CPU indices with a fixed capacity and a cached
/// population count. Never implicitly resized.
#[derive(Debug, Clone)]
pub struct Cpuset {
    bits: BitVec<u64, Lsb0>,
    ncpus: usize,
}

impl Cpuset {
    pub fn new(capacity: usize) -> Self {
        Self {
            bits: bitvec![u64, Lsb0; 0; capacity],
            ncpus: 0,
        }
    }

    /// Parses a hexadecimal cpumask such as "0x5", "ff" or "0xff_00ff"
    /// into a set of the given capacity. A bit at or beyond the capacity
    /// is an error.
    pub fn from_hex_str(mask: &str, capacity: usize) -> Result<Self> {
        let hex_str = {
            let mut tmp_str = mask.strip_prefix("0x").unwrap_or(mask).replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {}", mask))?;

        let mut set = Self::new(capacity);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                set.set(index * 8 + lsb)
                    .with_context(|| format!("cpumask {} does not fit", mask))?;
            }
        }
        Ok(set)
    }

    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    pub fn set(&mut self, cpu: usize) -> Result<()> {
        if cpu >= self.bits.len() {
            bail!("cpu {} out of range for cpuset of {} cpus", cpu, self.bits.len());
        }
        if !self.bits[cpu] {
            self.bits.set(cpu, true);
            self.ncpus += 1;
        }
        Ok(())
    }

    pub fn clear(&mut self, cpu: usize) -> Result<()> {
        if cpu >= self.bits.len() {
            bail!("cpu {} out of range for cpuset of {} cpus", cpu, self.bits.len());
        }
        if self.bits[cpu] {
            self.bits.set(cpu, false);
            self.ncpus -= 1;
        }
        Ok(())
    }

    /// Out-of-range indices read as unset.
    pub fn is_set(&self, cpu: usize) -> bool {
        self.bits.get(cpu).map(|b| *b).unwrap_or(false)
    }

    /// Lowest set index, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.bits.first_one()
    }

    /// Packs bits [0, 64) into a mask for the 64-bit affinity write path.
    /// Bits at or beyond index 64 are dropped.
    pub fn to_u64_mask(&self) -> u64 {
        self.bits.as_raw_slice().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.ncpus == 0
    }

    pub fn population(&self) -> usize {
        self.ncpus
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn population_matches_recount() {
        let mut set = Cpuset::new(70);
        let ops = [(3, true), (7, true), (3, true), (64, true), (7, false), (0, true), (0, false)];
        for &(cpu, on) in &ops {
            if on {
                set.set(cpu).unwrap();
            } else {
                set.clear(cpu).unwrap();
            }
            let recount = (0..set.capacity()).filter(|&i| set.is_set(i)).count();
            assert_eq!(set.population(), recount);
        }
        assert_eq!(set.population(), 2);
    }

    #[test]
    fn mask_agrees_with_is_set() {
        let mut set = Cpuset::new(80);
        for cpu in [0, 5, 31, 63, 64, 70] {
            set.set(cpu).unwrap();
        }
        let mask = set.to_u64_mask();
        for bit in 0..64 {
            assert_eq!(mask & (1 << bit) != 0, set.is_set(bit), "bit {}", bit);
        }
        // Bits at or beyond 64 never appear in the mask.
        assert_eq!(mask, 1 | 1 << 5 | 1 << 31 | 1 << 63);
    }

    #[test]
    fn first_set_none_iff_empty() {
        let mut set = Cpuset::new(8);
        assert!(set.is_empty());
        assert_eq!(set.first_set(), None);

        set.set(5).unwrap();
        assert!(!set.is_empty());
        assert_eq!(set.first_set(), Some(5));

        set.clear(5).unwrap();
        assert!(set.is_empty());
        assert_eq!(set.first_set(), None);
    }

    #[test]
    fn out_of_range_mutation_fails_cleanly() {
        let mut set = Cpuset::new(4);
        set.set(1).unwrap();

        assert!(set.set(4).is_err());
        assert!(set.clear(17).is_err());
        assert_eq!(set.population(), 1);
        assert!(!set.is_set(4));
        assert!(!set.is_set(17));
    }

    #[test]
    fn hex_parse() {
        let set = Cpuset::from_hex_str("0x5", 4).unwrap();
        assert_eq!(set.population(), 2);
        assert!(set.is_set(0));
        assert!(set.is_set(2));

        let set = Cpuset::from_hex_str("ff_00", 16).unwrap();
        assert_eq!(set.population(), 8);
        assert_eq!(set.first_set(), Some(8));

        assert!(Cpuset::from_hex_str("0x10", 4).is_err());
        assert!(Cpuset::from_hex_str("zz", 4).is_err());
    }
}
