//! Client address pool
//!
//! Leases virtual IPv4 addresses to IP flows from an inclusive
//! `[start, end]` range. Both ends must share the same /16 network prefix.
//! Allocation is a first-fit scan over a bit vector; all operations are
//! serialized on a single mutex so concurrent open/close are race-free.

use std::net::Ipv4Addr;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::ConfigError;

const WORD_BITS: u32 = u64::BITS;

/// An inclusive IPv4 lease range
#[derive(Debug)]
pub struct AddressPool {
    base: Ipv4Addr,
    size: u32,
    in_use: Mutex<Vec<u64>>,
}

impl AddressPool {
    /// Create a pool spanning `[start, end]` inclusive
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when the range is reversed
    /// or the endpoints do not share a /16 network prefix.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self, ConfigError> {
        let start_bits = u32::from(start);
        let end_bits = u32::from(end);
        if start_bits > end_bits {
            return Err(ConfigError::validation(format!(
                "pool start {start} is after end {end}"
            )));
        }
        if start_bits >> 16 != end_bits >> 16 {
            return Err(ConfigError::validation(format!(
                "pool range {start}-{end} spans more than one /16 network"
            )));
        }
        let size = end_bits - start_bits + 1;
        let words = size.div_ceil(WORD_BITS) as usize;
        Ok(Self {
            base: start,
            size,
            in_use: Mutex::new(vec![0; words]),
        })
    }

    /// Lease the lowest free address, or `None` when the pool is full
    #[must_use]
    pub fn allocate(&self) -> Option<Ipv4Addr> {
        let mut words = self.in_use.lock();
        for (word_index, word) in words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones();
            let index = word_index as u32 * WORD_BITS + bit;
            if index >= self.size {
                return None;
            }
            *word |= 1 << bit;
            return Some(Ipv4Addr::from(u32::from(self.base) + index));
        }
        None
    }

    /// Return a leased address to the pool
    ///
    /// Addresses outside the range are ignored with a warning; returning
    /// an address that was not leased is a no-op.
    pub fn deallocate(&self, address: Ipv4Addr) {
        let Some(index) = u32::from(address).checked_sub(u32::from(self.base)) else {
            warn!("address {} is below the pool range", address);
            return;
        };
        if index >= self.size {
            warn!("address {} is outside the pool range", address);
            return;
        }
        let mut words = self.in_use.lock();
        words[(index / WORD_BITS) as usize] &= !(1 << (index % WORD_BITS));
    }

    /// Total number of leasable addresses
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Number of currently leased addresses
    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.in_use
            .lock()
            .iter()
            .map(|word| word.count_ones())
            .sum()
    }
}
