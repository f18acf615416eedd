//! Unique process identifiers.
//!
//! A UPID is a 128-bit composite addressing one process observed by one
//! agent: the high 64 bits pack the owning agent's ASID and the pid, the low
//! 64 bits carry the process start time. Packing the ASID into the key means
//! process records survive an agent restart only when re-registration
//! preserves the ASID; otherwise the records become unreachable and age out.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::{FleetError, FleetResult};

/// 128-bit unique process id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Upid {
    hi: u64,
    lo: u64,
}

impl Upid {
    /// Compose a UPID from its parts
    #[must_use]
    pub fn from_parts(asid: u32, pid: u32, start_time_ns: u64) -> Self {
        Self {
            hi: (u64::from(asid) << 32) | u64::from(pid),
            lo: start_time_ns,
        }
    }

    /// ASID of the owning agent
    #[must_use]
    pub fn asid(&self) -> u32 {
        (self.hi >> 32) as u32
    }

    #[must_use]
    pub fn pid(&self) -> u32 {
        (self.hi & 0xffff_ffff) as u32
    }

    #[must_use]
    pub fn start_time_ns(&self) -> u64 {
        self.lo
    }

    /// Big-endian 16-byte encoding, ordered so range scans group by ASID
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.hi.to_be_bytes());
        bytes[8..].copy_from_slice(&self.lo.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> FleetResult<Self> {
        if bytes.len() != 16 {
            return Err(FleetError::corrupt(
                bytes,
                format!("UPID must be 16 bytes, got {}", bytes.len()),
            ));
        }
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..]);
        Ok(Self {
            hi: u64::from_be_bytes(hi),
            lo: u64::from_be_bytes(lo),
        })
    }
}

impl fmt::Display for Upid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.asid(), self.pid(), self.lo)
    }
}
