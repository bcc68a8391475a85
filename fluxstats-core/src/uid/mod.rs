//! Unique identifier dictionary
//!
//! Every string that takes part in a statistic key (statistic names, tag
//! names and tag values) is interned to a fixed-width [`Uid`]. Mappings are
//! permanent: a name is assigned at most one identifier and the identifier is
//! never reused, so cached entries never need invalidating.
//!
//! - [`UidStore`]: persistence boundary holding the forward and reverse tables
//! - [`MemoryUidStore`]: in-process store, used by tests and single-node setups
//! - [`FileUidStore`]: in-process store made durable by a checksummed log
//! - [`UidDictionary`]: LRU-cached front with per-name conditional creation

mod dictionary;
mod log;
mod store;

pub use dictionary::{FetchMode, UidDictionary};
pub use log::FileUidStore;
pub use store::{MemoryUidStore, UidStore};

use crate::{Result, StatsError};
use bytes::BufMut;
use std::fmt;

/// Name reported for the rolled-up sentinel
pub const ROLLED_UP_NAME: &str = "*";

/// A fixed-width identifier assigned to an interned name
///
/// Two values per width are reserved and never issued: all-zero bytes and
/// all-one bytes, the latter standing for a rolled-up tag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid {
    value: u64,
    width: u8,
}

impl Uid {
    /// Widest supported identifier in bytes
    pub const MAX_WIDTH: usize = 8;

    /// Build an identifier, checking it fits the width
    pub fn new(value: u64, width: usize) -> Result<Self> {
        check_width(width)?;
        if value > all_ones(width) {
            return Err(StatsError::InvalidFormat(format!(
                "Value {} does not fit a {} byte uid",
                value, width
            )));
        }
        Ok(Self {
            value,
            width: width as u8,
        })
    }

    /// The rolled-up sentinel for the width
    pub fn rolled_up(width: usize) -> Result<Self> {
        check_width(width)?;
        Ok(Self {
            value: all_ones(width),
            width: width as u8,
        })
    }

    /// Largest value the dictionary may issue for the width
    pub fn max_issuable(width: usize) -> u64 {
        all_ones(width) - 1
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn width(&self) -> usize {
        self.width as usize
    }

    pub fn is_rolled_up(&self) -> bool {
        self.value == all_ones(self.width())
    }

    /// Big-endian bytes, exactly `width` long
    pub fn to_bytes(&self) -> Vec<u8> {
        self.value.to_be_bytes()[Self::MAX_WIDTH - self.width()..].to_vec()
    }

    /// Append the big-endian bytes to a buffer
    pub fn put<B: BufMut>(&self, buf: &mut B) {
        buf.put_uint(self.value, self.width());
    }

    /// Parse big-endian bytes; the width is the slice length
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        check_width(bytes.len())?;
        let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
        Ok(Self {
            value,
            width: bytes.len() as u8,
        })
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.value, width = self.width() * 2)
    }
}

fn all_ones(width: usize) -> u64 {
    if width >= Uid::MAX_WIDTH {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

fn check_width(width: usize) -> Result<()> {
    if width == 0 || width > Uid::MAX_WIDTH {
        return Err(StatsError::Config(format!(
            "UID width must be 1..={} bytes, got {}",
            Uid::MAX_WIDTH,
            width
        )));
    }
    Ok(())
}
