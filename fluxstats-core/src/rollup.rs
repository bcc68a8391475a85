//! Rollup bitmasks
//!
//! A [`RollUpBitMask`] marks which tag positions of a statistic are
//! wildcarded in one materialized row. Bit `i` refers to position `i` in the
//! statistic's sorted tag-name list, not to a tag uid, so the same mask means
//! the same thing for any statistic with the same tag layout.
//!
//! [`required_masks`] decides, from the statistic's rollup policy, which
//! masks every event of that statistic is written under.

use crate::statistic::{RollUpType, StatisticConfiguration};
use crate::{Result, StatsError};
use std::collections::BTreeSet;
use std::fmt;

/// Largest number of tags a statistic may declare
pub const MAX_TAGS: usize = 15;

/// Bitmask over tag positions; a set bit means that tag is rolled up
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RollUpBitMask(u16);

impl RollUpBitMask {
    /// The fully specific, non rolled up mask
    pub const ZERO: RollUpBitMask = RollUpBitMask(0);

    /// Byte width of the serialized form
    pub const BYTE_LEN: usize = 2;

    /// Build a mask from raw bits
    pub fn from_bits(bits: u16) -> Result<Self> {
        if bits >> MAX_TAGS != 0 {
            return Err(StatsError::InvalidFormat(format!(
                "Mask {:#06x} uses positions beyond {}",
                bits, MAX_TAGS
            )));
        }
        Ok(Self(bits))
    }

    /// Build a mask with the given tag positions rolled up
    pub fn from_tag_positions(positions: &[usize]) -> Result<Self> {
        let mut bits = 0u16;
        for &pos in positions {
            if pos >= MAX_TAGS {
                return Err(StatsError::Config(format!(
                    "Tag position {} out of range, max is {}",
                    pos,
                    MAX_TAGS - 1
                )));
            }
            bits |= 1 << pos;
        }
        Ok(Self(bits))
    }

    /// Mask with every one of `tag_count` positions rolled up
    pub fn all_rolled_up(tag_count: usize) -> Self {
        let count = tag_count.min(MAX_TAGS);
        Self(((1u32 << count) - 1) as u16)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Whether the tag at `position` is rolled up
    pub fn is_rolled_up(&self, position: usize) -> bool {
        position < MAX_TAGS && self.0 & (1 << position) != 0
    }

    /// Rolled up positions, ascending
    pub fn tag_positions(&self) -> Vec<usize> {
        (0..MAX_TAGS).filter(|p| self.is_rolled_up(*p)).collect()
    }

    /// Every subset of `tag_count` positions; `2^tag_count` masks
    pub fn all_masks(tag_count: usize) -> BTreeSet<RollUpBitMask> {
        let all = Self::all_rolled_up(tag_count).0 as u32;
        (0..=all).map(|bits| RollUpBitMask(bits as u16)).collect()
    }

    pub fn to_bytes(&self) -> [u8; Self::BYTE_LEN] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; Self::BYTE_LEN] = bytes
            .get(..Self::BYTE_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| StatsError::InvalidFormat("Mask needs 2 bytes".into()))?;
        Self::from_bits(u16::from_be_bytes(raw))
    }
}

impl fmt::Display for RollUpBitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015b}", self.0)
    }
}

/// Masks that must be materialized for every event of the statistic
pub fn required_masks(config: &StatisticConfiguration) -> BTreeSet<RollUpBitMask> {
    match config.rollup_type() {
        RollUpType::None => BTreeSet::from([RollUpBitMask::ZERO]),
        RollUpType::All => RollUpBitMask::all_masks(config.tag_names().len()),
        RollUpType::Custom => {
            let mut masks = config.custom_masks().clone();
            masks.insert(RollUpBitMask::ZERO);
            masks
        }
    }
}

/// Whether some materialized mask rolls up exactly the given tag names
pub fn is_supported<'a, I>(config: &StatisticConfiguration, rolled_up_tags: I) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    let positions: Option<Vec<usize>> = rolled_up_tags
        .into_iter()
        .map(|name| config.position_of(name))
        .collect();

    match positions.map(|p| RollUpBitMask::from_tag_positions(&p)) {
        Some(Ok(mask)) => match config.rollup_type() {
            RollUpType::None => mask.is_zero(),
            RollUpType::All => true,
            RollUpType::Custom => mask.is_zero() || config.custom_masks().contains(&mask),
        },
        _ => false,
    }
}
