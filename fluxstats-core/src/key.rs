//! Statistic key codec
//!
//! A [`StatKey`] identifies one cell: a statistic, a rollup variant, an
//! interval, a time bucket and the tag values. Its serialized form is
//! ordered so rows of the same statistic and rollup cluster together and
//! sort by time.
//!
//! Layout, all big-endian, `w` is the uid width:
//! - statistic uid (w)
//! - rollup mask (2)
//! - interval column duration in ms (8)
//! - row time bucket (8, sign bit flipped)
//! - tag name uid and tag value uid pairs (2w each)
//! - column time bucket (8, sign bit flipped)
//!
//! Everything before the column time is the row key; the column time is the
//! column qualifier.

use crate::rollup::{required_masks, RollUpBitMask};
use crate::statistic::StatisticConfiguration;
use crate::uid::Uid;
use crate::{Interval, Result, StatsError, Timestamp};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

const TIME_LEN: usize = 8;
const SIGN_FLIP: u64 = 1 << 63;

/// A tag name uid paired with a tag value uid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagValue {
    pub tag: Uid,
    pub value: Uid,
}

impl TagValue {
    pub fn new(tag: Uid, value: Uid) -> Self {
        Self { tag, value }
    }

    /// Same tag with the value replaced by the rolled-up sentinel
    pub fn rolled_up(&self) -> Result<Self> {
        Ok(Self {
            tag: self.tag,
            value: Uid::rolled_up(self.value.width())?,
        })
    }
}

/// Canonical key of one aggregate cell
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatKey {
    statistic: Uid,
    mask: RollUpBitMask,
    interval: Interval,
    row_time: Timestamp,
    column_time: Timestamp,
    /// Sorted by tag uid
    tags: Vec<TagValue>,
}

impl StatKey {
    /// Build a key, truncating the timestamp to the interval's buckets
    pub fn new(
        statistic: Uid,
        mask: RollUpBitMask,
        interval: Interval,
        timestamp: Timestamp,
        mut tags: Vec<TagValue>,
    ) -> Self {
        tags.sort();
        Self {
            statistic,
            mask,
            interval,
            row_time: interval.truncate_to_row(timestamp),
            column_time: interval.truncate_to_column(timestamp),
            tags,
        }
    }

    pub fn statistic(&self) -> Uid {
        self.statistic
    }

    pub fn mask(&self) -> RollUpBitMask {
        self.mask
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Start of the row bucket
    pub fn row_time(&self) -> Timestamp {
        self.row_time
    }

    /// Start of the column bucket
    pub fn column_time(&self) -> Timestamp {
        self.column_time
    }

    pub fn tags(&self) -> &[TagValue] {
        &self.tags
    }

    /// Same cell at a coarser interval
    pub fn with_interval(&self, interval: Interval) -> Self {
        Self {
            statistic: self.statistic,
            mask: self.mask,
            interval,
            row_time: interval.truncate_to_row(self.column_time),
            column_time: interval.truncate_to_column(self.column_time),
            tags: self.tags.clone(),
        }
    }

    /// Serialized length in bytes
    pub fn encoded_len(&self) -> usize {
        let width = self.statistic.width();
        width
            + RollUpBitMask::BYTE_LEN
            + Interval::BYTE_LEN
            + TIME_LEN
            + self.tags.len() * 2 * width
            + TIME_LEN
    }

    /// Full serialized key
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.put_row_key(&mut buf);
        buf.put_u64(flip(self.column_time));
        buf.freeze()
    }

    /// Serialized row key, the key without its column qualifier
    pub fn row_key(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len() - TIME_LEN);
        self.put_row_key(&mut buf);
        buf.freeze()
    }

    /// Serialized column qualifier
    pub fn column_qualifier(&self) -> [u8; TIME_LEN] {
        flip(self.column_time).to_be_bytes()
    }

    fn put_row_key(&self, buf: &mut BytesMut) {
        self.statistic.put(buf);
        buf.put_slice(&self.mask.to_bytes());
        buf.put_slice(&self.interval.to_bytes());
        buf.put_u64(flip(self.row_time));
        for tag in &self.tags {
            tag.tag.put(buf);
            tag.value.put(buf);
        }
    }

    /// Parse a serialized key with uids of `width` bytes
    pub fn from_bytes(bytes: &[u8], width: usize) -> Result<Self> {
        let fixed = width + RollUpBitMask::BYTE_LEN + Interval::BYTE_LEN + 2 * TIME_LEN;
        if width == 0 || bytes.len() < fixed || (bytes.len() - fixed) % (2 * width) != 0 {
            return Err(StatsError::InvalidFormat(format!(
                "Key of {} bytes does not fit uid width {}",
                bytes.len(),
                width
            )));
        }

        let (statistic, rest) = bytes.split_at(width);
        let (mask, rest) = rest.split_at(RollUpBitMask::BYTE_LEN);
        let (interval, rest) = rest.split_at(Interval::BYTE_LEN);
        let (row_time, rest) = rest.split_at(TIME_LEN);
        let (tag_bytes, column_time) = rest.split_at(rest.len() - TIME_LEN);

        let tags = tag_bytes
            .chunks_exact(2 * width)
            .map(|pair| {
                Ok(TagValue::new(
                    Uid::from_bytes(&pair[..width])?,
                    Uid::from_bytes(&pair[width..])?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        if tags.windows(2).any(|w| w[0] > w[1]) {
            return Err(StatsError::InvalidFormat("Key tags are not sorted".into()));
        }

        let key = Self {
            statistic: Uid::from_bytes(statistic)?,
            mask: RollUpBitMask::from_bytes(mask)?,
            interval: Interval::from_bytes(interval)?,
            row_time: unflip(row_time),
            column_time: unflip(column_time),
            tags,
        };
        if key.interval.truncate_to_row(key.column_time) != key.row_time {
            return Err(StatsError::InvalidFormat(format!(
                "Column time {} lies outside row {}",
                key.column_time, key.row_time
            )));
        }
        Ok(key)
    }
}

impl fmt::Display for StatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.statistic,
            self.mask,
            self.interval.short_name(),
            self.row_time,
            self.column_time
        )?;
        for tag in &self.tags {
            write!(f, "/{}={}", tag.tag, tag.value)?;
        }
        Ok(())
    }
}

fn flip(time: Timestamp) -> u64 {
    (time as u64) ^ SIGN_FLIP
}

fn unflip(bytes: &[u8]) -> Timestamp {
    let mut raw = [0u8; TIME_LEN];
    raw.copy_from_slice(bytes);
    (u64::from_be_bytes(raw) ^ SIGN_FLIP) as i64
}

/// Check an event's tag names against the statistic's declared tags
///
/// Every declared tag must be present exactly once and no other tag may
/// appear.
pub fn check_tags<S: AsRef<str>>(names: &[S], config: &StatisticConfiguration) -> Result<()> {
    let tags: Vec<(&str, ())> = names.iter().map(|name| (name.as_ref(), ())).collect();
    by_position(&tags, config).map(|_| ())
}

/// Order tag values by the position of their name in the sorted tag names
fn by_position<S: AsRef<str>, T: Copy>(
    tags: &[(S, T)],
    config: &StatisticConfiguration,
) -> Result<Vec<T>> {
    let declared = config.tag_names().len();
    let mut slots: Vec<Option<T>> = vec![None; declared];
    for (name, value) in tags {
        let name = name.as_ref();
        let position = config.position_of(name).ok_or_else(|| {
            StatsError::InvalidEvent(format!(
                "Tag {} is not declared on statistic {}",
                name,
                config.name()
            ))
        })?;
        if slots[position].replace(*value).is_some() {
            return Err(StatsError::InvalidEvent(format!(
                "Tag {} given more than once",
                name
            )));
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(position, value)| {
            value.ok_or_else(|| {
                StatsError::InvalidEvent(format!(
                    "Missing tag {} for statistic {}",
                    config.tag_names()[position],
                    config.name()
                ))
            })
        })
        .collect()
}

/// Build the key for every mask the statistic materializes
///
/// `tags` pairs each tag name with its resolved uids and may be in any
/// order. Every declared tag must be present exactly once; a mask bit
/// refers to the tag's position in the statistic's sorted tag names.
pub fn build_keys<S: AsRef<str>>(
    statistic: Uid,
    timestamp: Timestamp,
    tags: &[(S, TagValue)],
    config: &StatisticConfiguration,
) -> Result<Vec<StatKey>> {
    let positioned = by_position(tags, config)?;

    required_masks(config)
        .into_iter()
        .map(|mask| {
            let tags = positioned
                .iter()
                .enumerate()
                .map(|(position, tag)| {
                    if mask.is_rolled_up(position) {
                        tag.rolled_up()
                    } else {
                        Ok(*tag)
                    }
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(StatKey::new(
                statistic,
                mask,
                config.precision(),
                timestamp,
                tags,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statistic::RollUpType;
    use crate::StatisticType;
    use std::collections::HashSet;

    fn uid(value: u64) -> Uid {
        Uid::new(value, 4).unwrap()
    }

    fn orders() -> StatisticConfiguration {
        StatisticConfiguration::new("orders", StatisticType::Count, Interval::Second)
            .with_tags(["system", "env"])
            .with_rollup(RollUpType::All)
    }

    // env=OPS, system=ABC with tag uids deliberately ordered against the names
    fn tags_abc() -> Vec<(&'static str, TagValue)> {
        vec![
            ("system", TagValue::new(uid(2), uid(11))),
            ("env", TagValue::new(uid(7), uid(10))),
        ]
    }

    #[test]
    fn test_byte_layout() {
        let ts = 1_500_000_123_456;
        let key = StatKey::new(
            uid(1),
            RollUpBitMask::from_bits(0b10).unwrap(),
            Interval::Second,
            ts,
            vec![TagValue::new(uid(9), uid(3)), TagValue::new(uid(4), uid(5))],
        );

        let bytes = key.to_bytes();
        assert_eq!(bytes.len(), key.encoded_len());
        assert_eq!(bytes.len(), 4 + 2 + 8 + 8 + 16 + 8);
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..6], &[0, 2]);
        assert_eq!(&bytes[6..14], &1_000i64.to_be_bytes());
        // Tags sorted by tag uid
        assert_eq!(&bytes[22..26], &[0, 0, 0, 4]);
        assert_eq!(&bytes[30..34], &[0, 0, 0, 9]);
        assert_eq!(&bytes[..bytes.len() - 8], &key.row_key()[..]);
        assert_eq!(&bytes[bytes.len() - 8..], &key.column_qualifier());

        assert_eq!(key.row_time(), 1_499_997_600_000);
        assert_eq!(key.column_time(), 1_500_000_123_000);
        assert_eq!(StatKey::from_bytes(&bytes, 4).unwrap(), key);
        assert!(StatKey::from_bytes(&bytes[1..], 4).is_err());
    }

    #[test]
    fn test_time_ordering_survives_sign() {
        let early = StatKey::new(uid(1), RollUpBitMask::ZERO, Interval::Second, -5_000, vec![]);
        let late = StatKey::new(uid(1), RollUpBitMask::ZERO, Interval::Second, 5_000, vec![]);
        assert!(early.to_bytes() < late.to_bytes());
        assert_eq!(early.column_time(), -5_000);
        assert_eq!(StatKey::from_bytes(&early.to_bytes(), 4).unwrap(), early);
    }

    #[test]
    fn test_build_keys_all_masks() {
        let keys = build_keys(uid(1), 60_500, &tags_abc(), &orders()).unwrap();
        assert_eq!(keys.len(), 4);

        let rolled = Uid::rolled_up(4).unwrap();
        // Bit 1 is "system", the second name in sorted order
        let system_rolled = keys
            .iter()
            .find(|k| k.mask() == RollUpBitMask::from_tag_positions(&[1]).unwrap())
            .unwrap();
        assert_eq!(
            system_rolled.tags(),
            &[
                TagValue::new(uid(2), rolled),
                TagValue::new(uid(7), uid(10)),
            ]
        );

        let zero = keys.iter().find(|k| k.mask().is_zero()).unwrap();
        assert!(zero.tags().iter().all(|t| !t.value.is_rolled_up()));
        assert!(keys.iter().all(|k| k.column_time() == 60_000));
    }

    #[test]
    fn test_build_keys_order_independent() {
        let mut reversed = tags_abc();
        reversed.reverse();

        let a: HashSet<Bytes> = build_keys(uid(1), 1_000, &tags_abc(), &orders())
            .unwrap()
            .iter()
            .map(StatKey::to_bytes)
            .collect();
        let b: HashSet<Bytes> = build_keys(uid(1), 1_999, &reversed, &orders())
            .unwrap()
            .iter()
            .map(StatKey::to_bytes)
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_build_keys_no_tags() {
        let config = StatisticConfiguration::new("cpu", StatisticType::Value, Interval::Minute)
            .with_rollup(RollUpType::All);
        let keys = build_keys::<&str>(uid(3), 0, &[], &config).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys[0].mask().is_zero());
        assert!(keys[0].tags().is_empty());
    }

    #[test]
    fn test_build_keys_rejects_bad_tags() {
        let mut extra = tags_abc();
        extra.push(("host", TagValue::new(uid(8), uid(12))));
        assert!(matches!(
            build_keys(uid(1), 0, &extra, &orders()),
            Err(StatsError::InvalidEvent(_))
        ));

        let mut missing = tags_abc();
        missing.pop();
        assert!(build_keys(uid(1), 0, &missing, &orders()).is_err());
    }

    #[test]
    fn test_check_tags() {
        let config = orders();
        assert!(check_tags(&["system", "env"], &config).is_ok());
        assert!(check_tags(&["env", "system", "host"], &config).is_err());
        assert!(check_tags(&["env", "env", "system"], &config).is_err());
        assert!(check_tags(&["env"], &config).is_err());
        assert!(check_tags::<&str>(&[], &config).is_err());
    }

    #[test]
    fn test_with_interval() {
        let key = StatKey::new(
            uid(1),
            RollUpBitMask::ZERO,
            Interval::Second,
            3_725_500,
            vec![TagValue::new(uid(2), uid(3))],
        );
        let hourly = key.with_interval(Interval::Hour);
        assert_eq!(hourly.interval(), Interval::Hour);
        assert_eq!(hourly.column_time(), 3_600_000);
        assert_eq!(hourly.row_time(), 0);
        assert_eq!(hourly.tags(), key.tags());
    }
}
