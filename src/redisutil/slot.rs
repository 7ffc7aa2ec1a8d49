//! Hash slot helpers.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::RedisError;

/// One unit of the key-space partition.
pub type Slot = u16;

/// Number of hash slots in a Redis cluster.
pub const HASH_SLOTS: u16 = 16384;

/// Inclusive range of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotRange {
    pub start: Slot,
    pub end: Slot,
}

impl SlotRange {
    pub fn new(start: Slot, end: Slot) -> Self {
        Self { start, end }
    }

    /// Number of slots covered; a range always covers at least one.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn iter(&self) -> impl Iterator<Item = Slot> {
        self.start..=self.end
    }
}

impl fmt::Display for SlotRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Collapse a slot set into contiguous ranges.
pub fn ranges_from_slots(slots: &BTreeSet<Slot>) -> Vec<SlotRange> {
    let mut ranges: Vec<SlotRange> = Vec::new();
    for &slot in slots {
        match ranges.last_mut() {
            Some(last) if last.end + 1 == slot => last.end = slot,
            _ => ranges.push(SlotRange::new(slot, slot)),
        }
    }
    ranges
}

/// Render a slot set the way `CLUSTER NODES` does, e.g. `0-5460 5462`.
pub fn format_slots(slots: &BTreeSet<Slot>) -> String {
    ranges_from_slots(slots)
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse one slot field of a `CLUSTER NODES` line.
///
/// Returns `None` for the bracketed importing/migrating markers, which describe
/// an in-flight migration rather than ownership.
pub fn parse_slot_field(field: &str) -> Result<Option<SlotRange>, RedisError> {
    if field.starts_with('[') {
        return Ok(None);
    }
    let parse = |s: &str| -> Result<Slot, RedisError> {
        let slot: Slot = s
            .parse()
            .map_err(|_| RedisError::Protocol(format!("invalid slot '{}'", s)))?;
        if slot >= HASH_SLOTS {
            return Err(RedisError::Protocol(format!("slot {} out of range", slot)));
        }
        Ok(slot)
    };
    let range = match field.split_once('-') {
        Some((start, end)) => SlotRange::new(parse(start)?, parse(end)?),
        None => {
            let slot = parse(field)?;
            SlotRange::new(slot, slot)
        }
    };
    if range.start > range.end {
        return Err(RedisError::Protocol(format!("invalid slot range '{}'", field)));
    }
    Ok(Some(range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_from_slots() {
        let slots: BTreeSet<Slot> = [0, 1, 2, 5, 7, 8].into_iter().collect();
        let ranges = ranges_from_slots(&slots);
        assert_eq!(
            ranges,
            vec![SlotRange::new(0, 2), SlotRange::new(5, 5), SlotRange::new(7, 8)]
        );
        assert_eq!(format_slots(&slots), "0-2 5 7-8");
        assert!(ranges_from_slots(&BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_parse_slot_field() {
        assert_eq!(parse_slot_field("0-5460").unwrap(), Some(SlotRange::new(0, 5460)));
        assert_eq!(parse_slot_field("16383").unwrap(), Some(SlotRange::new(16383, 16383)));
        assert_eq!(parse_slot_field("[93->-e7d1eec]").unwrap(), None);
        assert!(parse_slot_field("16384").is_err());
        assert!(parse_slot_field("10-2").is_err());
        assert!(parse_slot_field("abc").is_err());
    }

    #[test]
    fn test_range_len() {
        assert_eq!(SlotRange::new(0, HASH_SLOTS - 1).len(), HASH_SLOTS as usize);
        assert_eq!(SlotRange::new(7, 7).iter().collect::<Vec<_>>(), vec![7]);
    }
}
