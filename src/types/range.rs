use std::fmt::{Debug, Display};

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub type BlockNumber = u64;

/// A scalar axis ranges can be built on: block numbers or time instants.
///
/// Positions are discrete. `step` moves by a number of positions and saturates at the bounds
/// of the domain, `distance` counts the positions between two values.
pub trait RangeValue:
    Copy + Ord + Debug + Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn distance(from: Self, to: Self) -> u64;
    fn step_up(self, steps: u64) -> Self;
    fn step_down(self, steps: u64) -> Self;

    fn next(self) -> Self {
        self.step_up(1)
    }

    fn prev(self) -> Self {
        self.step_down(1)
    }
}

impl RangeValue for u64 {
    fn distance(from: Self, to: Self) -> u64 {
        to.saturating_sub(from)
    }

    fn step_up(self, steps: u64) -> Self {
        self.saturating_add(steps)
    }

    fn step_down(self, steps: u64) -> Self {
        self.saturating_sub(steps)
    }
}

// Millisecond resolution
impl RangeValue for DateTime<Utc> {
    fn distance(from: Self, to: Self) -> u64 {
        (to - from).num_milliseconds().max(0) as u64
    }

    fn step_up(self, steps: u64) -> Self {
        let steps = i64::try_from(steps).unwrap_or(i64::MAX);
        self.checked_add_signed(Duration::milliseconds(steps))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn step_down(self, steps: u64) -> Self {
        let steps = i64::try_from(steps).unwrap_or(i64::MAX);
        self.checked_sub_signed(Duration::milliseconds(steps))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid range: {from} > {to}")]
pub struct InvalidRange {
    pub from: String,
    pub to: String,
}

/// Closed interval `[from, to]`. A point range (`from == to`) is valid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(bound = "T: RangeValue")]
pub struct Range<T> {
    pub from: T,
    pub to: T,
}

impl<T: RangeValue> Range<T> {
    pub fn new(from: T, to: T) -> Result<Self, InvalidRange> {
        if from > to {
            return Err(InvalidRange {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self { from, to })
    }

    pub fn point(at: T) -> Self {
        Self { from: at, to: at }
    }

    pub fn is_valid(&self) -> bool {
        self.from <= self.to
    }

    /// `to - from`, the weight used to compare coverage.
    pub fn size(&self) -> u64 {
        T::distance(self.from, self.to)
    }

    pub fn contains(&self, value: T) -> bool {
        self.from <= value && value <= self.to
    }

    /// Restricts this range to `bounds`, `None` when they don't intersect.
    pub fn clamp(&self, bounds: &Range<T>) -> Option<Self> {
        let from = self.from.max(bounds.from);
        let to = self.to.min(bounds.to);
        (from <= to).then_some(Self { from, to })
    }
}

impl<T: RangeValue> Display for Range<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

impl<T: Debug> Debug for Range<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}, {:?}]", self.from, self.to)
    }
}

impl std::str::FromStr for Range<BlockNumber> {
    type Err = anyhow::Error;

    // Accepts "FROM-TO" or "FROM..TO"
    fn from_str(s: &str) -> anyhow::Result<Self> {
        lazy_static::lazy_static! {
            static ref RE: regex::Regex = regex::Regex::new(r"^\s*(\d+)\s*(?:-|\.\.)\s*(\d+)\s*$").unwrap();
        }
        let cap = RE
            .captures(s)
            .ok_or_else(|| anyhow::anyhow!("Could not parse block range '{s}'"))?;
        let from = cap[1].parse()?;
        let to = cap[2].parse()?;
        Ok(Range::new(from, to)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{Range, RangeValue};

    #[test]
    fn test_range_validation() {
        assert!(Range::new(10u64, 5).is_err());
        assert_eq!(Range::new(5u64, 5).unwrap(), Range::point(5));
        assert_eq!(Range::new(0u64, 100).unwrap().size(), 100);
        assert_eq!(Range::point(7u64).size(), 0);
    }

    #[test]
    fn test_range_clamp() {
        let r = Range::new(100u64, 200).unwrap();
        assert_eq!(
            r.clamp(&Range::new(150, 300).unwrap()),
            Some(Range::new(150, 200).unwrap())
        );
        assert_eq!(r.clamp(&Range::new(201, 300).unwrap()), None);
        assert_eq!(r.clamp(&Range::point(200)), Some(Range::point(200)));
    }

    #[test]
    fn test_parse_block_range() {
        assert_eq!(
            "100-200".parse::<Range<u64>>().unwrap(),
            Range::new(100, 200).unwrap()
        );
        assert_eq!(
            "100..200".parse::<Range<u64>>().unwrap(),
            Range::new(100, 200).unwrap()
        );
        "200-100".parse::<Range<u64>>().unwrap_err();
        "0xdead-200".parse::<Range<u64>>().unwrap_err();
    }

    #[test]
    fn test_time_values() {
        let t = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let later = t.step_up(3_600_000);
        assert_eq!(later, Utc.with_ymd_and_hms(2023, 1, 1, 1, 0, 0).unwrap());
        assert_eq!(Range::new(t, later).unwrap().size(), 3_600_000);
        assert_eq!(later.prev().next(), later);
    }

    #[test]
    fn test_debug_format() {
        let r = Range::new(1u64, 2).unwrap();
        assert_eq!(format!("{r:?}"), "[1, 2]");
        assert_eq!(format!("{:?}", vec![r, Range::point(5)]), "[[1, 2], [5, 5]]");
    }

    #[test]
    fn test_serde() {
        let r = Range::new(1u64, 2).unwrap();
        assert_eq!(serde_json::to_string(&r).unwrap(), r#"{"from":1,"to":2}"#);
        let back: Range<u64> = serde_json::from_str(r#"{"from":1,"to":2}"#).unwrap();
        assert_eq!(back, r);
    }
}
