//! Per product import progress.
//!
//! `covered_ranges` only grows. `to_retry` holds ranges whose import failed, it never
//! intersects `covered_ranges` and shrinks as retries succeed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ranges,
    types::{
        chain::Chain,
        product::ProductKey,
        range::{Range, RangeValue},
    },
    util::timestamp_now_ms,
};

pub mod storage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "T: RangeValue")]
pub struct ImportState<T> {
    pub import_key: String,
    pub product_id: i64,
    pub chain: Chain,
    /// First position where data can exist, usually the contract creation block
    pub origin: T,
    pub origin_datetime: Option<DateTime<Utc>>,
    pub ranges: ImportRanges<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound = "T: RangeValue")]
pub struct ImportRanges<T> {
    pub last_import_ms: u64,
    pub covered_ranges: Vec<Range<T>>,
    pub to_retry: Vec<Range<T>>,
}

impl<T> Default for ImportRanges<T> {
    fn default() -> Self {
        Self {
            last_import_ms: 0,
            covered_ranges: Vec::new(),
            to_retry: Vec::new(),
        }
    }
}

/// Outcome of importing one range for one product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeOutcome<T> {
    pub range: Range<T>,
    pub success: bool,
}

impl<T: RangeValue> RangeOutcome<T> {
    pub fn success(range: Range<T>) -> Self {
        Self {
            range,
            success: true,
        }
    }

    pub fn failure(range: Range<T>) -> Self {
        Self {
            range,
            success: false,
        }
    }
}

impl<T: RangeValue> ImportState<T> {
    pub fn new(
        import_key: String,
        product_id: i64,
        chain: Chain,
        origin: T,
        origin_datetime: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            import_key,
            product_id,
            chain,
            origin,
            origin_datetime,
            ranges: Default::default(),
        }
    }

    pub fn apply_result(&mut self, outcome: &RangeOutcome<T>) {
        self.ranges.apply_result(outcome);
    }

    pub fn apply_results<'a>(&mut self, outcomes: impl IntoIterator<Item = &'a RangeOutcome<T>>) {
        self.ranges.apply_results(outcomes);
    }
}

impl<T: RangeValue> ImportRanges<T> {
    /// Folds one outcome in. Applying the same outcome twice changes nothing.
    pub fn apply_result(&mut self, outcome: &RangeOutcome<T>) {
        let range = outcome.range;
        if outcome.success {
            let mut covered = std::mem::take(&mut self.covered_ranges);
            covered.push(range);
            self.covered_ranges = ranges::merge(covered);
            self.to_retry = ranges::exclude(&self.to_retry, &[range]);
        } else {
            let mut to_retry = std::mem::take(&mut self.to_retry);
            to_retry.push(range);
            self.to_retry = ranges::exclude(&ranges::merge(to_retry), &self.covered_ranges);
        }
        self.last_import_ms = timestamp_now_ms();
    }

    pub fn apply_results<'a>(&mut self, outcomes: impl IntoIterator<Item = &'a RangeOutcome<T>>) {
        for outcome in outcomes {
            self.apply_result(outcome);
        }
    }
}

/// What the optimizer needs to know about one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRanges<T> {
    pub product_key: ProductKey,
    pub full_range: Range<T>,
    pub covered_ranges: Vec<Range<T>>,
    pub to_retry: Vec<Range<T>>,
}

impl<T: RangeValue> ProductRanges<T> {
    /// Fresh ranges still to fetch. Retries are scheduled separately and are excluded here.
    pub fn compute_needed(&self, ignore_import_state: bool) -> Vec<Range<T>> {
        if ignore_import_state {
            return vec![self.full_range];
        }
        let mut known = self.covered_ranges.clone();
        known.extend_from_slice(&self.to_retry);
        ranges::exclude(&[self.full_range], &known)
    }
}
