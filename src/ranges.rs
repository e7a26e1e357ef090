//! Set operations over closed ranges.
//!
//! Inputs may come unsorted unless stated otherwise. Everything that normalizes returns
//! ranges sorted by `from` and pairwise disjoint.

use itertools::Itertools;

use crate::types::range::{Range, RangeValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOrder {
    Asc,
    Desc,
}

pub fn size<T: RangeValue>(range: &Range<T>) -> u64 {
    range.size()
}

pub fn total_size<'a, T: RangeValue>(ranges: impl IntoIterator<Item = &'a Range<T>>) -> u64 {
    ranges.into_iter().map(|r| r.size()).sum()
}

/// Fuses touching and overlapping ranges.
pub fn merge<T: RangeValue>(ranges: impl IntoIterator<Item = Range<T>>) -> Vec<Range<T>> {
    merge_closer_than(ranges, 1)
}

/// Fuses ranges separated by less than `gap` positions. `gap = 1` fuses only adjacent
/// or overlapping ranges.
pub fn merge_closer_than<T: RangeValue>(
    ranges: impl IntoIterator<Item = Range<T>>,
    gap: u64,
) -> Vec<Range<T>> {
    let mut sorted = ranges.into_iter().collect_vec();
    debug_assert!(sorted.iter().all(Range::is_valid));
    sorted.sort_unstable_by_key(|r| (r.from, r.to));

    let mut result: Vec<Range<T>> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match result.last_mut() {
            Some(last) if last.to.step_up(gap) >= range.from => {
                last.to = last.to.max(range.to);
            }
            _ => result.push(range),
        }
    }
    result
}

/// Pairwise intersection of two sets of ranges.
pub fn intersect<T: RangeValue>(a: &[Range<T>], b: &[Range<T>]) -> Vec<Range<T>> {
    let a = merge(a.iter().copied());
    let b = merge(b.iter().copied());
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if let Some(common) = a[i].clamp(&b[j]) {
            result.push(common);
        }
        if a[i].to < b[j].to {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}

/// The parts of `base` not covered by any range of `subtract`.
pub fn exclude<T: RangeValue>(base: &[Range<T>], subtract: &[Range<T>]) -> Vec<Range<T>> {
    let subtract = merge(subtract.iter().copied());
    let mut result = Vec::new();
    for range in merge(base.iter().copied()) {
        // `None` once the remainder of this range has been fully consumed
        let mut rest = Some(range);
        let first = subtract.partition_point(|s| s.to < range.from);
        for hole in &subtract[first..] {
            let Some(current) = rest else { break };
            if hole.from > current.to {
                break;
            }
            if hole.from > current.from {
                result.push(Range {
                    from: current.from,
                    to: hole.from.prev(),
                });
            }
            rest = (hole.to < current.to).then(|| Range {
                from: hole.to.next(),
                to: current.to,
            });
        }
        result.extend(rest);
    }
    result
}

/// Smallest single range spanning all inputs.
pub fn cover<T: RangeValue>(ranges: &[Range<T>]) -> Option<Range<T>> {
    let from = ranges.iter().map(|r| r.from).min()?;
    let to = ranges.iter().map(|r| r.to).max()?;
    Some(Range { from, to })
}

/// Chops `range` into consecutive pieces spanning at most `max_len` positions each,
/// starting from `range.from`.
pub fn split_to_max_length<T: RangeValue>(range: &Range<T>, max_len: u64) -> Vec<Range<T>> {
    split_from_start(*range, max_len).collect()
}

pub fn split_many_to_max_length<T: RangeValue>(
    ranges: &[Range<T>],
    max_len: u64,
) -> Vec<Range<T>> {
    ranges
        .iter()
        .flat_map(|r| split_from_start(*r, max_len))
        .collect()
}

/// Splits the merged `ranges` into pieces of at most `max_len` positions and materializes
/// only the first `take` of them in the requested order.
///
/// `Desc` walks from the most recent position downwards, so the most recent piece is always
/// full sized and older leftovers end up smaller.
pub fn sorted_split_and_take_some<T: RangeValue>(
    ranges: &[Range<T>],
    max_len: u64,
    take: usize,
    order: SplitOrder,
) -> Vec<Range<T>> {
    let merged = merge(ranges.iter().copied());
    match order {
        SplitOrder::Asc => merged
            .into_iter()
            .flat_map(|r| split_from_start(r, max_len))
            .take(take)
            .collect(),
        SplitOrder::Desc => merged
            .into_iter()
            .rev()
            .flat_map(|r| split_from_end(r, max_len))
            .take(take)
            .collect(),
    }
}

fn split_from_start<T: RangeValue>(range: Range<T>, max_len: u64) -> impl Iterator<Item = Range<T>> {
    let span = max_len.max(1) - 1;
    let mut next = Some(range.from);
    std::iter::from_fn(move || {
        let from = next?;
        let to = from.step_up(span).min(range.to);
        next = (to < range.to).then(|| to.next());
        Some(Range { from, to })
    })
}

fn split_from_end<T: RangeValue>(range: Range<T>, max_len: u64) -> impl Iterator<Item = Range<T>> {
    let span = max_len.max(1) - 1;
    let mut next = Some(range.to);
    std::iter::from_fn(move || {
        let to = next?;
        let from = to.step_down(span).max(range.from);
        next = (from > range.from).then(|| from.prev());
        Some(Range { from, to })
    })
}
