//! Queries shared by several products.
//!
//! Needs are laid on a grid: rows are products, columns are slices of the range index.
//! Each slice is filled with queries spanning the whole slice and holding up to
//! `max_addresses_per_query` products, the products needing the most positions first.
//!
//! With `max_addresses_per_query = 2` and slices of 100 blocks:
//!
//! ```text
//!     | [100,199] [200,299] [300,399] |
//! 0x1 | [1  x  1] [2  x  2]           |
//! 0x2 |           [2  x  2] [4  x  4] |
//! 0x3 |           [3  x  3] [4  x  4] |
//! ```
//!
//! Needs separated by a gap of at least `max_range_size` form distinct blobs and are sliced
//! independently, so a recent blob and an old retry never end up in the same query.

use std::cmp::Reverse;

use rand::Rng;

use crate::{
    import_state::ProductRanges,
    ranges,
    types::{product::ProductKey, range::Range, range::RangeValue},
};

use super::{AddressBatchQuery, OptimizerOptions, PostFilter, QueryPlan, StrategyResult};

struct SliceNeed<'a, T> {
    product_key: &'a ProductKey,
    ranges: Vec<Range<T>>,
    coverage: u64,
    tie_break: u64,
}

pub(crate) fn optimize<T: RangeValue>(
    states: &[ProductRanges<T>],
    options: &OptimizerOptions,
    rng: &mut impl Rng,
) -> StrategyResult<T> {
    let needs: Vec<(&ProductKey, Vec<Range<T>>)> = states
        .iter()
        .map(|state| {
            let mut needed = state.compute_needed(options.ignore_import_state);
            if !options.ignore_import_state {
                needed.extend_from_slice(&state.to_retry);
            }
            (&state.product_key, ranges::merge(needed))
        })
        .collect();

    let index = build_range_index(
        needs.iter().map(|(_, ranges)| ranges.as_slice()),
        options.max_range_size,
        options.max_range_size,
    );

    let mut queries = Vec::new();
    let mut total_coverage = 0;
    for slice in index {
        let mut slice_needs: Vec<SliceNeed<'_, T>> = needs
            .iter()
            .filter_map(|(product_key, needed)| {
                let ranges = ranges::intersect(needed, std::slice::from_ref(&slice));
                (!ranges.is_empty()).then(|| SliceNeed {
                    product_key: *product_key,
                    coverage: ranges::total_size(&ranges),
                    ranges,
                    tie_break: rng.gen(),
                })
            })
            .collect();
        slice_needs.sort_by_key(|need| Reverse((need.coverage, need.tie_break)));

        for chunk in slice_needs.chunks(options.max_addresses_per_query) {
            let all_ranges: Vec<_> = chunk.iter().flat_map(|need| need.ranges.iter().copied()).collect();
            let Some(range) = ranges::cover(&all_ranges) else {
                continue;
            };
            total_coverage += chunk.iter().map(|need| need.coverage).sum::<u64>();
            queries.push(AddressBatchQuery {
                product_keys: chunk.iter().map(|need| need.product_key.clone()).collect(),
                range,
                post_filters: chunk
                    .iter()
                    .map(|need| PostFilter {
                        product_key: need.product_key.clone(),
                        ranges: need.ranges.clone(),
                    })
                    .collect(),
            });
        }
    }

    StrategyResult {
        total_coverage,
        query_count: queries.len(),
        plan: QueryPlan::AddressBatch(queries),
    }
}

/// Merges all needs into blobs, fusing blobs separated by less than `merge_if_closer_than`
/// positions, then slices every blob into pieces of at most `slice_size` positions.
pub fn build_range_index<'a, T: RangeValue>(
    needs: impl IntoIterator<Item = &'a [Range<T>]>,
    merge_if_closer_than: u64,
    slice_size: u64,
) -> Vec<Range<T>> {
    let blobs = ranges::merge_closer_than(
        needs.into_iter().flat_map(|ranges| ranges.iter().copied()),
        merge_if_closer_than.max(1),
    );
    ranges::split_many_to_max_length(&blobs, slice_size)
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::optimizer::tests::{options, r, state};

    fn queries_of(result: StrategyResult<u64>) -> Vec<AddressBatchQuery<u64>> {
        let QueryPlan::AddressBatch(queries) = result.plan else {
            panic!("Expected an address batch plan");
        };
        queries
    }

    #[test]
    fn test_build_range_index() {
        let needs = [
            vec![r(100, 299)],
            vec![r(200, 399)],
            vec![r(250, 349)],
            vec![r(150, 199), r(550, 599)],
        ];
        assert_eq!(
            build_range_index(needs.iter().map(Vec::as_slice), 100, 100),
            vec![r(100, 199), r(200, 299), r(300, 399), r(550, 599)]
        );

        // close blobs end up in the same slices
        assert_eq!(
            build_range_index(needs.iter().map(Vec::as_slice), 200, 1000),
            vec![r(100, 599)]
        );
        assert_eq!(build_range_index::<u64>([], 100, 100), vec![]);
    }

    #[test]
    fn test_grid() {
        let states = [
            state("0x1", r(100, 299), vec![], vec![]),
            state("0x2", r(200, 399), vec![], vec![]),
            state("0x3", r(250, 349), vec![], vec![]),
        ];
        let result = optimize(&states, &options(2, 100, 10), &mut StdRng::seed_from_u64(3));
        assert_eq!(result.query_count, 4);
        assert_eq!(result.total_coverage, 99 + 99 + 99 + 49 + 99 + 49);

        let queries = queries_of(result);
        assert_eq!(
            queries.iter().map(|q| q.range).collect_vec(),
            vec![r(100, 199), r(200, 299), r(250, 299), r(300, 399)]
        );
        assert_eq!(queries[0].product_keys, vec!["0x1"]);
        assert_eq!(
            queries[1].product_keys.iter().sorted().collect_vec(),
            vec!["0x1", "0x2"]
        );
        assert_eq!(queries[2].product_keys, vec!["0x3"]);
        assert_eq!(queries[3].product_keys, vec!["0x2", "0x3"]);
        assert_eq!(
            queries[3].post_filters,
            vec![
                PostFilter {
                    product_key: "0x2".to_owned(),
                    ranges: vec![r(300, 399)],
                },
                PostFilter {
                    product_key: "0x3".to_owned(),
                    ranges: vec![r(300, 349)],
                },
            ]
        );
    }

    #[test]
    fn test_post_filters_keep_holes() {
        let states = [
            state("a", r(0, 99), vec![r(20, 29)], vec![]),
            state("b", r(0, 99), vec![], vec![]),
        ];
        let queries = queries_of(optimize(&states, &options(2, 100, 10), &mut StdRng::seed_from_u64(0)));
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].range, r(0, 99));
        let filter = queries[0]
            .post_filters
            .iter()
            .find(|f| f.product_key == "a")
            .unwrap();
        assert_eq!(filter.ranges, vec![r(0, 19), r(30, 99)]);
    }

    #[test]
    fn test_retries_are_batched() {
        let states = [
            state("a", r(0, 99), vec![r(0, 49)], vec![r(50, 99)]),
            state("b", r(0, 99), vec![r(0, 99)], vec![]),
        ];
        let queries = queries_of(optimize(&states, &options(2, 100, 10), &mut StdRng::seed_from_u64(0)));
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].product_keys, vec!["a"]);
        assert_eq!(queries[0].range, r(50, 99));
    }

    #[test]
    fn test_ranking_is_deterministic_for_a_seed() {
        let states = (0..10)
            .map(|i| state(&format!("p{i}"), r(0, 99), vec![], vec![]))
            .collect_vec();
        let run = |seed| {
            queries_of(optimize(&states, &options(3, 100, 10), &mut StdRng::seed_from_u64(seed)))
        };
        assert_eq!(run(5), run(5));
        let queries = run(5);
        assert_eq!(queries.len(), 4);
        assert_eq!(
            queries.iter().map(|q| q.product_keys.len()).collect_vec(),
            vec![3, 3, 3, 1]
        );
        assert_eq!(
            queries.iter().flat_map(|q| q.product_keys.iter()).sorted().dedup().count(),
            10
        );
    }
}
