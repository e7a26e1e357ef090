use crate::{
    import_state::ProductRanges,
    ranges::{self, SplitOrder},
    types::range::RangeValue,
};

use super::{OptimizerOptions, QueryPlan, SingleProductQuery, StrategyResult};

/// One query per product and range piece.
///
/// Recent blocks come first: they unblock live data sooner and are more likely to still be
/// served by nodes with limited history. Retries only take the slots fresh ranges left free.
pub(crate) fn optimize<T: RangeValue>(
    states: &[ProductRanges<T>],
    options: &OptimizerOptions,
) -> StrategyResult<T> {
    let max_queries = options.max_queries_per_product;
    let queries: Vec<_> = states
        .iter()
        .flat_map(|state| {
            let needed = state.compute_needed(options.ignore_import_state);
            let mut pieces = ranges::sorted_split_and_take_some(
                &needed,
                options.max_range_size,
                max_queries,
                SplitOrder::Desc,
            );

            // the full range already includes retries when ignoring the import state
            if pieces.len() < max_queries && !options.ignore_import_state {
                pieces.extend(ranges::sorted_split_and_take_some(
                    &state.to_retry,
                    options.max_range_size,
                    max_queries - pieces.len(),
                    SplitOrder::Desc,
                ));
            }
            pieces.truncate(max_queries);

            pieces.into_iter().map(|range| SingleProductQuery {
                product_key: state.product_key.clone(),
                range,
            })
        })
        .collect();

    StrategyResult {
        total_coverage: queries.iter().map(|q| q.range.size()).sum(),
        query_count: queries.len(),
        plan: QueryPlan::PerProduct(queries),
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::optimizer::tests::{options, r, state};

    fn ranges_of(result: StrategyResult<u64>) -> Vec<(String, u64, u64)> {
        let QueryPlan::PerProduct(queries) = result.plan else {
            panic!("Expected a per product plan");
        };
        queries
            .into_iter()
            .map(|q| (q.product_key, q.range.from, q.range.to))
            .collect()
    }

    #[test]
    fn test_retries_fill_free_slots() {
        let states = [state(
            "a",
            r(0, 1000),
            vec![r(0, 499)],
            vec![r(100, 199), r(300, 349)],
        )];
        let result = optimize(&states, &options(1, 200, 4));
        assert_eq!(result.query_count, 4);
        assert_eq!(
            ranges_of(result),
            vec![
                ("a".to_owned(), 801, 1000),
                ("a".to_owned(), 601, 800),
                ("a".to_owned(), 500, 600),
                ("a".to_owned(), 300, 349),
            ]
        );
    }

    #[test]
    fn test_retries_never_starve_fresh_ranges() {
        let states = [state("a", r(0, 1000), vec![], vec![r(2000, 3000)])];
        let result = optimize(&states, &options(1, 100, 2));
        assert_eq!(
            ranges_of(result),
            vec![("a".to_owned(), 901, 1000), ("a".to_owned(), 801, 900)]
        );
    }

    #[test]
    fn test_ignore_import_state() {
        let states = [state("a", r(0, 100), vec![r(0, 100)], vec![r(50, 60)])];
        let mut opts = options(1, 1000, 10);
        opts.ignore_import_state = true;
        assert_eq!(ranges_of(optimize(&states, &opts)), vec![("a".to_owned(), 0, 100)]);
    }

    #[test]
    fn test_budget_per_product() {
        let states = [
            state("a", r(0, 999), vec![], vec![]),
            state("b", r(0, 999), vec![], vec![]),
        ];
        let result = optimize(&states, &options(1, 100, 3));
        assert_eq!(result.query_count, 6);
        assert_eq!(result.total_coverage, 6 * 99);
        let per_key = ranges_of(result)
            .into_iter()
            .into_group_map_by(|(key, _, _)| key.clone());
        assert_eq!(per_key["a"].len(), 3);
        assert_eq!(per_key["b"].len(), 3);
    }
}
