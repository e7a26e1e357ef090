use tracing::{error, info};

use crate::{
    import_state::{storage::BlockImportState, ProductRanges},
    ranges,
    types::{
        product::Product,
        range::{BlockNumber, Range},
    },
};

use super::{Behaviour, ImportMode};

/// Everything shared by the products of one cycle when deriving their ranges.
#[derive(Debug, Clone)]
pub struct RangeContext<'a> {
    pub behaviour: &'a Behaviour,
    pub latest: BlockNumber,
    /// Highest block this runner has imported so far
    pub last_imported: Option<BlockNumber>,
    pub max_block_span: u64,
    pub blocks_per_hour: u64,
}

impl RangeContext<'_> {
    /// Highest block considered settled.
    fn head(&self) -> Option<BlockNumber> {
        self.latest
            .checked_sub(self.behaviour.wait_for_block_propagation)
    }

    fn window_len(&self) -> u64 {
        self.max_block_span.min(self.blocks_per_hour)
    }

    /// Up to one hour of blocks right below the head, starting after the last imported block.
    /// `None` when nothing new was produced.
    pub fn recent_range(&self) -> Option<Range<BlockNumber>> {
        let head = self.head()?;
        let since_last_import = match self.last_imported {
            Some(last) if last >= head => return None,
            Some(last) => head - (last + 1),
            None => u64::MAX,
        };
        let len = self.window_len().min(since_last_import);
        Some(Range {
            from: head.saturating_sub(len),
            to: head,
        })
    }

    /// From the contract creation up to the head, leaving the recent window out if asked to.
    fn historical_range(&self, product: &Product, state: &BlockImportState) -> Option<Range<BlockNumber>> {
        let mut to = self.head()?;
        if self.behaviour.skip_recent_window.applies_to(product.eol) {
            to = to.checked_sub(self.window_len() + 1)?;
        }
        Range::new(state.origin, to).ok()
    }

    /// The ranges the optimizer should consider for `product`, `None` when it has to sit
    /// this cycle out.
    pub fn product_ranges(
        &self,
        product: &Product,
        state: Option<&BlockImportState>,
    ) -> Option<ProductRanges<BlockNumber>> {
        let behaviour = self.behaviour;
        let historical_state = match behaviour.mode {
            ImportMode::Historical => state,
            ImportMode::Recent => None,
        };
        let full_range = match historical_state {
            Some(state) => self.historical_range(product, state),
            None => self.recent_range(),
        };

        let covered_ranges = match historical_state {
            Some(state) if !behaviour.ignore_import_state => state.ranges.covered_ranges.clone(),
            _ => Vec::new(),
        };
        let mut to_retry = match historical_state {
            Some(state) if !behaviour.ignore_import_state => state.ranges.to_retry.clone(),
            _ => Vec::new(),
        };

        let full_range = match behaviour.force_block_range {
            Some(restrict) => {
                to_retry = ranges::merge(to_retry.iter().filter_map(|r| r.clamp(&restrict)));
                full_range.and_then(|range| range.clamp(&restrict))
            }
            None => full_range,
        };

        let Some(full_range) = full_range else {
            if behaviour.force_block_range.is_some() {
                info!(
                    product_key = %product.product_key,
                    "Forced block range doesn't intersect this product's range, skipping"
                );
            } else if behaviour.mode == ImportMode::Historical {
                error!(
                    product_key = %product.product_key,
                    latest = self.latest,
                    "Full range is invalid, skipping"
                );
            }
            return None;
        };

        Some(ProductRanges {
            product_key: product.product_key.clone(),
            full_range,
            covered_ranges,
            to_retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        import_state::{ImportState, RangeOutcome},
        pipeline::SkipRecentWindow,
        types::product::tests::std_vault,
    };

    fn r(from: u64, to: u64) -> Range<u64> {
        Range::new(from, to).unwrap()
    }

    fn context(behaviour: &Behaviour, latest: u64, last_imported: Option<u64>) -> RangeContext<'_> {
        RangeContext {
            behaviour,
            latest,
            last_imported,
            max_block_span: 3000,
            blocks_per_hour: 1000,
        }
    }

    fn import_state(origin: u64) -> BlockImportState {
        let product = std_vault(1);
        ImportState::new(
            product.investment_import_key(),
            product.product_id,
            product.chain,
            origin,
            None,
        )
    }

    #[test]
    fn test_recent_range() {
        let behaviour = Behaviour::new(ImportMode::Recent);
        assert_eq!(context(&behaviour, 10_000, None).recent_range(), Some(r(9000, 10_000)));
        assert_eq!(
            context(&behaviour, 10_000, Some(9950)).recent_range(),
            Some(r(9951, 10_000))
        );
        assert_eq!(
            context(&behaviour, 10_000, Some(9999)).recent_range(),
            Some(r(10_000, 10_000))
        );
        assert_eq!(context(&behaviour, 10_000, Some(10_000)).recent_range(), None);
        assert_eq!(context(&behaviour, 500, None).recent_range(), Some(r(0, 500)));

        let behaviour = Behaviour {
            wait_for_block_propagation: 5,
            ..Behaviour::new(ImportMode::Recent)
        };
        assert_eq!(context(&behaviour, 10_000, None).recent_range(), Some(r(8995, 9995)));
        assert_eq!(context(&behaviour, 3, None).recent_range(), None);
    }

    #[test]
    fn test_recent_mode_ignores_import_state() {
        let behaviour = Behaviour::new(ImportMode::Recent);
        let mut state = import_state(100);
        state.apply_results(&[
            RangeOutcome::failure(r(200, 300)),
            RangeOutcome::success(r(9500, 10_000)),
        ]);
        let ranges = context(&behaviour, 10_000, None)
            .product_ranges(&std_vault(1), Some(&state))
            .unwrap();
        assert_eq!(ranges.full_range, r(9000, 10_000));
        assert_eq!(ranges.covered_ranges, vec![]);
        assert_eq!(ranges.to_retry, vec![]);
        assert_eq!(ranges.compute_needed(false), vec![r(9000, 10_000)]);
    }

    #[test]
    fn test_historical_range() {
        let behaviour = Behaviour::new(ImportMode::Historical);
        let mut state = import_state(100);
        state.apply_results(&[
            RangeOutcome::success(r(100, 500)),
            RangeOutcome::failure(r(600, 700)),
        ]);
        let ranges = context(&behaviour, 10_000, Some(9000))
            .product_ranges(&std_vault(1), Some(&state))
            .unwrap();
        assert_eq!(ranges.product_key, std_vault(1).product_key);
        assert_eq!(ranges.full_range, r(100, 10_000));
        assert_eq!(ranges.covered_ranges, vec![r(100, 500)]);
        assert_eq!(ranges.to_retry, vec![r(600, 700)]);

        let behaviour = Behaviour {
            ignore_import_state: true,
            ..Behaviour::new(ImportMode::Historical)
        };
        let ranges = context(&behaviour, 10_000, None)
            .product_ranges(&std_vault(1), Some(&state))
            .unwrap();
        assert_eq!(ranges.full_range, r(100, 10_000));
        assert_eq!(ranges.covered_ranges, vec![]);
        assert_eq!(ranges.to_retry, vec![]);
    }

    #[test]
    fn test_skip_recent_window() {
        let state = import_state(100);
        let live = std_vault(1);
        let eol = Product {
            eol: true,
            ..std_vault(2)
        };
        let full_range = |skip: SkipRecentWindow, product: &Product| {
            let behaviour = Behaviour {
                skip_recent_window: skip,
                ..Behaviour::new(ImportMode::Historical)
            };
            context(&behaviour, 10_000, None)
                .product_ranges(product, Some(&state))
                .map(|ranges| ranges.full_range)
        };

        assert_eq!(full_range(SkipRecentWindow::All, &live), Some(r(100, 8999)));
        assert_eq!(full_range(SkipRecentWindow::All, &eol), Some(r(100, 8999)));
        assert_eq!(full_range(SkipRecentWindow::None, &live), Some(r(100, 10_000)));
        assert_eq!(full_range(SkipRecentWindow::Live, &live), Some(r(100, 8999)));
        assert_eq!(full_range(SkipRecentWindow::Live, &eol), Some(r(100, 10_000)));
        assert_eq!(full_range(SkipRecentWindow::Eol, &eol), Some(r(100, 8999)));
    }

    #[test]
    fn test_force_block_range() {
        let mut state = import_state(100);
        state.apply_results(&[
            RangeOutcome::failure(r(550, 700)),
            RangeOutcome::failure(r(900, 950)),
        ]);
        let behaviour = Behaviour {
            force_block_range: Some(r(500, 600)),
            ..Behaviour::new(ImportMode::Historical)
        };
        let ranges = context(&behaviour, 10_000, None)
            .product_ranges(&std_vault(1), Some(&state))
            .unwrap();
        assert_eq!(ranges.full_range, r(500, 600));
        assert_eq!(ranges.to_retry, vec![r(550, 600)]);

        // the product didn't exist yet in the forced range
        let behaviour = Behaviour {
            force_block_range: Some(r(0, 50)),
            ..Behaviour::new(ImportMode::Historical)
        };
        assert_eq!(
            context(&behaviour, 10_000, None).product_ranges(&std_vault(1), Some(&state)),
            None
        );
    }

    #[test]
    fn test_product_created_after_head() {
        let behaviour = Behaviour {
            wait_for_block_propagation: 10,
            ..Behaviour::new(ImportMode::Historical)
        };
        let state = import_state(9995);
        assert_eq!(
            context(&behaviour, 10_000, None).product_ranges(&std_vault(1), Some(&state)),
            None
        );
    }
}
