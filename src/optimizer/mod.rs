//! Turns per product range needs into as few remote queries as possible.
//!
//! Remote sources restrict how many blocks one query can span (`max_range_size`) and how many
//! contract addresses one query can filter on (`max_addresses_per_query`).
//! `max_queries_per_product` bounds the memory spent on a single product per cycle.
//!
//! Two strategies are computed and the one issuing fewer queries wins:
//! - one query per product and range ([`per_product`]),
//! - queries shared by several products over a common range ([`address_batch`]).

use itertools::Itertools;
use rand::Rng;
use tracing::{debug, instrument};

use crate::{
    import_state::ProductRanges,
    types::{
        product::ProductKey,
        range::{Range, RangeValue},
    },
};

pub mod address_batch;
pub mod per_product;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizerOptions {
    pub ignore_import_state: bool,
    pub max_addresses_per_query: usize,
    pub max_range_size: u64,
    pub max_queries_per_product: usize,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OptimizeError {
    #[error("Duplicate states for products: {0:?}")]
    DuplicateProducts(Vec<ProductKey>),
    #[error("Invalid full range for product {product_key}: {range}")]
    InvalidFullRange { product_key: ProductKey, range: String },
    #[error("Invalid optimizer options: {0}")]
    InvalidOptions(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleProductQuery<T> {
    pub product_key: ProductKey,
    pub range: Range<T>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostFilter<T> {
    pub product_key: ProductKey,
    pub ranges: Vec<Range<T>>,
}

/// One query serving several products. `range` is wider than each product's need,
/// `post_filters` tells which part of the result belongs to whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBatchQuery<T> {
    pub product_keys: Vec<ProductKey>,
    pub range: Range<T>,
    pub post_filters: Vec<PostFilter<T>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPlan<T> {
    PerProduct(Vec<SingleProductQuery<T>>),
    AddressBatch(Vec<AddressBatchQuery<T>>),
}

/// A query of either plan shape, ready to be dispatched on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedQuery<T> {
    Single(SingleProductQuery<T>),
    Batch(AddressBatchQuery<T>),
}

impl<T: RangeValue> QueryPlan<T> {
    pub fn len(&self) -> usize {
        match self {
            QueryPlan::PerProduct(queries) => queries.len(),
            QueryPlan::AddressBatch(queries) => queries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> &'static str {
        match self {
            QueryPlan::PerProduct(_) => "per product",
            QueryPlan::AddressBatch(_) => "address batch",
        }
    }

    pub fn into_queries(self) -> Vec<PlannedQuery<T>> {
        match self {
            QueryPlan::PerProduct(queries) => {
                queries.into_iter().map(PlannedQuery::Single).collect()
            }
            QueryPlan::AddressBatch(queries) => {
                queries.into_iter().map(PlannedQuery::Batch).collect()
            }
        }
    }
}

impl<T: RangeValue> PlannedQuery<T> {
    pub fn range(&self) -> Range<T> {
        match self {
            PlannedQuery::Single(query) => query.range,
            PlannedQuery::Batch(query) => query.range,
        }
    }

    /// The exact ranges each product expects from this query.
    pub fn targets(&self) -> Vec<(&ProductKey, &[Range<T>])> {
        match self {
            PlannedQuery::Single(query) => {
                vec![(&query.product_key, std::slice::from_ref(&query.range))]
            }
            PlannedQuery::Batch(query) => query
                .post_filters
                .iter()
                .map(|filter| (&filter.product_key, filter.ranges.as_slice()))
                .collect(),
        }
    }
}

pub(crate) struct StrategyResult<T> {
    pub plan: QueryPlan<T>,
    pub total_coverage: u64,
    pub query_count: usize,
}

pub fn optimize<T: RangeValue>(
    states: &[ProductRanges<T>],
    options: &OptimizerOptions,
) -> Result<QueryPlan<T>, OptimizeError> {
    optimize_with_rng(states, options, &mut rand::thread_rng())
}

/// Same as [`optimize`] with an explicit source for tie-breaking draws.
#[instrument(skip_all, fields(products = states.len()))]
pub fn optimize_with_rng<T: RangeValue>(
    states: &[ProductRanges<T>],
    options: &OptimizerOptions,
    rng: &mut impl Rng,
) -> Result<QueryPlan<T>, OptimizeError> {
    validate(states, options)?;

    if options.max_addresses_per_query == 1 {
        return Ok(per_product::optimize(states, options).plan);
    }

    let per_product = per_product::optimize(states, options);
    let address_batch = address_batch::optimize(states, options, rng);
    debug!(
        per_product_queries = per_product.query_count,
        per_product_coverage = per_product.total_coverage,
        address_batch_queries = address_batch.query_count,
        address_batch_coverage = address_batch.total_coverage,
        "Computed query plans"
    );

    let chosen = if per_product.query_count == address_batch.query_count {
        if per_product.total_coverage > address_batch.total_coverage {
            per_product
        } else {
            address_batch
        }
    } else if per_product.query_count < address_batch.query_count {
        per_product
    } else {
        address_batch
    };
    Ok(chosen.plan)
}

fn validate<T: RangeValue>(
    states: &[ProductRanges<T>],
    options: &OptimizerOptions,
) -> Result<(), OptimizeError> {
    if options.max_addresses_per_query == 0 {
        return Err(OptimizeError::InvalidOptions("max_addresses_per_query must be positive"));
    }
    if options.max_range_size == 0 {
        return Err(OptimizeError::InvalidOptions("max_range_size must be positive"));
    }
    if options.max_queries_per_product == 0 {
        return Err(OptimizeError::InvalidOptions("max_queries_per_product must be positive"));
    }

    let duplicates = states
        .iter()
        .map(|s| &s.product_key)
        .duplicates()
        .cloned()
        .collect_vec();
    if !duplicates.is_empty() {
        return Err(OptimizeError::DuplicateProducts(duplicates));
    }

    if let Some(invalid) = states.iter().find(|s| !s.full_range.is_valid()) {
        return Err(OptimizeError::InvalidFullRange {
            product_key: invalid.product_key.clone(),
            range: format!("{} > {}", invalid.full_range.from, invalid.full_range.to),
        });
    }
    Ok(())
}
