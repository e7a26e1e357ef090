use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use atomic_enum::atomic_enum;
use futures::{stream, Stream, StreamExt};
use itertools::Itertools;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    import_state::{
        storage::{BlockImportState, ImportStateStore},
        ImportState, ProductRanges, RangeOutcome,
    },
    metrics,
    optimizer::{self, OptimizeError, OptimizerOptions, PlannedQuery},
    ranges,
    storage::RecordSink,
    types::{
        chain::Chain,
        product::{Product, ProductKey},
        range::{BlockNumber, Range},
        transfer::Transfer,
    },
};

use super::{
    collector::buffer_time, full_range::RangeContext, loader::Loader, ErrorContext, ErrorSink,
    ImportError, ImportMode, ImportRangeResult, RunnerConfig, Sources,
};

#[atomic_enum]
#[derive(PartialEq, Eq)]
pub enum CycleStage {
    Idle,
    Collect,
    DetermineFrontier,
    BuildRanges,
    Optimize,
    Dispatch,
    Load,
    Reconcile,
    Done,
}

/// Transfers fetched for one target range of one product.
struct FetchedRange {
    product_key: ProductKey,
    range: Range<BlockNumber>,
    /// `None` when the query failed
    transfers: Option<Vec<Transfer>>,
}

pub struct Runner {
    config: RunnerConfig,
    sources: Sources,
    states: Arc<dyn ImportStateStore<BlockNumber>>,
    loader: Loader,
    errors: Arc<dyn ErrorSink>,
    last_imported: Mutex<Option<BlockNumber>>,
    stage: AtomicCycleStage,
}

impl Runner {
    pub fn new(
        config: RunnerConfig,
        sources: Sources,
        states: Arc<dyn ImportStateStore<BlockNumber>>,
        records: Arc<dyn RecordSink>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        let loader = Loader::new(
            config.chain,
            sources.transfer_data.clone(),
            records,
            config.ignored_addresses.iter().copied(),
        );
        Self {
            config,
            sources,
            states,
            loader,
            errors,
            last_imported: Mutex::new(None),
            stage: AtomicCycleStage::new(CycleStage::Idle),
        }
    }

    pub fn stage(&self) -> CycleStage {
        self.stage.load(Ordering::Relaxed)
    }

    pub fn last_imported(&self) -> Option<BlockNumber> {
        *self.last_imported.lock()
    }

    /// Imports `products` once, or every `repeat_every` until cancelled.
    pub async fn run(&self, products: Vec<Product>, cancellation_token: CancellationToken) {
        loop {
            self.process_stream(stream::iter(products.clone()), &cancellation_token)
                .await;
            let Some(interval) = self.config.behaviour.repeat_every else {
                break;
            };
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Runner finished");
    }

    /// Groups incoming products into batches and runs one cycle per batch.
    pub async fn process_stream(
        &self,
        products: impl Stream<Item = Product>,
        cancellation_token: &CancellationToken,
    ) {
        self.stage.store(CycleStage::Collect, Ordering::Relaxed);
        let batches = buffer_time(products, self.config.stream.max_input_wait)
            .take_until(cancellation_token.clone().cancelled_owned());
        tokio::pin!(batches);
        while let Some(batch) = batches.next().await {
            if let Err(e) = self.run_cycle(batch, cancellation_token).await {
                error!("Import cycle failed: {e}");
            }
        }
    }

    /// Runs one full cycle over `products` and returns the outcome of every imported range.
    #[instrument(skip_all, fields(chain = %self.config.chain, mode = ?self.config.behaviour.mode))]
    pub async fn run_cycle(
        &self,
        products: Vec<Product>,
        cancellation_token: &CancellationToken,
    ) -> Result<Vec<ImportRangeResult>, ImportError> {
        self.stage.store(CycleStage::Collect, Ordering::Relaxed);
        let products = match collect(self.config.chain, products) {
            Ok(products) => products,
            Err(e) => {
                self.stage.store(CycleStage::Done, Ordering::Relaxed);
                return Err(e);
            }
        };
        metrics::PRODUCTS_IN_LAST_CYCLE.set(products.len() as i64);
        if products.is_empty() {
            self.stage.store(CycleStage::Done, Ordering::Relaxed);
            return Ok(Vec::new());
        }

        if !self.advance(CycleStage::DetermineFrontier, cancellation_token) {
            return Ok(Vec::new());
        }
        let latest = self
            .sources
            .frontier
            .latest_block_number()
            .await
            .map_err(ImportError::Frontier)?;
        debug!(latest, "Got frontier");

        if !self.advance(CycleStage::BuildRanges, cancellation_token) {
            return Ok(Vec::new());
        }
        let product_ranges = self.build_ranges(&products, latest).await;

        if !self.advance(CycleStage::Optimize, cancellation_token) {
            return Ok(Vec::new());
        }
        let options = OptimizerOptions {
            ignore_import_state: self.config.behaviour.ignore_import_state,
            max_addresses_per_query: self.config.limitations.max_address_batch_size,
            max_range_size: self.config.limitations.max_block_span,
            max_queries_per_product: self.config.behaviour.max_queries_per_product,
        };
        let plan = optimizer::optimize(&product_ranges, &options)?;
        info!(
            products = product_ranges.len(),
            queries = plan.len(),
            strategy = plan.kind(),
            "Planned queries"
        );

        if !self.advance(CycleStage::Dispatch, cancellation_token) {
            return Ok(Vec::new());
        }
        let fetched: Vec<FetchedRange> = stream::iter(plan.into_queries())
            .map(|query| self.dispatch(query, &products))
            .buffer_unordered(self.config.stream.fetch_concurrency.max(1))
            .flat_map(stream::iter)
            .collect()
            .await;

        if !self.advance(CycleStage::Load, cancellation_token) {
            return Ok(Vec::new());
        }
        let failed_blocks = self.load(&fetched, &products).await;

        // A cancelled cycle leaves the import states untouched
        if !self.advance(CycleStage::Reconcile, cancellation_token) {
            return Ok(Vec::new());
        }
        let results = self.results(fetched, &failed_blocks, latest);
        self.reconcile(&results, &products).await;

        self.stage.store(CycleStage::Done, Ordering::Relaxed);
        metrics::CYCLES_COMPLETED.inc();
        info!(
            ranges = results.len(),
            failed = results.iter().filter(|r| !r.success).count(),
            "Cycle done"
        );
        Ok(results)
    }

    fn advance(&self, stage: CycleStage, cancellation_token: &CancellationToken) -> bool {
        if cancellation_token.is_cancelled() {
            info!(?stage, "Cycle cancelled");
            return false;
        }
        self.stage.store(stage, Ordering::Relaxed);
        true
    }

    #[instrument(skip_all)]
    async fn build_ranges(
        &self,
        products: &HashMap<ProductKey, Product>,
        latest: BlockNumber,
    ) -> Vec<ProductRanges<BlockNumber>> {
        let behaviour = &self.config.behaviour;
        let context = RangeContext {
            behaviour,
            latest,
            last_imported: self.last_imported(),
            max_block_span: self.config.limitations.max_block_span,
            blocks_per_hour: self.config.chain.blocks_in(Duration::from_secs(3600)),
        };

        let states: Vec<_> = stream::iter(products.values())
            .map(|product| async move { (product, self.import_state(product).await) })
            .buffer_unordered(self.config.stream.load_concurrency.max(1))
            .collect()
            .await;

        let mut product_ranges = Vec::with_capacity(states.len());
        for (product, state) in states {
            let state = match state {
                Ok(state) => state,
                Err(StateError::Storage(e)) => {
                    let context = ErrorContext::ImportState {
                        product_key: product.product_key.clone(),
                    };
                    self.errors.report(&context, e.as_ref());
                    continue;
                }
                Err(StateError::Missing) => continue,
            };
            if behaviour.mode == ImportMode::Historical && state.is_none() {
                continue;
            }
            if let Some(ranges) = context.product_ranges(product, state.as_ref()) {
                product_ranges.push(ranges);
            }
        }
        product_ranges.sort_by(|a, b| a.product_key.cmp(&b.product_key));
        product_ranges
    }

    /// Loads the import state of `product`, creating it in historical mode.
    async fn import_state(
        &self,
        product: &Product,
    ) -> Result<Option<BlockImportState>, StateError> {
        let import_key = product.investment_import_key();
        let state = self
            .states
            .load(&import_key)
            .await
            .map_err(StateError::Storage)?;
        if state.is_some() || self.config.behaviour.mode == ImportMode::Recent {
            return Ok(state);
        }

        let creation = self
            .sources
            .creation
            .fetch_contract_creation(product.contract_address())
            .await;
        let context = ErrorContext::ImportState {
            product_key: product.product_key.clone(),
        };
        let creation = match creation {
            Ok(Some(creation)) => creation,
            Ok(None) => {
                error!(product_key = %product.product_key, "Contract creation not found, skipping");
                return Err(StateError::Missing);
            }
            Err(e) => {
                self.errors.report(&context, &e);
                return Err(StateError::Missing);
            }
        };

        let state = ImportState::new(
            import_key,
            product.product_id,
            product.chain,
            creation.block_number,
            Some(creation.datetime),
        );
        info!(product_key = %product.product_key, origin = state.origin, "Created import state");
        self.states
            .save(state.clone())
            .await
            .map_err(StateError::Storage)?;
        Ok(Some(state))
    }

    /// Runs one query. A failure fails every range the query was meant to serve.
    async fn dispatch(
        &self,
        query: PlannedQuery<BlockNumber>,
        products: &HashMap<ProductKey, Product>,
    ) -> Vec<FetchedRange> {
        let targets = query
            .targets()
            .into_iter()
            .filter_map(|(key, ranges)| products.get(key).map(|product| (product, ranges)))
            .collect_vec();
        let addresses = targets
            .iter()
            .map(|(product, _)| product.contract_address())
            .collect_vec();

        metrics::QUERIES_DISPATCHED.inc();
        let result = self
            .sources
            .transfers
            .fetch_transfers(query.range(), &addresses)
            .await;

        let mut fetched = Vec::new();
        match result {
            Ok(transfers) => {
                for (product, ranges) in targets {
                    let address = product.contract_address();
                    for range in ranges {
                        let transfers = transfers
                            .iter()
                            .filter(|t| t.token_address == address && range.contains(t.block_number))
                            .filter(|t| !self.loader.should_ignore(product, t.owner_address))
                            .cloned()
                            .collect();
                        fetched.push(FetchedRange {
                            product_key: product.product_key.clone(),
                            range: *range,
                            transfers: Some(transfers),
                        });
                    }
                }
            }
            Err(e) => {
                metrics::QUERIES_FAILED.inc();
                for (product, ranges) in targets {
                    for range in ranges {
                        let context = ErrorContext::Query {
                            product_key: product.product_key.clone(),
                            range: *range,
                        };
                        self.errors.report(&context, &e);
                        fetched.push(FetchedRange {
                            product_key: product.product_key.clone(),
                            range: *range,
                            transfers: None,
                        });
                    }
                }
            }
        }
        fetched
    }

    /// Stores every fetched transfer and returns the blocks with at least one failed record.
    #[instrument(skip_all)]
    async fn load(
        &self,
        fetched: &[FetchedRange],
        products: &HashMap<ProductKey, Product>,
    ) -> HashSet<(ProductKey, BlockNumber)> {
        let jobs = fetched.iter().flat_map(|fetched| {
            let product = products.get(&fetched.product_key);
            fetched
                .transfers
                .iter()
                .flatten()
                .filter_map(move |transfer| product.map(|product| (product, transfer)))
        });
        let failures: Vec<_> = stream::iter(jobs)
            .map(|(product, transfer)| async move {
                self.loader
                    .load_transfer(product, transfer)
                    .await
                    .err()
                    .map(|e| (product, transfer, e))
            })
            .buffer_unordered(self.config.stream.load_concurrency.max(1))
            .filter_map(futures::future::ready)
            .collect()
            .await;

        failures
            .into_iter()
            .map(|(product, transfer, e)| {
                metrics::RECORDS_FAILED.inc();
                let context = ErrorContext::Record {
                    product_key: product.product_key.clone(),
                    block_number: transfer.block_number,
                    transaction_hash: transfer.transaction_hash,
                };
                self.errors.report(&context, &e);
                (product.product_key.clone(), transfer.block_number)
            })
            .collect()
    }

    /// Splits every fetched range into one point range per block with transfers plus the
    /// gaps between them.
    fn results(
        &self,
        fetched: Vec<FetchedRange>,
        failed_blocks: &HashSet<(ProductKey, BlockNumber)>,
        latest: BlockNumber,
    ) -> Vec<ImportRangeResult> {
        let strict = self.config.behaviour.strict_coverage;
        let mut results = Vec::new();
        for FetchedRange {
            product_key,
            range,
            transfers,
        } in fetched
        {
            let Some(transfers) = transfers else {
                results.push(ImportRangeResult {
                    product_key,
                    range,
                    success: false,
                    latest,
                });
                continue;
            };
            let blocks: BTreeSet<BlockNumber> = transfers.iter().map(|t| t.block_number).collect();
            let points = blocks.iter().map(|b| Range::point(*b)).collect_vec();
            for gap in ranges::exclude(&[range], &points) {
                results.push(ImportRangeResult {
                    product_key: product_key.clone(),
                    range: gap,
                    success: true,
                    latest,
                });
            }
            for point in points {
                let failed = failed_blocks.contains(&(product_key.clone(), point.from));
                results.push(ImportRangeResult {
                    product_key: product_key.clone(),
                    range: point,
                    success: !(strict && failed),
                    latest,
                });
            }
        }
        results
    }

    #[instrument(skip_all)]
    async fn reconcile(
        &self,
        results: &[ImportRangeResult],
        products: &HashMap<ProductKey, Product>,
    ) {
        let covered = results.iter().filter(|r| r.success).count();
        metrics::RANGES_COVERED.inc_by(covered as u64);
        metrics::RANGES_REQUEUED.inc_by((results.len() - covered) as u64);

        if let Some(max) = results.iter().filter(|r| r.success).map(|r| r.range.to).max() {
            let mut last_imported = self.last_imported.lock();
            *last_imported = Some(last_imported.map_or(max, |last| last.max(max)));
        }

        if self.config.behaviour.mode == ImportMode::Recent {
            return;
        }

        let by_product = results
            .iter()
            .into_group_map_by(|result| result.product_key.clone());
        for (product_key, results) in by_product {
            let Some(product) = products.get(&product_key) else {
                continue;
            };
            let outcomes: Vec<RangeOutcome<BlockNumber>> =
                results.iter().map(|r| r.outcome()).collect();
            let import_key = product.investment_import_key();
            let updated = self
                .states
                .update(
                    &import_key,
                    Box::new(move |state: &mut BlockImportState| {
                        state.ranges.apply_results(&outcomes)
                    }),
                )
                .await;
            match updated {
                Ok(Some(_)) => {}
                Ok(None) => warn!(%product_key, "Import state vanished during the cycle"),
                Err(e) => {
                    let context = ErrorContext::ImportState {
                        product_key: product_key.clone(),
                    };
                    self.errors.report(&context, e.as_ref());
                }
            }
        }
    }
}

/// Keeps the products of `chain`. Two products sharing a key abort the cycle.
pub(super) fn collect(
    chain: Chain,
    products: Vec<Product>,
) -> Result<HashMap<ProductKey, Product>, ImportError> {
    let mut collected = HashMap::with_capacity(products.len());
    let mut duplicates = BTreeSet::new();
    for product in products {
        if product.chain != chain {
            warn!(product_key = %product.product_key, %chain, "Product is on another chain, skipping");
            continue;
        }
        let product_key = product.product_key.clone();
        if collected.insert(product_key.clone(), product).is_some() {
            duplicates.insert(product_key);
        }
    }
    if !duplicates.is_empty() {
        return Err(OptimizeError::DuplicateProducts(duplicates.into_iter().collect()).into());
    }
    Ok(collected)
}

enum StateError {
    /// The product can't take part in this cycle
    Missing,
    Storage(anyhow::Error),
}
