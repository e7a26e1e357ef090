//! Share rate snapshots at a regular interval.
//!
//! Time is cut into slots of `interval` aligned on the unix epoch. Each slot is sampled once, at
//! the block estimated to be the last one produced inside it. Progress is kept per price feed in
//! an [`ImportState`] over time ranges, planned by the same [`optimizer`] as block ranges.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use itertools::Itertools;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    import_state::{
        storage::{ImportStateStore, TimeImportState},
        ImportState, ProductRanges, RangeOutcome,
    },
    metrics,
    optimizer::{self, OptimizerOptions},
    storage::{BlockRow, PriceRow, RecordSink},
    types::{
        chain::Chain,
        product::{Product, ProductKey, ShareRateParams},
        range::{BlockNumber, Range, RangeValue},
    },
};

use super::{
    runner::{collect, AtomicCycleStage, CycleStage},
    Behaviour, ErrorContext, ErrorSink, FetchError, ImportError, ImportMode, LoadError, Sources,
    StreamConfig,
};

const RECENT_WINDOW: Duration = Duration::from_secs(3600);

/// `force_block_range` and `strict_coverage` of `behaviour` only apply to block ranges.
#[derive(Clone)]
pub struct SnapshotConfig {
    pub chain: Chain,
    pub behaviour: Behaviour,
    pub stream: StreamConfig,
    pub interval: Duration,
}

/// Slots of a fixed length, aligned on the unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeGrid {
    interval_ms: u64,
}

impl TimeGrid {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: (interval.as_millis() as u64).max(1),
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Start of the slot holding `at`.
    pub fn floor(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let offset = at.timestamp_millis().rem_euclid(self.interval_ms as i64);
        at.step_down(offset as u64)
    }

    /// End of the last slot which is over at `head`.
    pub fn last_complete(&self, head: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(head).prev()
    }
}

/// Chain head shared by every product of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontier {
    pub block: BlockNumber,
    pub datetime: DateTime<Utc>,
}

impl Frontier {
    /// Block estimated to be the last one produced at or before `at`.
    pub fn block_at(&self, at: DateTime<Utc>, ms_per_block: u64) -> BlockNumber {
        let behind = DateTime::<Utc>::distance(at, self.datetime);
        self.block.saturating_sub(behind.div_ceil(ms_per_block.max(1)))
    }
}

/// Outcome of sampling one slot of one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResult {
    pub product_key: ProductKey,
    pub range: Range<DateTime<Utc>>,
    pub block_number: BlockNumber,
    pub success: bool,
}

impl SnapshotResult {
    pub fn outcome(&self) -> RangeOutcome<DateTime<Utc>> {
        RangeOutcome {
            range: self.range,
            success: self.success,
        }
    }
}

struct Target {
    product: Product,
    params: ShareRateParams,
}

struct Sample {
    product_key: ProductKey,
    range: Range<DateTime<Utc>>,
    block_number: BlockNumber,
    /// `None` when the share rate couldn't be read
    data: Option<(DateTime<Utc>, Decimal)>,
}

pub struct SnapshotRunner {
    config: SnapshotConfig,
    grid: TimeGrid,
    sources: Sources,
    states: Arc<dyn ImportStateStore<DateTime<Utc>>>,
    /// Investment states know the creation date of most products already
    investment_states: Arc<dyn ImportStateStore<BlockNumber>>,
    records: Arc<dyn RecordSink>,
    errors: Arc<dyn ErrorSink>,
    last_imported: Mutex<Option<DateTime<Utc>>>,
    stage: AtomicCycleStage,
}

impl SnapshotRunner {
    pub fn new(
        config: SnapshotConfig,
        sources: Sources,
        states: Arc<dyn ImportStateStore<DateTime<Utc>>>,
        investment_states: Arc<dyn ImportStateStore<BlockNumber>>,
        records: Arc<dyn RecordSink>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            grid: TimeGrid::new(config.interval),
            config,
            sources,
            states,
            investment_states,
            records,
            errors,
            last_imported: Mutex::new(None),
            stage: AtomicCycleStage::new(CycleStage::Idle),
        }
    }

    pub fn stage(&self) -> CycleStage {
        self.stage.load(Ordering::Relaxed)
    }

    pub fn last_imported(&self) -> Option<DateTime<Utc>> {
        *self.last_imported.lock()
    }

    /// Samples `products` once, or every `repeat_every` until cancelled.
    pub async fn run(&self, products: Vec<Product>, cancellation_token: CancellationToken) {
        loop {
            if let Err(e) = self.run_cycle(products.clone(), &cancellation_token).await {
                error!("Snapshot cycle failed: {e}");
            }
            let Some(interval) = self.config.behaviour.repeat_every else {
                break;
            };
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Snapshot runner finished");
    }

    #[instrument(skip_all, fields(chain = %self.config.chain, mode = ?self.config.behaviour.mode))]
    pub async fn run_cycle(
        &self,
        products: Vec<Product>,
        cancellation_token: &CancellationToken,
    ) -> Result<Vec<SnapshotResult>, ImportError> {
        self.stage.store(CycleStage::Collect, Ordering::Relaxed);
        let targets = match collect(self.config.chain, products) {
            Ok(products) => snapshot_targets(products),
            Err(e) => {
                self.stage.store(CycleStage::Done, Ordering::Relaxed);
                return Err(e);
            }
        };
        metrics::PRODUCTS_IN_LAST_CYCLE.set(targets.len() as i64);
        if targets.is_empty() {
            self.stage.store(CycleStage::Done, Ordering::Relaxed);
            return Ok(Vec::new());
        }

        if !self.advance(CycleStage::DetermineFrontier, cancellation_token) {
            return Ok(Vec::new());
        }
        let Some(frontier) = self.frontier().await.map_err(ImportError::Frontier)? else {
            self.stage.store(CycleStage::Done, Ordering::Relaxed);
            return Ok(Vec::new());
        };
        debug!(block = frontier.block, datetime = %frontier.datetime, "Got frontier");

        if !self.advance(CycleStage::BuildRanges, cancellation_token) {
            return Ok(Vec::new());
        }
        let product_ranges = self.build_ranges(&targets, frontier).await;

        if !self.advance(CycleStage::Optimize, cancellation_token) {
            return Ok(Vec::new());
        }
        let options = OptimizerOptions {
            ignore_import_state: self.config.behaviour.ignore_import_state,
            max_addresses_per_query: 1,
            max_range_size: self.grid.interval_ms(),
            max_queries_per_product: self.config.behaviour.max_queries_per_product,
        };
        let plan = optimizer::optimize(&product_ranges, &options)?;
        info!(
            products = product_ranges.len(),
            snapshots = plan.len(),
            "Planned snapshots"
        );

        if !self.advance(CycleStage::Dispatch, cancellation_token) {
            return Ok(Vec::new());
        }
        let slots = plan
            .into_queries()
            .iter()
            .flat_map(|query| {
                query
                    .targets()
                    .into_iter()
                    .flat_map(|(key, ranges)| ranges.iter().map(move |range| (key.clone(), *range)))
                    .collect_vec()
            })
            .collect_vec();
        let samples: Vec<Sample> = stream::iter(slots)
            .filter_map(|(product_key, range)| {
                let target = targets.get(&product_key);
                futures::future::ready(target.map(|target| (target, range)))
            })
            .map(|(target, range)| self.sample(target, range, frontier))
            .buffer_unordered(self.config.stream.fetch_concurrency.max(1))
            .collect()
            .await;

        if !self.advance(CycleStage::Load, cancellation_token) {
            return Ok(Vec::new());
        }
        let results: Vec<SnapshotResult> = stream::iter(samples)
            .map(|sample| self.store(sample, &targets))
            .buffer_unordered(self.config.stream.load_concurrency.max(1))
            .collect()
            .await;

        if !self.advance(CycleStage::Reconcile, cancellation_token) {
            return Ok(Vec::new());
        }
        self.reconcile(&results, &targets).await;

        self.stage.store(CycleStage::Done, Ordering::Relaxed);
        metrics::CYCLES_COMPLETED.inc();
        info!(
            snapshots = results.len(),
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

    /// `None` while the chain is shorter than the propagation delay.
    async fn frontier(&self) -> Result<Option<Frontier>, FetchError> {
        let latest = self.sources.frontier.latest_block_number().await?;
        let Some(block) = latest.checked_sub(self.config.behaviour.wait_for_block_propagation)
        else {
            return Ok(None);
        };
        let datetime = self.sources.frontier.block_datetime(block).await?;
        Ok(Some(Frontier { block, datetime }))
    }

    #[instrument(skip_all)]
    async fn build_ranges(
        &self,
        targets: &HashMap<ProductKey, Target>,
        frontier: Frontier,
    ) -> Vec<ProductRanges<DateTime<Utc>>> {
        let behaviour = &self.config.behaviour;
        let states: Vec<_> = stream::iter(targets.values())
            .map(|target| async move { (target, self.import_state(&target.product).await) })
            .buffer_unordered(self.config.stream.load_concurrency.max(1))
            .collect()
            .await;

        let mut product_ranges = Vec::with_capacity(states.len());
        for (target, state) in states {
            let product = &target.product;
            let state = match (behaviour.mode, state) {
                (ImportMode::Recent, _) => None,
                (ImportMode::Historical, Some(state)) => Some(state),
                (ImportMode::Historical, None) => continue,
            };
            let Some(full_range) = self.full_range(product, state.as_ref(), frontier) else {
                debug!(product_key = %product.product_key, "No complete slot to sample");
                continue;
            };
            let (covered_ranges, to_retry) = match state {
                Some(state) if !behaviour.ignore_import_state => {
                    (state.ranges.covered_ranges, state.ranges.to_retry)
                }
                _ => (Vec::new(), Vec::new()),
            };
            product_ranges.push(ProductRanges {
                product_key: product.product_key.clone(),
                full_range,
                covered_ranges,
                to_retry,
            });
        }
        product_ranges.sort_by(|a, b| a.product_key.cmp(&b.product_key));
        product_ranges
    }

    /// Complete slots from the origin, or from the start of the recent window without a state.
    fn full_range(
        &self,
        product: &Product,
        state: Option<&TimeImportState>,
        frontier: Frontier,
    ) -> Option<Range<DateTime<Utc>>> {
        let window_start = self
            .grid
            .floor(frontier.datetime.step_down(RECENT_WINDOW.as_millis() as u64));
        let mut to = self.grid.last_complete(frontier.datetime);
        let from = match state {
            Some(state) => {
                if self
                    .config
                    .behaviour
                    .skip_recent_window
                    .applies_to(product.eol)
                {
                    to = to.min(window_start.prev());
                }
                self.grid.floor(state.origin)
            }
            None => match self.last_imported() {
                Some(last) => window_start.max(last.next()),
                None => window_start,
            },
        };
        Range::new(from, to).ok()
    }

    /// Loads the time state of `product`, creating it in historical mode.
    async fn import_state(&self, product: &Product) -> Option<TimeImportState> {
        if self.config.behaviour.mode == ImportMode::Recent {
            return None;
        }
        let context = ErrorContext::ImportState {
            product_key: product.product_key.clone(),
        };
        let import_key = product.share_rate_import_key();
        match self.states.load(&import_key).await {
            Ok(Some(state)) => return Some(state),
            Ok(None) => {}
            Err(e) => {
                self.errors.report(&context, e.as_ref());
                return None;
            }
        }

        let origin = match self.origin(product).await {
            Ok(Some(origin)) => origin,
            Ok(None) => {
                error!(product_key = %product.product_key, "Contract creation not found, skipping");
                return None;
            }
            Err(e) => {
                self.errors.report(&context, &e);
                return None;
            }
        };
        let state = ImportState::new(
            import_key,
            product.product_id,
            product.chain,
            origin,
            Some(origin),
        );
        info!(product_key = %product.product_key, %origin, "Created snapshot state");
        if let Err(e) = self.states.save(state.clone()).await {
            self.errors.report(&context, e.as_ref());
            return None;
        }
        Some(state)
    }

    /// Creation date of `product`, from its investment state when there is one.
    async fn origin(&self, product: &Product) -> Result<Option<DateTime<Utc>>, FetchError> {
        match self
            .investment_states
            .load(&product.investment_import_key())
            .await
        {
            Ok(Some(ImportState {
                origin_datetime: Some(origin),
                ..
            })) => return Ok(Some(origin)),
            Ok(_) => {}
            Err(e) => {
                warn!(product_key = %product.product_key, "Couldn't read investment state: {e:#}")
            }
        }
        let creation = self
            .sources
            .creation
            .fetch_contract_creation(product.contract_address())
            .await?;
        Ok(creation.map(|creation| creation.datetime))
    }

    /// Reads the share rate at the end of `range`.
    async fn sample(&self, target: &Target, range: Range<DateTime<Utc>>, frontier: Frontier) -> Sample {
        let product_key = target.product.product_key.clone();
        let block_number = frontier.block_at(range.to, self.config.chain.ms_per_block_estimate());
        metrics::QUERIES_DISPATCHED.inc();
        let data = tokio::try_join!(
            self.sources.frontier.block_datetime(block_number),
            self.sources
                .share_rates
                .fetch_share_rate(&target.params, block_number),
        );
        let data = match data {
            Ok(data) => Some(data),
            Err(e) => {
                metrics::QUERIES_FAILED.inc();
                let context = ErrorContext::Snapshot {
                    product_key: product_key.clone(),
                    range,
                };
                self.errors.report(&context, &e);
                None
            }
        };
        Sample {
            product_key,
            range,
            block_number,
            data,
        }
    }

    async fn store(&self, sample: Sample, targets: &HashMap<ProductKey, Target>) -> SnapshotResult {
        let Sample {
            product_key,
            range,
            block_number,
            data,
        } = sample;
        let stored = match (data, targets.get(&product_key)) {
            (Some((datetime, price)), Some(target)) => {
                let result = self
                    .store_price(&target.product, block_number, datetime, price)
                    .await;
                if let Err(e) = &result {
                    metrics::RECORDS_FAILED.inc();
                    let context = ErrorContext::Snapshot {
                        product_key: product_key.clone(),
                        range,
                    };
                    self.errors.report(&context, e);
                }
                result.is_ok()
            }
            _ => false,
        };
        SnapshotResult {
            product_key,
            range,
            block_number,
            success: stored,
        }
    }

    async fn store_price(
        &self,
        product: &Product,
        block_number: BlockNumber,
        datetime: DateTime<Utc>,
        price: Decimal,
    ) -> Result<(), LoadError> {
        self.records
            .upsert_block(BlockRow {
                chain: self.config.chain,
                block_number,
                datetime,
            })
            .await
            .map_err(LoadError::Store)?;
        self.records
            .upsert_price(PriceRow {
                price_feed_id: product.price_feed_id_1,
                block_number,
                datetime,
                price,
            })
            .await
            .map_err(LoadError::Store)?;
        metrics::SNAPSHOTS_STORED.inc();
        Ok(())
    }

    #[instrument(skip_all)]
    async fn reconcile(&self, results: &[SnapshotResult], targets: &HashMap<ProductKey, Target>) {
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
            let Some(target) = targets.get(&product_key) else {
                continue;
            };
            let outcomes = results.iter().map(|r| r.outcome()).collect_vec();
            let updated = self
                .states
                .update(
                    &target.product.share_rate_import_key(),
                    Box::new(move |state: &mut TimeImportState| state.apply_results(&outcomes)),
                )
                .await;
            match updated {
                Ok(Some(_)) => {}
                Ok(None) => warn!(%product_key, "Snapshot state vanished during the cycle"),
                Err(e) => {
                    let context = ErrorContext::ImportState { product_key };
                    self.errors.report(&context, e.as_ref());
                }
            }
        }
    }
}

/// One product per price feed, gov vaults have no share rate to sample.
fn snapshot_targets(products: HashMap<ProductKey, Product>) -> HashMap<ProductKey, Target> {
    let mut by_feed = BTreeMap::new();
    for product in products
        .into_values()
        .sorted_by(|a, b| a.product_key.cmp(&b.product_key))
    {
        let Some(params) = product.share_rate_params() else {
            debug!(product_key = %product.product_key, "No share rate, skipping");
            continue;
        };
        by_feed
            .entry(product.price_feed_id_1)
            .or_insert(Target { product, params });
    }
    by_feed
        .into_values()
        .map(|target| (target.product.product_key.clone(), target))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{
        import_state::storage::{BlockImportState, MemoryImportStateStore},
        pipeline::{error::tests::CollectingErrorSink, tests::MockChain},
        storage::{tests::datetime, MemoryRecordSink},
        types::product::{
            tests::{address, std_vault},
            ProductData, VaultInfo,
        },
    };

    const INTERVAL: Duration = Duration::from_secs(15 * 60);

    fn ms(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn slot(start_ms: i64) -> Range<DateTime<Utc>> {
        Range::new(ms(start_ms), ms(start_ms + 899_999)).unwrap()
    }

    /// Block times of the mock chain match the estimate of this chain.
    fn vault(id: i64) -> Product {
        Product {
            chain: Chain::Harmony,
            ..std_vault(id)
        }
    }

    struct Harness {
        chain: Arc<MockChain>,
        states: Arc<MemoryImportStateStore<DateTime<Utc>>>,
        investment_states: Arc<MemoryImportStateStore>,
        records: Arc<MemoryRecordSink>,
        errors: Arc<CollectingErrorSink>,
        runner: SnapshotRunner,
    }

    impl Harness {
        fn new(mode: ImportMode) -> Self {
            let chain = Arc::new(MockChain::default());
            let states = Arc::new(MemoryImportStateStore::default());
            let investment_states = Arc::new(MemoryImportStateStore::default());
            let records = Arc::new(MemoryRecordSink::default());
            let errors = Arc::new(CollectingErrorSink::default());
            let config = SnapshotConfig {
                chain: Chain::Harmony,
                behaviour: Behaviour {
                    max_queries_per_product: 10,
                    ..Behaviour::new(mode)
                },
                stream: StreamConfig::default(),
                interval: INTERVAL,
            };
            let runner = SnapshotRunner::new(
                config,
                Sources::from_client(chain.clone()),
                states.clone(),
                investment_states.clone(),
                records.clone(),
                errors.clone(),
            );
            Self {
                chain,
                states,
                investment_states,
                records,
                errors,
                runner,
            }
        }

        async fn cycle(&self, products: &[Product]) -> Vec<SnapshotResult> {
            self.runner
                .run_cycle(products.to_vec(), &CancellationToken::new())
                .await
                .unwrap()
        }

        fn price_blocks(&self) -> Vec<(i64, BlockNumber)> {
            self.records
                .records()
                .prices
                .keys()
                .copied()
                .sorted()
                .collect()
        }

        async fn ranges_of(
            &self,
            product: &Product,
        ) -> (Vec<Range<DateTime<Utc>>>, Vec<Range<DateTime<Utc>>>) {
            let state = self
                .states
                .load(&product.share_rate_import_key())
                .await
                .unwrap()
                .unwrap();
            (state.ranges.covered_ranges, state.ranges.to_retry)
        }
    }

    #[test]
    fn test_time_grid() {
        let grid = TimeGrid::new(INTERVAL);
        let slot_start = Utc.with_ymd_and_hms(2023, 1, 1, 10, 15, 0).unwrap();
        let inside = Utc.with_ymd_and_hms(2023, 1, 1, 10, 29, 59).unwrap();
        assert_eq!(grid.floor(inside), slot_start);
        assert_eq!(grid.floor(slot_start), slot_start);
        assert_eq!(grid.last_complete(inside), slot_start.prev());
        assert_eq!(grid.interval_ms(), 900_000);
        assert_eq!(TimeGrid::new(Duration::ZERO).interval_ms(), 1);
    }

    #[test]
    fn test_block_estimate() {
        let frontier = Frontier {
            block: 1000,
            datetime: ms(1_000_000),
        };
        assert_eq!(frontier.block_at(ms(1_000_000), 3000), 1000);
        assert_eq!(frontier.block_at(ms(2_000_000), 3000), 1000);
        assert_eq!(frontier.block_at(ms(997_000), 3000), 999);
        assert_eq!(frontier.block_at(ms(996_999), 3000), 998);
        assert_eq!(frontier.block_at(ms(0), 3000), 666);
        assert_eq!(frontier.block_at(ms(0), 1), 0);
    }

    #[tokio::test]
    async fn test_historical_snapshots() {
        let harness = Harness::new(ImportMode::Historical);
        let product = vault(1);
        let gov = Product {
            product_data: ProductData::GovVault {
                vault: VaultInfo {
                    id: "gov".to_owned(),
                    contract_address: address(0x2000),
                    token_decimals: 18,
                    want_decimals: 18,
                },
            },
            ..vault(2)
        };
        let same_feed = Product {
            product_key: "beefy:boost:harmony:1".to_owned(),
            ..vault(1)
        };
        harness.chain.creations.lock().insert(product.contract_address(), 0);
        *harness.chain.latest.lock() = 1000;

        let results = harness
            .cycle(&[product.clone(), gov, same_feed.clone()])
            .await;

        // creation at 1_600_000_000_000 lies in the slot starting 700s earlier
        let slots = [
            1_599_999_300_000,
            1_600_000_200_000,
            1_600_001_100_000,
            1_600_002_000_000,
        ]
        .map(slot);
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.success));
        assert!(results.iter().all(|r| r.product_key == same_feed.product_key));
        assert_eq!(
            harness.price_blocks(),
            vec![(11, 66), (11, 366), (11, 666), (11, 966)]
        );
        for result in &results {
            let sampled_at = datetime(result.block_number);
            assert!(result.range.contains(sampled_at), "{result:?}");
        }
        assert_eq!(
            harness.ranges_of(&product).await,
            (vec![Range::new(slots[0].from, slots[3].to).unwrap()], vec![])
        );
        assert_eq!(harness.runner.last_imported(), Some(slots[3].to));
        assert_eq!(harness.runner.stage(), CycleStage::Done);

        // every complete slot is covered already
        assert!(harness.cycle(&[product]).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_snapshot_is_retried() {
        let harness = Harness::new(ImportMode::Historical);
        let product = vault(1);
        harness.chain.creations.lock().insert(product.contract_address(), 0);
        *harness.chain.latest.lock() = 1000;
        harness.chain.failing_share_rate_blocks.lock().insert(366);

        harness.cycle(&[product.clone()]).await;

        let failed = slot(1_600_000_200_000);
        let (covered, to_retry) = harness.ranges_of(&product).await;
        assert_eq!(to_retry, vec![failed]);
        assert_eq!(covered.len(), 2);
        assert_eq!(
            harness.errors.reports.lock()[0].0,
            ErrorContext::Snapshot {
                product_key: product.product_key.clone(),
                range: failed,
            }
        );

        harness.chain.failing_share_rate_blocks.lock().clear();
        harness.chain.share_rate_calls.lock().clear();
        let results = harness.cycle(&[product.clone()]).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].range, failed);
        assert_eq!(
            harness.chain.share_rate_calls.lock().clone(),
            vec![(product.contract_address(), 366)]
        );
        let (covered, to_retry) = harness.ranges_of(&product).await;
        assert_eq!(covered.len(), 1);
        assert!(to_retry.is_empty());
    }

    #[tokio::test]
    async fn test_origin_from_investment_state() {
        let harness = Harness::new(ImportMode::Historical);
        let product = vault(1);
        let investment_state = BlockImportState::new(
            product.investment_import_key(),
            product.product_id,
            product.chain,
            600,
            Some(datetime(600)),
        );
        harness
            .investment_states
            .save(investment_state)
            .await
            .unwrap();
        *harness.chain.latest.lock() = 1000;

        harness.cycle(&[product.clone()]).await;

        // no creation is known to the chain, the investment state is enough
        assert!(harness.errors.reports.lock().is_empty());
        assert_eq!(harness.price_blocks(), vec![(11, 666), (11, 966)]);
        let state = harness
            .states
            .load(&product.share_rate_import_key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.origin, datetime(600));
    }

    #[tokio::test]
    async fn test_recent_snapshots() {
        let harness = Harness::new(ImportMode::Recent);
        let product = vault(1);
        *harness.chain.latest.lock() = 2000;

        let results = harness.cycle(&[product.clone()]).await;

        // head at 1_600_006_000_000, the hour before it starts in the slot at 1_600_002_000_000
        assert_eq!(
            results.iter().map(|r| r.range).sorted_by_key(|r| r.from).collect_vec(),
            [
                1_600_002_000_000,
                1_600_002_900_000,
                1_600_003_800_000,
                1_600_004_700_000
            ]
            .map(slot)
        );
        assert_eq!(harness.runner.last_imported(), Some(ms(1_600_005_599_999)));
        assert!(harness
            .states
            .load(&product.share_rate_import_key())
            .await
            .unwrap()
            .is_none());

        assert!(harness.cycle(&[product.clone()]).await.is_empty());

        *harness.chain.latest.lock() = 2300;
        let results = harness.cycle(&[product]).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].range, slot(1_600_005_600_000));
        assert_eq!(results[0].block_number, 2166);
    }

    #[tokio::test]
    async fn test_frontier_failure_aborts_the_cycle() {
        let harness = Harness::new(ImportMode::Historical);
        let product = vault(1);
        harness.chain.creations.lock().insert(product.contract_address(), 0);
        *harness.chain.latest.lock() = 1000;
        harness.chain.missing_blocks.lock().insert(1000);

        let result = harness
            .runner
            .run_cycle(vec![product], &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(ImportError::Frontier(_))));
        assert!(harness.records.records().prices.is_empty());
    }
}
