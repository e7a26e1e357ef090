//! Import-state driven ingestion of vault share transfers.
//!
//! One cycle runs `COLLECT → DETERMINE_FRONTIER → BUILD_RANGES → OPTIMIZE → DISPATCH → LOAD →
//! RECONCILE → DONE` over a batch of products. Remote data comes from the collaborator traits
//! below, progress is folded into the [`ImportStateStore`](crate::import_state::storage::ImportStateStore).
//!
//! [`share_rate::SnapshotRunner`] follows the same stages over time ranges to sample share rates
//! at a regular interval.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use rust_decimal::Decimal;

use crate::{
    import_state::RangeOutcome,
    types::{
        chain::Chain,
        product::{ProductKey, ShareRateParams},
        range::{BlockNumber, Range},
        transfer::{Transfer, TransferData, TransferDataParams},
    },
};

pub mod collector;
pub mod error;
pub mod full_range;
pub mod loader;
pub mod rate_limiter;
pub mod runner;
pub mod share_rate;

pub use error::{ErrorContext, ErrorSink, FetchError, ImportError, LoadError, TracingErrorSink};
pub use rate_limiter::RpcLimiter;

#[async_trait]
pub trait FrontierSource: Send + Sync {
    async fn latest_block_number(&self) -> Result<BlockNumber, FetchError>;

    async fn block_datetime(&self, block: BlockNumber) -> Result<DateTime<Utc>, FetchError>;
}

#[async_trait]
pub trait TransferSource: Send + Sync {
    /// Both legs of every `Transfer` emitted by one of `tokens` inside `range`.
    /// Mint and burn legs (zero address) are left out.
    async fn fetch_transfers(
        &self,
        range: Range<BlockNumber>,
        tokens: &[Address],
    ) -> Result<Vec<Transfer>, FetchError>;
}

#[async_trait]
pub trait TransferDataSource: Send + Sync {
    async fn fetch_transfer_data(
        &self,
        params: &TransferDataParams,
    ) -> Result<TransferData, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractCreation {
    pub block_number: BlockNumber,
    pub datetime: DateTime<Utc>,
}

#[async_trait]
pub trait CreationInfoSource: Send + Sync {
    /// `None` when no code can be found at `address`.
    async fn fetch_contract_creation(
        &self,
        address: Address,
    ) -> Result<Option<ContractCreation>, FetchError>;
}

#[async_trait]
pub trait ShareRateSource: Send + Sync {
    /// Underlying tokens one share of `params.vault_address` was worth right after `block`.
    async fn fetch_share_rate(
        &self,
        params: &ShareRateParams,
        block: BlockNumber,
    ) -> Result<Decimal, FetchError>;
}

/// Every remote capability a runner needs.
#[derive(Clone)]
pub struct Sources {
    pub frontier: Arc<dyn FrontierSource>,
    pub transfers: Arc<dyn TransferSource>,
    pub transfer_data: Arc<dyn TransferDataSource>,
    pub creation: Arc<dyn CreationInfoSource>,
    pub share_rates: Arc<dyn ShareRateSource>,
}

impl Sources {
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: FrontierSource
            + TransferSource
            + TransferDataSource
            + CreationInfoSource
            + ShareRateSource
            + 'static,
    {
        Self {
            frontier: client.clone(),
            transfers: client.clone(),
            transfer_data: client.clone(),
            creation: client.clone(),
            share_rates: client,
        }
    }
}

/// What a cycle imports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Pipeline {
    /// Investor positions, from share token transfers
    #[default]
    Investments,
    /// Share rate snapshots at a regular interval
    ShareRates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ImportMode {
    /// Poll the last blocks with low latency, import states are neither created nor used
    Recent,
    /// Walk the whole history of every product, resuming from the import state
    Historical,
}

/// Which products leave the most recent window to a concurrent `recent` runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum SkipRecentWindow {
    All,
    #[default]
    None,
    Live,
    Eol,
}

impl SkipRecentWindow {
    pub fn applies_to(&self, eol: bool) -> bool {
        match self {
            SkipRecentWindow::All => true,
            SkipRecentWindow::None => false,
            SkipRecentWindow::Live => !eol,
            SkipRecentWindow::Eol => eol,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Behaviour {
    pub mode: ImportMode,
    pub ignore_import_state: bool,
    pub skip_recent_window: SkipRecentWindow,
    pub force_block_range: Option<Range<BlockNumber>>,
    pub max_queries_per_product: usize,
    pub wait_for_block_propagation: u64,
    /// Blocks whose records failed to load are retried instead of marked as covered
    pub strict_coverage: bool,
    pub repeat_every: Option<Duration>,
}

impl Behaviour {
    pub fn new(mode: ImportMode) -> Self {
        Self {
            mode,
            ignore_import_state: false,
            skip_recent_window: SkipRecentWindow::None,
            force_block_range: None,
            max_queries_per_product: match mode {
                ImportMode::Recent => 1,
                ImportMode::Historical => 10,
            },
            wait_for_block_propagation: 0,
            strict_coverage: false,
            repeat_every: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcLimitations {
    pub max_block_span: u64,
    pub max_address_batch_size: usize,
}

impl RpcLimitations {
    pub fn for_chain(chain: Chain) -> Self {
        Self {
            max_block_span: chain.max_get_logs_block_span(),
            max_address_batch_size: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_input_wait: Duration,
    pub fetch_concurrency: usize,
    pub load_concurrency: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_input_wait: Duration::from_secs(5),
            fetch_concurrency: 4,
            load_concurrency: 10,
        }
    }
}

#[derive(Clone)]
pub struct RunnerConfig {
    pub chain: Chain,
    pub behaviour: Behaviour,
    pub limitations: RpcLimitations,
    pub stream: StreamConfig,
    /// Owners whose transfers are never imported, on top of the zero address and the
    /// product contract itself
    pub ignored_addresses: Vec<Address>,
}

/// Outcome of importing one range of one product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRangeResult {
    pub product_key: ProductKey,
    pub range: Range<BlockNumber>,
    pub success: bool,
    pub latest: BlockNumber,
}

impl ImportRangeResult {
    pub fn outcome(&self) -> RangeOutcome<BlockNumber> {
        RangeOutcome {
            range: self.range,
            success: self.success,
        }
    }
}
