use std::time::Duration;

use anyhow::{anyhow, Result};
use camino::Utf8PathBuf as PathBuf;
use clap::Parser;
use ethers::types::Address;

use crate::{
    pipeline::{
        share_rate::SnapshotConfig, Behaviour, ImportMode, Pipeline, RpcLimitations, RpcLimiter,
        RunnerConfig, SkipRecentWindow, StreamConfig,
    },
    types::{
        chain::Chain,
        range::{BlockNumber, Range},
    },
};

#[derive(Parser)]
#[command(version)]
pub struct Args {
    /// Directory to keep the databases in (defaults to cwd)
    #[clap(
        long,
        env,
        value_name = "DIR",
        default_value = ".",
        hide_default_value(true)
    )]
    pub data_dir: PathBuf,

    /// Chain to import
    #[clap(long, env, value_enum)]
    pub chain: Chain,

    /// JSON-RPC endpoint of the chain
    #[clap(long, env, value_name = "URL")]
    pub rpc_url: String,

    /// Product catalog (JSON)
    #[clap(long, env, value_name = "FILE", default_value = "products.json")]
    pub products: PathBuf,

    /// Where to download the product catalog from when the file doesn't exist
    #[clap(long, env, value_name = "URL")]
    pub products_url: Option<String>,

    /// Port to serve metrics on
    #[clap(long, env, default_value_t = 9090)]
    pub prometheus_port: u16,

    /// What to import
    #[clap(long, env, value_enum, default_value_t)]
    pub pipeline: Pipeline,

    /// Time between two share rate snapshots
    #[clap(long, env, value_parser = parse_minutes, default_value = "15")]
    pub snapshot_interval_min: Duration,

    #[command(flatten)]
    pub rpc: RpcArgs,

    #[command(subcommand)]
    pub mode: Mode,

    /// Extra owners whose transfers are never imported
    #[clap(long = "ignore-address", env = "IGNORED_ADDRESSES", value_delimiter = ',', value_parser = parse_address)]
    pub ignored_addresses: Vec<Address>,

    /// Log the duration of every closed span
    #[clap(long, env)]
    pub log_span_durations: bool,

    #[clap(env, hide(true))]
    pub sentry_dsn: Option<String>,

    #[clap(env, hide(true), default_value_t = 0.001)]
    pub sentry_traces_sample_rate: f32,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RpcArgs {
    /// Widest block span of one eth_getLogs call (defaults to a per-chain value)
    #[clap(long, env)]
    pub max_block_span: Option<u64>,

    /// How many contracts one eth_getLogs call can filter on
    #[clap(long, env, default_value_t = 1)]
    pub max_address_batch_size: usize,

    /// Minimum delay between two RPC calls, 0 to disable
    #[clap(long, env, value_parser = parse_millis, default_value = "1000")]
    pub min_delay_between_calls_ms: Duration,

    #[clap(long, env, value_parser = parse_seconds, default_value = "60")]
    pub fetch_timeout_sec: Duration,

    #[clap(long, env, default_value_t = 4)]
    pub fetch_concurrency: usize,

    #[clap(long, env, default_value_t = 10)]
    pub load_concurrency: usize,

    /// How long to wait for more products before starting a cycle
    #[clap(long, env, value_parser = parse_millis, default_value = "5000")]
    pub max_input_wait_ms: Duration,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BehaviourArgs {
    /// Consider every block in range as not imported yet
    #[clap(long)]
    pub ignore_import_state: bool,

    /// Only consider blocks in this range, `FROM-TO` or `FROM..TO`
    #[clap(long)]
    pub force_block_range: Option<Range<BlockNumber>>,

    /// Defaults to 1 for recent and 10 for historical imports
    #[clap(long)]
    pub max_queries_per_product: Option<usize>,

    /// Blocks to leave behind the chain head
    #[clap(long, default_value_t = 0)]
    pub wait_for_block_propagation: u64,

    /// Mark blocks whose records failed to load for a retry
    #[clap(long)]
    pub strict_coverage: bool,

    /// Run again every N seconds until stopped
    #[clap(long, value_parser = parse_seconds)]
    pub repeat_every_sec: Option<Duration>,
}

#[derive(clap::Subcommand)]
pub enum Mode {
    /// Import the last hour of blocks
    Recent(BehaviourArgs),
    /// Import the whole history of every product
    Historical {
        #[command(flatten)]
        behaviour: BehaviourArgs,

        /// Leave the last hour of blocks to a concurrent recent import
        #[clap(long, value_enum, default_value_t)]
        skip_recent_window: SkipRecentWindow,
    },
}

impl Args {
    pub fn behaviour(&self) -> Behaviour {
        let (mode, args, skip_recent_window) = match &self.mode {
            Mode::Recent(args) => (ImportMode::Recent, args, SkipRecentWindow::None),
            Mode::Historical {
                behaviour,
                skip_recent_window,
            } => (ImportMode::Historical, behaviour, *skip_recent_window),
        };
        let defaults = Behaviour::new(mode);
        Behaviour {
            mode,
            ignore_import_state: args.ignore_import_state,
            skip_recent_window,
            force_block_range: args.force_block_range,
            max_queries_per_product: args
                .max_queries_per_product
                .unwrap_or(defaults.max_queries_per_product),
            wait_for_block_propagation: args.wait_for_block_propagation,
            strict_coverage: args.strict_coverage,
            repeat_every: args.repeat_every_sec,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        let mut limitations = RpcLimitations::for_chain(self.chain);
        if let Some(span) = self.rpc.max_block_span {
            limitations.max_block_span = span;
        }
        limitations.max_address_batch_size = self.rpc.max_address_batch_size;
        RunnerConfig {
            chain: self.chain,
            behaviour: self.behaviour(),
            limitations,
            stream: self.stream_config(),
            ignored_addresses: self.ignored_addresses.clone(),
        }
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            chain: self.chain,
            behaviour: self.behaviour(),
            stream: self.stream_config(),
            interval: self.snapshot_interval_min,
        }
    }

    fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            max_input_wait: self.rpc.max_input_wait_ms,
            fetch_concurrency: self.rpc.fetch_concurrency,
            load_concurrency: self.rpc.load_concurrency,
        }
    }

    /// Shared by every request sent to the RPC endpoint.
    pub fn rpc_limiter(&self) -> RpcLimiter {
        RpcLimiter::new(
            self.rpc.min_delay_between_calls_ms,
            1,
            self.rpc.fetch_timeout_sec,
        )
    }
}

fn parse_seconds(s: &str) -> Result<Duration> {
    Ok(Duration::from_secs(s.parse()?))
}

fn parse_minutes(s: &str) -> Result<Duration> {
    match s.parse()? {
        0 => Err(anyhow!("Interval must be at least one minute")),
        minutes => Ok(Duration::from_secs(minutes * 60)),
    }
}

fn parse_millis(s: &str) -> Result<Duration> {
    Ok(Duration::from_millis(s.parse()?))
}

fn parse_address(s: &str) -> Result<Address> {
    s.parse().map_err(|e| anyhow!("Invalid address '{s}': {e}"))
}
