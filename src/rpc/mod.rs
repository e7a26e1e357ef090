//! JSON-RPC implementation of the remote sources.

use std::future::Future;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::{
    abi::{self, Token},
    providers::{Http, JsonRpcClient, Middleware, Provider, ProviderError},
    types::{
        transaction::eip2718::TypedTransaction, Address, BlockId, BlockNumber as RpcBlockNumber,
        Bytes, Filter, Log, TransactionRequest, H256, I256, U256,
    },
    utils::keccak256,
};
use rust_decimal::Decimal;
use tracing::{debug, instrument, warn};

use crate::{
    pipeline::{
        loader::to_decimal, ContractCreation, CreationInfoSource, FetchError, FrontierSource,
        RpcLimiter, ShareRateSource, TransferDataSource, TransferSource,
    },
    types::{
        product::ShareRateParams,
        range::{BlockNumber, Range},
        transfer::{Transfer, TransferData, TransferDataParams},
    },
};

lazy_static::lazy_static! {
    static ref TRANSFER_TOPIC: H256 = H256::from(keccak256("Transfer(address,address,uint256)"));
}

const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];
const PRICE_PER_FULL_SHARE_SELECTOR: [u8; 4] = [0x77, 0xc7, 0xb8, 0xfc];

/// Every provider request waits for its own slot in `limiter`.
pub struct RpcClient<P = Http> {
    provider: Provider<P>,
    limiter: RpcLimiter,
}

impl RpcClient<Http> {
    pub fn new(url: &str, limiter: RpcLimiter) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .with_context(|| format!("Invalid RPC url '{url}'"))?;
        Ok(Self::with_provider(provider, limiter))
    }
}

impl<P: JsonRpcClient + 'static> RpcClient<P> {
    pub fn with_provider(provider: Provider<P>, limiter: RpcLimiter) -> Self {
        Self { provider, limiter }
    }

    async fn request<T, F>(
        &self,
        method: &str,
        block: Option<BlockNumber>,
        request: F,
    ) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        self.limiter
            .call(method, async {
                request.await.map_err(|e| map_provider_error(e, block))
            })
            .await
    }

    async fn call_at(
        &self,
        to: Address,
        data: Vec<u8>,
        block: BlockNumber,
    ) -> Result<U256, FetchError> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(Bytes::from(data)).into();
        let result = self
            .request(
                "eth_call",
                Some(block),
                self.provider.call(&tx, Some(block_id(block))),
            )
            .await?;
        if result.len() < 32 {
            return Err(FetchError::Rpc(format!(
                "Unexpected response of {} bytes from {to:#x}",
                result.len()
            )));
        }
        Ok(U256::from_big_endian(&result[..32]))
    }

    async fn has_code(&self, address: Address, block: BlockNumber) -> Result<bool, FetchError> {
        let code = self
            .request(
                "eth_getCode",
                Some(block),
                self.provider.get_code(address, Some(block_id(block))),
            )
            .await?;
        Ok(!code.is_empty())
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> FrontierSource for RpcClient<P> {
    async fn latest_block_number(&self) -> Result<BlockNumber, FetchError> {
        let latest = self
            .request("eth_blockNumber", None, self.provider.get_block_number())
            .await?;
        Ok(latest.as_u64())
    }

    async fn block_datetime(&self, block: BlockNumber) -> Result<DateTime<Utc>, FetchError> {
        let block_data = self
            .request(
                "eth_getBlockByNumber",
                Some(block),
                self.provider.get_block(block_id(block)),
            )
            .await?
            .ok_or_else(|| FetchError::Unavailable(format!("Block {block} not found")))?;
        let timestamp = i64::try_from(block_data.timestamp.low_u64())
            .map_err(|_| FetchError::Rpc(format!("Invalid timestamp of block {block}")))?;
        Utc.timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| FetchError::Rpc(format!("Invalid timestamp of block {block}")))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> TransferSource for RpcClient<P> {
    #[instrument(skip_all, fields(%range, tokens = tokens.len()))]
    async fn fetch_transfers(
        &self,
        range: Range<BlockNumber>,
        tokens: &[Address],
    ) -> Result<Vec<Transfer>, FetchError> {
        let filter = Filter::new()
            .address(tokens.to_vec())
            .topic0(*TRANSFER_TOPIC)
            .from_block(range.from)
            .to_block(range.to);
        let logs = self
            .request("eth_getLogs", Some(range.to), self.provider.get_logs(&filter))
            .await?;
        debug!("Got {} logs", logs.len());

        let mut transfers = Vec::with_capacity(logs.len() * 2);
        for log in &logs {
            transfers.extend(decode_transfer(log)?);
        }
        Ok(transfers)
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> TransferDataSource for RpcClient<P> {
    async fn fetch_transfer_data(
        &self,
        params: &TransferDataParams,
    ) -> Result<TransferData, FetchError> {
        let block = params.block_number;
        let mut balance_call = BALANCE_OF_SELECTOR.to_vec();
        balance_call.extend(abi::encode(&[Token::Address(params.owner_address)]));

        let balance = self.call_at(params.token_address, balance_call, block);
        let block_datetime = self.block_datetime(block);
        let share_rate = async {
            match &params.share_rate {
                Some(share_rate) => self.fetch_share_rate(share_rate, block).await,
                None => Ok(Decimal::ONE),
            }
        };
        let (balance, block_datetime, share_rate) =
            tokio::try_join!(balance, block_datetime, share_rate)?;

        Ok(TransferData {
            block_datetime,
            balance,
            share_rate,
        })
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ShareRateSource for RpcClient<P> {
    async fn fetch_share_rate(
        &self,
        params: &ShareRateParams,
        block: BlockNumber,
    ) -> Result<Decimal, FetchError> {
        let ppfs = self
            .call_at(
                params.vault_address,
                PRICE_PER_FULL_SHARE_SELECTOR.to_vec(),
                block,
            )
            .await?;
        to_decimal(ppfs, params.underlying_decimals).map_err(|e| FetchError::Rpc(e.to_string()))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> CreationInfoSource for RpcClient<P> {
    /// Binary search for the first block with code at `address`. Needs an archive node.
    #[instrument(skip(self))]
    async fn fetch_contract_creation(
        &self,
        address: Address,
    ) -> Result<Option<ContractCreation>, FetchError> {
        let latest = self.latest_block_number().await?;
        if !self.has_code(address, latest).await? {
            return Ok(None);
        }
        let (mut low, mut high) = (0, latest);
        while low < high {
            let mid = low + (high - low) / 2;
            if self.has_code(address, mid).await? {
                high = mid;
            } else {
                low = mid + 1;
            }
        }
        let datetime = self.block_datetime(low).await?;
        Ok(Some(ContractCreation {
            block_number: low,
            datetime,
        }))
    }
}

fn block_id(block: BlockNumber) -> BlockId {
    BlockId::Number(RpcBlockNumber::Number(block.into()))
}

/// Both legs of an ERC20 transfer, mint and burn legs left out.
fn decode_transfer(log: &Log) -> Result<Vec<Transfer>, FetchError> {
    let (Some(block_number), Some(transaction_hash), Some(log_index)) =
        (log.block_number, log.transaction_hash, log.log_index)
    else {
        warn!(?log, "Skipping pending log");
        return Ok(Vec::new());
    };
    if log.topics.len() != 3 || log.data.len() < 32 {
        warn!(?log, "Skipping log which isn't an ERC20 transfer");
        return Ok(Vec::new());
    }
    let from = Address::from(log.topics[1]);
    let to = Address::from(log.topics[2]);
    let value = U256::from_big_endian(&log.data[..32]);
    let amount = I256::try_from(value)
        .map_err(|_| FetchError::Rpc(format!("Transfer amount {value} overflows")))?;

    let leg = |owner_address: Address, amount_transferred: I256| Transfer {
        block_number: block_number.as_u64(),
        transaction_hash,
        log_index: log_index.low_u64(),
        token_address: log.address,
        owner_address,
        amount_transferred,
    };
    let mut legs = Vec::with_capacity(2);
    if !from.is_zero() {
        legs.push(leg(from, -amount));
    }
    if !to.is_zero() {
        legs.push(leg(to, amount));
    }
    Ok(legs)
}

fn map_provider_error(e: ProviderError, block: Option<BlockNumber>) -> FetchError {
    let message = e.to_string();
    let lowercase = message.to_lowercase();
    if let Some(block) = block {
        if lowercase.contains("missing trie node")
            || lowercase.contains("archive")
            || lowercase.contains("header not found")
        {
            return FetchError::ArchiveNodeNeeded(block);
        }
    }
    if lowercase.contains("timeout") || lowercase.contains("timed out") {
        return FetchError::Timeout;
    }
    match e {
        ProviderError::HTTPError(_) => FetchError::Unavailable(message),
        _ => FetchError::Rpc(message),
    }
}
