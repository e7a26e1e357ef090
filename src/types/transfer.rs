use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, I256, U256};
use rust_decimal::Decimal;

use super::{product::ShareRateParams, range::BlockNumber};

/// One leg of an ERC20 `Transfer` event, seen from the point of view of `owner_address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub block_number: BlockNumber,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub token_address: Address,
    pub owner_address: Address,
    /// Negative when the owner sends tokens
    pub amount_transferred: I256,
}

/// Everything that must be read on chain to store one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDataParams {
    pub block_number: BlockNumber,
    pub token_address: Address,
    pub token_decimals: u32,
    pub owner_address: Address,
    pub share_rate: Option<ShareRateParams>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferData {
    pub block_datetime: DateTime<Utc>,
    /// Raw balance of the owner after the block
    pub balance: U256,
    pub share_rate: Decimal,
}
