use std::{collections::HashSet, fmt::Display, str::FromStr, sync::Arc};

use ethers::{
    types::Address,
    utils::{format_units, ParseUnits},
};
use rust_decimal::Decimal;
use tracing::{instrument, trace};

use crate::{
    metrics,
    storage::{BlockRow, InvestmentRow, PriceRow, RecordSink},
    types::{
        chain::Chain,
        product::Product,
        transfer::{Transfer, TransferDataParams},
    },
};

use super::{error::LoadError, TransferDataSource};

/// Stores everything derived from one transfer: block, investor, share rate and investment.
pub struct Loader {
    chain: Chain,
    transfer_data: Arc<dyn TransferDataSource>,
    sink: Arc<dyn RecordSink>,
    ignored_addresses: HashSet<Address>,
}

impl Loader {
    pub fn new(
        chain: Chain,
        transfer_data: Arc<dyn TransferDataSource>,
        sink: Arc<dyn RecordSink>,
        ignored_addresses: impl IntoIterator<Item = Address>,
    ) -> Self {
        Self {
            chain,
            transfer_data,
            sink,
            ignored_addresses: ignored_addresses.into_iter().collect(),
        }
    }

    /// Transfers from these owners are not investments.
    pub fn should_ignore(&self, product: &Product, owner: Address) -> bool {
        owner.is_zero()
            || owner == product.contract_address()
            || self.ignored_addresses.contains(&owner)
    }

    #[instrument(skip_all, fields(block = transfer.block_number, owner = ?transfer.owner_address))]
    pub async fn load_transfer(&self, product: &Product, transfer: &Transfer) -> Result<(), LoadError> {
        trace!("Loading transfer");
        let decimals = product.token_decimals();
        let params = TransferDataParams {
            block_number: transfer.block_number,
            token_address: transfer.token_address,
            token_decimals: decimals,
            owner_address: transfer.owner_address,
            share_rate: product.share_rate_params(),
        };
        let data = self.transfer_data.fetch_transfer_data(&params).await?;

        let balance = to_decimal(data.balance, decimals)?;
        let balance_diff = to_decimal(transfer.amount_transferred, decimals)?;
        let underlying_balance = mul(balance, data.share_rate)?;
        let underlying_diff = mul(balance_diff, data.share_rate)?;

        self.sink
            .upsert_block(BlockRow {
                chain: self.chain,
                block_number: transfer.block_number,
                datetime: data.block_datetime,
            })
            .await
            .map_err(LoadError::Store)?;

        let investor_id = self
            .sink
            .upsert_investor(transfer.owner_address)
            .await
            .map_err(LoadError::Store)?;

        self.sink
            .upsert_price(PriceRow {
                price_feed_id: product.price_feed_id_1,
                block_number: transfer.block_number,
                datetime: data.block_datetime,
                price: data.share_rate,
            })
            .await
            .map_err(LoadError::Store)?;

        self.sink
            .upsert_investment(InvestmentRow {
                product_id: product.product_id,
                investor_id,
                block_number: transfer.block_number,
                datetime: data.block_datetime,
                transaction_hash: transfer.transaction_hash,
                balance,
                balance_diff,
                underlying_balance,
                underlying_diff,
            })
            .await
            .map_err(LoadError::Store)?;

        metrics::RECORDS_LOADED.inc();
        Ok(())
    }
}

/// Scales a raw token amount down by `decimals`.
pub fn to_decimal<T>(value: T, decimals: u32) -> Result<Decimal, LoadError>
where
    T: Into<ParseUnits> + Display + Copy,
{
    let conversion_error = || LoadError::Conversion {
        value: value.to_string(),
        decimals,
    };
    let formatted = format_units(value, decimals).map_err(|_| conversion_error())?;
    Decimal::from_str(&formatted)
        .map(|d| d.normalize())
        .map_err(|_| conversion_error())
}

fn mul(amount: Decimal, rate: Decimal) -> Result<Decimal, LoadError> {
    amount
        .checked_mul(rate)
        .map(|d| d.normalize())
        .ok_or_else(|| LoadError::Conversion {
            value: format!("{amount} * {rate}"),
            decimals: 0,
        })
}
