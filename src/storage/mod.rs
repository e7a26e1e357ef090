//! Rows produced by the load stage and where they end up.
//!
//! Every upsert is keyed by the natural identity of the row, so loading the same block
//! twice leaves a single copy behind.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::types::{chain::Chain, range::BlockNumber};

pub mod sqlite;

pub type InvestorId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub chain: Chain,
    pub block_number: BlockNumber,
    pub datetime: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceRow {
    pub price_feed_id: i64,
    pub block_number: BlockNumber,
    pub datetime: DateTime<Utc>,
    pub price: Decimal,
}

/// Position of one investor in one product right after a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvestmentRow {
    pub product_id: i64,
    pub investor_id: InvestorId,
    pub block_number: BlockNumber,
    pub datetime: DateTime<Utc>,
    pub transaction_hash: H256,
    /// In product shares
    pub balance: Decimal,
    pub balance_diff: Decimal,
    /// In underlying tokens
    pub underlying_balance: Decimal,
    pub underlying_diff: Decimal,
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert_block(&self, row: BlockRow) -> Result<()>;

    /// Returns the stable id of the investor, creating it on first sight.
    async fn upsert_investor(&self, address: Address) -> Result<InvestorId>;

    async fn upsert_price(&self, row: PriceRow) -> Result<()>;

    async fn upsert_investment(&self, row: InvestmentRow) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRecords {
    pub blocks: BTreeMap<(Chain, BlockNumber), BlockRow>,
    pub investors: HashMap<Address, InvestorId>,
    pub prices: BTreeMap<(i64, BlockNumber), PriceRow>,
    pub investments: BTreeMap<(i64, InvestorId, BlockNumber), InvestmentRow>,
}

#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<MemoryRecords>,
}

impl MemoryRecordSink {
    pub fn records(&self) -> MemoryRecords {
        self.records.lock().clone()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn upsert_block(&self, row: BlockRow) -> Result<()> {
        self.records
            .lock()
            .blocks
            .insert((row.chain, row.block_number), row);
        Ok(())
    }

    async fn upsert_investor(&self, address: Address) -> Result<InvestorId> {
        let mut records = self.records.lock();
        let next_id = records.investors.len() as InvestorId + 1;
        Ok(*records.investors.entry(address).or_insert(next_id))
    }

    async fn upsert_price(&self, row: PriceRow) -> Result<()> {
        self.records
            .lock()
            .prices
            .insert((row.price_feed_id, row.block_number), row);
        Ok(())
    }

    async fn upsert_investment(&self, row: InvestmentRow) -> Result<()> {
        self.records
            .lock()
            .investments
            .insert((row.product_id, row.investor_id, row.block_number), row);
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use chrono::TimeZone;

    use super::*;

    pub fn datetime(block_number: BlockNumber) -> DateTime<Utc> {
        Utc.timestamp_opt(1_600_000_000 + block_number as i64 * 3, 0)
            .unwrap()
    }

    pub fn investment(investor_id: InvestorId, block_number: BlockNumber) -> InvestmentRow {
        InvestmentRow {
            product_id: 1,
            investor_id,
            block_number,
            datetime: datetime(block_number),
            transaction_hash: H256::from_low_u64_be(block_number),
            balance: Decimal::new(15, 1),
            balance_diff: Decimal::new(5, 1),
            underlying_balance: Decimal::new(3, 0),
            underlying_diff: Decimal::new(1, 0),
        }
    }

    /// Checks upsert semantics shared by every sink.
    pub async fn check_sink(sink: &dyn RecordSink) {
        let alice = Address::from_low_u64_be(1);
        let bob = Address::from_low_u64_be(2);
        let alice_id = sink.upsert_investor(alice).await.unwrap();
        let bob_id = sink.upsert_investor(bob).await.unwrap();
        assert_ne!(alice_id, bob_id);
        assert_eq!(sink.upsert_investor(alice).await.unwrap(), alice_id);

        let block = BlockRow {
            chain: Chain::Bsc,
            block_number: 10,
            datetime: datetime(10),
        };
        sink.upsert_block(block.clone()).await.unwrap();
        sink.upsert_block(block).await.unwrap();

        let price = PriceRow {
            price_feed_id: 11,
            block_number: 10,
            datetime: datetime(10),
            price: Decimal::new(2, 0),
        };
        sink.upsert_price(price.clone()).await.unwrap();
        sink.upsert_price(price).await.unwrap();

        sink.upsert_investment(investment(alice_id, 10)).await.unwrap();
        sink.upsert_investment(investment(alice_id, 10)).await.unwrap();
        sink.upsert_investment(investment(bob_id, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemoryRecordSink::default();
        check_sink(&sink).await;
        let records = sink.records();
        assert_eq!(records.investors.len(), 2);
        assert_eq!(records.blocks.len(), 1);
        assert_eq!(records.prices.len(), 1);
        assert_eq!(records.investments.len(), 2);
    }
}
