use anyhow::Result;
use async_trait::async_trait;
use ethers::types::Address;
use tokio_rusqlite::{named_params, Connection};

use super::{BlockRow, InvestmentRow, InvestorId, PriceRow, RecordSink};

pub struct SqliteRecordSink {
    db: Connection,
}

impl SqliteRecordSink {
    pub async fn new(path: &str) -> Result<Self> {
        let db = Connection::open(path).await?;

        db.call(|db| {
            // datetimes are RFC 3339 strings, amounts are decimal strings
            db.execute_batch(r"
                BEGIN;
                CREATE TABLE IF NOT EXISTS block(chain TEXT NOT NULL, block_number INTEGER NOT NULL, datetime TEXT NOT NULL, PRIMARY KEY (chain, block_number));
                CREATE TABLE IF NOT EXISTS investor(investor_id INTEGER PRIMARY KEY AUTOINCREMENT, address TEXT NOT NULL UNIQUE);
                CREATE TABLE IF NOT EXISTS price(price_feed_id INTEGER NOT NULL, block_number INTEGER NOT NULL, datetime TEXT NOT NULL, price TEXT NOT NULL, PRIMARY KEY (price_feed_id, block_number));
                CREATE TABLE IF NOT EXISTS investment(
                    product_id INTEGER NOT NULL,
                    investor_id INTEGER NOT NULL REFERENCES investor(investor_id),
                    block_number INTEGER NOT NULL,
                    datetime TEXT NOT NULL,
                    transaction_hash TEXT NOT NULL,
                    balance TEXT NOT NULL,
                    balance_diff TEXT NOT NULL,
                    underlying_balance TEXT NOT NULL,
                    underlying_diff TEXT NOT NULL,
                    PRIMARY KEY (product_id, investor_id, block_number)
                );
                CREATE INDEX IF NOT EXISTS idx_investment_datetime ON investment(datetime);
                COMMIT;"
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { db })
    }
}

#[async_trait]
impl RecordSink for SqliteRecordSink {
    async fn upsert_block(&self, row: BlockRow) -> Result<()> {
        self.db
            .call(move |db| {
                db.prepare_cached(
                    r"
                    INSERT INTO block(chain, block_number, datetime) VALUES(:chain, :block_number, :datetime)
                    ON CONFLICT (chain, block_number) DO UPDATE SET datetime = excluded.datetime",
                )
                .expect("Couldn't prepare block upsert")
                .execute(named_params! {
                    ":chain": row.chain.as_str(),
                    ":block_number": row.block_number,
                    ":datetime": row.datetime.to_rfc3339(),
                })?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn upsert_investor(&self, address: Address) -> Result<InvestorId> {
        let address = format!("{address:#x}");
        let id = self
            .db
            .call(move |db| {
                db.prepare_cached("INSERT INTO investor(address) VALUES(?) ON CONFLICT (address) DO NOTHING")
                    .expect("Couldn't prepare investor upsert")
                    .execute([&address])?;
                let id = db
                    .prepare_cached("SELECT investor_id FROM investor WHERE address = ?")
                    .expect("Couldn't prepare investor query")
                    .query_row([&address], |row| row.get(0))?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    async fn upsert_price(&self, row: PriceRow) -> Result<()> {
        self.db
            .call(move |db| {
                db.prepare_cached(
                    r"
                    INSERT INTO price(price_feed_id, block_number, datetime, price) VALUES(:price_feed_id, :block_number, :datetime, :price)
                    ON CONFLICT (price_feed_id, block_number) DO UPDATE SET datetime = excluded.datetime, price = excluded.price",
                )
                .expect("Couldn't prepare price upsert")
                .execute(named_params! {
                    ":price_feed_id": row.price_feed_id,
                    ":block_number": row.block_number,
                    ":datetime": row.datetime.to_rfc3339(),
                    ":price": row.price.to_string(),
                })?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn upsert_investment(&self, row: InvestmentRow) -> Result<()> {
        self.db
            .call(move |db| {
                db.prepare_cached(
                    r"
                    INSERT INTO investment(product_id, investor_id, block_number, datetime, transaction_hash, balance, balance_diff, underlying_balance, underlying_diff)
                    VALUES(:product_id, :investor_id, :block_number, :datetime, :transaction_hash, :balance, :balance_diff, :underlying_balance, :underlying_diff)
                    ON CONFLICT (product_id, investor_id, block_number) DO UPDATE SET
                        datetime = excluded.datetime,
                        transaction_hash = excluded.transaction_hash,
                        balance = excluded.balance,
                        balance_diff = excluded.balance_diff,
                        underlying_balance = excluded.underlying_balance,
                        underlying_diff = excluded.underlying_diff",
                )
                .expect("Couldn't prepare investment upsert")
                .execute(named_params! {
                    ":product_id": row.product_id,
                    ":investor_id": row.investor_id,
                    ":block_number": row.block_number,
                    ":datetime": row.datetime.to_rfc3339(),
                    ":transaction_hash": format!("{:#x}", row.transaction_hash),
                    ":balance": row.balance.to_string(),
                    ":balance_diff": row.balance_diff.to_string(),
                    ":underlying_balance": row.underlying_balance.to_string(),
                    ":underlying_diff": row.underlying_diff.to_string(),
                })?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{check_sink, investment};

    async fn count(sink: &SqliteRecordSink, table: &'static str) -> i64 {
        sink.db
            .call(move |db| {
                let count = db.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
                Ok(count)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_sink() {
        let sink = SqliteRecordSink::new(":memory:").await.unwrap();
        check_sink(&sink).await;
        assert_eq!(count(&sink, "investor").await, 2);
        assert_eq!(count(&sink, "block").await, 1);
        assert_eq!(count(&sink, "price").await, 1);
        assert_eq!(count(&sink, "investment").await, 2);
    }

    #[tokio::test]
    async fn test_investment_is_updated_in_place() {
        let sink = SqliteRecordSink::new(":memory:").await.unwrap();
        let investor_id = sink
            .upsert_investor(Address::from_low_u64_be(7))
            .await
            .unwrap();
        sink.upsert_investment(investment(investor_id, 5)).await.unwrap();
        let mut updated = investment(investor_id, 5);
        updated.balance = rust_decimal::Decimal::new(42, 0);
        sink.upsert_investment(updated).await.unwrap();

        let balance: String = sink
            .db
            .call(|db| {
                let balance = db.query_row("SELECT balance FROM investment", [], |row| row.get(0))?;
                Ok(balance)
            })
            .await
            .unwrap();
        assert_eq!(balance, "42");
        assert_eq!(count(&sink, "investment").await, 1);
    }
}
