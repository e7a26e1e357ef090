use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_rusqlite::{named_params, Connection, OptionalExtension};

use crate::types::range::{BlockNumber, RangeValue};

use super::ImportState;

pub type BlockImportState = ImportState<BlockNumber>;
pub type TimeImportState = ImportState<DateTime<Utc>>;

/// In-place change applied to one stored state.
pub type StateUpdate<T> = Box<dyn for<'a> FnOnce(&'a mut ImportState<T>) + Send>;

/// Persisted import states, keyed by import key.
///
/// `update` must be an atomic read-modify-write for its key.
#[async_trait]
pub trait ImportStateStore<T: RangeValue>: Send + Sync {
    async fn load(&self, import_key: &str) -> Result<Option<ImportState<T>>>;

    async fn save(&self, state: ImportState<T>) -> Result<()>;

    /// Applies `f` to the stored state. Keys without a state are left untouched.
    async fn update(
        &self,
        import_key: &str,
        f: StateUpdate<T>,
    ) -> Result<Option<ImportState<T>>>;

    /// Forgets everything about `import_key`, forcing a full re-import.
    async fn reset(&self, import_key: &str) -> Result<()>;
}

pub struct SqliteImportStateStore {
    db: Connection,
}

impl SqliteImportStateStore {
    pub async fn new(path: &str) -> Result<Self> {
        let db = Connection::open(path).await?;

        db.call(|db| {
            db.execute_batch(
                r"
                BEGIN;
                CREATE TABLE IF NOT EXISTS import_state(import_key TEXT PRIMARY KEY, import_data TEXT NOT NULL);
                COMMIT;",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self { db })
    }
}

/// States of every axis share one table, their keys never collide.
#[async_trait]
impl<T: RangeValue> ImportStateStore<T> for SqliteImportStateStore {
    async fn load(&self, import_key: &str) -> Result<Option<ImportState<T>>> {
        let import_key = import_key.to_owned();
        let raw: Option<String> = self
            .db
            .call(move |db| {
                let raw = db
                    .prepare_cached("SELECT import_data FROM import_state WHERE import_key = ?")
                    .expect("Couldn't prepare SELECT query")
                    .query_row([import_key], |row| row.get(0))
                    .optional()?;
                Ok(raw)
            })
            .await?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(From::from)
    }

    async fn save(&self, state: ImportState<T>) -> Result<()> {
        let import_key = state.import_key.clone();
        let import_data = serde_json::to_string(&state)?;
        self.db
            .call(move |db| {
                db.prepare_cached(
                    r"
                    INSERT INTO import_state(import_key, import_data) VALUES(:import_key, :import_data)
                    ON CONFLICT (import_key) DO UPDATE SET import_data = excluded.import_data",
                )
                .expect("Couldn't prepare INSERT query")
                .execute(named_params! {
                    ":import_key": import_key,
                    ":import_data": import_data,
                })?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn update(
        &self,
        import_key: &str,
        f: StateUpdate<T>,
    ) -> Result<Option<ImportState<T>>> {
        let import_key = import_key.to_owned();
        self.db
            .call(move |db| {
                let tx = db.transaction()?;
                let raw: Option<String> = tx
                    .query_row(
                        "SELECT import_data FROM import_state WHERE import_key = ?",
                        [&import_key],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(raw) = raw else {
                    return Ok(None);
                };
                let mut state: ImportState<T> = serde_json::from_str(&raw)
                    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
                f(&mut state);
                let updated = serde_json::to_string(&state)
                    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
                tx.execute(
                    "UPDATE import_state SET import_data = ? WHERE import_key = ?",
                    [&updated, &import_key],
                )?;
                tx.commit()?;
                Ok(Some(state))
            })
            .await
            .map_err(From::from)
    }

    async fn reset(&self, import_key: &str) -> Result<()> {
        let import_key = import_key.to_owned();
        self.db
            .call(move |db| {
                db.execute("DELETE FROM import_state WHERE import_key = ?", [import_key])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

pub struct MemoryImportStateStore<T = BlockNumber> {
    states: Mutex<HashMap<String, ImportState<T>>>,
}

impl<T> Default for MemoryImportStateStore<T> {
    fn default() -> Self {
        Self {
            states: Default::default(),
        }
    }
}

#[async_trait]
impl<T: RangeValue> ImportStateStore<T> for MemoryImportStateStore<T> {
    async fn load(&self, import_key: &str) -> Result<Option<ImportState<T>>> {
        Ok(self.states.lock().get(import_key).cloned())
    }

    async fn save(&self, state: ImportState<T>) -> Result<()> {
        self.states.lock().insert(state.import_key.clone(), state);
        Ok(())
    }

    async fn update(
        &self,
        import_key: &str,
        f: StateUpdate<T>,
    ) -> Result<Option<ImportState<T>>> {
        let mut states = self.states.lock();
        Ok(states.get_mut(import_key).map(|state| {
            f(state);
            state.clone()
        }))
    }

    async fn reset(&self, import_key: &str) -> Result<()> {
        self.states.lock().remove(import_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        import_state::RangeOutcome,
        types::{chain::Chain, range::Range},
    };

    fn state(key: &str) -> BlockImportState {
        ImportState::new(key.to_owned(), 1, Chain::Polygon, 100, None)
    }

    async fn check_store(store: &dyn ImportStateStore<BlockNumber>) {
        assert_eq!(store.load("a").await.unwrap(), None);
        assert_eq!(
            store
                .update("a", Box::new(|_: &mut BlockImportState| panic!("must not be called")))
                .await
                .unwrap(),
            None
        );

        store.save(state("a")).await.unwrap();
        store.save(state("b")).await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), Some(state("a")));

        let updated = store
            .update(
                "a",
                Box::new(|s: &mut BlockImportState| s.apply_result(&RangeOutcome::success(Range::new(100, 200).unwrap()))),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            updated.ranges.covered_ranges,
            vec![Range::new(100, 200).unwrap()]
        );
        let loaded = store.load("a").await.unwrap().unwrap();
        assert_eq!(loaded, updated);
        assert_eq!(
            store.load("b").await.unwrap().unwrap().ranges.covered_ranges,
            vec![]
        );

        store.reset("a").await.unwrap();
        assert_eq!(store.load("a").await.unwrap(), None);
        assert!(store.load("b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sqlite_store() {
        let store = SqliteImportStateStore::new(":memory:").await.unwrap();
        check_store(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_store_keeps_time_states() {
        let store = SqliteImportStateStore::new(":memory:").await.unwrap();
        let ms = |ms: i64| DateTime::<Utc>::from_timestamp_millis(ms).unwrap();
        let time_state =
            TimeImportState::new("t".to_owned(), 1, Chain::Polygon, ms(0), Some(ms(0)));
        ImportStateStore::<DateTime<Utc>>::save(&store, time_state).await.unwrap();
        ImportStateStore::<BlockNumber>::save(&store, state("b")).await.unwrap();

        let updated = ImportStateStore::<DateTime<Utc>>::update(
            &store,
            "t",
            Box::new(move |s: &mut TimeImportState| {
                s.apply_result(&RangeOutcome::failure(Range::new(ms(0), ms(899_999)).unwrap()))
            }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            updated.ranges.to_retry,
            vec![Range::new(ms(0), ms(899_999)).unwrap()]
        );
        let loaded = ImportStateStore::<DateTime<Utc>>::load(&store, "t").await.unwrap();
        assert_eq!(loaded, Some(updated));
        let blocks = ImportStateStore::<BlockNumber>::load(&store, "b").await.unwrap();
        assert_eq!(blocks, Some(state("b")));
    }

    #[tokio::test]
    async fn test_memory_store() {
        check_store(&MemoryImportStateStore::default()).await;
    }
}
