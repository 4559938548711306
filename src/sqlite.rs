//! SQLite backends: the transactional record store and the persistent
//! suggestion counters.
//!
//! Both share one connection behind a mutex. Work runs on tokio's blocking
//! pool, and the mutex serializes it, so a replace transaction is never
//! interleaved with a read.

use crate::cache::{CacheError, SuggestionCache};
use crate::config::STORE_TIMEOUT_SECS;
use crate::models::{
    Category, ElectionRecord, Municipality, Party, PartyVotes, ResultFilter, StoredRecord,
    PARTY_COUNT,
};
use crate::store::{CheckedQuery, RecordStore, StoreError, TextField};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const TABLE: &str = "zgjedhjet";
const COUNTERS_TABLE: &str = "suggestion_counters";
const TEXT_COLUMNS: [&str; 4] = ["kategoria", "komuna", "qendra_e_votimit", "vendvotimi"];

/// Rows between deadline checks while inserting.
const DEADLINE_CHECK_INTERVAL: usize = 1000;

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::database(e.to_string())
}

async fn with_connection<T, E, F>(
    conn: &Arc<Mutex<Connection>>,
    lift: fn(String) -> E,
    f: F,
) -> Result<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
{
    let conn = Arc::clone(conn);
    tokio::task::spawn_blocking(move || {
        let mut guard = conn
            .lock()
            .map_err(|_| lift("SQLite connection mutex poisoned".to_string()))?;
        f(&mut guard)
    })
    .await
    .map_err(|e| lift(format!("SQLite task failed: {e}")))?
}

fn schema_sql() -> String {
    let party_columns: Vec<String> = Party::ALL
        .iter()
        .map(|p| {
            let col = p.field_name();
            format!("    {col} INTEGER NOT NULL DEFAULT 0 CHECK ({col} >= 0)")
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {TABLE} (
    id INTEGER PRIMARY KEY,
    kategoria TEXT NOT NULL,
    komuna TEXT NOT NULL,
    qendra_e_votimit TEXT NOT NULL DEFAULT '',
    vendvotimi TEXT NOT NULL DEFAULT '',
{}
);
CREATE INDEX IF NOT EXISTS idx_{TABLE}_filters ON {TABLE}(kategoria, komuna);
CREATE INDEX IF NOT EXISTS idx_{TABLE}_qendra ON {TABLE}(qendra_e_votimit);
CREATE INDEX IF NOT EXISTS idx_{TABLE}_vendvotimi ON {TABLE}(vendvotimi);
CREATE TABLE IF NOT EXISTS {COUNTERS_TABLE} (
    hash TEXT NOT NULL,
    field TEXT NOT NULL,
    hits INTEGER NOT NULL,
    PRIMARY KEY (hash, field)
);",
        party_columns.join(",\n")
    )
}

fn all_columns() -> Vec<String> {
    TEXT_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(Party::ALL.iter().map(|p| p.field_name()))
        .collect()
}

fn insert_sql() -> String {
    let columns = all_columns();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {TABLE} ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn select_sql(where_clause: &str) -> String {
    format!(
        "SELECT id, {} FROM {TABLE}{where_clause} ORDER BY id",
        all_columns().join(", ")
    )
}

fn record_params(record: &ElectionRecord) -> Vec<SqlValue> {
    let mut values = Vec::with_capacity(TEXT_COLUMNS.len() + PARTY_COUNT);
    values.push(SqlValue::Text(record.category.as_str().to_string()));
    values.push(SqlValue::Text(record.municipality.as_str().to_string()));
    values.push(SqlValue::Text(record.polling_center.clone()));
    values.push(SqlValue::Text(record.polling_place.clone()));
    values.extend(record.votes.iter().map(|(_, v)| SqlValue::Integer(i64::from(v))));
    values
}

/// Builds the WHERE clause for a filter. The party filter does not restrict rows.
fn filter_clause(filter: &ResultFilter) -> (String, Vec<SqlValue>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(category) = filter.category {
        values.push(SqlValue::Text(category.as_str().to_string()));
        conditions.push(format!("kategoria = ?{}", values.len()));
    }
    if let Some(municipality) = filter.municipality {
        values.push(SqlValue::Text(municipality.as_str().to_string()));
        conditions.push(format!("komuna = ?{}", values.len()));
    }
    if let Some(ref center) = filter.polling_center {
        values.push(SqlValue::Text(center.clone()));
        conditions.push(format!("qendra_e_votimit = ?{}", values.len()));
    }
    if let Some(ref place) = filter.polling_place {
        values.push(SqlValue::Text(place.clone()));
        conditions.push(format!("vendvotimi = ?{}", values.len()));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

struct RawRow {
    id: i64,
    kategoria: String,
    komuna: String,
    qendra_e_votimit: String,
    vendvotimi: String,
    votes: [i64; PARTY_COUNT],
}

impl RawRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut votes = [0i64; PARTY_COUNT];
        for (i, slot) in votes.iter_mut().enumerate() {
            *slot = row.get(1 + TEXT_COLUMNS.len() + i)?;
        }
        Ok(Self {
            id: row.get(0)?,
            kategoria: row.get(1)?,
            komuna: row.get(2)?,
            qendra_e_votimit: row.get(3)?,
            vendvotimi: row.get(4)?,
            votes,
        })
    }

    fn into_stored(self) -> Result<StoredRecord, StoreError> {
        let id = self.id;
        let category: Category = self
            .kategoria
            .parse()
            .map_err(|e| StoreError::corrupt_row(id, format!("{e}")))?;
        let municipality: Municipality = self
            .komuna
            .parse()
            .map_err(|e| StoreError::corrupt_row(id, format!("{e}")))?;

        let mut votes = PartyVotes::default();
        for party in Party::ALL {
            let raw = self.votes[party.index()];
            let value = u32::try_from(raw).map_err(|_| {
                StoreError::corrupt_row(id, format!("{} out of range: {raw}", party.as_str()))
            })?;
            votes.set(*party, value);
        }

        Ok(StoredRecord {
            id,
            record: ElectionRecord {
                category,
                municipality,
                polling_center: self.qendra_e_votimit,
                polling_place: self.vendvotimi,
                votes,
            },
        })
    }
}

fn load_rows(
    conn: &Connection,
    where_clause: &str,
    values: Vec<SqlValue>,
) -> Result<Vec<StoredRecord>, StoreError> {
    let mut stmt = conn.prepare(&select_sql(where_clause)).map_err(db_err)?;
    let raw: Vec<RawRow> = stmt
        .query_map(params_from_iter(values), RawRow::read)
        .map_err(db_err)?
        .collect::<rusqlite::Result<_>>()
        .map_err(db_err)?;
    raw.into_iter().map(RawRow::into_stored).collect()
}

fn value_exists(conn: &Connection, field: TextField, value: &str) -> Result<bool, StoreError> {
    let column = match field {
        TextField::PollingCenter => "qendra_e_votimit",
        TextField::PollingPlace => "vendvotimi",
    };
    conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {TABLE} WHERE {column} = ?1)"),
        params![value],
        |row| row.get::<_, bool>(0),
    )
    .map_err(db_err)
}

/// Record store on a single SQLite database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    transaction_timeout: Duration,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::connection(format!(
                    "Failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::connection(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        info!(path = %path.display(), "Opened SQLite record store");
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::connection(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let transaction_timeout = Duration::from_secs(STORE_TIMEOUT_SECS);
        conn.busy_timeout(transaction_timeout).map_err(db_err)?;
        conn.execute_batch(&schema_sql()).map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            transaction_timeout,
        })
    }

    /// Bound on the replace transaction. Past it the transaction is rolled back.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    /// Suggestion counters stored in the same database.
    pub fn suggestion_cache(&self) -> SqliteCache {
        SqliteCache {
            conn: Arc::clone(&self.conn),
        }
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn replace_all(&self, records: Vec<ElectionRecord>) -> Result<usize, StoreError> {
        let timeout = self.transaction_timeout;
        with_connection(&self.conn, StoreError::ConnectionError, move |conn| {
            let started = Instant::now();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let deleted = tx
                .execute(&format!("DELETE FROM {TABLE}"), [])
                .map_err(db_err)?;

            {
                let mut stmt = tx.prepare(&insert_sql()).map_err(db_err)?;
                for (i, record) in records.iter().enumerate() {
                    stmt.execute(params_from_iter(record_params(record)))
                        .map_err(db_err)?;
                    if i % DEADLINE_CHECK_INTERVAL == 0 && started.elapsed() > timeout {
                        return Err(StoreError::database(format!(
                            "replace exceeded {}s after {i} rows, rolled back",
                            timeout.as_secs()
                        )));
                    }
                }
            }

            if started.elapsed() > timeout {
                return Err(StoreError::database(format!(
                    "replace exceeded {}s before commit, rolled back",
                    timeout.as_secs()
                )));
            }
            tx.commit().map_err(db_err)?;
            debug!(
                deleted,
                inserted = records.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Dataset replaced"
            );
            Ok(records.len())
        })
        .await
    }

    async fn query(&self, filter: &ResultFilter) -> Result<Vec<ElectionRecord>, StoreError> {
        let (where_clause, values) = filter_clause(filter);
        let rows = with_connection(&self.conn, StoreError::ConnectionError, move |conn| {
            load_rows(conn, &where_clause, values)
        })
        .await?;
        Ok(rows.into_iter().map(|r| r.record).collect())
    }

    async fn query_checked(&self, filter: &ResultFilter) -> Result<CheckedQuery, StoreError> {
        let filter = filter.clone();
        with_connection(&self.conn, StoreError::ConnectionError, move |conn| {
            // Checks and select read one snapshot
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Deferred)
                .map_err(db_err)?;

            let checks = [
                (TextField::PollingCenter, filter.polling_center.as_deref()),
                (TextField::PollingPlace, filter.polling_place.as_deref()),
            ];
            for (field, value) in checks {
                if let Some(value) = value {
                    if !value_exists(&tx, field, value)? {
                        return Ok(CheckedQuery::Missing(field));
                    }
                }
            }

            let (where_clause, values) = filter_clause(&filter);
            let rows = load_rows(&tx, &where_clause, values)?;
            tx.commit().map_err(db_err)?;
            Ok(CheckedQuery::Records(rows.into_iter().map(|r| r.record).collect()))
        })
        .await
    }

    async fn snapshot(&self) -> Result<Vec<StoredRecord>, StoreError> {
        with_connection(&self.conn, StoreError::ConnectionError, |conn| {
            load_rows(conn, "", Vec::new())
        })
        .await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = with_connection(&self.conn, StoreError::ConnectionError, |conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {TABLE}"), [], |row| row.get(0))
                .map_err(db_err)
        })
        .await?;
        Ok(count.max(0) as usize)
    }
}

/// Suggestion counters in the `suggestion_counters` table. Each increment is a
/// single upsert statement, so concurrent increments never lose updates.
#[derive(Clone)]
pub struct SqliteCache {
    conn: Arc<Mutex<Connection>>,
}

#[async_trait]
impl SuggestionCache for SqliteCache {
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, CacheError> {
        let (key, field) = (key.to_string(), field.to_string());
        with_connection(&self.conn, CacheError::ConnectionError, move |conn| {
            conn.query_row(
                &format!(
                    "INSERT INTO {COUNTERS_TABLE} (hash, field, hits) VALUES (?1, ?2, ?3)
                     ON CONFLICT(hash, field) DO UPDATE SET hits = hits + excluded.hits
                     RETURNING hits"
                ),
                params![key, field, delta],
                |row| row.get(0),
            )
            .map_err(|e| CacheError::command(e.to_string()))
        })
        .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>, CacheError> {
        let key = key.to_string();
        with_connection(&self.conn, CacheError::ConnectionError, move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT field, hits FROM {COUNTERS_TABLE} WHERE hash = ?1"
                ))
                .map_err(|e| CacheError::command(e.to_string()))?;
            let rows = stmt
                .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| CacheError::command(e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<(String, i64)>>>()
                .map_err(|e| CacheError::command(e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(category: Category, municipality: Municipality, center: &str, p111: u32) -> ElectionRecord {
        ElectionRecord::new(category, municipality)
            .with_polling_center(center)
            .with_polling_place("1")
            .with_votes(Party::Partia111, p111)
    }

    #[tokio::test]
    async fn replace_then_query_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let input = vec![
            record(Category::Local, Municipality::Peje, "Shkolla A", 10)
                .with_votes(Party::Partia138, 4_000_000_000),
            record(Category::Postal, Municipality::Viti, "Shkolla B", 25),
        ];
        assert_eq!(store.replace_all(input.clone()).await.unwrap(), 2);

        let all = store.query(&ResultFilter::new()).await.unwrap();
        assert_eq!(all, input);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replace_discards_previous_dataset() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_all(vec![record(Category::Local, Municipality::Peje, "Old", 1)])
            .await
            .unwrap();
        store
            .replace_all(vec![
                record(Category::Local, Municipality::Viti, "New 1", 2),
                record(Category::Local, Municipality::Viti, "New 2", 3),
            ])
            .await
            .unwrap();

        let all = store.query(&ResultFilter::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|r| r.polling_center.starts_with("New")));
        let old = store
            .query_checked(&ResultFilter::new().with_polling_center("Old"))
            .await
            .unwrap();
        assert_eq!(old, CheckedQuery::Missing(TextField::PollingCenter));
    }

    #[tokio::test]
    async fn failed_replace_rolls_back() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_all(vec![record(Category::Local, Municipality::Peje, "Kept", 1)])
            .await
            .unwrap();

        store
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_boom BEFORE INSERT ON zgjedhjet
                 WHEN NEW.qendra_e_votimit = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'boom rejected'); END;",
            )
            .unwrap();

        let result = store
            .replace_all(vec![
                record(Category::Local, Municipality::Viti, "fine", 2),
                record(Category::Local, Municipality::Viti, "boom", 3),
            ])
            .await;
        assert!(matches!(result, Err(StoreError::DatabaseError(_))));

        let all = store.query(&ResultFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].polling_center, "Kept");
    }

    #[tokio::test]
    async fn replace_past_deadline_rolls_back() {
        let store = SqliteStore::open_in_memory()
            .unwrap()
            .with_transaction_timeout(Duration::from_secs(60));
        store
            .replace_all(vec![record(Category::Local, Municipality::Peje, "Kept", 1)])
            .await
            .unwrap();

        let store = store.with_transaction_timeout(Duration::ZERO);
        let result = store
            .replace_all(vec![
                record(Category::Local, Municipality::Viti, "New 1", 2),
                record(Category::Local, Municipality::Viti, "New 2", 3),
            ])
            .await;
        match result {
            Err(StoreError::DatabaseError(msg)) => assert!(msg.contains("rolled back")),
            other => panic!("expected a rolled back replace, got {other:?}"),
        }

        // An empty batch still hits the check before commit
        assert!(store.replace_all(Vec::new()).await.is_err());

        let all = store.query(&ResultFilter::new()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].polling_center, "Kept");
    }

    #[tokio::test]
    async fn query_applies_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_all(vec![
                record(Category::Local, Municipality::Peje, "A", 1),
                record(Category::Local, Municipality::Viti, "A", 2),
                record(Category::Postal, Municipality::Peje, "B", 3),
            ])
            .await
            .unwrap();

        let local = store
            .query(&ResultFilter::new().with_category(Category::Local))
            .await
            .unwrap();
        assert_eq!(local.len(), 2);

        let peje_a = store
            .query(
                &ResultFilter::new()
                    .with_municipality(Municipality::Peje)
                    .with_polling_center("A"),
            )
            .await
            .unwrap();
        assert_eq!(peje_a.len(), 1);
        assert_eq!(peje_a[0].votes.get(Party::Partia111), 1);

        // Party filter never restricts rows
        let by_party = store
            .query(&ResultFilter::new().with_party(Party::Partia120))
            .await
            .unwrap();
        assert_eq!(by_party.len(), 3);
    }

    #[tokio::test]
    async fn query_checked_is_exact_match() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_all(vec![
                record(Category::Local, Municipality::Peje, "Shkolla A", 1),
                record(Category::Postal, Municipality::Viti, "Shkolla B", 2),
            ])
            .await
            .unwrap();

        let found = store
            .query_checked(&ResultFilter::new().with_polling_center("Shkolla A"))
            .await
            .unwrap();
        assert!(matches!(found, CheckedQuery::Records(ref rows) if rows.len() == 1));

        let missing = store
            .query_checked(&ResultFilter::new().with_polling_center("shkolla a"))
            .await
            .unwrap();
        assert_eq!(missing, CheckedQuery::Missing(TextField::PollingCenter));

        let missing = store
            .query_checked(&ResultFilter::new().with_polling_place("2"))
            .await
            .unwrap();
        assert_eq!(missing, CheckedQuery::Missing(TextField::PollingPlace));

        // Existence ignores the other filters
        let empty = store
            .query_checked(
                &ResultFilter::new()
                    .with_category(Category::Postal)
                    .with_polling_center("Shkolla A"),
            )
            .await
            .unwrap();
        assert_eq!(empty, CheckedQuery::Records(Vec::new()));
    }

    #[tokio::test]
    async fn snapshot_carries_row_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_all(vec![
                record(Category::Local, Municipality::Peje, "A", 1),
                record(Category::Local, Municipality::Peje, "B", 2),
            ])
            .await
            .unwrap();

        let rows = store.snapshot().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id < rows[1].id);
        assert_eq!(rows[1].record.polling_center, "B");
    }

    #[tokio::test]
    async fn file_store_persists_between_opens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("results.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .replace_all(vec![record(Category::Local, Municipality::Peje, "A", 9)])
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sqlite_cache_upserts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cache = store.suggestion_cache();
        assert_eq!(cache.hash_increment("suggestions", "Peje", 1).await.unwrap(), 1);
        assert_eq!(cache.hash_increment("suggestions", "Peje", 1).await.unwrap(), 2);
        assert_eq!(cache.hash_increment("other", "Peje", 5).await.unwrap(), 5);

        let all = cache.hash_get_all("suggestions").await.unwrap();
        assert_eq!(all, vec![("Peje".to_string(), 2)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_cache_concurrent_increments() {
        let store = SqliteStore::open_in_memory().unwrap();
        let cache = store.suggestion_cache();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.hash_increment("suggestions", "Gjilan", 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(
            cache.hash_get_all("suggestions").await.unwrap(),
            vec![("Gjilan".to_string(), 50)]
        );
    }
}
