//! SQLite destination table with insert-or-ignore accretion keyed by observation id.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use inat_core::ObservationRecord;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

/// Destination columns and their declared SQLite types, in insert order.
pub const DESTINATION_COLUMNS: [(&str, &str); 11] = [
    ("id", "INTEGER"),
    ("date", "TEXT"),
    ("genus", "TEXT"),
    ("species", "TEXT"),
    ("subspecies", "TEXT"),
    ("coords", "TEXT"),
    ("lat", "REAL"),
    ("long", "REAL"),
    ("locality", "TEXT"),
    ("introduced", "BOOLEAN"),
    ("qual_grade", "TEXT"),
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid table name {0:?}: use letters, digits and underscores, not starting with a digit")]
    InvalidTableName(String),
    #[error("table {table} exists with an incompatible schema: {detail}")]
    SchemaConflict { table: String, detail: String },
    #[error("creating database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// A table name safe to interpolate into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        let mut chars = raw.chars();
        let valid = match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        };
        if valid && !raw.to_ascii_lowercase().starts_with("sqlite_") {
            Ok(Self(raw.to_string()))
        } else {
            Err(StoreError::InvalidTableName(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TableName {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already existed and was left untouched.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageWriteStats {
    pub inserted: usize,
    pub ignored: usize,
}

impl PageWriteStats {
    fn record(&mut self, outcome: InsertOutcome) {
        match outcome {
            InsertOutcome::Inserted => self.inserted += 1,
            InsertOutcome::Ignored => self.ignored += 1,
        }
    }
}

#[async_trait]
pub trait AccretionStore: Send + Sync {
    /// Create the destination table when absent; fail on an incompatible existing one.
    async fn ensure_schema(&self, table: &TableName) -> Result<(), StoreError>;

    /// Insert unless a row with `record.id` exists. Both paths are success.
    async fn upsert_ignore(
        &self,
        table: &TableName,
        record: &ObservationRecord,
    ) -> Result<InsertOutcome, StoreError>;

    /// Insert-or-ignore a whole page atomically.
    async fn upsert_page(
        &self,
        table: &TableName,
        records: &[ObservationRecord],
    ) -> Result<PageWriteStats, StoreError>;

    async fn row_count(&self, table: &TableName) -> Result<u64, StoreError>;

    async fn contains(&self, table: &TableName, id: i64) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteAccretionStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl SqliteAccretionStore {
    /// Open `<data_dir>/<db_name>.db`, creating directory and file as needed.
    pub async fn open(data_dir: impl AsRef<Path>, db_name: &str) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|source| StoreError::Io {
                path: data_dir.to_path_buf(),
                source,
            })?;
        Self::open_path(data_dir.join(format!("{db_name}.db"))).await
    }

    pub async fn open_path(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        info!(path = %path.display(), "opened accretion database");
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn table_exists(&self, table: &TableName) -> Result<bool, StoreError> {
        let found: Option<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind(table.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn existing_columns(&self, table: &TableName) -> Result<Vec<ColumnInfo>, StoreError> {
        let rows = sqlx::query(&format!("PRAGMA table_info(\"{table}\")"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo, sqlx::Error> {
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    declared_type: row.try_get("type")?,
                    primary_key: row.try_get::<i64, _>("pk")? > 0,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    declared_type: String,
    primary_key: bool,
}

fn create_table_sql(table: &TableName) -> String {
    let columns = DESTINATION_COLUMNS
        .iter()
        .map(|(name, ty)| {
            if *name == "id" {
                format!("{name} {ty} PRIMARY KEY")
            } else {
                format!("{name} {ty}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS \"{table}\" ({columns})")
}

fn insert_sql(table: &TableName) -> String {
    let names = DESTINATION_COLUMNS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");
    let params = vec!["?"; DESTINATION_COLUMNS.len()].join(", ");
    format!("INSERT OR IGNORE INTO \"{table}\" ({names}) VALUES ({params})")
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    record: &'q ObservationRecord,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(record.id)
        .bind(record.date)
        .bind(record.genus.as_deref())
        .bind(record.species.as_deref())
        .bind(record.subspecies.as_deref())
        .bind(record.coords.as_deref())
        .bind(record.lat)
        .bind(record.long)
        .bind(record.locality.as_deref())
        .bind(record.introduced)
        .bind(record.qual_grade.as_deref())
}

fn outcome(rows_affected: u64) -> InsertOutcome {
    if rows_affected == 0 {
        InsertOutcome::Ignored
    } else {
        InsertOutcome::Inserted
    }
}

fn check_columns(table: &TableName, existing: &[ColumnInfo]) -> Result<(), StoreError> {
    for (name, ty) in DESTINATION_COLUMNS {
        let Some(column) = existing.iter().find(|c| c.name.eq_ignore_ascii_case(name)) else {
            return Err(StoreError::SchemaConflict {
                table: table.to_string(),
                detail: format!("missing column {name}"),
            });
        };
        if !column.declared_type.eq_ignore_ascii_case(ty) {
            return Err(StoreError::SchemaConflict {
                table: table.to_string(),
                detail: format!(
                    "column {name} is declared {} but {ty} is required",
                    column.declared_type
                ),
            });
        }
        if name == "id" && !column.primary_key {
            return Err(StoreError::SchemaConflict {
                table: table.to_string(),
                detail: "column id is not the primary key".to_string(),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl AccretionStore for SqliteAccretionStore {
    async fn ensure_schema(&self, table: &TableName) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql(table))
            .execute(&self.pool)
            .await?;
        let existing = self.existing_columns(table).await?;
        check_columns(table, &existing)?;
        info!(%table, db = %self.path.display(), "destination table ready");
        Ok(())
    }

    async fn upsert_ignore(
        &self,
        table: &TableName,
        record: &ObservationRecord,
    ) -> Result<InsertOutcome, StoreError> {
        let sql = insert_sql(table);
        let result = bind_record(sqlx::query(&sql), record)
            .execute(&self.pool)
            .await?;
        Ok(outcome(result.rows_affected()))
    }

    async fn upsert_page(
        &self,
        table: &TableName,
        records: &[ObservationRecord],
    ) -> Result<PageWriteStats, StoreError> {
        let sql = insert_sql(table);
        let mut stats = PageWriteStats::default();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let result = bind_record(sqlx::query(&sql), record)
                .execute(&mut *tx)
                .await?;
            stats.record(outcome(result.rows_affected()));
        }
        tx.commit().await?;
        debug!(%table, inserted = stats.inserted, ignored = stats.ignored, "page written");
        Ok(stats)
    }

    async fn row_count(&self, table: &TableName) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn contains(&self, table: &TableName, id: i64) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar(&format!("SELECT id FROM \"{table}\" WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn mamba() -> ObservationRecord {
        ObservationRecord {
            id: 509046,
            date: NaiveDate::from_ymd_opt(1988, 1, 2),
            genus: Some("Dendroaspis".into()),
            species: Some("polylepis".into()),
            subspecies: None,
            coords: Some("[-16.533578, 28.795252]".into()),
            lat: Some(-16.533578),
            long: Some(28.795252),
            locality: Some("Kariba".into()),
            introduced: Some(false),
            qual_grade: Some("research".into()),
        }
    }

    #[test]
    fn table_names_are_restricted_to_identifiers() {
        assert!(TableName::parse("zim_snakes").is_ok());
        assert!(TableName::parse("_t2").is_ok());
        assert!(TableName::parse("2snakes").is_err());
        assert!(TableName::parse("snakes; DROP TABLE x").is_err());
        assert!(TableName::parse("").is_err());
        assert!(TableName::parse("sqlite_master").is_err());
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteAccretionStore::open(dir.path().join("data"), "snakes")
            .await
            .expect("open");
        let table = TableName::parse("zimbabwe").expect("table");

        assert!(!store.table_exists(&table).await.expect("exists"));
        store.ensure_schema(&table).await.expect("first");
        store.ensure_schema(&table).await.expect("second");
        assert!(store.table_exists(&table).await.expect("exists"));
        assert_eq!(store.row_count(&table).await.expect("count"), 0);
        assert!(dir.path().join("data").join("snakes.db").exists());
    }

    #[tokio::test]
    async fn incompatible_existing_table_is_a_schema_conflict() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteAccretionStore::open(dir.path(), "snakes")
            .await
            .expect("open");
        sqlx::query("CREATE TABLE legacy (id TEXT PRIMARY KEY, date TEXT)")
            .execute(store.pool())
            .await
            .expect("seed legacy table");

        let err = store
            .ensure_schema(&TableName::parse("legacy").expect("table"))
            .await
            .expect_err("conflict");
        assert!(matches!(err, StoreError::SchemaConflict { .. }));
    }

    #[tokio::test]
    async fn upsert_ignore_twice_keeps_one_unchanged_row() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteAccretionStore::open(dir.path(), "snakes")
            .await
            .expect("open");
        let table = TableName::parse("zimbabwe").expect("table");
        store.ensure_schema(&table).await.expect("schema");

        let record = mamba();
        assert_eq!(
            store.upsert_ignore(&table, &record).await.expect("first"),
            InsertOutcome::Inserted
        );

        let mut changed = record.clone();
        changed.locality = Some("Somewhere else".into());
        assert_eq!(
            store.upsert_ignore(&table, &changed).await.expect("second"),
            InsertOutcome::Ignored
        );

        assert_eq!(store.row_count(&table).await.expect("count"), 1);
        let locality: Option<String> = sqlx::query_scalar(r#"SELECT locality FROM "zimbabwe" WHERE id = ?"#)
            .bind(record.id)
            .fetch_one(store.pool())
            .await
            .expect("locality");
        assert_eq!(locality.as_deref(), Some("Kariba"));
        let date: Option<String> = sqlx::query_scalar(r#"SELECT date FROM "zimbabwe" WHERE id = ?"#)
            .bind(record.id)
            .fetch_one(store.pool())
            .await
            .expect("date");
        assert_eq!(date.as_deref(), Some("1988-01-02"));
    }

    #[tokio::test]
    async fn page_writes_count_inserted_and_ignored_rows() {
        let dir = tempdir().expect("tempdir");
        let store = SqliteAccretionStore::open(dir.path(), "snakes")
            .await
            .expect("open");
        let table = TableName::parse("zimbabwe").expect("table");
        store.ensure_schema(&table).await.expect("schema");

        let first = mamba();
        let mut second = ObservationRecord::new(169856);
        second.genus = Some("Duberria".into());
        store.upsert_ignore(&table, &first).await.expect("seed");

        let stats = store
            .upsert_page(&table, &[first.clone(), second.clone(), second])
            .await
            .expect("page");
        assert_eq!(stats, PageWriteStats { inserted: 1, ignored: 2 });
        assert_eq!(store.row_count(&table).await.expect("count"), 2);
        assert!(store.contains(&table, 169856).await.expect("contains"));
        assert!(!store.contains(&table, 1).await.expect("absent"));
    }
}
