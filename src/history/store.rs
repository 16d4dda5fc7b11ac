//! SQLite-backed history store.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use super::{Axis, HistoryError, HistoryRecord};
use crate::fingerprint::Fingerprint;
use crate::graph::TaskKey;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS task_history (
    scope        TEXT NOT NULL,
    task_key     TEXT NOT NULL,
    axis         TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    updated_at   TEXT NOT NULL,

    PRIMARY KEY (scope, task_key, axis)
);
"#;

const UPSERT_SQL: &str = "INSERT INTO task_history (scope, task_key, axis, fingerprint, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(scope, task_key, axis) DO UPDATE SET
         fingerprint = excluded.fingerprint,
         updated_at = excluded.updated_at";

/// Fingerprint history for one process identity (`scope`).
///
/// Cloning is cheap; clones share the connection pool.
#[derive(Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
    scope: String,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl HistoryStore {
    /// Opens (creating if missing) the history database at `path`.
    pub async fn open(path: &Path, scope: impl Into<String>) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HistoryError::Open {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
        }

        // A filename, not a URL: '#', '?' and '%' in the path are literal.
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| HistoryError::Open {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        let store = Self {
            pool,
            scope: scope.into(),
        };
        tracing::info!(path = %path.display(), scope = %store.scope, "History store opened");
        Ok(store)
    }

    /// Opens a private in-memory store. Nothing survives the process.
    pub async fn open_in_memory(scope: impl Into<String>) -> Result<Self, HistoryError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection to `:memory:` is a separate database, so the pool
        // must hold exactly one connection for its whole lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        Ok(Self {
            pool,
            scope: scope.into(),
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns the last fingerprint recorded for `key` on `axis`.
    pub async fn get(&self, key: &TaskKey, axis: Axis) -> Result<Option<Fingerprint>, HistoryError> {
        let row = sqlx::query(
            "SELECT fingerprint FROM task_history WHERE scope = ?1 AND task_key = ?2 AND axis = ?3",
        )
        .bind(&self.scope)
        .bind(key.to_string())
        .bind(axis.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Fingerprint::new(r.get::<String, _>("fingerprint"))))
    }

    /// Records `fingerprint` as completed for `key` on `axis`.
    pub async fn set(
        &self,
        key: &TaskKey,
        axis: Axis,
        fingerprint: &Fingerprint,
    ) -> Result<(), HistoryError> {
        sqlx::query(UPSERT_SQL)
            .bind(&self.scope)
            .bind(key.to_string())
            .bind(axis.as_str())
            .bind(fingerprint.as_str())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records every axis of a task in one transaction.
    pub async fn set_all(
        &self,
        key: &TaskKey,
        fingerprints: &[(Axis, Fingerprint)],
    ) -> Result<(), HistoryError> {
        let key = key.to_string();
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        for (axis, fingerprint) in fingerprints {
            sqlx::query(UPSERT_SQL)
                .bind(&self.scope)
                .bind(&key)
                .bind(axis.as_str())
                .bind(fingerprint.as_str())
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Lists every record in this scope, ordered by task key then axis.
    pub async fn records(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let rows = sqlx::query(
            "SELECT task_key, axis, fingerprint, updated_at FROM task_history
             WHERE scope = ?1 ORDER BY task_key, axis",
        )
        .bind(&self.scope)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let axis: String = row.try_get("axis")?;
            let updated_at: String = row.try_get("updated_at")?;
            records.push(HistoryRecord {
                task_key: row.try_get("task_key")?,
                axis: axis.parse()?,
                fingerprint: Fingerprint::new(row.try_get::<String, _>("fingerprint")?),
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Stage;

    fn key(component: &str) -> TaskKey {
        TaskKey::new("obj_det", "voc", "2012", component, Stage::Train)
    }

    #[tokio::test]
    async fn test_fresh_store_is_empty() {
        let store = HistoryStore::open_in_memory("test").await.unwrap();
        assert!(store.get(&key("yolo"), Axis::Source).await.unwrap().is_none());
        assert!(store.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_then_get_per_axis() {
        let store = HistoryStore::open_in_memory("test").await.unwrap();
        let k = key("yolo");

        store.set(&k, Axis::Source, &Fingerprint::from("h1")).await.unwrap();
        assert_eq!(
            store.get(&k, Axis::Source).await.unwrap(),
            Some(Fingerprint::from("h1"))
        );
        assert!(store.get(&k, Axis::Revision).await.unwrap().is_none());

        store.set(&k, Axis::Source, &Fingerprint::from("h2")).await.unwrap();
        assert_eq!(
            store.get(&k, Axis::Source).await.unwrap(),
            Some(Fingerprint::from("h2"))
        );
    }

    #[tokio::test]
    async fn test_set_all_writes_every_axis() {
        let store = HistoryStore::open_in_memory("test").await.unwrap();
        let k = key("vote");
        store
            .set_all(
                &k,
                &[
                    (Axis::Revision, Fingerprint::from("r1")),
                    (Axis::Source, Fingerprint::from("h1")),
                    (Axis::Upstream, Fingerprint::from("u1")),
                ],
            )
            .await
            .unwrap();

        let records = store.records().await.unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.task_key == k.to_string()));
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let a = HistoryStore::open(&path, "a").await.unwrap();
        let b = HistoryStore::open(&path, "b").await.unwrap();

        a.set(&key("yolo"), Axis::Revision, &Fingerprint::from("r1"))
            .await
            .unwrap();
        assert!(b.get(&key("yolo"), Axis::Revision).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_path_with_url_metacharacters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run #1?v=2").join("hist%20#1.db");

        let store = HistoryStore::open(&path, "test").await.unwrap();
        store
            .set(&key("yolo"), Axis::Source, &Fingerprint::from("h1"))
            .await
            .unwrap();
        drop(store);

        assert!(path.is_file());
        let reopened = HistoryStore::open(&path, "test").await.unwrap();
        assert_eq!(
            reopened.get(&key("yolo"), Axis::Source).await.unwrap(),
            Some(Fingerprint::from("h1"))
        );
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        {
            let store = HistoryStore::open(&path, "mlops-forge").await.unwrap();
            store
                .set(&key("yolo"), Axis::Revision, &Fingerprint::from("r1"))
                .await
                .unwrap();
            store.pool.close().await;
        }

        let reopened = HistoryStore::open(&path, "mlops-forge").await.unwrap();
        assert_eq!(
            reopened.get(&key("yolo"), Axis::Revision).await.unwrap(),
            Some(Fingerprint::from("r1"))
        );
    }
}
