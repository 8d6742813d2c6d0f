//! SQLite 文档存储（sqlx，完全异步）
//!
//! 单表 `documents(collection, id, user_id, body, version)`；user_id 从文档体提取，
//! 用于把按用户过滤下推到 SQL，其余条件在内存中用 `evaluate` 计算。

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{evaluate, Collection, Document, DocumentStore, ScoredDocument, StoreQuery};
use crate::core::error::{BackendKind, MemoryError, MemoryResult};

pub struct SqliteStore {
    pool: SqlitePool,
}

fn map_sqlx(e: sqlx::Error) -> MemoryError {
    match e {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            MemoryError::transient(BackendKind::Store, e.to_string())
        }
        other => MemoryError::Store(other.to_string()),
    }
}

impl SqliteStore {
    pub async fn new(db_path: impl AsRef<Path>) -> MemoryResult<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(map_sqlx)?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_tables(&self) -> MemoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                user_id TEXT,
                body TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_user ON documents(collection, user_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn user_of(doc: &Document) -> Option<String> {
        doc.field("user_id")
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    fn decode_row(row: &sqlx::sqlite::SqliteRow) -> MemoryResult<Document> {
        let id: String = row.get("id");
        let body: String = row.get("body");
        let version: i64 = row.get("version");
        Ok(Document {
            id,
            body: serde_json::from_str(&body)?,
            version: version as u64,
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert(&self, collection: Collection, doc: Document) -> MemoryResult<String> {
        let body = serde_json::to_string(&doc.body)?;
        sqlx::query(
            "INSERT INTO documents (collection, id, user_id, body, version) VALUES (?, ?, ?, ?, 1)
             ON CONFLICT(collection, id) DO UPDATE SET
                user_id = excluded.user_id,
                body = excluded.body,
                version = documents.version + 1",
        )
        .bind(collection.name())
        .bind(&doc.id)
        .bind(Self::user_of(&doc))
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(doc.id)
    }

    async fn get(&self, collection: Collection, id: &str) -> MemoryResult<Option<Document>> {
        let row = sqlx::query("SELECT id, body, version FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.name())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn query(
        &self,
        collection: Collection,
        query: &StoreQuery,
        top_k: usize,
    ) -> MemoryResult<Vec<ScoredDocument>> {
        let user_filter = query
            .filters
            .iter()
            .find(|(field, _)| field == "user_id")
            .and_then(|(_, v)| v.as_str());

        let rows = match user_filter {
            Some(user_id) => {
                sqlx::query(
                    "SELECT id, body, version FROM documents WHERE collection = ? AND user_id = ?",
                )
                .bind(collection.name())
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT id, body, version FROM documents WHERE collection = ?")
                    .bind(collection.name())
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx)?;

        let docs = rows
            .iter()
            .map(Self::decode_row)
            .collect::<MemoryResult<Vec<_>>>()?;
        Ok(evaluate(query, docs, top_k))
    }

    async fn compare_and_swap(
        &self,
        collection: Collection,
        doc: Document,
        expected: Option<u64>,
    ) -> MemoryResult<u64> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        let found: Option<i64> =
            sqlx::query("SELECT version FROM documents WHERE collection = ? AND id = ?")
                .bind(collection.name())
                .bind(&doc.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx)?
                .map(|row| row.get("version"));
        let found = found.map(|v| v as u64);
        if found != expected {
            return Err(MemoryError::VersionConflict {
                id: doc.id,
                expected,
                found,
            });
        }

        let version = found.map_or(1, |v| v + 1);
        let body = serde_json::to_string(&doc.body)?;
        sqlx::query(
            "INSERT OR REPLACE INTO documents (collection, id, user_id, body, version)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(collection.name())
        .bind(&doc.id)
        .bind(Self::user_of(&doc))
        .bind(&body)
        .bind(version as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        tx.commit().await.map_err(map_sqlx)?;
        Ok(version)
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_sqlite_roundtrip_and_user_filter() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("mem.db")).await.unwrap();

        store
            .upsert(
                Collection::Summaries,
                Document::new("u1:s1", json!({"user_id": "u1", "summary": "hiking trip"})),
            )
            .await
            .unwrap();
        store
            .upsert(
                Collection::Summaries,
                Document::new("u2:s1", json!({"user_id": "u2", "summary": "hiking boots"})),
            )
            .await
            .unwrap();

        let hits = store
            .query(
                Collection::Summaries,
                &StoreQuery::new().filter("user_id", "u1").text("hiking", &["summary"]),
                10,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "u1:s1");
    }

    #[tokio::test]
    async fn test_sqlite_compare_and_swap() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("mem.db")).await.unwrap();
        let doc = Document::new("longterm-u1", json!({"user_id": "u1"}));

        assert_eq!(
            store
                .compare_and_swap(Collection::Insights, doc.clone(), None)
                .await
                .unwrap(),
            1
        );
        assert!(store
            .compare_and_swap(Collection::Insights, doc.clone(), None)
            .await
            .is_err());
        assert_eq!(
            store
                .compare_and_swap(Collection::Insights, doc, Some(1))
                .await
                .unwrap(),
            2
        );
        let stored = store
            .get(Collection::Insights, "longterm-u1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 2);
    }
}
