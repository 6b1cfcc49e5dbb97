//! Document store seam and the keyed upsert sink built on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use frh_core::{CanonicalRecord, Source, Variant};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::Mutex;
use tracing::debug;

/// Collection holding one document per source, one field per variant.
pub const LAST_UPDATED_COLLECTION: &str = "last_updated";

pub type Document = JsonMap<String, JsonValue>;

/// A set-if-absent-else-merge write for one document.
///
/// `set` is merged into the document whether or not it exists;
/// `set_on_insert` is only applied when the document is created.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpsert {
    pub key: String,
    pub set: Document,
    pub set_on_insert: Document,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    pub inserted: usize,
    pub updated: usize,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Apply every upsert or none of them.
    async fn bulk_upsert(
        &self,
        collection: &str,
        upserts: Vec<DocumentUpsert>,
    ) -> anyhow::Result<BulkWriteSummary>;

    /// Set one field on one document, creating the document if needed.
    async fn set_field(
        &self,
        collection: &str,
        key: &str,
        field: &str,
        value: JsonValue,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    collections: Mutex<BTreeMap<String, BTreeMap<String, Document>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, collection: &str, key: &str) -> Option<Document> {
        self.collections
            .lock()
            .await
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned()
    }

    pub async fn collection(&self, collection: &str) -> BTreeMap<String, Document> {
        self.collections
            .lock()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, Document>> {
        self.collections.lock().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn bulk_upsert(
        &self,
        collection: &str,
        upserts: Vec<DocumentUpsert>,
    ) -> anyhow::Result<BulkWriteSummary> {
        let mut collections = self.collections.lock().await;
        let docs = collections.entry(collection.to_string()).or_default();
        let mut summary = BulkWriteSummary::default();

        for upsert in upserts {
            match docs.get_mut(&upsert.key) {
                Some(existing) => {
                    existing.extend(upsert.set);
                    summary.updated += 1;
                }
                None => {
                    let mut doc = upsert.set_on_insert;
                    doc.extend(upsert.set);
                    docs.insert(upsert.key, doc);
                    summary.inserted += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn set_field(
        &self,
        collection: &str,
        key: &str,
        field: &str,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        let mut collections = self.collections.lock().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }
}

/// PostgreSQL-backed store keeping each document as a JSONB body.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to document database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying database migrations")?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn bulk_upsert(
        &self,
        collection: &str,
        upserts: Vec<DocumentUpsert>,
    ) -> anyhow::Result<BulkWriteSummary> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening bulk upsert transaction")?;
        let mut summary = BulkWriteSummary::default();

        for upsert in upserts {
            let inserted: bool = sqlx::query_scalar(
                r#"
                INSERT INTO documents (collection, doc_key, body, created_at, updated_at)
                VALUES ($1, $2, $4::jsonb || $3::jsonb, NOW(), NOW())
                ON CONFLICT (collection, doc_key) DO UPDATE
                   SET body = documents.body || $3::jsonb,
                       updated_at = NOW()
                RETURNING (xmax = 0) AS inserted
                "#,
            )
            .bind(collection)
            .bind(&upsert.key)
            .bind(JsonValue::Object(upsert.set))
            .bind(JsonValue::Object(upsert.set_on_insert))
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("upserting {collection}/{}", upsert.key))?;

            if inserted {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }

        tx.commit()
            .await
            .with_context(|| format!("committing bulk upsert into {collection}"))?;
        Ok(summary)
    }

    async fn set_field(
        &self,
        collection: &str,
        key: &str,
        field: &str,
        value: JsonValue,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, doc_key, body, created_at, updated_at)
            VALUES ($1, $2, jsonb_build_object($3::text, $4::jsonb), NOW(), NOW())
            ON CONFLICT (collection, doc_key) DO UPDATE
               SET body = documents.body || jsonb_build_object($3::text, $4::jsonb),
                   updated_at = NOW()
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("setting {collection}/{key}.{field}"))?;
        Ok(())
    }
}

/// Writes harvested records keyed by identity, and the per-variant freshness stamp.
#[derive(Clone)]
pub struct UpsertSink {
    store: Arc<dyn DocumentStore>,
}

impl UpsertSink {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Split a record into the fields every write refreshes and the
    /// first-seen marker that only the creating write may set.
    pub fn upsert_for(record: &CanonicalRecord) -> anyhow::Result<DocumentUpsert> {
        let mut set = match serde_json::to_value(record)
            .with_context(|| format!("serializing record `{}`", record.identity))?
        {
            JsonValue::Object(map) => map,
            other => bail!("record `{}` serialized to non-object {other}", record.identity),
        };
        let is_new = set.remove("is_new").unwrap_or(JsonValue::Bool(true));

        let mut set_on_insert = Document::new();
        set_on_insert.insert("is_new".to_string(), is_new);

        Ok(DocumentUpsert {
            key: record.identity.clone(),
            set,
            set_on_insert,
        })
    }

    pub async fn persist(
        &self,
        records: &[CanonicalRecord],
        collection: &str,
    ) -> anyhow::Result<BulkWriteSummary> {
        if records.is_empty() {
            return Ok(BulkWriteSummary::default());
        }
        let upserts = records
            .iter()
            .map(Self::upsert_for)
            .collect::<anyhow::Result<Vec<_>>>()?;
        debug!(collection, count = upserts.len(), "bulk upserting records");
        self.store.bulk_upsert(collection, upserts).await
    }

    pub async fn stamp(
        &self,
        source: Source,
        variant: Variant,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store
            .set_field(
                LAST_UPDATED_COLLECTION,
                source.as_str(),
                variant.label(),
                JsonValue::String(at.to_rfc3339()),
            )
            .await
    }
}

impl std::fmt::Debug for UpsertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsertSink").finish_non_exhaustive()
    }
}
