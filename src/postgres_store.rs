// Postgres Store
// Production DocumentStore over sqlx. The claim path is the one place that
// takes explicit row locks: SELECT ... FOR UPDATE SKIP LOCKED, so losing
// claimers skip to the next candidate instead of blocking. Everything else
// runs under default read-committed isolation, with multi-row writes inside
// transactions.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;

use crate::contracts::{
    Document, DocumentPersistPlan, DocumentStore, Element, EnqueueOutcome, Entity, ErrorInfo,
    Metadata, PersistReceipt, ProcessingRun, QueueItem, QueueStatus, Relationship,
    WorkerRegistration,
};
use crate::schema;
use crate::types::{ElementType, QueueState, RelationshipType, RunStatus, WorkerStatus};

pub struct PostgresStore {
    pool: PgPool,
}

fn to_json(metadata: &Metadata) -> serde_json::Value {
    serde_json::Value::Object(metadata.clone())
}

fn from_json(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

async fn exec_raw_sql(pool: &PgPool, sql: String) -> sqlx::Result<()> {
    sqlx::raw_sql(&sql).execute(pool).await?;
    Ok(())
}

impl PostgresStore {
    /// Connect and verify the server is reachable. Postgres provides the
    /// row-locking primitive the queue contract requires; a backend
    /// without it would have to fail here instead of connecting.
    pub async fn connect(dsn: &str, max_connections: Option<u32>) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.unwrap_or(10))
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await
            .context("Failed to connect to Postgres")?;

        let row: (i32,) = sqlx::query_as("SELECT 1")
            .fetch_one(&pool)
            .await
            .context("Postgres connectivity check failed")?;
        if row.0 != 1 {
            return Err(anyhow!("Postgres connectivity check returned {}", row.0));
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn queue_item_from_row(row: &PgRow) -> Result<QueueItem> {
        let state: String = row.try_get("state")?;
        let error_info: Option<serde_json::Value> = row.try_get("error_info")?;
        let error_info = match error_info {
            Some(value) => Some(
                serde_json::from_value::<ErrorInfo>(value)
                    .context("Malformed error_info column")?,
            ),
            None => None,
        };
        Ok(QueueItem {
            queue_id: row.try_get("queue_id")?,
            run_id: row.try_get("run_id")?,
            doc_id: row.try_get("doc_id")?,
            source_name: row.try_get("source_name")?,
            state: QueueState::parse(&state)?,
            priority: row.try_get("priority")?,
            retry_count: row.try_get("retry_count")?,
            claimed_by_worker: row.try_get("claimed_by_worker")?,
            claimed_at: row.try_get("claimed_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            metadata: from_json(row.try_get("metadata")?),
            error_info,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn run_from_row(row: &PgRow) -> Result<ProcessingRun> {
        let status: String = row.try_get("status")?;
        Ok(ProcessingRun {
            run_id: row.try_get("run_id")?,
            status: RunStatus::parse(&status)?,
            config_hash: row.try_get("config_hash")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            worker_count: row.try_get("worker_count")?,
            documents_queued: row.try_get("documents_queued")?,
            documents_processed: row.try_get("documents_processed")?,
            documents_failed: row.try_get("documents_failed")?,
        })
    }

    fn worker_from_row(row: &PgRow) -> Result<WorkerRegistration> {
        let status: String = row.try_get("status")?;
        Ok(WorkerRegistration {
            worker_id: row.try_get("worker_id")?,
            run_id: row.try_get("run_id")?,
            status: WorkerStatus::parse(&status)?,
            hostname: row.try_get("hostname")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            documents_processed: row.try_get("documents_processed")?,
            documents_failed: row.try_get("documents_failed")?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    fn element_from_row(row: &PgRow) -> Result<Element> {
        let element_type: String = row.try_get("element_type")?;
        Ok(Element {
            element_pk: row.try_get("element_pk")?,
            element_id: row.try_get("element_id")?,
            doc_id: row.try_get("doc_id")?,
            parent_id: row.try_get("parent_id")?,
            element_type: ElementType::parse(&element_type),
            content_preview: row.try_get("content_preview")?,
            content_location: row.try_get("content_location")?,
            content_hash: row.try_get("content_hash")?,
            element_order: row.try_get("element_order")?,
            document_position: row.try_get("document_position")?,
            metadata: from_json(row.try_get("metadata")?),
            embedding: row.try_get("embedding")?,
        })
    }

    fn relationship_from_row(row: &PgRow) -> Result<Relationship> {
        let relationship_type: String = row.try_get("relationship_type")?;
        Ok(Relationship {
            relationship_id: row.try_get("relationship_id")?,
            source_id: row.try_get("source_id")?,
            target_id: row.try_get("target_id")?,
            relationship_type: RelationshipType::parse(&relationship_type),
            metadata: from_json(row.try_get("metadata")?),
        })
    }

    fn entity_from_row(row: &PgRow) -> Result<Entity> {
        Ok(Entity {
            entity_pk: row.try_get("entity_pk")?,
            entity_id: row.try_get("entity_id")?,
            entity_type: row.try_get("entity_type")?,
            name: row.try_get("name")?,
            domain: row.try_get("domain")?,
            attributes: from_json(row.try_get("attributes")?),
        })
    }

    fn document_from_row(row: &PgRow) -> Result<Document> {
        Ok(Document {
            doc_id: row.try_get("doc_id")?,
            doc_type: row.try_get("doc_type")?,
            source: row.try_get("source")?,
            content_hash: row.try_get("content_hash")?,
            metadata: from_json(row.try_get("metadata")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn init_schema(&self, force: bool) -> Result<()> {
        // raw_sql sends this as one multi-statement batch over the simple
        // query protocol, which Postgres already runs as a single implicit
        // transaction, so no explicit BEGIN/COMMIT wrapper is needed here.
        let sql = if force {
            format!("{}\n{}", schema::DROP_SCHEMA_SQL, schema::CREATE_SCHEMA_SQL)
        } else {
            schema::CREATE_SCHEMA_SQL.to_string()
        };
        exec_raw_sql(&self.pool, sql)
            .await
            .context("Failed to initialize schema")?;
        Ok(())
    }

    async fn schema_exists(&self) -> Result<bool> {
        let tables: Vec<String> = schema::TABLES.iter().map(|t| t.to_string()).collect();
        let rows = sqlx::query(schema::CHECK_TABLES_SQL)
            .bind(&tables)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.len() == schema::TABLES.len())
    }

    async fn ensure_run(&self, run_id: &str, config_hash: &str) -> Result<ProcessingRun> {
        sqlx::query(
            "INSERT INTO processing_runs (run_id, status, config_hash)
             VALUES ($1, 'active', $2)
             ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(run_id)
        .bind(config_hash)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM processing_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        Self::run_from_row(&row)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<ProcessingRun>> {
        let row = sqlx::query("SELECT * FROM processing_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::run_from_row).transpose()
    }

    async fn list_runs(&self) -> Result<Vec<ProcessingRun>> {
        let rows = sqlx::query("SELECT * FROM processing_runs ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::run_from_row).collect()
    }

    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        sqlx::query(
            "UPDATE processing_runs SET status = $2, updated_at = now() WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_run_counts(
        &self,
        run_id: &str,
        queued: i64,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE processing_runs
             SET documents_queued = documents_queued + $2,
                 documents_processed = documents_processed + $3,
                 documents_failed = documents_failed + $4,
                 updated_at = now()
             WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(queued)
        .bind(processed)
        .bind(failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn register_worker(&self, run_id: &str, worker_id: &str, hostname: &str) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO run_workers (worker_id, run_id, status, hostname, last_heartbeat)
             VALUES ($1, $2, 'active', $3, now())
             ON CONFLICT (worker_id, run_id)
             DO UPDATE SET status = 'active', last_heartbeat = now()
             RETURNING (xmax = 0) AS inserted",
        )
        .bind(worker_id)
        .bind(run_id)
        .bind(hostname)
        .fetch_one(&self.pool)
        .await?;

        let inserted: bool = result.try_get("inserted")?;
        if inserted {
            sqlx::query(
                "UPDATE processing_runs SET worker_count = worker_count + 1, updated_at = now()
                 WHERE run_id = $1",
            )
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn heartbeat_worker(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE run_workers SET last_heartbeat = $3 WHERE run_id = $1 AND worker_id = $2",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_worker_status(
        &self,
        run_id: &str,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE run_workers SET status = $3 WHERE run_id = $1 AND worker_id = $2",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_worker_counts(
        &self,
        run_id: &str,
        worker_id: &str,
        processed: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE run_workers
             SET documents_processed = documents_processed + $3,
                 documents_failed = documents_failed + $4
             WHERE run_id = $1 AND worker_id = $2",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(processed)
        .bind(failed)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_workers(&self, run_id: &str) -> Result<Vec<WorkerRegistration>> {
        let rows = sqlx::query("SELECT * FROM run_workers WHERE run_id = $1 ORDER BY worker_id")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::worker_from_row).collect()
    }

    async fn enqueue_document(
        &self,
        run_id: &str,
        doc_id: &str,
        source_name: &str,
        priority: i32,
        metadata: Metadata,
    ) -> Result<EnqueueOutcome> {
        // Fast path: an existing non-terminal item wins.
        let existing = sqlx::query(
            "SELECT queue_id FROM document_queue
             WHERE run_id = $1 AND doc_id = $2
               AND state NOT IN ('completed', 'failed')",
        )
        .bind(run_id)
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return Ok(EnqueueOutcome {
                queue_id: row.try_get("queue_id")?,
                created: false,
            });
        }

        // The partial unique index arbitrates concurrent inserts.
        let inserted = sqlx::query(
            "INSERT INTO document_queue (run_id, doc_id, source_name, priority, metadata)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (run_id, doc_id) WHERE state NOT IN ('completed', 'failed')
             DO NOTHING
             RETURNING queue_id",
        )
        .bind(run_id)
        .bind(doc_id)
        .bind(source_name)
        .bind(priority)
        .bind(to_json(&metadata))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(EnqueueOutcome {
                queue_id: row.try_get("queue_id")?,
                created: true,
            });
        }

        // Lost the insert race; the winner's row is non-terminal.
        let row = sqlx::query(
            "SELECT queue_id FROM document_queue
             WHERE run_id = $1 AND doc_id = $2
               AND state NOT IN ('completed', 'failed')",
        )
        .bind(run_id)
        .bind(doc_id)
        .fetch_one(&self.pool)
        .await
        .context("Enqueue race left no non-terminal item")?;
        Ok(EnqueueOutcome {
            queue_id: row.try_get("queue_id")?,
            created: false,
        })
    }

    async fn claim_next(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>> {
        // SKIP LOCKED is the whole point: a concurrent claimer holding the
        // head row is invisible here, so we take the next candidate
        // without blocking and never double-claim.
        let row = sqlx::query(
            "WITH candidate AS (
                 SELECT queue_id FROM document_queue
                 WHERE run_id = $1
                   AND (state = 'pending'
                        OR (state = 'retry'
                            AND (next_attempt_at IS NULL OR next_attempt_at <= $3)))
                 ORDER BY priority ASC, created_at ASC, queue_id ASC
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             UPDATE document_queue q
             SET state = 'processing',
                 claimed_by_worker = $2,
                 claimed_at = $3,
                 last_heartbeat = $3,
                 updated_at = $3
             FROM candidate
             WHERE q.queue_id = candidate.queue_id
             RETURNING q.*",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::queue_item_from_row).transpose()
    }

    async fn get_queue_item(&self, queue_id: i64) -> Result<Option<QueueItem>> {
        let row = sqlx::query("SELECT * FROM document_queue WHERE queue_id = $1")
            .bind(queue_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::queue_item_from_row).transpose()
    }

    async fn heartbeat_claims(
        &self,
        run_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE document_queue
             SET last_heartbeat = $3, updated_at = $3
             WHERE run_id = $1 AND claimed_by_worker = $2 AND state = 'processing'",
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_item_completed(&self, queue_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE document_queue
             SET state = 'completed', updated_at = now()
             WHERE queue_id = $1",
        )
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_item_retry(
        &self,
        queue_id: i64,
        next_attempt_at: DateTime<Utc>,
        error: ErrorInfo,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE document_queue
             SET state = 'retry',
                 retry_count = retry_count + 1,
                 claimed_by_worker = NULL,
                 claimed_at = NULL,
                 next_attempt_at = $2,
                 error_info = $3,
                 updated_at = now()
             WHERE queue_id = $1",
        )
        .bind(queue_id)
        .bind(next_attempt_at)
        .bind(serde_json::to_value(&error)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_item_failed(&self, queue_id: i64, error: ErrorInfo) -> Result<()> {
        sqlx::query(
            "UPDATE document_queue
             SET state = 'failed',
                 claimed_by_worker = NULL,
                 claimed_at = NULL,
                 error_info = $2,
                 updated_at = now()
             WHERE queue_id = $1",
        )
        .bind(queue_id)
        .bind(serde_json::to_value(&error)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reset_item_pending(&self, queue_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE document_queue
             SET state = 'pending',
                 retry_count = 0,
                 claimed_by_worker = NULL,
                 claimed_at = NULL,
                 last_heartbeat = NULL,
                 next_attempt_at = NULL,
                 error_info = NULL,
                 updated_at = now()
             WHERE queue_id = $1 AND state = 'failed'",
        )
        .bind(queue_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reclaim_stale_items(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE document_queue
             SET state = 'retry',
                 retry_count = retry_count + 1,
                 claimed_by_worker = NULL,
                 claimed_at = NULL,
                 next_attempt_at = now(),
                 updated_at = now()
             WHERE state = 'processing'
               AND (last_heartbeat IS NULL OR last_heartbeat < $1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn queue_status(&self, run_id: &str) -> Result<QueueStatus> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS count FROM document_queue
             WHERE run_id = $1 GROUP BY state",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        let mut status = QueueStatus::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            match QueueState::parse(&state)? {
                QueueState::Pending => status.pending = count as u64,
                QueueState::Processing => status.processing = count as u64,
                QueueState::Completed => status.completed = count as u64,
                QueueState::Failed => status.failed = count as u64,
                QueueState::Retry => status.retry = count as u64,
            }
        }
        Ok(status)
    }

    async fn list_failed_items(
        &self,
        run_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<QueueItem>> {
        let rows = match run_id {
            Some(run_id) => {
                sqlx::query(
                    "SELECT * FROM document_queue
                     WHERE state = 'failed' AND run_id = $1
                     ORDER BY updated_at DESC LIMIT $2",
                )
                .bind(run_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM document_queue
                     WHERE state = 'failed'
                     ORDER BY updated_at DESC LIMIT $1",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(Self::queue_item_from_row).collect()
    }

    async fn purge_failed_items(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM document_queue
             WHERE state = 'failed'
               AND COALESCE((error_info->>'failed_at')::timestamptz, updated_at) < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE doc_id = $1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::document_from_row).transpose()
    }

    async fn apply_document_plan(&self, plan: DocumentPersistPlan) -> Result<PersistReceipt> {
        plan.validate()?;
        let doc_id = plan.document.doc_id.clone();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO documents (doc_id, doc_type, source, content_hash, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (doc_id) DO UPDATE
             SET doc_type = EXCLUDED.doc_type,
                 source = EXCLUDED.source,
                 content_hash = EXCLUDED.content_hash,
                 metadata = EXCLUDED.metadata,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(&doc_id)
        .bind(&plan.document.doc_type)
        .bind(&plan.document.source)
        .bind(&plan.document.content_hash)
        .bind(to_json(&plan.document.metadata))
        .bind(plan.document.created_at)
        .bind(plan.document.updated_at)
        .execute(&mut *tx)
        .await?;

        if plan.replace_existing {
            // Intra-document relationships go with the elements; edges
            // flagged cross_document survive re-ingest.
            sqlx::query(
                "DELETE FROM relationships
                 WHERE COALESCE((metadata->>'cross_document')::boolean, false) = false
                   AND (source_id IN (SELECT element_id FROM elements WHERE doc_id = $1)
                        OR target_id IN (SELECT element_id FROM elements WHERE doc_id = $1))",
            )
            .bind(&doc_id)
            .execute(&mut *tx)
            .await?;
            // Cascades element_entity_mappings.
            sqlx::query("DELETE FROM elements WHERE doc_id = $1")
                .bind(&doc_id)
                .execute(&mut *tx)
                .await?;
        }

        let mut pk_by_element_id: HashMap<String, i64> = HashMap::new();
        for element in &plan.elements {
            let row = sqlx::query(
                "INSERT INTO elements
                     (element_id, doc_id, parent_id, element_type, content_preview,
                      content_location, content_hash, element_order, document_position,
                      metadata, embedding)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                 RETURNING element_pk",
            )
            .bind(&element.element_id)
            .bind(&doc_id)
            .bind(&element.parent_id)
            .bind(element.element_type.as_str())
            .bind(&element.content_preview)
            .bind(&element.content_location)
            .bind(&element.content_hash)
            .bind(element.element_order)
            .bind(element.document_position)
            .bind(to_json(&element.metadata))
            .bind(&element.embedding)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert element {}", element.element_id))?;
            pk_by_element_id.insert(element.element_id.clone(), row.try_get("element_pk")?);
        }

        for relationship in &plan.relationships {
            sqlx::query(
                "INSERT INTO relationships
                     (relationship_id, source_id, target_id, relationship_type, metadata)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (relationship_id) DO UPDATE SET metadata = EXCLUDED.metadata",
            )
            .bind(&relationship.relationship_id)
            .bind(&relationship.source_id)
            .bind(&relationship.target_id)
            .bind(relationship.relationship_type.as_str())
            .bind(to_json(&relationship.metadata))
            .execute(&mut *tx)
            .await?;
        }

        if !plan.entities_deleted.is_empty() {
            // Cascades mappings and entity relationships.
            sqlx::query("DELETE FROM entities WHERE entity_pk = ANY($1)")
                .bind(&plan.entities_deleted)
                .execute(&mut *tx)
                .await?;
        }

        for entity in &plan.entities_updated {
            sqlx::query(
                "UPDATE entities SET name = $2, attributes = $3 WHERE entity_pk = $1",
            )
            .bind(entity.entity_pk)
            .bind(&entity.name)
            .bind(to_json(&entity.attributes))
            .execute(&mut *tx)
            .await?;
        }

        for entity in &plan.entities_created {
            sqlx::query(
                "INSERT INTO entities (entity_id, entity_type, name, domain, attributes)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (entity_id) DO NOTHING",
            )
            .bind(&entity.entity_id)
            .bind(&entity.entity_type)
            .bind(&entity.name)
            .bind(&entity.domain)
            .bind(to_json(&entity.attributes))
            .execute(&mut *tx)
            .await?;
        }

        for mapping in &plan.mappings {
            let element_pk = pk_by_element_id
                .get(&mapping.element_id)
                .copied()
                .ok_or_else(|| {
                    anyhow!("Mapping references unknown element {}", mapping.element_id)
                })?;
            sqlx::query(
                "INSERT INTO element_entity_mappings (element_pk, entity_pk, relationship_type, domain)
                 SELECT $1, entity_pk, 'DERIVED_FROM', $3 FROM entities WHERE entity_id = $2
                 ON CONFLICT DO NOTHING",
            )
            .bind(element_pk)
            .bind(&mapping.entity_id)
            .bind(&mapping.domain)
            .execute(&mut *tx)
            .await?;
        }

        for planned in &plan.entity_relationships {
            sqlx::query(
                "INSERT INTO entity_relationships
                     (source_pk, target_pk, relationship_type, confidence, domain)
                 SELECT s.entity_pk, t.entity_pk, $3, $4, $5
                 FROM entities s, entities t
                 WHERE s.entity_id = $1 AND t.entity_id = $2
                 ON CONFLICT (source_pk, target_pk, relationship_type)
                 DO UPDATE SET confidence = EXCLUDED.confidence",
            )
            .bind(&planned.source_entity_id)
            .bind(&planned.target_entity_id)
            .bind(&planned.relationship_type)
            .bind(planned.confidence)
            .bind(&planned.domain)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Document persist commit failed")?;

        Ok(PersistReceipt {
            elements_written: plan.elements.len() as u64,
            relationships_written: plan.relationships.len() as u64,
            entity_counts: plan.counts,
        })
    }

    async fn get_elements(&self, doc_id: &str) -> Result<Vec<Element>> {
        let rows = sqlx::query(
            "SELECT * FROM elements WHERE doc_id = $1 ORDER BY document_position",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::element_from_row).collect()
    }

    async fn get_element_by_id(&self, element_id: &str) -> Result<Option<Element>> {
        let row = sqlx::query("SELECT * FROM elements WHERE element_id = $1")
            .bind(element_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::element_from_row).transpose()
    }

    async fn elements_with_embeddings(
        &self,
        excluding_doc: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Element>> {
        let rows = sqlx::query(
            "SELECT * FROM elements
             WHERE embedding IS NOT NULL
               AND ($1::text IS NULL OR doc_id <> $1)
             ORDER BY element_pk
             LIMIT $2",
        )
        .bind(excluding_doc)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::element_from_row).collect()
    }

    async fn outgoing_relationships(&self, element_id: &str) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            "SELECT * FROM relationships WHERE source_id = $1 ORDER BY relationship_id",
        )
        .bind(element_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::relationship_from_row).collect()
    }

    async fn insert_relationships(&self, relationships: &[Relationship]) -> Result<u64> {
        let mut written = 0;
        for relationship in relationships {
            let result = sqlx::query(
                "INSERT INTO relationships
                     (relationship_id, source_id, target_id, relationship_type, metadata)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (relationship_id) DO UPDATE SET metadata = EXCLUDED.metadata",
            )
            .bind(&relationship.relationship_id)
            .bind(&relationship.source_id)
            .bind(&relationship.target_id)
            .bind(relationship.relationship_type.as_str())
            .bind(to_json(&relationship.metadata))
            .execute(&self.pool)
            .await?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn entities_derived_from(&self, doc_id: &str) -> Result<Vec<Entity>> {
        let rows = sqlx::query(
            "SELECT DISTINCT en.* FROM entities en
             JOIN element_entity_mappings m ON m.entity_pk = en.entity_pk
             JOIN elements el ON el.element_pk = m.element_pk
             WHERE el.doc_id = $1 AND m.relationship_type = 'DERIVED_FROM'
             ORDER BY en.entity_pk",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::entity_from_row).collect()
    }

    async fn get_entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE entity_id = $1")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::entity_from_row).transpose()
    }

    async fn entity_mapping_count(
        &self,
        entity_pk: i64,
        excluding_doc: Option<&str>,
    ) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM element_entity_mappings m
             JOIN elements el ON el.element_pk = m.element_pk
             WHERE m.entity_pk = $1
               AND m.relationship_type = 'DERIVED_FROM'
               AND ($2::text IS NULL OR el.doc_id <> $2)",
        )
        .bind(entity_pk)
        .bind(excluding_doc)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("count")?;
        Ok(count as u64)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
