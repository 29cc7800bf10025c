use super::planner::{self, DedupePolicy, Incoming, Lineage, PendingRow, Plan, RowRef, Snapshot, Write};
use super::types::{ScheduleOutcome, SyncRequest, SyncStatus, SyncTarget, SyncType};
use crate::catalog::{
    IntegrationKind, NewRemoteProduct, NewSalesChannel, NewSalesChannelView, RemoteProduct,
    SalesChannel, SalesChannelView, ViewAssignment,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::{
    Row, SqliteConnection, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{collections::BTreeMap, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const REQUEST_COLUMNS: &str = "sr.id, sr.remote_product_id, sr.sales_channel_id, \
    sr.sales_channel_view_id, sr.sync_type, sr.status, sr.reason, sr.task_func_path, \
    sr.task_kwargs, sr.number_of_remote_requests, sr.skipped_for_id, sr.error, sr.attempts, \
    sr.created_at, sr.updated_at";

const MAX_SKIP_HOPS: usize = 32;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0} {1} not found")]
    NotFound(&'static str, i64),
    #[error("invalid input: {0}")]
    Invalid(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Conflicts that a fresh transaction can resolve: a concurrent writer
    /// won the pending-product slot or held the database lock.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::Database(db)) => {
                db.is_unique_violation()
                    || matches!(
                        db.code().as_deref(),
                        Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
                    )
            }
            StoreError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

/// Which targets a scheduling call applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    /// Every target of a local product, optionally limited to one view.
    Product { product_id: i64, view_id: Option<i64> },
    Exact(SyncTarget),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestFilter {
    #[serde(default)]
    pub status: Option<SyncStatus>,
    #[serde(default)]
    pub sync_type: Option<SyncType>,
    #[serde(default)]
    pub remote_product_id: Option<i64>,
    #[serde(default)]
    pub view_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct ResolvedTarget {
    target: SyncTarget,
    is_variation: bool,
    parent_remote_product_id: Option<i64>,
    integration: IntegrationKind,
}

#[derive(Clone)]
pub struct SyncStore {
    pool: SqlitePool,
}

impl SyncStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        // An in-memory database lives exactly as long as its connection.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(10))
                .connect_with(options.journal_mode(SqliteJournalMode::Wal))
                .await?
        };

        MIGRATOR.run(&pool).await?;
        info!(target = "pim_sync.store", in_memory, "sync store ready");
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn close(&self) {
        self.pool.close().await;
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:", 1).await
    }

    // -------- catalog --------

    pub async fn create_channel(
        &self,
        company_id: &str,
        input: &NewSalesChannel,
    ) -> Result<SalesChannel, StoreError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(StoreError::Invalid("channel name is empty".into()));
        }
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO sales_channels (company_id, name, integration, active, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(company_id)
        .bind(name)
        .bind(input.integration.as_str())
        .bind(input.active)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.channel(company_id, result.last_insert_rowid()).await
    }

    pub async fn channel(&self, company_id: &str, id: i64) -> Result<SalesChannel, StoreError> {
        let row = sqlx::query(
            "SELECT id, company_id, name, integration, active, created_at \
             FROM sales_channels WHERE id = ? AND company_id = ?",
        )
        .bind(id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("sales channel", id))?;
        map_channel(&row)
    }

    pub async fn list_channels(&self, company_id: &str) -> Result<Vec<SalesChannel>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, company_id, name, integration, active, created_at \
             FROM sales_channels WHERE company_id = ? ORDER BY id",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_channel).collect()
    }

    pub async fn create_view(
        &self,
        company_id: &str,
        channel_id: i64,
        input: &NewSalesChannelView,
    ) -> Result<SalesChannelView, StoreError> {
        self.channel(company_id, channel_id).await?;
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO sales_channel_views (sales_channel_id, name, remote_id, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(channel_id)
        .bind(input.name.trim())
        .bind(input.remote_id.as_deref())
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.view(company_id, result.last_insert_rowid()).await
    }

    pub async fn view(&self, company_id: &str, id: i64) -> Result<SalesChannelView, StoreError> {
        let row = sqlx::query(
            "SELECT v.id, v.sales_channel_id, v.name, v.remote_id, v.created_at \
             FROM sales_channel_views v \
             JOIN sales_channels sc ON sc.id = v.sales_channel_id \
             WHERE v.id = ? AND sc.company_id = ?",
        )
        .bind(id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("sales channel view", id))?;
        map_view(&row)
    }

    pub async fn list_views(
        &self,
        company_id: &str,
        channel_id: i64,
    ) -> Result<Vec<SalesChannelView>, StoreError> {
        self.channel(company_id, channel_id).await?;
        let rows = sqlx::query(
            "SELECT id, sales_channel_id, name, remote_id, created_at \
             FROM sales_channel_views WHERE sales_channel_id = ? ORDER BY id",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_view).collect()
    }

    pub async fn create_remote_product(
        &self,
        company_id: &str,
        channel_id: i64,
        input: &NewRemoteProduct,
    ) -> Result<RemoteProduct, StoreError> {
        self.channel(company_id, channel_id).await?;
        if let Some(parent_id) = input.remote_parent_product_id {
            let parent = self.remote_product(company_id, parent_id).await?;
            if parent.sales_channel_id != channel_id {
                return Err(StoreError::Invalid(format!(
                    "parent remote product {parent_id} belongs to another sales channel"
                )));
            }
            if parent.is_variation {
                return Err(StoreError::Invalid(format!(
                    "parent remote product {parent_id} is itself a variation"
                )));
            }
        }
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO remote_products \
             (sales_channel_id, local_product_id, remote_sku, remote_parent_product_id, is_variation, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(channel_id)
        .bind(input.local_product_id)
        .bind(input.remote_sku.as_deref())
        .bind(input.remote_parent_product_id)
        .bind(input.remote_parent_product_id.is_some())
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.remote_product(company_id, result.last_insert_rowid())
            .await
    }

    pub async fn remote_product(
        &self,
        company_id: &str,
        id: i64,
    ) -> Result<RemoteProduct, StoreError> {
        let row = sqlx::query(
            "SELECT rp.id, rp.sales_channel_id, rp.local_product_id, rp.remote_sku, \
             rp.remote_parent_product_id, rp.is_variation, rp.created_at \
             FROM remote_products rp \
             JOIN sales_channels sc ON sc.id = rp.sales_channel_id \
             WHERE rp.id = ? AND sc.company_id = ?",
        )
        .bind(id)
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("remote product", id))?;
        map_remote_product(&row)
    }

    pub async fn list_remote_products(
        &self,
        company_id: &str,
        channel_id: i64,
    ) -> Result<Vec<RemoteProduct>, StoreError> {
        self.channel(company_id, channel_id).await?;
        let rows = sqlx::query(
            "SELECT id, sales_channel_id, local_product_id, remote_sku, \
             remote_parent_product_id, is_variation, created_at \
             FROM remote_products WHERE sales_channel_id = ? ORDER BY id",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_remote_product).collect()
    }

    pub async fn assign_product(
        &self,
        company_id: &str,
        view_id: i64,
        product_id: i64,
    ) -> Result<ViewAssignment, StoreError> {
        self.view(company_id, view_id).await?;
        sqlx::query(
            "INSERT INTO view_assignments (product_id, sales_channel_view_id, created_at) \
             VALUES (?, ?, ?) ON CONFLICT (product_id, sales_channel_view_id) DO NOTHING",
        )
        .bind(product_id)
        .bind(view_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let row = sqlx::query(
            "SELECT id, product_id, sales_channel_view_id, created_at \
             FROM view_assignments WHERE product_id = ? AND sales_channel_view_id = ?",
        )
        .bind(product_id)
        .bind(view_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ViewAssignment {
            id: row.try_get("id")?,
            product_id: row.try_get("product_id")?,
            sales_channel_view_id: row.try_get("sales_channel_view_id")?,
            created_at: row.try_get("created_at")?,
        })
    }

    pub async fn unassign_product(
        &self,
        company_id: &str,
        view_id: i64,
        product_id: i64,
    ) -> Result<bool, StoreError> {
        self.view(company_id, view_id).await?;
        let result = sqlx::query(
            "DELETE FROM view_assignments WHERE product_id = ? AND sales_channel_view_id = ?",
        )
        .bind(product_id)
        .bind(view_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // -------- scheduling --------

    /// Folds one change into the pending queue of every target in scope,
    /// atomically. The leading lock update serializes concurrent schedulers
    /// inside the database.
    pub async fn schedule(
        &self,
        company_id: &str,
        scope: TargetScope,
        incoming: &Incoming,
        kwargs: &Map<String, Value>,
        policy: &DedupePolicy,
    ) -> Result<Vec<ScheduleOutcome>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE sync_locks SET acquired_at = ? WHERE name = 'schedule'")
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        let targets = match scope {
            TargetScope::Product {
                product_id,
                view_id,
            } => resolve_product_targets(&mut tx, company_id, product_id, view_id).await?,
            TargetScope::Exact(target) => vec![resolve_exact_target(&mut tx, company_id, target).await?],
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for resolved in &targets {
            let snapshot = load_snapshot(&mut tx, resolved).await?;
            let plan = planner::plan(&snapshot, incoming, policy);
            let outcome = apply_plan(&mut tx, resolved, &plan, kwargs).await?;
            debug!(
                target = "pim_sync.store",
                remote_product_id = resolved.target.remote_product_id,
                view_id = resolved.target.sales_channel_view_id,
                disposition = ?outcome.disposition,
                request_id = outcome.request_id,
                effective_request_id = outcome.effective_request_id,
                "sync_request_planned"
            );
            outcomes.push(outcome);
        }

        tx.commit().await?;
        Ok(outcomes)
    }

    pub async fn request(&self, company_id: &str, id: i64) -> Result<SyncRequest, StoreError> {
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM sync_requests sr \
             JOIN sales_channels sc ON sc.id = sr.sales_channel_id \
             WHERE sr.id = ? AND sc.company_id = ?"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound("sync request", id))?;
        map_request(&row)
    }

    pub async fn list_requests(
        &self,
        company_id: &str,
        filter: &RequestFilter,
    ) -> Result<Vec<SyncRequest>, StoreError> {
        let status = filter.status.map(|status| status.as_str());
        let sync_type = filter.sync_type.map(|ty| ty.as_str());
        let limit = filter.limit.unwrap_or(100).clamp(1, 500);
        let sql = format!(
            "SELECT {REQUEST_COLUMNS} FROM sync_requests sr \
             JOIN sales_channels sc ON sc.id = sr.sales_channel_id \
             WHERE sc.company_id = ? \
             AND (? IS NULL OR sr.status = ?) \
             AND (? IS NULL OR sr.sync_type = ?) \
             AND (? IS NULL OR sr.remote_product_id = ?) \
             AND (? IS NULL OR sr.sales_channel_view_id = ?) \
             ORDER BY sr.id LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(company_id)
            .bind(status)
            .bind(status)
            .bind(sync_type)
            .bind(sync_type)
            .bind(filter.remote_product_id)
            .bind(filter.remote_product_id)
            .bind(filter.view_id)
            .bind(filter.view_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_request).collect()
    }

    /// Follows `skipped_for_id` links to the request that finally carries the
    /// change.
    pub async fn effective_request(
        &self,
        company_id: &str,
        id: i64,
    ) -> Result<SyncRequest, StoreError> {
        let mut current = self.request(company_id, id).await?;
        for _ in 0..MAX_SKIP_HOPS {
            match (current.status, current.skipped_for_id) {
                (SyncStatus::Skipped, Some(next)) => {
                    current = self.request(company_id, next).await?;
                }
                _ => return Ok(current),
            }
        }
        Err(StoreError::Corrupt(format!(
            "skip chain from sync request {id} exceeds {MAX_SKIP_HOPS} hops"
        )))
    }

    pub async fn status_counts(
        &self,
        company_id: &str,
    ) -> Result<BTreeMap<String, i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT sr.status AS status, COUNT(*) AS total FROM sync_requests sr \
             JOIN sales_channels sc ON sc.id = sr.sales_channel_id \
             WHERE sc.company_id = ? GROUP BY sr.status",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;
        let mut counts = BTreeMap::new();
        for row in rows {
            counts.insert(row.try_get("status")?, row.try_get("total")?);
        }
        Ok(counts)
    }

    // -------- dispatch --------

    /// Moves the oldest pending request to `PROCESSING`. Once claimed, a full
    /// sync no longer absorbs new changes; those queue a fresh request.
    pub async fn claim_next(&self) -> Result<Option<SyncRequest>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sync_requests WHERE status = 'PENDING' ORDER BY id LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;
        let Some(id) = next else {
            tx.commit().await?;
            return Ok(None);
        };

        let claimed = sqlx::query(
            "UPDATE sync_requests SET status = 'PROCESSING', attempts = attempts + 1, updated_at = ? \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(None);
        }

        let sql = format!("SELECT {REQUEST_COLUMNS} FROM sync_requests sr WHERE sr.id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_one(&mut *tx).await?;
        let request = map_request(&row)?;
        tx.commit().await?;
        Ok(Some(request))
    }

    pub async fn complete(&self, id: i64, remote_requests: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sync_requests SET status = 'DONE', number_of_remote_requests = ?, \
             error = NULL, updated_at = ? WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(remote_requests)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("processing sync request", id));
        }
        Ok(())
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sync_requests SET status = 'FAILED', error = ?, updated_at = ? \
             WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("processing sync request", id));
        }
        Ok(())
    }

    /// Fails requests a previous process claimed but never finished.
    pub async fn recover_interrupted(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_requests SET status = 'FAILED', error = 'interrupted before completion', \
             updated_at = ? WHERE status = 'PROCESSING'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_requests WHERE status = 'PENDING'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

const RESOLVED_COLUMNS: &str = "rp.id AS remote_product_id, rp.sales_channel_id AS sales_channel_id, \
    v.id AS view_id, rp.is_variation AS is_variation, \
    rp.remote_parent_product_id AS remote_parent_product_id, sc.integration AS integration";

async fn resolve_product_targets(
    conn: &mut SqliteConnection,
    company_id: &str,
    product_id: i64,
    view_id: Option<i64>,
) -> Result<Vec<ResolvedTarget>, StoreError> {
    // Variations are listed wherever their parent is assigned.
    let sql = format!(
        "SELECT {RESOLVED_COLUMNS} FROM remote_products rp \
         JOIN sales_channels sc ON sc.id = rp.sales_channel_id \
         JOIN sales_channel_views v ON v.sales_channel_id = rp.sales_channel_id \
         JOIN view_assignments a ON a.sales_channel_view_id = v.id \
         LEFT JOIN remote_products parent ON parent.id = rp.remote_parent_product_id \
         WHERE sc.company_id = ? AND sc.active = 1 AND rp.local_product_id = ? \
         AND a.product_id = COALESCE(parent.local_product_id, rp.local_product_id) \
         AND (? IS NULL OR v.id = ?) \
         ORDER BY rp.id, v.id"
    );
    let rows = sqlx::query(&sql)
        .bind(company_id)
        .bind(product_id)
        .bind(view_id)
        .bind(view_id)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(map_resolved).collect()
}

async fn resolve_exact_target(
    conn: &mut SqliteConnection,
    company_id: &str,
    target: SyncTarget,
) -> Result<ResolvedTarget, StoreError> {
    let sql = format!(
        "SELECT {RESOLVED_COLUMNS} FROM remote_products rp \
         JOIN sales_channels sc ON sc.id = rp.sales_channel_id \
         JOIN sales_channel_views v ON v.sales_channel_id = sc.id \
         WHERE sc.company_id = ? AND rp.id = ? AND sc.id = ? AND v.id = ?"
    );
    let row = sqlx::query(&sql)
        .bind(company_id)
        .bind(target.remote_product_id)
        .bind(target.sales_channel_id)
        .bind(target.sales_channel_view_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::NotFound("remote product", target.remote_product_id))?;
    map_resolved(&row)
}

async fn pending_rows(
    conn: &mut SqliteConnection,
    target: &SyncTarget,
) -> Result<Vec<PendingRow>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, remote_product_id, sync_type FROM sync_requests \
         WHERE remote_product_id = ? AND sales_channel_id = ? AND sales_channel_view_id = ? \
         AND status = 'PENDING' ORDER BY id",
    )
    .bind(target.remote_product_id)
    .bind(target.sales_channel_id)
    .bind(target.sales_channel_view_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(map_pending).collect()
}

async fn sibling_pending_rows(
    conn: &mut SqliteConnection,
    target: &SyncTarget,
    parent_id: i64,
) -> Result<Vec<PendingRow>, StoreError> {
    let rows = sqlx::query(
        "SELECT sr.id, sr.remote_product_id, sr.sync_type FROM sync_requests sr \
         JOIN remote_products rp ON rp.id = sr.remote_product_id \
         WHERE rp.remote_parent_product_id = ? AND rp.id <> ? AND rp.sales_channel_id = ? \
         AND sr.sales_channel_id = ? AND sr.sales_channel_view_id = ? \
         AND sr.status = 'PENDING' ORDER BY sr.id",
    )
    .bind(parent_id)
    .bind(target.remote_product_id)
    .bind(target.sales_channel_id)
    .bind(target.sales_channel_id)
    .bind(target.sales_channel_view_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(map_pending).collect()
}

async fn load_snapshot(
    conn: &mut SqliteConnection,
    resolved: &ResolvedTarget,
) -> Result<Snapshot, StoreError> {
    let target = resolved.target;
    let pending = pending_rows(conn, &target).await?;
    let lineage = match (resolved.is_variation, resolved.parent_remote_product_id) {
        (true, Some(parent_id)) => {
            let parent = target.with_remote_product(parent_id);
            Some(Lineage {
                parent: Some(parent),
                parent_pending: pending_rows(conn, &parent).await?,
                siblings_pending: sibling_pending_rows(conn, &target, parent_id).await?,
            })
        }
        _ => None,
    };
    Ok(Snapshot {
        target,
        pending,
        lineage,
    })
}

async fn apply_plan(
    conn: &mut SqliteConnection,
    resolved: &ResolvedTarget,
    plan: &Plan,
    kwargs: &Map<String, Value>,
) -> Result<ScheduleOutcome, StoreError> {
    let mut inserted: Vec<i64> = Vec::new();
    for write in &plan.writes {
        match write {
            Write::Insert {
                target,
                sync_type,
                status,
                skipped_for,
                reason,
            } => {
                let skipped_for = skipped_for
                    .map(|row| resolve_ref(row, &inserted))
                    .transpose()?;
                let task_func_path =
                    format!("{}.{}", resolved.integration.as_str(), sync_type.task_name());
                let task_kwargs = task_kwargs_for(target, kwargs)?;
                let now = Utc::now();
                let result = sqlx::query(
                    "INSERT INTO sync_requests \
                     (remote_product_id, sales_channel_id, sales_channel_view_id, sync_type, status, \
                      reason, task_func_path, task_kwargs, number_of_remote_requests, skipped_for_id, \
                      attempts, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, 0, ?, ?)",
                )
                .bind(target.remote_product_id)
                .bind(target.sales_channel_id)
                .bind(target.sales_channel_view_id)
                .bind(sync_type.as_str())
                .bind(status.as_str())
                .bind(reason.as_str())
                .bind(task_func_path)
                .bind(task_kwargs)
                .bind(skipped_for)
                .bind(now)
                .bind(now)
                .execute(&mut *conn)
                .await?;
                inserted.push(result.last_insert_rowid());
            }
            Write::Skip { ids, skipped_for } => {
                let skipped_for = resolve_ref(*skipped_for, &inserted)?;
                for id in ids {
                    sqlx::query(
                        "UPDATE sync_requests SET status = 'SKIPPED', skipped_for_id = ?, updated_at = ? \
                         WHERE id = ? AND status = 'PENDING'",
                    )
                    .bind(skipped_for)
                    .bind(Utc::now())
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                }
            }
        }
    }

    Ok(ScheduleOutcome {
        target: resolved.target,
        request_id: resolve_ref(plan.incoming, &inserted)?,
        effective_request_id: resolve_ref(plan.effective, &inserted)?,
        disposition: plan.disposition,
        skipped: plan.skipped_ids(),
    })
}

fn resolve_ref(row: RowRef, inserted: &[i64]) -> Result<i64, StoreError> {
    match row {
        RowRef::Existing(id) => Ok(id),
        RowRef::New(slot) => inserted
            .get(slot)
            .copied()
            .ok_or_else(|| StoreError::Corrupt(format!("plan references missing insert {slot}"))),
    }
}

fn task_kwargs_for(target: &SyncTarget, base: &Map<String, Value>) -> Result<String, StoreError> {
    let mut kwargs = base.clone();
    kwargs.insert("remote_product_id".into(), target.remote_product_id.into());
    kwargs.insert("sales_channel_id".into(), target.sales_channel_id.into());
    kwargs.insert("view_id".into(), target.sales_channel_view_id.into());
    serde_json::to_string(&Value::Object(kwargs))
        .map_err(|err| StoreError::Corrupt(format!("task kwargs: {err}")))
}

fn map_channel(row: &SqliteRow) -> Result<SalesChannel, StoreError> {
    let integration: String = row.try_get("integration")?;
    Ok(SalesChannel {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        name: row.try_get("name")?,
        integration: IntegrationKind::parse(&integration)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown integration {integration}")))?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_view(row: &SqliteRow) -> Result<SalesChannelView, StoreError> {
    Ok(SalesChannelView {
        id: row.try_get("id")?,
        sales_channel_id: row.try_get("sales_channel_id")?,
        name: row.try_get("name")?,
        remote_id: row.try_get("remote_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_remote_product(row: &SqliteRow) -> Result<RemoteProduct, StoreError> {
    Ok(RemoteProduct {
        id: row.try_get("id")?,
        sales_channel_id: row.try_get("sales_channel_id")?,
        local_product_id: row.try_get("local_product_id")?,
        remote_sku: row.try_get("remote_sku")?,
        remote_parent_product_id: row.try_get("remote_parent_product_id")?,
        is_variation: row.try_get("is_variation")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_resolved(row: &SqliteRow) -> Result<ResolvedTarget, StoreError> {
    let integration: String = row.try_get("integration")?;
    Ok(ResolvedTarget {
        target: SyncTarget::new(
            row.try_get("remote_product_id")?,
            row.try_get("sales_channel_id")?,
            row.try_get("view_id")?,
        ),
        is_variation: row.try_get("is_variation")?,
        parent_remote_product_id: row.try_get("remote_parent_product_id")?,
        integration: IntegrationKind::parse(&integration)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown integration {integration}")))?,
    })
}

fn map_pending(row: &SqliteRow) -> Result<PendingRow, StoreError> {
    let sync_type: String = row.try_get("sync_type")?;
    Ok(PendingRow {
        id: row.try_get("id")?,
        remote_product_id: row.try_get("remote_product_id")?,
        sync_type: SyncType::parse(&sync_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown sync_type {sync_type}")))?,
    })
}

fn map_request(row: &SqliteRow) -> Result<SyncRequest, StoreError> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    let kwargs: String = row.try_get("task_kwargs")?;
    Ok(SyncRequest {
        id: row.try_get("id")?,
        remote_product_id: row.try_get("remote_product_id")?,
        sales_channel_id: row.try_get("sales_channel_id")?,
        sales_channel_view_id: row.try_get("sales_channel_view_id")?,
        sync_type: SyncType::parse(&sync_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown sync_type {sync_type}")))?,
        status: SyncStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {status}")))?,
        reason: row.try_get("reason")?,
        task_func_path: row.try_get("task_func_path")?,
        task_kwargs: serde_json::from_str(&kwargs)
            .map_err(|err| StoreError::Corrupt(format!("task kwargs: {err}")))?,
        number_of_remote_requests: row.try_get("number_of_remote_requests")?,
        skipped_for_id: row.try_get("skipped_for_id")?,
        error: row.try_get("error")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sync::types::Disposition;

    pub(crate) const COMPANY: &str = "acme";

    /// Channel with two views; product 1 is a configurable with variations
    /// 2 and 3, product 5 a simple product. Everything is assigned to both
    /// views.
    pub(crate) struct Fixture {
        pub store: SyncStore,
        pub channel: i64,
        pub view_a: i64,
        pub view_b: i64,
        pub parent: i64,
        pub variation_a: i64,
        pub variation_b: i64,
        pub simple: i64,
    }

    pub(crate) async fn fixture() -> Fixture {
        let store = SyncStore::in_memory().await.expect("store");
        fixture_on(store).await
    }

    pub(crate) async fn fixture_on(store: SyncStore) -> Fixture {
        let channel = store
            .create_channel(
                COMPANY,
                &NewSalesChannel {
                    name: "Amazon EU".into(),
                    integration: IntegrationKind::Amazon,
                    active: true,
                },
            )
            .await
            .expect("channel")
            .id;
        let view_a = store
            .create_view(COMPANY, channel, &view_input("DE"))
            .await
            .expect("view a")
            .id;
        let view_b = store
            .create_view(COMPANY, channel, &view_input("FR"))
            .await
            .expect("view b")
            .id;
        let parent = store
            .create_remote_product(COMPANY, channel, &remote(1, None))
            .await
            .expect("parent")
            .id;
        let variation_a = store
            .create_remote_product(COMPANY, channel, &remote(2, Some(parent)))
            .await
            .expect("variation a")
            .id;
        let variation_b = store
            .create_remote_product(COMPANY, channel, &remote(3, Some(parent)))
            .await
            .expect("variation b")
            .id;
        let simple = store
            .create_remote_product(COMPANY, channel, &remote(5, None))
            .await
            .expect("simple")
            .id;
        for view in [view_a, view_b] {
            for product in [1, 5] {
                store
                    .assign_product(COMPANY, view, product)
                    .await
                    .expect("assign");
            }
        }
        Fixture {
            store,
            channel,
            view_a,
            view_b,
            parent,
            variation_a,
            variation_b,
            simple,
        }
    }

    fn view_input(name: &str) -> NewSalesChannelView {
        NewSalesChannelView {
            name: name.into(),
            remote_id: None,
        }
    }

    fn remote(local_product_id: i64, parent: Option<i64>) -> NewRemoteProduct {
        NewRemoteProduct {
            local_product_id,
            remote_sku: Some(format!("SKU-{local_product_id}")),
            remote_parent_product_id: parent,
        }
    }

    fn incoming(sync_type: SyncType) -> Incoming {
        Incoming {
            sync_type,
            reason: "test change".into(),
        }
    }

    impl Fixture {
        pub(crate) async fn schedule_in(
            &self,
            product_id: i64,
            view_id: Option<i64>,
            sync_type: SyncType,
        ) -> Vec<ScheduleOutcome> {
            self.store
                .schedule(
                    COMPANY,
                    TargetScope::Product {
                        product_id,
                        view_id,
                    },
                    &incoming(sync_type),
                    &Map::new(),
                    &DedupePolicy::default(),
                )
                .await
                .expect("schedule")
        }

        pub(crate) async fn requests_for(&self, remote_product_id: i64, view_id: i64) -> Vec<SyncRequest> {
            self.store
                .list_requests(
                    COMPANY,
                    &RequestFilter {
                        remote_product_id: Some(remote_product_id),
                        view_id: Some(view_id),
                        ..RequestFilter::default()
                    },
                )
                .await
                .expect("list")
        }

        pub(crate) async fn pending_products(&self, remote_product_id: i64, view_id: i64) -> usize {
            self.requests_for(remote_product_id, view_id)
                .await
                .iter()
                .filter(|req| req.status == SyncStatus::Pending && req.sync_type.is_product())
                .count()
        }
    }

    #[tokio::test]
    async fn product_update_targets_every_assigned_view() {
        let fx = fixture().await;
        let outcomes = fx.schedule_in(5, None, SyncType::Product).await;
        let views: Vec<i64> = outcomes
            .iter()
            .map(|outcome| outcome.target.sales_channel_view_id)
            .collect();
        assert_eq!(views, vec![fx.view_a, fx.view_b]);

        let request = fx.store.request(COMPANY, outcomes[0].request_id).await.expect("request");
        assert_eq!(request.task_func_path, "amazon.sync_product");
        assert_eq!(request.task_kwargs["view_id"], fx.view_a);
        assert_eq!(request.status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn repeated_property_updates_upgrade_to_one_product_request() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Property).await;
        let outcomes = fx.schedule_in(5, Some(fx.view_a), SyncType::Property).await;
        assert_eq!(outcomes[0].disposition, Disposition::Upgraded);

        let requests = fx.requests_for(fx.simple, fx.view_a).await;
        let pending: Vec<&SyncRequest> = requests
            .iter()
            .filter(|req| req.status == SyncStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_type, SyncType::Product);

        let skipped: Vec<&SyncRequest> = requests
            .iter()
            .filter(|req| req.status == SyncStatus::Skipped)
            .collect();
        assert_eq!(skipped.len(), 2);
        assert!(skipped.iter().all(|req| req.sync_type == SyncType::Property
            && req.skipped_for_id == Some(pending[0].id)));
    }

    #[tokio::test]
    async fn narrower_change_coexists_with_pending_product() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Product).await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Price).await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Price).await;

        let requests = fx.requests_for(fx.simple, fx.view_a).await;
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|req| req.status == SyncStatus::Pending));
        assert_eq!(fx.pending_products(fx.simple, fx.view_a).await, 1);
    }

    #[tokio::test]
    async fn product_change_skips_pending_narrower_requests() {
        let fx = fixture().await;
        let price = fx.schedule_in(5, Some(fx.view_a), SyncType::Price).await[0].request_id;
        let outcome = fx.schedule_in(5, Some(fx.view_a), SyncType::Product).await.remove(0);
        assert_eq!(outcome.skipped, vec![price]);

        let skipped = fx.store.request(COMPANY, price).await.expect("price");
        assert_eq!(skipped.status, SyncStatus::Skipped);
        assert_eq!(skipped.skipped_for_id, Some(outcome.request_id));

        let again = fx.schedule_in(5, Some(fx.view_a), SyncType::Product).await.remove(0);
        assert_eq!(again.disposition, Disposition::Reused);
        assert_eq!(again.request_id, outcome.request_id);
        assert_eq!(fx.pending_products(fx.simple, fx.view_a).await, 1);
    }

    #[tokio::test]
    async fn pending_siblings_escalate_to_parent() {
        let fx = fixture().await;
        let first = fx.schedule_in(2, Some(fx.view_a), SyncType::Product).await.remove(0);
        assert_eq!(first.disposition, Disposition::Queued);
        assert_eq!(first.target.remote_product_id, fx.variation_a);

        let second = fx.schedule_in(3, Some(fx.view_a), SyncType::Product).await.remove(0);
        assert_eq!(second.disposition, Disposition::Escalated);

        let parent_requests = fx.requests_for(fx.parent, fx.view_a).await;
        assert_eq!(parent_requests.len(), 1);
        let parent_request = &parent_requests[0];
        assert_eq!(parent_request.status, SyncStatus::Pending);
        assert_eq!(second.effective_request_id, parent_request.id);

        for variation in [fx.variation_a, fx.variation_b] {
            for req in fx.requests_for(variation, fx.view_a).await {
                assert_eq!(req.status, SyncStatus::Skipped);
                let effective = fx
                    .store
                    .effective_request(COMPANY, req.id)
                    .await
                    .expect("chain");
                assert_eq!(effective.id, parent_request.id);
            }
        }
    }

    #[tokio::test]
    async fn escalation_chains_variation_narrower_rows_transitively() {
        let fx = fixture().await;
        fx.schedule_in(3, Some(fx.view_a), SyncType::Product).await;
        let price = fx.schedule_in(2, Some(fx.view_a), SyncType::Price).await[0].request_id;
        // variation a now has a pending price and its sibling a pending product
        let outcome = fx.schedule_in(2, Some(fx.view_a), SyncType::Product).await.remove(0);
        assert_eq!(outcome.disposition, Disposition::Escalated);

        let price_row = fx.store.request(COMPANY, price).await.expect("price");
        assert_eq!(price_row.skipped_for_id, Some(outcome.request_id));
        let effective = fx.store.effective_request(COMPANY, price).await.expect("chain");
        assert_eq!(effective.remote_product_id, fx.parent);
        assert_eq!(fx.pending_products(fx.parent, fx.view_a).await, 1);
    }

    #[tokio::test]
    async fn views_are_isolated() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Content).await;
        fx.schedule_in(5, Some(fx.view_b), SyncType::Product).await;
        fx.schedule_in(3, Some(fx.view_b), SyncType::Product).await;
        fx.schedule_in(2, Some(fx.view_b), SyncType::Product).await;

        let view_a = fx.requests_for(fx.simple, fx.view_a).await;
        assert_eq!(view_a.len(), 1);
        assert_eq!(view_a[0].status, SyncStatus::Pending);
        assert_eq!(view_a[0].sync_type, SyncType::Content);
        assert!(fx.requests_for(fx.parent, fx.view_a).await.is_empty());
        assert_eq!(fx.pending_products(fx.parent, fx.view_b).await, 1);
    }

    #[tokio::test]
    async fn variation_membership_change_resyncs_parent() {
        let fx = fixture().await;
        let store = &fx.store;
        let outcomes = store
            .schedule(
                COMPANY,
                TargetScope::Product {
                    product_id: 1,
                    view_id: None,
                },
                &incoming(SyncType::Product),
                &Map::new(),
                &DedupePolicy::default(),
            )
            .await
            .expect("schedule");
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.target.remote_product_id == fx.parent));
    }

    #[tokio::test]
    async fn unassigned_or_foreign_products_resolve_to_nothing() {
        let fx = fixture().await;
        assert!(fx.schedule_in(42, None, SyncType::Product).await.is_empty());

        let foreign = fx
            .store
            .schedule(
                "other-company",
                TargetScope::Product {
                    product_id: 5,
                    view_id: None,
                },
                &incoming(SyncType::Product),
                &Map::new(),
                &DedupePolicy::default(),
            )
            .await
            .expect("schedule");
        assert!(foreign.is_empty());

        assert!(
            fx.store
                .unassign_product(COMPANY, fx.view_b, 5)
                .await
                .expect("unassign")
        );
        let outcomes = fx.schedule_in(5, None, SyncType::Ean).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].target.sales_channel_view_id, fx.view_a);
    }

    #[tokio::test]
    async fn database_rejects_second_pending_product() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Product).await;
        let duplicate = sqlx::query(
            "INSERT INTO sync_requests (remote_product_id, sales_channel_id, sales_channel_view_id, \
             sync_type, status, task_func_path, created_at, updated_at) \
             VALUES (?, ?, ?, 'PRODUCT', 'PENDING', 'amazon.sync_product', ?, ?)",
        )
        .bind(fx.simple)
        .bind(fx.channel)
        .bind(fx.view_a)
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&fx.store.pool)
        .await
        .map_err(StoreError::from)
        .expect_err("unique index");
        assert!(duplicate.is_transient());
    }

    #[tokio::test]
    async fn claim_moves_rows_out_of_pending() {
        let fx = fixture().await;
        let first = fx.schedule_in(5, Some(fx.view_a), SyncType::Product).await.remove(0);
        let claimed = fx.store.claim_next().await.expect("claim").expect("row");
        assert_eq!(claimed.id, first.request_id);
        assert_eq!(claimed.status, SyncStatus::Processing);
        assert_eq!(claimed.attempts, 1);

        // a change during execution queues a new full sync
        let during = fx.schedule_in(5, Some(fx.view_a), SyncType::Product).await.remove(0);
        assert_ne!(during.request_id, first.request_id);

        fx.store.complete(claimed.id, 3).await.expect("complete");
        let done = fx.store.request(COMPANY, claimed.id).await.expect("done");
        assert_eq!(done.status, SyncStatus::Done);
        assert_eq!(done.number_of_remote_requests, 3);
    }

    #[tokio::test]
    async fn interrupted_claims_are_failed_on_recovery() {
        let fx = fixture().await;
        fx.schedule_in(5, Some(fx.view_a), SyncType::Images).await;
        let claimed = fx.store.claim_next().await.expect("claim").expect("row");
        assert_eq!(fx.store.recover_interrupted().await.expect("recover"), 1);
        let failed = fx.store.request(COMPANY, claimed.id).await.expect("row");
        assert_eq!(failed.status, SyncStatus::Failed);
        assert!(fx.store.claim_next().await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn variation_parent_must_share_channel() {
        let fx = fixture().await;
        let other = fx
            .store
            .create_channel(
                COMPANY,
                &NewSalesChannel {
                    name: "Shopify".into(),
                    integration: IntegrationKind::Shopify,
                    active: true,
                },
            )
            .await
            .expect("channel");
        let err = fx
            .store
            .create_remote_product(COMPANY, other.id, &remote(2, Some(fx.parent)))
            .await
            .expect_err("cross channel parent");
        assert!(matches!(err, StoreError::Invalid(_)));
    }
}
