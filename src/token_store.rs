// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Segment token persistence.
//!
//! Stores one [`SegmentToken`] per segment per processing group. The store
//! is the source of truth for pull-mode positions and for the pinned
//! replay boundary.
//!
//! # Atomic Operations
//!
//! The reset protocol relies on two operations that must cover every
//! segment of a group as one unit:
//!
//! - [`SegmentTokenStore::pin_segments`]: overwrite every segment with the
//!   pinned head, or initialize the segments at it if none exist
//! - [`SegmentTokenStore::store_tokens`]: write the composite reset tokens
//!
//! A partial write would let a segment start consuming with a stale
//! boundary, so both run in a single SQLite transaction.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff
//! (max 5 attempts). The whole transaction is retried, never a fragment.

use crate::config::TokenStoreConfig;
use crate::error::{ReplayError, Result};
use crate::event_log::BoxFuture;
use crate::token::{SegmentToken, Token};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Persistent per-segment token storage.
pub trait SegmentTokenStore: Send + Sync + 'static {
    /// Segment indexes known for a group, ascending.
    fn fetch_segments(&self, group: &str) -> BoxFuture<'_, Vec<u32>>;

    /// Token of one segment, if it exists.
    fn fetch_token(&self, group: &str, segment: u32) -> BoxFuture<'_, Option<SegmentToken>>;

    /// Upsert the token of one segment.
    fn store_token(&self, group: &str, segment: u32, token: SegmentToken) -> BoxFuture<'_, ()>;

    /// Create `count` segments at `token` unless the group already has
    /// segments. Returns the group's segments either way.
    fn initialize_segments(&self, group: &str, count: u32, token: SegmentToken) -> BoxFuture<'_, Vec<u32>>;

    /// Atomically move every existing segment to `Tracking(pinned)`, or
    /// initialize `initial_count` segments there if none exist.
    fn pin_segments(&self, group: &str, initial_count: u32, pinned: Token) -> BoxFuture<'_, Vec<u32>>;

    /// Atomically upsert several segment tokens.
    fn store_tokens(&self, group: &str, tokens: Vec<(u32, SegmentToken)>) -> BoxFuture<'_, ()>;

    /// Release resources. Default: nothing to do.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Token store held in memory (tests and standalone mode).
#[derive(Default)]
pub struct InMemoryTokenStore {
    groups: RwLock<HashMap<String, BTreeMap<u32, SegmentToken>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All tokens of a group (for assertions).
    pub async fn tokens(&self, group: &str) -> BTreeMap<u32, SegmentToken> {
        self.groups.read().await.get(group).cloned().unwrap_or_default()
    }
}

impl SegmentTokenStore for InMemoryTokenStore {
    fn fetch_segments(&self, group: &str) -> BoxFuture<'_, Vec<u32>> {
        let group = group.to_string();
        Box::pin(async move {
            Ok(self
                .groups
                .read()
                .await
                .get(&group)
                .map(|segments| segments.keys().copied().collect())
                .unwrap_or_default())
        })
    }

    fn fetch_token(&self, group: &str, segment: u32) -> BoxFuture<'_, Option<SegmentToken>> {
        let group = group.to_string();
        Box::pin(async move {
            Ok(self
                .groups
                .read()
                .await
                .get(&group)
                .and_then(|segments| segments.get(&segment).copied()))
        })
    }

    fn store_token(&self, group: &str, segment: u32, token: SegmentToken) -> BoxFuture<'_, ()> {
        let group = group.to_string();
        Box::pin(async move {
            self.groups
                .write()
                .await
                .entry(group)
                .or_default()
                .insert(segment, token);
            Ok(())
        })
    }

    fn initialize_segments(&self, group: &str, count: u32, token: SegmentToken) -> BoxFuture<'_, Vec<u32>> {
        let group = group.to_string();
        Box::pin(async move {
            let mut groups = self.groups.write().await;
            let segments = groups.entry(group).or_default();
            if segments.is_empty() {
                for segment in 0..count {
                    segments.insert(segment, token);
                }
            }
            Ok(segments.keys().copied().collect())
        })
    }

    fn pin_segments(&self, group: &str, initial_count: u32, pinned: Token) -> BoxFuture<'_, Vec<u32>> {
        let group = group.to_string();
        Box::pin(async move {
            let mut groups = self.groups.write().await;
            let segments = groups.entry(group).or_default();
            let token = SegmentToken::tracking(pinned);
            if segments.is_empty() {
                for segment in 0..initial_count {
                    segments.insert(segment, token);
                }
            } else {
                for stored in segments.values_mut() {
                    *stored = token;
                }
            }
            Ok(segments.keys().copied().collect())
        })
    }

    fn store_tokens(&self, group: &str, tokens: Vec<(u32, SegmentToken)>) -> BoxFuture<'_, ()> {
        let group = group.to_string();
        Box::pin(async move {
            let mut groups = self.groups.write().await;
            let segments = groups.entry(group).or_default();
            segments.extend(tokens);
            Ok(())
        })
    }
}

// =============================================================================
// SQLite store
// =============================================================================

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::token_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn decode_segment(segment: i64) -> Result<u32> {
    u32::try_from(segment)
        .map_err(|_| ReplayError::TokenCodec(format!("segment index out of range: {}", segment)))
}

/// Token store backed by SQLite.
pub struct SqliteTokenStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteTokenStore {
    /// Open (creating if needed) a store at `path` with WAL enabled.
    pub async fn new(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let config = TokenStoreConfig {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            ..TokenStoreConfig::default()
        };
        Self::open(&config).await
    }

    /// Open a store from configuration. `":memory:"` gives a private
    /// in-memory database.
    pub async fn open(config: &TokenStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        let in_memory = config.is_in_memory();
        info!(path = %path, "Initializing segment token store");

        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplayError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);
        if config.wal_mode && !in_memory {
            options = options.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        // Each in-memory connection is its own database: keep exactly one.
        let max_connections = if in_memory { 1 } else { 2 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segment_tokens (
                group_name TEXT NOT NULL,
                segment INTEGER NOT NULL,
                token TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (group_name, segment)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("token_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

impl SegmentTokenStore for SqliteTokenStore {
    fn fetch_segments(&self, group: &str) -> BoxFuture<'_, Vec<u32>> {
        let group = group.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let rows: Vec<(i64,)> = execute_with_retry("fetch_segments", || async {
                sqlx::query_as("SELECT segment FROM segment_tokens WHERE group_name = ? ORDER BY segment")
                    .bind(&group)
                    .fetch_all(pool)
                    .await
            })
            .await?;
            rows.into_iter().map(|(segment,)| decode_segment(segment)).collect()
        })
    }

    fn fetch_token(&self, group: &str, segment: u32) -> BoxFuture<'_, Option<SegmentToken>> {
        let group = group.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let row: Option<(String,)> = execute_with_retry("fetch_token", || async {
                sqlx::query_as("SELECT token FROM segment_tokens WHERE group_name = ? AND segment = ?")
                    .bind(&group)
                    .bind(segment as i64)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
            row.map(|(raw,)| SegmentToken::decode(&raw)).transpose()
        })
    }

    fn store_token(&self, group: &str, segment: u32, token: SegmentToken) -> BoxFuture<'_, ()> {
        let group = group.to_string();
        Box::pin(async move {
            let encoded = token.encode()?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            execute_with_retry("store_token", || async {
                sqlx::query(
                    r#"
                    INSERT INTO segment_tokens (group_name, segment, token, updated_at)
                    VALUES (?, ?, ?, ?)
                    ON CONFLICT(group_name, segment) DO UPDATE SET
                        token = excluded.token,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&group)
                .bind(segment as i64)
                .bind(&encoded)
                .bind(now)
                .execute(pool)
                .await
            })
            .await?;
            Ok(())
        })
    }

    fn initialize_segments(&self, group: &str, count: u32, token: SegmentToken) -> BoxFuture<'_, Vec<u32>> {
        let group = group.to_string();
        Box::pin(async move {
            let encoded = token.encode()?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            let rows: Vec<(i64,)> = execute_with_retry("initialize_segments", || async {
                let mut tx = pool.begin().await?;
                let existing: Vec<(i64,)> =
                    sqlx::query_as("SELECT segment FROM segment_tokens WHERE group_name = ? ORDER BY segment")
                        .bind(&group)
                        .fetch_all(&mut *tx)
                        .await?;
                if !existing.is_empty() {
                    tx.rollback().await?;
                    return Ok(existing);
                }
                for segment in 0..count {
                    sqlx::query(
                        "INSERT INTO segment_tokens (group_name, segment, token, updated_at) VALUES (?, ?, ?, ?)",
                    )
                    .bind(&group)
                    .bind(segment as i64)
                    .bind(&encoded)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok((0..count as i64).map(|s| (s,)).collect())
            })
            .await?;
            info!(group = %group, segments = rows.len(), "Segments initialized");
            rows.into_iter().map(|(segment,)| decode_segment(segment)).collect()
        })
    }

    fn pin_segments(&self, group: &str, initial_count: u32, pinned: Token) -> BoxFuture<'_, Vec<u32>> {
        let group = group.to_string();
        Box::pin(async move {
            let encoded = SegmentToken::tracking(pinned).encode()?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            let rows: Vec<(i64,)> = execute_with_retry("pin_segments", || async {
                let mut tx = pool.begin().await?;
                let existing: Vec<(i64,)> =
                    sqlx::query_as("SELECT segment FROM segment_tokens WHERE group_name = ? ORDER BY segment")
                        .bind(&group)
                        .fetch_all(&mut *tx)
                        .await?;
                let segments: Vec<(i64,)> = if existing.is_empty() {
                    (0..initial_count as i64).map(|s| (s,)).collect()
                } else {
                    existing
                };
                for (segment,) in &segments {
                    sqlx::query(
                        r#"
                        INSERT INTO segment_tokens (group_name, segment, token, updated_at)
                        VALUES (?, ?, ?, ?)
                        ON CONFLICT(group_name, segment) DO UPDATE SET
                            token = excluded.token,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&group)
                    .bind(*segment)
                    .bind(&encoded)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok(segments)
            })
            .await?;
            debug!(group = %group, pinned = %pinned, segments = rows.len(), "Segments pinned");
            rows.into_iter().map(|(segment,)| decode_segment(segment)).collect()
        })
    }

    fn store_tokens(&self, group: &str, tokens: Vec<(u32, SegmentToken)>) -> BoxFuture<'_, ()> {
        let group = group.to_string();
        Box::pin(async move {
            let encoded: Vec<(i64, String)> = tokens
                .iter()
                .map(|(segment, token)| Ok((*segment as i64, token.encode()?)))
                .collect::<Result<_>>()?;
            let now = chrono::Utc::now().timestamp_millis();
            let pool = &self.pool;
            execute_with_retry("store_tokens", || async {
                let mut tx = pool.begin().await?;
                for (segment, token) in &encoded {
                    sqlx::query(
                        r#"
                        INSERT INTO segment_tokens (group_name, segment, token, updated_at)
                        VALUES (?, ?, ?, ?)
                        ON CONFLICT(group_name, segment) DO UPDATE SET
                            token = excluded.token,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&group)
                    .bind(*segment)
                    .bind(token)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await
            })
            .await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.path.is_empty() && self.path != ":memory:" {
                if let Err(e) = self.checkpoint().await {
                    warn!(error = %e, "Failed to checkpoint WAL on close");
                }
            }
            self.pool.close().await;
            info!("Segment token store closed");
            Ok(())
        })
    }
}
