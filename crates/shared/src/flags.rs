//! Feature flag lookup with an explicit TTL cache
//!
//! Flags are read through a [`FlagCache`] constructed once at startup and
//! handed to the services that need it. The cache keeps a snapshot of every
//! flag for `ttl` and is invalidated on each write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Enables AutoFixer during scheduled and manual reconciliation
pub const AUTO_FIX_RECONCILIATION: &str = "auto_fix_reconciliation";
/// Skips scheduled jobs while set
pub const MAINTENANCE_MODE: &str = "maintenance_mode";

pub const DEFAULT_FLAG_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum FlagError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Backing store for flags
#[async_trait]
pub trait FlagSource: Send + Sync {
    async fn load_all(&self) -> Result<HashMap<String, bool>, FlagError>;
    async fn store(&self, key: &str, enabled: bool) -> Result<(), FlagError>;
}

/// Flags stored in the `feature_flags` table
pub struct PgFlagSource {
    pool: PgPool,
}

impl PgFlagSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlagSource for PgFlagSource {
    async fn load_all(&self) -> Result<HashMap<String, bool>, FlagError> {
        let rows: Vec<(String, bool)> = sqlx::query_as("SELECT key, enabled FROM feature_flags")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn store(&self, key: &str, enabled: bool) -> Result<(), FlagError> {
        sqlx::query(
            r#"
            INSERT INTO feature_flags (key, enabled, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key) DO UPDATE SET enabled = EXCLUDED.enabled, updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// In-process flag source, used by tests and local runs without a database
#[derive(Default)]
pub struct StaticFlagSource {
    flags: std::sync::Mutex<HashMap<String, bool>>,
    loads: std::sync::atomic::AtomicUsize,
}

impl StaticFlagSource {
    pub fn new(flags: &[(&str, bool)]) -> Self {
        Self {
            flags: std::sync::Mutex::new(
                flags.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ),
            loads: Default::default(),
        }
    }

    /// Number of times the cache went to the source
    pub fn load_count(&self) -> usize {
        self.loads.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Change a flag behind the cache's back (simulates another process writing)
    pub fn set_external(&self, key: &str, enabled: bool) {
        if let Ok(mut flags) = self.flags.lock() {
            flags.insert(key.to_string(), enabled);
        }
    }
}

#[async_trait]
impl FlagSource for StaticFlagSource {
    async fn load_all(&self) -> Result<HashMap<String, bool>, FlagError> {
        self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self.flags.lock().map(|f| f.clone()).unwrap_or_default())
    }

    async fn store(&self, key: &str, enabled: bool) -> Result<(), FlagError> {
        self.set_external(key, enabled);
        Ok(())
    }
}

struct Snapshot {
    loaded_at: Instant,
    flags: HashMap<String, bool>,
}

/// TTL cache over a [`FlagSource`]
#[derive(Clone)]
pub struct FlagCache {
    source: Arc<dyn FlagSource>,
    ttl: Duration,
    snapshot: Arc<RwLock<Option<Snapshot>>>,
}

impl FlagCache {
    pub fn new(source: Arc<dyn FlagSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    /// Whether `key` is enabled. Unknown flags and load failures read as `false`.
    pub async fn is_enabled(&self, key: &str) -> bool {
        {
            let guard = self.snapshot.read().await;
            if let Some(snapshot) = guard.as_ref() {
                if snapshot.loaded_at.elapsed() < self.ttl {
                    return snapshot.flags.get(key).copied().unwrap_or(false);
                }
            }
        }

        let mut guard = self.snapshot.write().await;
        // Another task may have refreshed while we waited for the write lock
        if let Some(snapshot) = guard.as_ref() {
            if snapshot.loaded_at.elapsed() < self.ttl {
                return snapshot.flags.get(key).copied().unwrap_or(false);
            }
        }

        match self.source.load_all().await {
            Ok(flags) => {
                let enabled = flags.get(key).copied().unwrap_or(false);
                *guard = Some(Snapshot {
                    loaded_at: Instant::now(),
                    flags,
                });
                enabled
            }
            Err(e) => {
                tracing::warn!(flag = key, error = %e, "Failed to load feature flags, treating as disabled");
                false
            }
        }
    }

    /// Write a flag through to the source and drop the cached snapshot
    pub async fn set(&self, key: &str, enabled: bool) -> Result<(), FlagError> {
        self.source.store(key, enabled).await?;
        self.invalidate().await;
        tracing::info!(flag = key, enabled = enabled, "Feature flag updated");
        Ok(())
    }

    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }
}
