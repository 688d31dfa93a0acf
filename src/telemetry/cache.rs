//! 遥测查询缓存
//!
//! 进程级缓存服务，必须先用 initialize / initialize_with_settings 注入查询发起方（只有第一个初始化者生效）。
//! 单飞：同一 key 的并发请求合并为一次底层查询，所有等待者拿到同一个 Arc<TelemetryTable>；
//! 不同 key 互不阻塞。
//!
//! 过期策略：条目在 ttl 之后失效（ttl 为 None 时在进程生命周期内有效），invalidate 可显式使其失效。
//! 查询失败不缓存：已在排队的等待者共享这次失败，之后到来的调用方重新发起查询。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorClass, QueryError};
use crate::telemetry::issuer::{ConnectionSettings, QueryIssuer, QueryIssuerSettings};
use crate::telemetry::table::TelemetryTable;

/// 默认缓存有效期
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Telemetry cache used before initialization")]
    NotInitialized,

    #[error("Telemetry cache is already initialized")]
    AlreadyInitialized,

    #[error("Invalid cache request: {0}")]
    InvalidArgument(&'static str),

    #[error("Query failed: {0}")]
    Query(#[from] QueryError),

    #[error("Cache request cancelled")]
    Cancelled,
}

impl CacheError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CacheError::NotInitialized | CacheError::AlreadyInitialized | CacheError::InvalidArgument(_) => {
                ErrorClass::Configuration
            }
            CacheError::Query(e) => e.class(),
            CacheError::Cancelled => ErrorClass::Cancellation,
        }
    }
}

struct CachedTable {
    table: Arc<TelemetryTable>,
    fetched_at: Instant,
    /// 发起查询时槽位的纪元
    epoch: u64,
}

#[derive(Default)]
struct SlotEntry {
    cached: Option<CachedTable>,
    /// 最近一次失败：(完成序号, 错误)，只分享给在它完成前就开始等待的调用方
    last_failure: Option<(u64, CacheError)>,
}

/// 每个 key 一个槽位；持有 entry 锁即为该 key 唯一的在途查询。槽位一旦创建就不会从表中移除。
#[derive(Default)]
struct Slot {
    entry: tokio::sync::Mutex<SlotEntry>,
    /// invalidate / clear 递增；纪元不一致的缓存条目视为过期
    epoch: AtomicU64,
    /// 已完成（成功或失败）的查询次数
    completed: AtomicU64,
}

pub struct TelemetryCache {
    issuer: OnceLock<Arc<dyn QueryIssuer>>,
    ttl: Option<Duration>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl TelemetryCache {
    /// ttl 为 None 表示不过期
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            issuer: OnceLock::new(),
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// 直接注入查询发起方；重复初始化返回 AlreadyInitialized
    pub fn initialize(&self, issuer: Arc<dyn QueryIssuer>) -> Result<(), CacheError> {
        self.issuer
            .set(issuer)
            .map_err(|_| CacheError::AlreadyInitialized)?;
        tracing::info!(ttl_secs = ?self.ttl.map(|d| d.as_secs()), "Telemetry cache initialized");
        Ok(())
    }

    /// 由配置构建 HttpQueryIssuer 后初始化
    pub fn initialize_with_settings(&self, settings: &QueryIssuerSettings) -> Result<(), CacheError> {
        if self.is_initialized() {
            return Err(CacheError::AlreadyInitialized);
        }
        let issuer = settings.build()?;
        self.initialize(Arc::new(issuer))
    }

    pub fn is_initialized(&self) -> bool {
        self.issuer.get().is_some()
    }

    /// 获取查询结果：命中直接返回；未命中则发起查询并缓存。
    /// 同一 key 的并发调用只查询一次，成功或失败的结果都由排队中的等待者共享。
    pub async fn get_response(
        &self,
        cache_key: &str,
        connection: &ConnectionSettings,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<TelemetryTable>, CacheError> {
        if cache_key.trim().is_empty() {
            return Err(CacheError::InvalidArgument("cache key must not be empty"));
        }
        if query.trim().is_empty() {
            return Err(CacheError::InvalidArgument("query must not be empty"));
        }
        let endpoint = connection
            .endpoint
            .as_deref()
            .ok_or(CacheError::InvalidArgument("connection settings must carry an endpoint"))?;
        let database = connection
            .database
            .as_deref()
            .ok_or(CacheError::InvalidArgument("connection settings must carry a database"))?;
        let issuer = self.issuer.get().ok_or(CacheError::NotInitialized)?;

        let slot = self.slot(cache_key);
        // 必须在排队之前读取
        let seen = slot.completed.load(Ordering::Acquire);
        let mut entry = tokio::select! {
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            entry = slot.entry.lock() => entry,
        };

        if let Some(cached) = entry.cached.as_ref() {
            if self.is_fresh(&slot, cached) {
                tracing::debug!(cache_key, "Telemetry cache hit");
                return Ok(Arc::clone(&cached.table));
            }
        }
        if let Some((completed, err)) = entry.last_failure.as_ref() {
            if *completed > seen {
                tracing::debug!(cache_key, "Sharing failure of the fetch this caller waited on");
                return Err(err.clone());
            }
        }

        let epoch = slot.epoch.load(Ordering::Acquire);
        let start = Instant::now();
        let fetched = tokio::select! {
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            result = issuer.issue(query, endpoint, database) => result,
        };
        let completed = slot.completed.fetch_add(1, Ordering::AcqRel) + 1;

        match fetched {
            Ok(table) => {
                let table = Arc::new(table);
                tracing::debug!(
                    cache_key,
                    rows = table.row_count(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Telemetry query completed"
                );
                entry.cached = Some(CachedTable {
                    table: Arc::clone(&table),
                    fetched_at: Instant::now(),
                    epoch,
                });
                entry.last_failure = None;
                Ok(table)
            }
            Err(e) => {
                tracing::warn!(cache_key, error = %e, "Telemetry query failed");
                let err = CacheError::Query(e);
                entry.last_failure = Some((completed, err.clone()));
                Err(err)
            }
        }
    }

    /// 使单个条目失效；在途查询写回的结果同样视为过期，槽位与锁保留
    pub fn invalidate(&self, cache_key: &str) {
        if let Some(slot) = self.lock_slots().get(cache_key) {
            slot.epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn clear(&self) {
        for slot in self.lock_slots().values() {
            slot.epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn is_fresh(&self, slot: &Slot, cached: &CachedTable) -> bool {
        if cached.epoch != slot.epoch.load(Ordering::Acquire) {
            return false;
        }
        match self.ttl {
            Some(ttl) => cached.fetched_at.elapsed() < ttl,
            None => true,
        }
    }

    fn slot(&self, cache_key: &str) -> Arc<Slot> {
        Arc::clone(self.lock_slots().entry(cache_key.to_string()).or_default())
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        // 持锁区间内不会 panic，毒化时沿用内部数据
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TelemetryCache {
    fn default() -> Self {
        Self::new(Some(DEFAULT_CACHE_TTL))
    }
}
