//! Provider 状态持久化
//!
//! StateStore 按 (step_id, scope) 存取 Provider 自定义的 JSON 载荷：
//! - Shared：协作处理同一步骤的任意 Agent 可见（跨进程一致性由存储实现负责，后写者胜）
//! - Private：仅驱动该步骤的 Agent 实例可见
//!
//! 提供 InMemoryStateStore（测试 / 默认）与 SqliteStateStore（rusqlite，调用放入 spawn_blocking）。

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::StateError;

/// 状态可见范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateScope {
    Shared,
    Private,
}

impl StateScope {
    pub fn is_shared(self) -> bool {
        matches!(self, StateScope::Shared)
    }
}

/// 状态持久化协作方
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 读取状态；不存在时返回 None
    async fn get_state(&self, step_id: &str, scope: StateScope) -> Result<Option<Value>, StateError>;

    /// 写入（覆盖）状态
    async fn save_state(&self, step_id: &str, scope: StateScope, value: Value) -> Result<(), StateError>;

    /// 删除状态；不存在时视为成功
    async fn delete_state(&self, step_id: &str, scope: StateScope) -> Result<(), StateError>;
}

/// 内存状态存储（进程内）
#[derive(Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<(String, StateScope), Value>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_state(&self, step_id: &str, scope: StateScope) -> Result<Option<Value>, StateError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&(step_id.to_string(), scope))
            .cloned())
    }

    async fn save_state(&self, step_id: &str, scope: StateScope, value: Value) -> Result<(), StateError> {
        self.entries
            .write()
            .await
            .insert((step_id.to_string(), scope), value);
        Ok(())
    }

    async fn delete_state(&self, step_id: &str, scope: StateScope) -> Result<(), StateError> {
        self.entries
            .write()
            .await
            .remove(&(step_id.to_string(), scope));
        Ok(())
    }
}

/// SQLite 状态存储；Private 行以 owner（Agent ID）区分，多个 Agent 可共用同一数据库文件
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
    owner: String,
}

impl SqliteStateStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>, owner: impl Into<String>) -> Result<Self, StateError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StateError::Unavailable(e.to_string()))?;
            }
        }
        let conn = Connection::open(path.as_ref()).map_err(sqlite_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS provider_state (
                step_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (step_id, scope)
            )",
        )
        .map_err(sqlite_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            owner: owner.into(),
        })
    }

    fn scope_key(&self, scope: StateScope) -> String {
        match scope {
            StateScope::Shared => "shared".to_string(),
            StateScope::Private => format!("private/{}", self.owner),
        }
    }

    /// 在阻塞线程池上执行同步 SQLite 操作
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StateError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StateError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StateError::Unavailable("sqlite connection poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StateError::Join(e.to_string()))?
    }
}

fn sqlite_err(e: rusqlite::Error) -> StateError {
    StateError::Unavailable(e.to_string())
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get_state(&self, step_id: &str, scope: StateScope) -> Result<Option<Value>, StateError> {
        let step_id = step_id.to_string();
        let scope = self.scope_key(scope);
        let payload: Option<String> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT payload FROM provider_state WHERE step_id = ?1 AND scope = ?2",
                    params![step_id, scope],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)
            })
            .await?;
        match payload {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn save_state(&self, step_id: &str, scope: StateScope, value: Value) -> Result<(), StateError> {
        let step_id = step_id.to_string();
        let scope = self.scope_key(scope);
        let payload = serde_json::to_string(&value)?;
        let updated_at = chrono::Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO provider_state (step_id, scope, payload, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(step_id, scope) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
                params![step_id, scope, payload, updated_at],
            )
            .map(|_| ())
            .map_err(sqlite_err)
        })
        .await
    }

    async fn delete_state(&self, step_id: &str, scope: StateScope) -> Result<(), StateError> {
        let step_id = step_id.to_string();
        let scope = self.scope_key(scope);
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM provider_state WHERE step_id = ?1 AND scope = ?2",
                params![step_id, scope],
            )
            .map(|_| ())
            .map_err(sqlite_err)
        })
        .await
    }
}
