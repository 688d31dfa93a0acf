//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CRUCIBLE__*` 覆盖（双下划线表示嵌套，如 `CRUCIBLE__AGENT__ID=node-17`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent::AgentLoopConfig;
use crate::telemetry::{ConnectionSettings, QueryIssuerSettings};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub api: ApiSection,
    pub state: StateSection,
    pub telemetry: TelemetrySection,
    pub scheduler: SchedulerSection,
}

/// [agent] 段：Agent 身份与轮询节奏
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Agent ID，未设置时用主机名（环境变量 HOSTNAME）
    pub id: Option<String>,
    pub poll_interval_secs: u64,
    /// 同一轮内并行处理的步骤数，1 为串行
    pub max_parallel_steps: usize,
    /// Provider 返回 InProgress 但未给延期时使用
    pub default_extension_secs: u64,
    /// InProgress 上限（秒），未设置表示不限制
    pub max_in_progress_secs: Option<u64>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            poll_interval_secs: 30,
            max_parallel_steps: 1,
            default_extension_secs: 60,
            max_in_progress_secs: None,
        }
    }
}

/// [api] 段：实验管理 API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout_secs: 30,
        }
    }
}

/// [state] 段：Provider 状态存储；sqlite_path 未设置时使用内存存储
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateSection {
    pub sqlite_path: Option<PathBuf>,
}

/// [telemetry] 段：分析后端与查询缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    pub endpoint: Option<String>,
    pub database: Option<String>,
    pub query_timeout_secs: u64,
    /// 缓存有效期（秒），0 表示进程内永不过期
    pub cache_ttl_secs: u64,
    pub auth_token: Option<String>,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            endpoint: None,
            database: None,
            query_timeout_secs: 30,
            cache_ttl_secs: 300,
            auth_token: None,
        }
    }
}

/// [scheduler] 段：触发器评估节奏与触发器清单
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub cadence_secs: u64,
    /// 触发器清单（JSON 数组）
    pub triggers_path: Option<PathBuf>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            cadence_secs: 300,
            triggers_path: None,
        }
    }
}

impl AppConfig {
    /// 解析 Agent ID：配置优先，其次 HOSTNAME
    pub fn agent_id(&self) -> Result<String, ConfigError> {
        self.agent
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .ok_or_else(|| ConfigError::Invalid("agent.id is not set and HOSTNAME is unavailable".to_string()))
    }

    pub fn agent_loop_config(&self) -> Result<AgentLoopConfig, ConfigError> {
        if self.agent.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("agent.poll_interval_secs must be positive".to_string()));
        }
        Ok(AgentLoopConfig::new(self.agent_id()?)
            .with_poll_interval(Duration::from_secs(self.agent.poll_interval_secs))
            .with_max_parallel_steps(self.agent.max_parallel_steps)
            .with_max_in_progress(self.agent.max_in_progress_secs.map(Duration::from_secs)))
    }

    pub fn default_extension(&self) -> Duration {
        Duration::from_secs(self.agent.default_extension_secs)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            endpoint: self.telemetry.endpoint.clone(),
            database: self.telemetry.database.clone(),
        }
    }

    pub fn query_issuer_settings(&self) -> QueryIssuerSettings {
        QueryIssuerSettings {
            timeout_secs: self.telemetry.query_timeout_secs,
            auth_token: self.telemetry.auth_token.clone(),
        }
    }

    /// 缓存 TTL；0 映射为 None（不过期）
    pub fn cache_ttl(&self) -> Option<Duration> {
        match self.telemetry.cache_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn scheduler_cadence(&self) -> Duration {
        Duration::from_secs(self.scheduler.cadence_secs.max(1))
    }
}

/// 从 config 目录加载配置，环境变量 CRUCIBLE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CRUCIBLE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CRUCIBLE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    Ok(c.try_deserialize()?)
}
