//! crucible-agent：Agent 宿主
//!
//! 入口：初始化日志、加载配置、组装 Provider 注册表 / 状态存储 / 分配 API 客户端 / 执行引擎，
//! 运行 Agent 执行循环直到 Ctrl+C 或 SIGTERM。
//! 用法：crucible-agent [config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use crucible::config::load_config;
use crucible::core::ShutdownManager;
use crucible::engine::{InMemoryStateStore, SqliteStateStore, StateStore, StepExecutionEngine};
use crucible::experiment::HttpAssignmentClient;
use crucible::providers::{register_builtin, ProviderRegistry};
use crucible::{observability, AgentExecutionLoop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;
    let loop_config = config.agent_loop_config().context("Invalid agent configuration")?;

    let mut registry = ProviderRegistry::new();
    register_builtin(&mut registry).context("Failed to register built-in providers")?;
    tracing::info!(providers = registry.len(), "Provider registry ready");

    let store: Arc<dyn StateStore> = match &config.state.sqlite_path {
        Some(path) => {
            let store = SqliteStateStore::open(path, loop_config.agent_id.clone())
                .with_context(|| format!("Failed to open state store {}", path.display()))?;
            tracing::info!(path = %path.display(), "Using SQLite state store");
            Arc::new(store)
        }
        None => {
            tracing::warn!("No state.sqlite_path configured, provider state will not survive restarts");
            Arc::new(InMemoryStateStore::new())
        }
    };

    let client = HttpAssignmentClient::new(&config.api.base_url, config.api.timeout_secs)
        .context("Failed to build assignment client")?;
    let engine = StepExecutionEngine::new(store).with_default_extension(config.default_extension());

    let agent_loop = AgentExecutionLoop::new(loop_config, Arc::new(client), Arc::new(registry), Arc::new(engine));

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    agent_loop.run(shutdown.token()).await;
    Ok(())
}
