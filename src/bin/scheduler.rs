//! crucible-scheduler：触发器调度宿主
//!
//! 从 scheduler.triggers_path 读取触发器清单（JSON 数组），按 scheduler.cadence_secs 评估前置条件，
//! 满足时经实验管理 API 启动新实验。
//! 用法：crucible-scheduler [config.toml]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use crucible::config::load_config;
use crucible::core::ShutdownManager;
use crucible::experiment::TargetGoalTrigger;
use crucible::scheduler::HttpExperimentLauncher;
use crucible::{observability, PreconditionEvaluator, TelemetryCache, TriggerScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load configuration")?;

    let triggers_path = config
        .scheduler
        .triggers_path
        .clone()
        .context("scheduler.triggers_path is not set")?;
    let raw = std::fs::read_to_string(&triggers_path)
        .with_context(|| format!("Failed to read triggers from {}", triggers_path.display()))?;
    let triggers: Vec<TargetGoalTrigger> =
        serde_json::from_str(&raw).with_context(|| format!("Invalid triggers file {}", triggers_path.display()))?;
    tracing::info!(
        triggers = triggers.len(),
        enabled = triggers.iter().filter(|t| t.enabled).count(),
        "Loaded target goal triggers"
    );

    let cache = Arc::new(TelemetryCache::new(config.cache_ttl()));
    cache
        .initialize_with_settings(&config.query_issuer_settings())
        .context("Failed to initialise telemetry cache")?;
    let evaluator = Arc::new(PreconditionEvaluator::new(cache));
    let launcher = HttpExperimentLauncher::new(&config.api.base_url, config.api.timeout_secs)
        .context("Failed to build experiment launcher")?;

    let scheduler = TriggerScheduler::new(
        evaluator,
        Arc::new(launcher),
        config.connection_settings(),
        config.scheduler_cadence(),
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    scheduler.run(triggers, shutdown.token()).await;
    Ok(())
}
