//! Agent 执行循环
//!
//! 每轮迭代：拉取分配给本 Agent 的非终态步骤 → 经 ProviderRegistry 解析 Provider →
//! StepExecutionEngine 执行一个 tick → 向上游上报结果。
//! - 单个步骤的任何故障（包括 panic）只记录日志，不影响同轮其它步骤，也不会终止循环
//! - 迭代不重叠：上一轮完全结束后才开始下一轮，之后睡眠剩余的轮询间隔
//! - 关闭信号在迭代之间检查，并以子令牌的形式传入正在执行的 tick

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{stream, FutureExt, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::schedule::TickSchedule;
use crate::core::error::panic_message;
use crate::core::{AssignmentError, ErrorClass};
use crate::engine::{EngineError, StepExecutionEngine};
use crate::experiment::{AgentId, ExecutionResult, ExecutionStatus, ExperimentStep, StepAssignmentClient, StepId};
use crate::providers::ProviderRegistry;

/// 循环参数
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub agent_id: AgentId,
    /// 两轮迭代开始之间的间隔
    pub poll_interval: Duration,
    /// 同一轮内并行处理的步骤数（1 为串行）
    pub max_parallel_steps: usize,
    /// InProgress 的上限：超过后上报 Failed；None 表示不限制
    pub max_in_progress: Option<Duration>,
}

impl AgentLoopConfig {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            poll_interval: Duration::from_secs(30),
            max_parallel_steps: 1,
            max_in_progress: None,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_parallel_steps(mut self, n: usize) -> Self {
        self.max_parallel_steps = n.max(1);
        self
    }

    pub fn with_max_in_progress(mut self, max: Option<Duration>) -> Self {
        self.max_in_progress = max;
        self
    }
}

/// 单个步骤的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// 已上报
    Reported(ExecutionStatus),
    /// 因关闭而未执行 / 未上报，步骤保持原状态
    Aborted,
}

/// 单个步骤处理失败（只记录，下一轮重试）
#[derive(Error, Debug)]
pub enum StepFault {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Failed to report step result: {0}")]
    Report(#[from] AssignmentError),

    #[error("Step processing panicked: {0}")]
    Panicked(String),
}

impl StepFault {
    pub fn class(&self) -> ErrorClass {
        match self {
            StepFault::Engine(e) => e.class(),
            StepFault::Report(e) => e.class(),
            StepFault::Panicked(_) => ErrorClass::TransientExternal,
        }
    }
}

/// 一轮迭代的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IterationSummary {
    /// 分配列表中的步骤数
    pub discovered: usize,
    /// 延期未到而跳过
    pub deferred: usize,
    pub reported: usize,
    pub aborted: usize,
    pub faulted: usize,
    /// 拉取分配列表失败
    pub fetch_failed: bool,
}

pub struct AgentExecutionLoop {
    config: AgentLoopConfig,
    client: Arc<dyn StepAssignmentClient>,
    registry: Arc<ProviderRegistry>,
    engine: Arc<StepExecutionEngine>,
    schedule: TickSchedule,
}

impl AgentExecutionLoop {
    pub fn new(
        config: AgentLoopConfig,
        client: Arc<dyn StepAssignmentClient>,
        registry: Arc<ProviderRegistry>,
        engine: Arc<StepExecutionEngine>,
    ) -> Self {
        Self {
            config,
            client,
            registry,
            engine,
            schedule: TickSchedule::new(),
        }
    }

    pub fn config(&self) -> &AgentLoopConfig {
        &self.config
    }

    pub fn schedule(&self) -> &TickSchedule {
        &self.schedule
    }

    /// 持续运行直到 shutdown 被触发
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            agent_id = %self.config.agent_id,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            max_parallel_steps = self.config.max_parallel_steps,
            "Agent execution loop started"
        );

        let mut iteration: u64 = 0;
        while !shutdown.is_cancelled() {
            iteration += 1;
            let started = Instant::now();

            match AssertUnwindSafe(self.run_iteration(&shutdown)).catch_unwind().await {
                Ok(summary) => tracing::info!(
                    iteration,
                    discovered = summary.discovered,
                    deferred = summary.deferred,
                    reported = summary.reported,
                    aborted = summary.aborted,
                    faulted = summary.faulted,
                    fetch_failed = summary.fetch_failed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Agent iteration finished"
                ),
                Err(panic) => tracing::error!(
                    iteration,
                    reason = %panic_message(panic.as_ref()),
                    "Agent iteration panicked"
                ),
            }

            let remaining = self.config.poll_interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }

        tracing::info!(agent_id = %self.config.agent_id, "Agent execution loop stopped");
    }

    /// 执行一轮迭代；任何单步故障都被吸收进统计
    pub async fn run_iteration(&self, shutdown: &CancellationToken) -> IterationSummary {
        let mut summary = IterationSummary::default();

        let fetched = tokio::select! {
            _ = shutdown.cancelled() => return summary,
            fetched = self.client.get_assigned_steps(&self.config.agent_id) => fetched,
        };
        let steps = match fetched {
            Ok(steps) => steps,
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.config.agent_id,
                    error = %e,
                    "Failed to fetch assigned steps, retrying next iteration"
                );
                summary.fetch_failed = true;
                return summary;
            }
        };

        let live: HashSet<StepId> = steps.iter().map(|s| s.id.clone()).collect();
        self.schedule.retain(&live).await;
        summary.discovered = live.len();

        let now = Instant::now();
        let mut due = Vec::with_capacity(steps.len());
        for step in steps {
            if step.is_terminal() {
                self.schedule.clear(&step.id).await;
                continue;
            }
            if !self.schedule.is_due(&step.id, now).await {
                summary.deferred += 1;
                continue;
            }
            due.push(step);
        }

        let outcomes: Vec<(StepId, Result<StepOutcome, StepFault>)> = stream::iter(due)
            .map(|step| async move {
                let outcome = AssertUnwindSafe(self.process_step(&step, shutdown))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(StepFault::Panicked(panic_message(panic.as_ref()))));
                (step.id, outcome)
            })
            .buffer_unordered(self.config.max_parallel_steps.max(1))
            .collect()
            .await;

        for (step_id, outcome) in outcomes {
            match outcome {
                Ok(StepOutcome::Reported(_)) => summary.reported += 1,
                Ok(StepOutcome::Aborted) => {
                    tracing::debug!(step_id = %step_id, "Step tick aborted by shutdown");
                    summary.aborted += 1;
                }
                Err(fault) => {
                    tracing::warn!(
                        step_id = %step_id,
                        class = ?fault.class(),
                        error = %fault,
                        "Step processing failed, will retry next iteration"
                    );
                    summary.faulted += 1;
                }
            }
        }

        summary
    }

    /// 处理单个步骤：tick → 更新调度表 → 上报
    async fn process_step(&self, step: &ExperimentStep, shutdown: &CancellationToken) -> Result<StepOutcome, StepFault> {
        let cancel = shutdown.child_token();
        let result = match self.tick(step, &cancel).await? {
            Some(result) => self.enforce_upper_bound(step, result),
            None => return Ok(StepOutcome::Aborted),
        };

        // 先记录下界，即使上报失败也不会提前 tick
        let returned_at = Instant::now();
        match (result.status, result.extension) {
            (ExecutionStatus::InProgress, Some(extension)) => {
                self.schedule.defer(&step.id, returned_at, extension).await;
            }
            (status, _) if status.is_terminal() => self.schedule.clear(&step.id).await,
            _ => {}
        }

        self.client.report_step_result(&step.id, &result).await?;
        tracing::debug!(
            step_id = %step.id,
            status = %result.status,
            message = result.message.as_deref().unwrap_or(""),
            "Reported step result"
        );
        Ok(StepOutcome::Reported(result.status))
    }

    /// 解析 Provider、校验参数并执行；None 表示 tick 因取消而未执行
    async fn tick(&self, step: &ExperimentStep, cancel: &CancellationToken) -> Result<Option<ExecutionResult>, EngineError> {
        let provider = match self.registry.resolve_for(step) {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(step_id = %step.id, error = %e, "No provider for step");
                return Ok(Some(ExecutionResult::failed(e.to_string())));
            }
        };

        if let Err(e) = self.registry.validate(step, &provider.descriptor()) {
            tracing::warn!(step_id = %step.id, error = %e, "Step parameters rejected");
            return Ok(Some(ExecutionResult::failed(e.to_string())));
        }

        match self.engine.execute(provider.as_ref(), step, cancel).await {
            Ok(result) => Ok(Some(result)),
            Err(EngineError::Cancelled) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn enforce_upper_bound(&self, step: &ExperimentStep, result: ExecutionResult) -> ExecutionResult {
        let (Some(max), Some(started_at)) = (self.config.max_in_progress, step.started_at) else {
            return result;
        };
        if result.status != ExecutionStatus::InProgress {
            return result;
        }
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        if elapsed > max {
            tracing::warn!(step_id = %step.id, elapsed_secs = elapsed.as_secs(), "Step exceeded in-progress limit");
            return ExecutionResult::failed(format!(
                "Step remained in progress for {}s, exceeding the {}s limit",
                elapsed.as_secs(),
                max.as_secs()
            ));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryStateStore;
    use crate::experiment::{InMemoryAssignmentClient, StepType};
    use crate::providers::{register_builtin, ProviderDescriptor, ProviderError, StepContext, StepProvider};
    use async_trait::async_trait;

    /// 返回固定延期的 Provider
    struct PollingProvider;

    #[async_trait]
    impl StepProvider for PollingProvider {
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor::new(StepType::Workload, "Poll", &[])
        }

        async fn execute(&self, _ctx: &mut StepContext) -> Result<ExecutionResult, ProviderError> {
            Ok(ExecutionResult::in_progress(Duration::from_secs(120)))
        }
    }

    fn build(client: Arc<InMemoryAssignmentClient>, config: AgentLoopConfig) -> AgentExecutionLoop {
        let mut registry = ProviderRegistry::new();
        register_builtin(&mut registry).unwrap();
        registry.register(PollingProvider).unwrap();
        let engine = StepExecutionEngine::new(Arc::new(InMemoryStateStore::new()));
        AgentExecutionLoop::new(config, client, Arc::new(registry), Arc::new(engine))
    }

    #[tokio::test]
    async fn test_unregistered_provider_is_reported_failed() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(ExperimentStep::new("s1", "e1", StepType::Payload, "Flash").with_agent("agent-1"))
            .await;
        let agent = build(client.clone(), AgentLoopConfig::new("agent-1"));

        let summary = agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(summary.reported, 1);
        let reports = client.reports().await;
        assert_eq!(reports[0].1.status, ExecutionStatus::Failed);
        assert!(reports[0].1.message.as_ref().unwrap().contains("Payload/Flash"));
    }

    #[tokio::test]
    async fn test_schema_violation_is_reported_failed() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(ExperimentStep::new("s1", "e1", StepType::Diagnostics, "Sleep").with_agent("agent-1"))
            .await;
        let agent = build(client.clone(), AgentLoopConfig::new("agent-1"));

        agent.run_iteration(&CancellationToken::new()).await;
        let step = client.step("s1").await.unwrap();
        assert_eq!(step.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_overflowing_duration_is_reported_failed_once() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(
                ExperimentStep::new("s1", "e1", StepType::Diagnostics, "Sleep")
                    .with_parameter("duration", "300000000000000d")
                    .with_agent("agent-1"),
            )
            .await;
        let agent = build(client.clone(), AgentLoopConfig::new("agent-1"));

        let summary = agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(summary.reported, 1);
        assert_eq!(summary.faulted, 0);
        assert_eq!(client.step("s1").await.unwrap().status, ExecutionStatus::Failed);

        let again = agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(again.discovered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_defers_next_tick() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(ExperimentStep::new("s1", "e1", StepType::Workload, "Poll").with_agent("agent-1"))
            .await;
        let agent = build(client.clone(), AgentLoopConfig::new("agent-1"));
        let token = CancellationToken::new();

        let first = agent.run_iteration(&token).await;
        assert_eq!(first.reported, 1);

        tokio::time::advance(Duration::from_secs(119)).await;
        let second = agent.run_iteration(&token).await;
        assert_eq!(second.deferred, 1);
        assert_eq!(second.reported, 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        let third = agent.run_iteration(&token).await;
        assert_eq!(third.reported, 1);
        assert_eq!(client.reports().await.len(), 2);
    }

    #[tokio::test]
    async fn test_upper_bound_fails_stuck_step() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        let mut step = ExperimentStep::new("s1", "e1", StepType::Workload, "Poll").with_agent("agent-1");
        step.started_at = Some(Utc::now() - chrono::Duration::hours(2));
        client.assign(step).await;
        let config = AgentLoopConfig::new("agent-1").with_max_in_progress(Some(Duration::from_secs(3600)));
        let agent = build(client.clone(), config);

        agent.run_iteration(&CancellationToken::new()).await;
        let reports = client.reports().await;
        assert_eq!(reports[0].1.status, ExecutionStatus::Failed);
        assert!(agent.schedule().next_tick("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_before_iteration_reports_nothing() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(ExperimentStep::new("s1", "e1", StepType::Workload, "Poll").with_agent("agent-1"))
            .await;
        let agent = build(client.clone(), AgentLoopConfig::new("agent-1"));
        let token = CancellationToken::new();
        token.cancel();

        let summary = agent.run_iteration(&token).await;
        assert_eq!(summary.reported, 0);
        assert!(client.reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        let agent = Arc::new(build(
            client,
            AgentLoopConfig::new("agent-1").with_poll_interval(Duration::from_secs(3600)),
        ));
        let token = CancellationToken::new();
        let handle = {
            let agent = Arc::clone(&agent);
            let token = token.clone();
            tokio::spawn(async move { agent.run(token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop promptly")
            .unwrap();
    }
}
