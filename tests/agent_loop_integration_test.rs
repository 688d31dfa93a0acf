//! Agent 执行循环集成测试：故障隔离、配置错误上报、跨重启恢复

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use crucible::core::AssignmentError;
    use crucible::engine::{InMemoryStateStore, SqliteStateStore, StateScope, StateStore, StepExecutionEngine};
    use crucible::experiment::{
        ExecutionResult, ExecutionStatus, ExperimentStep, InMemoryAssignmentClient, StepAssignmentClient, StepType,
    };
    use crucible::providers::{
        register_builtin, ProviderDescriptor, ProviderError, ProviderRegistry, StepContext, StepProvider,
    };
    use crucible::{AgentExecutionLoop, AgentLoopConfig};
    use tokio_util::sync::CancellationToken;

    const AGENT: &str = "agent-1";

    /// 对指定步骤的上报总是失败，其余转发给内存客户端
    struct FlakyReporter {
        inner: Arc<InMemoryAssignmentClient>,
        failing: HashSet<String>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl StepAssignmentClient for FlakyReporter {
        async fn get_assigned_steps(&self, agent_id: &str) -> Result<Vec<ExperimentStep>, AssignmentError> {
            self.inner.get_assigned_steps(agent_id).await
        }

        async fn report_step_result(&self, step_id: &str, result: &ExecutionResult) -> Result<(), AssignmentError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(step_id) {
                return Err(AssignmentError::Status {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.inner.report_step_result(step_id, result).await
        }
    }

    /// 分配列表接口总是失败
    struct UnreachableApi;

    #[async_trait]
    impl StepAssignmentClient for UnreachableApi {
        async fn get_assigned_steps(&self, _agent_id: &str) -> Result<Vec<ExperimentStep>, AssignmentError> {
            Err(AssignmentError::Transport("connection refused".to_string()))
        }

        async fn report_step_result(&self, _step_id: &str, _result: &ExecutionResult) -> Result<(), AssignmentError> {
            Err(AssignmentError::Transport("connection refused".to_string()))
        }
    }

    /// 立即成功
    struct InstantProvider;

    #[async_trait]
    impl StepProvider for InstantProvider {
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor::new(StepType::Workload, "Instant", &[])
        }

        async fn execute(&self, _ctx: &mut StepContext) -> Result<ExecutionResult, ProviderError> {
            Ok(ExecutionResult::succeeded())
        }
    }

    /// 总是 panic
    struct PanickingProvider;

    #[async_trait]
    impl StepProvider for PanickingProvider {
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor::new(StepType::Workload, "Explode", &[])
        }

        async fn execute(&self, _ctx: &mut StepContext) -> Result<ExecutionResult, ProviderError> {
            panic!("firmware image missing");
        }
    }

    fn registry() -> Arc<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        register_builtin(&mut registry).unwrap();
        registry.register(InstantProvider).unwrap();
        registry.register(PanickingProvider).unwrap();
        Arc::new(registry)
    }

    fn step(id: &str, target: &str, sequence: u32) -> ExperimentStep {
        ExperimentStep::new(id, "e1", StepType::Workload, target)
            .with_agent(AGENT)
            .with_sequence(sequence)
    }

    fn build(client: Arc<dyn StepAssignmentClient>, store: Arc<dyn StateStore>) -> AgentExecutionLoop {
        AgentExecutionLoop::new(
            AgentLoopConfig::new(AGENT),
            client,
            registry(),
            Arc::new(StepExecutionEngine::new(store)),
        )
    }

    #[tokio::test]
    async fn test_report_failure_does_not_block_other_steps() {
        let inner = Arc::new(InMemoryAssignmentClient::new());
        inner.assign(step("a", "Instant", 1)).await;
        inner.assign(step("b", "Instant", 2)).await;
        let client = Arc::new(FlakyReporter {
            inner: inner.clone(),
            failing: ["a".to_string()].into_iter().collect(),
            attempts: AtomicUsize::new(0),
        });
        let agent = build(client.clone(), Arc::new(InMemoryStateStore::new()));

        let summary = agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(summary.reported, 1);
        assert_eq!(summary.faulted, 1);
        assert_eq!(inner.step("b").await.unwrap().status, ExecutionStatus::Succeeded);
        // 上报失败的步骤保持原状态，下一轮重试
        assert_eq!(inner.step("a").await.unwrap().status, ExecutionStatus::Pending);

        agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(client.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_provider_panic_is_reported_failed_and_isolated() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client.assign(step("a", "Explode", 1)).await;
        client.assign(step("b", "Instant", 2)).await;
        let agent = build(client.clone(), Arc::new(InMemoryStateStore::new()));

        let summary = agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(summary.reported, 2);

        let reports = client.reports().await;
        let a = reports.iter().find(|(id, _)| id == "a").unwrap();
        assert_eq!(a.1.status, ExecutionStatus::Failed);
        assert!(a.1.message.as_ref().unwrap().contains("firmware image missing"));
        assert_eq!(client.step("b").await.unwrap().status, ExecutionStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_terminal_steps_are_never_ticked() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(step("a", "Instant", 1).with_status(ExecutionStatus::Cancelled))
            .await;
        let agent = build(client.clone(), Arc::new(InMemoryStateStore::new()));

        let summary = agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(summary.discovered, 0);
        assert!(client.reports().await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_is_absorbed() {
        let agent = build(Arc::new(UnreachableApi), Arc::new(InMemoryStateStore::new()));
        let summary = agent.run_iteration(&CancellationToken::new()).await;
        assert!(summary.fetch_failed);
        assert_eq!(summary.reported, 0);
    }

    #[tokio::test]
    async fn test_parallel_iteration_reports_every_step() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        for i in 0..8 {
            client.assign(step(&format!("s{i}"), "Instant", i)).await;
        }
        let agent = AgentExecutionLoop::new(
            AgentLoopConfig::new(AGENT).with_max_parallel_steps(4),
            client.clone(),
            registry(),
            Arc::new(StepExecutionEngine::new(Arc::new(InMemoryStateStore::new()))),
        );

        let summary = agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(summary.reported, 8);
        assert!(client.get_assigned_steps(AGENT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_provider_reports_cancelled_without_state() {
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(ExperimentStep::new("c", "e1", StepType::Diagnostics, "Cancel").with_agent(AGENT))
            .await;
        let store = Arc::new(InMemoryStateStore::new());
        let agent = build(client.clone(), store.clone());

        agent.run_iteration(&CancellationToken::new()).await;
        assert_eq!(client.step("c").await.unwrap().status, ExecutionStatus::Cancelled);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_sleep_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let client = Arc::new(InMemoryAssignmentClient::new());
        client
            .assign(
                ExperimentStep::new("sleep", "e1", StepType::Diagnostics, "Sleep")
                    .with_parameter("duration", "1s")
                    .with_agent(AGENT),
            )
            .await;

        {
            let store = Arc::new(SqliteStateStore::open(&db, AGENT).unwrap());
            let agent = build(client.clone(), store);
            agent.run_iteration(&CancellationToken::new()).await;
        }
        assert_eq!(client.step("sleep").await.unwrap().status, ExecutionStatus::InProgress);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // 新进程：调度表为空，状态来自磁盘
        let store = Arc::new(SqliteStateStore::open(&db, AGENT).unwrap());
        let window = store.get_state("sleep", StateScope::Shared).await.unwrap();
        assert!(window.is_some());
        let agent = build(client.clone(), store.clone());
        agent.run_iteration(&CancellationToken::new()).await;

        assert_eq!(client.step("sleep").await.unwrap().status, ExecutionStatus::Succeeded);
        assert_eq!(store.get_state("sleep", StateScope::Shared).await.unwrap(), window);
    }
}
