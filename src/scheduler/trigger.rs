//! 触发器调度
//!
//! 每一轮：对每个启用的触发器依次评估其前置条件（遇到第一个不满足即停止），
//! 全部满足时调用 ExperimentLauncher，随后使该触发器的前置条件缓存失效。评估出错的触发器本轮不触发，只记录日志。
//! 不同触发器之间并发评估，互不阻塞。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::experiment::{ExperimentId, TargetGoalTrigger};
use crate::preconditions::{PreconditionEvaluator, ScheduleContext};
use crate::scheduler::launcher::ExperimentLauncher;
use crate::telemetry::ConnectionSettings;

/// 单个触发器在一轮中的结论
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerDecision {
    Disabled,
    /// 某个前置条件不满足
    Blocked { kind: String },
    /// 前置条件评估失败，本轮不触发
    Errored(String),
    Launched(ExperimentId),
    LaunchFailed(String),
}

impl TriggerDecision {
    pub fn is_launched(&self) -> bool {
        matches!(self, TriggerDecision::Launched(_))
    }
}

impl fmt::Display for TriggerDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerDecision::Disabled => write!(f, "disabled"),
            TriggerDecision::Blocked { kind } => write!(f, "blocked by {kind}"),
            TriggerDecision::Errored(e) => write!(f, "evaluation error: {e}"),
            TriggerDecision::Launched(id) => write!(f, "launched {id}"),
            TriggerDecision::LaunchFailed(e) => write!(f, "launch failed: {e}"),
        }
    }
}

pub struct TriggerScheduler {
    evaluator: Arc<PreconditionEvaluator>,
    launcher: Arc<dyn ExperimentLauncher>,
    connection: ConnectionSettings,
    cadence: Duration,
}

impl TriggerScheduler {
    pub fn new(
        evaluator: Arc<PreconditionEvaluator>,
        launcher: Arc<dyn ExperimentLauncher>,
        connection: ConnectionSettings,
        cadence: Duration,
    ) -> Self {
        Self {
            evaluator,
            launcher,
            connection,
            cadence,
        }
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    /// 评估单个触发器，满足时启动实验
    pub async fn evaluate_trigger(&self, trigger: &TargetGoalTrigger, cancel: &CancellationToken) -> TriggerDecision {
        if !trigger.enabled {
            return TriggerDecision::Disabled;
        }

        let ctx = ScheduleContext::for_trigger(trigger, self.connection.clone());
        for precondition in &trigger.preconditions {
            match self.evaluator.is_satisfied(precondition, &ctx, cancel).await {
                Ok(true) => {}
                Ok(false) => {
                    return TriggerDecision::Blocked {
                        kind: precondition.kind.clone(),
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        trigger_id = %trigger.id,
                        kind = %precondition.kind,
                        class = ?e.class(),
                        error = %e,
                        "Precondition evaluation failed, trigger will not fire this pass"
                    );
                    return TriggerDecision::Errored(e.to_string());
                }
            }
        }

        if cancel.is_cancelled() {
            return TriggerDecision::Errored("scheduler is shutting down".to_string());
        }

        let launched = self.launcher.launch(trigger).await;
        // 无论成功与否，上游状态都可能已变化，门控计数不能再沿用缓存
        self.evaluator.invalidate(&trigger.preconditions, &ctx);

        match launched {
            Ok(experiment_id) => {
                tracing::info!(
                    trigger_id = %trigger.id,
                    target_goal = %trigger.target_goal,
                    experiment_id = %experiment_id,
                    "Launched experiment"
                );
                TriggerDecision::Launched(experiment_id)
            }
            Err(e) => {
                tracing::warn!(trigger_id = %trigger.id, error = %e, "Failed to launch experiment");
                TriggerDecision::LaunchFailed(e.to_string())
            }
        }
    }

    /// 一轮评估：所有触发器并发进行，返回 (trigger_id, 结论)，顺序与输入一致
    pub async fn evaluate_once(
        &self,
        triggers: &[TargetGoalTrigger],
        cancel: &CancellationToken,
    ) -> Vec<(String, TriggerDecision)> {
        let pass_id = Uuid::new_v4();
        let start = Instant::now();
        let decisions = join_all(triggers.iter().map(|trigger| async move {
            (trigger.id.clone(), self.evaluate_trigger(trigger, cancel).await)
        }))
        .await;

        let launched = decisions.iter().filter(|(_, d)| d.is_launched()).count();
        tracing::info!(
            pass_id = %pass_id,
            triggers = triggers.len(),
            launched,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Trigger evaluation pass finished"
        );
        for (trigger_id, decision) in &decisions {
            tracing::debug!(pass_id = %pass_id, trigger_id = %trigger_id, decision = %decision, "Trigger decision");
        }
        decisions
    }

    /// 按固定节奏重复评估，直到 shutdown
    pub async fn run(&self, triggers: Vec<TargetGoalTrigger>, shutdown: CancellationToken) {
        tracing::info!(
            triggers = triggers.len(),
            cadence_secs = self.cadence.as_secs(),
            "Trigger scheduler started"
        );
        while !shutdown.is_cancelled() {
            let started = Instant::now();
            self.evaluate_once(&triggers, &shutdown).await;

            let remaining = self.cadence.saturating_sub(started.elapsed());
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
        tracing::info!("Trigger scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QueryError;
    use crate::experiment::Precondition;
    use crate::scheduler::launcher::LaunchError;
    use crate::telemetry::{QueryIssuer, TelemetryCache, TelemetryTable};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 固定返回成功次数与进行中次数
    struct FixedIssuer {
        successful: i64,
        in_progress: i64,
    }

    #[async_trait]
    impl QueryIssuer for FixedIssuer {
        async fn issue(&self, query: &str, _endpoint: &str, _database: &str) -> Result<TelemetryTable, QueryError> {
            if query.contains("SuccessfulRuns") {
                Ok(TelemetryTable::scalar("SuccessfulRuns", json!(self.successful)))
            } else if query.contains("InProgressRuns") {
                Ok(TelemetryTable::scalar("InProgressRuns", json!(self.in_progress)))
            } else {
                Err(QueryError::MalformedResponse("unexpected query".into()))
            }
        }
    }

    #[derive(Default)]
    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl ExperimentLauncher for CountingLauncher {
        async fn launch(&self, trigger: &TargetGoalTrigger) -> Result<ExperimentId, LaunchError> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}-{}", trigger.id, n))
        }
    }

    fn trigger(id: &str, enabled: bool) -> TargetGoalTrigger {
        TargetGoalTrigger {
            id: id.to_string(),
            target_goal: "bios-rollout".to_string(),
            schedule: "0 * * * *".to_string(),
            enabled,
            owner: Some("fleet-validation".to_string()),
            experiment_name: "nightly-bios".to_string(),
            preconditions: vec![
                Precondition::new("SuccessfulExperiments").with_parameter("minimumSuccessfulRuns", 3i64),
                Precondition::new("InProgressExperiments"),
            ],
        }
    }

    fn scheduler(successful: i64, in_progress: i64, launcher: Arc<CountingLauncher>) -> TriggerScheduler {
        let cache = Arc::new(TelemetryCache::new(None));
        cache
            .initialize(Arc::new(FixedIssuer { successful, in_progress }))
            .unwrap();
        TriggerScheduler::new(
            Arc::new(PreconditionEvaluator::new(cache)),
            launcher,
            ConnectionSettings::new("https://telemetry.example", "experiments"),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_launches_when_all_preconditions_hold() {
        let launcher = Arc::new(CountingLauncher::default());
        let scheduler = scheduler(5, 0, launcher.clone());
        let decision = scheduler
            .evaluate_trigger(&trigger("t1", true), &CancellationToken::new())
            .await;
        assert_eq!(decision, TriggerDecision::Launched("t1-0".to_string()));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocked_by_first_unmet_precondition() {
        let launcher = Arc::new(CountingLauncher::default());
        let scheduler = scheduler(1, 2, launcher.clone());
        let decision = scheduler
            .evaluate_trigger(&trigger("t1", true), &CancellationToken::new())
            .await;
        assert_eq!(
            decision,
            TriggerDecision::Blocked {
                kind: "SuccessfulExperiments".to_string()
            }
        );
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evaluation_error_never_fires() {
        let launcher = Arc::new(CountingLauncher::default());
        let scheduler = scheduler(5, 0, launcher.clone());
        let mut t = trigger("t1", true);
        t.preconditions.push(Precondition::new("NoSuchKind"));
        let decision = scheduler.evaluate_trigger(&t, &CancellationToken::new()).await;
        assert!(matches!(decision, TriggerDecision::Errored(_)));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_evaluate_once_keeps_input_order() {
        let launcher = Arc::new(CountingLauncher::default());
        let scheduler = scheduler(5, 0, launcher.clone());
        let triggers = vec![trigger("a", false), trigger("b", true)];
        let decisions = scheduler.evaluate_once(&triggers, &CancellationToken::new()).await;
        assert_eq!(decisions[0], ("a".to_string(), TriggerDecision::Disabled));
        assert_eq!(decisions[1].0, "b");
        assert!(decisions[1].1.is_launched());
    }

    /// 进行中次数等于已启动的实验数
    struct LaunchAwareIssuer {
        launcher: Arc<CountingLauncher>,
    }

    #[async_trait]
    impl QueryIssuer for LaunchAwareIssuer {
        async fn issue(&self, query: &str, _endpoint: &str, _database: &str) -> Result<TelemetryTable, QueryError> {
            if query.contains("SuccessfulRuns") {
                Ok(TelemetryTable::scalar("SuccessfulRuns", json!(10)))
            } else {
                let running = self.launcher.launches.load(Ordering::SeqCst);
                Ok(TelemetryTable::scalar("InProgressRuns", json!(running)))
            }
        }
    }

    #[tokio::test]
    async fn test_launch_refreshes_mutual_exclusion_gate() {
        let launcher = Arc::new(CountingLauncher::default());
        let cache = Arc::new(TelemetryCache::default());
        cache
            .initialize(Arc::new(LaunchAwareIssuer {
                launcher: launcher.clone(),
            }))
            .unwrap();
        let scheduler = TriggerScheduler::new(
            Arc::new(PreconditionEvaluator::new(cache)),
            launcher.clone(),
            ConnectionSettings::new("https://telemetry.example", "experiments"),
            Duration::from_secs(60),
        );
        let triggers = vec![trigger("t1", true)];
        let cancel = CancellationToken::new();

        let first = scheduler.evaluate_once(&triggers, &cancel).await;
        assert!(first[0].1.is_launched());
        for _ in 0..2 {
            let next = scheduler.evaluate_once(&triggers, &cancel).await;
            assert_eq!(
                next[0].1,
                TriggerDecision::Blocked {
                    kind: "InProgressExperiments".to_string()
                }
            );
        }
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let launcher = Arc::new(CountingLauncher::default());
        let scheduler = Arc::new(scheduler(5, 0, launcher.clone()));
        let shutdown = CancellationToken::new();
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(vec![trigger("t1", true)], shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should stop promptly")
            .unwrap();
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }
}
