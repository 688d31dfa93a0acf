//! 前置条件评估器
//!
//! is_satisfied：按类型名查找 PreconditionKind → 校验参数 → 经 TelemetryCache 发起参数化查询 →
//! 要求结果恰好一行且含期望列 → 交给具体类型比较。
//! 零行、多行、缺列、类型不对都是评估错误，绝不当作「条件不满足」处理。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::ErrorClass;
use crate::experiment::{Precondition, TargetGoalTrigger};
use crate::preconditions::kinds::{
    InProgressExperimentsPrecondition, PreconditionKind, SuccessfulExperimentsPrecondition,
};
use crate::providers::schema::{validate_parameters, SchemaError};
use crate::telemetry::{CacheError, ConnectionSettings, TableShapeError, TelemetryCache};

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Unknown precondition kind: {0}")]
    UnknownKind(String),

    #[error("Invalid precondition parameters: {0}")]
    Schema(#[from] SchemaError),

    #[error("Invalid precondition parameter: {0}")]
    InvalidParameter(String),

    #[error("Telemetry query failed: {0}")]
    Cache(#[from] CacheError),

    #[error("Unexpected query result: {0}")]
    Shape(#[from] TableShapeError),

    #[error("Column '{column}' holds a non-numeric value: {value}")]
    UnexpectedValue { column: String, value: String },
}

impl EvaluationError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EvaluationError::Cache(e) => e.class(),
            EvaluationError::Shape(_) | EvaluationError::UnexpectedValue { .. } => ErrorClass::TransientExternal,
            _ => ErrorClass::Configuration,
        }
    }
}

/// 评估时的调度上下文
#[derive(Debug, Clone)]
pub struct ScheduleContext {
    pub trigger_id: String,
    pub target_goal: String,
    pub connection: ConnectionSettings,
    pub evaluated_at: DateTime<Utc>,
}

impl ScheduleContext {
    pub fn new(
        trigger_id: impl Into<String>,
        target_goal: impl Into<String>,
        connection: ConnectionSettings,
    ) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            target_goal: target_goal.into(),
            connection,
            evaluated_at: Utc::now(),
        }
    }

    pub fn for_trigger(trigger: &TargetGoalTrigger, connection: ConnectionSettings) -> Self {
        Self::new(&trigger.id, &trigger.target_goal, connection)
    }
}

pub struct PreconditionEvaluator {
    cache: Arc<TelemetryCache>,
    kinds: HashMap<&'static str, Arc<dyn PreconditionKind>>,
}

impl PreconditionEvaluator {
    /// 创建评估器并注册内置类型
    pub fn new(cache: Arc<TelemetryCache>) -> Self {
        let mut evaluator = Self {
            cache,
            kinds: HashMap::new(),
        };
        evaluator.register(SuccessfulExperimentsPrecondition);
        evaluator.register(InProgressExperimentsPrecondition);
        evaluator
    }

    /// 注册（或替换）一个前置条件类型
    pub fn register(&mut self, kind: impl PreconditionKind + 'static) {
        self.kinds.insert(kind.name(), Arc::new(kind));
    }

    pub fn kind_names(&self) -> Vec<&'static str> {
        self.kinds.keys().copied().collect()
    }

    /// 使这些前置条件对应的缓存条目失效；启动新实验后调用，下一轮评估看到的是最新计数
    pub fn invalidate(&self, preconditions: &[Precondition], ctx: &ScheduleContext) {
        for precondition in preconditions {
            let Some(kind) = self.kinds.get(precondition.kind.as_str()) else {
                continue;
            };
            if let Ok(query) = kind.build_query(&precondition.parameters, ctx) {
                tracing::debug!(trigger_id = %ctx.trigger_id, cache_key = %query.cache_key, "Invalidating precondition cache entry");
                self.cache.invalidate(&query.cache_key);
            }
        }
    }

    pub async fn is_satisfied(
        &self,
        precondition: &Precondition,
        ctx: &ScheduleContext,
        cancel: &CancellationToken,
    ) -> Result<bool, EvaluationError> {
        let kind = self
            .kinds
            .get(precondition.kind.as_str())
            .ok_or_else(|| EvaluationError::UnknownKind(precondition.kind.clone()))?;

        validate_parameters(kind.parameters(), &precondition.parameters)?;

        let query = kind.build_query(&precondition.parameters, ctx)?;
        let table = self
            .cache
            .get_response(&query.cache_key, &ctx.connection, &query.text, cancel)
            .await?;
        let value = table.single_value(kind.column())?;
        let satisfied = kind.is_satisfied_by(value, &precondition.parameters)?;

        tracing::debug!(
            trigger_id = %ctx.trigger_id,
            kind = kind.name(),
            value = %value,
            satisfied,
            "Evaluated precondition"
        );
        Ok(satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QueryError;
    use crate::telemetry::{QueryIssuer, TelemetryTable};
    use async_trait::async_trait;
    use serde_json::json;

    struct FixedIssuer(TelemetryTable);

    #[async_trait]
    impl QueryIssuer for FixedIssuer {
        async fn issue(&self, _q: &str, _e: &str, _d: &str) -> Result<TelemetryTable, QueryError> {
            Ok(self.0.clone())
        }
    }

    fn evaluator(table: TelemetryTable) -> PreconditionEvaluator {
        let cache = TelemetryCache::new(None);
        cache.initialize(Arc::new(FixedIssuer(table))).unwrap();
        PreconditionEvaluator::new(Arc::new(cache))
    }

    fn ctx() -> ScheduleContext {
        ScheduleContext::new("t1", "GoalA", ConnectionSettings::new("https://t", "Db"))
    }

    #[tokio::test]
    async fn test_unknown_kind() {
        let ev = evaluator(TelemetryTable::scalar("SuccessfulRuns", json!(1)));
        let err = ev
            .is_satisfied(&Precondition::new("Nope"), &ctx(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluationError::UnknownKind(_)));
    }

    #[tokio::test]
    async fn test_schema_violation_short_circuits() {
        let ev = evaluator(TelemetryTable::scalar("SuccessfulRuns", json!(1)));
        let pre = Precondition::new("SuccessfulExperiments").with_parameter("minimumSuccessfulRuns", "three");
        let err = ev.is_satisfied(&pre, &ctx(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EvaluationError::Schema(SchemaError::TypeMismatch { .. })));
        assert_eq!(err.class(), ErrorClass::Configuration);
    }

    #[tokio::test]
    async fn test_in_progress_gate() {
        let ev = evaluator(TelemetryTable::scalar("InProgressRuns", json!(0)));
        let pre = Precondition::new("InProgressExperiments");
        assert!(ev.is_satisfied(&pre, &ctx(), &CancellationToken::new()).await.unwrap());
    }

    /// 每次查询返回递增的进行中次数
    struct RisingIssuer(std::sync::atomic::AtomicI64);

    #[async_trait]
    impl QueryIssuer for RisingIssuer {
        async fn issue(&self, _q: &str, _e: &str, _d: &str) -> Result<TelemetryTable, QueryError> {
            let n = self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(TelemetryTable::scalar("InProgressRuns", json!(n)))
        }
    }

    #[tokio::test]
    async fn test_invalidate_forces_fresh_count() {
        let cache = TelemetryCache::default();
        cache
            .initialize(Arc::new(RisingIssuer(std::sync::atomic::AtomicI64::new(0))))
            .unwrap();
        let ev = PreconditionEvaluator::new(Arc::new(cache));
        let pre = vec![Precondition::new("InProgressExperiments")];
        let cancel = CancellationToken::new();

        assert!(ev.is_satisfied(&pre[0], &ctx(), &cancel).await.unwrap());
        // 缓存命中：计数不变
        assert!(ev.is_satisfied(&pre[0], &ctx(), &cancel).await.unwrap());

        ev.invalidate(&pre, &ctx());
        assert!(!ev.is_satisfied(&pre[0], &ctx(), &cancel).await.unwrap());
    }
}
