//! 步骤执行引擎
//!
//! 驱动单个步骤的一个 tick：加载 Provider 状态 → 调用 Provider → 持久化被修改的状态 → 返回结果。
//! - Provider 的错误与 panic 在此边界转为 Failed（附诊断信息），不会向调用方传播
//! - 状态读写失败直接向上传播：持久化层不可用时不能做出任何步骤级决策
//! - tick 开始时取消令牌已触发则不调用 Provider，返回 EngineError::Cancelled
//!
//! 每次 tick 输出结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::error::panic_message;
use crate::core::{ErrorClass, StateError};
use crate::engine::state::{StateScope, StateStore};
use crate::experiment::{ExecutionResult, ExecutionStatus, ExperimentStep};
use crate::providers::{ProviderError, StepContext, StepProvider};

/// 默认延期：Provider 返回 InProgress 却未给出延期时使用
pub const DEFAULT_EXTENSION: Duration = Duration::from_secs(60);

/// tick 未产生结果（不向上游上报，步骤保持非终态）
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Step execution cancelled")]
    Cancelled,

    #[error("Provider state error: {0}")]
    State(#[from] StateError),
}

impl EngineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Cancelled => ErrorClass::Cancellation,
            EngineError::State(e) => e.class(),
        }
    }
}

/// 步骤执行引擎：持有状态存储与默认延期
pub struct StepExecutionEngine {
    store: Arc<dyn StateStore>,
    default_extension: Duration,
}

impl StepExecutionEngine {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            default_extension: DEFAULT_EXTENSION,
        }
    }

    pub fn with_default_extension(mut self, extension: Duration) -> Self {
        self.default_extension = extension;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// 执行一个 tick；对同一步骤可重复调用（跨进程重启）
    pub async fn execute(
        &self,
        provider: &dyn StepProvider,
        step: &ExperimentStep,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let start = Instant::now();
        let mut ctx = StepContext::new(step.clone(), cancel.clone());

        let stateful = provider.requires_state();
        if stateful {
            for scope in [StateScope::Shared, StateScope::Private] {
                let value = self.store.get_state(&step.id, scope).await?;
                ctx.load_state(scope, value);
            }
        }

        let outcome = AssertUnwindSafe(provider.execute(&mut ctx))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(result)) => Ok(self.normalize(result)),
            Ok(Err(ProviderError::Cancelled)) => Err(EngineError::Cancelled),
            Ok(Err(e)) => Ok(ExecutionResult::failed(e.to_string())),
            Err(panic) => {
                // panic 后状态可能只改了一半，不持久化
                let reason = panic_message(panic.as_ref());
                tracing::error!(step_id = %step.id, reason = %reason, "Provider panicked");
                return Ok(self.audit(
                    step,
                    start,
                    ExecutionResult::failed(format!("Provider panicked: {reason}")),
                ));
            }
        };

        if stateful {
            for (scope, change) in ctx.take_changes() {
                match change {
                    Some(value) => self.store.save_state(&step.id, scope, value).await?,
                    None => self.store.delete_state(&step.id, scope).await?,
                }
            }
        }

        result.map(|r| self.audit(step, start, r))
    }

    /// InProgress（或 Provider 误报 Pending）必须带延期
    fn normalize(&self, mut result: ExecutionResult) -> ExecutionResult {
        if matches!(result.status, ExecutionStatus::InProgress | ExecutionStatus::Pending) {
            result.status = ExecutionStatus::InProgress;
            if result.extension.is_none() {
                result.extension = Some(self.default_extension);
            }
        }
        result
    }

    fn audit(&self, step: &ExperimentStep, start: Instant, result: ExecutionResult) -> ExecutionResult {
        let audit = serde_json::json!({
            "event": "step_audit",
            "step_id": step.id,
            "experiment_id": step.experiment_id,
            "step_type": step.step_type.to_string(),
            "target": step.target,
            "status": result.status.to_string(),
            "extension_secs": result.extension.map(|d| d.as_secs()),
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "step");
        result
    }
}
