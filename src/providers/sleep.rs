//! Sleep Provider（Diagnostics/Sleep）
//!
//! 首个 tick 把 {start, end} 写入 Shared 状态并返回 InProgress；之后每个 tick 检查是否到期，
//! 到期返回 Succeeded 且不修改状态。等待完全由持久化状态驱动，不阻塞 tick。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::StateScope;
use crate::experiment::{ExecutionResult, StepType};
use crate::providers::context::{ProviderError, StepContext};
use crate::providers::registry::{ProviderDescriptor, StepProvider};
use crate::providers::schema::{ParameterKind, ParameterSpec};

/// 两次检查之间的最短间隔
pub const SLEEP_EXTENSION: Duration = Duration::from_secs(60);

const SLEEP_PARAMETERS: &[ParameterSpec] = &[ParameterSpec::required("duration", ParameterKind::Duration)];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepState {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// 等待指定时长后成功
#[derive(Debug, Default)]
pub struct SleepProvider;

#[async_trait]
impl StepProvider for SleepProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(StepType::Diagnostics, "Sleep", SLEEP_PARAMETERS)
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<ExecutionResult, ProviderError> {
        let now = Utc::now();
        let state: Option<SleepState> = ctx.state(StateScope::Shared)?;

        let state = match state {
            Some(state) => state,
            None => {
                if ctx.is_cancelled() {
                    return Err(ProviderError::Cancelled);
                }
                let duration = ctx.parameter_duration("duration")?;
                let end = chrono::Duration::from_std(duration)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| ProviderError::InvalidParameter {
                        name: "duration".to_string(),
                        reason: "duration is out of range".to_string(),
                    })?;
                let state = SleepState { start: now, end };
                ctx.set_state(StateScope::Shared, &state)?;
                return Ok(ExecutionResult::in_progress(SLEEP_EXTENSION)
                    .with_message(format!("Sleeping until {}", state.end.to_rfc3339())));
            }
        };

        if now >= state.end {
            Ok(ExecutionResult::succeeded())
        } else {
            Ok(ExecutionResult::in_progress(SLEEP_EXTENSION))
        }
    }
}
