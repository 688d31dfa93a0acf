//! Provider 执行上下文
//!
//! 引擎在每次 tick 前构造 StepContext：携带步骤、取消令牌与已加载的 Shared / Private 状态。
//! Provider 通过 state / set_state / clear_state 读写类型化状态，上下文记录脏标记，
//! 引擎在 Provider 返回后只持久化被修改过的范围。

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::engine::StateScope;
use crate::experiment::{ExperimentStep, ParameterValue};
use crate::providers::schema::parse_duration;

/// Provider 业务逻辑返回的错误；引擎边界统一转为 Failed（Cancelled 除外）
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Provider state is corrupt: {0}")]
    State(#[from] serde_json::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Default)]
struct StateSlot {
    value: Option<Value>,
    dirty: bool,
}

/// 单次 tick 的执行上下文
#[derive(Debug)]
pub struct StepContext {
    step: ExperimentStep,
    cancellation: CancellationToken,
    shared: StateSlot,
    private: StateSlot,
}

impl StepContext {
    pub fn new(step: ExperimentStep, cancellation: CancellationToken) -> Self {
        Self {
            step,
            cancellation,
            shared: StateSlot::default(),
            private: StateSlot::default(),
        }
    }

    /// 引擎注入已持久化的状态（不置脏）
    pub(crate) fn load_state(&mut self, scope: StateScope, value: Option<Value>) {
        let slot = self.slot_mut(scope);
        slot.value = value;
        slot.dirty = false;
    }

    /// 取出被修改的状态：Some 为写入，None 为删除
    pub(crate) fn take_changes(&mut self) -> Vec<(StateScope, Option<Value>)> {
        let mut changes = Vec::new();
        for scope in [StateScope::Shared, StateScope::Private] {
            let slot = self.slot_mut(scope);
            if slot.dirty {
                slot.dirty = false;
                changes.push((scope, slot.value.clone()));
            }
        }
        changes
    }

    fn slot(&self, scope: StateScope) -> &StateSlot {
        match scope {
            StateScope::Shared => &self.shared,
            StateScope::Private => &self.private,
        }
    }

    fn slot_mut(&mut self, scope: StateScope) -> &mut StateSlot {
        match scope {
            StateScope::Shared => &mut self.shared,
            StateScope::Private => &mut self.private,
        }
    }

    pub fn step(&self) -> &ExperimentStep {
        &self.step
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 读取类型化状态；首个 tick 时为 None
    pub fn state<T: DeserializeOwned>(&self, scope: StateScope) -> Result<Option<T>, ProviderError> {
        match &self.slot(scope).value {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    pub fn set_state<T: Serialize>(&mut self, scope: StateScope, value: &T) -> Result<(), ProviderError> {
        let value = serde_json::to_value(value)?;
        let slot = self.slot_mut(scope);
        slot.value = Some(value);
        slot.dirty = true;
        Ok(())
    }

    pub fn clear_state(&mut self, scope: StateScope) {
        let slot = self.slot_mut(scope);
        if slot.value.is_some() {
            slot.value = None;
            slot.dirty = true;
        }
    }

    pub fn is_dirty(&self, scope: StateScope) -> bool {
        self.slot(scope).dirty
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterValue> {
        self.step.parameters.get(name)
    }

    pub fn parameter_str(&self, name: &str) -> Result<&str, ProviderError> {
        self.parameter(name)
            .and_then(ParameterValue::as_str)
            .ok_or_else(|| invalid(name, "expected a string"))
    }

    pub fn parameter_i64(&self, name: &str) -> Result<i64, ProviderError> {
        self.parameter(name)
            .and_then(ParameterValue::as_i64)
            .ok_or_else(|| invalid(name, "expected an integer"))
    }

    pub fn parameter_duration(&self, name: &str) -> Result<Duration, ProviderError> {
        self.parameter(name)
            .and_then(parse_duration)
            .ok_or_else(|| invalid(name, "expected a duration"))
    }
}

fn invalid(name: &str, reason: &str) -> ProviderError {
    ProviderError::InvalidParameter {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::StepType;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        done: u32,
    }

    fn ctx() -> StepContext {
        let step = ExperimentStep::new("s1", "e1", StepType::Diagnostics, "Sleep")
            .with_parameter("duration", "3s")
            .with_parameter("count", 4i64);
        StepContext::new(step, CancellationToken::new())
    }

    #[test]
    fn test_loaded_state_is_not_dirty() {
        let mut ctx = ctx();
        ctx.load_state(StateScope::Shared, Some(serde_json::json!({"done": 1})));
        let p: Option<Progress> = ctx.state(StateScope::Shared).unwrap();
        assert_eq!(p, Some(Progress { done: 1 }));
        assert!(ctx.take_changes().is_empty());
    }

    #[test]
    fn test_set_and_clear_track_changes() {
        let mut ctx = ctx();
        ctx.set_state(StateScope::Private, &Progress { done: 2 }).unwrap();
        ctx.load_state(StateScope::Shared, Some(serde_json::json!({"done": 1})));
        ctx.clear_state(StateScope::Shared);

        let changes = ctx.take_changes();
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&(StateScope::Shared, None)));
        assert!(changes.contains(&(StateScope::Private, Some(serde_json::json!({"done": 2})))));
        assert!(ctx.take_changes().is_empty());
    }

    #[test]
    fn test_parameter_accessors() {
        let ctx = ctx();
        assert_eq!(ctx.parameter_duration("duration").unwrap(), Duration::from_secs(3));
        assert_eq!(ctx.parameter_i64("count").unwrap(), 4);
        assert!(matches!(
            ctx.parameter_str("count"),
            Err(ProviderError::InvalidParameter { .. })
        ));
    }
}
