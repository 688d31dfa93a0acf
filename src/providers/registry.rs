//! Provider 注册表
//!
//! 所有 Provider 实现 StepProvider trait，并静态声明自己支持的 (StepType, target) 与参数 schema。
//! ProviderRegistry 在组合根一次性注册，每个 (type, target) 至多一个 Provider；
//! resolve 未命中属于配置错误，由 Agent 循环上报为 Failed。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::core::ErrorClass;
use crate::experiment::{ExecutionResult, ExperimentStep, StepType};
use crate::providers::context::{ProviderError, StepContext};
use crate::providers::schema::{parameters_json_schema, validate_parameters, ParameterSpec, SchemaError};

/// Provider 能力声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub step_type: StepType,
    pub target: &'static str,
    pub parameters: &'static [ParameterSpec],
}

impl ProviderDescriptor {
    pub const fn new(step_type: StepType, target: &'static str, parameters: &'static [ParameterSpec]) -> Self {
        Self {
            step_type,
            target,
            parameters,
        }
    }
}

/// 步骤 Provider：一次调用即一个 tick
#[async_trait]
pub trait StepProvider: Send + Sync {
    /// 支持的 (type, target) 与参数 schema
    fn descriptor(&self) -> ProviderDescriptor;

    /// 是否需要加载持久化状态；返回 false 时引擎跳过状态读写
    fn requires_state(&self) -> bool {
        true
    }

    /// 执行一个 tick。外部可见的副作用必须幂等或以持久化标记为前提（tick 可能在上报前崩溃后重试）
    async fn execute(&self, ctx: &mut StepContext) -> Result<ExecutionResult, ProviderError>;
}

/// 注册 / 查找失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A provider is already registered for {step_type}/{target}")]
    DuplicateProvider { step_type: StepType, target: String },

    #[error("No provider registered for {step_type}/{target}")]
    ProviderNotFound { step_type: StepType, target: String },
}

impl RegistryError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// Provider 注册表：按 (StepType, target) 存储 Arc<dyn StepProvider>
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<(StepType, String), Arc<dyn StepProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: impl StepProvider + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(provider))
    }

    /// 注册；同一 (type, target) 重复注册返回 DuplicateProvider，原注册保持不变
    pub fn register_arc(&mut self, provider: Arc<dyn StepProvider>) -> Result<(), RegistryError> {
        let descriptor = provider.descriptor();
        let key = (descriptor.step_type, descriptor.target.to_string());
        if self.providers.contains_key(&key) {
            return Err(RegistryError::DuplicateProvider {
                step_type: descriptor.step_type,
                target: descriptor.target.to_string(),
            });
        }
        tracing::debug!(
            step_type = %descriptor.step_type,
            target = descriptor.target,
            "Registered step provider"
        );
        self.providers.insert(key, provider);
        Ok(())
    }

    pub fn resolve(&self, step_type: StepType, target: &str) -> Result<Arc<dyn StepProvider>, RegistryError> {
        self.providers
            .get(&(step_type, target.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::ProviderNotFound {
                step_type,
                target: target.to_string(),
            })
    }

    /// 按步骤声明的 type / target 查找
    pub fn resolve_for(&self, step: &ExperimentStep) -> Result<Arc<dyn StepProvider>, RegistryError> {
        self.resolve(step.step_type, &step.target)
    }

    /// 调用 Provider 之前校验步骤参数
    pub fn validate(&self, step: &ExperimentStep, descriptor: &ProviderDescriptor) -> Result<(), SchemaError> {
        validate_parameters(descriptor.parameters, &step.parameters)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers.values().map(|p| p.descriptor()).collect()
    }

    /// 所有已注册 Provider 的能力与参数 schema（JSON）
    pub fn to_schema_json(&self) -> String {
        let providers: Vec<serde_json::Value> = self
            .providers
            .values()
            .map(|provider| {
                let d = provider.descriptor();
                serde_json::json!({
                    "stepType": d.step_type.to_string(),
                    "target": d.target,
                    "parameters": parameters_json_schema(d.parameters)
                })
            })
            .collect();
        serde_json::to_string_pretty(&providers).unwrap_or_else(|_| "[]".to_string())
    }
}
