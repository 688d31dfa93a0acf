//! Crucible - 实验编排引擎
//!
//! 模块划分：
//! - **agent**: Agent 执行循环（发现分配的步骤、驱动 tick、上报结果）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、关闭信号
//! - **engine**: 可恢复的步骤执行状态机与 Provider 状态持久化
//! - **experiment**: 实验 / 步骤数据模型与步骤分配 API 客户端
//! - **observability**: tracing 初始化
//! - **preconditions**: 触发器前置条件评估
//! - **providers**: Provider 注册表、参数 schema 与内置 Provider（Sleep / Cancel）
//! - **scheduler**: 目标触发器调度与实验启动
//! - **telemetry**: 单飞缓存的遥测查询层

pub mod agent;
pub mod config;
pub mod core;
pub mod engine;
pub mod experiment;
pub mod observability;
pub mod preconditions;
pub mod providers;
pub mod scheduler;
pub mod telemetry;

pub use agent::{AgentExecutionLoop, AgentLoopConfig};
pub use engine::StepExecutionEngine;
pub use preconditions::PreconditionEvaluator;
pub use providers::ProviderRegistry;
pub use scheduler::TriggerScheduler;
pub use telemetry::TelemetryCache;
