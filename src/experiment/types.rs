//! 实验数据模型
//!
//! 定义实验步骤、执行结果、参数值、目标触发器与前置条件等核心类型

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub type StepId = String;
pub type ExperimentId = String;
pub type AgentId = String;

/// 步骤状态（步骤本身与单次执行结果共用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ExecutionStatus {
    /// 已创建，尚未执行
    Pending,
    /// 执行中（需要后续 tick）
    InProgress,
    /// 成功
    Succeeded,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl ExecutionStatus {
    /// Succeeded / Failed / Cancelled 为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "Pending",
            ExecutionStatus::InProgress => "InProgress",
            ExecutionStatus::Succeeded => "Succeeded",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// 步骤类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum StepType {
    EnvironmentSetup,
    EnvironmentCriteria,
    Payload,
    Workload,
    Certification,
    Diagnostics,
    EnvironmentCleanup,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 参数标量值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum ParameterValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ParameterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParameterValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// 整数也可作为浮点读取
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(v) => Some(*v),
            ParameterValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// 值的类型名（用于错误信息）
    pub fn kind_name(&self) -> &'static str {
        match self {
            ParameterValue::Boolean(_) => "boolean",
            ParameterValue::Integer(_) => "integer",
            ParameterValue::Float(_) => "float",
            ParameterValue::String(_) => "string",
        }
    }
}

impl From<&str> for ParameterValue {
    fn from(v: &str) -> Self {
        ParameterValue::String(v.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(v: String) -> Self {
        ParameterValue::String(v)
    }
}

impl From<i64> for ParameterValue {
    fn from(v: i64) -> Self {
        ParameterValue::Integer(v)
    }
}

impl From<f64> for ParameterValue {
    fn from(v: f64) -> Self {
        ParameterValue::Float(v)
    }
}

impl From<bool> for ParameterValue {
    fn from(v: bool) -> Self {
        ParameterValue::Boolean(v)
    }
}

/// 实验中的单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStep {
    /// 步骤唯一标识
    pub id: StepId,
    /// 所属实验
    pub experiment_id: ExperimentId,
    /// 步骤类别
    pub step_type: StepType,
    /// 执行目标（能力名，如 Sleep、Cancel）
    pub target: String,
    /// 在实验中的顺序
    pub sequence: u32,
    /// 当前状态
    pub status: ExecutionStatus,
    /// 步骤参数
    #[serde(default)]
    pub parameters: HashMap<String, ParameterValue>,
    /// 分配到的 Agent
    pub agent_id: Option<AgentId>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 首次开始执行时间
    pub started_at: Option<DateTime<Utc>>,
    /// 最后更新时间
    pub last_modified: DateTime<Utc>,
}

impl ExperimentStep {
    pub fn new(
        id: impl Into<StepId>,
        experiment_id: impl Into<ExperimentId>,
        step_type: StepType,
        target: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            experiment_id: experiment_id.into(),
            step_type,
            target: target.into(),
            sequence: 0,
            status: ExecutionStatus::Pending,
            parameters: HashMap::new(),
            agent_id: None,
            created_at: now,
            started_at: None,
            last_modified: now,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 单次 tick 的执行结果（不直接持久化，仅用于更新步骤状态与调度）
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    /// 下一次 tick 之前的最短等待时间（下界）
    pub extension: Option<Duration>,
    /// 诊断信息
    pub message: Option<String>,
}

impl ExecutionResult {
    pub fn new(status: ExecutionStatus) -> Self {
        Self {
            status,
            extension: None,
            message: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::new(ExecutionStatus::Succeeded)
    }

    pub fn cancelled() -> Self {
        Self::new(ExecutionStatus::Cancelled)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ExecutionStatus::Failed).with_message(message)
    }

    pub fn in_progress(extension: Duration) -> Self {
        Self {
            status: ExecutionStatus::InProgress,
            extension: Some(extension),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 触发器前置条件：类型名 + 参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Precondition {
    pub kind: String,
    #[serde(default)]
    pub parameters: HashMap<String, ParameterValue>,
}

impl Precondition {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            parameters: HashMap::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// 目标触发器（只读输入，生命周期由调度编写方管理）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetGoalTrigger {
    pub id: String,
    /// 目标名称
    pub target_goal: String,
    /// 调度表达式（本模块不解析）
    pub schedule: String,
    pub enabled: bool,
    /// 所属团队 / 负责人
    pub owner: Option<String>,
    /// 实验模板名（用于创建新实验）
    pub experiment_name: String,
    #[serde(default)]
    pub preconditions: Vec<Precondition>,
}
