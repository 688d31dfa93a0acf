//! 步骤分配协作方
//!
//! StepAssignmentClient：查询分配给某个 Agent 的步骤、上报单次 tick 结果。
//! HttpAssignmentClient 走实验管理 API（JSON），InMemoryAssignmentClient 供嵌入式宿主与测试使用。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::core::AssignmentError;
use crate::experiment::types::{ExecutionResult, ExecutionStatus, ExperimentStep, StepId};

#[async_trait]
pub trait StepAssignmentClient: Send + Sync {
    /// 当前分配给 agent_id 的步骤
    async fn get_assigned_steps(&self, agent_id: &str) -> Result<Vec<ExperimentStep>, AssignmentError>;

    /// 上报一次 tick 的结果
    async fn report_step_result(&self, step_id: &str, result: &ExecutionResult) -> Result<(), AssignmentError>;
}

/// 上报载荷
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StepResultReport<'a> {
    status: ExecutionStatus,
    extension_secs: Option<u64>,
    message: Option<&'a str>,
    reported_at: chrono::DateTime<Utc>,
}

/// 实验管理 API 客户端
pub struct HttpAssignmentClient {
    client: Client,
    base_url: String,
}

impl HttpAssignmentClient {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, AssignmentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| AssignmentError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StepAssignmentClient for HttpAssignmentClient {
    async fn get_assigned_steps(&self, agent_id: &str) -> Result<Vec<ExperimentStep>, AssignmentError> {
        let url = format!("{}/agents/{}/steps", self.base_url, agent_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AssignmentError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AssignmentError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<Vec<ExperimentStep>>()
            .await
            .map_err(|e| AssignmentError::InvalidResponse(e.to_string()))
    }

    async fn report_step_result(&self, step_id: &str, result: &ExecutionResult) -> Result<(), AssignmentError> {
        let url = format!("{}/steps/{}/result", self.base_url, step_id);
        let report = StepResultReport {
            status: result.status,
            extension_secs: result.extension.map(|d| d.as_secs()),
            message: result.message.as_deref(),
            reported_at: Utc::now(),
        };
        let resp = self
            .client
            .put(&url)
            .json(&report)
            .send()
            .await
            .map_err(|e| AssignmentError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AssignmentError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// 内存版分配表：上报结果会更新步骤状态，终态步骤不再下发
#[derive(Default)]
pub struct InMemoryAssignmentClient {
    steps: RwLock<HashMap<StepId, ExperimentStep>>,
    reports: RwLock<Vec<(StepId, ExecutionResult)>>,
}

impl InMemoryAssignmentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assign(&self, step: ExperimentStep) {
        self.steps.write().await.insert(step.id.clone(), step);
    }

    pub async fn step(&self, step_id: &str) -> Option<ExperimentStep> {
        self.steps.read().await.get(step_id).cloned()
    }

    /// 已上报的结果（按上报顺序）
    pub async fn reports(&self) -> Vec<(StepId, ExecutionResult)> {
        self.reports.read().await.clone()
    }
}

#[async_trait]
impl StepAssignmentClient for InMemoryAssignmentClient {
    async fn get_assigned_steps(&self, agent_id: &str) -> Result<Vec<ExperimentStep>, AssignmentError> {
        let mut steps: Vec<ExperimentStep> = self
            .steps
            .read()
            .await
            .values()
            .filter(|s| s.agent_id.as_deref() == Some(agent_id) && !s.is_terminal())
            .cloned()
            .collect();
        steps.sort_by(|a, b| (&a.experiment_id, a.sequence).cmp(&(&b.experiment_id, b.sequence)));
        Ok(steps)
    }

    async fn report_step_result(&self, step_id: &str, result: &ExecutionResult) -> Result<(), AssignmentError> {
        {
            let mut steps = self.steps.write().await;
            let step = steps
                .get_mut(step_id)
                .ok_or_else(|| AssignmentError::InvalidResponse(format!("Unknown step: {step_id}")))?;
            // 终态不可变
            if !step.is_terminal() {
                let now = Utc::now();
                step.status = result.status;
                step.started_at.get_or_insert(now);
                step.last_modified = now;
            }
        }
        self.reports
            .write()
            .await
            .push((step_id.to_string(), result.clone()));
        Ok(())
    }
}
