//! 实验启动方
//!
//! 触发器的前置条件全部满足后，调度器通过 ExperimentLauncher 创建新的实验实例。
//! HttpExperimentLauncher 走实验管理 API：POST {base}/experiments。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::ErrorClass;
use crate::experiment::{ExperimentId, TargetGoalTrigger};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Launch request failed: {0}")]
    Transport(String),

    #[error("Experiment API returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid launch response: {0}")]
    InvalidResponse(String),
}

impl LaunchError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientExternal
    }
}

#[async_trait]
pub trait ExperimentLauncher: Send + Sync {
    /// 为触发器创建一个新的实验实例，返回实验 ID
    async fn launch(&self, trigger: &TargetGoalTrigger) -> Result<ExperimentId, LaunchError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchRequest<'a> {
    /// 幂等键：同一请求重试时不会重复创建
    request_id: String,
    experiment_name: &'a str,
    target_goal: &'a str,
    trigger_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchResponse {
    experiment_id: ExperimentId,
}

pub struct HttpExperimentLauncher {
    client: Client,
    base_url: String,
}

impl HttpExperimentLauncher {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Result<Self, LaunchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LaunchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ExperimentLauncher for HttpExperimentLauncher {
    async fn launch(&self, trigger: &TargetGoalTrigger) -> Result<ExperimentId, LaunchError> {
        let url = format!("{}/experiments", self.base_url);
        let request = LaunchRequest {
            request_id: Uuid::new_v4().to_string(),
            experiment_name: &trigger.experiment_name,
            target_goal: &trigger.target_goal,
            trigger_id: &trigger.id,
        };
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LaunchError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LaunchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let body: LaunchResponse = resp
            .json()
            .await
            .map_err(|e| LaunchError::InvalidResponse(e.to_string()))?;
        Ok(body.experiment_id)
    }
}
