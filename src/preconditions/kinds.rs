//! 内置前置条件类型
//!
//! - SuccessfulExperiments（就绪门）：目标在最近 N 天内至少有 M 次成功实验
//! - InProgressExperiments（互斥门）：目标当前没有进行中的实验
//!
//! 比较方式（>= 或 == 0）属于具体类型，而不属于评估器。

use std::collections::HashMap;

use serde_json::Value;

use crate::experiment::ParameterValue;
use crate::preconditions::evaluator::{EvaluationError, ScheduleContext};
use crate::providers::schema::{ParameterKind, ParameterSpec};

/// 查询文本与缓存 key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryQuery {
    pub cache_key: String,
    pub text: String,
}

/// 前置条件类型：声明参数 schema，生成查询，并判断查询结果是否满足
pub trait PreconditionKind: Send + Sync {
    fn name(&self) -> &'static str;

    fn parameters(&self) -> &'static [ParameterSpec];

    /// 查询结果中承载标量的列名
    fn column(&self) -> &'static str;

    fn build_query(
        &self,
        parameters: &HashMap<String, ParameterValue>,
        ctx: &ScheduleContext,
    ) -> Result<TelemetryQuery, EvaluationError>;

    fn is_satisfied_by(
        &self,
        value: &Value,
        parameters: &HashMap<String, ParameterValue>,
    ) -> Result<bool, EvaluationError>;
}

pub const SUCCESSFUL_EXPERIMENTS: &str = "SuccessfulExperiments";
pub const IN_PROGRESS_EXPERIMENTS: &str = "InProgressExperiments";

const DEFAULT_DAYS_AGO: i64 = 7;

const SUCCESSFUL_PARAMETERS: &[ParameterSpec] = &[
    ParameterSpec::optional("targetGoal", ParameterKind::String),
    ParameterSpec::required("minimumSuccessfulRuns", ParameterKind::Integer),
    ParameterSpec::optional("daysAgo", ParameterKind::Integer),
];

const IN_PROGRESS_PARAMETERS: &[ParameterSpec] = &[ParameterSpec::optional("targetGoal", ParameterKind::String)];

/// 就绪门：成功次数 >= minimumSuccessfulRuns
#[derive(Debug, Default)]
pub struct SuccessfulExperimentsPrecondition;

impl PreconditionKind for SuccessfulExperimentsPrecondition {
    fn name(&self) -> &'static str {
        SUCCESSFUL_EXPERIMENTS
    }

    fn parameters(&self) -> &'static [ParameterSpec] {
        SUCCESSFUL_PARAMETERS
    }

    fn column(&self) -> &'static str {
        "SuccessfulRuns"
    }

    fn build_query(
        &self,
        parameters: &HashMap<String, ParameterValue>,
        ctx: &ScheduleContext,
    ) -> Result<TelemetryQuery, EvaluationError> {
        let goal = target_goal(parameters, ctx);
        let days = parameters
            .get("daysAgo")
            .and_then(ParameterValue::as_i64)
            .unwrap_or(DEFAULT_DAYS_AGO);
        if days <= 0 {
            return Err(EvaluationError::InvalidParameter(format!(
                "daysAgo must be positive, got {days}"
            )));
        }
        let text = format!(
            "ExperimentSummary\n\
             | where TargetGoal == '{goal}' and Timestamp >= ago({days}d)\n\
             | summarize arg_max(Timestamp, Status) by ExperimentId\n\
             | where Status == 'Succeeded'\n\
             | summarize {column} = count()",
            goal = escape_literal(goal),
            column = self.column(),
        );
        Ok(TelemetryQuery {
            cache_key: format!("{}:{}:{}:{}d", self.name(), database_key(ctx), goal, days),
            text,
        })
    }

    fn is_satisfied_by(
        &self,
        value: &Value,
        parameters: &HashMap<String, ParameterValue>,
    ) -> Result<bool, EvaluationError> {
        let minimum = parameters
            .get("minimumSuccessfulRuns")
            .and_then(ParameterValue::as_i64)
            .ok_or_else(|| EvaluationError::InvalidParameter("minimumSuccessfulRuns is required".to_string()))?;
        if minimum < 0 {
            return Err(EvaluationError::InvalidParameter(format!(
                "minimumSuccessfulRuns must not be negative, got {minimum}"
            )));
        }
        let count = numeric(self.column(), value)?;
        Ok(count >= minimum as f64)
    }
}

/// 互斥门：进行中的实验数 == 0
#[derive(Debug, Default)]
pub struct InProgressExperimentsPrecondition;

impl PreconditionKind for InProgressExperimentsPrecondition {
    fn name(&self) -> &'static str {
        IN_PROGRESS_EXPERIMENTS
    }

    fn parameters(&self) -> &'static [ParameterSpec] {
        IN_PROGRESS_PARAMETERS
    }

    fn column(&self) -> &'static str {
        "InProgressRuns"
    }

    fn build_query(
        &self,
        parameters: &HashMap<String, ParameterValue>,
        ctx: &ScheduleContext,
    ) -> Result<TelemetryQuery, EvaluationError> {
        let goal = target_goal(parameters, ctx);
        let text = format!(
            "ExperimentSummary\n\
             | where TargetGoal == '{goal}'\n\
             | summarize arg_max(Timestamp, Status) by ExperimentId\n\
             | where Status in ('Pending', 'InProgress')\n\
             | summarize {column} = count()",
            goal = escape_literal(goal),
            column = self.column(),
        );
        Ok(TelemetryQuery {
            cache_key: format!("{}:{}:{}", self.name(), database_key(ctx), goal),
            text,
        })
    }

    fn is_satisfied_by(
        &self,
        value: &Value,
        _parameters: &HashMap<String, ParameterValue>,
    ) -> Result<bool, EvaluationError> {
        Ok(numeric(self.column(), value)? == 0.0)
    }
}

/// 未显式指定 targetGoal 时使用触发器自身的目标
fn target_goal<'a>(parameters: &'a HashMap<String, ParameterValue>, ctx: &'a ScheduleContext) -> &'a str {
    parameters
        .get("targetGoal")
        .and_then(ParameterValue::as_str)
        .unwrap_or(ctx.target_goal.as_str())
}

fn database_key(ctx: &ScheduleContext) -> &str {
    ctx.connection.database.as_deref().unwrap_or("")
}

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn numeric(column: &str, value: &Value) -> Result<f64, EvaluationError> {
    value.as_f64().ok_or_else(|| EvaluationError::UnexpectedValue {
        column: column.to_string(),
        value: value.to_string(),
    })
}
