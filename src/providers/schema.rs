//! 参数 Schema 与校验
//!
//! 每个 Provider / 前置条件声明参数 schema（名称、类型、是否必填）；validate_parameters
//! 在调用业务逻辑前检查所有必填参数存在且类型正确。
//! step_schema_json 用 schemars 生成 ExperimentStep 的 JSON Schema，供实验定义方校验载荷。

use std::collections::HashMap;
use std::time::Duration;

use schemars::schema_for;
use serde_json::Value;
use thiserror::Error;

use crate::core::ErrorClass;
use crate::experiment::{ExperimentStep, ParameterValue};

/// 参数期望类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    Integer,
    /// 接受整数
    Float,
    Boolean,
    /// 整数秒，或 "90s" / "5m" / "2h" / "1d" / "hh:mm:ss"
    Duration,
}

impl ParameterKind {
    fn name(self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Float => "float",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Duration => "duration",
        }
    }

    fn accepts(self, value: &ParameterValue) -> bool {
        match self {
            ParameterKind::String => value.as_str().is_some(),
            ParameterKind::Integer => value.as_i64().is_some(),
            ParameterKind::Float => value.as_f64().is_some(),
            ParameterKind::Boolean => value.as_bool().is_some(),
            ParameterKind::Duration => parse_duration(value).is_some(),
        }
    }

    fn json_type(self) -> &'static str {
        match self {
            ParameterKind::String => "string",
            ParameterKind::Integer => "integer",
            ParameterKind::Float => "number",
            ParameterKind::Boolean => "boolean",
            ParameterKind::Duration => "string",
        }
    }
}

/// 单个参数声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub required: bool,
}

impl ParameterSpec {
    pub const fn required(name: &'static str, kind: ParameterKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ParameterKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// 参数不符合 schema
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Missing required parameter '{0}'")]
    MissingParameter(String),

    #[error("Parameter '{name}' expects {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: String,
    },
}

impl SchemaError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// 校验参数：必填参数必须存在；出现的已声明参数必须类型正确；未声明参数忽略
pub fn validate_parameters(
    schema: &[ParameterSpec],
    parameters: &HashMap<String, ParameterValue>,
) -> Result<(), SchemaError> {
    for spec in schema {
        match parameters.get(spec.name) {
            None if spec.required => {
                return Err(SchemaError::MissingParameter(spec.name.to_string()));
            }
            None => {}
            Some(value) if !spec.kind.accepts(value) => {
                let actual = match value {
                    ParameterValue::String(s) => format!("string '{s}'"),
                    other => other.kind_name().to_string(),
                };
                return Err(SchemaError::TypeMismatch {
                    name: spec.name.to_string(),
                    expected: spec.kind.name(),
                    actual,
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// 解析时长参数；无法解析返回 None
pub fn parse_duration(value: &ParameterValue) -> Option<Duration> {
    match value {
        ParameterValue::Integer(secs) if *secs >= 0 => Some(Duration::from_secs(*secs as u64)),
        ParameterValue::String(s) => parse_duration_str(s),
        _ => None,
    }
}

fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    // hh:mm:ss
    if s.contains(':') {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return None;
        }
        let h: u64 = parts[0].parse().ok()?;
        let m: u64 = parts[1].parse().ok()?;
        let sec: u64 = parts[2].parse().ok()?;
        if m >= 60 || sec >= 60 {
            return None;
        }
        let total = h.checked_mul(3600)?.checked_add(m * 60 + sec)?;
        return Some(Duration::from_secs(total));
    }

    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = digits.parse().ok()?;
    let multiplier = match unit {
        "ms" => return Some(Duration::from_millis(n)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    Some(Duration::from_secs(n.checked_mul(multiplier)?))
}

/// 将参数 schema 渲染为 JSON Schema（object/properties/required）
pub fn parameters_json_schema(schema: &[ParameterSpec]) -> Value {
    let properties: serde_json::Map<String, Value> = schema
        .iter()
        .map(|spec| {
            (
                spec.name.to_string(),
                serde_json::json!({ "type": spec.kind.json_type() }),
            )
        })
        .collect();
    let required: Vec<&str> = schema
        .iter()
        .filter(|spec| spec.required)
        .map(|spec| spec.name)
        .collect();
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

/// 返回 ExperimentStep 的 JSON Schema 字符串
pub fn step_schema_json() -> String {
    let schema = schema_for!(ExperimentStep);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
