//! 查询发起方
//!
//! QueryIssuer 把查询文本发往分析后端（endpoint + database）并返回表格。
//! HttpQueryIssuer 走 REST：POST {endpoint}/v1/rest/query，body 为 {"db", "csl"}，
//! 响应取第一张表的 Columns / Rows。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::QueryError;
use crate::telemetry::table::TelemetryTable;

#[async_trait]
pub trait QueryIssuer: Send + Sync {
    async fn issue(&self, query: &str, endpoint: &str, database: &str) -> Result<TelemetryTable, QueryError>;
}

/// 分析后端连接参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub endpoint: Option<String>,
    pub database: Option<String>,
}

impl ConnectionSettings {
    pub fn new(endpoint: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            database: Some(database.into()),
        }
    }
}

/// 用于构建 HttpQueryIssuer 的配置
#[derive(Debug, Clone)]
pub struct QueryIssuerSettings {
    pub timeout_secs: u64,
    pub auth_token: Option<String>,
}

impl Default for QueryIssuerSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            auth_token: None,
        }
    }
}

impl QueryIssuerSettings {
    pub fn build(&self) -> Result<HttpQueryIssuer, QueryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        Ok(HttpQueryIssuer {
            client,
            auth_token: self.auth_token.clone(),
        })
    }
}

/// REST 查询客户端
pub struct HttpQueryIssuer {
    client: Client,
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(rename = "Tables")]
    tables: Vec<ResponseTable>,
}

#[derive(Deserialize)]
struct ResponseTable {
    #[serde(rename = "Columns")]
    columns: Vec<ResponseColumn>,
    #[serde(rename = "Rows")]
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct ResponseColumn {
    #[serde(rename = "ColumnName")]
    name: String,
}

/// 解析 REST 响应中的第一张表
pub fn parse_query_response(body: &str) -> Result<TelemetryTable, QueryError> {
    let response: QueryResponse =
        serde_json::from_str(body).map_err(|e| QueryError::MalformedResponse(e.to_string()))?;
    let table = response
        .tables
        .into_iter()
        .next()
        .ok_or_else(|| QueryError::MalformedResponse("response contains no tables".to_string()))?;
    Ok(TelemetryTable::new(
        table.columns.into_iter().map(|c| c.name).collect(),
        table.rows,
    ))
}

#[async_trait]
impl QueryIssuer for HttpQueryIssuer {
    async fn issue(&self, query: &str, endpoint: &str, database: &str) -> Result<TelemetryTable, QueryError> {
        let url = format!("{}/v1/rest/query", endpoint.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "db": database, "csl": query }));
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(QueryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        parse_query_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_first_table() {
        let body = r#"{
            "Tables": [
                {"TableName": "Table_0", "Columns": [{"ColumnName": "SuccessfulRuns", "DataType": "Int64"}], "Rows": [[5]]},
                {"TableName": "Table_1", "Columns": [], "Rows": []}
            ]
        }"#;
        let table = parse_query_response(body).unwrap();
        assert_eq!(table.columns, vec!["SuccessfulRuns".to_string()]);
        assert_eq!(table.rows, vec![vec![json!(5)]]);
    }

    #[test]
    fn test_parse_rejects_missing_tables() {
        assert!(matches!(
            parse_query_response(r#"{"Tables": []}"#),
            Err(QueryError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_query_response("not json"),
            Err(QueryError::MalformedResponse(_))
        ));
    }
}
