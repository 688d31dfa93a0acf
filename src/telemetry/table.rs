//! 查询结果表

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 表格形状不符合预期
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TableShapeError {
    #[error("Expected exactly one row, got none")]
    NoRows,

    #[error("Expected exactly one row, got {0}")]
    MultipleRows(usize),

    #[error("Expected column '{0}' is missing")]
    MissingColumn(String),
}

/// 分析后端返回的表格：列名 + 行
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl TelemetryTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// 单行单列表格（测试与简单查询）
    pub fn scalar(column: impl Into<String>, value: Value) -> Self {
        Self {
            columns: vec![column.into()],
            rows: vec![vec![value]],
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// 恰好一行时取该行指定列的值
    pub fn single_value(&self, column: &str) -> Result<&Value, TableShapeError> {
        let row = match self.rows.as_slice() {
            [] => return Err(TableShapeError::NoRows),
            [row] => row,
            rows => return Err(TableShapeError::MultipleRows(rows.len())),
        };
        let idx = self
            .column_index(column)
            .ok_or_else(|| TableShapeError::MissingColumn(column.to_string()))?;
        row.get(idx)
            .ok_or_else(|| TableShapeError::MissingColumn(column.to_string()))
    }
}
