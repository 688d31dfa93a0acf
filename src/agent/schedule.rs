//! tick 调度表
//!
//! 记录每个步骤下一次允许 tick 的最早时间（InProgress 返回的延期是下界）。
//! 终态或不再下发的步骤会被移除。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::experiment::StepId;

#[derive(Debug, Default)]
pub struct TickSchedule {
    not_before: Mutex<HashMap<StepId, Instant>>,
}

impl TickSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否已到允许 tick 的时间；没有记录的步骤总是可执行
    pub async fn is_due(&self, step_id: &str, now: Instant) -> bool {
        match self.not_before.lock().await.get(step_id) {
            Some(at) => now >= *at,
            None => true,
        }
    }

    /// 记录下一次 tick 的下界
    pub async fn defer(&self, step_id: &str, from: Instant, extension: Duration) {
        self.not_before
            .lock()
            .await
            .insert(step_id.to_string(), from + extension);
    }

    pub async fn next_tick(&self, step_id: &str) -> Option<Instant> {
        self.not_before.lock().await.get(step_id).copied()
    }

    pub async fn clear(&self, step_id: &str) {
        self.not_before.lock().await.remove(step_id);
    }

    /// 只保留仍在分配列表中的步骤
    pub async fn retain(&self, live: &HashSet<StepId>) {
        self.not_before.lock().await.retain(|id, _| live.contains(id));
    }

    pub async fn len(&self) -> usize {
        self.not_before.lock().await.len()
    }
}
