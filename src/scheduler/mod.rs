//! 触发器调度：按固定节奏评估目标触发器的前置条件，满足时启动新实验

pub mod launcher;
pub mod trigger;

pub use launcher::{ExperimentLauncher, HttpExperimentLauncher, LaunchError};
pub use trigger::{TriggerDecision, TriggerScheduler};
