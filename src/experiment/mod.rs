//! 实验数据模型与步骤分配协作方

pub mod client;
pub mod types;

pub use client::{HttpAssignmentClient, InMemoryAssignmentClient, StepAssignmentClient};
pub use types::*;
