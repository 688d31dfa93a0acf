//! Agent 侧执行循环：发现分配的步骤并逐个驱动到终态

pub mod loop_;
pub mod schedule;

pub use loop_::{AgentExecutionLoop, AgentLoopConfig, IterationSummary, StepFault, StepOutcome};
pub use schedule::TickSchedule;
