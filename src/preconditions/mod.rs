//! 触发器前置条件

pub mod evaluator;
pub mod kinds;

pub use evaluator::{EvaluationError, PreconditionEvaluator, ScheduleContext};
pub use kinds::{
    InProgressExperimentsPrecondition, PreconditionKind, SuccessfulExperimentsPrecondition, TelemetryQuery,
    IN_PROGRESS_EXPERIMENTS, SUCCESSFUL_EXPERIMENTS,
};
