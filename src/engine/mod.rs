//! 步骤执行：可恢复状态机与 Provider 状态持久化

pub mod executor;
pub mod state;

pub use executor::{EngineError, StepExecutionEngine, DEFAULT_EXTENSION};
pub use state::{InMemoryStateStore, SqliteStateStore, StateScope, StateStore};
