//! 核心：错误分类、关闭信号

pub mod error;
pub mod shutdown;

pub use error::{AssignmentError, ErrorClass, QueryError, StateError};
pub use shutdown::{ShutdownManager, ShutdownReason};
