//! Cancel Provider（Diagnostics/Cancel）
//!
//! 直接返回 Cancelled，不读取持久化状态，也不访问任何外部 API。

use async_trait::async_trait;

use crate::experiment::{ExecutionResult, StepType};
use crate::providers::context::{ProviderError, StepContext};
use crate::providers::registry::{ProviderDescriptor, StepProvider};

#[derive(Debug, Default)]
pub struct CancelProvider;

#[async_trait]
impl StepProvider for CancelProvider {
    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new(StepType::Diagnostics, "Cancel", &[])
    }

    fn requires_state(&self) -> bool {
        false
    }

    async fn execute(&self, _ctx: &mut StepContext) -> Result<ExecutionResult, ProviderError> {
        Ok(ExecutionResult::cancelled().with_message("Step cancelled"))
    }
}
