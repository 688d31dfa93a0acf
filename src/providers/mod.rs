pub mod cancel;
pub mod context;
pub mod registry;
pub mod schema;
pub mod sleep;

pub use cancel::CancelProvider;
pub use context::{ProviderError, StepContext};
pub use registry::{ProviderDescriptor, ProviderRegistry, RegistryError, StepProvider};
pub use schema::{step_schema_json, validate_parameters, ParameterKind, ParameterSpec, SchemaError};
pub use sleep::SleepProvider;

/// 注册内置 Provider（Sleep / Cancel）
pub fn register_builtin(registry: &mut ProviderRegistry) -> Result<(), RegistryError> {
    registry.register(SleepProvider)?;
    registry.register(CancelProvider)?;
    Ok(())
}
