pub mod context;
pub mod orchestrator;
pub mod scheduler;
pub mod step;

pub use context::{
    BasicSchemaValidator, DynSchemaValidator, ExecutionHistory, InvocationSummary,
    SchemaValidator, StepExecutionContext, StepJobState,
};
pub use orchestrator::{execute_integration, ExecuteIntegrationOptions, ExecutionReport};
pub use scheduler::{
    execute_steps, ExecuteStepsParams, ExecutionMetadata, ExecutionResults,
    IntegrationStepResult, DEFAULT_STEP_CONCURRENCY,
};
pub use step::{
    validate_step_dependency_graph, IntegrationStep, StepExecutionHandler, StepStatus,
};
