//! Workflow module - ordered agent invocations with required/optional steps
//!
//! Workflows can be built in code or loaded from YAML:
//!
//! ```rust,ignore
//! use nl2sql_orchestrator::workflow::WorkflowDefinition;
//!
//! let workflow = WorkflowDefinition::from_file("demos/workflows/report.yaml")?;
//! let result = orchestrator.execute_workflow(&workflow, &context).await;
//! ```

pub mod definition;
pub mod engine;
pub mod status;

pub use definition::{
    StepResult, StepStatus, WorkflowDefinition, WorkflowResult, WorkflowState, WorkflowStep,
};
pub use engine::WorkflowEngine;
pub use status::{ExecutionState, ExecutionStatus};
