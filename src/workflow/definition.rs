//! Workflow definitions and results

use crate::agent::AgentOperation;
use crate::error::{Error, Result};
use crate::types::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Ordered set of agent invocations.
///
/// The engine never mutates a submitted definition; optimization produces a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier, also the correlation id of its messages
    #[serde(default)]
    pub id: WorkflowId,
    /// Human-readable name
    pub name: String,
    /// Steps, executed by ascending `order`
    pub steps: Vec<WorkflowStep>,
}

/// One agent invocation inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step name, unique within the workflow
    pub name: String,
    /// Target agent type
    pub agent_type: String,
    /// Position; ties keep declaration order
    #[serde(default)]
    pub order: u32,
    /// Whether a failure aborts the workflow
    #[serde(default = "default_required")]
    pub required: bool,
    /// Operation sent to the agent
    pub input: AgentOperation,
    /// Names of steps that must run first
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-step deadline overriding the engine default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_required() -> bool {
    true
}

impl WorkflowStep {
    /// Create a required step
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        order: u32,
        input: AgentOperation,
    ) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            order,
            required: true,
            input,
            depends_on: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Mark the step optional
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Declare a dependency on another step
    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    /// Set the step deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Step deadline, if declared
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl WorkflowDefinition {
    /// Create an empty workflow
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Add a step
    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Load a workflow from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let workflow: Self = serde_yaml::from_str(yaml)?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Load a workflow from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Check structural consistency
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::invalid_input(format!(
                "workflow '{}' has no steps",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for step in &self.steps {
            if !names.insert(step.name.as_str()) {
                return Err(Error::invalid_input(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        for step in &self.steps {
            if let Some(missing) = step.depends_on.iter().find(|d| !names.contains(d.as_str())) {
                return Err(Error::invalid_input(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.name, missing
                )));
            }
        }

        Ok(())
    }

    /// Steps by ascending order, ties in declaration order
    pub fn sorted_steps(&self) -> Vec<&WorkflowStep> {
        let mut steps: Vec<&WorkflowStep> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.order);
        steps
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Whether any step is optional
    pub fn has_optional_steps(&self) -> bool {
        self.steps.iter().any(|step| !step.required)
    }

    /// Copy with optional steps removed. Dependencies on removed steps are dropped.
    pub fn required_only(&self) -> Self {
        let kept: HashSet<&str> = self
            .steps
            .iter()
            .filter(|step| step.required)
            .map(|step| step.name.as_str())
            .collect();

        let steps = self
            .steps
            .iter()
            .filter(|step| step.required)
            .map(|step| {
                let mut step = step.clone();
                step.depends_on.retain(|dep| kept.contains(dep.as_str()));
                step
            })
            .collect();

        Self {
            id: self.id,
            name: self.name.clone(),
            steps,
        }
    }
}

/// Outcome of one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The agent reported success
    Completed,
    /// The exchange failed or the agent reported failure
    Failed,
}

/// Final state of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Every required step completed
    Completed,
    /// A required step failed, or the workflow could not start
    Aborted,
}

/// Result of one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name
    pub step_name: String,
    /// Target agent type
    pub agent_type: String,
    /// Whether the step was required
    pub required: bool,
    /// Outcome
    pub status: StepStatus,
    /// Elapsed time in milliseconds
    pub duration_ms: u64,
    /// Agent output
    pub output: Option<serde_json::Value>,
    /// Error message
    pub error: Option<String>,
}

impl StepResult {
    /// Whether the step failed
    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// Result of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Workflow identifier
    pub workflow_id: WorkflowId,
    /// Workflow name
    pub workflow_name: String,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// End time
    pub completed_at: DateTime<Utc>,
    /// Total duration in milliseconds
    pub total_duration_ms: u64,
    /// Whether every required step completed
    pub success: bool,
    /// Final state
    pub state: WorkflowState,
    /// Executed steps in execution order
    pub steps: Vec<StepResult>,
    /// Abort reason
    pub error: Option<String>,
}

impl WorkflowResult {
    /// Begin a result for a workflow
    pub fn start(workflow: &WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow.id,
            workflow_name: workflow.name.clone(),
            started_at: now,
            completed_at: now,
            total_duration_ms: 0,
            success: true,
            state: WorkflowState::Completed,
            steps: Vec::new(),
            error: None,
        }
    }

    /// Mark the run aborted
    pub fn abort(&mut self, error: impl Into<String>) {
        self.success = false;
        self.state = WorkflowState::Aborted;
        self.error = Some(error.into());
    }

    /// Stamp the end time
    pub fn finish(mut self) -> Self {
        self.completed_at = Utc::now();
        self.total_duration_ms = (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self
    }

    /// Result of a named step
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.step_name == name)
    }

    /// Steps that failed
    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|step| step.is_failed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentEvent, UnderstandQuery};
    use serde_json::json;

    fn notify(name: &str) -> AgentOperation {
        AgentOperation::Notify(AgentEvent::new(name, json!({})))
    }

    #[test]
    fn test_parse_workflow_yaml() {
        let yaml = r#"
name: monthly revenue report
steps:
  - name: understand
    agent_type: query_understanding
    order: 1
    input:
      operation: understand_query
      input:
        query: "revenue by month for 2024"
  - name: chart
    agent_type: visualization
    order: 2
    required: false
    depends_on: [understand]
    timeout_ms: 2000
    input:
      operation: notify
      input:
        name: render
"#;
        let workflow = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(workflow.steps.len(), 2);
        assert!(workflow.steps[0].required);
        assert_eq!(
            workflow.steps[0].input,
            AgentOperation::UnderstandQuery(UnderstandQuery {
                query: "revenue by month for 2024".into()
            })
        );
        assert!(!workflow.steps[1].required);
        assert_eq!(workflow.steps[1].timeout(), Some(Duration::from_secs(2)));
        assert_eq!(workflow.steps[1].depends_on, vec!["understand"]);
    }

    #[test]
    fn test_validate_rejects_bad_definitions() {
        assert!(WorkflowDefinition::new("empty").validate().is_err());

        let duplicate = WorkflowDefinition::new("dup")
            .with_step(WorkflowStep::new("a", "x", 0, notify("a")))
            .with_step(WorkflowStep::new("a", "y", 1, notify("a")));
        assert!(matches!(duplicate.validate(), Err(Error::InvalidInput(_))));

        let dangling = WorkflowDefinition::new("dangling")
            .with_step(WorkflowStep::new("a", "x", 0, notify("a")).depends_on("missing"));
        assert!(matches!(dangling.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_sorted_steps_are_stable() {
        let workflow = WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("late", "x", 2, notify("late")))
            .with_step(WorkflowStep::new("first", "x", 1, notify("first")))
            .with_step(WorkflowStep::new("second", "x", 1, notify("second")));

        let names: Vec<_> = workflow.sorted_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "late"]);
    }

    #[test]
    fn test_required_only_drops_optional_dependencies() {
        let workflow = WorkflowDefinition::new("w")
            .with_step(WorkflowStep::new("a", "x", 0, notify("a")))
            .with_step(WorkflowStep::new("b", "x", 1, notify("b")).optional())
            .with_step(WorkflowStep::new("c", "x", 2, notify("c")).depends_on("b").depends_on("a"));

        let simplified = workflow.required_only();
        assert_eq!(simplified.steps.len(), 2);
        assert_eq!(simplified.id, workflow.id);
        assert_eq!(simplified.step("c").unwrap().depends_on, vec!["a"]);
        assert!(simplified.validate().is_ok());
        assert_eq!(workflow.steps.len(), 3);
    }
}
