//! Workflow engine
//!
//! Steps execute strictly one after another in ascending order. A failed
//! required step aborts the run; a failed optional step is recorded and
//! execution continues.

use crate::agent::AgentRequest;
use crate::error::{Error, Result};
use crate::log::LogQuery;
use crate::protocol::CommunicationProtocol;
use crate::types::{AgentContext, WorkflowId};
use crate::workflow::definition::{
    StepResult, StepStatus, WorkflowDefinition, WorkflowResult, WorkflowStep,
};
use crate::workflow::status::ExecutionStatus;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Workflows whose expected step count is remembered for monitoring
pub const MAX_TRACKED_WORKFLOWS: usize = 10_000;

/// Executes, reorders and monitors workflows
pub struct WorkflowEngine {
    protocol: Arc<CommunicationProtocol>,
    step_timeout: Duration,
    expected_steps: DashMap<WorkflowId, usize>,
    // submission order, oldest first
    tracked: Mutex<VecDeque<WorkflowId>>,
    tracking_capacity: usize,
}

impl WorkflowEngine {
    /// Create an engine sending through `protocol`
    pub fn new(protocol: Arc<CommunicationProtocol>, step_timeout: Duration) -> Self {
        Self {
            protocol,
            step_timeout,
            expected_steps: DashMap::new(),
            tracked: Mutex::new(VecDeque::new()),
            tracking_capacity: MAX_TRACKED_WORKFLOWS,
        }
    }

    /// Remember at most `capacity` workflows for monitoring.
    ///
    /// Once full, the oldest submission is forgotten; monitoring it then
    /// reports progress as for an unknown step count.
    pub fn with_tracking_capacity(mut self, capacity: usize) -> Self {
        self.tracking_capacity = capacity.max(1);
        self
    }

    /// Protocol used for step calls
    pub fn protocol(&self) -> &Arc<CommunicationProtocol> {
        &self.protocol
    }

    /// Execute a workflow.
    ///
    /// Every step message is correlated by the workflow id. Each step
    /// receives the outputs of earlier completed steps in its
    /// `previous_outputs` parameter.
    pub async fn coordinate_agents(
        &self,
        workflow: &WorkflowDefinition,
        context: &AgentContext,
    ) -> WorkflowResult {
        let mut result = WorkflowResult::start(workflow);

        if let Err(e) = workflow.validate() {
            result.abort(e.to_string());
            return result.finish();
        }

        let context = context.correlated_to(workflow.id.into());
        self.track(workflow.id, workflow.steps.len());

        tracing::info!(
            workflow = %workflow.name,
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            "Starting workflow"
        );

        let mut previous_outputs = serde_json::Map::new();

        for step in workflow.sorted_steps() {
            let step_result = self
                .run_step(workflow, step, &context, &previous_outputs)
                .await;

            if let Some(output) = &step_result.output {
                previous_outputs.insert(step.name.clone(), output.clone());
            }

            let failure = step_result.error.clone();
            result.steps.push(step_result);

            if let Some(message) = failure {
                if step.required {
                    let err = Error::required_step_failed(&step.name, message);
                    tracing::warn!("Workflow {} aborted: {}", workflow.name, err);
                    result.abort(err.to_string());
                    break;
                }
                tracing::info!(
                    "Optional step {} of workflow {} failed, continuing: {}",
                    step.name,
                    workflow.name,
                    message
                );
            }
        }

        let result = result.finish();
        tracing::info!(
            workflow = %workflow.name,
            success = result.success,
            duration_ms = result.total_duration_ms,
            "Workflow finished"
        );
        result
    }

    async fn run_step(
        &self,
        workflow: &WorkflowDefinition,
        step: &WorkflowStep,
        context: &AgentContext,
        previous_outputs: &serde_json::Map<String, Value>,
    ) -> StepResult {
        let request = AgentRequest::new(step.input.clone())
            .with_parameter("workflow_id", json!(workflow.id.to_string()))
            .with_parameter("step", json!(step.name))
            .with_parameter("previous_outputs", Value::Object(previous_outputs.clone()));
        let timeout = step.timeout().unwrap_or(self.step_timeout);

        let start = Instant::now();
        let outcome = self
            .protocol
            .send(&step.agent_type, request, context, Some(timeout))
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, output, error) = match outcome {
            Ok(response) if response.success => (
                StepStatus::Completed,
                Some(response.result.unwrap_or(Value::Null)),
                None,
            ),
            Ok(response) => (
                StepStatus::Failed,
                None,
                Some(
                    response
                        .error
                        .unwrap_or_else(|| "agent reported failure".to_string()),
                ),
            ),
            Err(e) => (StepStatus::Failed, None, Some(e.to_string())),
        };

        StepResult {
            step_name: step.name.clone(),
            agent_type: step.agent_type.clone(),
            required: step.required,
            status,
            duration_ms,
            output,
            error,
        }
    }

    /// Produce a topologically ordered copy of a workflow.
    ///
    /// Declared `depends_on` edges are used when any step has them;
    /// otherwise each step depends on the one before it in declared order.
    /// Ties go to the lower original position. A cycle is an error.
    pub fn optimize_workflow(&self, workflow: &WorkflowDefinition) -> Result<WorkflowDefinition> {
        workflow.validate()?;

        let steps = workflow.sorted_steps();
        let position: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, step)| (step.name.as_str(), i))
            .collect();

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        let mut in_degree = vec![0usize; steps.len()];

        if steps.iter().any(|step| !step.depends_on.is_empty()) {
            for (i, step) in steps.iter().enumerate() {
                for dep in &step.depends_on {
                    let j = *position.get(dep.as_str()).ok_or_else(|| {
                        Error::invalid_input(format!(
                            "step '{}' depends on unknown step '{}'",
                            step.name, dep
                        ))
                    })?;
                    dependents[j].push(i);
                    in_degree[i] += 1;
                }
            }
        } else {
            for i in 1..steps.len() {
                dependents[i - 1].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut sorted = Vec::with_capacity(steps.len());

        while let Some(Reverse(i)) = ready.pop() {
            sorted.push(i);
            for &k in &dependents[i] {
                in_degree[k] -= 1;
                if in_degree[k] == 0 {
                    ready.push(Reverse(k));
                }
            }
        }

        if sorted.len() < steps.len() {
            let cyclic: Vec<&str> = steps
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, step)| step.name.as_str())
                .collect();
            return Err(Error::CyclicWorkflow(format!(
                "workflow '{}' has a dependency cycle through steps {}",
                workflow.name,
                cyclic.join(", ")
            )));
        }

        let steps = sorted
            .into_iter()
            .enumerate()
            .map(|(order, i)| {
                let mut step = steps[i].clone();
                step.order = order as u32;
                step
            })
            .collect();

        Ok(WorkflowDefinition {
            id: workflow.id,
            name: workflow.name.clone(),
            steps,
        })
    }

    /// Live status of a workflow, derived from the communication log
    pub async fn monitor_execution(&self, workflow_id: WorkflowId) -> Result<ExecutionStatus> {
        let entries = self
            .protocol
            .log()
            .query(&LogQuery::for_correlation(workflow_id.into()))
            .await?;
        let expected = self
            .expected_steps
            .get(&workflow_id)
            .map(|count| *count)
            .unwrap_or(0);

        Ok(ExecutionStatus::from_entries(workflow_id, &entries, expected))
    }

    /// Expected step count of a submitted workflow
    pub fn expected_steps(&self, workflow_id: WorkflowId) -> Option<usize> {
        self.expected_steps.get(&workflow_id).map(|count| *count)
    }

    fn track(&self, workflow_id: WorkflowId, steps: usize) {
        let mut tracked = self.tracked.lock();
        // reruns of the same workflow keep their original position
        if self.expected_steps.insert(workflow_id, steps).is_some() {
            return;
        }
        tracked.push_back(workflow_id);
        while tracked.len() > self.tracking_capacity {
            if let Some(oldest) = tracked.pop_front() {
                self.expected_steps.remove(&oldest);
            }
        }
    }
}
