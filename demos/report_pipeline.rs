//! Report pipeline demo
//!
//! Wires in-process stand-in agents into an orchestrator, answers a question
//! through the fixed pipeline, runs a YAML workflow with recovery, fans a
//! request out to two agents and prints the metrics derived from the log.
//!
//! Run with: cargo run --example report_pipeline

use nl2sql_orchestrator::agent::{ExecuteSql, GenerateSql, Visualize};
use nl2sql_orchestrator::prelude::*;
use nl2sql_orchestrator::registry::AgentFactory;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

fn unsupported(request: &AgentRequest, agent: &str) -> AgentResponse {
    AgentResponse::failure(
        request.id,
        format!("{} does not support {}", agent, request.operation.name()),
    )
}

/// Keyword-based intent extraction
struct UnderstandingAgent;

#[async_trait]
impl Agent for UnderstandingAgent {
    fn agent_type(&self) -> &str {
        "query_understanding"
    }

    fn capabilities(&self) -> AgentCapability {
        AgentCapability::new(self.agent_type())
            .with_operation("understand_query")
            .with_operation("notify")
            .with_metadata("version", json!("demo"))
    }

    async fn process(&self, request: AgentRequest, _context: &AgentContext) -> Result<AgentResponse> {
        match &request.operation {
            AgentOperation::UnderstandQuery(input) => {
                let text = input.query.to_lowercase();
                let metric = if text.contains("revenue") { "revenue" } else { "count" };
                let grouping = if text.contains("region") { "region" } else { "month" };
                Ok(AgentResponse::success(
                    request.id,
                    json!({ "metric": metric, "group_by": grouping }),
                ))
            }
            AgentOperation::Notify(event) => {
                tracing::info!("query_understanding received event {}", event.name);
                Ok(AgentResponse::success(request.id, Value::Null))
            }
            _ => Ok(unsupported(&request, self.agent_type())),
        }
    }

    async fn health_status(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::healthy())
    }
}

/// Static schema catalog
struct SchemaAgent;

#[async_trait]
impl Agent for SchemaAgent {
    fn agent_type(&self) -> &str {
        "schema_navigation"
    }

    fn capabilities(&self) -> AgentCapability {
        AgentCapability::new(self.agent_type())
            .with_operation("navigate_schema")
            .with_operation("notify")
    }

    async fn process(&self, request: AgentRequest, _context: &AgentContext) -> Result<AgentResponse> {
        match &request.operation {
            AgentOperation::NavigateSchema(_) => Ok(AgentResponse::success(
                request.id,
                json!({ "tables": { "sales": ["month", "region", "amount"] } }),
            )),
            AgentOperation::Notify(_) => Ok(AgentResponse::success(request.id, Value::Null)),
            _ => Ok(unsupported(&request, self.agent_type())),
        }
    }

    async fn health_status(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::healthy())
    }
}

/// Template-based SQL generation that fails its first call
struct SqlAgent {
    calls: AtomicUsize,
}

impl SqlAgent {
    fn generate(input: &GenerateSql) -> Value {
        let metric = input.understanding["metric"].as_str().unwrap_or("count");
        let group_by = input.understanding["group_by"].as_str().unwrap_or("month");
        let aggregate = if metric == "revenue" { "SUM(amount)" } else { "COUNT(*)" };
        json!({
            "sql": format!(
                "SELECT {group_by}, {aggregate} AS {metric} FROM sales GROUP BY {group_by} ORDER BY {group_by}"
            ),
            "explanation": format!("{metric} grouped by {group_by}"),
        })
    }
}

#[async_trait]
impl Agent for SqlAgent {
    fn agent_type(&self) -> &str {
        "sql_generation"
    }

    fn capabilities(&self) -> AgentCapability {
        AgentCapability::new(self.agent_type())
            .with_operation("generate_sql")
            .with_performance_score(0.8)
    }

    async fn process(&self, request: AgentRequest, _context: &AgentContext) -> Result<AgentResponse> {
        match &request.operation {
            AgentOperation::GenerateSql(input) => {
                if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Error::agent("model warming up"));
                }
                Ok(AgentResponse::success(request.id, Self::generate(input)))
            }
            _ => Ok(unsupported(&request, self.agent_type())),
        }
    }

    async fn health_status(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::healthy())
    }
}

/// Executes against a tiny in-memory table
struct ExecutionAgent {
    rows: Vec<(&'static str, &'static str, f64)>,
}

impl ExecutionAgent {
    fn new() -> Self {
        Self {
            rows: vec![
                ("2024-01", "north", 1200.0),
                ("2024-01", "south", 800.0),
                ("2024-02", "north", 950.0),
                ("2024-02", "south", 1100.0),
            ],
        }
    }

    fn run(&self, input: &ExecuteSql) -> Value {
        let by_region = input.sql.contains("SELECT region");
        let mut totals: Vec<(String, f64)> = Vec::new();
        for (month, region, amount) in &self.rows {
            let key = if by_region { region } else { month };
            match totals.iter().position(|(k, _)| k == key) {
                Some(i) => totals[i].1 += amount,
                None => totals.push((key.to_string(), *amount)),
            }
        }
        let rows: Vec<Value> = totals
            .into_iter()
            .take(input.max_rows)
            .map(|(key, total)| json!([key, total]))
            .collect();
        json!({
            "columns": [if by_region { "region" } else { "month" }, "revenue"],
            "rows": rows,
        })
    }
}

#[async_trait]
impl Agent for ExecutionAgent {
    fn agent_type(&self) -> &str {
        "sql_execution"
    }

    fn capabilities(&self) -> AgentCapability {
        AgentCapability::new(self.agent_type()).with_operation("execute_sql")
    }

    async fn process(&self, request: AgentRequest, _context: &AgentContext) -> Result<AgentResponse> {
        match &request.operation {
            AgentOperation::ExecuteSql(input) => Ok(AgentResponse::success(request.id, self.run(input))),
            _ => Ok(unsupported(&request, self.agent_type())),
        }
    }

    async fn health_status(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::healthy())
    }
}

/// Picks a chart type; reports itself unhealthy
struct ChartAgent;

#[async_trait]
impl Agent for ChartAgent {
    fn agent_type(&self) -> &str {
        "visualization"
    }

    fn capabilities(&self) -> AgentCapability {
        AgentCapability::new(self.agent_type()).with_operation("visualize")
    }

    async fn process(&self, request: AgentRequest, _context: &AgentContext) -> Result<AgentResponse> {
        match &request.operation {
            AgentOperation::Visualize(Visualize { columns, rows, .. }) => {
                let chart = if rows.len() > 6 { "line" } else { "bar" };
                Ok(AgentResponse::success(
                    request.id,
                    json!({ "chart": chart, "x": columns.first(), "y": columns.get(1) }),
                ))
            }
            _ => Ok(unsupported(&request, self.agent_type())),
        }
    }

    async fn health_status(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::unhealthy(vec!["renderer pool at capacity".to_string()]))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::Pretty)?;

    let config = OrchestratorConfig::from_env()?;
    let chart_factory: AgentFactory = Arc::new(|| Arc::new(ChartAgent) as Arc<dyn Agent>);

    let orchestrator = OrchestratorBuilder::new()
        .config(config)
        .agent(Arc::new(UnderstandingAgent))
        .agent(Arc::new(SchemaAgent))
        .agent(Arc::new(SqlAgent { calls: AtomicUsize::new(0) }))
        .agent(Arc::new(ExecutionAgent::new()))
        .fallback("visualization", chart_factory)
        .build()
        .await?;

    println!("== Capabilities");
    for capability in orchestrator.discover_capabilities().await {
        println!(
            "  {:<20} available={} operations={:?}",
            capability.agent_type, capability.is_available, capability.operations
        );
    }

    println!("\n== Pipeline");
    let context = orchestrator.new_context();
    let result = orchestrator
        .process_query("What was our revenue by month?", &context)
        .await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    println!("\n== Workflow");
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/workflows/report.yaml");
    let workflow = WorkflowDefinition::from_file(&path)?;
    let execution = orchestrator
        .execute_workflow(&workflow, &orchestrator.new_context())
        .await;
    for step in &execution.result.steps {
        println!(
            "  {:<12} {:?} in {} ms {}",
            step.step_name,
            step.status,
            step.duration_ms,
            step.error.as_deref().unwrap_or("")
        );
    }
    if let Some(recovery) = &execution.recovery {
        println!("  recovered: {} via {:?}", recovery.success, recovery.strategy);
    }
    let status = orchestrator.monitor_execution(workflow.id).await?;
    println!("  status: {:?} progress={:.2}", status.state, status.progress);

    println!("\n== Fan-out");
    let request = AgentRequest::new(AgentOperation::Notify(AgentEvent::new(
        "ping",
        json!({ "from": "demo" }),
    )));
    let targets = vec!["query_understanding".to_string(), "sql_execution".to_string()];
    let aggregate = orchestrator
        .execute_parallel(&targets, &request, &orchestrator.new_context())
        .await;
    println!(
        "  success={} failed={:?} total_ms={}",
        aggregate.success, aggregate.failed_agents, aggregate.total_execution_time_ms
    );

    orchestrator
        .broadcast(
            AgentEvent::new("schema_changed", json!({ "table": "sales" })),
            &orchestrator.new_context(),
            None,
        )
        .await;

    println!("\n== Metrics");
    let metrics = orchestrator.metrics(None).await?;
    println!(
        "  messages={} success_rate={:.2} per_agent_ms={:?}",
        metrics.message_count, metrics.success_rate, metrics.agent_execution_times
    );
    for error in &metrics.errors {
        println!("  error: {}", error);
    }

    orchestrator.shutdown().await;
    Ok(())
}
