//! Multi-step tool plans: dependency-ordered execution with per-step
//! variable substitution.
//!
//! Steps form a DAG via `depends_on`; a cycle fails plan construction, not
//! execution. Params may reference earlier results with
//! `${<step_id>.<path.into.data>}`; unresolved references keep the literal
//! marker and log a warning. Failure handling per step: abort, continue, or
//! retry once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::executor::{ExecuteOptions, ToolExecutor};
use super::protocol::ParsedToolCall;
use super::{ToolCallRecord, ToolContext, ToolResult};

static STEP_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z0-9_\-]+)((?:\.[A-Za-z0-9_\-]+)*)\}").expect("static regex")
});

/// What to do when a step fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnFailure {
    #[default]
    Abort,
    Continue,
    /// One more attempt; a second failure aborts the plan.
    Retry,
}

/// One step of a plan.
#[derive(Clone, Debug)]
pub struct ToolStep {
    pub step_id: String,
    pub tool_name: String,
    pub params: Value,
    pub depends_on: Vec<String>,
    pub on_failure: OnFailure,
}

/// Construction-time plan errors.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),
    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },
    #[error("dependency cycle involving steps: {0}")]
    Cycle(String),
}

/// A validated, topologically ordered plan.
#[derive(Debug)]
pub struct ExecutionPlan {
    ordered: Vec<ToolStep>,
}

impl ExecutionPlan {
    pub fn steps(&self) -> &[ToolStep] {
        &self.ordered
    }
}

/// Outcome of one executed (or skipped) step.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step_id: String,
    pub tool: String,
    pub result: Option<ToolResult>,
    pub skipped: bool,
}

/// Outcome of a whole plan run.
#[derive(Clone, Debug)]
pub struct PlanOutcome {
    pub steps: Vec<StepOutcome>,
    /// One record per executed (non-skipped) step, in execution order.
    pub records: Vec<ToolCallRecord>,
    pub aborted: bool,
}

impl PlanOutcome {
    pub fn success(&self) -> bool {
        !self.aborted
            && self
                .steps
                .iter()
                .all(|s| s.skipped || s.result.as_ref().is_some_and(|r| r.success))
    }
}

/// Runs validated plans through the executor.
pub struct ToolOrchestrator {
    executor: Arc<ToolExecutor>,
}

impl ToolOrchestrator {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self { executor }
    }

    /// Validates ids and dependencies, and orders steps topologically.
    /// Ties keep the caller's ordering.
    pub fn build_plan(steps: Vec<ToolStep>) -> Result<ExecutionPlan, PlanError> {
        let mut ids = HashSet::new();
        for step in &steps {
            if !ids.insert(step.step_id.clone()) {
                return Err(PlanError::DuplicateStep(step.step_id.clone()));
            }
        }
        for step in &steps {
            for dep in &step.depends_on {
                if !ids.contains(dep) {
                    return Err(PlanError::UnknownDependency {
                        step: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; ready steps dispatch in original order.
        let index_of: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();
        let mut in_degree = vec![0usize; steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            for dep in &step.depends_on {
                let d = index_of[dep.as_str()];
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
        let mut ready: VecDeque<usize> = (0..steps.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut order = Vec::with_capacity(steps.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }
        if order.len() != steps.len() {
            let stuck: Vec<String> = steps
                .iter()
                .enumerate()
                .filter(|(i, _)| !order.contains(i))
                .map(|(_, s)| s.step_id.clone())
                .collect();
            return Err(PlanError::Cycle(stuck.join(", ")));
        }

        let mut by_index: Vec<Option<ToolStep>> = steps.into_iter().map(Some).collect();
        let ordered = order
            .into_iter()
            .filter_map(|i| by_index[i].take())
            .collect();
        Ok(ExecutionPlan { ordered })
    }

    /// Builds a sequential plan from a provider's native tool-call array.
    pub fn plan_from_tool_calls(calls: &[ParsedToolCall]) -> Vec<ToolStep> {
        calls
            .iter()
            .enumerate()
            .map(|(i, call)| ToolStep {
                step_id: format!("step{}", i + 1),
                tool_name: call.tool.clone(),
                params: call.params.clone(),
                depends_on: if i == 0 {
                    vec![]
                } else {
                    vec![format!("step{i}")]
                },
                on_failure: OnFailure::Abort,
            })
            .collect()
    }

    /// Executes the plan in order, substituting step references and honoring
    /// each step's failure policy. Also records a [`ToolCallRecord`] per
    /// executed step for the caller's bookkeeping.
    pub async fn run(&self, plan: &ExecutionPlan, ctx: &ToolContext) -> PlanOutcome {
        let mut results: HashMap<String, ToolResult> = HashMap::new();
        let mut outcomes = Vec::with_capacity(plan.ordered.len());
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut aborted = false;

        for step in &plan.ordered {
            if aborted {
                outcomes.push(StepOutcome {
                    step_id: step.step_id.clone(),
                    tool: step.tool_name.clone(),
                    result: None,
                    skipped: true,
                });
                continue;
            }

            let params = substitute(&step.params, &results);
            let mut result = self
                .executor
                .execute(&step.tool_name, params.clone(), ctx, &ExecuteOptions::default())
                .await;
            if !result.success && step.on_failure == OnFailure::Retry {
                tracing::info!(step = %step.step_id, tool = %step.tool_name, "retrying failed step");
                result = self
                    .executor
                    .execute(&step.tool_name, params.clone(), ctx, &ExecuteOptions::default())
                    .await;
            }

            records.push(ToolCallRecord {
                tool: step.tool_name.clone(),
                params,
                success: result.success,
                result: Some(result.clone()),
                timestamp: chrono::Utc::now(),
            });

            if !result.success && step.on_failure != OnFailure::Continue {
                aborted = true;
            }
            results.insert(step.step_id.clone(), result.clone());
            outcomes.push(StepOutcome {
                step_id: step.step_id.clone(),
                tool: step.tool_name.clone(),
                result: Some(result),
                skipped: false,
            });
        }

        PlanOutcome {
            steps: outcomes,
            records,
            aborted,
        }
    }
}

/// Recursively substitutes `${step.path}` references in string values.
///
/// A string that is exactly one reference resolving to a non-string value is
/// replaced by that value wholesale; embedded references stringify. A
/// reference to a missing or failed step keeps the literal marker.
fn substitute(params: &Value, results: &HashMap<String, ToolResult>) -> Value {
    match params {
        Value::String(s) => substitute_string(s, results),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, results)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, results)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(s: &str, results: &HashMap<String, ToolResult>) -> Value {
    // Whole-string reference: preserve the resolved value's JSON type.
    if let Some(caps) = STEP_REF.captures(s) {
        if caps.get(0).map(|m| m.as_str()) == Some(s) {
            if let Some(value) = resolve(&caps, results) {
                return value;
            }
            tracing::warn!(reference = s, "unresolved step reference kept verbatim");
            return Value::String(s.to_string());
        }
    }
    let replaced = STEP_REF.replace_all(s, |caps: &regex::Captures<'_>| {
        match resolve(caps, results) {
            Some(Value::String(text)) => text,
            Some(other) => other.to_string(),
            None => {
                tracing::warn!(reference = &caps[0], "unresolved step reference kept verbatim");
                caps[0].to_string()
            }
        }
    });
    Value::String(replaced.into_owned())
}

fn resolve(caps: &regex::Captures<'_>, results: &HashMap<String, ToolResult>) -> Option<Value> {
    let step_id = caps.get(1)?.as_str();
    let result = results.get(step_id).filter(|r| r.success)?;
    let mut current = &result.data;
    for segment in caps.get(2)?.as_str().split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => current.get(segment)?,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::breaker::CircuitBreaker;
    use crate::tools::{ToolError, ToolMetadata, ToolPlugin, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    fn step(id: &str, tool: &str, deps: &[&str]) -> ToolStep {
        ToolStep {
            step_id: id.into(),
            tool_name: tool.into(),
            params: json!({}),
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            on_failure: OnFailure::Abort,
        }
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let plan = ToolOrchestrator::build_plan(vec![
            step("c", "t", &["b"]),
            step("a", "t", &[]),
            step("b", "t", &["a"]),
        ])
        .unwrap();
        let ids: Vec<&str> = plan.steps().iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_fails_plan_construction() {
        let err = ToolOrchestrator::build_plan(vec![
            step("a", "t", &["b"]),
            step("b", "t", &["a"]),
        ])
        .unwrap_err();
        assert!(matches!(err, PlanError::Cycle(_)));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = ToolOrchestrator::build_plan(vec![step("a", "t", &["ghost"])]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { .. }));
    }

    #[test]
    fn duplicate_step_id_is_rejected() {
        let err =
            ToolOrchestrator::build_plan(vec![step("a", "t", &[]), step("a", "t", &[])])
                .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateStep(_)));
    }

    #[test]
    fn substitution_resolves_paths_and_keeps_unresolved_markers() {
        let mut results = HashMap::new();
        results.insert(
            "step1".to_string(),
            ToolResult::ok(json!({ "items": [{ "url": "https://a" }], "count": 2 })),
        );
        let params = json!({
            "url": "${step1.items.0.url}",
            "count": "${step1.count}",
            "text": "found ${step1.count} items",
            "missing": "${step9.value}",
        });
        let out = substitute(&params, &results);
        assert_eq!(out["url"], "https://a");
        assert_eq!(out["count"], 2);
        assert_eq!(out["text"], "found 2 items");
        assert_eq!(out["missing"], "${step9.value}");
    }

    #[test]
    fn failed_step_reference_stays_literal() {
        let mut results = HashMap::new();
        results.insert("step1".to_string(), ToolResult::fail("down"));
        let out = substitute(&json!({ "v": "${step1.x}" }), &results);
        assert_eq!(out["v"], "${step1.x}");
    }

    struct Scripted {
        name: &'static str,
        fail_first: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl ToolPlugin for Scripted {
        fn metadata(&self) -> ToolMetadata {
            ToolMetadata {
                name: self.name.into(),
                version: "1".into(),
                description: String::new(),
                enabled: true,
            }
        }
        fn schema(&self) -> Value {
            json!({ "type": "function", "function": { "name": self.name, "parameters": {} } })
        }
        async fn execute(&self, params: Value, _c: &ToolContext) -> Result<ToolResult, ToolError> {
            if self.fail_first.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Err(ToolError::Execution("first attempt fails".into()));
            }
            Ok(ToolResult::ok(json!({ "params": params, "tool": self.name })))
        }
    }

    async fn orchestrator(tools: Vec<Scripted>) -> ToolOrchestrator {
        let registry = Arc::new(ToolRegistry::new());
        for t in tools {
            registry.register(Arc::new(t)).await.unwrap();
        }
        ToolOrchestrator::new(Arc::new(ToolExecutor::new(
            registry,
            Arc::new(CircuitBreaker::new()),
        )))
    }

    #[tokio::test]
    async fn runs_steps_in_order_with_substitution() {
        let orch = orchestrator(vec![
            Scripted { name: "first", fail_first: false.into() },
            Scripted { name: "second", fail_first: false.into() },
        ])
        .await;
        let plan = ToolOrchestrator::build_plan(vec![
            ToolStep {
                step_id: "s1".into(),
                tool_name: "first".into(),
                params: json!({ "q": "hello" }),
                depends_on: vec![],
                on_failure: OnFailure::Abort,
            },
            ToolStep {
                step_id: "s2".into(),
                tool_name: "second".into(),
                params: json!({ "from": "${s1.params.q}" }),
                depends_on: vec!["s1".into()],
                on_failure: OnFailure::Abort,
            },
        ])
        .unwrap();
        let out = orch.run(&plan, &ToolContext::default()).await;
        assert!(out.success());
        let s2 = out.steps[1].result.as_ref().unwrap();
        assert_eq!(s2.data["params"]["from"], "hello");
    }

    #[tokio::test]
    async fn abort_skips_dependents_retry_recovers() {
        let orch = orchestrator(vec![
            Scripted { name: "flaky", fail_first: true.into() },
            Scripted { name: "tail", fail_first: false.into() },
        ])
        .await;

        // Retry policy: the flaky first attempt recovers on the second try.
        let plan = ToolOrchestrator::build_plan(vec![
            ToolStep {
                step_id: "s1".into(),
                tool_name: "flaky".into(),
                params: json!({}),
                depends_on: vec![],
                on_failure: OnFailure::Retry,
            },
            ToolStep {
                step_id: "s2".into(),
                tool_name: "tail".into(),
                params: json!({}),
                depends_on: vec!["s1".into()],
                on_failure: OnFailure::Abort,
            },
        ])
        .unwrap();
        let out = orch.run(&plan, &ToolContext::default()).await;
        assert!(out.success());
        assert!(!out.steps[1].skipped);
    }

    #[tokio::test]
    async fn plan_from_tool_calls_is_sequential() {
        let calls = vec![
            ParsedToolCall {
                tool: "a".into(),
                params: json!({}),
            },
            ParsedToolCall {
                tool: "b".into(),
                params: json!({}),
            },
        ];
        let steps = ToolOrchestrator::plan_from_tool_calls(&calls);
        assert_eq!(steps[0].depends_on, Vec::<String>::new());
        assert_eq!(steps[1].depends_on, vec!["step1".to_string()]);
    }
}
