//! Workflow execution: step DAG scheduling, retries, failover, fan-out.
//!
//! Steps run sequentially in topological order (independent steps could run
//! concurrently without changing observable results; sequential keeps the
//! results deterministic). `parallel` blocks and `consensus` fan-outs are the
//! concurrent surfaces. Step retries only activate on retryable error codes;
//! the provider failover chain moves on after the primary's retry budget is
//! spent.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use config::{
    AggregateMode, ConsensusSpec, ExecutionDefaults, OnFailure, ParallelSpec, StepDefinition,
    WorkflowDefinition,
};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::condition::evaluate_condition;
use super::consensus::{self, ProviderAnswer};
use super::substitution::{substitute, SubstitutionEnv};
use crate::agent::{run_agentic_loop, AgenticRun, ToolRouter, DEFAULT_MAX_ITERATIONS};
use crate::error::{ErrorCode, WeftError};
use crate::message::Message;
use crate::output::OutputWriter;
use crate::provider::{CompletionRequest, LlmProvider};

/// Step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// Runtime record for one executed step.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    pub retries: u32,
}

/// Result of one workflow execution.
#[derive(Debug)]
pub struct WorkflowOutcome {
    /// Per-step records, keyed by step name.
    pub records: BTreeMap<String, StepRecord>,
    /// The substitution environment's final outputs, keyed by output name.
    pub outputs: BTreeMap<String, Value>,
    /// The last declared step's output.
    pub final_output: Value,
}

/// What one step body produced.
struct StepExec {
    output: Value,
    provider_used: Option<String>,
    iterations: Option<u32>,
    retries: u32,
}

/// Executes workflow definitions against a provider map and tool router.
pub struct WorkflowEngine {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    router: Arc<dyn ToolRouter>,
    templates: BTreeMap<String, WorkflowDefinition>,
    output: OutputWriter,
}

impl WorkflowEngine {
    pub fn new(
        providers: HashMap<String, Arc<dyn LlmProvider>>,
        router: Arc<dyn ToolRouter>,
        output: OutputWriter,
    ) -> Self {
        Self {
            providers,
            router,
            templates: BTreeMap::new(),
            output,
        }
    }

    /// Registers named sub-workflows referenced by `template_ref` steps.
    pub fn with_templates(mut self, templates: BTreeMap<String, WorkflowDefinition>) -> Self {
        self.templates = templates;
        self
    }

    /// Runs a workflow to completion.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        input_data: Value,
    ) -> Result<WorkflowOutcome, WeftError> {
        workflow.validate()?;
        // Cycles fail before any step runs.
        let order = topological_order(&workflow.steps)?;

        let mut env = SubstitutionEnv::new(input_data);
        let mut records: BTreeMap<String, StepRecord> = BTreeMap::new();

        for idx in order {
            let step = &workflow.steps[idx];
            self.output.progress(&format!("step {}", step.name));

            if let Some(condition) = &step.condition {
                let text = substitute(condition, &env);
                let truthy = match evaluate_condition(&text) {
                    Ok(value) => value,
                    Err(e) => {
                        // Fail closed: an unevaluable condition skips the step.
                        warn!(step = %step.name, error = %e, "condition unevaluable; skipping");
                        false
                    }
                };
                if !truthy {
                    debug!(step = %step.name, "condition falsy; skipped");
                    env.insert(step.output_name(), Value::String(String::new()));
                    records.insert(
                        step.name.clone(),
                        StepRecord {
                            status: StepStatus::Skipped,
                            output: Value::String(String::new()),
                            error: None,
                            duration_ms: 0,
                            provider_used: None,
                            iterations: None,
                            retries: 0,
                        },
                    );
                    continue;
                }
            }

            let started = Instant::now();
            let result = self.execute_step(step, &workflow.execution, &env).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(exec) => {
                    env.insert(step.output_name(), exec.output.clone());
                    records.insert(
                        step.name.clone(),
                        StepRecord {
                            status: StepStatus::Succeeded,
                            output: exec.output,
                            error: None,
                            duration_ms,
                            provider_used: exec.provider_used,
                            iterations: exec.iterations,
                            retries: exec.retries,
                        },
                    );
                }
                Err(e) => {
                    let handling = step.error_handling.clone().unwrap_or_default();
                    match handling.on_failure {
                        OnFailure::Continue => {
                            // The step counts as completed with its default
                            // output; downstream steps branch on it.
                            let fallback =
                                Value::String(handling.default_output.unwrap_or_default());
                            warn!(step = %step.name, error = %e, "continuing with default output");
                            env.insert(step.output_name(), fallback.clone());
                            records.insert(
                                step.name.clone(),
                                StepRecord {
                                    status: StepStatus::Succeeded,
                                    output: fallback,
                                    error: Some(e.to_string()),
                                    duration_ms,
                                    provider_used: None,
                                    iterations: None,
                                    retries: 0,
                                },
                            );
                        }
                        OnFailure::Fail => {
                            records.insert(
                                step.name.clone(),
                                StepRecord {
                                    status: StepStatus::Failed,
                                    output: Value::Null,
                                    error: Some(e.to_string()),
                                    duration_ms,
                                    provider_used: None,
                                    iterations: None,
                                    retries: 0,
                                },
                            );
                            return Err(e.with_context("step", step.name.clone()));
                        }
                    }
                }
            }
        }

        let final_output = workflow
            .steps
            .last()
            .and_then(|step| records.get(&step.name))
            .map(|record| record.output.clone())
            .unwrap_or(Value::Null);

        Ok(WorkflowOutcome {
            records,
            outputs: env.outputs().clone(),
            final_output,
        })
    }

    /// Executes one step, handling `for_each` and the per-step timeout.
    async fn execute_step(
        &self,
        step: &StepDefinition,
        defaults: &ExecutionDefaults,
        env: &SubstitutionEnv,
    ) -> Result<StepExec, WeftError> {
        let work = async {
            if let Some(expr) = &step.for_each {
                self.execute_for_each(step, defaults, env, expr).await
            } else {
                self.execute_body(step, defaults, env).await
            }
        };
        match step.timeout_seconds {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), work)
                .await
                .map_err(|_| {
                    WeftError::new(
                        ErrorCode::ProviderTimeout,
                        format!("step {:?} exceeded {secs}s timeout", step.name),
                    )
                })?,
            None => work.await,
        }
    }

    async fn execute_for_each(
        &self,
        step: &StepDefinition,
        defaults: &ExecutionDefaults,
        env: &SubstitutionEnv,
        expr: &str,
    ) -> Result<StepExec, WeftError> {
        let items = resolve_iterable(expr, env)?;
        let item_name = step.item_name.as_deref().unwrap_or("item");

        let mut outputs = Vec::with_capacity(items.len());
        let mut provider_used = None;
        let mut retries = 0;
        for item in items {
            let mut scoped = env.clone();
            scoped.insert(item_name, item);
            let exec = self.execute_body(step, defaults, &scoped).await?;
            outputs.push(exec.output);
            provider_used = exec.provider_used.or(provider_used);
            retries += exec.retries;
        }
        Ok(StepExec {
            output: Value::Array(outputs),
            provider_used,
            iterations: None,
            retries,
        })
    }

    /// Dispatches on the step body. Boxed so `parallel` children can recurse.
    fn execute_body<'a>(
        &'a self,
        step: &'a StepDefinition,
        defaults: &'a ExecutionDefaults,
        env: &'a SubstitutionEnv,
    ) -> Pin<Box<dyn Future<Output = Result<StepExec, WeftError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(prompt) = &step.run {
                return self.execute_run(step, defaults, env, prompt).await;
            }
            if let Some(spec) = &step.consensus {
                return self.execute_consensus(step, defaults, env, spec).await;
            }
            if let Some(spec) = &step.parallel {
                return self.execute_parallel(step, defaults, env, spec).await;
            }
            if let Some(name) = &step.template_ref {
                return self.execute_template(name, env).await;
            }
            Err(WeftError::new(
                ErrorCode::ConfigInvalid,
                format!("step {:?} has no body", step.name),
            ))
        })
    }

    /// `run:` body — the agentic path with retries and provider failover.
    async fn execute_run(
        &self,
        step: &StepDefinition,
        defaults: &ExecutionDefaults,
        env: &SubstitutionEnv,
        prompt: &str,
    ) -> Result<StepExec, WeftError> {
        let prompt = substitute(prompt, env);
        let chain = provider_chain(step, defaults);
        if chain.is_empty() {
            return Err(WeftError::new(
                ErrorCode::ProviderNotFound,
                format!("step {:?} has no provider configured", step.name),
            ));
        }
        let max_retries = step.max_retries.unwrap_or(0);
        let max_iterations = defaults.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);

        let mut total_retries = 0u32;
        let mut last_error: Option<WeftError> = None;

        for (tier, provider_name) in chain.iter().enumerate() {
            let provider = self.providers.get(provider_name).ok_or_else(|| {
                WeftError::new(
                    ErrorCode::ProviderNotFound,
                    format!("provider {provider_name:?} is not configured"),
                )
            })?;
            // The primary provider gets the retry budget; fallbacks get one
            // attempt each (failover is already the retry).
            let budget = if tier == 0 { max_retries } else { 0 };

            for attempt in 0..=budget {
                let run = AgenticRun {
                    provider: provider.as_ref(),
                    router: self.router.as_ref(),
                    system_prompt: None,
                    model: step.model.clone().or_else(|| defaults.model.clone()),
                    temperature: step.temperature.or(defaults.temperature),
                    max_iterations,
                    output: &self.output,
                };
                match run_agentic_loop(run, vec![Message::user(prompt.clone())]).await {
                    Ok(outcome) => {
                        return Ok(StepExec {
                            output: Value::String(outcome.content),
                            provider_used: Some(provider_name.clone()),
                            iterations: Some(outcome.iterations),
                            retries: total_retries,
                        });
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            step = %step.name, provider = %provider_name, attempt,
                            error = %e, "retryable failure"
                        );
                        if attempt < budget {
                            total_retries += 1;
                        }
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.output
                .progress(&format!("provider {provider_name} unavailable, failing over"));
        }

        Err(last_error.unwrap_or_else(|| {
            WeftError::new(ErrorCode::ProviderApiError, "all providers failed")
        }))
    }

    /// `consensus:` body — fan the prompt out and vote.
    async fn execute_consensus(
        &self,
        step: &StepDefinition,
        defaults: &ExecutionDefaults,
        env: &SubstitutionEnv,
        spec: &ConsensusSpec,
    ) -> Result<StepExec, WeftError> {
        let prompt = substitute(&spec.prompt, env);

        let legs = spec.executions.iter().map(|execution| {
            let prompt = prompt.clone();
            async move {
                let Some(provider) = self.providers.get(&execution.provider) else {
                    return ProviderAnswer {
                        provider: execution.provider.clone(),
                        answer: None,
                        error: Some("provider not configured".to_string()),
                    };
                };
                let request = CompletionRequest {
                    messages: vec![Message::user(prompt)],
                    model: execution.model.clone().or_else(|| defaults.model.clone()),
                    temperature: execution.temperature.or(defaults.temperature),
                    ..Default::default()
                };
                match provider.create_completion(&request).await {
                    Ok(response) => ProviderAnswer {
                        provider: execution.provider.clone(),
                        answer: Some(response.content),
                        error: None,
                    },
                    Err(e) => ProviderAnswer {
                        provider: execution.provider.clone(),
                        answer: None,
                        error: Some(e.to_string()),
                    },
                }
            }
        });
        let answers = futures::future::join_all(legs).await;

        let outcome = consensus::evaluate(&spec.require, answers)?;
        debug!(step = %step.name, agreement = ?outcome.agreement, "consensus evaluated");
        Ok(StepExec {
            output: outcome.to_value(),
            provider_used: None,
            iterations: None,
            retries: 0,
        })
    }

    /// `parallel:` body — concurrent children under a semaphore.
    async fn execute_parallel(
        &self,
        step: &StepDefinition,
        defaults: &ExecutionDefaults,
        env: &SubstitutionEnv,
        spec: &ParallelSpec,
    ) -> Result<StepExec, WeftError> {
        let limit = spec.max_concurrent.unwrap_or(spec.steps.len()).max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let children = spec.steps.iter().map(|child| {
            let semaphore = Arc::clone(&semaphore);
            async move {
                let permit = semaphore.acquire().await.map_err(|_| {
                    WeftError::new(ErrorCode::Internal, "parallel semaphore closed")
                });
                let result = match permit {
                    Ok(_permit) => {
                        // Children see the parent environment snapshot, not
                        // each other.
                        if let Some(expr) = &child.for_each {
                            self.execute_for_each(child, defaults, env, expr).await
                        } else {
                            self.execute_body(child, defaults, env).await
                        }
                    }
                    Err(e) => Err(e),
                };
                (child, result)
            }
        });
        let results = futures::future::join_all(children).await;

        let mut retries = 0;
        let mut outputs: Vec<(&StepDefinition, Value)> = Vec::with_capacity(results.len());
        for (child, result) in results {
            match result {
                Ok(exec) => {
                    retries += exec.retries;
                    outputs.push((child, exec.output));
                }
                Err(e) => {
                    let handling = child.error_handling.clone().unwrap_or_default();
                    if handling.on_failure == OnFailure::Continue {
                        warn!(child = %child.name, error = %e, "parallel child continuing with default");
                        outputs.push((
                            child,
                            Value::String(handling.default_output.unwrap_or_default()),
                        ));
                    } else {
                        return Err(e.with_context("parallel_child", child.name.clone()));
                    }
                }
            }
        }

        let output = match spec.aggregate {
            // Ordered by child declaration, not completion.
            AggregateMode::Array => {
                Value::Array(outputs.into_iter().map(|(_, value)| value).collect())
            }
            AggregateMode::Merge => {
                let mut merged = serde_json::Map::new();
                for (child, value) in outputs {
                    match value {
                        Value::Object(map) => {
                            for (key, value) in map {
                                if merged.insert(key.clone(), value).is_some() {
                                    warn!(%key, "parallel merge conflict; last writer wins");
                                }
                            }
                        }
                        other => {
                            let key = child.output_name().to_string();
                            if merged.insert(key.clone(), other).is_some() {
                                warn!(%key, "parallel merge conflict; last writer wins");
                            }
                        }
                    }
                }
                Value::Object(merged)
            }
        };

        Ok(StepExec {
            output,
            provider_used: None,
            iterations: None,
            retries,
        })
    }

    /// `template_ref:` body — run a registered sub-workflow.
    async fn execute_template(
        &self,
        name: &str,
        env: &SubstitutionEnv,
    ) -> Result<StepExec, WeftError> {
        let template = self.templates.get(name).ok_or_else(|| {
            WeftError::new(
                ErrorCode::ConfigInvalid,
                format!("template {name:?} is not registered"),
            )
        })?;
        let input = json!({
            "input_data": env.input_data().clone(),
            "outputs": env.outputs().clone(),
        });
        let outcome = Box::pin(self.execute(template, input)).await?;
        Ok(StepExec {
            output: outcome.final_output,
            provider_used: None,
            iterations: None,
            retries: 0,
        })
    }
}

/// The ordered provider chain for a step: per-step override first, then the
/// workflow default, then the failover list, deduplicated.
fn provider_chain(step: &StepDefinition, defaults: &ExecutionDefaults) -> Vec<String> {
    let mut chain = Vec::new();
    if let Some(p) = &step.provider {
        chain.push(p.clone());
    } else if let Some(p) = &defaults.provider {
        chain.push(p.clone());
    }
    for p in &defaults.providers {
        if !chain.contains(p) {
            chain.push(p.clone());
        }
    }
    chain
}

/// Kahn's algorithm, deterministic: among eligible steps the earliest
/// declared runs first. A leftover step means a `needs:` cycle.
fn topological_order(steps: &[StepDefinition]) -> Result<Vec<usize>, WeftError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    let mut indegree: Vec<usize> = steps.iter().map(|s| s.needs.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step) in steps.iter().enumerate() {
        for need in &step.needs {
            let dep = index[need.as_str()];
            dependents[dep].push(i);
        }
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut done = vec![false; steps.len()];
    loop {
        let Some(next) = (0..steps.len()).find(|&i| !done[i] && indegree[i] == 0) else {
            break;
        };
        done[next] = true;
        order.push(next);
        for &dependent in &dependents[next] {
            indegree[dependent] -= 1;
        }
    }

    if order.len() != steps.len() {
        let stuck: Vec<&str> = steps
            .iter()
            .enumerate()
            .filter(|(i, _)| !done[*i])
            .map(|(_, s)| s.name.as_str())
            .collect();
        return Err(WeftError::new(
            ErrorCode::ConfigInvalid,
            format!("workflow has a dependency cycle involving {stuck:?}"),
        ));
    }
    Ok(order)
}

/// Resolves a `for_each` expression to its elements. A single `{{token}}`
/// resolves structurally (arrays stay arrays); anything else is substituted
/// and parsed as JSON. Maps of arrays iterate in key order.
fn resolve_iterable(expr: &str, env: &SubstitutionEnv) -> Result<Vec<Value>, WeftError> {
    let trimmed = expr.trim();
    let value = if trimmed.starts_with("{{") && trimmed.ends_with("}}") && !trimmed[2..].contains("{{")
    {
        let token = trimmed[2..trimmed.len() - 2].trim();
        env.resolve(token).unwrap_or(Value::Null)
    } else {
        let text = substitute(trimmed, env);
        serde_json::from_str(&text).unwrap_or(Value::Null)
    };

    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => {
            let mut items = Vec::new();
            for (key, value) in map {
                match value {
                    Value::Array(mut inner) => items.append(&mut inner),
                    _ => {
                        return Err(WeftError::new(
                            ErrorCode::ConfigInvalid,
                            format!("for_each map value {key:?} is not an array"),
                        ))
                    }
                }
            }
            Ok(items)
        }
        _ => Err(WeftError::new(
            ErrorCode::ConfigInvalid,
            format!("for_each expression {expr:?} did not resolve to an iterable"),
        )),
    }
}
