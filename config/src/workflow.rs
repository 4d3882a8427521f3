//! Workflow definition schema (`workflow/v2.0`).
//!
//! A workflow is a step DAG: `needs:` edges, optional `condition`, `for_each`
//! iteration, `parallel` fan-out, and `consensus` voting. The engine consuming
//! these types lives in the core crate; this module only declares the shapes
//! and structural validation.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Schema tag accepted by [`WorkflowDefinition::validate`].
pub const WORKFLOW_SCHEMA_V2: &str = "workflow/v2.0";

/// A declarative multi-step workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub schema: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub execution: ExecutionDefaults,
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Structural validation: schema tag, non-empty steps, unique step names,
    /// `needs:` referencing declared steps, exactly one body per step.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema != WORKFLOW_SCHEMA_V2 {
            return Err(ConfigError::Invalid(format!(
                "unsupported workflow schema {:?} (expected {:?})",
                self.schema, WORKFLOW_SCHEMA_V2
            )));
        }
        if self.steps.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "workflow {:?} has no steps",
                self.name
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate step name {:?}",
                    step.name
                )));
            }
            step.validate()?;
        }
        for step in &self.steps {
            for need in &step.needs {
                if !seen.contains(need.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "step {:?} needs unknown step {:?}",
                        step.name, need
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Workflow-level execution defaults, overridable per step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionDefaults {
    /// Primary provider name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Ordered failover chain tried after `provider` (or from the start when
    /// `provider` is unset).
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// MCP server names whose tools are offered to the model.
    #[serde(default)]
    pub servers: Vec<String>,
    /// Agentic loop bound; defaults to 10 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

/// One step of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    /// Steps that must be succeeded or skipped before this one runs.
    #[serde(default)]
    pub needs: Vec<String>,

    // Exactly one body: run | consensus | parallel | template_ref.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<String>,

    /// Substituted expression resolving to an iterable; the body runs once per
    /// element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    /// Scoped variable name for `for_each` elements (defaults to `item`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_name: Option<String>,
    /// Boolean condition; falsy or unevaluable skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Output variable name (defaults to the step name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    // Per-step overrides of the execution defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handling: Option<ErrorHandling>,
}

impl StepDefinition {
    /// A step must carry exactly one body.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bodies = [
            self.run.is_some(),
            self.consensus.is_some(),
            self.parallel.is_some(),
            self.template_ref.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if bodies != 1 {
            return Err(ConfigError::Invalid(format!(
                "step {:?} must have exactly one of run/consensus/parallel/template_ref (found {})",
                self.name, bodies
            )));
        }
        if let Some(p) = &self.parallel {
            if p.steps.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "step {:?}: parallel block has no child steps",
                    self.name
                )));
            }
            for child in &p.steps {
                child.validate()?;
            }
        }
        if let Some(c) = &self.consensus {
            if c.executions.len() < 2 {
                return Err(ConfigError::Invalid(format!(
                    "step {:?}: consensus needs at least two executions",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Name under which this step's output is recorded.
    pub fn output_name(&self) -> &str {
        self.output.as_deref().unwrap_or(&self.name)
    }
}

/// On-failure policy for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorHandling {
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Output substituted for the step when `on_failure: continue` fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    #[default]
    Fail,
    Continue,
}

/// Fan the same prompt to several provider executions and vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSpec {
    pub prompt: String,
    pub executions: Vec<ConsensusExecution>,
    /// Voting rule: `"2/3"`, `"unanimous"`, or `"majority"`.
    pub require: String,
}

/// One leg of a consensus fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusExecution {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Concurrent child steps with bounded fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSpec {
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub aggregate: AggregateMode,
}

/// How parallel child outputs are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateMode {
    /// Array ordered by child declaration, not completion.
    #[default]
    Array,
    /// Shallow object merge; conflicts resolve last-writer-wins with a warning.
    Merge,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(yaml_steps: &str) -> Result<WorkflowDefinition, ConfigError> {
        let yaml = format!(
            "schema: workflow/v2.0\nname: t\nexecution: {{}}\nsteps:\n{}",
            yaml_steps
        );
        let wf: WorkflowDefinition = serde_yaml::from_str(&yaml).map_err(ConfigError::Parse)?;
        wf.validate().map(|_| wf)
    }

    #[test]
    fn rejects_wrong_schema() {
        let wf: WorkflowDefinition = serde_yaml::from_str(
            "schema: workflow/v1.0\nname: t\nexecution: {}\nsteps:\n  - name: a\n    run: x\n",
        )
        .unwrap();
        assert!(wf.validate().is_err());
    }

    #[test]
    fn rejects_unknown_needs() {
        let err = minimal("  - name: a\n    run: x\n    needs: [ghost]\n").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_step_with_two_bodies() {
        let err = minimal(
            "  - name: a\n    run: x\n    consensus:\n      prompt: p\n      require: majority\n      executions:\n        - provider: a\n        - provider: b\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let err = minimal("  - name: a\n    run: x\n  - name: a\n    run: y\n").unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn accepts_parallel_with_children() {
        let wf = minimal(
            "  - name: fan\n    parallel:\n      aggregate: merge\n      max_concurrent: 2\n      steps:\n        - name: a\n          run: x\n        - name: b\n          run: y\n",
        )
        .unwrap();
        let p = wf.steps[0].parallel.as_ref().unwrap();
        assert_eq!(p.aggregate, AggregateMode::Merge);
        assert_eq!(p.max_concurrent, Some(2));
    }

    #[test]
    fn output_name_defaults_to_step_name() {
        let wf = minimal("  - name: a\n    run: x\n  - name: b\n    run: y\n    output: result\n")
            .unwrap();
        assert_eq!(wf.steps[0].output_name(), "a");
        assert_eq!(wf.steps[1].output_name(), "result");
    }
}
