use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::execution::context::StepExecutionContext;
use crate::{IntegrationError, Result};

/// User-supplied collection logic for one step.
pub type StepExecutionHandler =
    Arc<dyn Fn(StepExecutionContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Immutable descriptor of one data-collection step.
#[derive(Clone)]
pub struct IntegrationStep {
    pub id: String,
    pub name: String,
    /// Graph object types this step declares it produces.
    pub types: Vec<String>,
    pub depends_on: Vec<String>,
    pub execution_handler: StepExecutionHandler,
}

impl IntegrationStep {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        types: Vec<String>,
        depends_on: Vec<String>,
        execution_handler: StepExecutionHandler,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            types,
            depends_on,
            execution_handler,
        }
    }
}

impl std::fmt::Debug for IntegrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationStep")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("types", &self.types)
            .field("depends_on", &self.depends_on)
            .finish_non_exhaustive()
    }
}

/// Terminal and transient per-step states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failure,
    PartialSuccessDueToDependencyFailure,
    Disabled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::PartialSuccessDueToDependencyFailure | Self::Disabled
        )
    }
}

/// The step graph must be a DAG over declared ids; anything else is a
/// configuration-time failure before any dispatch.
pub fn validate_step_dependency_graph(steps: &[IntegrationStep]) -> Result<()> {
    let mut declared = HashSet::new();
    for step in steps {
        if !declared.insert(step.id.as_str()) {
            return Err(IntegrationError::config_validation(format!(
                "duplicate step id \"{}\"",
                step.id
            )));
        }
    }

    for step in steps {
        for dependency in &step.depends_on {
            if !declared.contains(dependency.as_str()) {
                return Err(IntegrationError::config_validation(format!(
                    "step \"{}\" depends on unknown step \"{dependency}\"",
                    step.id
                )));
            }
        }
    }

    // Kahn's peel: if the queue drains before every node is seen, a cycle
    // remains.
    let mut in_degree: HashMap<&str, usize> =
        steps.iter().map(|step| (step.id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dependency in &step.depends_on {
            if let Some(degree) = in_degree.get_mut(step.id.as_str()) {
                *degree += 1;
            }
            dependents
                .entry(dependency.as_str())
                .or_default()
                .push(step.id.as_str());
        }
    }

    let mut ready: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut seen = 0usize;
    while let Some(id) = ready.pop_front() {
        seen += 1;
        for dependent in dependents.get(id).into_iter().flatten().copied() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }

    if seen != steps.len() {
        return Err(IntegrationError::config_validation(
            "step dependency graph contains a cycle",
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn noop_step(id: &str, depends_on: &[&str]) -> IntegrationStep {
        IntegrationStep::new(
            id,
            format!("Step {id}"),
            Vec::new(),
            depends_on.iter().map(|d| d.to_string()).collect(),
            Arc::new(|_ctx| Box::pin(std::future::ready(Ok(())))),
        )
    }

    #[test]
    fn accepts_a_diamond() {
        let steps = vec![
            noop_step("a", &[]),
            noop_step("b", &["a"]),
            noop_step("c", &["a"]),
            noop_step("d", &["b", "c"]),
        ];
        assert!(validate_step_dependency_graph(&steps).is_ok());
    }

    #[test]
    fn rejects_cycles() {
        let steps = vec![
            noop_step("a", &["c"]),
            noop_step("b", &["a"]),
            noop_step("c", &["b"]),
        ];
        let err = validate_step_dependency_graph(&steps).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn rejects_unknown_dependencies_and_duplicate_ids() {
        let steps = vec![noop_step("a", &["ghost"])];
        let err = validate_step_dependency_graph(&steps).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let steps = vec![noop_step("a", &[]), noop_step("a", &[])];
        let err = validate_step_dependency_graph(&steps).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn status_wire_format_matches_the_protocol() {
        let status =
            serde_json::to_value(StepStatus::PartialSuccessDueToDependencyFailure).unwrap();
        assert_eq!(
            status,
            serde_json::json!("PARTIAL_SUCCESS_DUE_TO_DEPENDENCY_FAILURE")
        );
        assert!(StepStatus::Disabled.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }
}
