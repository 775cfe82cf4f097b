use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{validate_step_start_states, IntegrationInstance, StepStartStates};
use crate::execution::context::{
    DynSchemaValidator, ExecutionHistory, StepExecutionContext, StepJobState,
};
use crate::execution::step::{validate_step_dependency_graph, IntegrationStep, StepStatus};
use crate::logger::IntegrationLogger;
use crate::storage::GraphObjectStore;
use crate::sync::PartialDatasets;
use crate::{IntegrationError, Result};

/// Default dispatch width. One keeps execution deterministic; callers opt in
/// to more.
pub const DEFAULT_STEP_CONCURRENCY: usize = 1;

/// Terminal outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStepResult {
    pub id: String,
    pub name: String,
    pub types: Vec<String>,
    #[serde(rename = "partialTypes", skip_serializing_if = "Option::is_none")]
    pub partial_types: Option<Vec<String>>,
    pub status: StepStatus,
    #[serde(rename = "dependsOn")]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(rename = "partialDatasets")]
    pub partial_datasets: PartialDatasets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResults {
    #[serde(rename = "integrationStepResults")]
    pub integration_step_results: Vec<IntegrationStepResult>,
    pub metadata: ExecutionMetadata,
}

pub struct ExecuteStepsParams {
    pub steps: Vec<IntegrationStep>,
    pub start_states: StepStartStates,
    pub instance: Arc<IntegrationInstance>,
    pub store: Arc<GraphObjectStore>,
    pub logger: IntegrationLogger,
    pub execution_history: Arc<ExecutionHistory>,
    pub schema_validator: Option<DynSchemaValidator>,
    pub concurrency: usize,
}

/// Runs the step graph to completion.
///
/// The loop keeps a ready-set of `PENDING` steps whose dependencies are all
/// terminal: steps whose dependencies all succeeded are dispatched (bounded
/// by `concurrency`, ties broken by input order); steps with any failed,
/// partial, or disabled dependency become
/// `PARTIAL_SUCCESS_DUE_TO_DEPENDENCY_FAILURE` without executing. A step
/// failure never aborts the invocation; it is recorded and propagated.
pub async fn execute_steps(params: ExecuteStepsParams) -> Result<ExecutionResults> {
    let ExecuteStepsParams {
        steps,
        start_states,
        instance,
        store,
        logger,
        execution_history,
        schema_validator,
        concurrency,
    } = params;

    validate_step_dependency_graph(&steps)?;
    validate_step_start_states(&steps, &start_states)?;

    let mut statuses: HashMap<String, StepStatus> = steps
        .iter()
        .map(|step| {
            let disabled = start_states
                .get(&step.id)
                .map(|state| state.disabled)
                .unwrap_or(false);
            let status = if disabled {
                StepStatus::Disabled
            } else {
                StepStatus::Pending
            };
            (step.id.clone(), status)
        })
        .collect();

    let concurrency = concurrency.max(1);
    let mut running: FuturesUnordered<BoxFuture<'static, (String, Result<()>)>> =
        FuturesUnordered::new();
    let mut in_flight = 0usize;

    loop {
        propagate_dependency_failures(&steps, &mut statuses);

        for step in &steps {
            if in_flight >= concurrency {
                break;
            }
            if status_of(&statuses, &step.id) != StepStatus::Pending {
                continue;
            }
            let dispatchable = step
                .depends_on
                .iter()
                .all(|dep| status_of(&statuses, dep) == StepStatus::Success);
            if !dispatchable {
                continue;
            }

            statuses.insert(step.id.clone(), StepStatus::Running);
            in_flight += 1;
            running.push(run_step(
                step.clone(),
                instance.clone(),
                store.clone(),
                logger.clone(),
                execution_history.clone(),
                schema_validator.clone(),
            ));
        }

        if in_flight == 0 {
            break;
        }
        if let Some((step_id, result)) = running.next().await {
            in_flight -= 1;
            let status = match result {
                Ok(()) => StepStatus::Success,
                Err(_) => StepStatus::Failure,
            };
            statuses.insert(step_id, status);
        }
    }

    Ok(assemble_results(&steps, &statuses))
}

/// Marks pending steps with a non-`SUCCESS` terminal dependency as partial,
/// iterating to fixpoint so the mark cascades through dependency chains.
fn propagate_dependency_failures(
    steps: &[IntegrationStep],
    statuses: &mut HashMap<String, StepStatus>,
) {
    loop {
        let mut changed = false;
        for step in steps {
            if status_of(statuses, &step.id) != StepStatus::Pending {
                continue;
            }
            let dep_statuses: Vec<StepStatus> = step
                .depends_on
                .iter()
                .map(|dep| status_of(statuses, dep))
                .collect();
            let all_terminal = dep_statuses.iter().all(|status| status.is_terminal());
            let any_failed = dep_statuses
                .iter()
                .any(|status| *status != StepStatus::Success);
            if all_terminal && any_failed {
                statuses.insert(
                    step.id.clone(),
                    StepStatus::PartialSuccessDueToDependencyFailure,
                );
                changed = true;
            }
        }
        if !changed {
            return;
        }
    }
}

fn status_of(statuses: &HashMap<String, StepStatus>, id: &str) -> StepStatus {
    statuses.get(id).copied().unwrap_or(StepStatus::Pending)
}

fn run_step(
    step: IntegrationStep,
    instance: Arc<IntegrationInstance>,
    store: Arc<GraphObjectStore>,
    logger: IntegrationLogger,
    execution_history: Arc<ExecutionHistory>,
    schema_validator: Option<DynSchemaValidator>,
) -> BoxFuture<'static, (String, Result<()>)> {
    Box::pin(async move {
        let mut bindings = serde_json::Map::new();
        bindings.insert("step".to_string(), json!(step.id));
        let step_logger = logger.child(bindings);

        let context = StepExecutionContext {
            logger: step_logger.clone(),
            instance,
            job_state: Arc::new(StepJobState::new(
                step.id.clone(),
                store,
                schema_validator,
            )),
            execution_history,
        };

        step_logger.step_start(&step);
        // The handler runs in its own task so a panic is contained as a step
        // failure rather than tearing down the scheduler.
        let outcome = match tokio::spawn((step.execution_handler)(context)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(match err {
                wrapped @ IntegrationError::StepExecution { .. } => wrapped,
                other => IntegrationError::step_execution(step.id.clone(), other),
            }),
            Err(join_err) => Err(IntegrationError::step_execution(step.id.clone(), join_err)),
        };

        let result = match outcome {
            Ok(()) => {
                step_logger.step_success(&step);
                Ok(())
            }
            Err(err) => {
                step_logger.step_failure(&step, &err);
                Err(err)
            }
        };
        (step.id, result)
    })
}

fn assemble_results(
    steps: &[IntegrationStep],
    statuses: &HashMap<String, StepStatus>,
) -> ExecutionResults {
    let mut results = Vec::with_capacity(steps.len());
    let mut partial_types = Vec::new();
    let mut seen_types = HashSet::new();

    for step in steps {
        let status = status_of(statuses, &step.id);
        let incomplete = matches!(
            status,
            StepStatus::Failure
                | StepStatus::PartialSuccessDueToDependencyFailure
                | StepStatus::Disabled
        );
        if incomplete {
            for declared in &step.types {
                if seen_types.insert(declared.clone()) {
                    partial_types.push(declared.clone());
                }
            }
        }
        results.push(IntegrationStepResult {
            id: step.id.clone(),
            name: step.name.clone(),
            types: step.types.clone(),
            partial_types: incomplete.then(|| step.types.clone()),
            status,
            depends_on: step.depends_on.clone(),
        });
    }

    ExecutionResults {
        integration_step_results: results,
        metadata: ExecutionMetadata {
            partial_datasets: PartialDatasets {
                types: partial_types,
            },
        },
    }
}
