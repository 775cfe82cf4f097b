use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{
    default_step_start_states, validate_instance_config, validate_step_start_states,
    IntegrationInstance, IntegrationInvocationConfig, InvocationContext,
};
use crate::events::EventPublishingQueue;
use crate::execution::context::{
    BasicSchemaValidator, DynSchemaValidator, ExecutionHistory, InvocationSummary,
};
use crate::execution::scheduler::{
    execute_steps, ExecuteStepsParams, ExecutionResults, DEFAULT_STEP_CONCURRENCY,
};
use crate::execution::step::validate_step_dependency_graph;
use crate::logger::IntegrationLogger;
use crate::storage::{GraphObjectStore, DEFAULT_FLUSH_THRESHOLD};
use crate::sync::{
    upload_collected_data, DynSynchronizationApi, RetryConfig, SynchronizationJob, UploadConfig,
};
use crate::{IntegrationError, Result, UNEXPECTED_ERROR_REASON};

pub struct ExecuteIntegrationOptions {
    pub concurrency: usize,
    /// Cache directory for the invocation's graph store. Generated under the
    /// process temp root when not provided; never cleaned by the core.
    pub cache_directory: Option<PathBuf>,
    pub flush_threshold: usize,
    pub upload: UploadConfig,
    pub event_retry: RetryConfig,
    /// Validate every produced object with [`BasicSchemaValidator`].
    pub enable_schema_validation: bool,
    /// Overrides the built-in validator when set.
    pub schema_validator: Option<DynSchemaValidator>,
}

impl Default for ExecuteIntegrationOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_STEP_CONCURRENCY,
            cache_directory: None,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            upload: UploadConfig::default(),
            event_retry: RetryConfig::default(),
            enable_schema_validation: false,
            schema_validator: None,
        }
    }
}

/// Summary of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    #[serde(flatten)]
    pub results: ExecutionResults,
    #[serde(rename = "synchronizationJob")]
    pub synchronization_job: SynchronizationJob,
}

/// Runs one integration invocation end to end.
///
/// Configuration and start-state validation fail fast, before any remote
/// job exists. Step failures do not abort the invocation — they surface as
/// partial datasets at finalize time. Errors between invocation validation
/// and finalize abort the job, with the error's reason when the framework
/// understands the failure and [`UNEXPECTED_ERROR_REASON`] otherwise.
#[tracing::instrument(level = "debug", skip_all, fields(instance = %instance.id))]
pub async fn execute_integration(
    instance: IntegrationInstance,
    invocation_config: IntegrationInvocationConfig,
    api: DynSynchronizationApi,
    options: ExecuteIntegrationOptions,
) -> Result<ExecutionReport> {
    let mut instance = instance;
    instance.config = validate_instance_config(
        &invocation_config.instance_config_fields,
        &instance.config,
    )?;
    let instance = Arc::new(instance);

    let mut bindings = serde_json::Map::new();
    bindings.insert("integrationInstanceId".to_string(), json!(instance.id));
    let logger = IntegrationLogger::new().child(bindings);

    validate_step_dependency_graph(&invocation_config.integration_steps)?;
    let hook_context = InvocationContext {
        instance: instance.clone(),
        logger: logger.clone(),
    };
    let start_states = match &invocation_config.get_step_start_states {
        Some(hook) => hook(&hook_context),
        None => default_step_start_states(&invocation_config.integration_steps),
    };
    validate_step_start_states(&invocation_config.integration_steps, &start_states)?;

    let cache_directory = options
        .cache_directory
        .clone()
        .unwrap_or_else(generate_cache_directory);
    let store = Arc::new(GraphObjectStore::with_flush_threshold(
        &cache_directory,
        options.flush_threshold,
    ));
    logger.info(&format!(
        "Collecting into cache directory {}",
        cache_directory.display()
    ));

    let job = api.initiate_job(&instance.id).await?;
    let queue = EventPublishingQueue::start(api.clone(), job.id.clone(), options.event_retry.clone());
    logger.set_event_sink(queue.clone());

    let schema_validator: Option<DynSchemaValidator> = match options.schema_validator.clone() {
        Some(validator) => Some(validator),
        None if options.enable_schema_validation => Some(Arc::new(BasicSchemaValidator)),
        None => None,
    };

    let execution_history = Arc::new(ExecutionHistory {
        current: InvocationSummary {
            instance_id: instance.id.clone(),
            started_on: Utc::now(),
        },
    });

    let params = ExecuteStepsParams {
        steps: invocation_config.integration_steps.clone(),
        start_states,
        instance: instance.clone(),
        store: store.clone(),
        logger: logger.clone(),
        execution_history,
        schema_validator,
        concurrency: options.concurrency,
    };

    // Steps 5–8 of the invocation sequence; any error here aborts the job.
    let collection: Result<ExecutionResults> = async {
        if let Some(validate) = &invocation_config.validate_invocation {
            validate(hook_context).await?;
        }
        let results = execute_steps(params).await?;
        store.flush().await?;
        queue.on_idle().await;
        upload_collected_data(store.clone(), api.clone(), &job, &logger, &options.upload).await?;
        Ok(results)
    }
    .await;

    // A failed finalize is a synchronization error like any other and takes
    // the same abort path, so every exit stops the event queue.
    let failure = match collection {
        Ok(results) => {
            match api
                .finalize_job(&job.id, &results.metadata.partial_datasets)
                .await
            {
                Ok(finalized) => {
                    queue.close().await;
                    return Ok(ExecutionReport {
                        results,
                        synchronization_job: finalized,
                    });
                }
                Err(err) => err,
            }
        }
        Err(err) => err,
    };

    match &failure {
        IntegrationError::Validation { .. }
        | IntegrationError::ProviderAuthentication { .. }
        | IntegrationError::ProviderAuthorization { .. } => {
            logger.validation_failure(&failure);
        }
        other => logger.error(&other.to_string()),
    }
    let reason = if logger.is_handled_error(&failure) {
        failure.to_string()
    } else {
        UNEXPECTED_ERROR_REASON.to_string()
    };
    queue.on_idle().await;
    if let Err(abort_err) = api.abort_job(&job.id, &reason).await {
        tracing::warn!(error = %abort_err, "failed aborting synchronization job");
    }
    queue.close().await;
    Err(failure)
}

fn generate_cache_directory() -> PathBuf {
    std::env::temp_dir()
        .join(".lattice")
        .join("cache")
        .join(uuid::Uuid::new_v4().to_string())
}
