use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::{names, EventPublishingQueue, IntegrationEvent};
use crate::execution::step::IntegrationStep;
use crate::sync::SynchronizationJob;
use crate::IntegrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricUnit {
    Milliseconds,
}

/// One published operational metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(rename = "metricName")]
    pub metric_name: String,
    pub unit: MetricUnit,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Input to [`IntegrationLogger::publish_error_event`].
pub struct ErrorEventInput<'a> {
    pub name: String,
    pub message: String,
    pub err: &'a IntegrationError,
    pub event_data: Option<Map<String, Value>>,
    pub log_data: Option<Map<String, Value>>,
}

struct LoggerShared {
    event_sink: RwLock<Option<Arc<EventPublishingQueue>>>,
    metrics: Mutex<Vec<Metric>>,
}

/// Per-invocation structured logger.
///
/// Constructed by the orchestrator and threaded through every step context;
/// `child` returns a logger with merged bindings sharing the same event sink.
/// Lifecycle methods emit [`IntegrationEvent`]s into the synchronization
/// event queue once a sink is installed; local logging always happens.
#[derive(Clone)]
pub struct IntegrationLogger {
    shared: Arc<LoggerShared>,
    bindings: Map<String, Value>,
}

impl Default for IntegrationLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl IntegrationLogger {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LoggerShared {
                event_sink: RwLock::new(None),
                metrics: Mutex::new(Vec::new()),
            }),
            bindings: Map::new(),
        }
    }

    /// New logger with `bindings` merged over this logger's, sharing the
    /// event sink and metric store.
    pub fn child(&self, bindings: Map<String, Value>) -> Self {
        let mut merged = self.bindings.clone();
        for (key, value) in bindings {
            merged.insert(key, value);
        }
        Self {
            shared: self.shared.clone(),
            bindings: merged,
        }
    }

    pub fn bindings(&self) -> &Map<String, Value> {
        &self.bindings
    }

    /// Installs the remote event sink. Children created before or after see
    /// the same sink.
    pub fn set_event_sink(&self, queue: Arc<EventPublishingQueue>) {
        if let Ok(mut sink) = self.shared.event_sink.write() {
            *sink = Some(queue);
        }
    }

    fn context(&self) -> String {
        if self.bindings.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&self.bindings).unwrap_or_default()
        }
    }

    pub fn trace(&self, message: &str) {
        tracing::trace!(context = %self.context(), "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(context = %self.context(), "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(context = %self.context(), "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(context = %self.context(), "{message}");
    }

    /// Publishes a (possibly user-named) event to the synchronization job.
    pub fn publish_event(&self, event: IntegrationEvent) {
        tracing::info!(event = %event.name, context = %self.context(), "{}", event.description);
        if let Ok(sink) = self.shared.event_sink.read() {
            if let Some(queue) = sink.as_ref() {
                queue.enqueue(event);
            }
        }
    }

    /// Publishes an error event with a correlated `errorId`, returning the id.
    pub fn publish_error_event(&self, input: ErrorEventInput<'_>) -> String {
        let extras: Vec<(String, String)> = input
            .event_data
            .iter()
            .flatten()
            .map(|(key, value)| (key.clone(), display_value(value)))
            .collect();
        let (description, error_id) = input.err.event_description_with(&input.message, &extras);
        let log_data = input
            .log_data
            .map(|data| serde_json::to_string(&data).unwrap_or_default())
            .unwrap_or_default();
        tracing::error!(
            error_id = %error_id,
            context = %self.context(),
            log_data = %log_data,
            "{description}"
        );
        if let Ok(sink) = self.shared.event_sink.read() {
            if let Some(queue) = sink.as_ref() {
                queue.enqueue(IntegrationEvent::new(input.name, description));
            }
        }
        error_id
    }

    pub fn publish_metric(&self, metric: Metric) {
        tracing::info!(
            metric = %metric.metric_name,
            value = metric.value,
            context = %self.context(),
            "published metric"
        );
        if let Ok(mut metrics) = self.shared.metrics.lock() {
            metrics.push(metric);
        }
    }

    /// Metrics published so far. Primarily for tests and diagnostics.
    pub fn published_metrics(&self) -> Vec<Metric> {
        self.shared
            .metrics
            .lock()
            .map(|metrics| metrics.clone())
            .unwrap_or_default()
    }

    /// Runs `operation`, publishing a duration metric whether it resolved or
    /// erred, and returns its output untouched.
    pub async fn time_operation<T, F>(&self, metric_name: &str, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let started = Instant::now();
        let result = operation.await;
        self.publish_metric(Metric {
            metric_name: metric_name.to_string(),
            unit: MetricUnit::Milliseconds,
            value: started.elapsed().as_millis() as f64,
            timestamp: Utc::now(),
        });
        result
    }

    pub fn step_start(&self, step: &IntegrationStep) {
        self.publish_event(IntegrationEvent::new(
            names::STEP_START,
            format!("Step \"{}\" started", step.name),
        ));
    }

    pub fn step_success(&self, step: &IntegrationStep) {
        self.publish_event(IntegrationEvent::new(
            names::STEP_END,
            format!("Step \"{}\" completed successfully", step.name),
        ));
    }

    pub fn step_failure(&self, step: &IntegrationStep, err: &IntegrationError) {
        let (description, error_id) = err.event_description(&format!(
            "Step \"{}\" failed to complete due to error",
            step.name
        ));
        tracing::error!(error_id = %error_id, step = %step.id, "{description}");
        if let Ok(sink) = self.shared.event_sink.read() {
            if let Some(queue) = sink.as_ref() {
                queue.enqueue(IntegrationEvent::new(names::STEP_FAILURE, description));
            }
        }
    }

    pub fn validation_failure(&self, err: &IntegrationError) {
        let (description, error_id) =
            err.event_description("Error occurred while validating integration configuration");
        tracing::error!(error_id = %error_id, "{description}");
        if let Ok(sink) = self.shared.event_sink.read() {
            if let Some(queue) = sink.as_ref() {
                queue.enqueue(IntegrationEvent::new(names::VALIDATION_FAILURE, description));
            }
        }
    }

    pub fn synchronization_upload_start(&self, job: &SynchronizationJob) {
        self.publish_event(IntegrationEvent::new(
            names::SYNC_UPLOAD_START,
            format!("Uploading collected data for synchronization job {}", job.id),
        ));
    }

    pub fn synchronization_upload_end(&self, job: &SynchronizationJob) {
        self.publish_event(IntegrationEvent::new(
            names::SYNC_UPLOAD_END,
            format!("Finished uploading collected data for synchronization job {}", job.id),
        ));
    }

    pub fn is_handled_error(&self, err: &IntegrationError) -> bool {
        err.is_handled()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{MemorySynchronizationApi, RetryConfig, SynchronizationApi};
    use serde_json::json;

    #[test]
    fn child_merges_bindings_over_the_parent() {
        let logger = IntegrationLogger::new();
        let mut first = Map::new();
        first.insert("integrationInstanceId".to_string(), json!("i-1"));
        let parent = logger.child(first);

        let mut second = Map::new();
        second.insert("step".to_string(), json!("fetch-users"));
        let child = parent.child(second);

        assert_eq!(child.bindings().get("integrationInstanceId"), Some(&json!("i-1")));
        assert_eq!(child.bindings().get("step"), Some(&json!("fetch-users")));
        assert_eq!(parent.bindings().get("step"), None);
    }

    #[test]
    fn publishing_without_a_sink_only_logs() {
        let logger = IntegrationLogger::new();
        logger.publish_event(IntegrationEvent::new("custom", "no sink yet"));
    }

    #[tokio::test]
    async fn lifecycle_events_flow_through_the_sink() {
        let api = Arc::new(MemorySynchronizationApi::new());
        let job = api.initiate_job("i-1").await.unwrap();
        let queue = EventPublishingQueue::start(api.clone(), job.id.clone(), RetryConfig::default());

        let logger = IntegrationLogger::new();
        logger.set_event_sink(queue.clone());
        // A child created before the sink was installed shares it too.
        let child = logger.child(Map::new());

        child.publish_event(IntegrationEvent::new("custom_event", "hello"));
        logger.synchronization_upload_start(&job);
        queue.on_idle().await;

        let events = api.events(&job.id).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name, "custom_event");
        assert_eq!(events[1].name, "sync_upload_start");
        queue.close().await;
    }

    #[tokio::test]
    async fn error_events_carry_code_error_id_and_extras() {
        let api = Arc::new(MemorySynchronizationApi::new());
        let job = api.initiate_job("i-1").await.unwrap();
        let queue = EventPublishingQueue::start(api.clone(), job.id.clone(), RetryConfig::default());
        let logger = IntegrationLogger::new();
        logger.set_event_sink(queue.clone());

        let err = IntegrationError::validation("apiKey is missing");
        let mut event_data = Map::new();
        event_data.insert("endpoint".to_string(), json!("https://provider.example.com"));
        let error_id = logger.publish_error_event(ErrorEventInput {
            name: "validation_failure".to_string(),
            message: "Error validating invocation".to_string(),
            err: &err,
            event_data: Some(event_data),
            log_data: None,
        });
        queue.on_idle().await;

        let events = api.events(&job.id).await;
        assert_eq!(events.len(), 1);
        let description = &events[0].description;
        assert!(description.contains("errorCode=\"INTEGRATION_VALIDATION_ERROR\""));
        assert!(description.contains(&format!("errorId=\"{error_id}\"")));
        assert!(description.contains("reason=\"apiKey is missing\""));
        assert!(description.contains("endpoint=\"https://provider.example.com\""));
        queue.close().await;
    }

    #[tokio::test]
    async fn time_operation_publishes_metric_on_error() {
        let logger = IntegrationLogger::new();
        let result: Result<(), IntegrationError> = logger
            .time_operation("fetch-users-duration", async {
                Err(IntegrationError::validation("provider exploded"))
            })
            .await;
        assert!(result.is_err());

        let metrics = logger.published_metrics();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].metric_name, "fetch-users-duration");
        assert_eq!(metrics[0].unit, MetricUnit::Milliseconds);
    }

    #[tokio::test]
    async fn time_operation_publishes_metric_on_success() {
        let logger = IntegrationLogger::new();
        let value = logger.time_operation("noop-duration", async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(logger.published_metrics().len(), 1);
    }
}
