use serde::{Deserialize, Serialize};

/// Well-known lifecycle event names. Producers may also publish arbitrary
/// user-named events.
pub mod names {
    pub const STEP_START: &str = "step_start";
    pub const STEP_END: &str = "step_end";
    pub const STEP_FAILURE: &str = "step_failure";
    pub const SYNC_UPLOAD_START: &str = "sync_upload_start";
    pub const SYNC_UPLOAD_END: &str = "sync_upload_end";
    pub const VALIDATION_FAILURE: &str = "validation_failure";
}

/// One lifecycle event streamed to the synchronization job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationEvent {
    pub name: String,
    pub description: String,
}

impl IntegrationEvent {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}
