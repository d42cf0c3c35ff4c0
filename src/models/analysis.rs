use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::module_type::AnalysisModuleType;
use super::observable::DetectionPoint;

/// The output of one analysis module executed against one observable.
///
/// The `details` blob is stored separately from the root document and is
/// lazily loaded; a root fetched from tracking carries `details: None` until
/// the caller asks the tracking service for them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    pub uuid: String,
    #[serde(rename = "type")]
    pub module_type: AnalysisModuleType,
    /// The observable this analysis was executed against.
    #[serde(default)]
    pub observable_id: Option<String>,
    /// Observables discovered by this analysis (uuids in the root's store).
    #[serde(default)]
    pub observable_ids: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub details: Option<Value>,
    /// Set when the module failed; the failure is recorded rather than lost.
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub detections: Vec<DetectionPoint>,
}

impl Analysis {
    pub fn new(module_type: AnalysisModuleType) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            module_type,
            observable_id: None,
            observable_ids: Vec::new(),
            summary: None,
            details: None,
            error_message: None,
            stack_trace: None,
            tags: Vec::new(),
            detections: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Records a module failure on this analysis.
    pub fn set_error(&mut self, message: impl Into<String>, stack_trace: Option<String>) {
        self.error_message = Some(message.into());
        self.stack_trace = stack_trace;
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.has_tag(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn add_detection_point(&mut self, detection: DetectionPoint) {
        if !self.detections.contains(&detection) {
            self.detections.push(detection);
        }
    }

    pub fn has_detection_points(&self) -> bool {
        !self.detections.is_empty()
    }

    pub fn add_child_observable(&mut self, observable_uuid: impl Into<String>) {
        let uuid = observable_uuid.into();
        if !self.observable_ids.contains(&uuid) {
            self.observable_ids.push(uuid);
        }
    }
}

impl std::fmt::Display for Analysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Analysis({},{})", self.uuid, self.module_type.name)
    }
}
