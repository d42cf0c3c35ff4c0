use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::analysis::Analysis;

/// A marker indicating something worth alerting on. Any non-zero count of
/// detection points on a root triggers alert submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionPoint {
    pub description: String,
    #[serde(default)]
    pub details: Option<String>,
}

impl DetectionPoint {
    pub fn new(description: impl Into<String>) -> Self {
        Self { description: description.into(), details: None }
    }

    pub fn with_details(description: impl Into<String>, details: impl Into<String>) -> Self {
        Self { description: description.into(), details: Some(details.into()) }
    }
}

/// Identity of an observable inside a root. Two observables are considered
/// the same observable iff type, value and time all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservableKey {
    pub observable_type: String,
    pub value: String,
    pub time: Option<DateTime<Utc>>,
}

/// A piece of information discovered during analysis that can itself be
/// analyzed (a file hash, an ipv4, a url, ...).
///
/// Cross references (links, redirection, relationships, analysis children)
/// are stored as observable uuids resolved against the owning root's
/// observable store, never as object references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observable {
    pub uuid: String,
    #[serde(rename = "type")]
    pub observable_type: String,
    pub value: String,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub detections: Vec<DetectionPoint>,
    #[serde(default)]
    pub directives: Vec<String>,
    /// Points at another observable for display grouping.
    #[serde(default)]
    pub redirection: Option<String>,
    /// Tags applied to this observable propagate to linked observables.
    #[serde(default)]
    pub links: Vec<String>,
    /// When non-empty, only the named modules may analyze this observable.
    #[serde(default)]
    pub limited_analysis: Vec<String>,
    #[serde(default)]
    pub excluded_analysis: Vec<String>,
    /// Explicit per-observable analysis requests (drives manual modules).
    #[serde(default)]
    pub requested_analysis: Vec<String>,
    /// Typed edges to other observables: relationship type -> observable uuids.
    #[serde(default)]
    pub relationships: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub grouping_target: bool,
    /// Outstanding analysis requests: module name -> request id.
    #[serde(default)]
    pub request_tracking: BTreeMap<String, String>,
    /// Completed analysis keyed by module name.
    #[serde(default)]
    pub analysis: BTreeMap<String, Analysis>,
}

impl Observable {
    pub fn new(
        observable_type: impl Into<String>,
        value: impl Into<String>,
        time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            observable_type: observable_type.into(),
            value: value.into(),
            time,
            tags: Vec::new(),
            detections: Vec::new(),
            directives: Vec::new(),
            redirection: None,
            links: Vec::new(),
            limited_analysis: Vec::new(),
            excluded_analysis: Vec::new(),
            requested_analysis: Vec::new(),
            relationships: BTreeMap::new(),
            grouping_target: false,
            request_tracking: BTreeMap::new(),
            analysis: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> ObservableKey {
        ObservableKey {
            observable_type: self.observable_type.clone(),
            value: self.value.clone(),
            time: self.time,
        }
    }

    /// Identity comparison per (type, value, time), independent of uuid.
    pub fn is_same_observable(&self, other: &Observable) -> bool {
        self.observable_type == other.observable_type
            && self.value == other.value
            && self.time == other.time
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Adds the tag to this observable only. Use
    /// [`crate::models::RootAnalysis::add_observable_tag`] to also propagate
    /// across links.
    pub fn add_tag(&mut self, tag: impl Into<String>) {
        let tag = tag.into();
        if !self.has_tag(&tag) {
            self.tags.push(tag);
        }
    }

    pub fn has_directive(&self, directive: &str) -> bool {
        self.directives.iter().any(|d| d == directive)
    }

    pub fn add_directive(&mut self, directive: impl Into<String>) {
        let directive = directive.into();
        if !self.has_directive(&directive) {
            self.directives.push(directive);
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

    pub fn limit_analysis(&mut self, module_name: impl Into<String>) {
        let name = module_name.into();
        if !self.limited_analysis.contains(&name) {
            self.limited_analysis.push(name);
        }
    }

    pub fn exclude_analysis(&mut self, module_name: impl Into<String>) {
        let name = module_name.into();
        if !self.excluded_analysis.contains(&name) {
            self.excluded_analysis.push(name);
        }
    }

    pub fn is_excluded(&self, module_name: &str) -> bool {
        self.excluded_analysis.iter().any(|m| m == module_name)
    }

    /// Requests analysis by the named module, which is how manual modules
    /// are driven.
    pub fn request_analysis(&mut self, module_name: impl Into<String>) {
        let name = module_name.into();
        if !self.requested_analysis.contains(&name) {
            self.requested_analysis.push(name);
        }
    }

    pub fn is_requested(&self, module_name: &str) -> bool {
        self.requested_analysis.iter().any(|m| m == module_name)
    }

    pub fn has_relationship(&self, relationship_type: &str, target_uuid: &str) -> bool {
        self.relationships
            .get(relationship_type)
            .map(|targets| targets.iter().any(|t| t == target_uuid))
            .unwrap_or(false)
    }

    pub fn add_relationship(&mut self, relationship_type: impl Into<String>, target_uuid: impl Into<String>) {
        let targets = self.relationships.entry(relationship_type.into()).or_default();
        let target_uuid = target_uuid.into();
        if !targets.contains(&target_uuid) {
            targets.push(target_uuid);
        }
    }

    pub fn add_link(&mut self, target_uuid: impl Into<String>) {
        let target_uuid = target_uuid.into();
        if !self.links.contains(&target_uuid) {
            self.links.push(target_uuid);
        }
    }

    /// Records the analysis request id for the given module name.
    pub fn track_analysis_request(&mut self, module_name: impl Into<String>, request_id: impl Into<String>) {
        self.request_tracking.insert(module_name.into(), request_id.into());
    }

    pub fn get_analysis_request_id(&self, module_name: &str) -> Option<&String> {
        self.request_tracking.get(module_name)
    }

    pub fn get_analysis(&self, module_name: &str) -> Option<&Analysis> {
        self.analysis.get(module_name)
    }

    pub fn analysis_completed(&self, module_name: &str) -> bool {
        self.analysis.contains_key(module_name)
    }
}

impl std::fmt::Display for Observable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.time {
            Some(time) => write!(f, "{}({}@{})", self.observable_type, self.value, time),
            None => write!(f, "{}({})", self.observable_type, self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_identity() {
        let a = Observable::new("ipv4", "1.2.3.4", None);
        let b = Observable::new("ipv4", "1.2.3.4", None);
        let c = Observable::new("ipv4", "1.2.3.5", None);

        assert!(a.is_same_observable(&b));
        assert!(!a.is_same_observable(&c));
        assert_ne!(a.uuid, b.uuid);

        let t = Utc::now();
        let d = Observable::new("ipv4", "1.2.3.4", Some(t));
        assert!(!a.is_same_observable(&d));
        let e = Observable::new("ipv4", "1.2.3.4", Some(t));
        assert!(d.is_same_observable(&e));
    }

    #[test]
    fn test_tag_and_directive_dedup() {
        let mut obs = Observable::new("test", "test", None);
        obs.add_tag("evil");
        obs.add_tag("evil");
        assert_eq!(obs.tags, vec!["evil".to_string()]);

        obs.add_directive("crawl");
        obs.add_directive("crawl");
        assert_eq!(obs.directives, vec!["crawl".to_string()]);
    }

    #[test]
    fn test_requested_and_excluded() {
        let mut obs = Observable::new("test", "test", None);
        assert!(!obs.is_requested("manual_module"));
        obs.request_analysis("manual_module");
        assert!(obs.is_requested("manual_module"));

        assert!(!obs.is_excluded("noisy_module"));
        obs.exclude_analysis("noisy_module");
        assert!(obs.is_excluded("noisy_module"));
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut obs = Observable::new("url", "http://example.com/", None);
        obs.add_tag("phish");
        obs.add_directive("no_render");
        obs.add_detection_point(DetectionPoint::new("known bad url"));
        obs.add_relationship("redirected_from", "some-uuid");
        obs.track_analysis_request("crawler", "req-1");

        let json = serde_json::to_string(&obs).unwrap();
        let restored: Observable = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.uuid, obs.uuid);
        assert_eq!(restored.tags, obs.tags);
        assert_eq!(restored.directives, obs.directives);
        assert_eq!(restored.detections, obs.detections);
        assert_eq!(restored.relationships, obs.relationships);
        assert_eq!(restored.request_tracking, obs.request_tracking);
    }
}
