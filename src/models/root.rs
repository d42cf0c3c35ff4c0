use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::utils::{CoreError, CoreResult};

use super::analysis::Analysis;
use super::module_type::AnalysisModuleType;
use super::observable::{DetectionPoint, Observable, ObservableKey};

pub const DEFAULT_ALERT_TYPE: &str = "default";
pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_DESCRIPTION: &str = "ACE Analysis";

/// The top of an analysis tree: the authoritative document holding every
/// observable and analysis discovered for one submission.
///
/// All cross references inside the tree are uuids into `observable_store`;
/// merges and lookups operate on uuid and (type, value, time) identity,
/// never on object identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootAnalysis {
    pub uuid: String,
    /// Opaque version token for optimistic concurrency; assigned by root
    /// tracking on every successful update.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub tool_instance: Option<String>,
    #[serde(default = "default_alert_type")]
    pub alert_type: String,
    #[serde(default = "default_description")]
    pub description: String,
    #[serde(default)]
    pub analysis_mode: Option<String>,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    /// Free-form state shared by modules analyzing this root.
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub analysis_cancelled: bool,
    #[serde(default)]
    pub analysis_cancelled_reason: Option<String>,
    /// When true the root is deleted once analysis completes without any
    /// detection points.
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub detections: Vec<DetectionPoint>,
    #[serde(default)]
    pub details: Option<Value>,
    #[serde(default)]
    pub observable_store: BTreeMap<String, Observable>,
}

fn default_alert_type() -> String {
    DEFAULT_ALERT_TYPE.to_string()
}

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

fn default_description() -> String {
    DEFAULT_DESCRIPTION.to_string()
}

impl Default for RootAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl RootAnalysis {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            version: None,
            tool: None,
            tool_instance: None,
            alert_type: default_alert_type(),
            description: default_description(),
            analysis_mode: None,
            queue: default_queue(),
            event_time: None,
            name: None,
            instructions: None,
            state: Value::Object(serde_json::Map::new()),
            analysis_cancelled: false,
            analysis_cancelled_reason: None,
            expires: false,
            tags: Vec::new(),
            detections: Vec::new(),
            details: None,
            observable_store: BTreeMap::new(),
        }
    }

    //
    // observable store
    //

    pub fn get_observable(&self, uuid: &str) -> Option<&Observable> {
        self.observable_store.get(uuid)
    }

    pub fn get_observable_mut(&mut self, uuid: &str) -> Option<&mut Observable> {
        self.observable_store.get_mut(uuid)
    }

    fn observable_mut(&mut self, uuid: &str) -> CoreResult<&mut Observable> {
        self.observable_store
            .get_mut(uuid)
            .ok_or_else(|| CoreError::UnknownObservable(uuid.to_string()))
    }

    /// Finds an observable by (type, value, time) identity.
    pub fn find_observable(&self, key: &ObservableKey) -> Option<&Observable> {
        self.observable_store.values().find(|o| o.key() == *key)
    }

    pub fn all_observables(&self) -> impl Iterator<Item = &Observable> {
        self.observable_store.values()
    }

    pub fn all_observable_uuids(&self) -> Vec<String> {
        self.observable_store.keys().cloned().collect()
    }

    pub fn get_observables_by_type(&self, observable_type: &str) -> Vec<&Observable> {
        self.observable_store
            .values()
            .filter(|o| o.observable_type == observable_type)
            .collect()
    }

    /// Adds an observable, returning the existing uuid if one with the same
    /// (type, value, time) identity is already present.
    pub fn add_observable(
        &mut self,
        observable_type: impl Into<String>,
        value: impl Into<String>,
        time: Option<DateTime<Utc>>,
    ) -> String {
        self.record_observable(Observable::new(observable_type, value, time))
    }

    /// Records the given observable if no observable with the same identity
    /// exists; returns the uuid of the recorded or existing observable.
    pub fn record_observable(&mut self, observable: Observable) -> String {
        if let Some(existing) = self.find_observable(&observable.key()) {
            return existing.uuid.clone();
        }

        let uuid = observable.uuid.clone();
        self.observable_store.insert(uuid.clone(), observable);
        uuid
    }

    /// Resolves the observable referenced by `source_uuid` in `source` into
    /// this root, adding a bare observable with the same identity when it is
    /// not present yet. Returns the uuid in this root's store.
    fn resolve_or_add(&mut self, source: &RootAnalysis, source_uuid: &str) -> CoreResult<String> {
        let key = source
            .get_observable(source_uuid)
            .ok_or_else(|| CoreError::UnknownObservable(source_uuid.to_string()))?
            .key();

        if let Some(existing) = self.find_observable(&key) {
            return Ok(existing.uuid.clone());
        }

        Ok(self.add_observable(key.observable_type, key.value, key.time))
    }

    //
    // root level tags / detections
    //

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

    /// Adds a tag to the observable and to every observable reachable
    /// through its links.
    pub fn add_observable_tag(&mut self, uuid: &str, tag: &str) {
        let mut pending = vec![uuid.to_string()];
        let mut seen = HashSet::new();

        while let Some(current) = pending.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }

            if let Some(observable) = self.observable_store.get_mut(&current) {
                observable.add_tag(tag);
                pending.extend(observable.links.iter().cloned());
            }
        }
    }

    /// True if any detection point exists anywhere in the tree.
    pub fn has_detections(&self) -> bool {
        if !self.detections.is_empty() {
            return true;
        }

        self.observable_store.values().any(|observable| {
            observable.has_detection_points()
                || observable.analysis.values().any(|a| a.has_detection_points())
        })
    }

    pub fn cancel_analysis(&mut self, reason: Option<String>) {
        self.analysis_cancelled = true;
        if reason.is_some() {
            self.analysis_cancelled_reason = reason;
        }
    }

    //
    // analysis
    //

    /// Attaches an analysis result to the observable. If an analysis of the
    /// same module type is already present it is left in place and an error
    /// is returned; merging results goes through the diff-merge path.
    pub fn add_analysis(&mut self, observable_uuid: &str, mut analysis: Analysis) -> CoreResult<String> {
        let module_name = analysis.module_type.name.clone();
        let observable = self.observable_mut(observable_uuid)?;

        if observable.analysis.contains_key(&module_name) {
            return Err(CoreError::Internal(format!(
                "analysis of type {} already set for observable {}",
                module_name, observable_uuid
            )));
        }

        analysis.observable_id = Some(observable_uuid.to_string());
        let analysis_uuid = analysis.uuid.clone();
        observable.analysis.insert(module_name, analysis);
        Ok(analysis_uuid)
    }

    /// Adds a child observable discovered by the given analysis, registering
    /// it in the store when necessary.
    pub fn add_analysis_observable(
        &mut self,
        observable_uuid: &str,
        module_name: &str,
        observable_type: impl Into<String>,
        value: impl Into<String>,
        time: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        let child_uuid = self.add_observable(observable_type, value, time);
        let observable = self.observable_mut(observable_uuid)?;

        match observable.analysis.get_mut(module_name) {
            Some(analysis) => {
                analysis.add_child_observable(&child_uuid);
                Ok(child_uuid)
            },
            None => Err(CoreError::Internal(format!(
                "no analysis of type {} on observable {}",
                module_name, observable_uuid
            ))),
        }
    }

    pub fn analysis_completed(&self, observable_uuid: &str, module_name: &str) -> CoreResult<bool> {
        let observable = self
            .get_observable(observable_uuid)
            .ok_or_else(|| CoreError::UnknownObservable(observable_uuid.to_string()))?;
        Ok(observable.analysis_completed(module_name))
    }

    /// True when an outstanding request for (observable, module) is recorded
    /// on this root.
    pub fn analysis_tracked(&self, observable_uuid: &str, module_name: &str) -> CoreResult<bool> {
        let observable = self
            .get_observable(observable_uuid)
            .ok_or_else(|| CoreError::UnknownObservable(observable_uuid.to_string()))?;
        Ok(observable.get_analysis_request_id(module_name).is_some())
    }

    pub fn track_analysis_request_on(
        &mut self,
        observable_uuid: &str,
        module_name: &str,
        request_id: &str,
    ) -> CoreResult<()> {
        self.observable_mut(observable_uuid)?
            .track_analysis_request(module_name, request_id);
        Ok(())
    }

    //
    // merges
    //

    /// Full merge of another copy of this root into this one: union on
    /// collections, last writer wins on the mutable scalars.
    pub fn apply_merge(&mut self, other: &RootAnalysis) -> CoreResult<()> {
        if self.uuid != other.uuid {
            return Err(CoreError::Internal(format!(
                "attempt to merge root {} into root {}",
                other.uuid, self.uuid
            )));
        }

        self.analysis_mode = other.analysis_mode.clone();
        self.queue = other.queue.clone();
        self.description = other.description.clone();
        self.analysis_cancelled = other.analysis_cancelled;
        self.analysis_cancelled_reason = other.analysis_cancelled_reason.clone();

        for tag in &other.tags {
            self.add_tag(tag.clone());
        }

        for detection in &other.detections {
            self.add_detection_point(detection.clone());
        }

        let mut visited = HashSet::new();
        for source_uuid in other.all_observable_uuids() {
            let target_uuid = self.resolve_or_add(other, &source_uuid)?;
            self.merge_observable(&target_uuid, other, &source_uuid, &mut visited)?;
        }

        Ok(())
    }

    /// Merges every mergable property of `source_uuid` (in `source`) into
    /// `target_uuid` here, including full analysis grafts. `visited` guards
    /// against reference cycles through analysis children and links.
    fn merge_observable(
        &mut self,
        target_uuid: &str,
        source: &RootAnalysis,
        source_uuid: &str,
        visited: &mut HashSet<String>,
    ) -> CoreResult<()> {
        if !visited.insert(source_uuid.to_string()) {
            return Ok(());
        }

        let src = source
            .get_observable(source_uuid)
            .ok_or_else(|| CoreError::UnknownObservable(source_uuid.to_string()))?
            .clone();

        {
            let target = self.observable_mut(target_uuid)?;
            for directive in &src.directives {
                target.add_directive(directive.clone());
            }
            for detection in &src.detections {
                target.add_detection_point(detection.clone());
            }
            for module in &src.limited_analysis {
                target.limit_analysis(module.clone());
            }
            for module in &src.excluded_analysis {
                target.exclude_analysis(module.clone());
            }
            for module in &src.requested_analysis {
                target.request_analysis(module.clone());
            }
            if src.grouping_target {
                target.grouping_target = true;
            }
        }

        if let Some(redirection) = &src.redirection {
            let resolved = self.resolve_or_add(source, redirection)?;
            self.observable_mut(target_uuid)?.redirection = Some(resolved);
        }

        for link in src.links.clone() {
            let resolved = self.resolve_or_add(source, &link)?;
            self.observable_mut(target_uuid)?.add_link(resolved);
        }

        for (relationship_type, targets) in src.relationships.clone() {
            for relationship_target in targets {
                let resolved = self.resolve_or_add(source, &relationship_target)?;
                self.observable_mut(target_uuid)?
                    .add_relationship(relationship_type.clone(), resolved);
            }
        }

        // tags last so they propagate across links added above
        for tag in src.tags.clone() {
            self.add_observable_tag(target_uuid, &tag);
        }

        for (module_name, src_analysis) in src.analysis.clone() {
            self.merge_analysis(target_uuid, &module_name, source, &src_analysis, visited)?;
        }

        Ok(())
    }

    /// Grafts the analysis onto the target observable if it is missing, then
    /// merges tags, detections and child observables.
    fn merge_analysis(
        &mut self,
        target_uuid: &str,
        module_name: &str,
        source: &RootAnalysis,
        src_analysis: &Analysis,
        visited: &mut HashSet<String>,
    ) -> CoreResult<()> {
        {
            let target = self.observable_mut(target_uuid)?;
            if !target.analysis.contains_key(module_name) {
                let mut grafted = Analysis::new(src_analysis.module_type.clone());
                grafted.observable_id = Some(target_uuid.to_string());
                grafted.summary = src_analysis.summary.clone();
                grafted.details = src_analysis.details.clone();
                grafted.error_message = src_analysis.error_message.clone();
                grafted.stack_trace = src_analysis.stack_trace.clone();
                target.analysis.insert(module_name.to_string(), grafted);
            }
        }

        {
            let target = self.observable_mut(target_uuid)?;
            if let Some(analysis) = target.analysis.get_mut(module_name) {
                for tag in &src_analysis.tags {
                    analysis.add_tag(tag.clone());
                }
                for detection in &src_analysis.detections {
                    analysis.add_detection_point(detection.clone());
                }
                if analysis.details.is_none() {
                    analysis.details = src_analysis.details.clone();
                }
            }
        }

        for src_child_uuid in src_analysis.observable_ids.clone() {
            let target_child_uuid = self.resolve_or_add(source, &src_child_uuid)?;

            {
                let target = self.observable_mut(target_uuid)?;
                if let Some(analysis) = target.analysis.get_mut(module_name) {
                    analysis.add_child_observable(&target_child_uuid);
                }
            }

            self.merge_observable(&target_child_uuid, source, &src_child_uuid, visited)?;
        }

        Ok(())
    }

    /// Additive diff merge of the root level state: scalars that changed
    /// between `before` and `after` are copied from `after`; tags and
    /// detections present in `after` but not in `before` are added. Nothing
    /// is ever removed.
    pub fn apply_diff_merge(&mut self, before: &RootAnalysis, after: &RootAnalysis) -> CoreResult<()> {
        if before.uuid != after.uuid {
            return Err(CoreError::Internal(format!(
                "attempt to diff merge two different roots {} and {}",
                before.uuid, after.uuid
            )));
        }

        if before.analysis_mode != after.analysis_mode {
            self.analysis_mode = after.analysis_mode.clone();
        }

        if before.queue != after.queue {
            self.queue = after.queue.clone();
        }

        if before.description != after.description {
            self.description = after.description.clone();
        }

        if before.analysis_cancelled != after.analysis_cancelled {
            self.analysis_cancelled = after.analysis_cancelled;
        }

        if before.analysis_cancelled_reason != after.analysis_cancelled_reason {
            self.analysis_cancelled_reason = after.analysis_cancelled_reason.clone();
        }

        for tag in &after.tags {
            if !before.tags.contains(tag) {
                self.add_tag(tag.clone());
            }
        }

        for detection in &after.detections {
            if !before.detections.contains(detection) {
                self.add_detection_point(detection.clone());
            }
        }

        Ok(())
    }

    /// Applies a worker's observable delta to this root: everything added to
    /// the observable between `before` and `after` is merged into the
    /// observable here with the same (type, value, time) identity. When
    /// `module` is given, the analysis that module produced in `after` is
    /// grafted in as well, along with any observables it discovered.
    ///
    /// Returns the uuid of the target observable in this root.
    pub fn apply_observable_diff_merge(
        &mut self,
        key: &ObservableKey,
        before_root: &RootAnalysis,
        after_root: &RootAnalysis,
        module: Option<&AnalysisModuleType>,
    ) -> CoreResult<String> {
        let target_uuid = self
            .find_observable(key)
            .map(|o| o.uuid.clone())
            .ok_or_else(|| CoreError::UnknownObservable(format!("{:?}", key)))?;
        let before_uuid = before_root
            .find_observable(key)
            .map(|o| o.uuid.clone())
            .ok_or_else(|| CoreError::UnknownObservable(format!("{:?}", key)))?;
        let after_uuid = after_root
            .find_observable(key)
            .map(|o| o.uuid.clone())
            .ok_or_else(|| CoreError::UnknownObservable(format!("{:?}", key)))?;

        self.diff_merge_observable(&target_uuid, before_root, &before_uuid, after_root, &after_uuid, module)?;
        Ok(target_uuid)
    }

    fn diff_merge_observable(
        &mut self,
        target_uuid: &str,
        before_root: &RootAnalysis,
        before_uuid: &str,
        after_root: &RootAnalysis,
        after_uuid: &str,
        module: Option<&AnalysisModuleType>,
    ) -> CoreResult<()> {
        let before = before_root
            .get_observable(before_uuid)
            .ok_or_else(|| CoreError::UnknownObservable(before_uuid.to_string()))?
            .clone();
        let after = after_root
            .get_observable(after_uuid)
            .ok_or_else(|| CoreError::UnknownObservable(after_uuid.to_string()))?
            .clone();

        {
            let target = self.observable_mut(target_uuid)?;

            for directive in &after.directives {
                if !before.directives.contains(directive) {
                    target.add_directive(directive.clone());
                }
            }

            for detection in &after.detections {
                if !before.detections.contains(detection) {
                    target.add_detection_point(detection.clone());
                }
            }

            for module_name in &after.limited_analysis {
                if !before.limited_analysis.contains(module_name) {
                    target.limit_analysis(module_name.clone());
                }
            }

            for module_name in &after.excluded_analysis {
                if !before.excluded_analysis.contains(module_name) {
                    target.exclude_analysis(module_name.clone());
                }
            }

            for module_name in &after.requested_analysis {
                if !before.requested_analysis.contains(module_name) {
                    target.request_analysis(module_name.clone());
                }
            }

            if before.grouping_target != after.grouping_target {
                target.grouping_target = after.grouping_target;
            }
        }

        // a redirection change is detected by the identity of the referenced
        // observable, not by its uuid
        let before_redirection_key = before
            .redirection
            .as_ref()
            .and_then(|uuid| before_root.get_observable(uuid))
            .map(|o| o.key());
        let after_redirection_key = after
            .redirection
            .as_ref()
            .and_then(|uuid| after_root.get_observable(uuid))
            .map(|o| o.key());

        if before_redirection_key != after_redirection_key {
            if let Some(redirection) = &after.redirection {
                let resolved = self.resolve_or_add(after_root, redirection)?;
                self.observable_mut(target_uuid)?.redirection = Some(resolved);
            }
        }

        let before_link_keys: Vec<ObservableKey> = before
            .links
            .iter()
            .filter_map(|uuid| before_root.get_observable(uuid))
            .map(|o| o.key())
            .collect();

        for link in after.links.clone() {
            let link_key = match after_root.get_observable(&link) {
                Some(observable) => observable.key(),
                None => continue,
            };

            if before_link_keys.contains(&link_key) {
                continue;
            }

            let resolved = self.resolve_or_add(after_root, &link)?;
            self.observable_mut(target_uuid)?.add_link(resolved);
        }

        for (relationship_type, targets) in after.relationships.clone() {
            for relationship_target in targets {
                let target_key = match after_root.get_observable(&relationship_target) {
                    Some(observable) => observable.key(),
                    None => continue,
                };

                let already_present = before
                    .relationships
                    .get(&relationship_type)
                    .map(|uuids| {
                        uuids
                            .iter()
                            .filter_map(|uuid| before_root.get_observable(uuid))
                            .any(|o| o.key() == target_key)
                    })
                    .unwrap_or(false);

                if already_present {
                    continue;
                }

                let resolved = self.resolve_or_add(after_root, &relationship_target)?;
                self.observable_mut(target_uuid)?
                    .add_relationship(relationship_type.clone(), resolved);
            }
        }

        // tags last, propagating across any links added above
        for tag in after.tags.clone() {
            if !before.tags.contains(&tag) {
                self.add_observable_tag(target_uuid, &tag);
            }
        }

        if let Some(amt) = module {
            if let Some(after_analysis) = after.analysis.get(&amt.name) {
                let after_analysis = after_analysis.clone();
                self.diff_merge_analysis(target_uuid, &amt.name, before_root, after_root, &after_analysis)?;
            }
        }

        Ok(())
    }

    /// Grafts the result analysis onto the target observable and brings over
    /// the observables it discovered. Re-applying the same result is
    /// idempotent.
    fn diff_merge_analysis(
        &mut self,
        target_uuid: &str,
        module_name: &str,
        before_root: &RootAnalysis,
        after_root: &RootAnalysis,
        after_analysis: &Analysis,
    ) -> CoreResult<()> {
        {
            let target = self.observable_mut(target_uuid)?;
            if !target.analysis.contains_key(module_name) {
                let mut grafted = Analysis::new(after_analysis.module_type.clone());
                grafted.observable_id = Some(target_uuid.to_string());
                grafted.summary = after_analysis.summary.clone();
                grafted.details = after_analysis.details.clone();
                grafted.error_message = after_analysis.error_message.clone();
                grafted.stack_trace = after_analysis.stack_trace.clone();
                target.analysis.insert(module_name.to_string(), grafted);
            }

            if let Some(analysis) = target.analysis.get_mut(module_name) {
                for tag in &after_analysis.tags {
                    analysis.add_tag(tag.clone());
                }
                for detection in &after_analysis.detections {
                    analysis.add_detection_point(detection.clone());
                }
                if analysis.details.is_none() {
                    analysis.details = after_analysis.details.clone();
                }
            }
        }

        for after_child_uuid in after_analysis.observable_ids.clone() {
            let after_child_key = match after_root.get_observable(&after_child_uuid) {
                Some(observable) => observable.key(),
                None => {
                    return Err(CoreError::UnknownObservable(after_child_uuid.clone()));
                },
            };

            let target_child_uuid = self.resolve_or_add(after_root, &after_child_uuid)?;

            {
                let target = self.observable_mut(target_uuid)?;
                if let Some(analysis) = target.analysis.get_mut(module_name) {
                    analysis.add_child_observable(&target_child_uuid);
                }
            }

            match before_root.find_observable(&after_child_key) {
                Some(before_child) => {
                    // the observable existed before the analysis ran, so only
                    // the changes made to it are applied
                    let before_child_uuid = before_child.uuid.clone();
                    self.diff_merge_observable(
                        &target_child_uuid,
                        before_root,
                        &before_child_uuid,
                        after_root,
                        &after_child_uuid,
                        None,
                    )?;
                },
                None => {
                    // newly discovered observable, bring everything over
                    let mut visited = HashSet::new();
                    self.merge_observable(&target_child_uuid, after_root, &after_child_uuid, &mut visited)?;
                },
            }
        }

        Ok(())
    }
}

impl std::fmt::Display for RootAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RootAnalysis({})", self.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_add_observable_dedup() {
        let mut root = RootAnalysis::new();
        let first = root.add_observable("ipv4", "1.2.3.4", None);
        let second = root.add_observable("ipv4", "1.2.3.4", None);
        let third = root.add_observable("ipv4", "1.2.3.5", None);

        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(root.observable_store.len(), 2);
    }

    #[test]
    fn test_tag_propagation_across_links() {
        let mut root = RootAnalysis::new();
        let a = root.add_observable("test", "a", None);
        let b = root.add_observable("test", "b", None);
        let c = root.add_observable("test", "c", None);

        root.get_observable_mut(&a).unwrap().add_link(b.clone());
        root.get_observable_mut(&b).unwrap().add_link(c.clone());

        root.add_observable_tag(&a, "evil");

        assert!(root.get_observable(&a).unwrap().has_tag("evil"));
        assert!(root.get_observable(&b).unwrap().has_tag("evil"));
        assert!(root.get_observable(&c).unwrap().has_tag("evil"));
    }

    #[test]
    fn test_tag_propagation_survives_link_cycles() {
        let mut root = RootAnalysis::new();
        let a = root.add_observable("test", "a", None);
        let b = root.add_observable("test", "b", None);

        root.get_observable_mut(&a).unwrap().add_link(b.clone());
        root.get_observable_mut(&b).unwrap().add_link(a.clone());

        root.add_observable_tag(&a, "looped");
        assert!(root.get_observable(&b).unwrap().has_tag("looped"));
    }

    #[test]
    fn test_has_detections_at_every_level() {
        let mut root = RootAnalysis::new();
        assert!(!root.has_detections());

        root.add_detection_point(DetectionPoint::new("root level"));
        assert!(root.has_detections());

        let mut root = RootAnalysis::new();
        let uuid = root.add_observable("test", "test", None);
        root.get_observable_mut(&uuid)
            .unwrap()
            .add_detection_point(DetectionPoint::new("observable level"));
        assert!(root.has_detections());

        let mut root = RootAnalysis::new();
        let uuid = root.add_observable("test", "test", None);
        let amt = AnalysisModuleType::new("detector");
        root.add_analysis(&uuid, Analysis::new(amt)).unwrap();
        assert!(!root.has_detections());
        root.get_observable_mut(&uuid)
            .unwrap()
            .analysis
            .get_mut("detector")
            .unwrap()
            .add_detection_point(DetectionPoint::new("analysis level"));
        assert!(root.has_detections());
    }

    #[test]
    fn test_apply_merge_unions_collections() {
        let mut target = RootAnalysis::new();
        let uuid = target.uuid.clone();
        target.add_tag("original");
        let obs = target.add_observable("test", "shared", None);
        target.get_observable_mut(&obs).unwrap().add_directive("keep_me");

        let mut other = target.clone();
        other.add_tag("merged");
        other.description = "updated description".to_string();
        let other_obs = other.find_observable(&target.get_observable(&obs).unwrap().key()).unwrap().uuid.clone();
        other.get_observable_mut(&other_obs).unwrap().add_directive("new_directive");
        other.add_observable("test", "brand_new", None);

        target.apply_merge(&other).unwrap();

        assert_eq!(target.uuid, uuid);
        assert!(target.has_tag("original"));
        assert!(target.has_tag("merged"));
        assert_eq!(target.description, "updated description");

        let merged_obs = target.get_observable(&obs).unwrap();
        assert!(merged_obs.has_directive("keep_me"));
        assert!(merged_obs.has_directive("new_directive"));
        assert_eq!(target.observable_store.len(), 2);
    }

    #[test]
    fn test_apply_merge_rejects_different_root() {
        let mut target = RootAnalysis::new();
        let other = RootAnalysis::new();
        assert!(target.apply_merge(&other).is_err());
    }

    #[test]
    fn test_apply_merge_grafts_analysis() {
        let mut target = RootAnalysis::new();
        let obs = target.add_observable("test", "sample", None);

        let mut other = target.clone();
        let other_obs = other.all_observable_uuids()[0].clone();
        let amt = AnalysisModuleType::new("scanner");
        other
            .add_analysis(&other_obs, Analysis::new(amt).with_details(json!({"found": true})))
            .unwrap();
        other
            .add_analysis_observable(&other_obs, "scanner", "ipv4", "10.0.0.1", None)
            .unwrap();

        target.apply_merge(&other).unwrap();

        let merged = target.get_observable(&obs).unwrap();
        let analysis = merged.get_analysis("scanner").unwrap();
        assert_eq!(analysis.details, Some(json!({"found": true})));
        assert_eq!(analysis.observable_ids.len(), 1);
        assert!(target.get_observable(&analysis.observable_ids[0]).is_some());
    }

    #[test]
    fn test_diff_merge_is_additive_only() {
        let mut target = RootAnalysis::new();
        target.add_tag("existing");

        let mut before = target.clone();
        before.tags.clear();
        let mut after = before.clone();
        after.add_tag("from_delta");

        target.apply_diff_merge(&before, &after).unwrap();

        // nothing removed, the new tag added
        assert!(target.has_tag("existing"));
        assert!(target.has_tag("from_delta"));
    }

    #[test]
    fn test_diff_merge_scalars_copy_only_when_changed() {
        let mut target = RootAnalysis::new();
        target.description = "local edit".to_string();

        let before = {
            let mut r = target.clone();
            r.description = "shared base".to_string();
            r
        };

        // worker did not touch the description
        let after = before.clone();
        target.apply_diff_merge(&before, &after).unwrap();
        assert_eq!(target.description, "local edit");

        // worker changed the description
        let mut after = before.clone();
        after.description = "worker edit".to_string();
        target.apply_diff_merge(&before, &after).unwrap();
        assert_eq!(target.description, "worker edit");
    }

    #[test]
    fn test_observable_diff_merge_grafts_result_analysis() {
        let mut target = RootAnalysis::new();
        let obs_uuid = target.add_observable("test", "payload", None);
        let key = target.get_observable(&obs_uuid).unwrap().key();

        let before = target.clone();
        let mut after = target.clone();
        let after_obs = after.find_observable(&key).unwrap().uuid.clone();

        let amt = AnalysisModuleType::new("detonator");
        after
            .add_analysis(
                &after_obs,
                Analysis::new(amt.clone()).with_details(json!({"verdict": "bad"})),
            )
            .unwrap();
        after
            .add_analysis_observable(&after_obs, "detonator", "url", "http://c2.example/", None)
            .unwrap();

        let merged_uuid = target
            .apply_observable_diff_merge(&key, &before, &after, Some(&amt))
            .unwrap();
        assert_eq!(merged_uuid, obs_uuid);

        let analysis = target.get_observable(&obs_uuid).unwrap().get_analysis("detonator").unwrap();
        assert_eq!(analysis.details, Some(json!({"verdict": "bad"})));
        assert_eq!(analysis.observable_ids.len(), 1);

        let child = target.get_observable(&analysis.observable_ids[0]).unwrap();
        assert_eq!(child.observable_type, "url");
        assert_eq!(child.value, "http://c2.example/");
    }

    #[test]
    fn test_observable_diff_merge_is_idempotent() {
        let mut target = RootAnalysis::new();
        let obs_uuid = target.add_observable("test", "payload", None);
        let key = target.get_observable(&obs_uuid).unwrap().key();

        let before = target.clone();
        let mut after = target.clone();
        let after_obs = after.find_observable(&key).unwrap().uuid.clone();

        let amt = AnalysisModuleType::new("scanner");
        after
            .add_analysis(&after_obs, Analysis::new(amt.clone()).with_details(json!({"k": "v"})))
            .unwrap();
        after.get_observable_mut(&after_obs).unwrap().add_tag("tagged");

        target.apply_observable_diff_merge(&key, &before, &after, Some(&amt)).unwrap();
        let snapshot = serde_json::to_value(&target).unwrap();

        target.apply_observable_diff_merge(&key, &before, &after, Some(&amt)).unwrap();
        let replayed = serde_json::to_value(&target).unwrap();

        assert_eq!(snapshot, replayed);
    }

    #[test]
    fn test_observable_diff_merge_missing_observable() {
        let mut target = RootAnalysis::new();
        let obs_uuid = target.add_observable("test", "present", None);
        let key = target.get_observable(&obs_uuid).unwrap().key();

        let empty = RootAnalysis { uuid: target.uuid.clone(), ..RootAnalysis::new() };
        let result = target.apply_observable_diff_merge(&key, &empty, &empty, None);
        assert!(matches!(result, Err(CoreError::UnknownObservable(_))));
    }

    #[test]
    fn test_root_serialization_round_trip() {
        let mut root = RootAnalysis::new();
        root.tool = Some("splunk".to_string());
        root.tool_instance = Some("splunk01".to_string());
        root.analysis_mode = Some("detection".to_string());
        root.expires = true;
        root.state = json!({"seen": 1});
        let uuid = root.add_observable("url", "http://example.com/", None);
        root.add_analysis(
            &uuid,
            Analysis::new(AnalysisModuleType::new("crawler")).with_summary("crawled ok"),
        )
        .unwrap();

        let encoded = serde_json::to_string(&root).unwrap();
        let restored: RootAnalysis = serde_json::from_str(&encoded).unwrap();

        assert_eq!(restored.uuid, root.uuid);
        assert_eq!(restored.tool, root.tool);
        assert_eq!(restored.analysis_mode, root.analysis_mode);
        assert_eq!(restored.expires, root.expires);
        assert_eq!(restored.state, root.state);
        assert_eq!(restored.observable_store.len(), 1);
        assert_eq!(
            serde_json::to_value(&restored).unwrap(),
            serde_json::to_value(&root).unwrap()
        );
    }
}
