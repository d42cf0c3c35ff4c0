use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use crate::models::{AnalysisModuleType, AnalysisRequest, RequestStatus, RootAnalysis};
use crate::services::alert_service::AlertService;
use crate::services::analysis_tracking::AnalysisTrackingService;
use crate::services::cache_service::CacheService;
use crate::services::event_service::{
    EventService, EVENT_ANALYSIS_ROOT_COMPLETED, EVENT_ANALYSIS_ROOT_EXPIRED, EVENT_AR_EXPIRED,
    EVENT_CACHE_HIT, EVENT_PROCESSING_REQUEST_OBSERVABLE, EVENT_PROCESSING_REQUEST_RESULT,
    EVENT_PROCESSING_REQUEST_ROOT, EVENT_WORK_ASSIGNED,
};
use crate::services::lock_service::LockService;
use crate::services::module_registry::ModuleRegistryService;
use crate::services::request_tracking::RequestTrackingService;
use crate::services::work_queue_service::WorkQueueService;
use crate::utils::{CoreError, CoreResult};

/// Bound on optimistic-concurrency retries; exceeding it means something is
/// structurally wrong with root versioning.
const MAX_UPDATE_ATTEMPTS: usize = 100;

/// Serializes the expired-request sweep across callers.
const EXPIRED_SWEEP_LOCK: &str = "ace:expired_analysis_requests";

/// The state machine driving the whole system: merges submitted roots and
/// worker results into the tracked root, dedups work through request
/// linking and the result cache, dispatches accepting (observable, module)
/// pairs onto the per-module work queues, and manages request expiration
/// and root lifecycle.
pub struct ProcessingEngine {
    analysis_tracking: Arc<AnalysisTrackingService>,
    request_tracking: Arc<RequestTrackingService>,
    registry: Arc<ModuleRegistryService>,
    work_queues: Arc<WorkQueueService>,
    cache: Arc<CacheService>,
    alerts: Arc<AlertService>,
    locks: LockService,
    events: Arc<EventService>,
}

impl ProcessingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        analysis_tracking: Arc<AnalysisTrackingService>,
        request_tracking: Arc<RequestTrackingService>,
        registry: Arc<ModuleRegistryService>,
        work_queues: Arc<WorkQueueService>,
        cache: Arc<CacheService>,
        alerts: Arc<AlertService>,
        locks: LockService,
        events: Arc<EventService>,
    ) -> Self {
        Self {
            analysis_tracking,
            request_tracking,
            registry,
            work_queues,
            cache,
            alerts,
            locks,
            events,
        }
    }

    /// Submits a request for processing: root submissions and results are
    /// processed inline, observable analysis requests go onto the module's
    /// work queue.
    pub async fn submit_analysis_request(&self, mut ar: AnalysisRequest) -> CoreResult<()> {
        ar.owner = None;
        ar.status = RequestStatus::Queued;
        self.request_tracking.force_unlock_analysis_request(&ar.id).await?;
        self.request_tracking.track_analysis_request(&ar).await?;

        if ar.is_root_analysis_request() || ar.is_observable_analysis_result() {
            return self.process_analysis_request(ar).await;
        }

        let module_name = ar
            .module_type
            .as_ref()
            .map(|amt| amt.name.clone())
            .ok_or_else(|| CoreError::Internal("analysis request without module type".to_string()))?;
        self.work_queues.put_work(&module_name, ar).await
    }

    /// Processes an analysis request. This implements the core logic of the
    /// system.
    pub async fn process_analysis_request(&self, ar: AnalysisRequest) -> CoreResult<()> {
        self.process_inner(ar).await
    }

    // recursion (linked fan-out, synchronous cache hits) requires boxing
    fn process_inner<'a>(
        &'a self,
        ar: AnalysisRequest,
    ) -> Pin<Box<dyn Future<Output = CoreResult<()>> + Send + 'a>> {
        Box::pin(async move {
            tracing::debug!("processing {}", ar);

            let mut target_root = if ar.is_observable_analysis_result() {
                self.process_result(&ar).await?
            } else if ar.is_root_analysis_request() {
                self.process_root_submission(&ar).await?
            } else {
                return Err(CoreError::Internal(format!(
                    "{} is neither a root submission nor a result",
                    ar
                )));
            };

            self.dispatch(&ar, &mut target_root).await?;

            // this request is finished
            self.request_tracking.delete_analysis_request(&ar.id).await?;

            let outstanding = self
                .request_tracking
                .get_analysis_requests_by_root(&target_root.uuid)
                .await?;
            if outstanding.is_empty() {
                tracing::debug!("completed root analysis {}", target_root.uuid);
                self.events
                    .fire_event(EVENT_ANALYSIS_ROOT_COMPLETED, json!(target_root.uuid))
                    .await;

                if let Some(current) = self.analysis_tracking.get_root_analysis(&target_root.uuid).await? {
                    if current.expires && !current.has_detections() {
                        tracing::debug!("deleting expired root analysis {}", current.uuid);
                        self.events
                            .fire_event(EVENT_ANALYSIS_ROOT_EXPIRED, json!(current.uuid))
                            .await;
                        self.analysis_tracking.delete_root_analysis(&current.uuid).await?;
                    }
                }
            }

            Ok(())
        })
    }

    /// Result submission: staleness checks, the three-way merge into the
    /// tracked root under the request lock, then linked-request fan-out.
    async fn process_result(&self, ar: &AnalysisRequest) -> CoreResult<RootAnalysis> {
        let existing = self
            .request_tracking
            .get_analysis_request_by_request_id(&ar.id)
            .await?
            .ok_or_else(|| CoreError::UnknownAnalysisRequest(ar.id.clone()))?;

        // the prior owner took too long and the request was reassigned
        if existing.owner != ar.owner {
            tracing::info!("rejecting result for expired analysis request {}", ar.id);
            return Err(CoreError::ExpiredAnalysisRequest(ar.id.clone()));
        }

        let mut target_root = self
            .analysis_tracking
            .get_root_analysis(&ar.root.uuid)
            .await?
            .ok_or_else(|| CoreError::UnknownRootAnalysis(ar.root.uuid.clone()))?;

        // root updates are optimistic; this lock only prevents two engines
        // racing on the same linked-request fan-out
        let lock_owner = Uuid::new_v4().to_string();
        if !self.request_tracking.lock_analysis_request(&ar.id, &lock_owner).await? {
            return Err(CoreError::LockedAnalysisRequest(ar.id.clone()));
        }

        let merged = self.merge_result(ar, &mut target_root).await;
        let fanned_out = match &merged {
            Ok(_) => self.fan_out_linked_requests(ar).await,
            Err(_) => Ok(()),
        };

        if let Err(error) = self
            .request_tracking
            .unlock_analysis_request(&ar.id, &lock_owner)
            .await
        {
            tracing::warn!("failed to unlock analysis request {}: {}", ar.id, error);
        }

        merged?;
        fanned_out?;
        Ok(target_root)
    }

    async fn merge_result(&self, ar: &AnalysisRequest, target_root: &mut RootAnalysis) -> CoreResult<()> {
        if ar.is_cachable() && !ar.cache_hit {
            self.cache.cache_analysis_result(ar).await?;
        }

        // NOTE the merge uses the data carried by the request, never the
        // currently tracked data
        let original_root = ar
            .original_root
            .as_ref()
            .ok_or_else(|| CoreError::Internal(format!("{} has no original root", ar)))?;
        let modified_root = ar
            .modified_root
            .as_ref()
            .ok_or_else(|| CoreError::Internal(format!("{} has no modified root", ar)))?;
        let amt = ar
            .module_type
            .as_ref()
            .ok_or_else(|| CoreError::Internal(format!("{} has no module type", ar)))?;
        let observable_id = ar
            .observable_id
            .clone()
            .ok_or_else(|| CoreError::Internal(format!("{} has no observable", ar)))?;
        let key = ar
            .observable_key()
            .ok_or_else(|| CoreError::UnknownObservable(observable_id.clone()))?;

        if original_root.find_observable(&key).is_none() {
            tracing::error!("cannot find {} in original root {}", observable_id, original_root.uuid);
            return Err(CoreError::UnknownObservable(observable_id.clone()));
        }

        if modified_root.find_observable(&key).is_none() {
            tracing::error!("cannot find {} in modified root {}", observable_id, modified_root.uuid);
            return Err(CoreError::UnknownObservable(observable_id));
        }

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            target_root.apply_diff_merge(original_root, modified_root)?;
            target_root.apply_observable_diff_merge(&key, original_root, modified_root, Some(amt))?;

            if self.analysis_tracking.update_root_analysis(target_root).await? {
                self.events
                    .fire_event(
                        EVENT_PROCESSING_REQUEST_RESULT,
                        json!({ "request_id": ar.id, "root": target_root.uuid }),
                    )
                    .await;
                return Ok(());
            }

            // the root moved forward under us; reload and re-apply
            let fresh = self
                .analysis_tracking
                .get_root_analysis(&target_root.uuid)
                .await?
                .ok_or_else(|| CoreError::UnknownRootAnalysis(target_root.uuid.clone()))?;
            *target_root = fresh;
        }

        Err(CoreError::Internal(format!(
            "exceeded {} root update attempts merging {}",
            MAX_UPDATE_ATTEMPTS, ar
        )))
    }

    /// Drives every request linked to this one with the same result delta.
    async fn fan_out_linked_requests(&self, ar: &AnalysisRequest) -> CoreResult<()> {
        for mut linked in self.request_tracking.get_linked_analysis_requests(&ar.id).await? {
            linked.original_root = ar.original_root.clone();
            linked.modified_root = ar.modified_root.clone();
            tracing::debug!("processing linked analysis request {} from {}", linked.id, ar.id);
            self.process_inner(linked).await?;
        }
        Ok(())
    }

    /// Root submission: merge into the existing tracked root, or store the
    /// new one.
    async fn process_root_submission(&self, ar: &AnalysisRequest) -> CoreResult<RootAnalysis> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut target_root = match self.analysis_tracking.get_root_analysis(&ar.root.uuid).await? {
                Some(mut existing) => {
                    existing.apply_merge(&ar.root)?;
                    existing
                },
                None => {
                    let mut fresh = ar.root.clone();
                    fresh.version = None;
                    fresh
                },
            };

            if self.analysis_tracking.track_root_analysis(&mut target_root).await? {
                self.events
                    .fire_event(
                        EVENT_PROCESSING_REQUEST_ROOT,
                        json!({ "request_id": ar.id, "root": target_root.uuid }),
                    )
                    .await;
                return Ok(target_root);
            }

            tracing::debug!("version mismatch for {} during processing", target_root.uuid);
        }

        Err(CoreError::Internal(format!(
            "exceeded {} root update attempts submitting {}",
            MAX_UPDATE_ATTEMPTS, ar
        )))
    }

    /// The observables this request puts up for dispatch: the analyzed
    /// observable plus anything its analysis discovered for results, every
    /// observable in the root for root submissions.
    fn request_observables(&self, ar: &AnalysisRequest, target_root: &RootAnalysis) -> Vec<String> {
        if ar.is_observable_analysis_result() {
            let Some(key) = ar.observable_key() else {
                return Vec::new();
            };
            let Some(target_observable) = target_root.find_observable(&key) else {
                return Vec::new();
            };

            let mut uuids = Vec::new();
            if let Some(amt) = &ar.module_type {
                if let Some(analysis) = target_observable.get_analysis(&amt.name) {
                    uuids.extend(analysis.observable_ids.iter().cloned());
                }
            }
            uuids.push(target_observable.uuid.clone());
            uuids
        } else {
            target_root.all_observable_uuids()
        }
    }

    /// The common dispatch tail: raise an alert when detection points have
    /// accumulated, then for every accepting (observable, module) pair
    /// either link to an in-flight request, replay a cached result, or
    /// enqueue new work.
    async fn dispatch(&self, ar: &AnalysisRequest, target_root: &mut RootAnalysis) -> CoreResult<()> {
        if !target_root.analysis_cancelled && target_root.has_detections() {
            self.alerts.submit_alert(&target_root.uuid).await?;
        }

        // a cancelled root still merges in-flight results but dispatches
        // nothing further
        if target_root.analysis_cancelled {
            return Ok(());
        }

        let registered = self.registry.get_analysis_module_type_map().await?;
        let mut amts: Vec<AnalysisModuleType> = registered.values().cloned().collect();
        amts.sort_by(|a, b| a.name.cmp(&b.name));

        for observable_uuid in self.request_observables(ar, target_root) {
            for amt in &amts {
                let Some(observable) = target_root.get_observable(&observable_uuid) else {
                    continue;
                };
                let observable = observable.clone();

                if !amt.accepts(&observable, target_root, &registered) {
                    continue;
                }

                if observable.analysis_completed(&amt.name) {
                    continue;
                }

                if observable.get_analysis_request_id(&amt.name).is_some() {
                    continue;
                }

                // is another root already analyzing this observable? (always
                // None for uncachable module types)
                let tracked = self
                    .request_tracking
                    .get_analysis_request_by_observable(&observable, amt)
                    .await?;

                let mut new_ar =
                    AnalysisRequest::observable_request(target_root.clone(), &observable_uuid, amt.clone());
                self.request_tracking.track_analysis_request(&new_ar).await?;

                if let Some(tracked) = tracked.filter(|t| t.id != ar.id) {
                    if self
                        .request_tracking
                        .link_analysis_requests(&tracked.id, &new_ar.id)
                        .await?
                    {
                        // this pair now waits for the in-flight request
                        self.persist_request_tracking(target_root, &observable_uuid, &amt.name, &new_ar.id)
                            .await?;
                        continue;
                    }

                    // the candidate was locked, completed or deleted before
                    // we could link to it; the result may be in the cache
                }

                if let Some(cached) = self.cache.get_cached_analysis_result(&observable, amt).await? {
                    tracing::debug!(
                        "using cached result for {} type {} in {}",
                        observable,
                        amt,
                        target_root.uuid
                    );

                    new_ar.original_root = cached.original_root;
                    new_ar.modified_root = cached.modified_root;
                    new_ar.cache_hit = true;
                    self.request_tracking.track_analysis_request(&new_ar).await?;
                    self.persist_request_tracking(target_root, &observable_uuid, &amt.name, &new_ar.id)
                        .await?;
                    self.events
                        .fire_event(
                            EVENT_CACHE_HIT,
                            json!({ "root": target_root.uuid, "request_id": new_ar.id }),
                        )
                        .await;

                    // merge the cached delta into this root synchronously
                    self.process_inner(new_ar).await?;

                    let fresh = self
                        .analysis_tracking
                        .get_root_analysis(&target_root.uuid)
                        .await?
                        .ok_or_else(|| CoreError::UnknownRootAnalysis(target_root.uuid.clone()))?;
                    *target_root = fresh;
                    continue;
                }

                tracing::info!(
                    "creating new analysis request for observable {} type {} root {}",
                    observable,
                    amt,
                    target_root.uuid
                );
                self.persist_request_tracking(target_root, &observable_uuid, &amt.name, &new_ar.id)
                    .await?;
                self.events
                    .fire_event(EVENT_PROCESSING_REQUEST_OBSERVABLE, json!({ "request_id": new_ar.id }))
                    .await;
                self.submit_analysis_request(new_ar).await?;
            }
        }

        Ok(())
    }

    /// Records the request id on the observable and persists the root,
    /// reloading and re-applying on version mismatch.
    async fn persist_request_tracking(
        &self,
        target_root: &mut RootAnalysis,
        observable_uuid: &str,
        module_name: &str,
        request_id: &str,
    ) -> CoreResult<()> {
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            target_root.track_analysis_request_on(observable_uuid, module_name, request_id)?;
            if self.analysis_tracking.update_root_analysis(target_root).await? {
                return Ok(());
            }

            let fresh = self
                .analysis_tracking
                .get_root_analysis(&target_root.uuid)
                .await?
                .ok_or_else(|| CoreError::UnknownRootAnalysis(target_root.uuid.clone()))?;
            *target_root = fresh;
        }

        Err(CoreError::Internal(format!(
            "exceeded {} root update attempts tracking request {}",
            MAX_UPDATE_ATTEMPTS, request_id
        )))
    }

    //
    // worker entry points
    //

    /// The worker entry point: claim the next request for the module type.
    /// A worker presenting a stale version or extended version is refused
    /// and must upgrade before it is handed work.
    pub async fn get_next_analysis_request(
        &self,
        owner: &str,
        amt: &AnalysisModuleType,
        timeout: Duration,
    ) -> CoreResult<Option<AnalysisRequest>> {
        if let Some(existing) = self.registry.get_analysis_module_type(&amt.name).await? {
            if !existing.version_matches(amt) {
                tracing::info!("module type {} version mismatch against {}", amt, existing);
                return Err(CoreError::AnalysisModuleTypeVersion(
                    amt.name.clone(),
                    amt.version.clone(),
                    existing.version.clone(),
                ));
            }

            if !existing.extended_version_matches(amt) {
                tracing::info!("module type {} extended version mismatch against {}", amt, existing);
                return Err(CoreError::AnalysisModuleTypeExtendedVersion(amt.name.clone()));
            }
        }

        // return module-expired unclaimed requests to the queues first
        self.process_expired_analysis_requests().await?;

        loop {
            let Some(next) = self.work_queues.get_work(&amt.name, timeout).await? else {
                return Ok(None);
            };

            // re-fetch the tracked record: the request may have been deleted
            // while it sat in the queue
            let Some(mut tracked) = self
                .request_tracking
                .get_analysis_request_by_request_id(&next.id)
                .await?
            else {
                tracing::warn!("request {} from work queue for {} is no longer tracked", next.id, amt.name);
                continue;
            };

            tracked.owner = Some(owner.to_string());
            tracked.status = RequestStatus::Analyzing;
            self.request_tracking.track_analysis_request(&tracked).await?;
            tracing::debug!("assigned analysis request {} to {}", tracked.id, owner);
            self.events
                .fire_event(EVENT_WORK_ASSIGNED, json!({ "request_id": tracked.id, "owner": owner }))
                .await;
            return Ok(Some(tracked));
        }
    }

    /// Returns every module-expired, unlocked request to its queue,
    /// preserving request ids. Serialized under a named lock so only one
    /// caller at a time scans.
    pub async fn process_expired_analysis_requests(&self) -> CoreResult<()> {
        let sweep_owner = Uuid::new_v4().to_string();
        if !self
            .locks
            .acquire(EXPIRED_SWEEP_LOCK, &sweep_owner, chrono::Duration::seconds(60))
            .await?
        {
            // someone else is already sweeping
            return Ok(());
        }

        let swept = self.sweep_expired(&sweep_owner).await;

        if let Err(error) = self.locks.release(EXPIRED_SWEEP_LOCK, &sweep_owner).await {
            tracing::warn!("failed to release expired request sweep lock: {}", error);
        }

        swept
    }

    async fn sweep_expired(&self, sweep_owner: &str) -> CoreResult<()> {
        for request in self.request_tracking.get_expired_analysis_requests().await? {
            if !self
                .request_tracking
                .lock_analysis_request(&request.id, sweep_owner)
                .await?
            {
                continue;
            }

            tracing::info!("returning expired analysis request {} to the queue", request.id);
            self.events.fire_event(EVENT_AR_EXPIRED, json!(request.id)).await;

            // re-submission changes the status which takes the request out
            // of expiration; submit also clears the lock we just took
            match self.submit_analysis_request(request.clone()).await {
                Ok(_) => {},
                Err(CoreError::UnknownAnalysisModuleType(_)) | Err(CoreError::InvalidWorkQueue(_)) => {
                    // the module type is gone; the request goes with it
                    self.request_tracking.delete_analysis_request(&request.id).await?;
                },
                Err(error) => {
                    self.request_tracking.force_unlock_analysis_request(&request.id).await?;
                    return Err(error);
                },
            }
        }

        Ok(())
    }
}
