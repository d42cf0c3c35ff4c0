use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::module_type::AnalysisModuleType;
use super::observable::{Observable, ObservableKey};
use super::root::RootAnalysis;

/// Lifecycle status of an analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    New,
    Queued,
    Analyzing,
    Processing,
    Finished,
    Expired,
}

/// Deterministic fingerprint of an (observable, module) pair used to dedup
/// in-flight work and share cached results. None when the module type is not
/// cachable. The fingerprint does not depend on the ordering of the
/// extended version entries.
pub fn generate_cache_key(observable: &Observable, amt: &AnalysisModuleType) -> Option<String> {
    amt.cache_ttl?;

    let mut extended = amt.extended_version.clone();
    extended.sort();

    let mut hasher = Sha256::new();
    hasher.update(observable.observable_type.as_bytes());
    hasher.update(b"\x00");
    hasher.update(observable.value.as_bytes());
    hasher.update(b"\x00");
    if let Some(time) = observable.time {
        hasher.update(time.to_rfc3339().as_bytes());
    }
    hasher.update(b"\x00");
    hasher.update(amt.name.as_bytes());
    hasher.update(b"\x00");
    hasher.update(amt.version.as_bytes());
    for entry in extended {
        hasher.update(b"\x00");
        hasher.update(entry.as_bytes());
    }

    Some(hex::encode(hasher.finalize()))
}

/// A unit of work: either a whole root submitted for processing, a request
/// to run one module against one observable, or (once a worker has filled in
/// the `original_root`/`modified_root` pair) the result of that work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub id: String,
    /// The root this request belongs to or is entirely about.
    pub root: RootAnalysis,
    /// The observable to analyze (uuid in `root`); None for root requests.
    #[serde(default)]
    pub observable_id: Option<String>,
    /// The module type to execute; None for root requests.
    #[serde(rename = "type", default)]
    pub module_type: Option<AnalysisModuleType>,
    /// None for root requests and for uncachable module types.
    #[serde(default)]
    pub cache_key: Option<String>,
    /// True when this request was satisfied from the result cache.
    #[serde(default)]
    pub cache_hit: bool,
    pub status: RequestStatus,
    /// The worker that claimed this request.
    #[serde(default)]
    pub owner: Option<String>,
    /// Snapshot of the root the worker started from.
    #[serde(default)]
    pub original_root: Option<RootAnalysis>,
    /// The worker's copy carrying its changes; together with
    /// `original_root` this forms the delta merged into the tracked root.
    #[serde(default)]
    pub modified_root: Option<RootAnalysis>,
}

impl AnalysisRequest {
    /// A request to process (or re-process) an entire root.
    pub fn root_request(root: RootAnalysis) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            root,
            observable_id: None,
            module_type: None,
            cache_key: None,
            cache_hit: false,
            status: RequestStatus::New,
            owner: None,
            original_root: None,
            modified_root: None,
        }
    }

    /// A request to analyze one observable with one module type.
    pub fn observable_request(
        root: RootAnalysis,
        observable_uuid: &str,
        amt: AnalysisModuleType,
    ) -> Self {
        let cache_key = root
            .get_observable(observable_uuid)
            .and_then(|observable| generate_cache_key(observable, &amt));

        Self {
            id: Uuid::new_v4().to_string(),
            root,
            observable_id: Some(observable_uuid.to_string()),
            module_type: Some(amt),
            cache_key,
            cache_hit: false,
            status: RequestStatus::New,
            owner: None,
            original_root: None,
            modified_root: None,
        }
    }

    pub fn is_root_analysis_request(&self) -> bool {
        self.observable_id.is_none()
    }

    pub fn is_observable_analysis_request(&self) -> bool {
        self.observable_id.is_some()
    }

    /// True once the request carries a result delta.
    pub fn is_observable_analysis_result(&self) -> bool {
        self.is_observable_analysis_request() && self.modified_root.is_some()
    }

    pub fn is_cachable(&self) -> bool {
        self.cache_key.is_some()
    }

    /// The observable this request is about, in the embedded root.
    pub fn observable(&self) -> Option<&Observable> {
        self.observable_id.as_ref().and_then(|uuid| self.root.get_observable(uuid))
    }

    pub fn observable_key(&self) -> Option<ObservableKey> {
        self.observable().map(|o| o.key())
    }

    /// Prepares this request to receive results: both sides of the delta
    /// start as copies of the root as the worker sees it.
    pub fn initialize_result(&mut self) {
        self.original_root = Some(self.root.clone());
        self.modified_root = Some(self.root.clone());
    }

    /// The uuid of the observable to record results on, inside
    /// `modified_root`. The worker stores its analysis there.
    pub fn modified_observable_uuid(&self) -> Option<String> {
        let key = self.observable_key()?;
        self.modified_root
            .as_ref()
            .and_then(|root| root.find_observable(&key))
            .map(|o| o.uuid.clone())
    }
}

impl PartialEq for AnalysisRequest {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AnalysisRequest {}

impl std::fmt::Display for AnalysisRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_observable_analysis_result() {
            "result"
        } else if self.is_root_analysis_request() {
            "root"
        } else {
            "request"
        };

        write!(f, "AnalysisRequest({},id={},root={})", kind, self.id, self.root.uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cachable_amt(name: &str) -> AnalysisModuleType {
        let mut amt = AnalysisModuleType::new(name);
        amt.cache_ttl = Some(600);
        amt
    }

    #[test]
    fn test_cache_key_none_without_ttl() {
        let amt = AnalysisModuleType::new("uncachable");
        let obs = Observable::new("test", "test", None);
        assert!(generate_cache_key(&obs, &amt).is_none());
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let amt = cachable_amt("hash");
        let a = Observable::new("sha256", "abc", None);
        let b = Observable::new("sha256", "abc", None);
        assert_eq!(generate_cache_key(&a, &amt), generate_cache_key(&b, &amt));
    }

    #[test]
    fn test_cache_key_varies_by_inputs() {
        let amt = cachable_amt("hash");
        let a = Observable::new("sha256", "abc", None);
        let b = Observable::new("sha256", "abd", None);
        let c = Observable::new("md5", "abc", None);
        assert_ne!(generate_cache_key(&a, &amt), generate_cache_key(&b, &amt));
        assert_ne!(generate_cache_key(&a, &amt), generate_cache_key(&c, &amt));

        let mut newer = cachable_amt("hash");
        newer.version = "2.0.0".to_string();
        assert_ne!(generate_cache_key(&a, &amt), generate_cache_key(&a, &newer));

        let other_module = cachable_amt("other");
        assert_ne!(generate_cache_key(&a, &amt), generate_cache_key(&a, &other_module));
    }

    #[test]
    fn test_cache_key_ignores_extended_version_order() {
        let obs = Observable::new("file", "deadbeef", None);

        let mut a = cachable_amt("yara");
        a.extended_version = vec!["rules:1".to_string(), "config:2".to_string()];
        let mut b = cachable_amt("yara");
        b.extended_version = vec!["config:2".to_string(), "rules:1".to_string()];

        assert_eq!(generate_cache_key(&obs, &a), generate_cache_key(&obs, &b));

        let mut c = cachable_amt("yara");
        c.extended_version = vec!["rules:2".to_string(), "config:2".to_string()];
        assert_ne!(generate_cache_key(&obs, &a), generate_cache_key(&obs, &c));
    }

    #[test]
    fn test_cache_key_distinguishes_time() {
        let amt = cachable_amt("hash");
        let a = Observable::new("test", "x", None);
        let b = Observable::new("test", "x", Some(chrono::Utc::now()));
        assert_ne!(generate_cache_key(&a, &amt), generate_cache_key(&b, &amt));
    }

    #[test]
    fn test_request_kinds() {
        let mut root = RootAnalysis::new();
        let obs = root.add_observable("test", "test", None);

        let root_request = AnalysisRequest::root_request(root.clone());
        assert!(root_request.is_root_analysis_request());
        assert!(!root_request.is_observable_analysis_request());
        assert!(!root_request.is_observable_analysis_result());
        assert!(root_request.cache_key.is_none());

        let mut request = AnalysisRequest::observable_request(root, &obs, cachable_amt("test"));
        assert!(request.is_observable_analysis_request());
        assert!(!request.is_observable_analysis_result());
        assert!(request.is_cachable());

        request.initialize_result();
        assert!(request.is_observable_analysis_result());
        assert!(request.modified_observable_uuid().is_some());
    }

    #[test]
    fn test_request_round_trip() {
        let mut root = RootAnalysis::new();
        let obs = root.add_observable("test", "test", None);
        let mut request = AnalysisRequest::observable_request(root, &obs, cachable_amt("test"));
        request.status = RequestStatus::Queued;
        request.owner = Some("worker-1".to_string());
        request.initialize_result();

        let json = serde_json::to_string(&request).unwrap();
        let restored: AnalysisRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id, request.id);
        assert_eq!(restored.status, RequestStatus::Queued);
        assert_eq!(restored.owner, request.owner);
        assert_eq!(restored.cache_key, request.cache_key);
        assert!(restored.is_observable_analysis_result());
    }
}
