use serde_json::json;

use crate::models::RootAnalysis;
use crate::tests::common::{cachable_amt, create_test_context, test_amt};
use crate::utils::CoreError;

#[tokio::test]
async fn test_register_and_get() {
    let ctx = create_test_context().await;
    let amt = test_amt("scanner");
    ctx.register(&amt).await;

    let registered = ctx
        .state
        .registry
        .get_analysis_module_type("scanner")
        .await
        .expect("lookup failed")
        .expect("module type missing");
    assert_eq!(registered.name, "scanner");
    assert_eq!(registered.observable_types, vec!["test".to_string()]);

    // registration creates the work queue
    assert!(ctx.state.work_queues.has_work_queue("scanner"));

    let all = ctx
        .state
        .registry
        .get_all_analysis_module_types()
        .await
        .expect("listing failed");
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_unknown_dependency_refused() {
    let ctx = create_test_context().await;
    let mut amt = test_amt("dependent");
    amt.dependencies = vec!["no_such_module".to_string()];

    let result = ctx.state.registry.register_analysis_module_type(&amt).await;
    assert!(matches!(result, Err(CoreError::InvalidModuleDependency(..))));
}

#[tokio::test]
async fn test_circular_dependency_refused() {
    let ctx = create_test_context().await;

    let amt_a = test_amt("module_a");
    ctx.register(&amt_a).await;

    let mut amt_b = test_amt("module_b");
    amt_b.dependencies = vec!["module_a".to_string()];
    ctx.register(&amt_b).await;

    // re-registering a with a dependency on b closes the loop
    let mut amt_a_looped = test_amt("module_a");
    amt_a_looped.dependencies = vec!["module_b".to_string()];
    let result = ctx.state.registry.register_analysis_module_type(&amt_a_looped).await;
    assert!(matches!(result, Err(CoreError::CircularDependency(_))));

    // a self dependency fails the same way once the module exists
    let amt_self = test_amt("module_self");
    ctx.register(&amt_self).await;

    let mut amt_self_looped = test_amt("module_self");
    amt_self_looped.dependencies = vec!["module_self".to_string()];
    let result = ctx.state.registry.register_analysis_module_type(&amt_self_looped).await;
    assert!(matches!(result, Err(CoreError::CircularDependency(_))));

    // a self dependency on a module that was never registered trips the
    // dependency-existence check instead
    let mut amt_unknown = test_amt("module_unknown");
    amt_unknown.dependencies = vec!["module_unknown".to_string()];
    let result = ctx.state.registry.register_analysis_module_type(&amt_unknown).await;
    assert!(matches!(result, Err(CoreError::InvalidModuleDependency(..))));
}

#[tokio::test]
async fn test_reregistration_overwrites() {
    let ctx = create_test_context().await;
    let amt = test_amt("scanner");
    ctx.register(&amt).await;

    let mut updated = test_amt("scanner");
    updated.version = "2.0.0".to_string();
    ctx.register(&updated).await;

    let registered = ctx
        .state
        .registry
        .get_analysis_module_type("scanner")
        .await
        .expect("lookup failed")
        .expect("module type missing");
    assert_eq!(registered.version, "2.0.0");
}

// deleting a module type removes its queue, its tracked requests and its
// cached results
#[tokio::test]
async fn test_delete_module_type_cascades() {
    let ctx = create_test_context().await;
    let amt = cachable_amt("doomed");
    ctx.register(&amt).await;

    // produce a cached result and a fresh tracked request
    let mut root_1 = RootAnalysis::new();
    root_1.add_observable("test", "x", None);
    ctx.submit_root(root_1).await;
    let request = ctx.claim_work("worker-1", &amt).await.expect("expected work");
    ctx.complete_request(request, &amt, json!({"k": "v"}), &[])
        .await
        .expect("result processing failed");
    assert_eq!(ctx.state.cache.get_cache_size(Some("doomed")).await.expect("cache size"), 1);

    let mut root_2 = RootAnalysis::new();
    root_2.add_observable("test", "y", None);
    let root_2_uuid = root_2.uuid.clone();
    ctx.submit_root(root_2).await;
    assert_eq!(ctx.queue_size(&amt).await, 1);

    assert!(ctx
        .state
        .registry
        .delete_analysis_module_type("doomed")
        .await
        .expect("deletion failed"));

    assert!(ctx
        .state
        .registry
        .get_analysis_module_type("doomed")
        .await
        .expect("lookup failed")
        .is_none());
    assert_eq!(ctx.state.cache.get_cache_size(Some("doomed")).await.expect("cache size"), 0);

    let outstanding = ctx
        .state
        .request_tracking
        .get_analysis_requests_by_root(&root_2_uuid)
        .await
        .expect("request lookup failed");
    assert!(outstanding.iter().all(|r| r.module_type.as_ref().map(|t| t.name.as_str()) != Some("doomed")));

    // the work queue is gone with the registration
    let result = ctx.state.work_queues.get_queue_size("doomed").await;
    assert!(matches!(result, Err(CoreError::InvalidWorkQueue(_))));
}

#[tokio::test]
async fn test_delete_unknown_module_type() {
    let ctx = create_test_context().await;
    assert!(!ctx
        .state
        .registry
        .delete_analysis_module_type("never_registered")
        .await
        .expect("deletion failed"));
}
