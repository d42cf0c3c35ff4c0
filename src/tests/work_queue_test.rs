use std::time::Duration;

use crate::models::{AnalysisRequest, RootAnalysis};
use crate::tests::common::{create_test_context, test_amt};
use crate::utils::CoreError;

fn queueable_request(amt: &crate::models::AnalysisModuleType, value: &str) -> AnalysisRequest {
    let mut root = RootAnalysis::new();
    let obs = root.add_observable("test", value, None);
    AnalysisRequest::observable_request(root, &obs, amt.clone())
}

#[tokio::test]
async fn test_fifo_ordering() {
    let ctx = create_test_context().await;
    let amt = test_amt("ordered");
    ctx.register(&amt).await;

    let first = queueable_request(&amt, "1");
    let second = queueable_request(&amt, "2");
    let third = queueable_request(&amt, "3");

    for request in [&first, &second, &third] {
        ctx.state
            .work_queues
            .put_work("ordered", request.clone())
            .await
            .expect("put failed");
    }

    assert_eq!(ctx.queue_size(&amt).await, 3);

    for expected in [&first, &second, &third] {
        let popped = ctx
            .state
            .work_queues
            .get_work("ordered", Duration::ZERO)
            .await
            .expect("get failed")
            .expect("queue drained early");
        assert_eq!(popped.id, expected.id);
    }

    assert_eq!(ctx.queue_size(&amt).await, 0);
}

#[tokio::test]
async fn test_zero_timeout_returns_immediately() {
    let ctx = create_test_context().await;
    let amt = test_amt("empty");
    ctx.register(&amt).await;

    let result = ctx
        .state
        .work_queues
        .get_work("empty", Duration::ZERO)
        .await
        .expect("get failed");
    assert!(result.is_none());
}

#[tokio::test]
async fn test_unknown_queue_is_refused() {
    let ctx = create_test_context().await;
    let amt = test_amt("never_created");

    let request = queueable_request(&amt, "x");
    let result = ctx.state.work_queues.put_work("never_created", request).await;
    assert!(matches!(result, Err(CoreError::InvalidWorkQueue(_))));

    let result = ctx.state.work_queues.get_work("never_created", Duration::ZERO).await;
    assert!(matches!(result, Err(CoreError::InvalidWorkQueue(_))));

    let result = ctx.state.work_queues.get_queue_size("never_created").await;
    assert!(matches!(result, Err(CoreError::InvalidWorkQueue(_))));
}

#[tokio::test]
async fn test_blocking_get_wakes_on_put() {
    let ctx = create_test_context().await;
    let amt = test_amt("blocking");
    ctx.register(&amt).await;

    let work_queues = ctx.state.work_queues.clone();
    let request = queueable_request(&amt, "x");
    let expected_id = request.id.clone();

    let getter = tokio::spawn(async move {
        work_queues.get_work("blocking", Duration::from_secs(5)).await
    });

    // give the getter a chance to block first
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.state
        .work_queues
        .put_work("blocking", request)
        .await
        .expect("put failed");

    let popped = getter
        .await
        .expect("getter panicked")
        .expect("get failed")
        .expect("timed out waiting for work");
    assert_eq!(popped.id, expected_id);
}

#[tokio::test]
async fn test_blocking_get_times_out() {
    let ctx = create_test_context().await;
    let amt = test_amt("quiet");
    ctx.register(&amt).await;

    let started = std::time::Instant::now();
    let result = ctx
        .state
        .work_queues
        .get_work("quiet", Duration::from_millis(100))
        .await
        .expect("get failed");
    assert!(result.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn test_delete_queue_discards_work() {
    let ctx = create_test_context().await;
    let amt = test_amt("doomed");
    ctx.register(&amt).await;

    ctx.state
        .work_queues
        .put_work("doomed", queueable_request(&amt, "x"))
        .await
        .expect("put failed");

    assert!(ctx.state.work_queues.delete_work_queue("doomed").await);
    assert!(!ctx.state.work_queues.has_work_queue("doomed"));

    // recreating yields an empty queue
    assert!(ctx.state.work_queues.add_work_queue("doomed").await);
    assert_eq!(ctx.queue_size(&amt).await, 0);
}
