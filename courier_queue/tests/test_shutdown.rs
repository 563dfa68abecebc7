mod common;

use std::time::Duration;

use common::*;

#[tokio::test(start_paused = true)]
async fn graceful_stop_flushes_the_partial_batch() {
    let client = MockWriteClient::new();
    let mut options = test_options();
    // The partial batch must only move because stop flushes it.
    options.batch_send_deadline = Duration::from_secs(3600);
    let manager = new_manager(options, client.clone());
    seed_series(&manager, 1);
    manager.start().await;

    let records: Vec<_> = (0..7).map(|t| sample(0, t, 1.0)).collect();
    assert!(manager.append_samples(&records).await);

    manager.stop().await;

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.samples_sent, 7);
    assert_eq!(snapshot.samples_failed, 0);
    assert_eq!(snapshot.pending_samples, 0);
    assert_eq!(snapshot.samples_dropped_on_hard_shutdown, 0);

    let sizes: Vec<usize> = client
        .requests()
        .iter()
        .map(|request| request.v1.as_ref().unwrap().timeseries.len())
        .collect();
    assert_eq!(sizes, vec![5, 2]);
}

#[tokio::test(start_paused = true)]
async fn hard_stop_abandons_what_a_dead_endpoint_never_took() {
    let client = MockWriteClient::new();
    client.fail_by_default();
    let mut options = test_options();
    options.capacity = 20;
    options.batch_send_deadline = Duration::from_secs(3600);
    options.flush_deadline = Duration::from_millis(200);
    let manager = new_manager(options, client.clone());
    seed_series(&manager, 1);
    manager.start().await;

    // Two full batches plus a partial one; the first batch sits in an
    // endless retry loop against the failing endpoint.
    let records: Vec<_> = (0..12).map(|t| sample(0, t, 1.0)).collect();
    assert!(manager.append_samples(&records).await);

    wait_until("first batch is being retried", || {
        manager.metrics().snapshot().samples_retried > 0
    })
    .await;

    manager.stop().await;

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.samples_sent, 0);
    assert_eq!(snapshot.pending_samples, 0);
    // The in-flight batch was cancelled, not failed; everything still
    // queued behind it was dropped.
    assert_eq!(snapshot.samples_failed, 7);
    assert_eq!(snapshot.samples_dropped_on_hard_shutdown, 7);
}

#[tokio::test(start_paused = true)]
async fn appends_report_shutdown_to_the_reader() {
    let client = MockWriteClient::new();
    let manager = new_manager(test_options(), client.clone());
    manager.start().await;
    manager.stop().await;

    // A series stored after stop still resolves, so the append reaches the
    // refused enqueue and observes the shutdown signal there.
    seed_series(&manager, 1);
    assert!(!manager.append_samples(&[sample(0, 1, 1.0)]).await);
}
