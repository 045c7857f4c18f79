use std::time::{Duration, Instant};

mod common;

use flock::prelude::*;

// Load test configuration.
const VUS: usize = 2;
const REQUEST_DELAY: Duration = Duration::from_millis(10);

#[test]
// Each virtual user loops for the whole duration.
fn test_duration() {
    let client = common::FixedClient::new(REQUEST_DELAY, 200);
    let configuration = common::build_configuration(vec!["--vus", "2", "--duration", "1"]);

    let started = Instant::now();
    let stats = common::run_load_test(common::build_load_test(configuration, client.clone()));
    let elapsed = started.elapsed();

    // Two users sleeping 10ms per request make about 200 requests in one second.
    assert!(
        (100..=210).contains(&stats.count()),
        "unexpected request count: {}",
        stats.count()
    );
    assert_eq!(stats.count(), client.requests());
    assert_eq!(stats.fail_count(), 0);
    assert_eq!(stats.error_count(), 0);
    assert_eq!(stats.vus, VUS);

    // The run stops close to the requested duration.
    assert!(stats.duration >= Duration::from_secs(1));
    assert!(stats.duration < Duration::from_millis(1_500));
    assert!(elapsed < Duration::from_secs(3));
    assert!(stats.started.is_some());
    assert!(stats.stopped.is_some());
}

#[test]
// The iteration budget is shared by all virtual users.
fn test_iterations() {
    let client = common::FixedClient::new(Duration::from_millis(1), 200);
    let configuration = common::build_configuration(vec!["--vus", "4", "--iterations", "50"]);

    let stats = common::run_load_test(common::build_load_test(configuration, client.clone()));

    assert_eq!(stats.count(), 50);
    assert_eq!(client.requests(), 50);
    assert_eq!(stats.total.success_count, 50);
}

#[test]
// Fewer iterations than virtual users.
fn test_iterations_fewer_than_vus() {
    let client = common::FixedClient::new(Duration::ZERO, 200);
    let configuration = common::build_configuration(vec!["--vus", "4", "--iterations", "2"]);

    let stats = common::run_load_test(common::build_load_test(configuration, client.clone()));

    assert_eq!(stats.count(), 2);
    assert_eq!(client.requests(), 2);
    assert_eq!(stats.vus, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
// All virtual users are running until the load test stops.
async fn test_active_users() {
    let client = common::FixedClient::new(REQUEST_DELAY, 200);
    let configuration = common::build_configuration(vec!["--vus", "3", "--duration", "1"]);

    let run = common::build_load_test(configuration, client)
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(run.active_users(), 3);

    // Snapshots can be taken while the load test runs.
    let aggregator = run.aggregator();
    assert!(aggregator.snapshot().count() > 0);

    let stats = run.wait().await.unwrap();

    // Once stopped, snapshots no longer change and match the final stats.
    let first = aggregator.snapshot();
    let second = aggregator.snapshot();
    assert_eq!(first, second);
    assert_eq!(first.total, stats.total);
    assert_eq!(first.requests, stats.requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
// A running load test can be stopped early.
async fn test_stop() {
    let client = common::FixedClient::new(REQUEST_DELAY, 200);
    let configuration = common::build_configuration(vec!["--vus", "2", "--duration", "60s"]);

    let run = common::build_load_test(configuration, client)
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    run.stop();
    let stats = run.wait().await.unwrap();

    assert!(stats.count() > 0);
    assert!(stats.duration < Duration::from_secs(2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
// Dropping the handle stops the virtual users.
async fn test_drop_stops_users() {
    let client = common::FixedClient::new(REQUEST_DELAY, 200);
    let configuration = common::build_configuration(vec!["--vus", "2", "--duration", "60s"]);

    let run = common::build_load_test(configuration, client.clone())
        .start()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(run);

    // Requests in flight when the handle was dropped may still complete.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let requests = client.requests();
    assert!(requests > 0);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.requests(), requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
// Running metrics are printed while the load test keeps running.
async fn test_running_metrics() {
    let client = common::FixedClient::new(REQUEST_DELAY, 200);
    let configuration = common::build_configuration(vec![
        "--vus",
        "2",
        "--duration",
        "2",
        "--running-metrics",
        "1",
    ]);

    let run = common::build_load_test(configuration, client)
        .start()
        .await
        .unwrap();
    assert_eq!(run.run_config().running_metrics, Some(Duration::from_secs(1)));
    tokio::time::sleep(Duration::from_millis(500)).await;

    let running = run.snapshot();
    assert!(running.count() > 0);
    assert_eq!(running.vus, 2);
    assert!(running.duration >= Duration::from_millis(500));
    assert!(running.started.is_some());
    assert!(running.stopped.is_none());

    let stats = run.wait().await.unwrap();
    assert!(stats.count() > running.count());
    assert!(stats.duration >= Duration::from_secs(2));
    assert_eq!(stats.started, running.started);
    assert!(stats.stopped.is_some());
}

#[test]
// Requests still running when the grace period ends are aborted and not recorded.
fn test_grace_period_aborts() {
    let client = common::FixedClient::new(Duration::from_secs(10), 200);
    let configuration = common::build_configuration(vec![
        "--vus",
        "2",
        "--duration",
        "500ms",
        "--timeout",
        "30s",
        "--grace-period",
        "200ms",
    ]);

    let started = Instant::now();
    let stats = common::run_load_test(common::build_load_test(configuration, client.clone()));

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(client.requests(), 2);
    assert_eq!(stats.count(), 0);
}

#[test]
// Requests that finish within the grace period are recorded.
fn test_grace_period_completes() {
    let client = common::FixedClient::new(Duration::from_millis(700), 200);
    let configuration = common::build_configuration(vec![
        "--vus",
        "2",
        "--duration",
        "300ms",
        "--grace-period",
        "3s",
    ]);

    let started = Instant::now();
    let stats = common::run_load_test(common::build_load_test(configuration, client.clone()));

    assert!(started.elapsed() < Duration::from_millis(2_500));
    assert_eq!(client.requests(), 2);
    assert_eq!(stats.count(), 2);
    assert_eq!(stats.total.success_count, 2);
}

#[test]
// A request slower than the timeout is recorded as a timeout.
fn test_request_timeout() {
    let client = common::FixedClient::new(Duration::from_secs(5), 200);
    let configuration = common::build_configuration(vec![
        "--iterations",
        "3",
        "--timeout",
        "50ms",
    ]);

    let stats = common::run_load_test(common::build_load_test(configuration, client));

    assert_eq!(stats.count(), 3);
    assert_eq!(stats.error_count(), 3);
    assert_eq!(stats.total.error_counts.get(&RequestErrorKind::Timeout), Some(&3));
}
