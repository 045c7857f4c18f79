use httpmock::{Method::GET, MockServer};

mod common;

use flock::prelude::*;

// Paths used in load tests performed during these tests.
const INDEX_PATH: &str = "/";
const USER_PATH: &str = "/user/0";

#[test]
// Every request renders a fresh {rnd} query parameter.
fn test_rnd_placeholder() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH).query_param_exists("rnd");
        then.status(200).body("ok");
    });

    let url = format!("{}/?rnd={{rnd}}", server.base_url());
    let configuration = common::build_configuration(vec!["--url", &url, "--iterations", "10"]);
    let stats = common::run_load_test(LoadTest::initialize_with_config(configuration).unwrap());

    index.assert_calls(10);
    assert_eq!(stats.count(), 10);
    assert_eq!(stats.total.success_count, 10);
    assert_eq!(stats.total.status_code_counts.get(&200), Some(&10));
    assert_eq!(stats.total.bytes_received, 20);

    // Requests are named after the url template.
    assert!(stats.requests.contains_key(&url));
}

#[test]
// The {vu} placeholder renders the virtual user id.
fn test_vu_placeholder() {
    let server = MockServer::start();
    let user = server.mock(|when, then| {
        when.method(GET).path(USER_PATH);
        then.status(200);
    });

    let url = format!("{}/user/{{vu}}", server.base_url());
    let configuration = common::build_configuration(vec!["--url", &url, "--iterations", "3"]);
    let stats = common::run_load_test(LoadTest::initialize_with_config(configuration).unwrap());

    user.assert_calls(3);
    assert_eq!(stats.fail_count(), 0);
}

#[test]
// Headers are sent with every request.
fn test_headers() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH).header("x-flock", "yes");
        then.status(200);
    });

    let url = format!("{}/", server.base_url());
    let configuration = common::build_configuration(vec![
        "--url",
        &url,
        "--header",
        "X-Flock: yes",
        "--iterations",
        "4",
    ]);
    let stats = common::run_load_test(LoadTest::initialize_with_config(configuration).unwrap());

    index.assert_calls(4);
    assert_eq!(stats.total.success_count, 4);
}

#[test]
// With an error rate of 1 every request asks the server to fail.
fn test_error_rate() {
    let server = MockServer::start();
    let fail = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH).query_param("err", "1");
        then.status(500);
    });

    let url = format!("{}/?rnd={{rnd}}", server.base_url());
    let configuration = common::build_configuration(vec![
        "--url",
        &url,
        "--iterations",
        "5",
        "--error-rate",
        "1",
    ]);
    let stats = common::run_load_test(LoadTest::initialize_with_config(configuration).unwrap());

    fail.assert_calls(5);
    assert_eq!(stats.count(), 5);
    assert_eq!(stats.fail_count(), 5);
    assert_eq!(stats.error_count(), 0);
    assert_eq!(stats.total.status_code_counts.get(&500), Some(&5));
}

#[test]
// Statuses are recorded per request name.
fn test_status_codes() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });
    let missing = server.mock(|when, then| {
        when.method(GET).path("/missing");
        then.status(404);
    });

    let index_url = format!("{}/", server.base_url());
    let missing_url = format!("{}/missing", server.base_url());
    let configuration = common::build_configuration(vec![
        "--url",
        &index_url,
        "--url",
        &missing_url,
        "--iterations",
        "6",
    ]);
    let stats = common::run_load_test(LoadTest::initialize_with_config(configuration).unwrap());

    // One virtual user alternates between both plans.
    index.assert_calls(3);
    missing.assert_calls(3);
    assert_eq!(stats.requests[&index_url].success_count, 3);
    assert_eq!(stats.requests[&missing_url].fail_count, 3);
    assert_eq!(
        stats.requests[&missing_url].status_code_counts.get(&404),
        Some(&3)
    );
    assert_eq!(stats.fail_count(), 3);
}
