use async_trait::async_trait;
use std::sync::{Arc, Mutex};

mod common;

use flock::prelude::*;

// A fake client remembering the path of every request, in order.
#[derive(Default)]
struct RecordingClient {
    paths: Mutex<Vec<String>>,
}
impl RecordingClient {
    fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}
#[async_trait]
impl HttpClient for RecordingClient {
    async fn execute(&self, request: &RenderedRequest) -> Result<HttpResponse, RequestErrorKind> {
        let path = url::Url::parse(&request.url).unwrap().path().to_string();
        self.paths.lock().unwrap().push(path);
        Ok(HttpResponse {
            status: 200,
            bytes_received: 0,
        })
    }
}

// Run one virtual user for six iterations over plans A (weight 2) and B (weight 1).
fn run_scheduler(scheduler: PlanScheduler) -> Vec<String> {
    let client = Arc::new(RecordingClient::default());
    let configuration = common::build_configuration(vec!["--iterations", "6"]);

    let load_test = LoadTest::initialize_with_config(configuration)
        .unwrap()
        .register_weighted_plan(RequestPlan::get("http://localhost:8080/a").unwrap(), 2)
        .register_weighted_plan(RequestPlan::get("http://localhost:8080/b").unwrap(), 1)
        .set_scheduler(scheduler)
        .set_client(client.clone());
    let stats = common::run_load_test(load_test);
    assert_eq!(stats.count(), 6);

    client.paths()
}

#[test]
fn test_round_robin() {
    assert_eq!(
        run_scheduler(PlanScheduler::RoundRobin),
        vec!["/a", "/b", "/a", "/a", "/b", "/a"]
    );
}

#[test]
fn test_serial() {
    assert_eq!(
        run_scheduler(PlanScheduler::Serial),
        vec!["/a", "/a", "/b", "/a", "/a", "/b"]
    );
}

#[test]
fn test_random() {
    let paths = run_scheduler(PlanScheduler::Random);
    assert_eq!(paths.len(), 6);
    assert!(paths.iter().all(|path| path == "/a" || path == "/b"));
}

#[test]
// A custom iteration body decides what every iteration requests.
fn test_custom_body() {
    let client = Arc::new(RecordingClient::default());
    let configuration = common::build_configuration(vec!["--vus", "2", "--iterations", "4"]);

    let body = FnBody::new(|context: &mut IterationContext| {
        RenderedRequest::get(&format!("http://localhost:8080/users/{}", context.vu_id))
    });
    let load_test = LoadTest::initialize_with_config(configuration)
        .unwrap()
        .register_body(Arc::new(body))
        .set_client(client.clone());
    let stats = common::run_load_test(load_test);

    assert_eq!(stats.count(), 4);
    let paths = client.paths();
    assert_eq!(paths.len(), 4);
    assert!(paths
        .iter()
        .all(|path| path == "/users/0" || path == "/users/1"));
}
