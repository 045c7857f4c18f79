use async_trait::async_trait;
use gumdrop::Options;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flock::prelude::*;

/// Not all functions are used by all tests, so we enable allow(dead_code) to avoid
/// compiler warnings during testing.

/// The following options are configured by default, if not set to a custom value:
///  --vus 1
///  --duration 1 (unless --iterations is set)
pub fn build_configuration(custom: Vec<&str>) -> FlockConfiguration {
    // Start with an empty configuration.
    let mut configuration: Vec<&str> = vec![];

    // Merge in all custom options first.
    configuration.extend_from_slice(&custom);

    // Default to testing with 1 virtual user if not otherwise configured.
    if !configuration.contains(&"--vus") {
        configuration.extend_from_slice(&["--vus", "1"]);
    }

    // Default to running for 1 second if not otherwise configured.
    if !configuration.contains(&"--duration") && !configuration.contains(&"--iterations") {
        configuration.extend_from_slice(&["--duration", "1"]);
    }

    // Parse these options to generate a FlockConfiguration.
    FlockConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Run the actual load test, returning the AggregateStats.
#[allow(dead_code)]
pub fn run_load_test(load_test: LoadTest) -> AggregateStats {
    load_test.execute().unwrap()
}

/// A fake client that waits, then responds with a fixed status code.
#[allow(dead_code)]
pub struct FixedClient {
    pub delay: Duration,
    pub status: u16,
    pub requests: AtomicUsize,
}
#[allow(dead_code)]
impl FixedClient {
    pub fn new(delay: Duration, status: u16) -> Arc<Self> {
        Arc::new(FixedClient {
            delay,
            status,
            requests: AtomicUsize::new(0),
        })
    }

    /// How many requests were started.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}
#[async_trait]
impl HttpClient for FixedClient {
    async fn execute(&self, _request: &RenderedRequest) -> Result<HttpResponse, RequestErrorKind> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(HttpResponse {
            status: self.status,
            bytes_received: 2,
        })
    }
}

/// A fake client that fails every request as if nothing was listening.
#[allow(dead_code)]
pub struct RefusingClient;
#[async_trait]
impl HttpClient for RefusingClient {
    async fn execute(&self, _request: &RenderedRequest) -> Result<HttpResponse, RequestErrorKind> {
        Err(RequestErrorKind::ConnectionRefused)
    }
}

/// Build a load test requesting one plan through the given client.
#[allow(dead_code)]
pub fn build_load_test(
    configuration: FlockConfiguration,
    client: Arc<dyn HttpClient>,
) -> LoadTest {
    LoadTest::initialize_with_config(configuration)
        .unwrap()
        .register_plan(RequestPlan::get("http://localhost:8080/?rnd={rnd}").unwrap())
        .set_client(client)
}

/// Helper to count the number of lines in a test artifact.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
