//! Virtual users, and the state they share with the load test that launched them.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::client::HttpClient;
use crate::metrics::{Aggregator, RequestErrorKind, RequestOutcome, RequestStatus};
use crate::plan::{IterationBody, IterationContext};

/// Cancellation flag shared by the load test and all of its virtual users.
#[derive(Clone, Debug, Default)]
pub struct StopSignal(Arc<AtomicBool>);
impl StopSignal {
    pub fn new() -> Self {
        StopSignal::default()
    }

    /// Ask all virtual users to stop after their current request.
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The total number of iterations virtual users may still run, when stopping after a fixed
/// number of iterations.
#[derive(Clone, Debug)]
pub struct IterationBudget(Arc<AtomicUsize>);
impl IterationBudget {
    pub fn new(iterations: usize) -> Self {
        IterationBudget(Arc::new(AtomicUsize::new(iterations)))
    }

    /// Claim one iteration. Returns false once the budget is spent, never going below zero.
    pub fn claim(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }

    pub fn remaining(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counts a virtual user as active until it is dropped, including when its task is aborted.
#[derive(Debug)]
pub(crate) struct ActiveUser(Arc<AtomicUsize>);
impl ActiveUser {
    pub(crate) fn new(active_users: &Arc<AtomicUsize>) -> Self {
        active_users.fetch_add(1, Ordering::SeqCst);
        ActiveUser(Arc::clone(active_users))
    }
}
impl Drop for ActiveUser {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Where virtual users send the outcome of every request.
///
/// Outcomes are recorded directly into the virtual user's shard of the [`Aggregator`]. If a
/// request log is enabled, a copy is also offered to the logger through a bounded channel;
/// when the logger falls behind the copy is dropped and counted instead of blocking.
#[derive(Clone)]
pub struct OutcomeSink {
    aggregator: Arc<Aggregator>,
    request_log: Option<flume::Sender<Option<RequestOutcome>>>,
    dropped_log_lines: Arc<AtomicUsize>,
}
impl OutcomeSink {
    pub fn new(
        aggregator: Arc<Aggregator>,
        request_log: Option<flume::Sender<Option<RequestOutcome>>>,
    ) -> Self {
        OutcomeSink {
            aggregator,
            request_log,
            dropped_log_lines: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, outcome: RequestOutcome) {
        if let Some(request_log) = self.request_log.as_ref() {
            if let Err(e) = request_log.try_send(Some(outcome.clone())) {
                trace!("dropping request log line: {}", e);
                self.dropped_log_lines.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.aggregator.record(outcome);
    }

    /// How many request log lines were dropped.
    pub fn dropped_log_lines(&self) -> usize {
        self.dropped_log_lines.load(Ordering::Relaxed)
    }
}

/// Settings shared by all virtual users in a load test.
#[derive(Clone, Debug)]
pub(crate) struct UserSettings {
    /// When the load test started, used to timestamp outcomes.
    pub started: Instant,
    /// How long to wait for a response before recording a timeout.
    pub request_timeout: Duration,
    /// Probability of asking the server to fail a request.
    pub error_rate: f64,
}

/// One simulated client, repeatedly requesting whatever its iteration body returns.
pub struct VirtualUser {
    /// An index into the load test's virtual users, starting at 0.
    pub id: usize,
    body: Arc<dyn IterationBody>,
    context: IterationContext,
}
impl VirtualUser {
    pub fn new(id: usize, body: Arc<dyn IterationBody>) -> Self {
        VirtualUser {
            id,
            body,
            context: IterationContext::new(id),
        }
    }

    /// How many iterations this virtual user has run.
    pub fn iterations(&self) -> usize {
        self.context.iteration
    }
}

pub(crate) async fn user_main(
    mut user: VirtualUser,
    client: Arc<dyn HttpClient>,
    stop: StopSignal,
    budget: Option<IterationBudget>,
    sink: OutcomeSink,
    settings: Arc<UserSettings>,
    _active: ActiveUser,
) -> VirtualUser {
    info!("launching user {}...", user.id);

    loop {
        if stop.is_stopped() {
            break;
        }
        if let Some(budget) = budget.as_ref() {
            if !budget.claim() {
                debug!("user {}: iteration budget spent", user.id);
                break;
            }
        }

        let mut request = user.body.next_request(&mut user.context);
        if settings.error_rate > 0.0 && user.context.rng.random_bool(settings.error_rate) {
            request.inject_error();
        }

        let elapsed = settings.started.elapsed().as_millis() as u64;
        let request_started = Instant::now();
        let (status, bytes_received) =
            match tokio::time::timeout(settings.request_timeout, client.execute(&request)).await
            {
                Ok(Ok(response)) => (
                    RequestStatus::Response(response.status),
                    response.bytes_received,
                ),
                Ok(Err(kind)) => (RequestStatus::Error(kind), 0),
                Err(_) => (RequestStatus::Error(RequestErrorKind::Timeout), 0),
            };
        let duration_micros = request_started.elapsed().as_micros() as u64;
        trace!(
            "user {}: {} {} {:?} in {}us",
            user.id,
            request.method,
            request.url,
            status,
            duration_micros
        );

        sink.push(RequestOutcome {
            elapsed,
            vu_id: user.id,
            iteration: user.context.iteration,
            method: request.method,
            name: request.name,
            url: request.url,
            duration_micros,
            status,
            bytes_received,
        });
        user.context.iteration += 1;

        if stop.is_stopped() {
            break;
        }
        // Clients that never wait must not starve the rest of the runtime.
        tokio::task::yield_now().await;
    }

    info!(
        "exiting user {} after {} iterations...",
        user.id,
        user.iterations()
    );
    user
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpResponse;
    use crate::metrics::DEFAULT_HISTOGRAM_BUCKETS;
    use crate::plan::{RenderedRequest, RequestPlan};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingClient {
        urls: Mutex<Vec<String>>,
        delay: Duration,
    }
    impl RecordingClient {
        fn new(delay: Duration) -> Self {
            RecordingClient {
                urls: Mutex::new(Vec::new()),
                delay,
            }
        }
    }
    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn execute(
            &self,
            request: &RenderedRequest,
        ) -> Result<HttpResponse, RequestErrorKind> {
            self.urls.lock().unwrap().push(request.url.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(HttpResponse {
                status: 200,
                bytes_received: 2,
            })
        }
    }

    fn settings(request_timeout: Duration, error_rate: f64) -> Arc<UserSettings> {
        Arc::new(UserSettings {
            started: Instant::now(),
            request_timeout,
            error_rate,
        })
    }

    fn user(id: usize) -> VirtualUser {
        let plan = RequestPlan::get("http://localhost:8080/?rnd={rnd}").unwrap();
        VirtualUser::new(id, Arc::new(plan))
    }

    #[test]
    fn iteration_budget() {
        let budget = IterationBudget::new(2);
        assert!(budget.claim());
        assert!(budget.claim());
        assert!(!budget.claim());
        assert!(!budget.claim());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn active_users() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ActiveUser::new(&active);
        let second = ActiveUser::new(&active);
        assert_eq!(active.load(Ordering::SeqCst), 2);
        drop(first);
        assert_eq!(active.load(Ordering::SeqCst), 1);
        drop(second);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runs_until_budget_spent() {
        let aggregator = Arc::new(Aggregator::new(1, DEFAULT_HISTOGRAM_BUCKETS.to_vec()));
        let client = Arc::new(RecordingClient::new(Duration::ZERO));
        let active = Arc::new(AtomicUsize::new(0));
        let user = user_main(
            user(0),
            client.clone(),
            StopSignal::new(),
            Some(IterationBudget::new(5)),
            OutcomeSink::new(aggregator.clone(), None),
            settings(Duration::from_secs(1), 0.0),
            ActiveUser::new(&active),
        )
        .await;
        assert_eq!(user.iterations(), 5);
        assert_eq!(client.urls.lock().unwrap().len(), 5);
        assert_eq!(aggregator.snapshot().count(), 5);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stopped_user_sends_nothing() {
        let aggregator = Arc::new(Aggregator::new(1, DEFAULT_HISTOGRAM_BUCKETS.to_vec()));
        let client = Arc::new(RecordingClient::new(Duration::ZERO));
        let stop = StopSignal::new();
        stop.stop();
        let user = user_main(
            user(0),
            client.clone(),
            stop,
            None,
            OutcomeSink::new(aggregator.clone(), None),
            settings(Duration::from_secs(1), 0.0),
            ActiveUser::new(&Arc::new(AtomicUsize::new(0))),
        )
        .await;
        assert_eq!(user.iterations(), 0);
        assert_eq!(aggregator.snapshot().count(), 0);
    }

    #[tokio::test]
    async fn injects_errors() {
        let aggregator = Arc::new(Aggregator::new(1, DEFAULT_HISTOGRAM_BUCKETS.to_vec()));
        let client = Arc::new(RecordingClient::new(Duration::ZERO));
        user_main(
            user(0),
            client.clone(),
            StopSignal::new(),
            Some(IterationBudget::new(10)),
            OutcomeSink::new(aggregator, None),
            settings(Duration::from_secs(1), 1.0),
            ActiveUser::new(&Arc::new(AtomicUsize::new(0))),
        )
        .await;
        let urls = client.urls.lock().unwrap();
        assert_eq!(urls.len(), 10);
        assert!(urls.iter().all(|url| url.ends_with("&err=1")));
    }

    #[tokio::test]
    async fn slow_requests_time_out() {
        let aggregator = Arc::new(Aggregator::new(1, DEFAULT_HISTOGRAM_BUCKETS.to_vec()));
        let client = Arc::new(RecordingClient::new(Duration::from_secs(10)));
        user_main(
            user(0),
            client,
            StopSignal::new(),
            Some(IterationBudget::new(2)),
            OutcomeSink::new(aggregator.clone(), None),
            settings(Duration::from_millis(20), 0.0),
            ActiveUser::new(&Arc::new(AtomicUsize::new(0))),
        )
        .await;
        let stats = aggregator.snapshot();
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.error_count(), 2);
        assert_eq!(stats.total.error_counts[&RequestErrorKind::Timeout], 2);
    }

    #[tokio::test]
    async fn full_request_log_drops_lines() {
        let aggregator = Arc::new(Aggregator::new(1, DEFAULT_HISTOGRAM_BUCKETS.to_vec()));
        let (sender, receiver) = flume::bounded(3);
        let sink = OutcomeSink::new(aggregator.clone(), Some(sender));
        user_main(
            user(0),
            Arc::new(RecordingClient::new(Duration::ZERO)),
            StopSignal::new(),
            Some(IterationBudget::new(10)),
            sink.clone(),
            settings(Duration::from_secs(1), 0.0),
            ActiveUser::new(&Arc::new(AtomicUsize::new(0))),
        )
        .await;
        // Every outcome is aggregated even though the log could only hold three.
        assert_eq!(aggregator.snapshot().count(), 10);
        assert_eq!(receiver.len(), 3);
        assert_eq!(sink.dropped_log_lines(), 7);
    }
}
