//! Request plans describe what each virtual user requests on every iteration.
//!
//! A [`RequestPlan`] is an immutable request template built from a [`PlanSpec`]. Templates
//! may contain the following placeholders, rendered fresh on every iteration:
//!  - `{rnd}`: a random float in the range `[0, 100)`;
//!  - `{vu}`: the id of the virtual user making the request;
//!  - `{iteration}`: how many iterations this virtual user has already run.
//!
//! Virtual users don't use plans directly, they ask an [`IterationBody`] for the next
//! request. A single [`RequestPlan`] is an iteration body, as is a weighted mix of plans
//! ([`WeightedPlans`]) or an arbitrary function ([`FnBody`]).
//!
//! ```rust
//! use flock::plan::{IterationBody, IterationContext, RequestPlan};
//!
//! let plan = RequestPlan::get("http://localhost:8080/?rnd={rnd}").unwrap();
//! let mut context = IterationContext::seeded(0, 42);
//! let request = plan.next_request(&mut context);
//! assert!(request.url.starts_with("http://localhost:8080/?rnd="));
//! ```

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{util, FlockError};

/// Methods a request plan may be defined with.
///
/// Only [`HttpMethod::Get`] is accepted when a load test starts, other methods are parsed so
/// plans using them can be rejected with a useful error.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
}
impl HttpMethod {
    /// Convert to the method type used by the http client.
    pub fn as_method(&self) -> http::Method {
        match self {
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Options => http::Method::OPTIONS,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
        }
    }
}
impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let method = match self {
            HttpMethod::Delete => "DELETE",
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        };
        write!(f, "{}", method)
    }
}
impl FromStr for HttpMethod {
    type Err = FlockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "DELETE" => Ok(HttpMethod::Delete),
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            "PATCH" => Ok(HttpMethod::Patch),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            _ => Err(FlockError::InvalidOption {
                option: "method".to_string(),
                value: s.to_string(),
                detail: "Unrecognized HTTP method.".to_string(),
            }),
        }
    }
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_weight() -> usize {
    1
}

/// The unvalidated description of a request plan, as found in a run script.
///
/// ```json
/// {"method": "GET", "url": "http://localhost:8080/?rnd={rnd}", "name": "index", "weight": 2}
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PlanSpec {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: usize,
}
impl PlanSpec {
    /// A GET plan for the given url template.
    pub fn get(url: &str) -> Self {
        PlanSpec {
            method: default_method(),
            url: url.to_string(),
            headers: BTreeMap::new(),
            name: None,
            weight: default_weight(),
        }
    }
}

/// An immutable request template.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestPlan {
    method: HttpMethod,
    url_template: String,
    headers: Vec<(String, String)>,
    name: String,
}
impl RequestPlan {
    /// Validate a [`PlanSpec`] and build a plan from it.
    ///
    /// Fails if the url template is empty, the method is not a recognized HTTP method, a
    /// header is invalid, or the rendered template is not an absolute url with a host.
    pub fn build(spec: PlanSpec) -> Result<Self, FlockError> {
        if spec.url.trim().is_empty() {
            return Err(FlockError::InvalidOption {
                option: "url".to_string(),
                value: spec.url,
                detail: "The url template must not be empty.".to_string(),
            });
        }
        let method = HttpMethod::from_str(&spec.method)?;

        let mut headers = Vec::with_capacity(spec.headers.len());
        for (key, value) in spec.headers {
            if http::header::HeaderName::from_bytes(key.as_bytes()).is_err()
                || http::header::HeaderValue::from_str(&value).is_err()
            {
                return Err(FlockError::InvalidOption {
                    option: "header".to_string(),
                    value: format!("{}: {}", key, value),
                    detail: "Invalid header name or value.".to_string(),
                });
            }
            headers.push((key, value));
        }

        // Placeholders must render into a valid url.
        util::is_valid_url(&render_template(&spec.url, 0.0, 0, 0))?;

        let name = match spec.name {
            Some(name) => name,
            None => spec.url.clone(),
        };
        Ok(RequestPlan {
            method,
            url_template: spec.url,
            headers,
            name,
        })
    }

    /// Build a GET plan for the given url template.
    pub fn get(url: &str) -> Result<Self, FlockError> {
        RequestPlan::build(PlanSpec::get(url))
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Render the template for one iteration.
    pub fn render(&self, context: &mut IterationContext) -> RenderedRequest {
        let rnd: f64 = context.rng.random_range(0.0..100.0);
        RenderedRequest {
            method: self.method,
            url: render_template(&self.url_template, rnd, context.vu_id, context.iteration),
            headers: self.headers.clone(),
            name: self.name.clone(),
        }
    }
}

fn render_template(template: &str, rnd: f64, vu_id: usize, iteration: usize) -> String {
    let mut rendered = template.to_string();
    if rendered.contains("{rnd}") {
        rendered = rendered.replace("{rnd}", &rnd.to_string());
    }
    if rendered.contains("{vu}") {
        rendered = rendered.replace("{vu}", &vu_id.to_string());
    }
    if rendered.contains("{iteration}") {
        rendered = rendered.replace("{iteration}", &iteration.to_string());
    }
    rendered
}

/// A single request, ready to be sent.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub name: String,
}
impl RenderedRequest {
    /// A GET request with no headers, named after its url.
    pub fn get(url: &str) -> Self {
        RenderedRequest {
            method: HttpMethod::Get,
            url: url.to_string(),
            headers: Vec::new(),
            name: url.to_string(),
        }
    }

    /// Add `err=1` to the query string, asking the server under test to fail the request.
    pub fn inject_error(&mut self) {
        match url::Url::parse(&self.url) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("err", "1");
                self.url = url.to_string();
            }
            Err(e) => debug!("not injecting error into {}: {}", self.url, e),
        }
    }
}

/// Per-iteration state handed to an [`IterationBody`].
#[derive(Debug)]
pub struct IterationContext {
    /// The virtual user running this iteration.
    pub vu_id: usize,
    /// How many iterations this virtual user has already run.
    pub iteration: usize,
    /// Random number generator local to the virtual user.
    pub rng: StdRng,
}
impl IterationContext {
    pub fn new(vu_id: usize) -> Self {
        IterationContext {
            vu_id,
            iteration: 0,
            rng: StdRng::from_os_rng(),
        }
    }

    /// A context with a reproducible random number generator.
    pub fn seeded(vu_id: usize, seed: u64) -> Self {
        IterationContext {
            vu_id,
            iteration: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

/// Produces the request a virtual user makes on each iteration.
pub trait IterationBody: Send + Sync {
    /// Return the request for the iteration described by `context`.
    fn next_request(&self, context: &mut IterationContext) -> RenderedRequest;

    /// The plans this body draws from, used to validate the load test before it starts.
    fn plans(&self) -> Vec<&RequestPlan> {
        Vec::new()
    }
}

impl IterationBody for RequestPlan {
    fn next_request(&self, context: &mut IterationContext) -> RenderedRequest {
        self.render(context)
    }

    fn plans(&self) -> Vec<&RequestPlan> {
        vec![self]
    }
}

/// Used to define the order weighted plans are requested in.
#[derive(Clone, Debug, PartialEq)]
pub enum PlanScheduler {
    /// Request one of each available plan at a time (default).
    RoundRobin,
    /// Request plans in the order and weighting defined.
    Serial,
    /// Request plans in a random, weighted order.
    Random,
}

/// A weighted mix of request plans.
///
/// Weights are reduced by their greatest common divisor and expanded into a sequence that
/// each virtual user walks through.
pub struct WeightedPlans {
    plans: Vec<RequestPlan>,
    sequence: Vec<usize>,
    scheduler: PlanScheduler,
}
impl WeightedPlans {
    pub fn new(
        weighted: Vec<(RequestPlan, usize)>,
        scheduler: PlanScheduler,
    ) -> Result<Self, FlockError> {
        if weighted.is_empty() {
            return Err(FlockError::NoRequestPlans {
                detail: "At least one weighted plan is required.".to_string(),
            });
        }
        if let Some((plan, _)) = weighted.iter().find(|(_, weight)| *weight == 0) {
            return Err(FlockError::InvalidOption {
                option: "weight".to_string(),
                value: "0".to_string(),
                detail: format!("Plan {} must have a weight of at least 1.", plan.name()),
            });
        }

        let mut u: usize = 0;
        for (_, weight) in &weighted {
            if u == 0 {
                u = *weight;
            } else {
                trace!("calculating greatest common denominator of {} and {}", u, weight);
                u = util::gcd(u, *weight);
            }
        }
        debug!("gcd: {}", u);

        let mut available = Vec::with_capacity(weighted.len());
        let mut total = 0;
        let mut plans = Vec::with_capacity(weighted.len());
        for (index, (plan, weight)) in weighted.into_iter().enumerate() {
            // Divide by greatest common divisor so the sequence is as short as possible.
            let reduced = weight / u;
            trace!(
                "{}: {} has weight of {} (reduced with gcd to {})",
                index,
                plan.name(),
                weight,
                reduced
            );
            available.push(vec![index; reduced]);
            total += reduced;
            plans.push(plan);
        }

        let sequence = schedule_plans(&available, total, &scheduler);
        Ok(WeightedPlans {
            plans,
            sequence,
            scheduler,
        })
    }

    /// Plan indexes in the order they are requested.
    pub fn sequence(&self) -> &[usize] {
        &self.sequence
    }
}
impl IterationBody for WeightedPlans {
    fn next_request(&self, context: &mut IterationContext) -> RenderedRequest {
        let position = match self.scheduler {
            PlanScheduler::Random => context.rng.random_range(0..self.sequence.len()),
            PlanScheduler::RoundRobin | PlanScheduler::Serial => {
                context.iteration % self.sequence.len()
            }
        };
        self.plans[self.sequence[position]].render(context)
    }

    fn plans(&self) -> Vec<&RequestPlan> {
        self.plans.iter().collect()
    }
}

fn schedule_plans(available: &[Vec<usize>], total: usize, scheduler: &PlanScheduler) -> Vec<usize> {
    // Now build the weighted list with the appropriate scheduler.
    let mut weighted = Vec::with_capacity(total);

    match scheduler {
        PlanScheduler::RoundRobin => {
            let mut available_plans = available.to_owned();
            loop {
                for (plan_index, plans) in available_plans.iter_mut().enumerate() {
                    if let Some(plan) = plans.pop() {
                        debug!("allocating request from plan {}", plan_index);
                        weighted.push(plan);
                    }
                }
                if weighted.len() >= total {
                    break;
                }
            }
        }
        // Random plans are picked per iteration, weighted by how often they appear.
        PlanScheduler::Serial | PlanScheduler::Random => {
            for (plan_index, plans) in available.iter().enumerate() {
                debug!(
                    "allocating all {} requests from plan {}",
                    plans.len(),
                    plan_index
                );
                weighted.extend_from_slice(plans);
            }
        }
    }

    weighted
}

/// An iteration body defined by a function.
///
/// ```rust
/// use flock::plan::{FnBody, IterationBody, IterationContext, RenderedRequest};
///
/// let body = FnBody::new(|context: &mut IterationContext| {
///     RenderedRequest::get(&format!("http://localhost:8080/users/{}", context.vu_id))
/// });
/// let request = body.next_request(&mut IterationContext::seeded(3, 0));
/// assert_eq!(request.url, "http://localhost:8080/users/3");
/// ```
pub struct FnBody<F> {
    function: F,
}
impl<F> FnBody<F>
where
    F: Fn(&mut IterationContext) -> RenderedRequest + Send + Sync,
{
    pub fn new(function: F) -> Self {
        FnBody { function }
    }
}
impl<F> IterationBody for FnBody<F>
where
    F: Fn(&mut IterationContext) -> RenderedRequest + Send + Sync,
{
    fn next_request(&self, context: &mut IterationContext) -> RenderedRequest {
        (self.function)(context)
    }
}
