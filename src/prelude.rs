pub use crate::client::{HttpClient, HttpResponse, ReqwestClient};
pub use crate::config::{
    FlockConfiguration, FlockDefault, FlockDefaultType, RunConfig, RunScript, StopCondition,
};
pub use crate::logger::LogFormat;
pub use crate::metrics::{
    AggregateStats, Aggregator, RequestAggregate, RequestErrorKind, RequestOutcome,
    RequestStatus,
};
pub use crate::plan::{
    FnBody, HttpMethod, IterationBody, IterationContext, PlanScheduler, PlanSpec,
    RenderedRequest, RequestPlan, WeightedPlans,
};
pub use crate::report::ReportFormat;
pub use crate::user::{StopSignal, VirtualUser};
pub use crate::{FlockError, LoadTest, RunHandle};
