use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const POLICIES_CREATED: &str = "policymaker_policies_created_total";
pub const POLICY_FAILURES: &str = "policymaker_policy_failures_total";
pub const RELOCATIONS: &str = "policymaker_relocations_total";
pub const CYCLES: &str = "policymaker_cycles_total";
pub const QUEUES_WITHOUT_POLICY: &str = "policymaker_queues_without_policy";
pub const READINESS_WAIT_SECONDS: &str = "policymaker_readiness_wait_seconds";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: axum::Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

    let handle = PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()?;

    describe_metrics();

    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(POLICIES_CREATED, "standing HA policies created");
    metrics::describe_counter!(
        POLICY_FAILURES,
        "queues whose policy creation failed during a cycle"
    );
    metrics::describe_counter!(RELOCATIONS, "queues relocated to a less loaded node");
    metrics::describe_counter!(CYCLES, "evaluation cycles, labelled by result");
    metrics::describe_gauge!(
        QUEUES_WITHOUT_POLICY,
        "queues lacking their own policy at the start of the last cycle"
    );
    metrics::describe_histogram!(
        READINESS_WAIT_SECONDS,
        "time spent waiting for a queue to report running"
    );
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
