//! Installs standing HA policies on RabbitMQ queues and rebalances queue masters inside the
//! configured policy groups.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use futures::future::{select, Either};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use policymaker::balancer::LoadBalancer;
use policymaker::config::Config;
use policymaker::cycle::{wait_for_broker, Policymaker};
use policymaker::handlers;
use policymaker::policy::PolicyEngine;
use policymaker::readiness::ReadinessWaiter;
use policymaker_common::broker::Broker;
use policymaker_common::health::HealthRegistry;
use policymaker_common::management::ManagementClient;
use policymaker_common::metrics;

async fn shutdown_signal(shutdown: CancellationToken) -> Result<()> {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("failed to register SIGTERM handler")?;
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .wrap_err("failed to register SIGINT handler")?;

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
    shutdown.cancel();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;
    let groups = config
        .policy_groups()
        .wrap_err("invalid AMQP_POLICY_GROUPS")?;
    tracing::info!(groups = groups.count().get(), dry_run = config.dry_run, "starting policymaker");

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let broker: Arc<dyn Broker> = Arc::new(
        ManagementClient::new(
            config.api_url.0.clone(),
            &config.user,
            &config.password,
            config.request_timeout.0,
        )
        .wrap_err("failed to build management API client")?,
    );

    let liveness = HealthRegistry::new("liveness");
    let cycle_liveness = liveness.register(
        "cycle",
        time::Duration::try_from(config.liveness_deadline.0)
            .wrap_err("invalid AMQP_LIVENESS_DEADLINE")?,
    );

    let recorder_handle = metrics::setup_metrics_recorder()
        .wrap_err("failed to install prometheus recorder")?;
    let app = handlers::app(liveness, Some(recorder_handle));
    let bind = config.bind();
    let http_server = Box::pin(async move { metrics::serve(app, &bind).await });

    let waiter = ReadinessWaiter::new(
        config.wait_sleep.0,
        config.readiness_timeout.map(|timeout| timeout.0),
        shutdown.clone(),
    );
    let policymaker = Policymaker::new(
        PolicyEngine::new(
            broker.clone(),
            groups.clone(),
            config.node_tag.as_str(),
            config.dry_run,
            waiter.clone(),
        ),
        LoadBalancer::new(
            broker.clone(),
            groups,
            config.queues_delta,
            config.dry_run,
            waiter,
        ),
        config.balancing,
    );

    let cycle_loop = Box::pin(async {
        wait_for_broker(
            broker.as_ref(),
            &config.broker_retry.policy(),
            &shutdown,
        )
        .await?;

        policymaker
            .run(config.sleep.0, config.run_once, &cycle_liveness, &shutdown)
            .await
    });

    let result = match select(http_server, cycle_loop).await {
        Either::Left((listen_result, _)) => listen_result
            .wrap_err("health and metrics http server stopped")
            .and_then(|_| Err(eyre::eyre!("health and metrics http server exited"))),
        Either::Right((cycle_result, _)) => cycle_result
            .wrap_err("policymaker stopped")
            .map(|_| tracing::info!("policymaker exited")),
    };

    result
}
