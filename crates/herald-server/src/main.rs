//! herald server binary: HTTP API and/or worker group, per `HERALD_ROLE`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_core::app::{App, AppBuilder};
use herald_core::config::HeraldConfig;
use herald_core::notification::{LogDelivery, NotificationHandler, SendNotification};
use herald_core::ports::{Broker, ResultBackend, SystemClock};
use herald_core::queue::{InMemoryBroker, RedisBroker};
use herald_core::typed::Task;

use herald_server::middleware::rate_limit::RateLimiter;
use herald_server::{AppState, create_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = HeraldConfig::from_env().context("loading configuration")?;

    let level = config.profile.default_log_level();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "herald_core={level},herald_server={level},tower_http={level}"
            ))
        }))
        .init();

    tracing::info!(
        profile = ?config.profile,
        role = ?config.role,
        broker = %config.broker_url,
        "starting herald"
    );

    let app = if config.uses_memory_broker() {
        tracing::warn!("in-memory broker: tasks do not survive a restart");
        build_app(
            &config,
            Arc::new(InMemoryBroker::with_retention(
                Arc::new(SystemClock),
                config.visibility_timeout,
                config.result_ttl,
            )),
        )?
    } else {
        let broker = RedisBroker::connect(&config.broker_url, config.redis_options())
            .await
            .context("connecting to redis broker")?;
        build_app(&config, Arc::new(broker))?
    };

    let workers = config
        .role
        .runs_workers()
        .then(|| app.spawn_workers(config.worker_concurrency, config.poll_interval));

    if config.role.runs_api() {
        serve(&config, &app).await?;
    } else {
        shutdown_signal().await;
    }

    if let Some(workers) = workers {
        tracing::info!("waiting for in-flight tasks");
        workers.shutdown_and_join().await;
    }
    tracing::info!("herald stopped");
    Ok(())
}

fn build_app<B>(config: &HeraldConfig, transport: Arc<B>) -> anyhow::Result<App>
where
    B: Broker + ResultBackend + 'static,
{
    let app = AppBuilder::new()
        .register::<SendNotification, _>(NotificationHandler::new(LogDelivery))?
        .expect_tasks(&[SendNotification::NAME])
        .retry_policy(config.retry_policy())
        .time_limits(config.time_limits())
        .build(transport)?;
    Ok(app)
}

async fn serve(config: &HeraldConfig, app: &App) -> anyhow::Result<()> {
    let state = AppState::new(
        app,
        RateLimiter::per_minute(config.rate_limit_per_minute)
            .trust_forwarded_for(config.trust_forwarded_for),
        config.max_body_bytes,
    );
    let router = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!("API server listening on {}", config.bind_addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown requested");
}
