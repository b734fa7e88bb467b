// vigil: Self-hosted monitoring and alerting service
// Rule evaluation, multi-sink notification fanout, and live dashboard streaming

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod alerts;
pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod metrics;
pub mod notify;
pub mod shutdown;
pub mod tasks;

pub use config::Config;
pub use error::{CoreError, CoreResult};

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::alerts::engine::{AlertEngine, EngineConfig};
use crate::alerts::schedule::{ScheduleGate, Silences};
use crate::alerts::store::RuleStore;
use crate::api::AppState;
use crate::auth::{TokenIssuer, UserStore};
use crate::events::EventFanout;
use crate::hub::{Hub, HubConfig};
use crate::metrics::{CustomMetrics, MetricRegistry};
use crate::notify::email::EmailSink;
use crate::notify::router::{ChannelRouter, ChannelRule};
use crate::notify::teams::TeamsSink;
use crate::notify::webhook::ChatWebhookSink;
use crate::notify::{BackoffMode, Dispatcher, RetryPolicy, Sink, SinkSet};
use crate::shutdown::Shutdown;
use crate::tasks::TaskRegistry;

/// Run the service until a shutdown signal arrives
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let shutdown = Shutdown::new();

    // metric store
    let registry = Arc::new(MetricRegistry::new(config.metrics.ring_capacity));
    let custom = Arc::new(CustomMetrics::new(Arc::clone(&registry)));

    // alert engine
    let rules = Arc::new(RuleStore::new());
    let silences = Arc::new(Silences::new());
    let mut maintenance = Vec::new();
    for section in &config.engine.maintenance {
        let (start, end) = section.parse()?;
        maintenance.push(crate::alerts::schedule::MaintenanceWindow {
            start,
            end,
            reason: section.reason.clone(),
        });
    }
    let gate = Arc::new(ScheduleGate::new(maintenance));

    let mut fanout = EventFanout::new();
    let dispatcher_events = fanout.subscribe("dispatcher", 256);
    let hub_events = fanout.subscribe("hub", 256);

    let (engine, engine_handle) = AlertEngine::new(
        EngineConfig {
            eval_interval: std::time::Duration::from_secs(config.engine.eval_interval_secs.max(1)),
            resolve_quiescence: chrono::Duration::seconds(
                config.engine.resolve_quiescence_secs as i64,
            ),
        },
        Arc::clone(&rules),
        Arc::clone(&registry),
        Arc::clone(&gate),
        Arc::clone(&silences),
        fanout,
    );

    // subscription hub
    let (hub, hub_handle) = Hub::new(HubConfig {
        queue_capacity: config.hub.queue_capacity,
        ping_interval: std::time::Duration::from_secs(config.hub.ping_interval_secs.max(1)),
        max_slow_misses: config.hub.max_slow_misses.max(1),
    });

    // notification sinks
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(
            config.notify.http_timeout_secs.max(1),
        ))
        .build()?;
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if config.sinks.chat.is_some() {
        sinks.push(Arc::new(ChatWebhookSink::chat(
            config.sinks.chat.clone(),
            client.clone(),
        )));
    }
    if config.sinks.discord.is_some() {
        sinks.push(Arc::new(ChatWebhookSink::discord(
            config.sinks.discord.clone(),
            client.clone(),
        )));
    }
    if config.sinks.email.is_some() {
        sinks.push(Arc::new(EmailSink::new(config.sinks.email.clone())));
    }
    if config.sinks.teams.is_some() {
        sinks.push(Arc::new(TeamsSink::new(
            config.sinks.teams.clone(),
            client.clone(),
            Some(format!("http://{}", config.server.bind_address)),
        )));
    }
    if sinks.is_empty() {
        warn!("No notification sinks configured; alerts reach subscribers only");
    }
    let sinks = Arc::new(SinkSet::new(sinks));

    let mut routes = Vec::new();
    for route in &config.notify.routes {
        let severity = match &route.severity {
            Some(s) => Some(crate::alerts::rule::Severity::parse(s).ok_or_else(|| {
                CoreError::InvalidInput(format!("unknown route severity: {}", s))
            })?),
            None => None,
        };
        routes.push(ChannelRule {
            event_type: route.event_type.clone(),
            severity,
            team_id: route.team_id.clone(),
            channel_id: route.channel_id.clone(),
        });
    }
    let router = ChannelRouter::new(routes);

    let retry = RetryPolicy {
        max_attempts: config.notify.retry.max_attempts.max(1),
        initial_delay_ms: config.notify.retry.initial_delay_ms,
        max_delay_ms: config.notify.retry.max_delay_ms,
        multiplier: config.notify.retry.multiplier,
        mode: if config.notify.retry.mode == "linear" {
            BackoffMode::Linear
        } else {
            BackoffMode::Exponential
        },
    };
    let dispatcher = Dispatcher::new(Arc::clone(&sinks), router, retry, config.notify.workers);

    // identity
    let users = Arc::new(UserStore::new());
    if config.auth.admin_password.is_empty() {
        warn!("No admin password configured; logins will fail until a user is seeded");
    } else {
        users.seed_admin(
            &config.auth.admin_username,
            &config.auth.admin_password,
            &config.auth.admin_email,
        )?;
    }
    let jwt_secret = if config.auth.jwt_secret.is_empty() {
        warn!("No JWT secret configured; using an ephemeral secret, tokens will not survive restart");
        uuid::Uuid::new_v4().to_string()
    } else {
        config.auth.jwt_secret.clone()
    };
    let tokens = Arc::new(TokenIssuer::new(&jwt_secret, config.auth.token_ttl_minutes));

    // background tasks
    let task_registry = Arc::new(TaskRegistry::new(hub_handle.clone()));

    let (engine_task, engine_stop) = task_registry.register("alert-engine");
    {
        let registry = Arc::clone(&task_registry);
        let mut stop = engine_stop;
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = engine.run(shutdown_rx) => {}
                _ = crate::shutdown::triggered(&mut stop) => {}
            }
            registry.complete(engine_task);
        });
    }

    let (hub_task, hub_stop) = task_registry.register("subscription-hub");
    {
        let registry = Arc::clone(&task_registry);
        let mut stop = hub_stop;
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = hub.run(hub_events, shutdown_rx) => {}
                _ = crate::shutdown::triggered(&mut stop) => {}
            }
            registry.complete(hub_task);
        });
    }

    let (dispatcher_task, dispatcher_stop) = task_registry.register("notification-dispatcher");
    {
        let registry = Arc::clone(&task_registry);
        let mut stop = dispatcher_stop;
        let shutdown_rx = shutdown.subscribe();
        let grace = std::time::Duration::from_secs(config.server.shutdown_grace_secs);
        tokio::spawn(async move {
            tokio::select! {
                _ = dispatcher.run(dispatcher_events, shutdown_rx, grace) => {}
                _ = crate::shutdown::triggered(&mut stop) => {}
            }
            registry.complete(dispatcher_task);
        });
    }

    let (_, process_stop) = task_registry.register("process-sampler");
    crate::metrics::samplers::spawn_process_sampler(
        Arc::clone(&registry),
        hub_handle.clone(),
        std::time::Duration::from_secs(config.metrics.process_sample_interval_secs.max(1)),
        shutdown.subscribe(),
        process_stop,
    );

    let (_, custom_stop) = task_registry.register("custom-metric-sampler");
    crate::metrics::samplers::spawn_custom_sampler(
        Arc::clone(&custom),
        hub_handle.clone(),
        std::time::Duration::from_secs(config.metrics.custom_sample_interval_secs.max(1)),
        shutdown.subscribe(),
        custom_stop,
    );

    // HTTP surface
    let state = Arc::new(AppState {
        config: config.clone(),
        registry,
        custom,
        rules,
        engine: engine_handle,
        hub: hub_handle,
        users,
        tokens,
        sinks,
        tasks: task_registry,
        started_at: Utc::now(),
    });
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", config.server.bind_address, e))?;
    info!("vigil listening on http://{}", config.server.bind_address);

    // ctrl-c flips the shared shutdown signal
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_shutdown.trigger();
        }
    });

    let mut server_shutdown = shutdown.subscribe();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        crate::shutdown::triggered(&mut server_shutdown).await;
    });
    if let Err(e) = serve.await {
        error!(error = %e, "Server failed");
        shutdown.trigger();
        return Err(e.into());
    }

    shutdown.trigger();
    // give background tasks a moment to drain their queues
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("vigil stopped");
    Ok(())
}
