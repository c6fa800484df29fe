//! Relay message router.
//!
//! Drains external FIFO queues, enforces per-pool concurrency and rate
//! limits, mediates each message to its downstream webhook, and
//! finalises queue state from the outcome.
//!
//! ## Deployment features
//!
//! - **Active/standby HA**: Redis lock-based election; only the PRIMARY
//!   instance processes. Enable with `RELAY_STANDBY_ENABLED=true`.
//! - **Traffic management**: role transitions register/deregister this
//!   instance with an ALB target group (`RELAY_TRAFFIC_STRATEGY=alb`).
//! - **Topology source**: pool and queue definitions from the local
//!   `relay.toml` or a remote control plane (`RELAY_SOURCE_URL`), with
//!   periodic refresh.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::{net::TcpListener, signal, sync::watch};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use relay_common::{QueueKind, RouterTopology, WarningCategory, WarningSeverity};
use relay_config::{AppConfig, ConfigLoader, TrafficStrategyKind};
use relay_queue::{
    amqp::AmqpQueueConsumer, sqlite::SqliteQueue, sqs::SqsQueueConsumer, QueueConsumer,
};
use relay_router::{
    api::{create_router, AppState},
    spawn_refresh_task, spawn_warning_cleanup, BreakerConfig, BreakerRegistry, ConfigResolver,
    ConsumerFactory, DispatchEngine, EngineConfig, HealthConfig, HealthService, HttpMediator,
    HttpMediatorConfig, RouterError, TopologySource, WarningStore, WarningStoreConfig,
};
use relay_standby::{Election, ElectionConfig, Role};
use relay_traffic::{
    AlbTargetGroupStrategy, NoopStrategy, RetryPolicy, TrafficManager, TrafficStrategy,
};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    relay_common::logging::init_logging("relay-router");

    info!("Starting Relay message router");

    let config = ConfigLoader::new().load()?;
    let instance_id = config.standby.resolved_instance_id();

    // 1. Operator surface
    let warnings = Arc::new(WarningStore::new(WarningStoreConfig::default()));
    let health = Arc::new(HealthService::new(
        HealthConfig::default(),
        Arc::clone(&warnings),
        config.standby.enabled,
    ));

    // 2. Breakers + mediator
    let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
        window_size: config.breaker.window_size,
        min_requests: config.breaker.min_requests,
        failure_ratio: config.breaker.failure_ratio,
        open_timeout: Duration::from_secs(config.breaker.open_timeout_seconds),
        success_threshold: config.breaker.success_threshold,
    }));

    let mediator = Arc::new(
        HttpMediator::with_config(
            HttpMediatorConfig {
                timeout: Duration::from_secs(config.mediator.timeout_seconds),
                connect_timeout: Duration::from_secs(config.mediator.connect_timeout_seconds),
                max_retries: config.mediator.max_retries,
                base_backoff: Duration::from_secs(config.mediator.base_backoff_seconds),
                http2: config.mediator.http2,
            },
            Arc::clone(&breakers),
        )
        .with_warning_store(Arc::clone(&warnings)),
    );

    // 3. Election (or a fixed PRIMARY role when standby is disabled).
    // A standby-enabled instance that cannot reach Redis stays up but
    // never processes: monitoring reports DOWN with a critical warning
    // until the election store comes back.
    let (election, role_rx, _static_role_tx) = if config.standby.enabled {
        info!(
            redis_url = %config.standby.redis_url,
            lock_key = %config.standby.lock_key,
            instance_id = %instance_id,
            "Standby mode enabled, starting election"
        );

        let election_config = ElectionConfig::new(config.standby.redis_url.clone())
            .with_lock_key(config.standby.lock_key.clone())
            .with_instance_id(instance_id.clone())
            .with_lock_ttl(config.standby.lock_ttl_seconds);

        match Election::new(election_config).await {
            Ok(election) => {
                let election = Arc::new(election);
                Arc::clone(&election)
                    .start()
                    .await
                    .map_err(|e| anyhow::anyhow!("election start failed: {}", e))?;
                let role_rx = election.subscribe();
                (Some(election), role_rx, None)
            }
            Err(e) => {
                error!(error = %e, "Election store unreachable at startup, processing disabled");
                warnings.add(
                    WarningCategory::Election,
                    WarningSeverity::Critical,
                    format!("Redis unavailable at startup, election cannot run: {}", e),
                    "Election".to_string(),
                );
                let (tx, rx) = watch::channel(Role::Unknown);
                (None, rx, Some(tx))
            }
        }
    } else {
        info!("Standby mode disabled, this instance is always active");
        let (tx, rx) = watch::channel(Role::Primary);
        (None, rx, Some(tx))
    };

    // 4. Dispatch engine
    let sqs_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let factory = Arc::new(BrokerConsumerFactory {
        sqs_client: aws_sdk_sqs::Client::new(&sqs_config),
        data_dir: if config.data_dir.is_empty() {
            "./data".to_string()
        } else {
            config.data_dir.clone()
        },
    });

    let engine = Arc::new(
        DispatchEngine::new(
            mediator,
            Arc::clone(&breakers),
            Arc::clone(&warnings),
            role_rx.clone(),
            EngineConfig {
                drain_timeout: Duration::from_secs(config.shutdown.drain_timeout_seconds),
            },
        )
        .with_consumer_factory(factory),
    );

    // 5. Topology: local definitions or remote control plane
    let source = if config.router.source.url.is_empty() {
        info!(
            pools = config.router.pools.len(),
            queues = config.router.queues.len(),
            "Using local topology definitions"
        );
        TopologySource::Local(RouterTopology {
            pools: config.router.pools.clone(),
            queues: config.router.queues.clone(),
        })
    } else {
        info!(url = %config.router.source.url, "Using remote topology source");
        TopologySource::Remote {
            url: config.router.source.url.clone(),
            max_attempts: config.router.source.max_attempts,
            retry_delay: Duration::from_secs(config.router.source.retry_delay_seconds),
        }
    };

    let resolver = Arc::new(ConfigResolver::new(
        source,
        Arc::clone(&engine),
        Arc::clone(&warnings),
        Duration::from_secs(config.router.source.refresh_seconds),
    ));

    if let Err(e) = resolver.initial().await {
        error!(error = %e, "Initial topology load failed, cannot start");
        return Err(anyhow::anyhow!("initial topology load failed: {}", e));
    }

    Arc::clone(&engine).start().await;

    // 6. Background tasks
    if resolver.is_remote() {
        spawn_refresh_task(Arc::clone(&resolver), engine.shutdown_watch());
    }
    spawn_warning_cleanup(
        Arc::clone(&warnings),
        Duration::from_secs(300),
        engine.shutdown_watch(),
    );
    if let Some(ref election) = election {
        spawn_election_monitor(
            Arc::clone(election),
            Arc::clone(&warnings),
            engine.shutdown_watch(),
        );
    }

    // 7. Traffic registrar
    let traffic = if config.traffic.enabled {
        let strategy: Arc<dyn TrafficStrategy> = match config.traffic.strategy {
            TrafficStrategyKind::Alb => {
                let elb_config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let alb = AlbTargetGroupStrategy::new(
                    aws_sdk_elasticloadbalancingv2::Client::new(&elb_config),
                    relay_traffic::alb::AlbConfig {
                        target_group_arn: config.traffic.target_group_arn.clone(),
                        port: config.traffic.port,
                        ip_address: String::new(),
                    },
                )
                .await
                .map_err(|e| anyhow::anyhow!("traffic strategy setup failed: {}", e))?;
                Arc::new(alb)
            }
            TrafficStrategyKind::None => Arc::new(NoopStrategy),
        };

        let manager = Arc::new(TrafficManager::new(
            strategy,
            RetryPolicy {
                max_attempts: config.traffic.max_attempts,
                initial_delay: Duration::from_millis(config.traffic.retry_delay_ms),
            },
        ));
        Arc::clone(&manager).spawn(role_rx.clone());
        Some(manager)
    } else {
        None
    };

    // 8. Monitoring API
    let state = AppState {
        engine: Arc::clone(&engine),
        warnings: Arc::clone(&warnings),
        health,
        breakers,
        resolver: Some(resolver),
        election: election.clone(),
        traffic,
        standby_enabled: config.standby.enabled,
        instance_id: instance_id.clone(),
    };

    let cors = if config.http.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .http
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    info!(addr = %addr, "Starting monitoring API");

    let listener = TcpListener::bind(&addr).await?;
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Monitoring API server failed");
        }
    });

    log_startup_summary(&config, &instance_id);

    shutdown_signal().await;
    info!("Shutdown signal received");

    engine.shutdown().await;
    if let Some(election) = election {
        election.shutdown().await;
    }
    server_task.abort();

    info!("Relay router shutdown complete");
    Ok(())
}

/// Creates queue consumers per configured broker kind.
struct BrokerConsumerFactory {
    sqs_client: aws_sdk_sqs::Client,
    data_dir: String,
}

#[async_trait]
impl ConsumerFactory for BrokerConsumerFactory {
    async fn create_consumer(
        &self,
        config: &relay_common::QueueConfig,
    ) -> relay_router::Result<Arc<dyn QueueConsumer>> {
        match config.kind {
            QueueKind::Sqs => Ok(Arc::new(SqsQueueConsumer::from_queue_url(
                self.sqs_client.clone(),
                config.uri.clone(),
                config.visibility_timeout as i32,
            ))),
            QueueKind::Amqp => {
                let consumer = AmqpQueueConsumer::with_uri(&config.uri, &config.name).await?;
                Ok(Arc::new(consumer))
            }
            QueueKind::Sqlite => {
                let db_path = if config.uri.is_empty() {
                    format!("{}/relay-queue.db", self.data_dir)
                } else {
                    config.uri.clone()
                };

                let pool = SqlitePoolOptions::new()
                    .max_connections(4)
                    .connect(&format!("sqlite://{}?mode=rwc", db_path))
                    .await
                    .map_err(|e| RouterError::Config(format!("sqlite connect failed: {}", e)))?;

                let queue = SqliteQueue::new(pool, config.name.clone(), config.visibility_timeout);
                queue.init_schema().await?;
                Ok(Arc::new(queue))
            }
        }
    }
}

/// Raise warnings on election availability transitions.
fn spawn_election_monitor(
    election: Arc<Election>,
    warnings: Arc<WarningStore>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        let mut was_available = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let available = election.redis_available();
                    if !available && was_available {
                        warn!("Election store unavailable, processing is paused");
                        warnings.add(
                            WarningCategory::Election,
                            WarningSeverity::Critical,
                            "Redis unavailable, election cannot proceed and processing is paused"
                                .to_string(),
                            "Election".to_string(),
                        );
                    } else if available && !was_available {
                        info!("Election store available again");
                        warnings.add(
                            WarningCategory::Election,
                            WarningSeverity::Info,
                            "Redis available again, election resumed".to_string(),
                            "Election".to_string(),
                        );
                    }
                    was_available = available;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

fn log_startup_summary(config: &AppConfig, instance_id: &str) {
    info!("=== Relay Router Startup Summary ===");
    info!("  Instance: {}", instance_id);
    if config.standby.enabled {
        info!("  HA: enabled (Redis election, lock key {})", config.standby.lock_key);
    } else {
        info!("  HA: disabled (single instance)");
    }
    if config.router.source.url.is_empty() {
        info!("  Topology: local definitions");
    } else {
        info!("  Topology: remote ({})", config.router.source.url);
    }
    if config.traffic.enabled {
        info!("  Traffic: {:?} strategy", config.traffic.strategy);
    } else {
        info!("  Traffic: disabled");
    }
    info!("====================================");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
