mod command;
mod config;
mod connection;
mod dispatch;
mod errors;
mod ingest;
mod metrics;
mod model;
mod rest;
mod state;
mod store;
mod topics;
mod validate;

use axum::{http::StatusCode, routing::get, Router};
use command::CommandPublisher;
use config::Config;
use connection::ConnectionManager;
use dispatch::Dispatcher;
use ingest::TelemetryIngestor;
use rest::AppState;
use state::StateAggregator;
use tokio::sync::mpsc;
use topics::TopicRouter;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting telemetry gateway");
    info!("MQTT broker: {}:{}", config.mqtt.broker, config.mqtt.port);
    info!("HTTP server: {}", config.http_addr);
    info!("Storage: {:?}", config.storage);
    info!("Device acknowledgments: {}", config.mqtt.enable_device_ack);

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let store = match store::open(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open storage: {}", e);
            std::process::exit(1);
        }
    };

    // Bounded queue between the broker event loop and the dispatcher
    info!("Inbound capacity: {}", config.inbound_capacity);
    let (tx, rx) = mpsc::channel(config.inbound_capacity);

    let router = TopicRouter::new(config.mqtt.enable_device_ack);
    let (manager, connection) =
        ConnectionManager::new(config.mqtt.clone(), router.subscriptions(), tx);

    let dispatcher = Dispatcher::new(
        router,
        TelemetryIngestor::new(store.clone()),
        config.mqtt.enable_device_ack,
    );

    let state = AppState {
        aggregator: StateAggregator::new(store.clone()),
        publisher: CommandPublisher::new(connection.clone(), store.clone()),
        connection,
        store,
    };

    let mqtt_handle = tokio::spawn(manager.run());
    let dispatcher_handle = tokio::spawn(dispatch::run_dispatcher(rx, dispatcher));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = dispatcher_handle => {
            error!("Dispatcher task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::gather_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
