mod auth;
mod booking;
mod catalog;
mod config;
mod db;
mod error;
mod handlers;
mod hub;
mod models;
mod notify;
mod pricing;
mod service_request;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post, put},
};
use dotenvy::dotenv;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    db::{init_db, open_db},
    handlers::*,
    hub::NotificationHub,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = Arc::new(Config::from_env()?);
    let db = Arc::new(open_db(&cfg.db_path).map_err(|err| anyhow::anyhow!(err))?);
    init_db(&db).map_err(|err| anyhow::anyhow!(err))?;

    let hub = NotificationHub::new(cfg.channel_capacity);
    let keepalive = hub.spawn_keepalive(cfg.keepalive_interval());

    let state = AppState {
        db,
        cfg: cfg.clone(),
        hub: hub.clone(),
    };

    let cors = if cfg.cors_allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins = cfg
            .cors_origins
            .iter()
            .map(|origin| HeaderValue::from_str(origin))
            .collect::<Result<Vec<_>, _>>()?;
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/api/events", get(events))
        .route("/api/me/contact", put(update_contact))
        .route("/api/resources", post(create_resource))
        .route("/api/resources/:id/rooms", post(create_room))
        .route("/api/pricing/quote", get(quote))
        .route("/api/promotions", post(create_promotion).get(list_promotions))
        .route("/api/promotions/:id/toggle", post(toggle_promotion))
        .route(
            "/api/reservations",
            post(create_reservation).get(list_reservations),
        )
        .route(
            "/api/reservations/:id",
            get(get_reservation).delete(delete_reservation),
        )
        .route("/api/reservations/:id/messages", get(reservation_messages))
        .route("/api/reservations/:id/accept", post(accept_reservation))
        .route("/api/reservations/:id/reject", post(reject_reservation))
        .route("/api/reservations/:id/confirm", post(confirm_reservation))
        .route("/api/reservations/:id/finish", post(finish_reservation))
        .route("/api/reservations/:id/cancel", post(cancel_reservation))
        .route("/api/requests", post(open_request).get(list_requests))
        .route("/api/requests/:id", get(get_request))
        .route("/api/requests/:id/approve", post(approve_request))
        .route("/api/requests/:id/reject", post(reject_request))
        .route("/api/requests/:id/confirm", post(confirm_request))
        .route("/api/requests/:id/cancel", post(cancel_request))
        .route("/api/requests/:id/finish", post(finish_request))
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/:id/read", post(mark_notification_read));

    if cfg.admin_broadcast_enabled {
        // Arbitrary payloads fan out to every channel; keep them small.
        app = app.route(
            "/api/admin/broadcast",
            post(broadcast).layer(DefaultBodyLimit::max(16 * 1024)),
        );
    }

    let app = app.layer(cors).with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!("listening on {}", cfg.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    keepalive.abort();
    Ok(())
}

async fn shutdown_signal(hub: NotificationHub) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    // Open SSE streams end once their channels are dropped.
    hub.shutdown();
}
