use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use tracing::info;

use crate::{
    booking, catalog,
    db::set_contact,
    error::AppError,
    hub::valid_event_name,
    models::{
        Actor, ApproveRequest, BroadcastRequest, ChatMessage, ContactUpdate, CreatePromotion,
        CreateReservation, CreateResource, CreateRoom, NegotiationView, Notification, OpenRequest,
        Promotion, QuoteQuery, RejectReservation, Reservation, Resource, Role, Room,
    },
    notify,
    pricing::{self, PriceQuote},
    service_request,
    state::AppState,
};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Long-lived push channel. The registration lives inside the stream, so the
/// channel is deregistered whenever axum drops the response body.
pub async fn events(
    State(state): State<AppState>,
    actor: Actor,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (registration, receiver) = state.hub.connect(&actor.user_id);
    info!(
        user_id = %actor.user_id,
        channels = state.hub.connection_count(&actor.user_id),
        "push channel opened"
    );
    let stream = stream::unfold((receiver, registration), |(mut receiver, registration)| async move {
        let Some(event) = receiver.recv().await else {
            return None;
        };
        let sse = Event::default().event(&event.event).data(&*event.data);
        Some((Ok::<_, Infallible>(sse), (receiver, registration)))
    });
    Sse::new(stream)
}

pub async fn broadcast(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<BroadcastRequest>,
) -> Result<StatusCode, AppError> {
    if actor.role != Role::Admin {
        return Err(AppError::forbidden("admin role required"));
    }
    let event = request.event.trim();
    if event.is_empty() {
        return Err(AppError::validation("event name required"));
    }
    if !valid_event_name(event) {
        return Err(AppError::validation("event name must be a single line"));
    }
    info!(user_id = %actor.user_id, event, users = state.hub.user_count(), "broadcasting to all channels");
    state.hub.broadcast_all(event, &request.payload);
    Ok(StatusCode::ACCEPTED)
}

pub async fn update_contact(
    State(state): State<AppState>,
    actor: Actor,
    Json(update): Json<ContactUpdate>,
) -> Result<StatusCode, AppError> {
    let phone = update.phone.trim();
    if phone.is_empty() || phone.len() > 32 {
        return Err(AppError::validation("phone must be 1 to 32 characters"));
    }
    set_contact(&state.db, &actor.user_id, phone)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_resource(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreateResource>,
) -> Result<(StatusCode, Json<Resource>), AppError> {
    let resource = catalog::create_resource(&state, &actor, request)?;
    Ok((StatusCode::CREATED, Json(resource)))
}

pub async fn create_room(
    State(state): State<AppState>,
    actor: Actor,
    Path(resource_id): Path<String>,
    Json(request): Json<CreateRoom>,
) -> Result<(StatusCode, Json<Room>), AppError> {
    let room = catalog::create_room(&state, &actor, &resource_id, request)?;
    Ok((StatusCode::CREATED, Json(room)))
}

pub async fn quote(
    State(state): State<AppState>,
    _actor: Actor,
    Query(query): Query<QuoteQuery>,
) -> Result<Json<PriceQuote>, AppError> {
    let quote = pricing::quote(
        &state.db,
        &query.resource_id,
        query.room_id.as_deref(),
        query.tier,
        Utc::now(),
    )?;
    Ok(Json(quote))
}

#[derive(Deserialize)]
pub struct PromotionQuery {
    pub resource_id: String,
}

pub async fn create_promotion(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreatePromotion>,
) -> Result<(StatusCode, Json<Promotion>), AppError> {
    let promotion = catalog::create_promotion(&state, &actor, request)?;
    Ok((StatusCode::CREATED, Json(promotion)))
}

pub async fn list_promotions(
    State(state): State<AppState>,
    actor: Actor,
    Query(query): Query<PromotionQuery>,
) -> Result<Json<Vec<Promotion>>, AppError> {
    Ok(Json(catalog::list_promotions(&state, &actor, &query.resource_id)?))
}

pub async fn toggle_promotion(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Promotion>, AppError> {
    Ok(Json(catalog::toggle_promotion(&state, &actor, &id)?))
}

pub async fn create_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CreateReservation>,
) -> Result<(StatusCode, Json<Reservation>), AppError> {
    let reservation = booking::create_reservation(&state, &actor, request)?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

pub async fn list_reservations(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<Reservation>>, AppError> {
    Ok(Json(booking::list_reservations(&state, &actor)?))
}

pub async fn get_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(booking::get_reservation(&state, &id, &actor)?))
}

pub async fn delete_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    booking::delete(&state, &id, &actor)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reservation_messages(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    Ok(Json(booking::list_messages(&state, &id, &actor)?))
}

pub async fn accept_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(booking::accept(&state, &id, &actor)?))
}

pub async fn reject_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
    Json(payload): Json<RejectReservation>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(booking::reject(&state, &id, &actor, payload)?))
}

pub async fn confirm_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(booking::confirm(&state, &id, &actor)?))
}

pub async fn finish_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(booking::finish(&state, &id, &actor)?))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, AppError> {
    Ok(Json(booking::cancel(&state, &id, &actor)?))
}

pub async fn open_request(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<OpenRequest>,
) -> Result<(StatusCode, Json<NegotiationView>), AppError> {
    let (view, created) = service_request::open_request(&state, &actor, request)?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(view)))
}

pub async fn list_requests(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<NegotiationView>>, AppError> {
    Ok(Json(service_request::list_requests(&state, &actor)?))
}

pub async fn get_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(service_request::get_request(&state, &id, &actor)?))
}

pub async fn approve_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
    Json(payload): Json<ApproveRequest>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(service_request::approve(&state, &id, &actor, payload)?))
}

pub async fn reject_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(service_request::reject(&state, &id, &actor)?))
}

pub async fn confirm_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(service_request::client_confirm(&state, &id, &actor)?))
}

pub async fn cancel_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(service_request::client_cancel(&state, &id, &actor)?))
}

pub async fn finish_request(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<NegotiationView>, AppError> {
    Ok(Json(service_request::finish(&state, &id, &actor)?))
}

pub async fn list_notifications(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<Notification>>, AppError> {
    Ok(Json(notify::list_notifications(&state, &actor.user_id)?))
}

pub async fn mark_notification_read(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<String>,
) -> Result<Json<Notification>, AppError> {
    Ok(Json(notify::mark_read(&state, &id, &actor)?))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{booking::tests::test_state, error::ErrorKind};

    fn admin() -> Actor {
        Actor::new("admin-1", Role::Admin)
    }

    #[tokio::test]
    async fn broadcast_rejects_multi_line_event_names() {
        let (_dir, state) = test_state();
        let (_reg, mut rx) = state.hub.connect("u1");

        for name in ["maint\nenance", "maint\r\nenance"] {
            let err = broadcast(
                State(state.clone()),
                admin(),
                Json(BroadcastRequest {
                    event: name.to_string(),
                    payload: json!({}),
                }),
            )
            .await
            .unwrap_err();
            assert_eq!(err.kind, ErrorKind::ValidationFailed);
        }
        assert!(rx.try_recv().is_err());

        let status = broadcast(
            State(state.clone()),
            admin(),
            Json(BroadcastRequest {
                event: "maintenance".to_string(),
                payload: json!({ "at": "22:00" }),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().unwrap().event, "maintenance");
    }

    #[tokio::test]
    async fn broadcast_requires_admin() {
        let (_dir, state) = test_state();
        let err = broadcast(
            State(state),
            Actor::new("client-1", Role::Client),
            Json(BroadcastRequest {
                event: "maintenance".to_string(),
                payload: json!({}),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn dropping_the_event_stream_deregisters_its_channel() {
        let (_dir, state) = test_state();
        let actor = Actor::new("client-1", Role::Client);

        let first = events(State(state.clone()), actor.clone()).await;
        let second = events(State(state.clone()), actor).await;
        assert_eq!(state.hub.connection_count("client-1"), 2);

        drop(first);
        assert_eq!(state.hub.connection_count("client-1"), 1);
        drop(second);
        assert_eq!(state.hub.connection_count("client-1"), 0);
        assert_eq!(state.hub.user_count(), 0);
    }
}
