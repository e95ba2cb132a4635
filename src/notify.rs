//! Side effects of committed transitions: chat messages, durable notification
//! records and their live pushes. Nothing here can fail a transition; storage
//! errors are logged and the push still goes out.

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::{
    booking::ReservationAction,
    db::{db_list, db_put, db_update, new_id},
    error::AppError,
    models::{Actor, ChatMessage, NegotiationView, Notification, Reservation},
    service_request::RequestAction,
    state::AppState,
};

pub const RESERVATION_EVENT: &str = "reservation.updated";
pub const RESERVATION_DELETED_EVENT: &str = "reservation.deleted";
pub const REQUEST_EVENT: &str = "request.updated";
pub const NOTIFICATION_EVENT: &str = "notification.created";
pub const MESSAGE_EVENT: &str = "message.created";

pub fn reservation_requested(state: &AppState, reservation: &Reservation) {
    state
        .hub
        .push(&reservation.owner_id, RESERVATION_EVENT, reservation);
    record_notification(
        state,
        &reservation.owner_id,
        "reservation.requested",
        "New reservation request",
        format!("A client requested a {} booking.", reservation.tier),
        &reservation.id,
    );
}

pub fn reservation_changed(
    state: &AppState,
    reservation: &Reservation,
    action: ReservationAction,
    actor: &Actor,
) {
    let recipient = reservation.counterparty_of(&actor.user_id);
    state
        .hub
        .push(&reservation.client_id, RESERVATION_EVENT, reservation);
    state
        .hub
        .push(&reservation.owner_id, RESERVATION_EVENT, reservation);

    if let Some(body) = reservation_message(reservation, action) {
        post_message(state, &reservation.id, &actor.user_id, recipient, body);
    }
    record_notification(
        state,
        recipient,
        &format!("reservation.{}", action.as_str()),
        &format!("Reservation {}", action.as_str()),
        format!("Your {} reservation was {}.", reservation.tier, action.as_str()),
        &reservation.id,
    );
}

pub fn reservation_deleted(state: &AppState, reservation: &Reservation, actor: &Actor) {
    let payload = json!({ "id": reservation.id });
    state.hub.push(&reservation.client_id, RESERVATION_DELETED_EVENT, &payload);
    state.hub.push(&reservation.owner_id, RESERVATION_DELETED_EVENT, &payload);
    record_notification(
        state,
        reservation.counterparty_of(&actor.user_id),
        "reservation.deleted",
        "Reservation removed",
        format!("A {} reservation was removed.", reservation.tier),
        &reservation.id,
    );
}

/// Human readable summary posted to the reservation thread. Only accept,
/// reject and confirm produce one.
pub fn reservation_message(reservation: &Reservation, action: ReservationAction) -> Option<String> {
    match action {
        ReservationAction::Accept => {
            let base = reservation.base_price.unwrap_or_default();
            let final_price = reservation.final_price.unwrap_or(base);
            let discount = reservation.discount.unwrap_or_default();
            let mut body = format!(
                "Your reservation for {} has been accepted. Price: {final_price}",
                reservation.tier
            );
            if discount > 0 {
                body.push_str(&format!(" (regular {base}, discount {discount})"));
            }
            body.push('.');
            Some(body)
        }
        ReservationAction::Reject => {
            let reason = reservation.rejection_reason?;
            let mut body = format!("Your reservation request was declined: {reason}");
            if let Some(note) = &reservation.rejection_note {
                body.push_str(&format!(" ({note})"));
            }
            body.push('.');
            Some(body)
        }
        ReservationAction::Confirm => {
            let code = reservation.confirmation_code.as_deref()?;
            Some(format!(
                "Reservation confirmed for {}. Confirmation code: {code}.",
                reservation.tier
            ))
        }
        ReservationAction::Finish | ReservationAction::Cancel | ReservationAction::Delete => None,
    }
}

pub fn request_opened(state: &AppState, view: &NegotiationView) {
    let negotiation = &view.negotiation;
    state.hub.push(&negotiation.provider_id, REQUEST_EVENT, view);
    record_notification(
        state,
        &negotiation.provider_id,
        "request.opened",
        "New service request",
        "A client sent you a service request.".to_string(),
        &negotiation.id,
    );
}

/// Every service-request transition goes live to both parties; the durable
/// record goes to the side that did not act.
pub fn request_changed(state: &AppState, view: &NegotiationView, action: RequestAction, actor: &Actor) {
    let negotiation = &view.negotiation;
    state.hub.push(&negotiation.client_id, REQUEST_EVENT, view);
    state.hub.push(&negotiation.provider_id, REQUEST_EVENT, view);

    let recipient = if actor.user_id == negotiation.client_id {
        &negotiation.provider_id
    } else {
        &negotiation.client_id
    };
    let body = match (action, negotiation.price, negotiation.duration_minutes) {
        (RequestAction::Approve, Some(price), Some(minutes)) => {
            format!("Your request was approved: {price} for {minutes} minutes.")
        }
        (RequestAction::ClientConfirm, _, _) => {
            "The request is now active. Contact details are visible.".to_string()
        }
        _ => format!("The service request was {}.", action.as_str()),
    };
    record_notification(
        state,
        recipient,
        &format!("request.{}", action.as_str()),
        &format!("Service request {}", action.as_str()),
        body,
        &negotiation.id,
    );
}

/// Durable history for `user_id`, newest first.
pub fn list_notifications(state: &AppState, user_id: &str) -> Result<Vec<Notification>, AppError> {
    let mut notifications = db_list(&state.db, |n: &Notification| n.user_id == user_id)?;
    notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(notifications)
}

pub fn mark_read(state: &AppState, id: &str, actor: &Actor) -> Result<Notification, AppError> {
    db_update(&state.db, id, |notification: &mut Notification| {
        if notification.user_id != actor.user_id {
            return Err(AppError::forbidden("not your notification"));
        }
        notification.read = true;
        Ok(())
    })
}

fn post_message(state: &AppState, thread_id: &str, sender_id: &str, recipient_id: &str, body: String) {
    let message = ChatMessage {
        id: new_id(),
        thread_id: thread_id.to_string(),
        sender_id: sender_id.to_string(),
        recipient_id: recipient_id.to_string(),
        body,
        created_at: Utc::now(),
    };
    if let Err(err) = db_put(&state.db, &message) {
        warn!(thread_id, "failed to store chat message: {err}");
    }
    state.hub.push(sender_id, MESSAGE_EVENT, &message);
    state.hub.push(recipient_id, MESSAGE_EVENT, &message);
}

fn record_notification(
    state: &AppState,
    user_id: &str,
    kind: &str,
    title: &str,
    body: String,
    entity_id: &str,
) {
    let notification = Notification {
        id: new_id(),
        user_id: user_id.to_string(),
        kind: kind.to_string(),
        title: title.to_string(),
        body,
        entity_id: entity_id.to_string(),
        read: false,
        created_at: Utc::now(),
    };
    if let Err(err) = db_put(&state.db, &notification) {
        warn!(user_id, kind, "failed to store notification: {err}");
    }
    state.hub.push(user_id, NOTIFICATION_EVENT, &notification);
}
