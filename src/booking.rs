//! Reservation workflow: `pending -> accepted -> confirmed -> finished`, with
//! `pending -> rejected` and `{pending, accepted, confirmed} -> cancelled`.
//!
//! Every status change goes through `db_update_if`, so a stale or duplicate
//! request loses the compare-and-swap and reports `InvalidTransition`.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    db::{db_delete_if, db_list, db_put, db_require, db_update_if, new_id},
    error::AppError,
    models::{
        Actor, ChatMessage, CreateReservation, RejectReservation, RejectionReason, Reservation,
        ReservationStatus, Resource, Role,
    },
    notify,
    pricing::{base_price, resolve_price},
    state::AppState,
};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const ABSORBING: [ReservationStatus; 3] = [
    ReservationStatus::Finished,
    ReservationStatus::Rejected,
    ReservationStatus::Cancelled,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationAction {
    Accept,
    Reject,
    Confirm,
    Finish,
    Cancel,
    Delete,
}

impl ReservationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationAction::Accept => "accepted",
            ReservationAction::Reject => "rejected",
            ReservationAction::Confirm => "confirmed",
            ReservationAction::Finish => "finished",
            ReservationAction::Cancel => "cancelled",
            ReservationAction::Delete => "deleted",
        }
    }

    /// Statuses the conditional write requires.
    pub fn from_states(self) -> &'static [ReservationStatus] {
        match self {
            ReservationAction::Accept | ReservationAction::Reject => &[ReservationStatus::Pending],
            ReservationAction::Confirm => &[ReservationStatus::Accepted],
            ReservationAction::Finish => &[ReservationStatus::Confirmed],
            ReservationAction::Cancel => &[
                ReservationStatus::Pending,
                ReservationStatus::Accepted,
                ReservationStatus::Confirmed,
            ],
            ReservationAction::Delete => &ABSORBING,
        }
    }

    pub fn target(self) -> Option<ReservationStatus> {
        match self {
            ReservationAction::Accept => Some(ReservationStatus::Accepted),
            ReservationAction::Reject => Some(ReservationStatus::Rejected),
            ReservationAction::Confirm => Some(ReservationStatus::Confirmed),
            ReservationAction::Finish => Some(ReservationStatus::Finished),
            ReservationAction::Cancel => Some(ReservationStatus::Cancelled),
            ReservationAction::Delete => None,
        }
    }
}

/// The single authorization rule for reservations: the owner drives
/// accept/reject/finish, the requesting client confirm/cancel, either may delete.
pub fn can_transition(reservation: &Reservation, actor: &Actor, action: ReservationAction) -> bool {
    let is_owner = actor.role == Role::Owner && actor.user_id == reservation.owner_id;
    let is_client = actor.role == Role::Client && actor.user_id == reservation.client_id;
    match action {
        ReservationAction::Accept | ReservationAction::Reject | ReservationAction::Finish => is_owner,
        ReservationAction::Confirm | ReservationAction::Cancel => is_client,
        ReservationAction::Delete => is_owner || is_client,
    }
}

pub fn create_reservation(
    state: &AppState,
    actor: &Actor,
    request: CreateReservation,
) -> Result<Reservation, AppError> {
    if actor.role != Role::Client {
        return Err(AppError::forbidden("only clients can request reservations"));
    }
    let resource: Resource = db_require(&state.db, &request.resource_id)?;
    if resource.owner_id == actor.user_id {
        return Err(AppError::validation("cannot reserve your own resource"));
    }
    // Fails early when the room or the tier cannot be priced.
    base_price(
        &state.db,
        &resource.id,
        request.room_id.as_deref(),
        request.tier,
    )?;

    let now = Utc::now();
    let reservation = Reservation {
        id: new_id(),
        resource_id: resource.id,
        owner_id: resource.owner_id,
        room_id: request.room_id,
        client_id: actor.user_id.clone(),
        status: ReservationStatus::Pending,
        tier: request.tier,
        base_price: None,
        discount: None,
        final_price: None,
        promotion_id: None,
        scheduled_at: request.scheduled_at,
        note: request.note.filter(|note| !note.trim().is_empty()),
        rejection_reason: None,
        rejection_note: None,
        confirmation_code: None,
        created_at: now,
        updated_at: now,
    };
    db_put(&state.db, &reservation)?;
    info!(reservation_id = %reservation.id, client_id = %reservation.client_id, "reservation requested");
    notify::reservation_requested(state, &reservation);
    Ok(reservation)
}

pub fn get_reservation(state: &AppState, id: &str, actor: &Actor) -> Result<Reservation, AppError> {
    let reservation: Reservation = db_require(&state.db, id)?;
    if !is_party(&reservation, actor) {
        return Err(AppError::forbidden("not a party to this reservation"));
    }
    Ok(reservation)
}

pub fn list_reservations(state: &AppState, actor: &Actor) -> Result<Vec<Reservation>, AppError> {
    db_list(&state.db, |reservation: &Reservation| is_party(reservation, actor))
}

pub fn list_messages(state: &AppState, id: &str, actor: &Actor) -> Result<Vec<ChatMessage>, AppError> {
    let reservation = get_reservation(state, id, actor)?;
    let mut messages = db_list(&state.db, |message: &ChatMessage| message.thread_id == reservation.id)?;
    messages.sort_by_key(|message| message.created_at);
    Ok(messages)
}

/// Owner accepts a pending request; the price is resolved against current
/// promotions and frozen on the record.
pub fn accept(state: &AppState, id: &str, actor: &Actor) -> Result<Reservation, AppError> {
    let current = authorize(state, id, actor, ReservationAction::Accept)?;
    let base = base_price(
        &state.db,
        &current.resource_id,
        current.room_id.as_deref(),
        current.tier,
    )?;
    let quote = resolve_price(
        &state.db,
        &current.resource_id,
        current.room_id.as_deref(),
        current.tier,
        base,
        Utc::now(),
    )?;
    commit(state, id, actor, ReservationAction::Accept, move |reservation| {
        reservation.base_price = Some(quote.base_price);
        reservation.discount = Some(quote.discount);
        reservation.final_price = Some(quote.final_price);
        reservation.promotion_id = quote.promotion_id;
        Ok(())
    })
}

pub fn reject(
    state: &AppState,
    id: &str,
    actor: &Actor,
    payload: RejectReservation,
) -> Result<Reservation, AppError> {
    authorize(state, id, actor, ReservationAction::Reject)?;
    let Some(reason) = payload.reason else {
        return Err(AppError::validation("a rejection reason is required"));
    };
    let note = payload.note.filter(|note| !note.trim().is_empty());
    if reason == RejectionReason::Other && note.is_none() {
        return Err(AppError::validation("rejection reason 'other' requires a note"));
    }
    commit(state, id, actor, ReservationAction::Reject, move |reservation| {
        reservation.rejection_reason = Some(reason);
        reservation.rejection_note = note;
        Ok(())
    })
}

pub fn confirm(state: &AppState, id: &str, actor: &Actor) -> Result<Reservation, AppError> {
    authorize(state, id, actor, ReservationAction::Confirm)?;
    let code_len = state.cfg.confirmation_code_len;
    commit(state, id, actor, ReservationAction::Confirm, move |reservation| {
        if reservation.confirmation_code.is_none() {
            reservation.confirmation_code = Some(confirmation_code(code_len));
        }
        Ok(())
    })
}

pub fn finish(state: &AppState, id: &str, actor: &Actor) -> Result<Reservation, AppError> {
    authorize(state, id, actor, ReservationAction::Finish)?;
    commit(state, id, actor, ReservationAction::Finish, |_| Ok(()))
}

pub fn cancel(state: &AppState, id: &str, actor: &Actor) -> Result<Reservation, AppError> {
    authorize(state, id, actor, ReservationAction::Cancel)?;
    commit(state, id, actor, ReservationAction::Cancel, |_| Ok(()))
}

/// Removes a reservation that already reached an absorbing state.
pub fn delete(state: &AppState, id: &str, actor: &Actor) -> Result<Reservation, AppError> {
    authorize(state, id, actor, ReservationAction::Delete)?;
    let removed = db_delete_if::<Reservation>(&state.db, id, ReservationAction::Delete.from_states())
        .inspect_err(|err| warn!(reservation_id = id, "delete refused: {err}"))?;
    info!(reservation_id = id, user_id = %actor.user_id, "reservation deleted");
    notify::reservation_deleted(state, &removed, actor);
    Ok(removed)
}

pub fn confirmation_code(len: usize) -> String {
    let mut bytes = Vec::with_capacity(len);
    while bytes.len() < len {
        bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    }
    bytes
        .iter()
        .take(len)
        .map(|byte| CODE_ALPHABET[*byte as usize % CODE_ALPHABET.len()] as char)
        .collect()
}

fn is_party(reservation: &Reservation, actor: &Actor) -> bool {
    actor.user_id == reservation.owner_id || actor.user_id == reservation.client_id
}

fn authorize(
    state: &AppState,
    id: &str,
    actor: &Actor,
    action: ReservationAction,
) -> Result<Reservation, AppError> {
    let reservation: Reservation = db_require(&state.db, id)?;
    if !can_transition(&reservation, actor, action) {
        warn!(reservation_id = id, user_id = %actor.user_id, action = action.as_str(), "actor may not perform action");
        return Err(AppError::forbidden(format!(
            "user {} may not mark reservation {id} as {}",
            actor.user_id,
            action.as_str()
        )));
    }
    Ok(reservation)
}

fn commit<F>(
    state: &AppState,
    id: &str,
    actor: &Actor,
    action: ReservationAction,
    apply: F,
) -> Result<Reservation, AppError>
where
    F: FnOnce(&mut Reservation) -> Result<(), AppError>,
{
    let target = action
        .target()
        .ok_or_else(|| AppError::invalid_transition(format!("{} has no target status", action.as_str())))?;
    let updated = db_update_if(&state.db, id, action.from_states(), |reservation: &mut Reservation| {
        apply(reservation)?;
        reservation.status = target;
        reservation.updated_at = Utc::now();
        Ok(())
    })
    .inspect_err(|err| {
        warn!(reservation_id = id, action = action.as_str(), "transition refused: {err}");
    })?;
    info!(
        reservation_id = id,
        user_id = %actor.user_id,
        status = ?updated.status,
        "reservation transition committed"
    );
    notify::reservation_changed(state, &updated, action, actor);
    Ok(updated)
}
