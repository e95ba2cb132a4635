//! Service-request workflow between a client and a provider:
//! `pending_approval -> approved -> active -> finished`, with provider rejection
//! from `pending_approval`/`approved` and client cancellation from `approved`.

use chrono::Utc;
use tracing::{info, warn};

use crate::{
    db::{db_insert_unless, db_list, db_require, db_update_if, get_contact, new_id},
    error::AppError,
    models::{Actor, ApproveRequest, Negotiation, NegotiationStatus, NegotiationView, OpenRequest, Role},
    notify,
    state::AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestAction {
    Approve,
    Reject,
    ClientConfirm,
    ClientCancel,
    Finish,
}

impl RequestAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestAction::Approve => "approved",
            RequestAction::Reject => "rejected",
            RequestAction::ClientConfirm => "confirmed",
            RequestAction::ClientCancel => "cancelled",
            RequestAction::Finish => "finished",
        }
    }

    pub fn from_states(self) -> &'static [NegotiationStatus] {
        match self {
            RequestAction::Approve => &[NegotiationStatus::PendingApproval],
            RequestAction::Reject => &[NegotiationStatus::PendingApproval, NegotiationStatus::Approved],
            RequestAction::ClientConfirm | RequestAction::ClientCancel => &[NegotiationStatus::Approved],
            RequestAction::Finish => &[NegotiationStatus::Active],
        }
    }

    pub fn target(self) -> NegotiationStatus {
        match self {
            RequestAction::Approve => NegotiationStatus::Approved,
            RequestAction::Reject => NegotiationStatus::Rejected,
            RequestAction::ClientConfirm => NegotiationStatus::Active,
            RequestAction::ClientCancel => NegotiationStatus::CancelledByClient,
            RequestAction::Finish => NegotiationStatus::Finished,
        }
    }
}

pub fn can_transition(negotiation: &Negotiation, actor: &Actor, action: RequestAction) -> bool {
    let is_provider = actor.role == Role::Owner && actor.user_id == negotiation.provider_id;
    let is_client = actor.role == Role::Client && actor.user_id == negotiation.client_id;
    match action {
        RequestAction::Approve | RequestAction::Reject | RequestAction::Finish => is_provider,
        RequestAction::ClientConfirm | RequestAction::ClientCancel => is_client,
    }
}

/// Opens a request, or hands back the one the client already has open with the
/// same provider. The flag reports whether a new record was created.
pub fn open_request(
    state: &AppState,
    actor: &Actor,
    request: OpenRequest,
) -> Result<(NegotiationView, bool), AppError> {
    if actor.role != Role::Client {
        return Err(AppError::forbidden("only clients can open service requests"));
    }
    let provider_id = request.provider_id.trim().to_string();
    if provider_id.is_empty() {
        return Err(AppError::validation("provider_id is required"));
    }
    if provider_id == actor.user_id {
        return Err(AppError::validation("cannot open a request with yourself"));
    }

    let now = Utc::now();
    let candidate = Negotiation {
        id: new_id(),
        client_id: actor.user_id.clone(),
        provider_id: provider_id.clone(),
        status: NegotiationStatus::PendingApproval,
        preferred_at: request.preferred_at,
        location: request.location.filter(|value| !value.trim().is_empty()),
        client_comment: request.comment.filter(|value| !value.trim().is_empty()),
        price: None,
        duration_minutes: None,
        provider_comment: None,
        created_at: now,
        updated_at: now,
    };
    let (negotiation, created) = db_insert_unless(&state.db, candidate, |stored: &Negotiation| {
        stored.client_id == actor.user_id
            && stored.provider_id == provider_id
            && stored.status.is_open()
    })?;

    let view = view_of(state, negotiation)?;
    if created {
        info!(request_id = %view.negotiation.id, client_id = %actor.user_id, "service request opened");
        notify::request_opened(state, &view);
    } else {
        info!(request_id = %view.negotiation.id, "open service request already exists");
    }
    Ok((view, created))
}

pub fn get_request(state: &AppState, id: &str, actor: &Actor) -> Result<NegotiationView, AppError> {
    let negotiation: Negotiation = db_require(&state.db, id)?;
    if actor.user_id != negotiation.client_id && actor.user_id != negotiation.provider_id {
        return Err(AppError::forbidden("not a party to this service request"));
    }
    view_of(state, negotiation)
}

pub fn list_requests(state: &AppState, actor: &Actor) -> Result<Vec<NegotiationView>, AppError> {
    db_list(&state.db, |negotiation: &Negotiation| {
        negotiation.client_id == actor.user_id || negotiation.provider_id == actor.user_id
    })?
    .into_iter()
    .map(|negotiation| view_of(state, negotiation))
    .collect()
}

pub fn approve(
    state: &AppState,
    id: &str,
    actor: &Actor,
    payload: ApproveRequest,
) -> Result<NegotiationView, AppError> {
    if payload.price <= 0 {
        return Err(AppError::validation("price must be a positive integer"));
    }
    if !state.cfg.service_durations.contains(&payload.duration_minutes) {
        return Err(AppError::validation(format!(
            "duration must be one of {:?} minutes",
            state.cfg.service_durations
        )));
    }
    let comment = payload.comment.filter(|value| !value.trim().is_empty());
    transition(state, id, actor, RequestAction::Approve, move |negotiation| {
        negotiation.price = Some(payload.price);
        negotiation.duration_minutes = Some(payload.duration_minutes);
        negotiation.provider_comment = comment;
    })
}

pub fn reject(state: &AppState, id: &str, actor: &Actor) -> Result<NegotiationView, AppError> {
    transition(state, id, actor, RequestAction::Reject, |_| {})
}

pub fn client_confirm(state: &AppState, id: &str, actor: &Actor) -> Result<NegotiationView, AppError> {
    transition(state, id, actor, RequestAction::ClientConfirm, |_| {})
}

pub fn client_cancel(state: &AppState, id: &str, actor: &Actor) -> Result<NegotiationView, AppError> {
    transition(state, id, actor, RequestAction::ClientCancel, |_| {})
}

pub fn finish(state: &AppState, id: &str, actor: &Actor) -> Result<NegotiationView, AppError> {
    transition(state, id, actor, RequestAction::Finish, |_| {})
}

/// Contact phones are attached only while the status makes them visible.
pub fn view_of(state: &AppState, negotiation: Negotiation) -> Result<NegotiationView, AppError> {
    let contact_visible = negotiation.status.contact_visible();
    let (client_phone, provider_phone) = if contact_visible {
        (
            get_contact(&state.db, &negotiation.client_id)?,
            get_contact(&state.db, &negotiation.provider_id)?,
        )
    } else {
        (None, None)
    };
    Ok(NegotiationView {
        negotiation,
        contact_visible,
        client_phone,
        provider_phone,
    })
}

fn transition<F>(
    state: &AppState,
    id: &str,
    actor: &Actor,
    action: RequestAction,
    apply: F,
) -> Result<NegotiationView, AppError>
where
    F: FnOnce(&mut Negotiation),
{
    let current: Negotiation = db_require(&state.db, id)?;
    if !can_transition(&current, actor, action) {
        warn!(request_id = id, user_id = %actor.user_id, action = action.as_str(), "actor may not perform action");
        return Err(AppError::forbidden(format!(
            "user {} may not mark service request {id} as {}",
            actor.user_id,
            action.as_str()
        )));
    }

    let updated = db_update_if(&state.db, id, action.from_states(), |negotiation: &mut Negotiation| {
        apply(negotiation);
        negotiation.status = action.target();
        negotiation.updated_at = Utc::now();
        Ok(())
    })
    .inspect_err(|err| warn!(request_id = id, action = action.as_str(), "transition refused: {err}"))?;
    info!(request_id = id, user_id = %actor.user_id, status = ?updated.status, "service request transition committed");

    let view = view_of(state, updated)?;
    notify::request_changed(state, &view, action, actor);
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        booking::tests::test_state,
        db::{db_put, set_contact},
        error::ErrorKind,
        models::Notification,
    };

    fn client() -> Actor {
        Actor::new("client-1", Role::Client)
    }

    fn provider() -> Actor {
        Actor::new("provider-1", Role::Owner)
    }

    fn open(state: &AppState) -> NegotiationView {
        let (view, created) = open_request(
            state,
            &client(),
            OpenRequest {
                provider_id: "provider-1".to_string(),
                preferred_at: None,
                location: Some("Shibuya".to_string()),
                comment: Some("two sessions".to_string()),
            },
        )
        .unwrap();
        assert!(created);
        view
    }

    fn approve_with(state: &AppState, id: &str, price: i64, minutes: u32) -> Result<NegotiationView, AppError> {
        approve(
            state,
            id,
            &provider(),
            ApproveRequest {
                price,
                duration_minutes: minutes,
                comment: None,
            },
        )
    }

    #[test]
    fn approve_then_confirm_reveals_contacts() {
        let (_dir, state) = test_state();
        set_contact(&state.db, "client-1", "090-1111-1111").unwrap();
        set_contact(&state.db, "provider-1", "090-2222-2222").unwrap();
        let opened = open(&state);
        assert!(!opened.contact_visible);
        assert!(opened.negotiation.price.is_none());

        let approved = approve_with(&state, &opened.negotiation.id, 50000, 60).unwrap();
        assert_eq!(approved.negotiation.status, NegotiationStatus::Approved);
        assert_eq!(approved.negotiation.price, Some(50000));
        assert_eq!(approved.negotiation.duration_minutes, Some(60));
        assert!(!approved.contact_visible);
        assert!(approved.client_phone.is_none());

        let active = client_confirm(&state, &opened.negotiation.id, &client()).unwrap();
        assert_eq!(active.negotiation.status, NegotiationStatus::Active);
        assert!(active.contact_visible);
        assert_eq!(active.client_phone.as_deref(), Some("090-1111-1111"));
        assert_eq!(active.provider_phone.as_deref(), Some("090-2222-2222"));

        let seen_by_provider = get_request(&state, &opened.negotiation.id, &provider()).unwrap();
        assert!(seen_by_provider.contact_visible);
        assert_eq!(seen_by_provider.client_phone.as_deref(), Some("090-1111-1111"));

        let finished = finish(&state, &opened.negotiation.id, &provider()).unwrap();
        assert_eq!(finished.negotiation.status, NegotiationStatus::Finished);
        assert!(finished.contact_visible);
    }

    #[test]
    fn opening_twice_returns_the_open_request() {
        let (_dir, state) = test_state();
        let first = open(&state);
        let (again, created) = open_request(
            &state,
            &client(),
            OpenRequest {
                provider_id: "provider-1".to_string(),
                preferred_at: None,
                location: None,
                comment: None,
            },
        )
        .unwrap();
        assert!(!created);
        assert_eq!(again.negotiation.id, first.negotiation.id);

        reject(&state, &first.negotiation.id, &provider()).unwrap();
        let reopened = open(&state);
        assert_ne!(reopened.negotiation.id, first.negotiation.id);
    }

    #[test]
    fn pending_evaluation_still_blocks_duplicates() {
        let (_dir, state) = test_state();
        let first = open(&state);
        let mut stored: Negotiation = db_require(&state.db, &first.negotiation.id).unwrap();
        stored.status = NegotiationStatus::PendingEvaluation;
        db_put(&state.db, &stored).unwrap();

        let (again, created) = open_request(
            &state,
            &client(),
            OpenRequest {
                provider_id: "provider-1".to_string(),
                preferred_at: None,
                location: None,
                comment: None,
            },
        )
        .unwrap();
        assert!(!created);
        assert_eq!(again.negotiation.id, first.negotiation.id);
    }

    #[test]
    fn approve_validates_price_and_duration() {
        let (_dir, state) = test_state();
        let opened = open(&state);
        let id = &opened.negotiation.id;

        assert_eq!(approve_with(&state, id, 0, 60).unwrap_err().kind, ErrorKind::ValidationFailed);
        assert_eq!(approve_with(&state, id, 5000, 45).unwrap_err().kind, ErrorKind::ValidationFailed);
        assert!(approve_with(&state, id, 5000, 90).is_ok());
        assert_eq!(approve_with(&state, id, 5000, 90).unwrap_err().kind, ErrorKind::InvalidTransition);
    }

    #[test]
    fn legal_transitions_match_the_table() {
        use NegotiationStatus::*;
        use RequestAction::*;

        let (_dir, state) = test_state();
        let legal = [
            (PendingApproval, Approve, Approved),
            (PendingApproval, Reject, Rejected),
            (Approved, Reject, Rejected),
            (Approved, ClientConfirm, Active),
            (Approved, ClientCancel, CancelledByClient),
            (Active, Finish, Finished),
        ];
        let statuses = [
            PendingApproval,
            Approved,
            Active,
            PendingEvaluation,
            Finished,
            Rejected,
            CancelledByClient,
        ];
        let actions = [Approve, Reject, ClientConfirm, ClientCancel, Finish];

        for status in statuses {
            for action in actions {
                let mut negotiation = open(&state).negotiation;
                negotiation.status = status;
                db_put(&state.db, &negotiation).unwrap();

                let (permitted, wrong) = match action {
                    Approve | Reject | Finish => (provider(), client()),
                    ClientConfirm | ClientCancel => (client(), provider()),
                };
                let run = |actor: &Actor| match action {
                    Approve => approve_with(&state, &negotiation.id, 1000, 30),
                    Reject => reject(&state, &negotiation.id, actor),
                    ClientConfirm => client_confirm(&state, &negotiation.id, actor),
                    ClientCancel => client_cancel(&state, &negotiation.id, actor),
                    Finish => finish(&state, &negotiation.id, actor),
                };

                if action != Approve {
                    assert_eq!(run(&wrong).unwrap_err().kind, ErrorKind::Forbidden, "{status:?} {action:?}");
                }
                match legal.iter().find(|(from, act, _)| *from == status && *act == action) {
                    Some((_, _, to)) => {
                        assert_eq!(run(&permitted).unwrap().negotiation.status, *to, "{status:?} {action:?}")
                    }
                    None => assert_eq!(
                        run(&permitted).unwrap_err().kind,
                        ErrorKind::InvalidTransition,
                        "{status:?} {action:?}"
                    ),
                }

                // Close it out so the next iteration can open a fresh request.
                let mut closed: Negotiation = db_require(&state.db, &negotiation.id).unwrap();
                closed.status = Rejected;
                db_put(&state.db, &closed).unwrap();
            }
        }
    }

    #[test]
    fn client_cannot_approve() {
        let (_dir, state) = test_state();
        let opened = open(&state);
        let err = approve(
            &state,
            &opened.negotiation.id,
            &client(),
            ApproveRequest {
                price: 1000,
                duration_minutes: 30,
                comment: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[test]
    fn every_transition_reaches_both_parties() {
        let (_dir, state) = test_state();
        let (_c, mut client_rx) = state.hub.connect("client-1");
        let (_p, mut provider_rx) = state.hub.connect("provider-1");
        let opened = open(&state);
        approve_with(&state, &opened.negotiation.id, 50000, 60).unwrap();

        let updates = |rx: &mut tokio::sync::mpsc::Receiver<crate::hub::HubEvent>| {
            let mut count = 0;
            while let Ok(event) = rx.try_recv() {
                if event.event == notify::REQUEST_EVENT {
                    count += 1;
                }
            }
            count
        };
        assert_eq!(updates(&mut client_rx), 1);
        assert_eq!(updates(&mut provider_rx), 2);

        let for_client = db_list(&state.db, |n: &Notification| n.user_id == "client-1").unwrap();
        assert_eq!(for_client.len(), 1);
        assert_eq!(for_client[0].kind, "request.approved");
    }
}
