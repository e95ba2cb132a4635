//! Owner-side seeding of priced resources, rooms and promotions. Listing
//! promotions is where lazy expiry shows up for owners.

use chrono::Utc;
use tracing::info;

use crate::{
    db::{db_put, db_require, db_update, new_id, refresh_promotions},
    error::AppError,
    models::{Actor, CreatePromotion, CreateResource, CreateRoom, PriceList, Promotion, Resource, Role, Room},
    state::AppState,
};

pub fn create_resource(state: &AppState, actor: &Actor, request: CreateResource) -> Result<Resource, AppError> {
    require_owner(actor)?;
    let name = required_name(&request.name)?;
    validate_prices(&request.prices)?;
    if request.prices.is_empty() {
        return Err(AppError::validation("a resource needs at least one price"));
    }
    let resource = Resource {
        id: new_id(),
        owner_id: actor.user_id.clone(),
        name,
        prices: request.prices,
        created_at: Utc::now(),
    };
    db_put(&state.db, &resource)?;
    info!(resource_id = %resource.id, owner_id = %resource.owner_id, "resource created");
    Ok(resource)
}

pub fn create_room(
    state: &AppState,
    actor: &Actor,
    resource_id: &str,
    request: CreateRoom,
) -> Result<Room, AppError> {
    let resource = owned_resource(state, actor, resource_id)?;
    let name = required_name(&request.name)?;
    validate_prices(&request.prices)?;
    let room = Room {
        id: new_id(),
        resource_id: resource.id,
        owner_id: resource.owner_id,
        name,
        prices: request.prices,
        created_at: Utc::now(),
    };
    db_put(&state.db, &room)?;
    info!(room_id = %room.id, resource_id, "room created");
    Ok(room)
}

pub fn create_promotion(
    state: &AppState,
    actor: &Actor,
    request: CreatePromotion,
) -> Result<Promotion, AppError> {
    let resource = owned_resource(state, actor, &request.resource_id)?;
    let title = required_name(&request.title)?;
    match (request.discount_percent, request.discount_amount) {
        (None, None) => {
            return Err(AppError::validation("a promotion needs a percentage or an amount"));
        }
        (Some(percent), _) if !(percent > 0.0 && percent <= 100.0) => {
            return Err(AppError::validation("discount_percent must be in (0, 100]"));
        }
        (None, Some(amount)) if amount <= 0 => {
            return Err(AppError::validation("discount_amount must be > 0"));
        }
        _ => {}
    }
    if let (Some(start), Some(end)) = (request.starts_at, request.ends_at) {
        if end <= start {
            return Err(AppError::validation("ends_at must be after starts_at"));
        }
    }
    let scoped_rooms = request.room_id.iter().chain(request.room_ids.iter());
    for room_id in scoped_rooms {
        let room: Room = db_require(&state.db, room_id)?;
        if room.resource_id != resource.id {
            return Err(AppError::validation(format!(
                "room {room_id} does not belong to resource {}",
                resource.id
            )));
        }
    }

    let promotion = Promotion {
        id: new_id(),
        resource_id: resource.id,
        owner_id: resource.owner_id,
        title,
        room_id: request.room_id,
        room_ids: request.room_ids,
        discount_percent: request.discount_percent,
        discount_amount: request.discount_amount,
        active: true,
        starts_at: request.starts_at,
        ends_at: request.ends_at,
        created_at: Utc::now(),
    };
    db_put(&state.db, &promotion)?;
    info!(promotion_id = %promotion.id, resource_id = %promotion.resource_id, "promotion created");
    Ok(promotion)
}

pub fn list_promotions(state: &AppState, actor: &Actor, resource_id: &str) -> Result<Vec<Promotion>, AppError> {
    owned_resource(state, actor, resource_id)?;
    refresh_promotions(&state.db, resource_id, Utc::now())
}

pub fn toggle_promotion(state: &AppState, actor: &Actor, promotion_id: &str) -> Result<Promotion, AppError> {
    require_owner(actor)?;
    let now = Utc::now();
    db_update(&state.db, promotion_id, |promotion: &mut Promotion| {
        if promotion.owner_id != actor.user_id {
            return Err(AppError::forbidden("not your promotion"));
        }
        if !promotion.active && promotion.is_expired(now) {
            return Err(AppError::validation("promotion window has ended"));
        }
        promotion.active = !promotion.active;
        Ok(())
    })
}

fn require_owner(actor: &Actor) -> Result<(), AppError> {
    if actor.role != Role::Owner {
        return Err(AppError::forbidden("owner role required"));
    }
    Ok(())
}

fn owned_resource(state: &AppState, actor: &Actor, resource_id: &str) -> Result<Resource, AppError> {
    require_owner(actor)?;
    let resource: Resource = db_require(&state.db, resource_id)?;
    if resource.owner_id != actor.user_id {
        return Err(AppError::forbidden("not your resource"));
    }
    Ok(resource)
}

fn required_name(value: &str) -> Result<String, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("name is required"));
    }
    Ok(trimmed.to_string())
}

fn validate_prices(prices: &PriceList) -> Result<(), AppError> {
    if prices.values().any(|price| *price < 0) {
        return Err(AppError::validation("prices must be >= 0"));
    }
    Ok(())
}
