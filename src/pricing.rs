use chrono::{DateTime, Utc};
use redb::Database;
use serde::Serialize;

use crate::{
    db::{db_require, refresh_promotions},
    error::AppError,
    models::{DurationTier, Promotion, Resource, Room},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceQuote {
    pub tier: DurationTier,
    pub base_price: i64,
    pub discount: i64,
    pub final_price: i64,
    pub promotion_id: Option<String>,
}

/// Applies one promotion to `base`. Percentage wins over a fixed amount; a
/// promotion carrying neither leaves the price alone.
pub fn apply_promotion(base: i64, promotion: &Promotion) -> (i64, i64) {
    let final_price = match (promotion.discount_percent, promotion.discount_amount) {
        (Some(percent), _) if percent > 0.0 => {
            let discounted = (base as f64 * (1.0 - percent / 100.0)).round() as i64;
            discounted.max(0)
        }
        (_, Some(amount)) if amount > 0 => (base - amount).max(0),
        _ => base,
    };
    let discount = (base - final_price).max(0);
    (final_price, discount)
}

/// First active, started promotion covering the target room, in store order.
pub fn select_promotion<'a>(
    promotions: &'a [Promotion],
    room_id: Option<&str>,
    now: DateTime<Utc>,
) -> Option<&'a Promotion> {
    promotions
        .iter()
        .find(|promo| promo.active && !promo.is_expired(now) && promo.has_started(now) && promo.covers(room_id))
}

/// Resolves the charged amount for `base` against the resource's promotions.
pub fn resolve_price(
    db: &Database,
    resource_id: &str,
    room_id: Option<&str>,
    tier: DurationTier,
    base: i64,
    now: DateTime<Utc>,
) -> Result<PriceQuote, AppError> {
    let promotions = refresh_promotions(db, resource_id, now)?;
    let quote = match select_promotion(&promotions, room_id, now) {
        Some(promotion) => {
            let (final_price, discount) = apply_promotion(base, promotion);
            PriceQuote {
                tier,
                base_price: base,
                discount,
                final_price,
                promotion_id: Some(promotion.id.clone()),
            }
        }
        None => PriceQuote {
            tier,
            base_price: base,
            discount: 0,
            final_price: base,
            promotion_id: None,
        },
    };
    Ok(quote)
}

/// Base price for a tier: the room's own list first, then the resource's.
pub fn base_price(
    db: &Database,
    resource_id: &str,
    room_id: Option<&str>,
    tier: DurationTier,
) -> Result<i64, AppError> {
    let resource: Resource = db_require(db, resource_id)?;
    if let Some(room_id) = room_id {
        let room: Room = db_require(db, room_id)?;
        if room.resource_id != resource.id {
            return Err(AppError::validation(format!(
                "room {room_id} does not belong to resource {resource_id}"
            )));
        }
        if let Some(price) = room.prices.get(&tier) {
            return Ok(*price);
        }
    }
    resource.prices.get(&tier).copied().ok_or_else(|| {
        AppError::validation(format!("resource {resource_id} has no price for {tier}"))
    })
}

/// Standalone lookup used before any transition is attempted.
pub fn quote(
    db: &Database,
    resource_id: &str,
    room_id: Option<&str>,
    tier: DurationTier,
    now: DateTime<Utc>,
) -> Result<PriceQuote, AppError> {
    let base = base_price(db, resource_id, room_id, tier)?;
    resolve_price(db, resource_id, room_id, tier, base, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{db_get, db_put, new_id, temp_db};
    use chrono::Duration;

    fn promotion(percent: Option<f64>, amount: Option<i64>) -> Promotion {
        Promotion {
            id: new_id(),
            resource_id: "res-1".to_string(),
            owner_id: "owner-1".to_string(),
            title: "promo".to_string(),
            room_id: None,
            room_ids: Vec::new(),
            discount_percent: percent,
            discount_amount: amount,
            active: true,
            starts_at: None,
            ends_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn percentage_discount_rounds() {
        assert_eq!(apply_promotion(30000, &promotion(Some(20.0), None)), (24000, 6000));
        assert_eq!(apply_promotion(999, &promotion(Some(15.0), None)), (849, 150));
    }

    #[test]
    fn percentage_takes_precedence_over_amount() {
        assert_eq!(apply_promotion(10000, &promotion(Some(10.0), Some(5000))), (9000, 1000));
    }

    #[test]
    fn fixed_discount_never_goes_negative() {
        assert_eq!(apply_promotion(10000, &promotion(None, Some(2500))), (7500, 2500));
        assert_eq!(apply_promotion(1000, &promotion(None, Some(2500))), (0, 1000));
    }

    #[test]
    fn empty_promotion_keeps_base() {
        assert_eq!(apply_promotion(4200, &promotion(None, None)), (4200, 0));
    }

    #[test]
    fn first_matching_promotion_wins() {
        let now = Utc::now();
        let mut scoped = promotion(Some(50.0), None);
        scoped.room_id = Some("room-b".to_string());
        let mut inactive = promotion(Some(40.0), None);
        inactive.active = false;
        let general = promotion(Some(10.0), None);
        let later = promotion(Some(30.0), None);
        let promos = vec![scoped, inactive, general.clone(), later];

        let chosen = select_promotion(&promos, Some("room-a"), now).unwrap();
        assert_eq!(chosen.id, general.id);
    }

    #[test]
    fn no_promotion_returns_base() {
        let (_dir, db) = temp_db();
        let quote = resolve_price(&db, "res-1", Some("room-a"), DurationTier::ThreeHours, 30000, Utc::now())
            .unwrap();
        assert_eq!(quote.final_price, 30000);
        assert_eq!(quote.discount, 0);
        assert!(quote.promotion_id.is_none());
    }

    #[test]
    fn expired_promotion_is_deactivated_lazily() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        let mut expired = promotion(Some(20.0), None);
        expired.ends_at = Some(now - Duration::hours(1));
        db_put(&db, &expired).unwrap();

        let quote =
            resolve_price(&db, "res-1", None, DurationTier::OneHour, 5000, now).unwrap();
        assert_eq!(quote.final_price, 5000);

        let stored: Promotion = db_get(&db, &expired.id).unwrap().unwrap();
        assert!(!stored.active);
    }

    #[test]
    fn room_prices_override_resource_prices() {
        let (_dir, db) = temp_db();
        let now = Utc::now();
        let resource = Resource {
            id: "res-1".to_string(),
            owner_id: "owner-1".to_string(),
            name: "Hall".to_string(),
            prices: [(DurationTier::OneHour, 8000), (DurationTier::ThreeHours, 20000)].into(),
            created_at: now,
        };
        let room = Room {
            id: "room-a".to_string(),
            resource_id: "res-1".to_string(),
            owner_id: "owner-1".to_string(),
            name: "A".to_string(),
            prices: [(DurationTier::ThreeHours, 30000)].into(),
            created_at: now,
        };
        db_put(&db, &resource).unwrap();
        db_put(&db, &room).unwrap();

        assert_eq!(base_price(&db, "res-1", Some("room-a"), DurationTier::ThreeHours).unwrap(), 30000);
        assert_eq!(base_price(&db, "res-1", Some("room-a"), DurationTier::OneHour).unwrap(), 8000);
        assert!(base_price(&db, "res-1", None, DurationTier::Day).is_err());

        let mut promo = promotion(Some(20.0), None);
        promo.room_id = Some("room-a".to_string());
        db_put(&db, &promo).unwrap();
        let priced = quote(&db, "res-1", Some("room-a"), DurationTier::ThreeHours, now).unwrap();
        assert_eq!((priced.base_price, priced.discount, priced.final_price), (30000, 6000, 24000));
    }
}
