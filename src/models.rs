use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    #[serde(alias = "provider")]
    Owner,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "owner" | "provider" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            _ => Err(()),
        }
    }
}

/// The acting user of a request, as resolved by the upstream session service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DurationTier {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "24h")]
    Day,
}

impl DurationTier {
    pub fn hours(self) -> u32 {
        match self {
            DurationTier::OneHour => 1,
            DurationTier::ThreeHours => 3,
            DurationTier::SixHours => 6,
            DurationTier::TwelveHours => 12,
            DurationTier::Day => 24,
        }
    }
}

impl fmt::Display for DurationTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hours() {
            1 => write!(f, "1 hour"),
            hours => write!(f, "{hours} hours"),
        }
    }
}

pub type PriceList = BTreeMap<DurationTier, i64>;

/// A bookable venue. Rooms inherit its price list unless they carry their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub prices: PriceList,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub resource_id: String,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub prices: PriceList,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Accepted,
    Confirmed,
    Finished,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectionReason {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "no-availability")]
    NoAvailability,
    #[serde(rename = "other")]
    Other,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Closed => write!(f, "closed on the requested date"),
            RejectionReason::NoAvailability => write!(f, "no availability"),
            RejectionReason::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub resource_id: String,
    pub owner_id: String,
    pub room_id: Option<String>,
    pub client_id: String,
    pub status: ReservationStatus,
    pub tier: DurationTier,
    pub base_price: Option<i64>,
    pub discount: Option<i64>,
    pub final_price: Option<i64>,
    pub promotion_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub rejection_reason: Option<RejectionReason>,
    pub rejection_note: Option<String>,
    pub confirmation_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn counterparty_of(&self, user_id: &str) -> &str {
        if user_id == self.owner_id {
            &self.client_id
        } else {
            &self.owner_id
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationStatus {
    PendingApproval,
    Approved,
    Active,
    /// Written by the post-service review flow; still counts as open.
    PendingEvaluation,
    Finished,
    Rejected,
    CancelledByClient,
}

impl NegotiationStatus {
    pub const OPEN: [NegotiationStatus; 4] = [
        NegotiationStatus::PendingApproval,
        NegotiationStatus::Approved,
        NegotiationStatus::Active,
        NegotiationStatus::PendingEvaluation,
    ];

    pub fn is_open(self) -> bool {
        Self::OPEN.contains(&self)
    }

    pub fn contact_visible(self) -> bool {
        matches!(self, NegotiationStatus::Active | NegotiationStatus::Finished)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Negotiation {
    pub id: String,
    pub client_id: String,
    pub provider_id: String,
    pub status: NegotiationStatus,
    pub preferred_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub client_comment: Option<String>,
    pub price: Option<i64>,
    pub duration_minutes: Option<u32>,
    pub provider_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Negotiation as shown to either party; phones only travel once contact is visible.
#[derive(Debug, Clone, Serialize)]
pub struct NegotiationView {
    #[serde(flatten)]
    pub negotiation: Negotiation,
    pub contact_visible: bool,
    pub client_phone: Option<String>,
    pub provider_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub id: String,
    pub resource_id: String,
    pub owner_id: String,
    pub title: String,
    pub room_id: Option<String>,
    #[serde(default)]
    pub room_ids: Vec<String>,
    pub discount_percent: Option<f64>,
    pub discount_amount: Option<i64>,
    pub active: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Promotion {
    /// Unscoped promotions cover every room of the resource, including bookings
    /// without a specific room.
    pub fn covers(&self, room_id: Option<&str>) -> bool {
        if self.room_id.is_none() && self.room_ids.is_empty() {
            return true;
        }
        match room_id {
            Some(room) => {
                self.room_id.as_deref() == Some(room) || self.room_ids.iter().any(|id| id == room)
            }
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|end| end < now)
    }

    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at.is_none_or(|start| start <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub entity_id: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub thread_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct CreateResource {
    pub name: String,
    pub prices: PriceList,
}

#[derive(Deserialize)]
pub struct CreateRoom {
    pub name: String,
    #[serde(default)]
    pub prices: PriceList,
}

#[derive(Deserialize)]
pub struct CreateReservation {
    pub resource_id: String,
    pub room_id: Option<String>,
    pub tier: DurationTier,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct RejectReservation {
    pub reason: Option<RejectionReason>,
    pub note: Option<String>,
}

#[derive(Deserialize)]
pub struct OpenRequest {
    pub provider_id: String,
    pub preferred_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub comment: Option<String>,
}

#[derive(Deserialize)]
pub struct ApproveRequest {
    pub price: i64,
    pub duration_minutes: u32,
    pub comment: Option<String>,
}

#[derive(Deserialize)]
pub struct CreatePromotion {
    pub resource_id: String,
    pub title: String,
    pub room_id: Option<String>,
    #[serde(default)]
    pub room_ids: Vec<String>,
    pub discount_percent: Option<f64>,
    pub discount_amount: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct QuoteQuery {
    pub resource_id: String,
    pub room_id: Option<String>,
    pub tier: DurationTier,
}

#[derive(Deserialize)]
pub struct BroadcastRequest {
    pub event: String,
    pub payload: serde_json::Value,
}

#[derive(Deserialize)]
pub struct ContactUpdate {
    pub phone: String,
}
