use std::{fmt::Debug, path::Path};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{
        ChatMessage, Negotiation, NegotiationStatus, Notification, Promotion, Reservation,
        ReservationStatus, Resource, Room,
    },
};

const RESOURCES: TableDefinition<&str, &str> = TableDefinition::new("resources");
const ROOMS: TableDefinition<&str, &str> = TableDefinition::new("rooms");
const RESERVATIONS: TableDefinition<&str, &str> = TableDefinition::new("reservations");
const NEGOTIATIONS: TableDefinition<&str, &str> = TableDefinition::new("negotiations");
const PROMOTIONS: TableDefinition<&str, &str> = TableDefinition::new("promotions");
const NOTIFICATIONS: TableDefinition<&str, &str> = TableDefinition::new("notifications");
const MESSAGES: TableDefinition<&str, &str> = TableDefinition::new("messages");
const CONTACTS: TableDefinition<&str, &str> = TableDefinition::new("contacts");

/// A JSON-encoded row keyed by its id.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, &'static str, &'static str>;
    const LABEL: &'static str;

    fn key(&self) -> &str;
}

/// A record whose writes are guarded by its current status.
pub trait Stateful: Record {
    type Status: Copy + PartialEq + Debug;

    fn status(&self) -> Self::Status;
}

macro_rules! record {
    ($ty:ty, $table:expr, $label:literal) => {
        impl Record for $ty {
            const TABLE: TableDefinition<'static, &'static str, &'static str> = $table;
            const LABEL: &'static str = $label;

            fn key(&self) -> &str {
                &self.id
            }
        }
    };
}

record!(Resource, RESOURCES, "resource");
record!(Room, ROOMS, "room");
record!(Reservation, RESERVATIONS, "reservation");
record!(Negotiation, NEGOTIATIONS, "service request");
record!(Promotion, PROMOTIONS, "promotion");
record!(Notification, NOTIFICATIONS, "notification");
record!(ChatMessage, MESSAGES, "message");

impl Stateful for Reservation {
    type Status = ReservationStatus;

    fn status(&self) -> ReservationStatus {
        self.status
    }
}

impl Stateful for Negotiation {
    type Status = NegotiationStatus;

    fn status(&self) -> NegotiationStatus {
        self.status
    }
}

pub fn open_db(path: &str) -> Result<Database, AppError> {
    if Path::new(path).exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

pub fn init_db(db: &Database) -> Result<(), AppError> {
    let write_txn = db.begin_write()?;
    for table in [
        RESOURCES,
        ROOMS,
        RESERVATIONS,
        NEGOTIATIONS,
        PROMOTIONS,
        NOTIFICATIONS,
        MESSAGES,
        CONTACTS,
    ] {
        write_txn.open_table(table)?;
    }
    write_txn.commit()?;
    Ok(())
}

/// Time-ordered ids, so table order is creation order.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

pub fn db_get<R: Record>(db: &Database, key: &str) -> Result<Option<R>, AppError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(R::TABLE)?;
    if let Some(value) = table.get(key)? {
        Ok(Some(serde_json::from_str(value.value())?))
    } else {
        Ok(None)
    }
}

pub fn db_require<R: Record>(db: &Database, key: &str) -> Result<R, AppError> {
    db_get(db, key)?.ok_or_else(|| AppError::not_found(format!("{} {key} not found", R::LABEL)))
}

pub fn db_put<R: Record>(db: &Database, record: &R) -> Result<(), AppError> {
    let value = serde_json::to_string(record)?;
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(R::TABLE)?;
        table.insert(record.key(), value.as_str())?;
    }
    write_txn.commit()?;
    Ok(())
}

pub fn db_list<R, F>(db: &Database, filter: F) -> Result<Vec<R>, AppError>
where
    R: Record,
    F: Fn(&R) -> bool,
{
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(R::TABLE)?;
    let mut records = Vec::new();
    for entry in table.iter()? {
        let (_, value) = entry?;
        let record: R = serde_json::from_str(value.value())?;
        if filter(&record) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Compare-and-swap on status: `apply` runs and the row is rewritten only if the
/// stored status is one of `expected`, all inside one write transaction.
pub fn db_update_if<R, F>(
    db: &Database,
    key: &str,
    expected: &[R::Status],
    apply: F,
) -> Result<R, AppError>
where
    R: Stateful,
    F: FnOnce(&mut R) -> Result<(), AppError>,
{
    let write_txn = db.begin_write()?;
    let record = {
        let mut table = write_txn.open_table(R::TABLE)?;
        let current = table.get(key)?.map(|value| value.value().to_string());
        let Some(current) = current else {
            return Err(AppError::not_found(format!("{} {key} not found", R::LABEL)));
        };
        let mut record: R = serde_json::from_str(&current)?;
        if !expected.contains(&record.status()) {
            debug!(key, status = ?record.status(), "conditional update matched no rows");
            return Err(AppError::invalid_transition(format!(
                "{} {key} is {:?}, expected one of {:?}",
                R::LABEL,
                record.status(),
                expected
            )));
        }
        apply(&mut record)?;
        let value = serde_json::to_string(&record)?;
        table.insert(key, value.as_str())?;
        record
    };
    write_txn.commit()?;
    Ok(record)
}

/// Removes the row only while its status is one of `expected`.
pub fn db_delete_if<R: Stateful>(
    db: &Database,
    key: &str,
    expected: &[R::Status],
) -> Result<R, AppError> {
    let write_txn = db.begin_write()?;
    let record = {
        let mut table = write_txn.open_table(R::TABLE)?;
        let current = table.get(key)?.map(|value| value.value().to_string());
        let Some(current) = current else {
            return Err(AppError::not_found(format!("{} {key} not found", R::LABEL)));
        };
        let record: R = serde_json::from_str(&current)?;
        if !expected.contains(&record.status()) {
            return Err(AppError::invalid_transition(format!(
                "{} {key} is {:?} and cannot be deleted",
                R::LABEL,
                record.status()
            )));
        }
        table.remove(key)?;
        record
    };
    write_txn.commit()?;
    Ok(record)
}

/// Inserts `record` unless a row matching `existing` is already stored, in which
/// case that row is returned instead. The flag reports whether an insert happened.
pub fn db_insert_unless<R, F>(db: &Database, record: R, existing: F) -> Result<(R, bool), AppError>
where
    R: Record,
    F: Fn(&R) -> bool,
{
    let write_txn = db.begin_write()?;
    let outcome = {
        let mut table = write_txn.open_table(R::TABLE)?;
        let mut found = None;
        for entry in table.iter()? {
            let (_, value) = entry?;
            let stored: R = serde_json::from_str(value.value())?;
            if existing(&stored) {
                found = Some(stored);
                break;
            }
        }
        match found {
            Some(stored) => (stored, false),
            None => {
                let value = serde_json::to_string(&record)?;
                table.insert(record.key(), value.as_str())?;
                (record, true)
            }
        }
    };
    write_txn.commit()?;
    Ok(outcome)
}

/// Unconditional read-modify-write for rows without a guarded status.
pub fn db_update<R, F>(db: &Database, key: &str, apply: F) -> Result<R, AppError>
where
    R: Record,
    F: FnOnce(&mut R) -> Result<(), AppError>,
{
    let write_txn = db.begin_write()?;
    let record = {
        let mut table = write_txn.open_table(R::TABLE)?;
        let current = table.get(key)?.map(|value| value.value().to_string());
        let Some(current) = current else {
            return Err(AppError::not_found(format!("{} {key} not found", R::LABEL)));
        };
        let mut record: R = serde_json::from_str(&current)?;
        apply(&mut record)?;
        let value = serde_json::to_string(&record)?;
        table.insert(key, value.as_str())?;
        record
    };
    write_txn.commit()?;
    Ok(record)
}

/// Lists a resource's promotions in store order, switching off the ones whose
/// window has closed.
pub fn refresh_promotions(
    db: &Database,
    resource_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Promotion>, AppError> {
    let write_txn = db.begin_write()?;
    let promotions = {
        let mut table = write_txn.open_table(PROMOTIONS)?;
        let mut promotions = Vec::new();
        let mut expired = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let mut promotion: Promotion = serde_json::from_str(value.value())?;
            if promotion.resource_id != resource_id {
                continue;
            }
            if promotion.active && promotion.is_expired(now) {
                promotion.active = false;
                expired.push(promotion.clone());
            }
            promotions.push(promotion);
        }
        for promotion in &expired {
            debug!(promotion_id = %promotion.id, "promotion window closed, deactivating");
            let value = serde_json::to_string(promotion)?;
            table.insert(promotion.id.as_str(), value.as_str())?;
        }
        promotions
    };
    write_txn.commit()?;
    Ok(promotions)
}

pub fn set_contact(db: &Database, user_id: &str, phone: &str) -> Result<(), AppError> {
    let write_txn = db.begin_write()?;
    {
        let mut table = write_txn.open_table(CONTACTS)?;
        table.insert(user_id, phone)?;
    }
    write_txn.commit()?;
    Ok(())
}

pub fn get_contact(db: &Database, user_id: &str) -> Result<Option<String>, AppError> {
    let read_txn = db.begin_read()?;
    let table = read_txn.open_table(CONTACTS)?;
    Ok(table.get(user_id)?.map(|value| value.value().to_string()))
}

#[cfg(test)]
pub(crate) fn temp_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::create(dir.path().join("test.redb")).expect("create db");
    init_db(&db).expect("init db");
    (dir, db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::DurationTier;

    fn reservation(status: ReservationStatus) -> Reservation {
        let now = Utc::now();
        Reservation {
            id: new_id(),
            resource_id: "res".to_string(),
            owner_id: "owner".to_string(),
            room_id: None,
            client_id: "client".to_string(),
            status,
            tier: DurationTier::OneHour,
            base_price: None,
            discount: None,
            final_price: None,
            promotion_id: None,
            scheduled_at: None,
            note: None,
            rejection_reason: None,
            rejection_note: None,
            confirmation_code: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn update_if_applies_only_on_expected_status() {
        let (_dir, db) = temp_db();
        let stored = reservation(ReservationStatus::Pending);
        db_put(&db, &stored).unwrap();

        let updated = db_update_if::<Reservation, _>(&db, &stored.id, &[ReservationStatus::Pending], |r| {
            r.status = ReservationStatus::Accepted;
            Ok(())
        })
        .unwrap();
        assert_eq!(updated.status, ReservationStatus::Accepted);

        let err = db_update_if::<Reservation, _>(&db, &stored.id, &[ReservationStatus::Pending], |r| {
            r.status = ReservationStatus::Accepted;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);
    }

    #[test]
    fn failed_apply_leaves_row_untouched() {
        let (_dir, db) = temp_db();
        let stored = reservation(ReservationStatus::Pending);
        db_put(&db, &stored).unwrap();

        let err = db_update_if::<Reservation, _>(&db, &stored.id, &[ReservationStatus::Pending], |r| {
            r.status = ReservationStatus::Rejected;
            Err(AppError::validation("nope"))
        })
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationFailed);
        let reread: Reservation = db_require(&db, &stored.id).unwrap();
        assert_eq!(reread.status, ReservationStatus::Pending);
    }

    #[test]
    fn missing_rows_are_not_found() {
        let (_dir, db) = temp_db();
        let err = db_update_if::<Reservation, _>(&db, "missing", &[ReservationStatus::Pending], |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(db_get::<Reservation>(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn delete_if_respects_status() {
        let (_dir, db) = temp_db();
        let active = reservation(ReservationStatus::Confirmed);
        let done = reservation(ReservationStatus::Finished);
        db_put(&db, &active).unwrap();
        db_put(&db, &done).unwrap();

        let terminal = [ReservationStatus::Finished];
        assert!(db_delete_if::<Reservation>(&db, &active.id, &terminal).is_err());
        assert!(db_delete_if::<Reservation>(&db, &done.id, &terminal).is_ok());
        assert!(db_get::<Reservation>(&db, &done.id).unwrap().is_none());
    }

    #[test]
    fn insert_unless_returns_existing_row() {
        let (_dir, db) = temp_db();
        let first = reservation(ReservationStatus::Pending);
        let (_, inserted) = db_insert_unless(&db, first.clone(), |_: &Reservation| false).unwrap();
        assert!(inserted);

        let second = reservation(ReservationStatus::Pending);
        let (kept, inserted) =
            db_insert_unless(&db, second, |r: &Reservation| r.client_id == "client").unwrap();
        assert!(!inserted);
        assert_eq!(kept.id, first.id);
        assert_eq!(db_list::<Reservation, _>(&db, |_| true).unwrap().len(), 1);
    }

    #[test]
    fn contacts_round_trip() {
        let (_dir, db) = temp_db();
        assert_eq!(get_contact(&db, "u1").unwrap(), None);
        set_contact(&db, "u1", "+81 90 0000 0000").unwrap();
        assert_eq!(get_contact(&db, "u1").unwrap().as_deref(), Some("+81 90 0000 0000"));
    }
}
