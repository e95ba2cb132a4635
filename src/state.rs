use std::sync::Arc;

use redb::Database;

use crate::{config::Config, hub::NotificationHub};

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub cfg: Arc<Config>,
    pub hub: NotificationHub,
}
