use crate::config::AppConfig;
use std::sync::Arc;
use tokio_rusqlite::Connection;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection) -> Self {
        Self {
            config: Arc::new(config),
            db,
        }
    }
}
