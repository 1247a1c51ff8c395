//! Weituo server - delegation marketplace backend for a WeChat mini-program

pub mod error;
pub mod lifecycle;
pub mod models;
pub mod routes;
pub mod session;
pub mod store;
pub mod wechat;

use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use lifecycle::LifecycleEngine;
use session::SessionManager;
use store::Store;
use wechat::WxClient;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    pub engine: LifecycleEngine,
    pub sessions: SessionManager,
    pub wx: WxClient,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        wx: WxClient,
        confirm_grace: Duration,
        session_ttl: Duration,
    ) -> Arc<Self> {
        let store = Store::new(pool);
        Arc::new(Self {
            engine: LifecycleEngine::new(store.clone(), confirm_grace),
            sessions: SessionManager::new(session_ttl),
            store,
            wx,
        })
    }
}
