//! Session cookie management and the caller identity extractor
//!
//! The boundary authenticates the caller once at login and hands every
//! lifecycle call a stable openid; the engine trusts that identity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppError;
use crate::AppState;

pub const SESSION_COOKIE: &str = "weituo_session";

struct Session {
    open_id: String,
    issued_at: Instant,
}

/// In-process session registry: opaque token -> openid with a TTL
pub struct SessionManager {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open a session for an authenticated openid, returning the token.
    /// Expired sessions are swept on the way in so abandoned tokens do not
    /// accumulate.
    pub async fn open(&self, open_id: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        sessions.retain(|_, session| session.issued_at.elapsed() <= self.ttl);
        sessions.insert(
            token.clone(),
            Session {
                open_id: open_id.to_string(),
                issued_at: Instant::now(),
            },
        );
        token
    }

    /// Resolve a token to its openid; expired sessions are dropped
    pub async fn resolve(&self, token: &str) -> Option<String> {
        {
            let sessions = self.sessions.read().await;
            match sessions.get(token) {
                Some(session) if session.issued_at.elapsed() <= self.ttl => {
                    return Some(session.open_id.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }
        // Expired entry, remove it
        let mut sessions = self.sessions.write().await;
        sessions.remove(token);
        None
    }

    /// Destroy a session; returns whether one existed
    pub async fn close(&self, token: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        sessions.remove(token).is_some()
    }

    /// Number of sessions currently held, live or expired
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Pull the session token out of the Cookie header
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// The authenticated caller, resolved from the session cookie
pub struct Identity {
    pub open_id: String,
    pub token: String,
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = token_from_headers(&parts.headers)
            .ok_or_else(|| AppError::Auth("invalid_token".to_string()))?;
        let open_id = state
            .sessions
            .resolve(&token)
            .await
            .ok_or_else(|| AppError::Auth("invalid_token".to_string()))?;
        Ok(Identity { open_id, token })
    }
}
