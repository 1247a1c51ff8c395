//! WeChat mini-program OAuth - HTTP client for the jscode2session exchange

use reqwest::Client;
use serde::Deserialize;

use crate::error::{AppError, Result};

const DEFAULT_BASE_URL: &str = "https://api.weixin.qq.com";

/// Client for resolving a mini-program login code into a stable openid
pub struct WxClient {
    client: Client,
    base_url: String,
    appid: String,
    secret: String,
    /// Offline mode skips the exchange and uses the submitted code as the
    /// openid directly, for development without a mini-program frontend
    offline: bool,
}

/// Result of a code exchange
#[derive(Debug, Clone, Deserialize)]
pub struct WxSession {
    #[serde(default)]
    pub openid: String,
    #[serde(default)]
    pub session_key: String,
    #[serde(default)]
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}

impl WxClient {
    pub fn new(appid: impl Into<String>, secret: impl Into<String>, offline: bool) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, appid, secret, offline)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        appid: impl Into<String>,
        secret: impl Into<String>,
        offline: bool,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            appid: appid.into(),
            secret: secret.into(),
            offline,
        }
    }

    /// Exchange a login code for the caller's openid
    pub async fn code_to_session(&self, code: &str) -> Result<WxSession> {
        if self.offline {
            return Ok(WxSession {
                openid: code.to_string(),
                session_key: String::new(),
                errcode: 0,
                errmsg: String::new(),
            });
        }

        let response = self
            .client
            .get(format!("{}/sns/jscode2session", self.base_url))
            .query(&[
                ("appid", self.appid.as_str()),
                ("secret", self.secret.as_str()),
                ("js_code", code),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| AppError::Wx(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Wx(format!(
                "Code exchange failed: {} - {}",
                status, text
            )));
        }

        let session: WxSession = response
            .json()
            .await
            .map_err(|e| AppError::Wx(e.to_string()))?;

        if session.errcode != 0 {
            return Err(AppError::Wx(format!(
                "errcode {}: {}",
                session.errcode, session.errmsg
            )));
        }

        Ok(session)
    }
}
