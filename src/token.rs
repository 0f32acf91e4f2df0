//! Access key to bearer token exchange, with a fixed refresh window.
use anyhow::Result;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

use crate::client::{ensure_success, DataStore};
use crate::error::DatastoreError;

pub trait Clock {
    fn now(self: &Self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(self: &Self) -> Instant {
        Instant::now()
    }
}

/// Long-lived key from the API user portal.
#[derive(Clone)]
pub struct AccessKey(String);

impl AccessKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(self: &Self) -> &str {
        &self.0
    }

    fn basic_header(self: &Self) -> String {
        format!("Basic {}", self.0)
    }
}

impl fmt::Debug for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessKey(***)")
    }
}

#[derive(Clone)]
pub struct AccessToken {
    value: String,
    issued_at: Instant,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, issued_at: Instant) -> Self {
        Self {
            value: value.into(),
            issued_at,
        }
    }

    pub fn as_str(self: &Self) -> &str {
        &self.value
    }

    pub fn issued_at(self: &Self) -> Instant {
        self.issued_at
    }

    /// A window too large to represent as an `Instant` never expires.
    pub fn is_expired(self: &Self, now: Instant, lifetime: Duration) -> bool {
        match self.issued_at.checked_add(lifetime) {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    /// Query parameter carrying the token on download requests.
    pub fn query(self: &Self) -> [(&'static str, &str); 1] {
        [("access_token", self.value.as_str())]
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"***")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[instrument(skip_all)]
pub async fn request_token(store: &DataStore, access_key: &AccessKey) -> Result<String> {
    let url = store.token_url()?;
    let response = store
        .http()
        .post(url.clone())
        .header(AUTHORIZATION, access_key.basic_header())
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await?;
    let response = ensure_success(&url, response)?;

    let body = response.text().await?;
    let token: TokenResponse =
        serde_json::from_str(&body).map_err(|e| DatastoreError::MalformedResponse {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(token.access_token)
}

/// Holds the current token and exchanges the key again once the refresh window has passed.
pub struct TokenManager<C: Clock = SystemClock> {
    store: DataStore,
    access_key: AccessKey,
    lifetime: Duration,
    clock: C,
    current: Option<AccessToken>,
    exchanges: usize,
}

impl TokenManager<SystemClock> {
    pub fn new(store: DataStore, access_key: AccessKey, lifetime: Duration) -> Self {
        Self::with_clock(store, access_key, lifetime, SystemClock)
    }
}

impl<C: Clock> TokenManager<C> {
    pub fn with_clock(store: DataStore, access_key: AccessKey, lifetime: Duration, clock: C) -> Self {
        Self {
            store,
            access_key,
            lifetime,
            clock,
            current: None,
            exchanges: 0,
        }
    }

    /// Exchanges the key unconditionally.
    pub async fn acquire(self: &mut Self) -> Result<AccessToken> {
        let value = request_token(&self.store, &self.access_key).await?;
        let token = AccessToken::new(value, self.clock.now());
        self.exchanges += 1;
        info!("Retrieved access token");
        self.current = Some(token.clone());
        Ok(token)
    }

    /// Returns the current token, exchanging a new one if none is held or it has expired.
    pub async fn fresh_token(self: &mut Self) -> Result<AccessToken> {
        let now = self.clock.now();
        if let Some(token) = &self.current {
            if !token.is_expired(now, self.lifetime) {
                return Ok(token.clone());
            }
            debug!("Access token expired, retrieving a new one");
        }
        self.acquire().await
    }

    /// Number of token exchanges performed so far.
    pub fn exchanges(self: &Self) -> usize {
        self.exchanges
    }
}
