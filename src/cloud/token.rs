//! Access token storage with a single in-flight refresh.
//!
//! The cache moves `Absent -> Valid -> (expired) -> Refreshing -> Valid`, or back
//! to `Absent` when a refresh fails. Concurrent callers that find the token
//! missing or expired all await the same refresh future, so the server only ever
//! sees one token request per credential pair at a time.

use crate::clock::Clock;
use crate::cloud::types::TokenResult;
use crate::error::{Result, TuyaError};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// Tokens are treated as expired this long before the server's deadline.
pub const EXPIRY_MARGIN_MS: i64 = 60_000;

/// One issued access/refresh token pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub uid: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry in epoch milliseconds
    pub expire_at_ms: i64,
}

impl TokenInfo {
    /// `server_t` is the envelope timestamp (ms); `expire_time` is in seconds.
    pub fn from_grant(result: TokenResult, server_t: i64) -> Self {
        Self {
            uid: result.uid,
            access_token: result.access_token,
            refresh_token: result.refresh_token,
            expire_at_ms: server_t + result.expire_time * 1000,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expire_at_ms - EXPIRY_MARGIN_MS
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenInfo>>>;

enum TokenState {
    Absent,
    Valid(TokenInfo),
    Refreshing(RefreshFuture),
}

/// Holds the live token of one OpenAPI client.
pub struct TokenCache {
    state: Mutex<TokenState>,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(TokenState::Absent),
            clock,
        }
    }

    /// The cached token, valid or not, without triggering a refresh.
    pub fn current(&self) -> Option<TokenInfo> {
        match &*self.state.lock() {
            TokenState::Valid(token) => Some(token.clone()),
            _ => None,
        }
    }

    /// True when a token is cached and not expired.
    pub fn is_valid(&self) -> bool {
        let now = self.clock.now_millis();
        self.current().is_some_and(|t| !t.is_expired(now))
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(&*self.state.lock(), TokenState::Refreshing(_))
    }

    /// Forget everything; the next call does a full grant.
    pub fn reset(&self) {
        *self.state.lock() = TokenState::Absent;
    }

    /// Drop `stale` if it is still the cached token.
    ///
    /// A late "token invalid" answer for an old token leaves a newer one alone.
    pub fn invalidate(&self, stale: &TokenInfo) {
        let mut state = self.state.lock();
        if let TokenState::Valid(current) = &*state {
            if current.access_token == stale.access_token {
                debug!("Invalidating access token for uid {}", current.uid);
                *state = TokenState::Absent;
            }
        }
    }

    /// Return a usable token, refreshing it first when missing, expired or `forced`.
    ///
    /// `refresher` receives the previous token (if any) and is only invoked by the
    /// caller that starts a refresh; everyone else awaits that same outcome.
    pub async fn get_or_refresh<F, Fut>(&self, forced: bool, refresher: F) -> Result<TokenInfo>
    where
        F: FnOnce(Option<TokenInfo>) -> Fut,
        Fut: Future<Output = Result<TokenInfo>> + Send + 'static,
    {
        let refresh = {
            let mut state = self.state.lock();
            let (in_flight, previous) = match &*state {
                TokenState::Valid(token)
                    if !forced && !token.is_expired(self.clock.now_millis()) =>
                {
                    return Ok(token.clone());
                }
                TokenState::Refreshing(fut) => (Some(fut.clone()), None),
                TokenState::Valid(token) => (None, Some(token.clone())),
                TokenState::Absent => (None, None),
            };

            if let Some(fut) = in_flight {
                debug!("Token refresh already in flight, joining it");
                fut
            } else {
                info!(
                    "Starting token {} (forced: {})",
                    if previous.is_some() { "refresh" } else { "grant" },
                    forced
                );
                let fut = refresher(previous)
                    .map(|res| {
                        res.map_err(|e| match e {
                            TuyaError::TokenRefresh(_) => e,
                            other => TuyaError::TokenRefresh(other.to_string()),
                        })
                    })
                    .boxed()
                    .shared();
                *state = TokenState::Refreshing(fut.clone());
                fut
            }
        };

        let outcome = refresh.clone().await;

        let mut state = self.state.lock();
        if let TokenState::Refreshing(fut) = &*state {
            if fut.ptr_eq(&refresh) {
                *state = match &outcome {
                    Ok(token) => TokenState::Valid(token.clone()),
                    Err(e) => {
                        warn!("Token refresh failed: {}", e);
                        TokenState::Absent
                    }
                };
            }
        }
        outcome
    }
}
