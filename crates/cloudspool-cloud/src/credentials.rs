// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// OAuth credential store for the robot and (optional) user identities.
//
// Each identity is one `CredentialPair` behind its own async mutex, so
// concurrent callers of the same identity share a single refresh instead of
// racing the token endpoint.  A refresh is attempted at most once per call;
// a failure is returned to the caller and nothing negative is cached.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::Identity;

/// Cached tokens are treated as expired this long before the real expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Anything that can hand out bearer tokens.
///
/// Implemented by [`CredentialStore`]; the REST client and push session only
/// depend on this trait.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Return a token believed to be valid, refreshing if needed.
    async fn access_token(&self, identity: Identity) -> Result<String>;

    /// Forget the cached token after the server rejected it (HTTP 401).
    async fn invalidate(&self, identity: Identity);

    /// Whether credentials for this identity are configured at all.
    fn has_identity(&self, identity: Identity) -> bool;
}

/// OAuth client settings for the refresh-token grant.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
}

/// Access token + expiry + refresh token for one identity.
#[derive(Debug, Clone)]
pub struct CredentialPair {
    access_token: Option<String>,
    /// Expiry minus the safety margin.
    refresh_after: Option<Instant>,
    refresh_token: String,
}

impl CredentialPair {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: None,
            refresh_after: None,
            refresh_token: refresh_token.into(),
        }
    }

    /// The cached access token, if it is still valid at `now`.
    pub fn valid_token(&self, now: Instant) -> Option<&str> {
        match (&self.access_token, self.refresh_after) {
            (Some(token), Some(refresh_after)) if now < refresh_after => Some(token),
            _ => None,
        }
    }

    fn invalidate(&mut self) {
        self.access_token = None;
        self.refresh_after = None;
    }

    fn store(&mut self, reply: TokenReply, now: Instant) {
        // Short-lived tokens get a quarter of their lifetime as margin.
        let lifetime = Duration::from_secs(reply.expires_in);
        let margin = EXPIRY_MARGIN.min(lifetime / 4);
        self.access_token = Some(reply.access_token);
        self.refresh_after = Some(now + (lifetime - margin));
        if let Some(rotated) = reply.refresh_token {
            self.refresh_token = rotated;
        }
    }
}

/// Token endpoint reply (RFC 6749 §5.1).
#[derive(Debug, Deserialize)]
struct TokenReply {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Holds both identities and refreshes them against the token endpoint.
pub struct CredentialStore {
    http: reqwest::Client,
    oauth: OAuthConfig,
    robot: Mutex<CredentialPair>,
    user: Option<Mutex<CredentialPair>>,
}

impl CredentialStore {
    pub fn new(
        http: reqwest::Client,
        oauth: OAuthConfig,
        robot_refresh_token: impl Into<String>,
        user_refresh_token: Option<String>,
    ) -> Self {
        Self {
            http,
            oauth,
            robot: Mutex::new(CredentialPair::new(robot_refresh_token)),
            user: user_refresh_token
                .filter(|t| !t.trim().is_empty())
                .map(|t| Mutex::new(CredentialPair::new(t))),
        }
    }

    fn slot(&self, identity: Identity) -> Result<&Mutex<CredentialPair>> {
        match identity {
            Identity::Robot => Ok(&self.robot),
            Identity::User => self
                .user
                .as_ref()
                .ok_or(CloudspoolError::MissingIdentity(Identity::User)),
        }
    }

    /// Exchange the refresh token for a new access token.
    async fn refresh(&self, identity: Identity, pair: &mut CredentialPair) -> Result<String> {
        debug!(%identity, "refreshing access token");

        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", pair.refresh_token.as_str()),
            ("client_id", self.oauth.client_id.as_str()),
            ("client_secret", self.oauth.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&self.oauth.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CloudspoolError::Timeout(format!("token refresh: {e}"))
                } else {
                    CloudspoolError::Network(format!("token refresh: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(CloudspoolError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%identity, status = status.as_u16(), "token endpoint rejected refresh");
            return Err(CloudspoolError::Authentication {
                identity,
                detail: format!("token endpoint returned {status}: {body}"),
            });
        }

        let reply: TokenReply = response.json().await.map_err(|e| {
            CloudspoolError::Authentication {
                identity,
                detail: format!("malformed token reply: {e}"),
            }
        })?;

        pair.store(reply, Instant::now());
        info!(%identity, "access token refreshed");
        pair.access_token
            .clone()
            .ok_or_else(|| CloudspoolError::Protocol("token vanished after refresh".into()))
    }
}

#[async_trait]
impl TokenSource for CredentialStore {
    #[instrument(skip(self))]
    async fn access_token(&self, identity: Identity) -> Result<String> {
        let slot = self.slot(identity)?;
        let mut pair = slot.lock().await;

        if let Some(token) = pair.valid_token(Instant::now()) {
            return Ok(token.to_string());
        }

        self.refresh(identity, &mut pair).await
    }

    async fn invalidate(&self, identity: Identity) {
        if let Ok(slot) = self.slot(identity) {
            slot.lock().await.invalidate();
            debug!(%identity, "cached access token invalidated");
        }
    }

    fn has_identity(&self, identity: Identity) -> bool {
        self.slot(identity).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Form, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    #[derive(Clone)]
    struct TokenServer {
        calls: Arc<AtomicUsize>,
        accept: bool,
    }

    async fn token_handler(
        State(server): State<TokenServer>,
        Form(form): Form<HashMap<String, String>>,
    ) -> (StatusCode, Json<serde_json::Value>) {
        let n = server.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !server.accept || form.get("grant_type").map(String::as_str) != Some("refresh_token") {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": "invalid_grant" })),
            );
        }
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "access_token": format!("access-{n}"),
                "expires_in": 3600,
                "token_type": "Bearer",
            })),
        )
    }

    async fn spawn_token_server(accept: bool) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/token", post(token_handler))
            .with_state(TokenServer {
                calls: calls.clone(),
                accept,
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/token"), calls)
    }

    fn store(token_url: String, user: Option<&str>) -> CredentialStore {
        CredentialStore::new(
            reqwest::Client::new(),
            OAuthConfig {
                client_id: "client".into(),
                client_secret: "secret".into(),
                token_url,
            },
            "1/robot",
            user.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn token_is_cached_until_invalidated() {
        let (url, calls) = spawn_token_server(true).await;
        let creds = store(url, None);

        let first = creds.access_token(Identity::Robot).await.unwrap();
        let second = creds.access_token(Identity::Robot).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        creds.invalidate(Identity::Robot).await;
        let third = creds.access_token(Identity::Robot).await.unwrap();
        assert_ne!(first, third);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rejected_refresh_is_fatal_for_robot_and_tried_once_per_call() {
        let (url, calls) = spawn_token_server(false).await;
        let creds = store(url, Some("1/user"));

        let err = creds.access_token(Identity::Robot).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = creds.access_token(Identity::User).await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_user_identity_is_reported() {
        let creds = store("http://127.0.0.1:9/token".into(), None);
        assert!(!creds.has_identity(Identity::User));
        let err = creds.access_token(Identity::User).await.unwrap_err();
        assert!(matches!(err, CloudspoolError::MissingIdentity(Identity::User)));
    }

    #[test]
    fn token_near_expiry_is_not_valid() {
        let now = Instant::now();
        let mut pair = CredentialPair::new("1/robot");
        pair.store(
            TokenReply {
                access_token: "long".into(),
                expires_in: 3600,
                refresh_token: None,
            },
            now,
        );
        assert_eq!(pair.valid_token(now + Duration::from_secs(3539)), Some("long"));
        assert!(pair.valid_token(now + Duration::from_secs(3541)).is_none());
    }

    #[test]
    fn short_lived_token_is_used_until_last_quarter() {
        let now = Instant::now();
        let mut pair = CredentialPair::new("1/robot");
        pair.store(
            TokenReply {
                access_token: "a".into(),
                expires_in: 30,
                refresh_token: None,
            },
            now,
        );
        assert_eq!(pair.valid_token(now), Some("a"));
        assert_eq!(pair.valid_token(now + Duration::from_secs(22)), Some("a"));
        assert!(pair.valid_token(now + Duration::from_secs(23)).is_none());

        pair.store(
            TokenReply {
                access_token: "b".into(),
                expires_in: 3600,
                refresh_token: Some("1/rotated".into()),
            },
            now,
        );
        assert_eq!(pair.valid_token(now), Some("b"));
        assert_eq!(pair.refresh_token, "1/rotated");
    }
}
