use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::fs;
use tracing::{info, instrument, warn};

use super::model::{ErrorResponse, SettingsResponse, TokenResponse, UserResponse};
use super::{AuthError, AuthProvider, SessionEvent, SessionEvents, Subscription};
use crate::model::Session;
use crate::store::postgrest::normalize_base;

/// Client for the hosted auth REST API (`/auth/v1`).
///
/// Holds at most one session. When a session file is configured the session
/// survives restarts; it is written on sign-in and refresh and removed on
/// sign-out.
#[derive(Clone)]
pub struct GoTrueClient {
    http: Client,
    base_url: Url,
    anon_key: String,
    session: Arc<RwLock<Option<Session>>>,
    events: SessionEvents,
    session_file: Option<PathBuf>,
}

impl fmt::Debug for GoTrueClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoTrueClient")
            .field("base_url", &self.base_url)
            .field("session_file", &self.session_file)
            .finish_non_exhaustive()
    }
}

/// Split a `k=v&k2=v2` fragment or query into decoded pairs.
fn parse_params(raw: &str) -> Result<HashMap<String, String>, AuthError> {
    let mut out = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(&value.replace('+', " "))
            .map_err(|e| AuthError::InvalidRedirect(format!("bad encoding for {key}: {e}")))?
            .into_owned();
        out.insert(key.to_string(), value);
    }
    Ok(out)
}

fn expiry(now: DateTime<Utc>, expires_in: Option<i64>, expires_at: Option<i64>) -> Option<DateTime<Utc>> {
    expires_at
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .or_else(|| expires_in.map(|secs| now + Duration::seconds(secs)))
}

async fn provider_error(res: reqwest::Response) -> AuthError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&body)
        .ok()
        .and_then(ErrorResponse::text)
        .unwrap_or(body);
    AuthError::Provider {
        status: status.as_u16(),
        message,
    }
}

impl GoTrueClient {
    pub fn new(base_url: Url, anon_key: String) -> Self {
        let http = Client::builder()
            .user_agent("portfolio-cms/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: normalize_base(base_url),
            anon_key,
            session: Arc::new(RwLock::new(None)),
            events: SessionEvents::new(),
            session_file: None,
        }
    }

    /// Create a client that keeps its session in `path`, loading any session
    /// already stored there.
    pub async fn with_session_file(
        base_url: Url,
        anon_key: String,
        path: PathBuf,
    ) -> Result<Self, AuthError> {
        let mut client = Self::new(base_url, anon_key);
        match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => client.store_session(Some(session)),
                Err(err) => warn!(?err, path=%path.display(), "ignoring unreadable session file"),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        client.session_file = Some(path);
        Ok(client)
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(&format!("auth/v1/{path}"))
            .map_err(|e| AuthError::InvalidRedirect(format!("invalid auth endpoint {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Accept", "application/json")
    }

    fn store_session(&self, session: Option<Session>) {
        if let Ok(mut guard) = self.session.write() {
            *guard = session;
        }
    }

    fn cached_session(&self) -> Option<Session> {
        self.session.read().ok().and_then(|g| g.clone())
    }

    async fn persist(&self, session: Option<&Session>) -> Result<(), AuthError> {
        let Some(path) = &self.session_file else {
            return Ok(());
        };
        match session {
            Some(session) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(path, serde_json::to_vec_pretty(session)?).await?;
            }
            None => match fs::remove_file(path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            },
        }
        Ok(())
    }

    /// URL of the provider's federated sign-in page.
    pub fn authorize_url(&self, provider: &str, redirect_to: &Url) -> Result<Url, AuthError> {
        let mut url = self.endpoint("authorize")?;
        url.query_pairs_mut()
            .append_pair("provider", provider)
            .append_pair("redirect_to", redirect_to.as_str());
        Ok(url)
    }

    pub fn build_settings_request(&self) -> Result<reqwest::Request, AuthError> {
        Ok(self.request(Method::GET, self.endpoint("settings")?).build()?)
    }

    pub fn build_user_request(&self, access_token: &str) -> Result<reqwest::Request, AuthError> {
        Ok(self
            .request(Method::GET, self.endpoint("user")?)
            .header("Authorization", format!("Bearer {access_token}"))
            .build()?)
    }

    pub fn build_refresh_request(&self, refresh_token: &str) -> Result<reqwest::Request, AuthError> {
        let mut url = self.endpoint("token")?;
        url.query_pairs_mut().append_pair("grant_type", "refresh_token");
        Ok(self
            .request(Method::POST, url)
            .header("Content-Type", "application/json")
            .json(&json!({ "refresh_token": refresh_token }))
            .build()?)
    }

    pub fn build_logout_request(&self, access_token: &str) -> Result<reqwest::Request, AuthError> {
        Ok(self
            .request(Method::POST, self.endpoint("logout")?)
            .header("Authorization", format!("Bearer {access_token}"))
            .build()?)
    }

    async fn fetch_user(&self, access_token: &str) -> Result<UserResponse, AuthError> {
        let res = self.http.execute(self.build_user_request(access_token)?).await?;
        if !res.status().is_success() {
            return Err(provider_error(res).await);
        }
        Ok(res.json().await?)
    }

    /// Finish federated sign-in from the URL the provider redirected to.
    /// Tokens arrive in the fragment (`#access_token=...`); errors may arrive
    /// in either the fragment or the query.
    #[instrument(skip_all)]
    pub async fn complete_sign_in(&self, redirect: &Url) -> Result<Session, AuthError> {
        let mut params = parse_params(redirect.query().unwrap_or(""))?;
        params.extend(parse_params(redirect.fragment().unwrap_or(""))?);

        if let Some(error) = params.get("error") {
            let message = params
                .get("error_description")
                .cloned()
                .unwrap_or_else(|| error.clone());
            return Err(AuthError::Provider {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message,
            });
        }
        let access_token = params
            .get("access_token")
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::InvalidRedirect("no access_token in redirect".into()))?
            .clone();

        let user = self.fetch_user(&access_token).await?;
        let session = Session {
            identity: user.into_identity(),
            access_token,
            refresh_token: params.get("refresh_token").cloned().filter(|t| !t.is_empty()),
            expires_at: expiry(
                Utc::now(),
                params.get("expires_in").and_then(|v| v.parse().ok()),
                params.get("expires_at").and_then(|v| v.parse().ok()),
            ),
        };
        self.store_session(Some(session.clone()));
        self.persist(Some(&session)).await?;
        info!(email = %session.identity.email, "signed in");
        self.events.emit(SessionEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Exchange the refresh token for a new session.
    #[instrument(skip_all)]
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let current = self.cached_session().ok_or(AuthError::MissingSession)?;
        let refresh_token = current.refresh_token.clone().ok_or(AuthError::MissingSession)?;
        let res = self
            .http
            .execute(self.build_refresh_request(&refresh_token)?)
            .await?;
        if !res.status().is_success() {
            return Err(provider_error(res).await);
        }
        let token: TokenResponse = res.json().await?;
        let identity = match token.user {
            Some(user) => user.into_identity(),
            None => current.identity.clone(),
        };
        let session = Session {
            identity,
            access_token: token.access_token,
            refresh_token: token.refresh_token.or(Some(refresh_token)),
            expires_at: expiry(Utc::now(), token.expires_in, token.expires_at),
        };
        self.store_session(Some(session.clone()));
        self.persist(Some(&session)).await?;
        self.events.emit(SessionEvent::TokenRefreshed(session.clone()));
        Ok(session)
    }

    async fn drop_session(&self) {
        self.store_session(None);
        if let Err(err) = self.persist(None).await {
            warn!(?err, "failed to remove session file");
        }
        self.events.emit(SessionEvent::SignedOut);
    }
}

#[async_trait]
impl AuthProvider for GoTrueClient {
    /// The stored session, refreshed first when it has expired.
    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(session) = self.cached_session() else {
            return Ok(None);
        };
        if session.is_valid() {
            return Ok(Some(session));
        }
        if session.refresh_token.is_none() {
            self.drop_session().await;
            return Ok(None);
        }
        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                warn!(?err, "session refresh failed");
                self.drop_session().await;
                Err(err)
            }
        }
    }

    fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    #[instrument(skip_all, fields(provider = %provider))]
    async fn sign_in_with_oauth(&self, provider: &str, redirect_to: &Url) -> Result<Url, AuthError> {
        let res = self.http.execute(self.build_settings_request()?).await?;
        if !res.status().is_success() {
            return Err(provider_error(res).await);
        }
        let settings: SettingsResponse = res.json().await?;
        if !settings.external.get(provider).copied().unwrap_or(false) {
            return Err(AuthError::Provider {
                status: StatusCode::BAD_REQUEST.as_u16(),
                message: format!("provider {provider} is not enabled"),
            });
        }
        self.authorize_url(provider, redirect_to)
    }

    #[instrument(skip_all)]
    async fn sign_out(&self) -> Result<(), AuthError> {
        let Some(session) = self.cached_session() else {
            self.drop_session().await;
            return Ok(());
        };
        let result = match self.build_logout_request(&session.access_token) {
            Ok(request) => match self.http.execute(request).await {
                Ok(res) if res.status().is_success() => Ok(()),
                // Already-invalid tokens still count as signed out.
                Ok(res) if res.status() == StatusCode::UNAUTHORIZED => Ok(()),
                Ok(res) => Err(provider_error(res).await),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err),
        };
        self.drop_session().await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Identity;
    use tempfile::tempdir;

    fn client() -> GoTrueClient {
        GoTrueClient::new(Url::parse("https://abcd.supabase.co").unwrap(), "anon".into())
    }

    #[test]
    fn authorize_url_carries_provider_and_redirect() {
        let redirect = Url::parse("http://localhost:5173/admin").unwrap();
        let url = client().authorize_url("google", &redirect).unwrap();
        assert_eq!(url.path(), "/auth/v1/authorize");
        let pairs: HashMap<String, String> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs["provider"], "google");
        assert_eq!(pairs["redirect_to"], "http://localhost:5173/admin");
    }

    #[test]
    fn request_builders_set_auth_headers() {
        let c = client();
        let req = c.build_user_request("jwt").unwrap();
        assert_eq!(req.url().path(), "/auth/v1/user");
        assert_eq!(req.headers()["apikey"], "anon");
        assert_eq!(req.headers()["Authorization"], "Bearer jwt");

        let req = c.build_refresh_request("r1").unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().query(), Some("grant_type=refresh_token"));

        let req = c.build_logout_request("jwt").unwrap();
        assert_eq!(req.url().path(), "/auth/v1/logout");
    }

    #[test]
    fn parse_params_decodes_values() {
        let params =
            parse_params("access_token=a%2Eb&error_description=Email+not+allowed&flag").unwrap();
        assert_eq!(params["access_token"], "a.b");
        assert_eq!(params["error_description"], "Email not allowed");
        assert_eq!(params["flag"], "");
    }

    #[test]
    fn expiry_prefers_absolute_timestamp() {
        let now = Utc::now();
        let at = expiry(now, Some(3600), Some(1_700_000_000)).unwrap();
        assert_eq!(at.timestamp(), 1_700_000_000);
        let rel = expiry(now, Some(60), None).unwrap();
        assert_eq!((rel - now).num_seconds(), 60);
        assert!(expiry(now, None, None).is_none());
    }

    #[tokio::test]
    async fn redirect_error_is_reported_without_network() {
        let url = Url::parse(
            "http://localhost:5173/admin?error=access_denied&error_description=User+cancelled",
        )
        .unwrap();
        match client().complete_sign_in(&url).await {
            Err(AuthError::Provider { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "User cancelled");
            }
            other => panic!("unexpected {other:?}"),
        }

        let url = Url::parse("http://localhost:5173/admin#token_type=bearer").unwrap();
        assert!(matches!(
            client().complete_sign_in(&url).await,
            Err(AuthError::InvalidRedirect(_))
        ));
    }

    #[tokio::test]
    async fn session_file_round_trips_and_sign_out_clears_it() {
        let td = tempdir().unwrap();
        let path = td.path().join("state/session.json");
        let session = Session {
            identity: Identity {
                id: "u1".into(),
                email: "a@x.com".into(),
                display_name: Some("A".into()),
                avatar_url: None,
            },
            access_token: "jwt".into(),
            refresh_token: None,
            expires_at: None,
        };
        let base = Url::parse("http://127.0.0.1:9").unwrap();

        let c = GoTrueClient::with_session_file(base.clone(), "anon".into(), path.clone())
            .await
            .unwrap();
        assert_eq!(c.current_session().await.unwrap(), None);
        c.store_session(Some(session.clone()));
        c.persist(Some(&session)).await.unwrap();

        let reopened = GoTrueClient::with_session_file(base, "anon".into(), path.clone())
            .await
            .unwrap();
        assert_eq!(reopened.current_session().await.unwrap(), Some(session));

        let mut sub = reopened.subscribe();
        // Logout against an unreachable host fails, but the session is gone.
        assert!(reopened.sign_out().await.is_err());
        assert_eq!(reopened.current_session().await.unwrap(), None);
        assert!(!path.exists());
        assert_eq!(sub.recv().await, Some(SessionEvent::SignedOut));
    }

    #[tokio::test]
    async fn expired_session_without_refresh_token_is_dropped() {
        let c = client();
        let mut sub = c.subscribe();
        c.store_session(Some(Session {
            identity: Identity {
                id: "u1".into(),
                email: "a@x.com".into(),
                display_name: None,
                avatar_url: None,
            },
            access_token: "jwt".into(),
            refresh_token: None,
            expires_at: Some(Utc::now() - Duration::seconds(5)),
        }));
        assert_eq!(c.current_session().await.unwrap(), None);
        assert_eq!(sub.recv().await, Some(SessionEvent::SignedOut));
    }
}
