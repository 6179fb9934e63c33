//! Thread-safe vendor API client.
//!
//! All public methods serialize through one mutex, so a JWT refresh is
//! never raced by a concurrent request on the same client. Each HTTP call
//! carries a 10 second timeout. A 401 on a first attempt clears the cached
//! token and the request is retried exactly once with a fresh one.

use super::error::ApiError;
use crate::BootstrapResult;
use crate::telemetry::log;
use anyhow::Context as _;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Mutex;

const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const PAGE_SIZE: u32 = 100;

const USER_AGENT: &str = concat!("hostmon/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct JwtResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// Identity returned by agent registration.
#[derive(Clone, Debug, Deserialize)]
pub struct RegisteredAgent {
    /// Agent UUID assigned by the vendor.
    pub id: String,
}

struct Session {
    username: String,
    password: String,
    jwt: Option<String>,
}

/// Vendor API client.
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    session: Mutex<Session>,
}

impl Client {
    /// Creates a client for `base_url` authenticating as `username`.
    ///
    /// `tls_insecure` disables certificate verification; development only.
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        tls_insecure: bool,
    ) -> BootstrapResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(tls_insecure)
            .build()
            .context("building uplink HTTP client")?;

        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            http,
            base_url,
            session: Mutex::new(Session {
                username: username.into(),
                password: password.into(),
                jwt: None,
            }),
        })
    }

    /// Replaces the credentials (e.g. after registration) and drops the
    /// cached token.
    pub async fn set_credentials(&self, username: impl Into<String>, password: impl Into<String>) {
        let mut session = self.session.lock().await;

        session.username = username.into();
        session.password = password.into();
        session.jwt = None;
    }

    /// Performs a JWT-authenticated request against `path` and decodes the
    /// JSON response.
    ///
    /// On a 401 from a first attempt, the cached token is dropped and the
    /// request retried exactly once; a second 401 surfaces as an
    /// authentication error.
    pub async fn request<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(StatusCode, R), ApiError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let mut session = self.session.lock().await;
        let url = self.abs_url(path);
        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| ApiError::unmarshal(0, "request body", err))?;

        let (status, content) = self.call_with_auth(&mut session, method, &url, body).await?;

        decode_body(status, content)
    }

    /// Performs a request authenticated with HTTP Basic credentials instead
    /// of a JWT. Used for token acquisition and registration.
    pub async fn post_auth<B, R>(
        &self,
        path: &str,
        body: &B,
        username: &str,
        password: &str,
    ) -> Result<(StatusCode, R), ApiError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        // Serializes with the session lock held like every other call.
        let _session = self.session.lock().await;

        let response = self
            .http
            .post(self.abs_url(path))
            .basic_auth(username, Some(password))
            .header("X-Requested-With", "XMLHttpRequest")
            .json(body)
            .send()
            .await
            .map_err(|err| ApiError::transport(&err))?;

        let status = response.status();
        let content = response
            .text()
            .await
            .map_err(|err| ApiError::transport(&err))?;

        decode_body(status, content)
    }

    /// Obtains (and caches) a JWT for the current credentials.
    ///
    /// A 4xx from the token endpoint is an authentication error; there is
    /// no retry here.
    pub async fn get_jwt(&self) -> Result<String, ApiError> {
        let mut session = self.session.lock().await;

        if let Some(jwt) = &session.jwt {
            return Ok(jwt.clone());
        }

        let jwt = self.fetch_jwt(&session).await?;
        session.jwt = Some(jwt.clone());

        Ok(jwt)
    }

    /// Iterates a paginated REST collection, following `next` links and
    /// accumulating `results`. A 404 terminates the iteration cleanly.
    pub async fn iterate(
        &self,
        resource: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        let mut session = self.session.lock().await;

        let mut query = format!("page_size={PAGE_SIZE}");
        for (key, value) in params {
            query.push('&');
            query.push_str(key);
            query.push('=');
            query.push_str(value);
        }

        let mut url = format!("{}v1/{resource}/?{query}", self.base_url);
        let mut results = Vec::new();

        loop {
            let (status, content) = self
                .call_with_auth(&mut session, Method::GET, &url, None)
                .await?;

            // A 404 is an ordinary end of stream during pagination.
            if status == StatusCode::NOT_FOUND {
                break;
            }

            if !status.is_success() {
                return Err(ApiError::status(status.as_u16(), content));
            }

            let page: Page = serde_json::from_str(&content)
                .map_err(|err| ApiError::unmarshal(status.as_u16(), content, err))?;

            results.extend(page.results);

            match page.next {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }

        Ok(results)
    }

    /// Registers a new agent with the vendor using the account registration
    /// key and returns the assigned identity.
    pub async fn register(
        &self,
        account_id: &str,
        registration_key: &str,
        display_name: &str,
        initial_password: &str,
    ) -> Result<RegisteredAgent, ApiError> {
        let body = serde_json::json!({
            "account": account_id,
            "display_name": display_name,
            "initial_password": initial_password,
        });

        let (_, agent) = self
            .post_auth::<_, RegisteredAgent>("v1/agent/", &body, account_id, registration_key)
            .await?;

        Ok(agent)
    }

    fn abs_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    /// One JWT-authenticated exchange with the single-shot 401 retry.
    async fn call_with_auth(
        &self,
        session: &mut Session,
        method: Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, String), ApiError> {
        let mut first = true;

        loop {
            let jwt = match &session.jwt {
                Some(jwt) => jwt.clone(),
                None => {
                    let jwt = self.fetch_jwt(session).await?;
                    session.jwt = Some(jwt.clone());
                    jwt
                }
            };

            let mut request = self
                .http
                .request(method.clone(), url)
                .bearer_auth(jwt)
                .header("X-Requested-With", "XMLHttpRequest");

            if let Some(body) = &body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|err| ApiError::transport(&err))?;
            let status = response.status();
            let content = response
                .text()
                .await
                .map_err(|err| ApiError::transport(&err))?;

            if status == StatusCode::UNAUTHORIZED {
                session.jwt = None;

                if first {
                    first = false;
                    log::debug!("token rejected, re-authenticating"; "url" => url);
                    continue;
                }

                return Err(ApiError::auth(status.as_u16(), content));
            }

            return Ok((status, content));
        }
    }

    /// Obtains a fresh JWT. A 4xx response is an authentication error;
    /// other non-200 responses are generic API errors. No retry here.
    async fn fetch_jwt(&self, session: &Session) -> Result<String, ApiError> {
        let body = serde_json::json!({
            "username": session.username,
            "password": session.password,
        });

        let response = self
            .http
            .post(self.abs_url("v1/jwt-auth/"))
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&body)
            .send()
            .await
            .map_err(|err| ApiError::transport(&err))?;

        let status = response.status();
        let content = response
            .text()
            .await
            .map_err(|err| ApiError::transport(&err))?;

        if status.is_client_error() {
            return Err(ApiError::auth(status.as_u16(), content));
        }

        if status != StatusCode::OK {
            return Err(ApiError::status(status.as_u16(), content));
        }

        let reply: JwtResponse = serde_json::from_str(&content)
            .map_err(|err| ApiError::unmarshal(status.as_u16(), content, err))?;

        Ok(reply.token)
    }
}

fn decode_body<R: DeserializeOwned>(
    status: StatusCode,
    content: String,
) -> Result<(StatusCode, R), ApiError> {
    if !status.is_success() {
        return Err(ApiError::status(status.as_u16(), content));
    }

    let decoded = if content.is_empty() {
        // Some endpoints reply 204 with an empty body.
        serde_json::from_str("null")
    } else {
        serde_json::from_str(&content)
    };

    match decoded {
        Ok(decoded) => Ok((status, decoded)),
        Err(err) => Err(ApiError::unmarshal(status.as_u16(), content, err)),
    }
}
