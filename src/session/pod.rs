//! Diaspora* pod session over HTTP.
//!
//! Speaks the pod's web endpoints the way a browser session does: a cookie
//! jar holds the Rails session, and mutating requests carry the CSRF token
//! scraped from the `<meta name="csrf-token">` tag.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | login | `GET /users/sign_in`, then `POST /users/sign_in` (form) |
//! | logout | `GET /users/sign_out` |
//! | groups | `GET /bookmarklet`, parse `gon.user.aspects` |
//! | contacts | `GET /contacts.json` |
//! | group members | `GET /contacts.json?a_id={id}&set=only_aspect` |
//! | create group | `POST /aspects` (form) |
//! | lookup by handle | `GET /people.json?q={handle}` |
//! | lookup by guid | `GET /people/{guid}/stream.json` (author of the first post) |
//! | discovery | `GET /people?q={handle}` as `text/html` |
//! | add membership | `POST /aspect_memberships.json` |
//!
//! # Retry
//!
//! Idempotent GETs retry network errors, HTTP 429 and 5xx with exponential
//! backoff starting at `[http].retry_backoff_ms` (1s, 2s, 4s, ... by default)
//! up to `[http].max_retries`. Other statuses are returned to the caller
//! unretried.

use std::collections::HashSet;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{NodeCredentials, NodeSession};
use crate::config::{Config, HttpConfig, MembershipConfig};
use crate::error::{MembershipError, SessionError};
use crate::models::{Contact, Group, GroupId, ResolvedIdentity, UserId, UserQuery};

const ACCEPT_JSON: &str = "application/json";
const ACCEPT_HTML: &str = "text/html";
const CSRF_HEADER: &str = "X-CSRF-Token";

/// A person record as pods serialize it in contact and people listings.
#[derive(Debug, Deserialize)]
struct PodPerson {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    guid: String,
    #[serde(default, alias = "diaspora_id")]
    handle: String,
}

#[derive(Debug, Deserialize)]
struct PodAspect {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct PodUserData {
    #[serde(default)]
    aspects: Vec<PodAspect>,
}

#[derive(Debug, Deserialize)]
struct PodPost {
    author: PodPerson,
}

#[derive(Debug, Deserialize)]
struct CreatedAspect {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    name: Option<String>,
}

/// HTTP session against one pod.
pub struct PodSession {
    credentials: NodeCredentials,
    client: reqwest::Client,
    http: HttpConfig,
    membership: MembershipConfig,
    csrf: Mutex<Option<String>>,
}

impl PodSession {
    /// Build a session. No request is sent until [`login`](NodeSession::login).
    pub fn new(credentials: NodeCredentials, config: &Config) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.http.timeout_secs))
            .user_agent(config.http.user_agent())
            .build()?;

        Ok(Self {
            credentials,
            client,
            http: config.http.clone(),
            membership: config.membership.clone(),
            csrf: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.credentials.url,
            path.trim_start_matches('/')
        )
    }

    fn set_csrf(&self, token: Option<String>) {
        *self.csrf.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    fn csrf(&self) -> Result<String, SessionError> {
        self.csrf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| SessionError::Auth(format!("not logged in to {}", self.host())))
    }

    /// GET with retry on transient failures. Non-transient error statuses
    /// are returned as a response so callers can interpret them.
    async fn get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        accept: &str,
    ) -> Result<Response, SessionError> {
        let url = self.url(path);
        let mut last_err = None;

        for attempt in 0..=self.http.max_retries {
            if attempt > 0 {
                let delay = self.http.retry_delay(attempt);
                tracing::debug!(%url, attempt, ?delay, "retrying request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .get(&url)
                .query(query)
                .header(ACCEPT, accept)
                .send()
                .await;

            let err = match resp {
                Ok(response) => {
                    let status = response.status();
                    if status != StatusCode::TOO_MANY_REQUESTS && !status.is_server_error() {
                        return Ok(response);
                    }
                    SessionError::Status {
                        status: status.as_u16(),
                        body: response.text().await.unwrap_or_default(),
                    }
                }
                Err(e) => SessionError::from(e),
            };
            if !err.is_transient() {
                return Err(err);
            }
            tracing::debug!(%url, error = %err, "request failed");
            last_err = Some(err);
        }

        Err(last_err.unwrap_or_else(|| SessionError::Protocol(format!("GET {} failed", url))))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, SessionError> {
        let response = ensure_success(self.get(path, query, ACCEPT_JSON).await?).await?;
        Ok(response.json().await?)
    }

    async fn get_html(&self, path: &str) -> Result<String, SessionError> {
        let response = ensure_success(self.get(path, &[], ACCEPT_HTML).await?).await?;
        Ok(response.text().await?)
    }

    /// The logged-in user's data blob, embedded in pages as `gon.user`.
    async fn user_data(&self) -> Result<PodUserData, SessionError> {
        let html = self.get_html("bookmarklet").await?;
        let value = extract_gon_user(&html).ok_or_else(|| {
            SessionError::Protocol(format!("no gon.user data on {}", self.host()))
        })?;
        serde_json::from_value(value)
            .map_err(|e| SessionError::Protocol(format!("malformed gon.user: {}", e)))
    }

    async fn lookup_by_handle(&self, handle: &str) -> Result<ResolvedIdentity, SessionError> {
        let people: Vec<PodPerson> = self.get_json("people.json", &[("q", handle)]).await?;
        Ok(people
            .into_iter()
            .find(|p| p.handle.eq_ignore_ascii_case(handle))
            .map(|p| ResolvedIdentity {
                target_user_id: p.id.unwrap_or(0),
                guid: p.guid,
            })
            .unwrap_or_else(|| ResolvedIdentity::not_found("")))
    }

    async fn lookup_by_guid(&self, guid: &str) -> Result<ResolvedIdentity, SessionError> {
        let path = format!("people/{}/stream.json", guid);
        let response = self.get(&path, &[], ACCEPT_JSON).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(ResolvedIdentity::not_found(guid));
        }
        let posts: Vec<PodPost> = ensure_success(response).await?.json().await?;
        Ok(posts
            .into_iter()
            .map(|post| post.author)
            .find(|author| author.guid == guid)
            .map(|author| ResolvedIdentity {
                target_user_id: author.id.unwrap_or(0),
                guid: author.guid,
            })
            .unwrap_or_else(|| ResolvedIdentity::not_found(guid)))
    }
}

async fn ensure_success(response: Response) -> Result<Response, SessionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SessionError::Status {
        status: status.as_u16(),
        body,
    })
}

static META_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<meta\b[^>]*>").expect("META_TAG is a valid regex pattern")
});

static TAG_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([a-z][a-z0-9_-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("TAG_ATTR is a valid regex pattern")
});

/// Pull the `content` of `<meta name="{name}" content="...">` out of a page.
/// Attributes may come in any order and with either quote style.
fn extract_meta_content(html: &str, name: &str) -> Option<String> {
    META_TAG.find_iter(html).find_map(|tag| {
        let mut tag_name = None;
        let mut content = None;
        for attr in TAG_ATTR.captures_iter(tag.as_str()) {
            let value = attr.get(2).or_else(|| attr.get(3)).map(|m| m.as_str());
            match attr[1].to_ascii_lowercase().as_str() {
                "name" => tag_name = value,
                "content" => content = value,
                _ => {}
            }
        }
        if tag_name == Some(name) {
            content.map(str::to_string)
        } else {
            None
        }
    })
}

/// Parse the JSON object assigned to `gon.user` in an inline script.
fn extract_gon_user(html: &str) -> Option<serde_json::Value> {
    let at = html.find("gon.user=")?;
    let rest = &html[at + "gon.user=".len()..];
    serde_json::Deserializer::from_str(rest)
        .into_iter::<serde_json::Value>()
        .next()?
        .ok()
}

#[async_trait]
impl NodeSession for PodSession {
    fn host(&self) -> &str {
        self.credentials.host()
    }

    async fn login(&self) -> Result<(), SessionError> {
        let page = self.get_html("users/sign_in").await?;
        let token = extract_meta_content(&page, "csrf-token")
            .ok_or_else(|| SessionError::Protocol("sign-in page has no csrf token".into()))?;

        let form = [
            ("utf8", "✓"),
            ("authenticity_token", token.as_str()),
            ("user[username]", self.credentials.username.as_str()),
            ("user[password]", self.credentials.password.as_str()),
            ("user[remember_me]", "1"),
        ];
        let response = self
            .client
            .post(self.url("users/sign_in"))
            .header(ACCEPT, ACCEPT_HTML)
            .form(&form)
            .send()
            .await?;

        // A refused login redirects back to the sign-in form.
        if response.url().path().ends_with("/users/sign_in") {
            return Err(SessionError::Auth(format!(
                "{} rejected credentials for {}",
                self.host(),
                self.credentials.username
            )));
        }
        let landing = ensure_success(response).await?.text().await?;

        let token = match extract_meta_content(&landing, "csrf-token") {
            Some(t) => t,
            None => {
                let page = self.get_html("bookmarklet").await?;
                extract_meta_content(&page, "csrf-token").ok_or_else(|| {
                    SessionError::Protocol("no csrf token after sign-in".into())
                })?
            }
        };
        self.set_csrf(Some(token));
        tracing::info!(host = self.host(), user = %self.credentials.username, "logged in");
        Ok(())
    }

    async fn logout(&self) -> Result<(), SessionError> {
        self.set_csrf(None);
        ensure_success(self.get("users/sign_out", &[], ACCEPT_HTML).await?).await?;
        tracing::info!(host = self.host(), "logged out");
        Ok(())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, SessionError> {
        let people: Vec<PodPerson> = self.get_json("contacts.json", &[]).await?;
        Ok(people
            .into_iter()
            .filter(|p| !p.guid.is_empty())
            .map(|p| Contact::new(p.handle, p.guid))
            .collect())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, SessionError> {
        Ok(self
            .user_data()
            .await?
            .aspects
            .into_iter()
            .map(|a| Group::new(a.id, a.name))
            .collect())
    }

    async fn list_group_members(&self, group_id: GroupId) -> Result<HashSet<String>, SessionError> {
        let id = group_id.to_string();
        let people: Vec<PodPerson> = self
            .get_json("contacts.json", &[("a_id", id.as_str()), ("set", "only_aspect")])
            .await?;
        Ok(people.into_iter().map(|p| p.guid).collect())
    }

    async fn create_group(&self, name: &str) -> Result<Group, SessionError> {
        let token = self.csrf()?;
        let form = [
            ("authenticity_token", token.as_str()),
            ("aspect[name]", name),
            ("aspect[contacts_visible]", "false"),
        ];
        let response = self
            .client
            .post(self.url("aspects"))
            .header(ACCEPT, ACCEPT_JSON)
            .header(CSRF_HEADER, &token)
            .form(&form)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let body = response.text().await?;
        let created = serde_json::from_str::<CreatedAspect>(&body).ok();
        let id = created.as_ref().and_then(|c| c.id);
        let name = created
            .and_then(|c| c.name)
            .unwrap_or_else(|| name.to_string());
        tracing::info!(host = self.host(), group = %name, ?id, "created group");
        Ok(Group { id, name })
    }

    async fn lookup_user(&self, query: UserQuery<'_>) -> Result<ResolvedIdentity, SessionError> {
        match query {
            UserQuery::Handle(handle) => self.lookup_by_handle(handle).await,
            UserQuery::Guid(guid) => self.lookup_by_guid(guid).await,
        }
    }

    async fn trigger_discovery(&self, handle: &str) -> Result<(), SessionError> {
        ensure_success(self.get("people", &[("q", handle)], ACCEPT_HTML).await?).await?;
        Ok(())
    }

    async fn add_membership(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<(), MembershipError> {
        let token = self
            .csrf()
            .map_err(|e| MembershipError::Other(e.to_string()))?;
        let body = serde_json::json!({
            "aspect_id": group_id,
            "person_id": user_id,
        });

        let response = self
            .client
            .post(self.url("aspect_memberships.json"))
            .header(ACCEPT, ACCEPT_JSON)
            .header(CONTENT_TYPE, ACCEPT_JSON)
            .header(CSRF_HEADER, &token)
            .json(&body)
            .send()
            .await
            .map_err(|e| MembershipError::Other(format!("transport error: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(self.membership.classify(status.as_u16(), &text))
    }
}
