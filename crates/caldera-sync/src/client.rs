//! # CalDAV Client
//!
//! HTTP client for one CalDAV account.
//!
//! ## Request Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CalDavClient::execute                            │
//! │                                                                         │
//! │  build request ──► Authorization                                       │
//! │       ▲               • Digest if a challenge is cached                │
//! │       │               • Basic otherwise                                │
//! │       │                                                                 │
//! │       │            send (per-request timeout)                          │
//! │       │                 │                                               │
//! │       │     ┌───────────┼─────────────────────┬──────────────────┐     │
//! │       │     ▼           ▼                     ▼                  ▼     │
//! │       │    401        429 / 503              other             2xx    │
//! │       │  Digest?    Retry-After ≤ inline     status map        body   │
//! │       │  new nonce   wait and retries left   (NotFound,        (size- │
//! │       └──── yes        └── sleep, resend     Conflict, ...)    capped)│
//! │              no ──► AuthFailure     else ──► RateLimited{retry_after}  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Status Mapping
//! ```text
//! 404 / 410   → NotFound
//! 409 / 412   → Conflict         (ETag precondition)
//! 401         → AuthFailure
//! 403         → Forbidden
//! 429 / 503   → RateLimited      (after inline retries)
//! other       → ServerError{status}
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
    IF_MATCH, IF_NONE_MATCH, RETRY_AFTER, WWW_AUTHENTICATE,
};
use reqwest::{Method, Response, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use caldera_core::Calendar;

use crate::config::{AccountConfig, SyncConfig, SyncSettings};
use crate::digest::{request_uri, DigestChallenge, DigestSession};
use crate::error::{SyncError, SyncResult};
use crate::protocol;

/// Upper bound on requests sent for one logical call.
const MAX_ATTEMPTS: u32 = 8;

const XML_CONTENT: &str = "application/xml; charset=utf-8";
const ICS_CONTENT: &str = "text/calendar; charset=utf-8";

// =============================================================================
// Settings and Results
// =============================================================================

/// Client limits, usually derived from [`SyncSettings`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub request_timeout: Duration,
    pub max_response_bytes: usize,
    /// 429/503 responses retried inside one call.
    pub rate_limit_retries: u32,
    /// Longest `Retry-After` honored inline; longer waits go back to the queue.
    pub max_inline_wait: Duration,
    pub user_agent: String,
}

impl ClientSettings {
    pub fn from_sync(settings: &SyncSettings, user_agent: impl Into<String>) -> Self {
        ClientSettings {
            request_timeout: settings.request_timeout(),
            max_response_bytes: settings.max_response_bytes,
            rate_limit_retries: settings.rate_limit_retries,
            max_inline_wait: settings.max_inline_wait(),
            user_agent: user_agent.into(),
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        ClientSettings::from_sync(&SyncSettings::default(), "caldera")
    }
}

/// A calendar collection found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCalendar {
    /// Absolute collection URL.
    pub url: String,
    pub display_name: String,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
    pub color: Option<String>,
}

/// A member resource's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceState {
    /// Absolute resource URL.
    pub url: String,
    pub etag: Option<String>,
}

/// Changes since the last sync token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaListing {
    pub changed: Vec<ResourceState>,
    /// Absolute URLs the server reported as removed.
    pub removed: Vec<String>,
    /// Token to store for the next pass.
    pub sync_token: Option<String>,
    /// `changed` is the complete member list; removals must be diffed locally.
    pub full: bool,
}

/// A fetched calendar object resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedResource {
    pub url: String,
    pub etag: Option<String>,
    pub body: String,
}

/// Condition attached to a PUT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// `If-None-Match: *`, the resource must not exist.
    Create,
    /// `If-Match: <etag>`, the resource must be unchanged.
    Match(String),
    /// No condition; used when a previous attempt may already have landed.
    Unconditional,
}

// =============================================================================
// Client
// =============================================================================

/// CalDAV client for one account.
///
/// Clones share the HTTP connection pool and the Digest nonce state.
#[derive(Debug, Clone)]
pub struct CalDavClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
    digest: Arc<DigestSession>,
    settings: ClientSettings,
}

impl CalDavClient {
    /// Creates a client for a configured account.
    pub fn new(account: &AccountConfig, settings: ClientSettings) -> SyncResult<Self> {
        let password = account.resolve_password()?;
        Self::with_credentials(&account.base_url, &account.username, &password, settings)
    }

    /// Creates a client from explicit credentials.
    pub fn with_credentials(
        base_url: &str,
        username: &str,
        password: &str,
        settings: ClientSettings,
    ) -> SyncResult<Self> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(settings.user_agent.clone())
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(CalDavClient {
            http,
            base_url,
            username: username.to_string(),
            password: password.to_string(),
            digest: Arc::new(DigestSession::new()),
            settings,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves an href (absolute path or URL) against the account.
    pub fn resolve(&self, href: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(href)?)
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Checks that the server advertises `calendar-access`.
    pub async fn check_calendar_access(&self) -> SyncResult<()> {
        let url = self.base_url.clone();
        let response = self
            .execute(Method::OPTIONS, &url, HeaderMap::new(), None)
            .await?;
        let response = check_status(response, &url)?;

        let dav = HeaderName::from_static("dav");
        let values: Vec<&str> = response
            .headers()
            .get_all(&dav)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if protocol::advertises_calendar_access(values) {
            Ok(())
        } else {
            Err(SyncError::NotCalDav(url.to_string()))
        }
    }

    /// Walks principal → calendar home → collections.
    ///
    /// ## Returns
    /// Every calendar collection that can hold VEVENTs.
    pub async fn discover(&self) -> SyncResult<Vec<DiscoveredCalendar>> {
        self.check_calendar_access().await?;

        let base = self.base_url.clone();
        let principal = self
            .propfind(&base, "0", protocol::current_user_principal_body())
            .await?
            .responses
            .into_iter()
            .find_map(|r| r.principal)
            .map(|href| self.resolve(&href))
            .transpose()?
            .unwrap_or_else(|| base.clone());

        let home = self
            .propfind(&principal, "0", protocol::calendar_home_set_body())
            .await?
            .responses
            .into_iter()
            .find_map(|r| r.calendar_home)
            .map(|href| self.resolve(&href))
            .transpose()?
            .unwrap_or_else(|| principal.clone());

        let listing = self
            .propfind(&home, "1", protocol::list_calendars_body())
            .await?;

        let mut calendars = Vec::new();
        for response in listing.responses {
            if !response.is_calendar || !response.supports_events {
                continue;
            }
            let url = self.resolve(&response.href)?;
            let display_name = response.display_name.unwrap_or_else(|| {
                url.path_segments()
                    .and_then(|s| s.filter(|p| !p.is_empty()).last())
                    .unwrap_or("Calendar")
                    .to_string()
            });
            calendars.push(DiscoveredCalendar {
                url: url.to_string(),
                display_name,
                ctag: response.ctag,
                sync_token: response.sync_token,
                color: response.color,
            });
        }

        info!(home = %home, count = calendars.len(), "Discovered calendars");
        Ok(calendars)
    }

    /// Current `getctag` and `sync-token` of a collection.
    pub async fn collection_state(
        &self,
        collection: &str,
    ) -> SyncResult<(Option<String>, Option<String>)> {
        let url = Url::parse(collection)?;
        let ms = self
            .propfind(&url, "0", protocol::collection_state_body())
            .await?;
        let state = ms
            .responses
            .into_iter()
            .next()
            .map(|r| (r.ctag, r.sync_token))
            .unwrap_or((None, None));
        Ok(state)
    }

    // =========================================================================
    // Delta Sync
    // =========================================================================

    /// Lists changes since `sync_token`.
    ///
    /// Falls back to a full calendar-query listing when the token is
    /// rejected or the server lacks sync-collection.
    pub async fn delta(&self, collection: &str, sync_token: Option<&str>) -> SyncResult<DeltaListing> {
        match self.sync_collection(collection, sync_token).await {
            Ok(listing) => Ok(listing),
            Err(SyncError::InvalidSyncToken) => {
                info!(collection = %collection, "Sync token rejected; listing in full");
                self.full_listing(collection).await
            }
            Err(SyncError::ServerError { status }) if matches!(status, 400 | 403 | 405 | 501) => {
                debug!(collection = %collection, status, "sync-collection unsupported; listing in full");
                self.full_listing(collection).await
            }
            Err(err) => Err(err),
        }
    }

    /// RFC 6578 sync-collection report.
    pub async fn sync_collection(
        &self,
        collection: &str,
        sync_token: Option<&str>,
    ) -> SyncResult<DeltaListing> {
        let url = Url::parse(collection)?;
        let body = protocol::sync_collection_body(sync_token);
        let response = self
            .execute(dav_method("REPORT")?, &url, xml_headers("0"), Some(body))
            .await?;

        let status = response.status();
        if matches!(status, StatusCode::FORBIDDEN | StatusCode::CONFLICT) {
            let text = self.read_body(response).await?;
            if protocol::is_invalid_sync_token(&text) {
                return Err(SyncError::InvalidSyncToken);
            }
            return Err(SyncError::ServerError {
                status: status.as_u16(),
            });
        }
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(SyncError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(SyncError::ServerError {
                status: status.as_u16(),
            });
        }

        let text = self.read_body(response).await?;
        let ms = protocol::parse_multistatus(&text)?;

        // Without a token the report lists every member.
        let mut listing = DeltaListing {
            sync_token: ms.sync_token,
            full: sync_token.is_none(),
            ..DeltaListing::default()
        };
        for member in ms.responses {
            let member_url = self.resolve(&member.href)?;
            if same_resource(&member_url, &url) {
                continue;
            }
            if member.is_removed() {
                listing.removed.push(member_url.to_string());
            } else {
                listing.changed.push(ResourceState {
                    url: member_url.to_string(),
                    etag: member.etag,
                });
            }
        }
        debug!(
            collection = %collection,
            changed = listing.changed.len(),
            removed = listing.removed.len(),
            "sync-collection"
        );
        Ok(listing)
    }

    /// Every VEVENT resource of a collection.
    pub async fn list_resources(&self, collection: &str) -> SyncResult<Vec<ResourceState>> {
        let url = Url::parse(collection)?;
        let response = self
            .execute(
                dav_method("REPORT")?,
                &url,
                xml_headers("1"),
                Some(protocol::calendar_query_body()),
            )
            .await?;
        let response = check_status(response, &url)?;
        let text = self.read_body(response).await?;
        let ms = protocol::parse_multistatus(&text)?;

        let mut resources = Vec::new();
        for member in ms.responses {
            let member_url = self.resolve(&member.href)?;
            if same_resource(&member_url, &url) || member.is_removed() {
                continue;
            }
            resources.push(ResourceState {
                url: member_url.to_string(),
                etag: member.etag,
            });
        }
        Ok(resources)
    }

    async fn full_listing(&self, collection: &str) -> SyncResult<DeltaListing> {
        let changed = self.list_resources(collection).await?;
        let (_, sync_token) = self.collection_state(collection).await?;
        Ok(DeltaListing {
            changed,
            removed: Vec::new(),
            sync_token,
            full: true,
        })
    }

    /// Fetches bodies for a batch of member URLs.
    pub async fn multiget(&self, collection: &str, urls: &[String]) -> SyncResult<Vec<FetchedResource>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let url = Url::parse(collection)?;
        let hrefs: Vec<String> = urls
            .iter()
            .map(|u| Url::parse(u).map(|parsed| parsed.path().to_string()))
            .collect::<Result<_, _>>()?;
        let body = protocol::calendar_multiget_body(hrefs.iter().map(String::as_str));

        let response = self
            .execute(dav_method("REPORT")?, &url, xml_headers("1"), Some(body))
            .await?;
        let response = check_status(response, &url)?;
        let text = self.read_body(response).await?;
        let ms = protocol::parse_multistatus(&text)?;

        let mut fetched = Vec::new();
        for member in ms.responses {
            if member.is_removed() {
                continue;
            }
            if let Some(data) = member.calendar_data {
                fetched.push(FetchedResource {
                    url: self.resolve(&member.href)?.to_string(),
                    etag: member.etag,
                    body: data,
                });
            }
        }
        Ok(fetched)
    }

    // =========================================================================
    // Resource CRUD
    // =========================================================================

    /// GETs one resource.
    pub async fn get(&self, resource: &str) -> SyncResult<FetchedResource> {
        let url = Url::parse(resource)?;
        let response = self
            .execute(Method::GET, &url, HeaderMap::new(), None)
            .await?;
        let response = check_status(response, &url)?;
        let etag = header_string(response.headers(), &ETAG);
        let body = self.read_body(response).await?;
        Ok(FetchedResource {
            url: url.to_string(),
            etag,
            body,
        })
    }

    /// PUTs a resource under a precondition.
    ///
    /// ## Returns
    /// The new ETag. Servers that omit it from the PUT response are asked
    /// with a follow-up GET.
    pub async fn put(
        &self,
        resource: &str,
        body: String,
        precondition: Precondition,
    ) -> SyncResult<Option<String>> {
        let url = Url::parse(resource)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(ICS_CONTENT));
        match precondition {
            Precondition::Create => {
                headers.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
            }
            Precondition::Match(ref etag) => {
                headers.insert(IF_MATCH, header_value(etag)?);
            }
            Precondition::Unconditional => {}
        }

        let response = self.execute(Method::PUT, &url, headers, Some(body)).await?;
        let response = check_status(response, &url)?;
        match header_string(response.headers(), &ETAG) {
            Some(etag) => Ok(Some(etag)),
            None => {
                debug!(url = %url, "PUT response carried no ETag; fetching it");
                Ok(self.get(resource).await?.etag)
            }
        }
    }

    /// DELETEs a resource.
    ///
    /// ## Arguments
    /// * `etag` - Sent as `If-Match` when known
    pub async fn delete(&self, resource: &str, etag: Option<&str>) -> SyncResult<()> {
        let url = Url::parse(resource)?;
        let mut headers = HeaderMap::new();
        if let Some(etag) = etag {
            headers.insert(IF_MATCH, header_value(etag)?);
        }
        let response = self.execute(Method::DELETE, &url, headers, None).await?;
        check_status(response, &url)?;
        Ok(())
    }

    // =========================================================================
    // Transport
    // =========================================================================

    async fn propfind(&self, url: &Url, depth: &'static str, body: String) -> SyncResult<protocol::Multistatus> {
        let response = self
            .execute(dav_method("PROPFIND")?, url, xml_headers(depth), Some(body))
            .await?;
        let response = check_status(response, url)?;
        let text = self.read_body(response).await?;
        protocol::parse_multistatus(&text)
    }

    /// Sends a request, answering Digest challenges and short rate limits.
    ///
    /// ## Returns
    /// Any response other than 401 / 429 / 503; status mapping is left to
    /// the caller.
    async fn execute(
        &self,
        method: Method,
        url: &Url,
        headers: HeaderMap,
        body: Option<String>,
    ) -> SyncResult<Response> {
        let uri = request_uri(url);
        let mut digest_rejected = false;
        let mut rate_limited = 0u32;
        let mut default_wait = ExponentialBackoff::default();

        for attempt in 1..=MAX_ATTEMPTS {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .headers(headers.clone());
            if let Some(ref body) = body {
                request = request.body(body.clone());
            }

            let sent_nonce = match self
                .digest
                .authorize(&self.username, &self.password, method.as_str(), &uri)
            {
                Some((authorization, nonce)) => {
                    request = request.header(AUTHORIZATION, header_value(&authorization)?);
                    Some(nonce)
                }
                None => {
                    request = request.header(AUTHORIZATION, header_value(&self.basic_auth())?);
                    None
                }
            };

            debug!(attempt, %method, %url, "Sending CalDAV request");
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    SyncError::Timeout(self.settings.request_timeout.as_secs())
                } else {
                    SyncError::from(e)
                }
            })?;

            match response.status() {
                StatusCode::UNAUTHORIZED => {
                    let challenge = DigestChallenge::from_headers(
                        response
                            .headers()
                            .get_all(WWW_AUTHENTICATE)
                            .iter()
                            .filter_map(|v| v.to_str().ok()),
                    );
                    let challenge = match challenge {
                        Some(challenge) => challenge,
                        None => {
                            return Err(SyncError::AuthFailure(format!(
                                "{} rejected the credentials",
                                url
                            )))
                        }
                    };

                    // A Digest answer gets one retry, and only for a stale nonce.
                    if sent_nonce.is_some() {
                        if digest_rejected || !challenge.stale {
                            warn!(url = %url, realm = %challenge.realm, "Digest credentials rejected");
                            return Err(SyncError::AuthFailure(format!(
                                "{} rejected the digest response",
                                url
                            )));
                        }
                        digest_rejected = true;
                    }

                    debug!(url = %url, stale = challenge.stale, "Answering digest challenge");
                    self.digest.remember(challenge);
                }
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                    let wait = parse_retry_after(response.headers(), Utc::now()).unwrap_or_else(|| {
                        default_wait
                            .next_backoff()
                            .unwrap_or(default_wait.max_interval)
                    });
                    if rate_limited < self.settings.rate_limit_retries
                        && wait <= self.settings.max_inline_wait
                    {
                        rate_limited += 1;
                        debug!(url = %url, wait_ms = wait.as_millis() as u64, "Rate limited; waiting");
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    warn!(url = %url, wait_secs = wait.as_secs(), "Rate limited");
                    return Err(SyncError::RateLimited {
                        retry_after: Some(wait),
                    });
                }
                _ => return Ok(response),
            }
        }

        Err(SyncError::AuthFailure(format!(
            "{} kept challenging after {} attempts",
            url, MAX_ATTEMPTS
        )))
    }

    fn basic_auth(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(credentials))
    }

    /// Reads a body, failing once it exceeds the configured cap.
    async fn read_body(&self, mut response: Response) -> SyncResult<String> {
        let limit = self.settings.max_response_bytes;
        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > limit) {
            return Err(SyncError::ResponseTooLarge { limit });
        }

        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if buffer.len() + chunk.len() > limit {
                return Err(SyncError::ResponseTooLarge { limit });
            }
            buffer.extend_from_slice(&chunk);
        }
        String::from_utf8(buffer)
            .map_err(|e| SyncError::InvalidResponse(format!("body is not UTF-8: {}", e)))
    }
}

// =============================================================================
// Client Registry
// =============================================================================

/// One client per configured account.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, CalDavClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a client for every configured account.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let settings = ClientSettings::from_sync(&config.sync, config.user_agent());
        let mut registry = ClientRegistry::new();
        for account in &config.accounts {
            registry.insert(&account.id, CalDavClient::new(account, settings.clone())?);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, account_id: &str, client: CalDavClient) {
        self.clients.insert(account_id.to_string(), client);
    }

    pub fn get(&self, account_id: &str) -> Option<&CalDavClient> {
        self.clients.get(account_id)
    }

    /// Account ids in a stable order.
    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Client that serves a remote calendar.
    ///
    /// ## Errors
    /// `InvalidConfig` when the calendar is local or its account is not
    /// configured.
    pub fn for_calendar(&self, calendar: &Calendar) -> SyncResult<&CalDavClient> {
        let account = calendar.account_id.as_deref().ok_or_else(|| {
            SyncError::InvalidConfig(format!("calendar {} has no account", calendar.id))
        })?;
        self.get(account).ok_or_else(|| {
            SyncError::InvalidConfig(format!("account '{}' is not configured", account))
        })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn dav_method(name: &'static str) -> SyncResult<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| SyncError::Internal(format!("method {}: {}", name, e)))
}

fn xml_headers(depth: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT));
    headers.insert(HeaderName::from_static("depth"), HeaderValue::from_static(depth));
    headers
}

fn header_value(value: &str) -> SyncResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| SyncError::InvalidResponse(format!("value not valid in a header: {}", value)))
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .filter(|v| !v.is_empty())
}

/// Collection hrefs differ in trailing slashes between servers.
fn same_resource(a: &Url, b: &Url) -> bool {
    a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
}

/// Maps a non-success status to its error.
fn check_status(response: Response, url: &Url) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => SyncError::NotFound(url.to_string()),
        StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => SyncError::Conflict {
            url: url.to_string(),
        },
        StatusCode::UNAUTHORIZED => {
            SyncError::AuthFailure(format!("{} answered HTTP {}", url, status.as_u16()))
        }
        StatusCode::FORBIDDEN => SyncError::Forbidden(url.to_string()),
        other => SyncError::ServerError {
            status: other.as_u16(),
        },
    })
}

/// Reads `Retry-After` as delta-seconds or an HTTP-date.
///
/// ## Returns
/// - `None` when the header is absent
/// - `Some(ZERO)` when it is unparseable or already past
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?;
    let value = match raw.to_str() {
        Ok(v) => v.trim(),
        Err(_) => return Some(Duration::ZERO),
    };

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    match DateTime::parse_from_rfc2822(value) {
        Ok(at) => {
            let wait = at.with_timezone(&Utc) - now;
            Some(wait.to_std().unwrap_or(Duration::ZERO))
        }
        Err(_) => Some(Duration::ZERO),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
