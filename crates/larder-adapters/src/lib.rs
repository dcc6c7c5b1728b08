//! Catalog source contracts + the Whisk-compatible HTTP client.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use larder_core::{CollectionRef, EntryItem, InstructionStep, SourceEntry, VideoProvider, VideoRef};
use larder_storage::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpClientConfig, RetryDisposition,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "larder-adapters";

pub const DEFAULT_API_BASE: &str = "https://api.whisk.com";
pub const DEFAULT_LOGIN_BASE: &str = "https://login.whisk.com";

const LIST_PATH: &str = "/recipe/v2";
const DETAIL_PATH: &str = "/recipe/v2/get";
const ANONYMOUS_PATH: &str = "/x/v1/auth/anonymous/create";
const LOGIN_PATH: &str = "/x/v1/auth/login";
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

/// One page of the catalog list view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogPage {
    pub entries: Vec<SourceEntry>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("credential acquisition failed: {0}")]
    Auth(String),
    #[error("still unauthorized after refreshing the access token for {url}")]
    Unauthorized { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected payload from {url}: {message}")]
    Decode { url: String, message: String },
}

impl SourceError {
    /// Errors that must abort the whole run rather than a single entry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Unauthorized { .. })
    }
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list(&self, cursor: Option<&str>) -> Result<CatalogPage, SourceError>;

    /// Full entry including instructions and saved collections.
    async fn detail(&self, id: &str) -> Result<SourceEntry, SourceError>;

    async fn review_status(&self, id: &str) -> Result<bool, SourceError>;
}

#[derive(Debug, Clone)]
pub struct WhiskConfig {
    pub api_base: String,
    pub login_base: String,
    pub client_id: String,
    pub email: String,
    pub password: String,
    pub page_limit: u32,
    pub token_cache: Option<PathBuf>,
    pub http: HttpClientConfig,
    pub backoff: BackoffPolicy,
}

impl WhiskConfig {
    pub fn new(
        client_id: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            login_base: DEFAULT_LOGIN_BASE.to_string(),
            client_id: client_id.into(),
            email: email.into(),
            password: password.into(),
            page_limit: 100,
            token_cache: None,
            http: HttpClientConfig::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty()
            && now + ChronoDuration::seconds(TOKEN_EXPIRY_MARGIN_SECS) < self.expires_at
    }
}

enum Authorized<T> {
    Ok(T),
    Unauthorized,
}

/// Bearer-authenticated catalog client. The credential is acquired lazily and refreshed
/// at most once per request when the catalog answers 401.
#[derive(Debug)]
pub struct WhiskClient {
    config: WhiskConfig,
    client: reqwest::Client,
    token: Mutex<Option<AccessToken>>,
}

impl WhiskClient {
    pub fn new(config: WhiskConfig) -> Result<Self, SourceError> {
        let client = config.http.build_client()?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn login_url(&self, path: &str) -> String {
        format!("{}{}", self.config.login_base.trim_end_matches('/'), path)
    }

    async fn current_token(&self) -> Result<String, SourceError> {
        let mut guard = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = guard.as_ref().filter(|t| t.is_valid_at(now)) {
            return Ok(token.access_token.clone());
        }
        if let Some(token) = self.read_cached_token().await.filter(|t| t.is_valid_at(now)) {
            debug!("using cached catalog token");
            let access = token.access_token.clone();
            *guard = Some(token);
            return Ok(access);
        }
        let token = self.acquire_token().await?;
        self.write_cached_token(&token).await;
        let access = token.access_token.clone();
        *guard = Some(token);
        Ok(access)
    }

    async fn refresh_token(&self) -> Result<String, SourceError> {
        let mut guard = self.token.lock().await;
        let token = self.acquire_token().await?;
        self.write_cached_token(&token).await;
        let access = token.access_token.clone();
        *guard = Some(token);
        Ok(access)
    }

    /// Anonymous token first, then a credentialed login authorized by it.
    pub async fn acquire_token(&self) -> Result<AccessToken, SourceError> {
        info!("acquiring catalog credentials");
        let anonymous = self
            .token_request(
                self.client
                    .post(self.login_url(ANONYMOUS_PATH))
                    .header("x-whisk-client-id", &self.config.client_id)
                    .json(&json!({
                        "user_params": { "language": "en-GB", "locate": true }
                    })),
                "anonymous token",
            )
            .await?;

        self.token_request(
            self.client
                .post(self.login_url(LOGIN_PATH))
                .bearer_auth(&anonymous.access_token)
                .json(&json!({
                    "email": self.config.email,
                    "password": self.config.password,
                })),
            "login",
        )
        .await
    }

    async fn token_request(
        &self,
        request: reqwest::RequestBuilder,
        step: &str,
    ) -> Result<AccessToken, SourceError> {
        let resp = request
            .send()
            .await
            .map_err(|e| SourceError::Auth(format!("{step} request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Auth(format!(
                "{step} returned {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }
        let body: JsonValue = resp
            .json()
            .await
            .map_err(|e| SourceError::Auth(format!("{step} response invalid: {e}")))?;
        parse_token_response(&body, Utc::now())
            .ok_or_else(|| SourceError::Auth(format!("{step} response carried no access token")))
    }

    async fn read_cached_token(&self) -> Option<AccessToken> {
        let path = self.config.token_cache.as_ref()?;
        let text = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&text) {
            Ok(token) => Some(token),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable token cache");
                None
            }
        }
    }

    async fn write_cached_token(&self, token: &AccessToken) {
        let Some(path) = &self.config.token_cache else {
            return;
        };
        let result = match serde_json::to_vec(token) {
            Ok(bytes) => fs::write(path, bytes).await,
            Err(err) => Err(std::io::Error::other(err)),
        };
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "could not persist token cache");
        }
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, SourceError> {
        let token = self.current_token().await?;
        if let Authorized::Ok(value) = self.send_with_backoff(url, query, &token).await? {
            return Ok(value);
        }

        warn!(url, "catalog rejected access token; refreshing once");
        let token = self.refresh_token().await?;
        match self.send_with_backoff(url, query, &token).await? {
            Authorized::Ok(value) => Ok(value),
            Authorized::Unauthorized => Err(SourceError::Unauthorized {
                url: url.to_string(),
            }),
        }
    }

    async fn send_with_backoff(
        &self,
        url: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> Result<Authorized<JsonValue>, SourceError> {
        let backoff = self.config.backoff;
        let mut attempt = 0usize;
        loop {
            let result = self
                .client
                .get(url)
                .query(query)
                .bearer_auth(token)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED {
                        return Ok(Authorized::Unauthorized);
                    }
                    if status.is_success() {
                        let value = resp.json().await.map_err(|e| SourceError::Decode {
                            url: url.to_string(),
                            message: e.to_string(),
                        })?;
                        return Ok(Authorized::Ok(value));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl CatalogSource for WhiskClient {
    async fn list(&self, cursor: Option<&str>) -> Result<CatalogPage, SourceError> {
        let url = self.api_url(LIST_PATH);
        let mut query = vec![("paging.limit", self.config.page_limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("paging.cursors.after", cursor.to_string()));
        }
        let body = self
            .get_json(&url, &query)
            .instrument(info_span!("catalog_list", cursor = cursor.unwrap_or("")))
            .await?;
        parse_list_response(body).map_err(|message| SourceError::Decode { url, message })
    }

    async fn detail(&self, id: &str) -> Result<SourceEntry, SourceError> {
        let url = self.api_url(DETAIL_PATH);
        let query = [
            ("id", id.to_string()),
            ("fields", "RECIPE_FIELD_INSTRUCTIONS".to_string()),
            ("fields", "RECIPE_FIELD_SAVED".to_string()),
        ];
        let body = self
            .get_json(&url, &query)
            .instrument(info_span!("catalog_detail", id))
            .await?;
        parse_detail_response(body).map_err(|message| SourceError::Decode { url, message })
    }

    async fn review_status(&self, id: &str) -> Result<bool, SourceError> {
        let url = self.api_url(&format!("/v2/post/recipe_review/{id}/reviews"));
        let body = self
            .get_json(&url, &[])
            .instrument(info_span!("catalog_review", id))
            .await?;
        Ok(parse_review_response(&body))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawListResponse {
    #[serde(default)]
    recipes: Vec<RawListItem>,
    #[serde(default)]
    paging: RawPaging,
}

#[derive(Debug, Default, Deserialize)]
struct RawPaging {
    #[serde(default)]
    cursors: RawCursors,
}

#[derive(Debug, Default, Deserialize)]
struct RawCursors {
    #[serde(default)]
    after: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawListItem {
    #[serde(default)]
    content: RawContent,
    #[serde(default)]
    collections: Vec<RawCollection>,
    #[serde(default)]
    added_at: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDetailResponse {
    #[serde(default)]
    recipe: Option<RawContent>,
    #[serde(default)]
    collections: Vec<RawCollection>,
}

#[derive(Debug, Default, Deserialize)]
struct RawContent {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    source: Option<RawSource>,
    #[serde(default)]
    servings: Option<JsonValue>,
    #[serde(default)]
    durations: Option<RawDurations>,
    #[serde(default)]
    images: Vec<RawImage>,
    #[serde(default)]
    ingredients: Vec<RawIngredient>,
    #[serde(default)]
    instructions: Option<RawInstructions>,
    #[serde(default)]
    recipe_videos: Vec<RawVideo>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    saved: Option<RawSaved>,
    #[serde(default)]
    added_at: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSource {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    source_recipe_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawDurations {
    #[serde(default)]
    prep_time: Option<JsonValue>,
    #[serde(default)]
    cook_time: Option<JsonValue>,
}

#[derive(Debug, Default, Deserialize)]
struct RawImage {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawIngredient {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawInstructions {
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStep {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    images: Vec<RawImage>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVideo {
    #[serde(default)]
    youtube_video: Option<RawVideoLink>,
    #[serde(default)]
    tiktok_video: Option<RawVideoLink>,
    #[serde(default)]
    instagram_video: Option<RawVideoLink>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVideoLink {
    #[serde(default)]
    original_link: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSaved {
    #[serde(default)]
    collections: Vec<RawCollection>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCollection {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

fn text_or_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn json_u32(value: Option<&JsonValue>) -> Option<u32> {
    match value? {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64))
            .and_then(|v| u32::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Catalog timestamps are epoch milliseconds, sent either as numbers or strings.
fn parse_added_at(value: Option<&JsonValue>) -> Option<DateTime<Utc>> {
    let millis = match value? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    DateTime::from_timestamp_millis(millis)
}

fn convert_collections(raw: Vec<RawCollection>) -> Vec<CollectionRef> {
    raw.into_iter()
        .filter_map(|c| {
            text_or_none(c.name).map(|name| CollectionRef {
                id: text_or_none(c.id),
                name,
            })
        })
        .collect()
}

fn convert_videos(raw: Vec<RawVideo>) -> Vec<VideoRef> {
    let mut out = Vec::new();
    for video in raw {
        let links = [
            (VideoProvider::YouTube, video.youtube_video),
            (VideoProvider::TikTok, video.tiktok_video),
            (VideoProvider::Instagram, video.instagram_video),
        ];
        for (provider, link) in links {
            if let Some(url) = link.and_then(|l| text_or_none(l.original_link)) {
                out.push(VideoRef { provider, url });
            }
        }
    }
    out
}

fn convert_content(
    content: RawContent,
    collections: Vec<RawCollection>,
    added_at: Option<&JsonValue>,
) -> Option<SourceEntry> {
    let id = text_or_none(content.id)?;
    let (source_name, source_url) = match content.source {
        Some(source) => (
            text_or_none(source.display_name),
            text_or_none(source.source_recipe_url),
        ),
        None => (None, None),
    };
    let durations = content.durations.unwrap_or_default();

    let mut collections = convert_collections(collections);
    if collections.is_empty() {
        collections = convert_collections(content.saved.map(|s| s.collections).unwrap_or_default());
    }

    Some(SourceEntry {
        id,
        title: text_or_none(content.name),
        description: text_or_none(content.description),
        source_name,
        source_url,
        servings: json_u32(content.servings.as_ref()),
        prep_minutes: json_u32(durations.prep_time.as_ref()),
        cook_minutes: json_u32(durations.cook_time.as_ref()),
        ingredients: content
            .ingredients
            .into_iter()
            .filter_map(|i| {
                text_or_none(i.text).map(|text| EntryItem {
                    text,
                    group: text_or_none(i.group),
                })
            })
            .collect(),
        instructions: content
            .instructions
            .map(|i| i.steps)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|s| {
                text_or_none(s.text).map(|text| InstructionStep {
                    text,
                    group: text_or_none(s.group),
                    media: s.images.into_iter().filter_map(|i| text_or_none(i.url)).collect(),
                })
            })
            .collect(),
        images: content
            .images
            .into_iter()
            .filter_map(|i| text_or_none(i.url))
            .collect(),
        videos: convert_videos(content.recipe_videos),
        collections,
        category: text_or_none(content.category),
        added_at: parse_added_at(added_at.or(content.added_at.as_ref())),
    })
}

fn parse_list_response(body: JsonValue) -> Result<CatalogPage, String> {
    let raw: RawListResponse = serde_json::from_value(body).map_err(|e| e.to_string())?;
    let mut entries = Vec::with_capacity(raw.recipes.len());
    for item in raw.recipes {
        let added_at = item.added_at;
        match convert_content(item.content, item.collections, added_at.as_ref()) {
            Some(entry) => entries.push(entry),
            None => debug!("skipping catalog item without id"),
        }
    }
    Ok(CatalogPage {
        entries,
        next_cursor: text_or_none(raw.paging.cursors.after),
    })
}

fn parse_detail_response(body: JsonValue) -> Result<SourceEntry, String> {
    let raw: RawDetailResponse = serde_json::from_value(body).map_err(|e| e.to_string())?;
    let content = raw.recipe.ok_or_else(|| "detail response has no recipe".to_string())?;
    convert_content(content, raw.collections, None)
        .ok_or_else(|| "detail recipe has no id".to_string())
}

/// Reviewed iff the catalog returns at least one review post.
fn parse_review_response(body: &JsonValue) -> bool {
    body.get("posts")
        .and_then(JsonValue::as_array)
        .map(|posts| !posts.is_empty())
        .unwrap_or(false)
}

fn parse_token_response(body: &JsonValue, now: DateTime<Utc>) -> Option<AccessToken> {
    let token = body.get("authenticated")?.get("token")?;
    let access_token = token.get("access_token")?.as_str()?.to_string();
    let expires_in = json_u32(token.get("expires_in")).unwrap_or(3600);
    Some(AccessToken {
        access_token,
        expires_at: now + ChronoDuration::seconds(i64::from(expires_in)),
    })
}
