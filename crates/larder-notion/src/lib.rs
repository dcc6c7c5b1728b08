//! Destination document store contract, typed page content, and the Notion-compatible client.

use std::time::Duration;

use async_trait::async_trait;
use larder_core::{DraftStep, GroupedList, ImageType, RecipeDraft};
use larder_storage::{HttpClientConfig, RateLimitConfig, RateLimiter, Throttled};
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "larder-notion";

pub const DEFAULT_API_BASE: &str = "https://api.notion.com/v1";
pub const DEFAULT_NOTION_VERSION: &str = "2025-09-03";

const MAX_TEXT_CHARS: usize = 2000;
const MAX_BLOCKS_PER_REQUEST: usize = 100;
const COVER_FILE_NAME: &str = "Recipe Photo";
const DEFAULT_MEDIA_STEM: &str = "recipe_image";

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("http status {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },
    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("media import failed for {url}: {reason}")]
    UploadFailed { url: String, reason: String },
    #[error("media import for {url} still pending after {polls} polls")]
    UploadTimedOut { url: String, polls: usize },
    #[error("unexpected response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

impl Throttled for DestinationError {
    fn is_throttled(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Media attached to a document: either a plain link or an asset owned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    External(String),
    Uploaded(String),
}

impl MediaRef {
    pub fn image_type(&self) -> ImageType {
        match self {
            Self::External(_) => ImageType::External,
            Self::Uploaded(_) => ImageType::FileUpload,
        }
    }

    fn cover_json(&self) -> JsonValue {
        match self {
            Self::External(url) => json!({ "type": "external", "external": { "url": url } }),
            Self::Uploaded(id) => json!({ "type": "file_upload", "file_upload": { "id": id } }),
        }
    }

    fn file_json(&self, name: &str) -> JsonValue {
        match self {
            Self::External(url) => {
                json!({ "name": name, "type": "external", "external": { "url": url } })
            }
            Self::Uploaded(id) => {
                json!({ "name": name, "type": "file_upload", "file_upload": { "id": id } })
            }
        }
    }
}

/// Page content, rendered to the store's block JSON only at the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// Collapsible level-two heading.
    Section { title: String, children: Vec<Block> },
    Paragraph { text: String },
    /// Muted italic note used where a list has nothing to show.
    Placeholder { text: String },
    Bulleted { text: String },
    Numbered { text: String, children: Vec<Block> },
    /// Collapsible group header inside a section.
    Group { title: String, children: Vec<Block> },
    Image { url: String },
    Video { url: String },
}

impl Block {
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Section { title, children } => wire_block(
                "heading_2",
                json!({
                    "is_toggleable": true,
                    "rich_text": rich_text(title, None),
                    "children": blocks_json(children),
                }),
            ),
            Self::Paragraph { text } => {
                wire_block("paragraph", json!({ "rich_text": rich_text(text, None) }))
            }
            Self::Placeholder { text } => wire_block(
                "paragraph",
                json!({
                    "rich_text": rich_text(text, Some(json!({ "color": "gray", "italic": true }))),
                }),
            ),
            Self::Bulleted { text } => {
                wire_block("bulleted_list_item", json!({ "rich_text": rich_text(text, None) }))
            }
            Self::Numbered { text, children } => {
                let mut body = json!({ "rich_text": rich_text(text, None) });
                if !children.is_empty() {
                    body["children"] = blocks_json(children);
                }
                wire_block("numbered_list_item", body)
            }
            Self::Group { title, children } => wire_block(
                "toggle",
                json!({
                    "rich_text": rich_text(
                        title,
                        Some(json!({ "color": "blue", "underline": true, "code": true })),
                    ),
                    "children": blocks_json(children),
                }),
            ),
            Self::Image { url } => wire_block(
                "image",
                json!({ "type": "external", "external": { "url": url } }),
            ),
            Self::Video { url } => wire_block(
                "video",
                json!({ "type": "external", "external": { "url": url } }),
            ),
        }
    }
}

fn wire_block(kind: &str, body: JsonValue) -> JsonValue {
    let mut block = Map::new();
    block.insert("object".into(), json!("block"));
    block.insert("type".into(), json!(kind));
    block.insert(kind.into(), body);
    JsonValue::Object(block)
}

fn blocks_json(blocks: &[Block]) -> JsonValue {
    JsonValue::Array(blocks.iter().map(Block::to_json).collect())
}

/// Rich text split into segments the store accepts.
fn rich_text(content: &str, annotations: Option<JsonValue>) -> JsonValue {
    let chars: Vec<char> = content.chars().collect();
    let segments: Vec<String> = if chars.is_empty() {
        vec![String::new()]
    } else {
        chars
            .chunks(MAX_TEXT_CHARS)
            .map(|c| c.iter().collect())
            .collect()
    };
    JsonValue::Array(
        segments
            .into_iter()
            .map(|segment| {
                let mut item = json!({ "type": "text", "text": { "content": segment } });
                if let Some(annotations) = &annotations {
                    item["annotations"] = annotations.clone();
                }
                item
            })
            .collect(),
    )
}

struct ListStyle {
    default_group: &'static str,
    empty_message: &'static str,
}

const INGREDIENT_LIST: ListStyle = ListStyle {
    default_group: "For the main recipe",
    empty_message: "There are no ingredients for this recipe",
};

const STEP_LIST: ListStyle = ListStyle {
    default_group: "Main Recipe",
    empty_message: "There are no steps for this recipe",
};

fn render_grouped<T>(
    list: &GroupedList<T>,
    style: &ListStyle,
    item: impl Fn(&T) -> Block,
) -> Vec<Block> {
    if list.is_empty() {
        return vec![Block::Placeholder {
            text: style.empty_message.to_string(),
        }];
    }
    match list {
        GroupedList::Flat(items) => items.iter().map(&item).collect(),
        GroupedList::Nested(groups) => groups
            .iter()
            .map(|group| Block::Group {
                title: group
                    .label
                    .clone()
                    .unwrap_or_else(|| style.default_group.to_string()),
                children: group.items.iter().map(&item).flat_map(hoist_children).collect(),
            })
            .collect(),
    }
}

/// Lifts a list item's children to follow it as siblings. Used inside groups, where
/// section > group > item already uses up the nesting a single request may carry.
fn hoist_children(block: Block) -> Vec<Block> {
    match block {
        Block::Numbered { text, children } if !children.is_empty() => {
            let mut out = vec![Block::Numbered {
                text,
                children: Vec::new(),
            }];
            out.extend(children);
            out
        }
        other => vec![other],
    }
}

fn step_block(step: &DraftStep) -> Block {
    Block::Numbered {
        text: step.text.clone(),
        children: step
            .media
            .iter()
            .map(|url| Block::Image { url: url.clone() })
            .collect(),
    }
}

/// Description, ingredients, steps and (when present) the video, in page order.
pub fn render_content(draft: &RecipeDraft) -> Vec<Block> {
    let mut blocks = Vec::new();
    if let Some(description) = &draft.description {
        blocks.push(Block::Section {
            title: "Description".into(),
            children: vec![Block::Paragraph {
                text: description.clone(),
            }],
        });
    }
    blocks.push(Block::Section {
        title: "Ingredients".into(),
        children: render_grouped(&draft.ingredients, &INGREDIENT_LIST, |text| Block::Bulleted {
            text: text.clone(),
        }),
    });
    blocks.push(Block::Section {
        title: "Steps".into(),
        children: render_grouped(&draft.instructions, &STEP_LIST, step_block),
    });
    if let Some(url) = &draft.video_url {
        blocks.push(Block::Video { url: url.clone() });
    }
    blocks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentProperties {
    pub source_id: String,
    pub title: String,
    pub added_on: Option<String>,
    pub servings: u32,
    pub total_minutes: u32,
    pub prep_minutes: u32,
    pub cook_minutes: u32,
    pub reviewed: bool,
    pub categories: Vec<String>,
    pub source_name: Option<String>,
    pub source_url: Option<String>,
    pub image: Option<MediaRef>,
    pub video_url: Option<String>,
}

impl DocumentProperties {
    pub fn from_draft(draft: &RecipeDraft, image: Option<MediaRef>) -> Self {
        Self {
            source_id: draft.source_id.clone(),
            title: draft.title.clone(),
            added_on: draft.added_at.map(|ts| ts.to_rfc3339()),
            servings: draft.servings.unwrap_or(0),
            total_minutes: draft.total_minutes,
            prep_minutes: draft.prep_minutes,
            cook_minutes: draft.cook_minutes,
            reviewed: draft.reviewed,
            categories: draft.categories.clone(),
            source_name: draft.source_name.clone(),
            source_url: draft.source_url.clone(),
            image,
            video_url: draft.video_url.clone(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let mut props = Map::new();
        props.insert("Recipe Id".into(), json!({ "rich_text": rich_text(&self.source_id, None) }));
        props.insert("Name".into(), json!({ "title": rich_text(&self.title, None) }));
        if let Some(added_on) = &self.added_on {
            props.insert("Date Added".into(), json!({ "date": { "start": added_on } }));
        }
        props.insert("Servings".into(), json!({ "number": self.servings }));
        props.insert("Total Time".into(), json!({ "number": self.total_minutes }));
        props.insert("Prep Time".into(), json!({ "number": self.prep_minutes }));
        props.insert("Cook Time".into(), json!({ "number": self.cook_minutes }));
        props.insert("Made?".into(), json!({ "checkbox": self.reviewed }));
        if !self.categories.is_empty() {
            let options: Vec<JsonValue> =
                self.categories.iter().map(|c| json!({ "name": c })).collect();
            props.insert("Collection".into(), json!({ "multi_select": options }));
        }
        if let Some(name) = &self.source_name {
            props.insert("Source Title".into(), json!({ "rich_text": rich_text(name, None) }));
        }
        if let Some(url) = &self.source_url {
            props.insert("Source Link".into(), json!({ "url": url }));
        }
        if let Some(image) = &self.image {
            props.insert("Photos".into(), json!({ "files": [image.file_json(COVER_FILE_NAME)] }));
        }
        if let Some(url) = &self.video_url {
            props.insert("Video".into(), json!({ "url": url }));
        }
        JsonValue::Object(props)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub properties: DocumentProperties,
    pub cover: Option<MediaRef>,
    pub content: Vec<Block>,
}

impl NewDocument {
    pub fn from_draft(draft: &RecipeDraft, image: Option<MediaRef>) -> Self {
        Self {
            cover: image.clone(),
            properties: DocumentProperties::from_draft(draft, image),
            content: render_content(draft),
        }
    }
}

/// Partial property patch for an existing document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyUpdate {
    pub image: Option<MediaRef>,
    pub video_url: Option<String>,
    pub reviewed: Option<bool>,
}

impl PropertyUpdate {
    pub fn image(mut self, image: MediaRef) -> Self {
        self.image = Some(image);
        self
    }

    pub fn video(mut self, url: impl Into<String>) -> Self {
        self.video_url = Some(url.into());
        self
    }

    pub fn reviewed(mut self, reviewed: bool) -> Self {
        self.reviewed = Some(reviewed);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_none() && self.video_url.is_none() && self.reviewed.is_none()
    }

    /// The image is applied to both the photo property and the page cover.
    pub fn to_json(&self) -> JsonValue {
        let mut props = Map::new();
        if let Some(image) = &self.image {
            props.insert("Photos".into(), json!({ "files": [image.file_json(COVER_FILE_NAME)] }));
        }
        if let Some(url) = &self.video_url {
            props.insert("Video".into(), json!({ "url": url }));
        }
        if let Some(reviewed) = self.reviewed {
            props.insert("Made?".into(), json!({ "checkbox": reviewed }));
        }
        let mut body = json!({ "properties": props });
        if let Some(image) = &self.image {
            body["cover"] = image.cover_json();
        }
        body
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the new document id.
    async fn create(&self, doc: &NewDocument) -> Result<String, DestinationError>;

    async fn update_properties(
        &self,
        id: &str,
        update: &PropertyUpdate,
    ) -> Result<(), DestinationError>;

    async fn append_content(&self, id: &str, blocks: &[Block]) -> Result<(), DestinationError>;

    async fn archive(&self, id: &str) -> Result<(), DestinationError>;

    /// Asks the store to import `url` as an owned asset and waits for the import to settle.
    async fn upload_media_from_url(&self, url: &str, name: &str)
        -> Result<String, DestinationError>;

    /// Archives `id` and recreates the document in full, returning the new id.
    async fn replace(&self, id: &str, doc: &NewDocument) -> Result<String, DestinationError> {
        self.archive(id).await?;
        self.create(doc).await
    }
}

/// Result of writing a whole draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub destination_id: String,
    pub image_type: ImageType,
}

/// Imports the cover image, falling back to the plain link when the import does not succeed.
pub async fn import_cover(store: &dyn DocumentStore, image_url: Option<&str>) -> Option<MediaRef> {
    let url = image_url?;
    match store.upload_media_from_url(url, DEFAULT_MEDIA_STEM).await {
        Ok(upload_id) => Some(MediaRef::Uploaded(upload_id)),
        Err(err) => {
            warn!(url, error = %err, "cover import failed; linking external image");
            Some(MediaRef::External(url.to_string()))
        }
    }
}

fn image_type_of(media: &Option<MediaRef>) -> ImageType {
    media
        .as_ref()
        .map(MediaRef::image_type)
        .unwrap_or(ImageType::NoImage)
}

pub async fn publish(
    store: &dyn DocumentStore,
    draft: &RecipeDraft,
) -> Result<Published, DestinationError> {
    let media = import_cover(store, draft.image_url.as_deref()).await;
    let image_type = image_type_of(&media);
    let destination_id = store.create(&NewDocument::from_draft(draft, media)).await?;
    Ok(Published {
        destination_id,
        image_type,
    })
}

/// Instruction-media migration: the existing document is replaced wholesale.
pub async fn republish(
    store: &dyn DocumentStore,
    existing_id: &str,
    draft: &RecipeDraft,
) -> Result<Published, DestinationError> {
    let media = import_cover(store, draft.image_url.as_deref()).await;
    let image_type = image_type_of(&media);
    let destination_id = store
        .replace(existing_id, &NewDocument::from_draft(draft, media))
        .await?;
    Ok(Published {
        destination_id,
        image_type,
    })
}

/// Image migration: unlike `import_cover`, a failed import is an error here.
pub async fn migrate_image(
    store: &dyn DocumentStore,
    id: &str,
    image_url: &str,
) -> Result<(), DestinationError> {
    let upload_id = store
        .upload_media_from_url(image_url, DEFAULT_MEDIA_STEM)
        .await?;
    store
        .update_properties(id, &PropertyUpdate::default().image(MediaRef::Uploaded(upload_id)))
        .await
}

pub async fn add_video(
    store: &dyn DocumentStore,
    id: &str,
    video_url: &str,
) -> Result<(), DestinationError> {
    store
        .update_properties(id, &PropertyUpdate::default().video(video_url))
        .await?;
    store
        .append_content(
            id,
            &[Block::Video {
                url: video_url.to_string(),
            }],
        )
        .await
}

pub async fn flip_review(store: &dyn DocumentStore, id: &str) -> Result<(), DestinationError> {
    store
        .update_properties(id, &PropertyUpdate::default().reviewed(true))
        .await
}

/// Filename and content type for an import, inferred from the URL's last path segment.
pub fn media_file_name(url: &str, stem: &str) -> (String, &'static str) {
    let last = url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let filename = if last.contains('.') && !last.ends_with('.') {
        last.to_string()
    } else {
        format!("{stem}.jpg")
    };
    let ext = filename
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let content_type = match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    };
    (filename, content_type)
}

#[derive(Debug, Clone, Copy)]
pub struct UploadPollPolicy {
    pub max_polls: usize,
    pub base_delay: Duration,
    pub step: Duration,
}

impl Default for UploadPollPolicy {
    fn default() -> Self {
        Self {
            max_polls: 15,
            base_delay: Duration::from_secs(1),
            step: Duration::from_millis(500),
        }
    }
}

impl UploadPollPolicy {
    pub fn delay_for_poll(&self, poll_index: usize) -> Duration {
        self.base_delay + self.step.saturating_mul(poll_index as u32)
    }
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_base: String,
    pub api_key: String,
    pub version: String,
    pub data_source_id: String,
    pub http: HttpClientConfig,
    pub rate_limit: RateLimitConfig,
    pub upload_poll: UploadPollPolicy,
}

impl NotionConfig {
    pub fn new(api_key: impl Into<String>, data_source_id: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: api_key.into(),
            version: DEFAULT_NOTION_VERSION.to_string(),
            data_source_id: data_source_id.into(),
            http: HttpClientConfig::default(),
            rate_limit: RateLimitConfig::default(),
            upload_poll: UploadPollPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct NotionClient {
    config: NotionConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl NotionClient {
    pub fn new(config: NotionConfig) -> Result<Self, DestinationError> {
        let client = config.http.build_client()?;
        let limiter = RateLimiter::new(config.rate_limit);
        Ok(Self {
            config,
            client,
            limiter,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, DestinationError> {
        let url = format!("{}{}", self.config.api_base.trim_end_matches('/'), path);
        let label = format!("{method} {path}");
        self.limiter
            .call(&label, || {
                let mut request = self
                    .client
                    .request(method.clone(), &url)
                    .bearer_auth(&self.config.api_key)
                    .header("Notion-Version", &self.config.version);
                if let Some(body) = body {
                    request = request.json(body);
                }
                let url = url.clone();
                async move {
                    let resp = request.send().await?;
                    read_response(resp, &url).await
                }
            })
            .await
    }
}

async fn read_response(resp: reqwest::Response, url: &str) -> Result<JsonValue, DestinationError> {
    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(DestinationError::RateLimited {
            url: url.to_string(),
            retry_after,
        });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(DestinationError::Http {
            status: status.as_u16(),
            url: url.to_string(),
            body: body.chars().take(500).collect(),
        });
    }
    resp.json().await.map_err(|e| DestinationError::InvalidResponse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// A replace that archived but failed to recreate leaves the old id tracked; the retry
/// archives it again and the store answers 400.
fn is_already_archived(err: &DestinationError) -> bool {
    matches!(err, DestinationError::Http { status: 400, body, .. } if body.contains("archived"))
}

fn upload_status(payload: &JsonValue) -> Option<&str> {
    payload.get("status").and_then(JsonValue::as_str)
}

#[async_trait]
impl DocumentStore for NotionClient {
    async fn create(&self, doc: &NewDocument) -> Result<String, DestinationError> {
        let (first, rest) = doc
            .content
            .split_at(doc.content.len().min(MAX_BLOCKS_PER_REQUEST));
        let mut body = json!({
            "parent": { "type": "data_source_id", "data_source_id": self.config.data_source_id },
            "properties": doc.properties.to_json(),
            "children": blocks_json(first),
        });
        if let Some(cover) = &doc.cover {
            body["cover"] = cover.cover_json();
        }

        let created = self
            .send(Method::POST, "/pages", Some(&body))
            .instrument(info_span!("document_create", source_id = %doc.properties.source_id))
            .await?;
        let id = created
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| DestinationError::InvalidResponse {
                url: "/pages".into(),
                message: "created page has no id".into(),
            })?;
        if !rest.is_empty() {
            self.append_content(&id, rest).await?;
        }
        info!(document_id = %id, title = %doc.properties.title, "document created");
        Ok(id)
    }

    async fn update_properties(
        &self,
        id: &str,
        update: &PropertyUpdate,
    ) -> Result<(), DestinationError> {
        if update.is_empty() {
            return Ok(());
        }
        self.send(Method::PATCH, &format!("/pages/{id}"), Some(&update.to_json()))
            .instrument(info_span!("document_update", document_id = id))
            .await?;
        Ok(())
    }

    async fn append_content(&self, id: &str, blocks: &[Block]) -> Result<(), DestinationError> {
        for chunk in blocks.chunks(MAX_BLOCKS_PER_REQUEST) {
            let body = json!({ "children": blocks_json(chunk) });
            self.send(Method::PATCH, &format!("/blocks/{id}/children"), Some(&body))
                .instrument(info_span!("document_append", document_id = id))
                .await?;
        }
        Ok(())
    }

    async fn archive(&self, id: &str) -> Result<(), DestinationError> {
        let result = self
            .send(
                Method::PATCH,
                &format!("/pages/{id}"),
                Some(&json!({ "archived": true })),
            )
            .instrument(info_span!("document_archive", document_id = id))
            .await;
        match result {
            Ok(_) => info!(document_id = id, "document archived"),
            Err(err) if is_already_archived(&err) => {
                info!(document_id = id, "document was already archived")
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    async fn upload_media_from_url(
        &self,
        url: &str,
        name: &str,
    ) -> Result<String, DestinationError> {
        let (filename, content_type) = media_file_name(url, name);
        let body = json!({
            "mode": "external_url",
            "external_url": url,
            "filename": filename,
            "content_type": content_type,
        });
        let mut state = self.send(Method::POST, "/file_uploads", Some(&body)).await?;
        let upload_id = state
            .get("id")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| DestinationError::InvalidResponse {
                url: "/file_uploads".into(),
                message: "file upload has no id".into(),
            })?;

        let policy = self.config.upload_poll;
        let mut polls = 0usize;
        loop {
            match upload_status(&state) {
                Some("uploaded") => {
                    info!(upload_id = %upload_id, filename = %filename, "media imported");
                    return Ok(upload_id);
                }
                Some("failed") => {
                    let reason = state
                        .get("file_import_result")
                        .map(JsonValue::to_string)
                        .unwrap_or_else(|| "unknown error".to_string());
                    return Err(DestinationError::UploadFailed {
                        url: url.to_string(),
                        reason,
                    });
                }
                _ => {}
            }
            if polls >= policy.max_polls {
                return Err(DestinationError::UploadTimedOut {
                    url: url.to_string(),
                    polls,
                });
            }

            let wait = policy.delay_for_poll(polls);
            debug!(upload_id = %upload_id, status = ?upload_status(&state), wait_ms = wait.as_millis() as u64, "media import pending");
            tokio::time::sleep(wait).await;
            polls += 1;
            match self
                .send(Method::GET, &format!("/file_uploads/{upload_id}"), None)
                .await
            {
                Ok(next) => state = next,
                Err(err) => warn!(upload_id = %upload_id, error = %err, "media import status check failed"),
            }
        }
    }
}
