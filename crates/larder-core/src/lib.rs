//! Core domain model for the larder catalog mirror.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "larder-core";

/// Ingredient line as listed by the catalog, optionally tagged with a group label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EntryItem {
    pub text: String,
    #[serde(default)]
    pub group: Option<String>,
}

impl EntryItem {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            group: None,
        }
    }

    pub fn grouped(text: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            group: Some(group.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InstructionStep {
    pub text: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Inline media URLs attached to this step.
    #[serde(default)]
    pub media: Vec<String>,
}

impl InstructionStep {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Video hosts in priority order: earlier variants win when an entry links several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VideoProvider {
    #[serde(rename = "youtube")]
    YouTube,
    #[serde(rename = "tiktok")]
    TikTok,
    #[serde(rename = "instagram")]
    Instagram,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRef {
    pub provider: VideoProvider,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CollectionRef {
    pub id: Option<String>,
    pub name: String,
}

/// One catalog entry. List views leave `instructions` empty; detail views fill it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceEntry {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Attribution (site or author display name).
    pub source_name: Option<String>,
    pub source_url: Option<String>,
    pub servings: Option<u32>,
    pub prep_minutes: Option<u32>,
    pub cook_minutes: Option<u32>,
    pub ingredients: Vec<EntryItem>,
    pub instructions: Vec<InstructionStep>,
    pub images: Vec<String>,
    pub videos: Vec<VideoRef>,
    pub collections: Vec<CollectionRef>,
    /// Category supplied directly on the entry, ahead of any collection name.
    pub category: Option<String>,
    pub added_at: Option<DateTime<Utc>>,
}

impl SourceEntry {
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or("Untitled")
    }

    pub fn primary_image(&self) -> Option<&str> {
        self.images
            .iter()
            .map(|url| url.trim())
            .find(|url| !url.is_empty())
    }

    /// First video by provider priority; ties keep catalog order.
    pub fn first_video(&self) -> Option<&VideoRef> {
        self.videos
            .iter()
            .filter(|v| !v.url.trim().is_empty())
            .min_by_key(|v| v.provider)
    }

    pub fn has_instruction_media(&self) -> bool {
        self.instructions
            .iter()
            .any(|step| step.media.iter().any(|url| !url.trim().is_empty()))
    }

    /// The explicit category, falling back to the first named collection.
    pub fn category_hint(&self) -> Option<&str> {
        self.category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .or_else(|| {
                self.collections
                    .iter()
                    .map(|c| c.name.trim())
                    .find(|name| !name.is_empty())
            })
    }

    /// Folds a detail-view fetch onto this list-view entry.
    pub fn with_detail(mut self, detail: SourceEntry) -> Self {
        self.instructions = detail.instructions;
        if self.collections.is_empty() {
            self.collections = detail.collections;
        }
        if self.ingredients.is_empty() {
            self.ingredients = detail.ingredients;
        }
        if self.images.is_empty() {
            self.images = detail.images;
        }
        if self.videos.is_empty() {
            self.videos = detail.videos;
        }
        self.title = self.title.or(detail.title);
        self.description = self.description.or(detail.description);
        self.source_name = self.source_name.or(detail.source_name);
        self.source_url = self.source_url.or(detail.source_url);
        self.servings = self.servings.or(detail.servings);
        self.prep_minutes = self.prep_minutes.or(detail.prep_minutes);
        self.cook_minutes = self.cook_minutes.or(detail.cook_minutes);
        self.category = self.category.or(detail.category);
        self.added_at = self.added_at.or(detail.added_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageType {
    #[serde(rename = "none")]
    NoImage,
    #[serde(rename = "external")]
    External,
    #[serde(rename = "file_upload")]
    FileUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[serde(alias = "imported")]
    New,
    Updated,
    Rejected,
}

impl SyncStatus {
    pub fn is_mirrored(self) -> bool {
        matches!(self, Self::New | Self::Updated)
    }
}

fn default_image_type() -> ImageType {
    ImageType::FileUpload
}

const LEGACY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn deserialize_last_synced<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, LEGACY_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid last_synced {raw:?}: {e}")))
}

/// Sync state for one source entry. `destination_id` is set iff the status is mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerRecord {
    #[serde(alias = "whisk_recipe_id")]
    pub source_id: String,
    #[serde(default, alias = "notion_page_id")]
    pub destination_id: Option<String>,
    #[serde(default = "default_image_type")]
    pub image_type: ImageType,
    #[serde(default, alias = "recipe_video")]
    pub has_video: bool,
    #[serde(default, alias = "instruction_photos")]
    pub has_instruction_media: bool,
    #[serde(default, alias = "was_made")]
    pub was_reviewed: bool,
    pub status: SyncStatus,
    #[serde(default, alias = "recipe_title")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_last_synced")]
    pub last_synced: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record {source_id} has status {status:?} but no destination id")]
    MissingDestination {
        source_id: String,
        status: SyncStatus,
    },
}

/// Partial update for a tracker record; `None` keeps the previous value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub destination_id: Option<String>,
    pub image_type: Option<ImageType>,
    pub has_video: Option<bool>,
    pub has_instruction_media: Option<bool>,
    pub was_reviewed: Option<bool>,
    pub status: Option<SyncStatus>,
    pub title: Option<String>,
    pub rejection_reason: Option<String>,
}

impl RecordUpdate {
    pub fn rejected(title: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            status: Some(SyncStatus::Rejected),
            title,
            rejection_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn destination(mut self, destination_id: impl Into<String>) -> Self {
        self.destination_id = Some(destination_id.into());
        self
    }

    pub fn image_type(mut self, image_type: ImageType) -> Self {
        self.image_type = Some(image_type);
        self
    }

    pub fn has_video(mut self, value: bool) -> Self {
        self.has_video = Some(value);
        self
    }

    pub fn has_instruction_media(mut self, value: bool) -> Self {
        self.has_instruction_media = Some(value);
        self
    }

    pub fn was_reviewed(mut self, value: bool) -> Self {
        self.was_reviewed = Some(value);
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Overlays `later` on top of `self`, field by field.
    pub fn and(self, later: RecordUpdate) -> Self {
        Self {
            destination_id: later.destination_id.or(self.destination_id),
            image_type: later.image_type.or(self.image_type),
            has_video: later.has_video.or(self.has_video),
            has_instruction_media: later.has_instruction_media.or(self.has_instruction_media),
            was_reviewed: later.was_reviewed.or(self.was_reviewed),
            status: later.status.or(self.status),
            title: later.title.or(self.title),
            rejection_reason: later.rejection_reason.or(self.rejection_reason),
        }
    }
}

impl TrackerRecord {
    /// Builds the next version of a record from the previous one (or defaults) plus a partial update.
    pub fn merged(
        source_id: &str,
        existing: Option<&TrackerRecord>,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<TrackerRecord, RecordError> {
        let status = update
            .status
            .or(existing.map(|r| r.status))
            .unwrap_or(SyncStatus::New);

        let (destination_id, rejection_reason) = if status == SyncStatus::Rejected {
            let reason = update
                .rejection_reason
                .or_else(|| existing.and_then(|r| r.rejection_reason.clone()));
            (None, reason)
        } else {
            let destination_id = update
                .destination_id
                .or_else(|| existing.and_then(|r| r.destination_id.clone()));
            if destination_id.is_none() {
                return Err(RecordError::MissingDestination {
                    source_id: source_id.to_string(),
                    status,
                });
            }
            (destination_id, None)
        };

        Ok(TrackerRecord {
            source_id: source_id.to_string(),
            destination_id,
            image_type: update
                .image_type
                .or(existing.map(|r| r.image_type))
                .unwrap_or(ImageType::FileUpload),
            has_video: update
                .has_video
                .or(existing.map(|r| r.has_video))
                .unwrap_or(false),
            has_instruction_media: update
                .has_instruction_media
                .or(existing.map(|r| r.has_instruction_media))
                .unwrap_or(false),
            was_reviewed: update
                .was_reviewed
                .or(existing.map(|r| r.was_reviewed))
                .unwrap_or(false),
            status,
            title: update.title.or_else(|| existing.and_then(|r| r.title.clone())),
            rejection_reason,
            last_synced: now,
        })
    }

    pub fn is_consistent(&self) -> bool {
        self.destination_id.is_some() == self.status.is_mirrored()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    Normal { full_sync: bool },
    RetryRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("full_sync and retry_rejected cannot be combined in one run")]
pub struct ModeConflict;

impl RunMode {
    pub fn from_flags(full_sync: bool, retry_rejected: bool) -> Result<Self, ModeConflict> {
        match (full_sync, retry_rejected) {
            (true, true) => Err(ModeConflict),
            (_, true) => Ok(Self::RetryRejected),
            (full_sync, false) => Ok(Self::Normal { full_sync }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Normal { full_sync: false } => "normal",
            Self::Normal { full_sync: true } => "full_sync",
            Self::RetryRejected => "retry_rejected",
        }
    }
}

/// Upgrade operations applied to an already mirrored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    InstructionMedia,
    ImageMigration,
    VideoAddition,
    ReviewFlip,
}

impl Scenario {
    pub fn label(&self) -> &'static str {
        match self {
            Self::InstructionMedia => "instruction media",
            Self::ImageMigration => "image migration",
            Self::VideoAddition => "video addition",
            Self::ReviewFlip => "review status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub id: String,
    pub title: String,
    pub reason: String,
}

/// Aggregated outcome of one reconciliation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub matched: usize,
    pub updated: usize,
    pub created: usize,
    pub deleted: usize,
    pub rejected: usize,
    pub errors: usize,
    pub rejections: Vec<Rejection>,
}

impl RunStats {
    pub fn new(mode: RunMode) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            started_at: Utc::now(),
            finished_at: None,
            fetched: 0,
            matched: 0,
            updated: 0,
            created: 0,
            deleted: 0,
            rejected: 0,
            errors: 0,
            rejections: Vec::new(),
        }
    }

    pub fn record_rejection(&mut self, id: &str, title: &str, reason: &str) {
        self.rejected += 1;
        self.rejections.push(Rejection {
            id: id.to_string(),
            title: title.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn summary_line(&self) -> String {
        format!(
            "mode={} fetched={} matched={} updated={} created={} deleted={} rejected={} errors={}",
            self.mode.label(),
            self.fetched,
            self.matched,
            self.updated,
            self.created,
            self.deleted,
            self.rejected,
            self.errors
        )
    }
}

/// Items normalized by group: a single (or no) group stays flat, several groups nest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupedList<T> {
    Flat(Vec<T>),
    Nested(Vec<ItemGroup<T>>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemGroup<T> {
    /// `None` collects the items that carried no group label.
    pub label: Option<String>,
    pub items: Vec<T>,
}

impl<T> Default for GroupedList<T> {
    fn default() -> Self {
        Self::Flat(Vec::new())
    }
}

impl<T> GroupedList<T> {
    /// Groups in first-appearance order, with unlabelled items moved to the front.
    pub fn from_labelled(items: impl IntoIterator<Item = (Option<String>, T)>) -> Self {
        let mut groups: Vec<ItemGroup<T>> = Vec::new();
        for (label, item) in items {
            let label = label
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty());
            match groups.iter_mut().find(|g| g.label == label) {
                Some(group) => group.items.push(item),
                None => groups.push(ItemGroup {
                    label,
                    items: vec![item],
                }),
            }
        }

        if groups.len() <= 1 {
            return Self::Flat(groups.into_iter().flat_map(|g| g.items).collect());
        }
        groups.sort_by_key(|g| g.label.is_some());
        Self::Nested(groups)
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Flat(items) => items.len(),
            Self::Nested(groups) => groups.iter().map(|g| g.items.len()).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryOrigin {
    Explicit,
    Keyword,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftStep {
    pub text: String,
    pub media: Vec<String>,
}

/// Internal representation handed from the transformer to the destination adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeDraft {
    pub source_id: String,
    pub title: String,
    pub description: Option<String>,
    pub source_name: Option<String>,
    pub source_url: Option<String>,
    pub servings: Option<u32>,
    pub prep_minutes: u32,
    pub cook_minutes: u32,
    pub total_minutes: u32,
    pub categories: Vec<String>,
    pub category_origin: CategoryOrigin,
    pub ingredients: GroupedList<String>,
    pub instructions: GroupedList<DraftStep>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub added_at: Option<DateTime<Utc>>,
    pub reviewed: bool,
}

impl RecipeDraft {
    pub fn has_instruction_media(&self) -> bool {
        let has_media = |steps: &[DraftStep]| steps.iter().any(|s| !s.media.is_empty());
        match &self.instructions {
            GroupedList::Flat(steps) => has_media(steps),
            GroupedList::Nested(groups) => groups.iter().any(|g| has_media(&g.items)),
        }
    }
}
