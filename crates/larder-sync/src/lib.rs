//! Validation, categorization, transformation, and the reconciliation run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use larder_adapters::{CatalogSource, SourceError, WhiskClient, WhiskConfig};
use larder_core::{
    CategoryOrigin, DraftStep, GroupedList, ImageType, RecipeDraft, RecordUpdate, RunMode,
    RunStats, Scenario, SourceEntry, SyncStatus, TrackerRecord,
};
use larder_notion::{DestinationError, DocumentStore, NotionClient, NotionConfig, Published};
use larder_storage::{HttpClientConfig, Tracker, TrackerError, WriteMode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "larder-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    MissingSourceName,
    MissingImage,
    MissingCategory,
    MissingIngredients,
    MissingInstructions,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSourceName => "Missing Source Name",
            Self::MissingImage => "Missing Image",
            Self::MissingCategory => "Missing Category",
            Self::MissingIngredients => "Missing Ingredients",
            Self::MissingInstructions => "Missing Instructions",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(str::trim).unwrap_or_default().is_empty()
}

/// Phase 1: checks that only need the list view.
pub fn validate_listing(entry: &SourceEntry) -> Result<(), RejectReason> {
    if is_blank(entry.source_name.as_deref()) {
        return Err(RejectReason::MissingSourceName);
    }
    if entry.primary_image().is_none() {
        return Err(RejectReason::MissingImage);
    }
    if entry.category_hint().is_none() {
        return Err(RejectReason::MissingCategory);
    }
    if entry.ingredients.iter().all(|i| i.text.trim().is_empty()) {
        return Err(RejectReason::MissingIngredients);
    }
    Ok(())
}

/// Phase 2: checks on the detail view.
pub fn validate_detail(entry: &SourceEntry) -> Result<(), RejectReason> {
    if entry.instructions.iter().all(|s| s.text.trim().is_empty()) {
        return Err(RejectReason::MissingInstructions);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectionRule {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeywordRule {
    pub category: String,
    pub contains_any: Vec<String>,
}

/// Drops `suppress` from keyword matches whenever any of `when_any` also matched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExclusionRule {
    pub suppress: String,
    pub when_any: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CategoryRules {
    #[serde(default)]
    pub version: u32,
    pub default_category: String,
    #[serde(default)]
    pub collections: Vec<CollectionRule>,
    #[serde(default)]
    pub keywords: Vec<KeywordRule>,
    #[serde(default)]
    pub exclusion: Option<ExclusionRule>,
}

impl CategoryRules {
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("categories.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn collection_id(&self, name: &str) -> Option<&str> {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id.as_str())
    }
}

/// Underscores read as spaces; a letter is upper-cased unless it follows another letter.
fn title_case(raw: &str) -> String {
    let spaced = raw
        .split(|c: char| c.is_whitespace() || c == '_')
        .filter(|word| !word.is_empty())
        .collect::<Vec<&str>>()
        .join(" ");
    let mut out = String::with_capacity(spaced.len());
    let mut after_letter = false;
    for c in spaced.chars() {
        if after_letter {
            out.extend(c.to_lowercase());
        } else {
            out.extend(c.to_uppercase());
        }
        after_letter = c.is_alphabetic();
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryResolution {
    pub categories: Vec<String>,
    pub origin: CategoryOrigin,
}

#[derive(Debug, Clone)]
pub struct Categorizer {
    rules: CategoryRules,
}

impl Categorizer {
    pub fn new(rules: CategoryRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &CategoryRules {
        &self.rules
    }

    /// Explicit category or collections, then title keywords, then the default.
    pub fn resolve(&self, entry: &SourceEntry) -> CategoryResolution {
        let explicit = self.explicit_matches(entry);
        if !explicit.is_empty() {
            return CategoryResolution {
                categories: explicit,
                origin: CategoryOrigin::Explicit,
            };
        }
        let keyword = self.keyword_matches(entry.display_title());
        if !keyword.is_empty() {
            return CategoryResolution {
                categories: keyword,
                origin: CategoryOrigin::Keyword,
            };
        }
        CategoryResolution {
            categories: vec![self.rules.default_category.clone()],
            origin: CategoryOrigin::Default,
        }
    }

    /// Canonical collection name, matched as given and then title-cased.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if let Some(rule) = self.rules.collections.iter().find(|c| c.name == name) {
            return Some(rule.name.as_str());
        }
        let titled = title_case(name);
        self.rules
            .collections
            .iter()
            .find(|c| c.name == titled)
            .map(|c| c.name.as_str())
    }

    fn explicit_matches(&self, entry: &SourceEntry) -> Vec<String> {
        let hints = entry
            .category
            .iter()
            .map(String::as_str)
            .chain(entry.collections.iter().map(|c| c.name.as_str()));
        let mut out: Vec<String> = Vec::new();
        for hint in hints {
            if let Some(name) = self.lookup(hint) {
                if !out.iter().any(|existing| existing == name) {
                    out.push(name.to_string());
                }
            }
        }
        out
    }

    /// Every category whose keywords appear in the title, in rule order.
    pub fn keyword_matches(&self, title: &str) -> Vec<String> {
        let title = title.to_lowercase();
        let mut matched: Vec<String> = Vec::new();
        for rule in &self.rules.keywords {
            if rule
                .contains_any
                .iter()
                .any(|needle| title.contains(&needle.to_lowercase()))
                && !matched.contains(&rule.category)
            {
                matched.push(rule.category.clone());
            }
        }
        if let Some(exclusion) = &self.rules.exclusion {
            if matched.iter().any(|m| exclusion.when_any.contains(m)) {
                matched.retain(|m| *m != exclusion.suppress);
            }
        }
        matched
    }
}

/// Maps catalog entries onto drafts ready for the destination.
#[derive(Debug, Clone)]
pub struct Transformer {
    categorizer: Categorizer,
}

impl Transformer {
    pub fn new(categorizer: Categorizer) -> Self {
        Self { categorizer }
    }

    pub fn categorizer(&self) -> &Categorizer {
        &self.categorizer
    }

    pub fn transform(&self, entry: &SourceEntry, reviewed: bool) -> RecipeDraft {
        let resolution = self.categorizer.resolve(entry);
        let prep_minutes = entry.prep_minutes.unwrap_or(0);
        let cook_minutes = entry.cook_minutes.unwrap_or(0);
        RecipeDraft {
            source_id: entry.id.clone(),
            title: entry.display_title().to_string(),
            description: entry.description.clone(),
            source_name: entry.source_name.clone(),
            source_url: entry.source_url.clone(),
            servings: entry.servings,
            prep_minutes,
            cook_minutes,
            total_minutes: prep_minutes.saturating_add(cook_minutes),
            categories: resolution.categories,
            category_origin: resolution.origin,
            ingredients: GroupedList::from_labelled(
                entry
                    .ingredients
                    .iter()
                    .filter(|i| !i.text.trim().is_empty())
                    .map(|i| (i.group.clone(), i.text.clone())),
            ),
            instructions: GroupedList::from_labelled(
                entry
                    .instructions
                    .iter()
                    .filter(|s| !s.text.trim().is_empty())
                    .map(|s| {
                        (
                            s.group.clone(),
                            DraftStep {
                                text: s.text.clone(),
                                media: s.media.clone(),
                            },
                        )
                    }),
            ),
            image_url: entry.primary_image().map(str::to_string),
            video_url: entry.first_video().map(|v| v.url.clone()),
            added_at: entry.added_at,
            reviewed,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress")]
    Busy,
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("catalog listing failed: {0}")]
    Listing(#[source] SourceError),
    #[error("run aborted: {0}")]
    Fatal(#[source] SourceError),
}

#[derive(Debug, Error)]
enum EntryError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryOutcome {
    Created,
    Updated(Vec<Scenario>),
    Matched,
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub tracker_path: PathBuf,
    /// Page threshold for runs that do not sweep; `None` reads every page.
    pub max_pages: Option<usize>,
    pub write_mode: WriteMode,
}

impl PipelineOptions {
    pub fn new(tracker_path: impl Into<PathBuf>) -> Self {
        Self {
            tracker_path: tracker_path.into(),
            max_pages: None,
            write_mode: WriteMode::PerMutation,
        }
    }
}

/// Exclusive right to run; held for the duration of one run.
#[derive(Debug)]
pub struct RunPermit {
    _guard: OwnedMutexGuard<()>,
}

pub struct SyncPipeline {
    source: Arc<dyn CatalogSource>,
    store: Arc<dyn DocumentStore>,
    transformer: Transformer,
    options: PipelineOptions,
    run_lock: Arc<Mutex<()>>,
    last_run: RwLock<Option<RunStats>>,
}

fn mirror_update(draft: &RecipeDraft, published: Published) -> RecordUpdate {
    RecordUpdate::default()
        .destination(published.destination_id)
        .image_type(published.image_type)
        .has_video(draft.video_url.is_some())
        .has_instruction_media(draft.has_instruction_media())
        .was_reviewed(draft.reviewed)
        .title(draft.title.clone())
}

impl SyncPipeline {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        store: Arc<dyn DocumentStore>,
        transformer: Transformer,
        options: PipelineOptions,
    ) -> Self {
        Self {
            source,
            store,
            transformer,
            options,
            run_lock: Arc::new(Mutex::new(())),
            last_run: RwLock::new(None),
        }
    }

    /// Wires the HTTP clients and rule tables described by `config`.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        config.ensure_credentials()?;
        let rules = CategoryRules::from_workspace_root(&config.workspace_root)?;
        let source = WhiskClient::new(config.whisk_config()).context("building catalog client")?;
        let store =
            NotionClient::new(config.notion_config()).context("building destination client")?;
        Ok(Self::new(
            Arc::new(source),
            Arc::new(store),
            Transformer::new(Categorizer::new(rules)),
            config.pipeline_options(),
        ))
    }

    pub fn try_acquire(&self) -> Option<RunPermit> {
        Arc::clone(&self.run_lock)
            .try_lock_owned()
            .ok()
            .map(|guard| RunPermit { _guard: guard })
    }

    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    pub async fn last_run(&self) -> Option<RunStats> {
        self.last_run.read().await.clone()
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunStats, SyncError> {
        let permit = self.try_acquire().ok_or(SyncError::Busy)?;
        self.run_with(permit, mode).await
    }

    pub async fn run_with(&self, _permit: RunPermit, mode: RunMode) -> Result<RunStats, SyncError> {
        let mut stats = RunStats::new(mode);
        let span = info_span!("sync_run", run_id = %stats.run_id, mode = mode.label());
        async move {
            info!("sync run started");
            let mut tracker = Tracker::load(&self.options.tracker_path)
                .await?
                .with_write_mode(self.options.write_mode);

            let outcome = match mode {
                RunMode::Normal { full_sync } => {
                    self.run_catalog(&mut tracker, full_sync, &mut stats).await
                }
                RunMode::RetryRejected => self.run_retry_rejected(&mut tracker, &mut stats).await,
            };
            let flushed = tracker.flush().await;
            if let Err(err) = &outcome {
                error!(error = %err, "sync run aborted");
            }
            outcome?;
            flushed?;

            stats.finish();
            info!(summary = %stats.summary_line(), "sync run finished");
            *self.last_run.write().await = Some(stats.clone());
            Ok(stats)
        }
        .instrument(span)
        .await
    }

    async fn run_catalog(
        &self,
        tracker: &mut Tracker,
        full_sync: bool,
        stats: &mut RunStats,
    ) -> Result<(), SyncError> {
        let mut listed: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = self
                .source
                .list(cursor.as_deref())
                .await
                .map_err(SyncError::Listing)?;
            pages += 1;
            stats.fetched += page.entries.len();
            debug!(page = pages, entries = page.entries.len(), "catalog page fetched");

            for entry in page.entries {
                listed.insert(entry.id.clone());
                let id = entry.id.clone();
                let title = entry.display_title().to_string();
                let outcome = self.process_entry(tracker, entry).await;
                tally(stats, &id, &title, outcome)?;
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
            if !full_sync && self.options.max_pages.is_some_and(|max| pages >= max) {
                info!(pages, "page threshold reached; stopping early");
                break;
            }
        }

        if full_sync {
            self.sweep_removed(tracker, &listed, stats).await?;
        }
        Ok(())
    }

    async fn run_retry_rejected(
        &self,
        tracker: &mut Tracker,
        stats: &mut RunStats,
    ) -> Result<(), SyncError> {
        let ids = tracker.ids_with_status(SyncStatus::Rejected);
        info!(count = ids.len(), "retrying rejected entries");
        for id in ids {
            let title = tracker
                .get(&id)
                .and_then(|r| r.title.clone())
                .unwrap_or_else(|| "Untitled".to_string());
            let outcome = self.retry_entry(tracker, &id, stats).await;
            tally(stats, &id, &title, outcome)?;
        }
        Ok(())
    }

    async fn process_entry(
        &self,
        tracker: &mut Tracker,
        entry: SourceEntry,
    ) -> Result<EntryOutcome, EntryError> {
        let mirrored = tracker
            .get(&entry.id)
            .filter(|r| r.status.is_mirrored())
            .cloned();
        match mirrored {
            Some(record) => match record.destination_id.clone() {
                Some(destination_id) => {
                    self.reconcile_mirrored(tracker, entry, &record, &destination_id)
                        .await
                }
                None => self.admit_candidate(tracker, entry).await,
            },
            None => self.admit_candidate(tracker, entry).await,
        }
    }

    async fn reject(
        &self,
        tracker: &mut Tracker,
        entry: &SourceEntry,
        reason: RejectReason,
    ) -> Result<EntryOutcome, EntryError> {
        tracker
            .upsert(
                &entry.id,
                RecordUpdate::rejected(Some(entry.display_title().to_string()), reason.as_str()),
            )
            .await?;
        Ok(EntryOutcome::Rejected(reason))
    }

    async fn admit_candidate(
        &self,
        tracker: &mut Tracker,
        entry: SourceEntry,
    ) -> Result<EntryOutcome, EntryError> {
        if let Err(reason) = validate_listing(&entry) {
            return self.reject(tracker, &entry, reason).await;
        }
        let detail = self.source.detail(&entry.id).await?;
        let entry = entry.with_detail(detail);
        if let Err(reason) = validate_detail(&entry) {
            return self.reject(tracker, &entry, reason).await;
        }
        let reviewed = self.source.review_status(&entry.id).await?;
        self.create_mirror(tracker, &entry, reviewed).await
    }

    async fn retry_entry(
        &self,
        tracker: &mut Tracker,
        id: &str,
        stats: &mut RunStats,
    ) -> Result<EntryOutcome, EntryError> {
        let mut entry = self.source.detail(id).await?;
        stats.fetched += 1;
        if entry.title.is_none() {
            entry.title = tracker.get(id).and_then(|r| r.title.clone());
        }
        if let Err(reason) = validate_listing(&entry).and_then(|()| validate_detail(&entry)) {
            return self.reject(tracker, &entry, reason).await;
        }
        let reviewed = self.source.review_status(id).await?;
        self.create_mirror(tracker, &entry, reviewed).await
    }

    async fn create_mirror(
        &self,
        tracker: &mut Tracker,
        entry: &SourceEntry,
        reviewed: bool,
    ) -> Result<EntryOutcome, EntryError> {
        let draft = self.transformer.transform(entry, reviewed);
        let published = larder_notion::publish(self.store.as_ref(), &draft).await?;
        tracker
            .upsert(
                &entry.id,
                mirror_update(&draft, published).status(SyncStatus::New),
            )
            .await?;
        Ok(EntryOutcome::Created)
    }

    async fn reconcile_mirrored(
        &self,
        tracker: &mut Tracker,
        entry: SourceEntry,
        record: &TrackerRecord,
        destination_id: &str,
    ) -> Result<EntryOutcome, EntryError> {
        if let Err(reason) = validate_listing(&entry) {
            warn!(
                id = %entry.id,
                reason = reason.as_str(),
                "mirrored entry no longer validates; document left in place"
            );
            return Ok(EntryOutcome::Rejected(reason));
        }

        let reviewed = if record.was_reviewed {
            true
        } else {
            self.source.review_status(&entry.id).await?
        };
        let entry = if record.has_instruction_media {
            entry
        } else {
            let detail = self.source.detail(&entry.id).await?;
            entry.with_detail(detail)
        };

        if !record.has_instruction_media && entry.has_instruction_media() {
            let draft = self.transformer.transform(&entry, reviewed);
            let published =
                larder_notion::republish(self.store.as_ref(), destination_id, &draft).await?;
            tracker
                .upsert(
                    &entry.id,
                    mirror_update(&draft, published).status(SyncStatus::Updated),
                )
                .await?;
            return Ok(EntryOutcome::Updated(vec![Scenario::InstructionMedia]));
        }

        let store = self.store.as_ref();
        let mut applied = Vec::new();
        let mut update = RecordUpdate::default();

        if record.image_type == ImageType::External {
            if let Some(image_url) = entry.primary_image() {
                larder_notion::migrate_image(store, destination_id, image_url).await?;
                applied.push(Scenario::ImageMigration);
                update = update.image_type(ImageType::FileUpload);
            }
        }
        if !record.has_video {
            if let Some(video) = entry.first_video() {
                larder_notion::add_video(store, destination_id, &video.url).await?;
                applied.push(Scenario::VideoAddition);
                update = update.has_video(true);
            }
        }
        if reviewed && !record.was_reviewed {
            larder_notion::flip_review(store, destination_id).await?;
            applied.push(Scenario::ReviewFlip);
            update = update.was_reviewed(true);
        }

        if applied.is_empty() {
            return Ok(EntryOutcome::Matched);
        }
        tracker
            .upsert(
                &entry.id,
                update
                    .status(SyncStatus::Updated)
                    .title(entry.display_title()),
            )
            .await?;
        Ok(EntryOutcome::Updated(applied))
    }

    /// Archives documents whose entries the catalog no longer lists. Rejected records stay.
    async fn sweep_removed(
        &self,
        tracker: &mut Tracker,
        listed: &HashSet<String>,
        stats: &mut RunStats,
    ) -> Result<(), SyncError> {
        let stale: Vec<(String, String)> = tracker
            .records()
            .iter()
            .filter(|(id, record)| record.status.is_mirrored() && !listed.contains(*id))
            .filter_map(|(id, record)| {
                record
                    .destination_id
                    .clone()
                    .map(|destination_id| (id.clone(), destination_id))
            })
            .collect();

        for (id, destination_id) in stale {
            match self.store.archive(&destination_id).await {
                Ok(()) => {
                    tracker.remove(&id).await?;
                    stats.deleted += 1;
                    info!(id = %id, document_id = %destination_id, "entry gone from catalog; document archived");
                }
                Err(err) => {
                    stats.errors += 1;
                    error!(id = %id, error = %err, "archiving removed entry failed");
                }
            }
        }
        Ok(())
    }
}

fn tally(
    stats: &mut RunStats,
    id: &str,
    title: &str,
    outcome: Result<EntryOutcome, EntryError>,
) -> Result<(), SyncError> {
    match outcome {
        Ok(EntryOutcome::Created) => {
            stats.created += 1;
            info!(id, title, "entry mirrored");
        }
        Ok(EntryOutcome::Updated(scenarios)) => {
            stats.updated += 1;
            let applied: Vec<&str> = scenarios.iter().map(Scenario::label).collect();
            info!(id, title, scenarios = ?applied, "entry upgraded");
        }
        Ok(EntryOutcome::Matched) => stats.matched += 1,
        Ok(EntryOutcome::Rejected(reason)) => {
            warn!(id, title, reason = reason.as_str(), "entry rejected");
            stats.record_rejection(id, title, reason.as_str());
        }
        Err(EntryError::Tracker(err)) => return Err(SyncError::Tracker(err)),
        Err(EntryError::Source(err)) if err.is_fatal() => return Err(SyncError::Fatal(err)),
        Err(err) => {
            stats.errors += 1;
            error!(id, title, error = %err, "entry failed");
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub tracker_path: PathBuf,
    pub workspace_root: PathBuf,
    pub whisk_api_base: String,
    pub whisk_login_base: String,
    pub whisk_client_id: String,
    pub whisk_email: String,
    pub whisk_password: String,
    pub whisk_token_cache: Option<PathBuf>,
    pub whisk_fetch_limit: u32,
    pub whisk_max_pages: usize,
    pub notion_api_base: String,
    pub notion_version: String,
    pub notion_api_key: String,
    pub notion_data_source: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            tracker_path: PathBuf::from(text("LARDER_TRACKER_PATH", "./data/sync_status.json")),
            workspace_root: PathBuf::from(text("LARDER_WORKSPACE_ROOT", ".")),
            whisk_api_base: text("WHISK_API_BASE", larder_adapters::DEFAULT_API_BASE),
            whisk_login_base: text("WHISK_LOGIN_BASE", larder_adapters::DEFAULT_LOGIN_BASE),
            whisk_client_id: text("WHISK_CLIENT_ID", ""),
            whisk_email: text("WHISK_EMAIL", ""),
            whisk_password: text("WHISK_PASSWORD", ""),
            whisk_token_cache: lookup("WHISK_TOKEN_CACHE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            whisk_fetch_limit: number("WHISK_FETCH_LIMIT")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(100),
            whisk_max_pages: number("WHISK_MAX_PAGES")
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(1),
            notion_api_base: text("NOTION_API_BASE", larder_notion::DEFAULT_API_BASE),
            notion_version: text("NOTION_VERSION", larder_notion::DEFAULT_NOTION_VERSION),
            notion_api_key: text("NOTION_API_KEY", ""),
            notion_data_source: text("NOTION_RECIPES_DATA_SOURCE", ""),
            http_timeout_secs: number("LARDER_HTTP_TIMEOUT_SECS").unwrap_or(20),
            scheduler_enabled: lookup("LARDER_SCHEDULER_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            sync_cron: text("LARDER_SYNC_CRON", "0 0 6 * * *"),
            web_port: number("LARDER_WEB_PORT")
                .and_then(|v| u16::try_from(v).ok())
                .unwrap_or(8000),
        }
    }

    pub fn ensure_credentials(&self) -> Result<()> {
        for (key, value) in [
            ("WHISK_CLIENT_ID", &self.whisk_client_id),
            ("WHISK_EMAIL", &self.whisk_email),
            ("WHISK_PASSWORD", &self.whisk_password),
            ("NOTION_API_KEY", &self.notion_api_key),
            ("NOTION_RECIPES_DATA_SOURCE", &self.notion_data_source),
        ] {
            ensure!(!value.trim().is_empty(), "{key} must be set");
        }
        Ok(())
    }

    fn http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("larder/{}", env!("CARGO_PKG_VERSION"))),
        }
    }

    pub fn whisk_config(&self) -> WhiskConfig {
        let mut config = WhiskConfig::new(
            self.whisk_client_id.clone(),
            self.whisk_email.clone(),
            self.whisk_password.clone(),
        );
        config.api_base = self.whisk_api_base.clone();
        config.login_base = self.whisk_login_base.clone();
        config.page_limit = self.whisk_fetch_limit;
        config.token_cache = self.whisk_token_cache.clone();
        config.http = self.http();
        config
    }

    pub fn notion_config(&self) -> NotionConfig {
        let mut config =
            NotionConfig::new(self.notion_api_key.clone(), self.notion_data_source.clone());
        config.api_base = self.notion_api_base.clone();
        config.version = self.notion_version.clone();
        config.http = self.http();
        config
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            tracker_path: self.tracker_path.clone(),
            max_pages: Some(self.whisk_max_pages.max(1)),
            write_mode: WriteMode::PerMutation,
        }
    }
}

pub async fn run_sync_once_from_env(mode: RunMode) -> Result<RunStats> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config)?;
    Ok(pipeline.run(mode).await?)
}

/// Registers a cron job running normal syncs, when scheduling is enabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run(RunMode::Normal { full_sync: false }).await {
                Ok(stats) => info!(summary = %stats.summary_line(), "scheduled sync finished"),
                Err(SyncError::Busy) => warn!("scheduled sync skipped; a run is already in progress"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron, "scheduled sync registered");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use larder_adapters::CatalogPage;
    use larder_core::{CollectionRef, EntryItem, InstructionStep, VideoProvider, VideoRef};
    use larder_notion::{Block, NewDocument, PropertyUpdate};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::{tempdir, TempDir};

    fn rules() -> CategoryRules {
        CategoryRules::from_yaml_str(include_str!("../../../rules/categories.yaml"))
            .expect("bundled rules parse")
    }

    fn categorizer() -> Categorizer {
        Categorizer::new(rules())
    }

    fn valid_entry(id: &str, title: &str) -> SourceEntry {
        SourceEntry {
            id: id.into(),
            title: Some(title.into()),
            source_name: Some("BBC Good Food".into()),
            images: vec![format!("https://img.example.com/{id}.jpg")],
            ingredients: vec![EntryItem::new("flour"), EntryItem::new("water")],
            collections: vec![CollectionRef {
                id: None,
                name: "Lunches".into(),
            }],
            ..Default::default()
        }
    }

    fn detail(id: &str) -> SourceEntry {
        SourceEntry {
            id: id.into(),
            instructions: vec![InstructionStep::new("Mix"), InstructionStep::new("Bake")],
            ..Default::default()
        }
    }

    fn detail_with_media(id: &str) -> SourceEntry {
        let mut step = InstructionStep::new("Fold the dough");
        step.media = vec!["https://img.example.com/fold.jpg".into()];
        SourceEntry {
            id: id.into(),
            instructions: vec![step],
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct FakeCatalog {
        pages: Vec<Vec<SourceEntry>>,
        details: HashMap<String, SourceEntry>,
        reviewed: HashSet<String>,
        unauthorized: bool,
        calls: StdMutex<Vec<String>>,
    }

    impl FakeCatalog {
        fn with_page(mut self, entries: Vec<SourceEntry>) -> Self {
            self.pages.push(entries);
            self
        }

        fn with_detail(mut self, entry: SourceEntry) -> Self {
            self.details.insert(entry.id.clone(), entry);
            self
        }

        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CatalogSource for FakeCatalog {
        async fn list(&self, cursor: Option<&str>) -> Result<CatalogPage, SourceError> {
            self.log(format!("list:{}", cursor.unwrap_or("-")));
            let index = cursor.and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
            Ok(CatalogPage {
                entries: self.pages.get(index).cloned().unwrap_or_default(),
                next_cursor: (index + 1 < self.pages.len()).then(|| (index + 1).to_string()),
            })
        }

        async fn detail(&self, id: &str) -> Result<SourceEntry, SourceError> {
            self.log(format!("detail:{id}"));
            self.details
                .get(id)
                .cloned()
                .ok_or_else(|| SourceError::HttpStatus {
                    status: 503,
                    url: format!("/detail/{id}"),
                })
        }

        async fn review_status(&self, id: &str) -> Result<bool, SourceError> {
            self.log(format!("review:{id}"));
            if self.unauthorized {
                return Err(SourceError::Unauthorized {
                    url: format!("/review/{id}"),
                });
            }
            Ok(self.reviewed.contains(id))
        }
    }

    #[derive(Default)]
    struct FakeStore {
        calls: StdMutex<Vec<String>>,
        next_id: AtomicUsize,
        fail_uploads: bool,
        fail_append: bool,
    }

    impl FakeStore {
        fn log(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn create(&self, doc: &NewDocument) -> Result<String, DestinationError> {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.log(format!("create:{}", doc.properties.source_id));
            Ok(format!("page-{n}"))
        }

        async fn update_properties(
            &self,
            id: &str,
            update: &PropertyUpdate,
        ) -> Result<(), DestinationError> {
            let mut fields: Vec<&str> = Vec::new();
            if update.image.is_some() {
                fields.push("image");
            }
            if update.video_url.is_some() {
                fields.push("video");
            }
            if update.reviewed.is_some() {
                fields.push("reviewed");
            }
            self.log(format!("update:{id}:{}", fields.join(",")));
            Ok(())
        }

        async fn append_content(
            &self,
            id: &str,
            blocks: &[Block],
        ) -> Result<(), DestinationError> {
            self.log(format!("append:{id}:{}", blocks.len()));
            if self.fail_append {
                return Err(DestinationError::Http {
                    status: 502,
                    url: format!("/blocks/{id}/children"),
                    body: String::new(),
                });
            }
            Ok(())
        }

        async fn archive(&self, id: &str) -> Result<(), DestinationError> {
            self.log(format!("archive:{id}"));
            Ok(())
        }

        async fn upload_media_from_url(
            &self,
            url: &str,
            _name: &str,
        ) -> Result<String, DestinationError> {
            self.log(format!("upload:{url}"));
            if self.fail_uploads {
                return Err(DestinationError::UploadFailed {
                    url: url.into(),
                    reason: "unreachable".into(),
                });
            }
            Ok("fu-1".into())
        }
    }

    struct Harness {
        _dir: TempDir,
        path: PathBuf,
        catalog: Arc<FakeCatalog>,
        store: Arc<FakeStore>,
        pipeline: SyncPipeline,
    }

    fn harness(catalog: FakeCatalog, store: FakeStore) -> Harness {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync_status.json");
        let catalog = Arc::new(catalog);
        let store = Arc::new(store);
        let pipeline = SyncPipeline::new(
            catalog.clone(),
            store.clone(),
            Transformer::new(categorizer()),
            PipelineOptions::new(&path),
        );
        Harness {
            _dir: dir,
            path,
            catalog,
            store,
            pipeline,
        }
    }

    async fn seed(path: &Path, id: &str, update: RecordUpdate) {
        let mut tracker = Tracker::load(path).await.unwrap();
        tracker.upsert(id, update).await.unwrap();
    }

    async fn record(path: &Path, id: &str) -> Option<TrackerRecord> {
        Tracker::load(path).await.unwrap().get(id).cloned()
    }

    fn normal() -> RunMode {
        RunMode::Normal { full_sync: false }
    }

    #[test]
    fn listing_validation_reports_first_missing_field() {
        let entry = valid_entry("r1", "Pho");
        assert_eq!(validate_listing(&entry), Ok(()));

        let mut e = entry.clone();
        e.source_name = Some("  ".into());
        assert_eq!(validate_listing(&e), Err(RejectReason::MissingSourceName));

        let mut e = entry.clone();
        e.images.clear();
        assert_eq!(validate_listing(&e), Err(RejectReason::MissingImage));

        let mut e = entry.clone();
        e.collections.clear();
        assert_eq!(validate_listing(&e), Err(RejectReason::MissingCategory));

        let mut e = entry.clone();
        e.ingredients.clear();
        assert_eq!(
            validate_listing(&e).map_err(|r| r.as_str()),
            Err("Missing Ingredients")
        );

        assert_eq!(
            validate_detail(&entry).map_err(|r| r.to_string()),
            Err("Missing Instructions".to_string())
        );
        assert_eq!(validate_detail(&detail("r1")), Ok(()));
    }

    #[test]
    fn bundled_rules_resolve_collection_ids() {
        let rules = rules();
        assert_eq!(rules.default_category, "Light Bites");
        assert_eq!(
            rules.collection_id("Bread"),
            Some("1050194936d2837722fa12008d5fb44ab75")
        );
        assert_eq!(rules.keywords.len(), 12);
    }

    #[test]
    fn explicit_category_wins_over_keywords() {
        let categorizer = categorizer();
        let mut entry = valid_entry("r1", "Lemon Tart");
        entry.collections = vec![CollectionRef {
            id: None,
            name: "red meat".into(),
        }];
        let resolved = categorizer.resolve(&entry);
        assert_eq!(resolved.origin, CategoryOrigin::Explicit);
        assert_eq!(resolved.categories, vec!["Red Meat".to_string()]);

        entry.category = Some("Puddings".into());
        assert_eq!(
            categorizer.resolve(&entry).categories,
            vec!["Puddings".to_string(), "Red Meat".to_string()]
        );
    }

    #[test]
    fn title_case_capitalizes_after_any_non_letter() {
        assert_eq!(title_case("stir-fry"), "Stir-Fry");
        assert_eq!(title_case("high_protein"), "High Protein");
        assert_eq!(title_case("RED  meat"), "Red Meat");
        assert_eq!(title_case("mum's 3rd bake"), "Mum'S 3Rd Bake");
    }

    #[test]
    fn keywords_apply_dessert_exclusion_then_default() {
        let categorizer = categorizer();
        let mut entry = valid_entry("r1", "Lemon Tart");
        entry.collections = vec![CollectionRef {
            id: None,
            name: "Misc".into(),
        }];
        let resolved = categorizer.resolve(&entry);
        assert_eq!(resolved.origin, CategoryOrigin::Keyword);
        assert_eq!(resolved.categories, vec!["Puddings".to_string()]);

        entry.title = Some("Chicken Tart".into());
        assert_eq!(
            categorizer.resolve(&entry).categories,
            vec!["Poultry".to_string()]
        );

        entry.title = Some("Lemon Madeliene".into());
        assert_eq!(
            categorizer.resolve(&entry).categories,
            vec!["Puddings".to_string()]
        );

        entry.title = Some("Mystery Stew".into());
        let resolved = categorizer.resolve(&entry);
        assert_eq!(resolved.origin, CategoryOrigin::Default);
        assert_eq!(resolved.categories, vec!["Light Bites".to_string()]);
    }

    #[test]
    fn transformer_groups_totals_and_video_priority() {
        let transformer = Transformer::new(categorizer());
        let mut entry = valid_entry("r1", "Pho");
        entry.prep_minutes = Some(15);
        entry.cook_minutes = Some(40);
        entry.ingredients = vec![
            EntryItem::grouped("noodles", "Soup"),
            EntryItem::new("lime"),
            EntryItem::grouped("beef", "Soup"),
        ];
        entry.instructions = vec![InstructionStep::new("Simmer")];
        entry.videos = vec![
            VideoRef {
                provider: VideoProvider::Instagram,
                url: "https://instagram.example/p".into(),
            },
            VideoRef {
                provider: VideoProvider::YouTube,
                url: "https://youtube.example/p".into(),
            },
        ];

        let draft = transformer.transform(&entry, true);
        assert_eq!(draft.total_minutes, 55);
        assert_eq!(draft.video_url.as_deref(), Some("https://youtube.example/p"));
        assert!(draft.reviewed);
        assert_eq!(draft.categories, vec!["Lunches".to_string()]);
        match &draft.ingredients {
            GroupedList::Nested(groups) => {
                assert_eq!(groups.len(), 2);
                assert_eq!(groups[0].label, None);
                assert_eq!(groups[1].items, vec!["noodles".to_string(), "beef".to_string()]);
            }
            other => panic!("expected nested ingredients, got {other:?}"),
        }
        assert!(matches!(draft.instructions, GroupedList::Flat(ref steps) if steps.len() == 1));
    }

    #[tokio::test]
    async fn new_entry_is_created_and_tracked() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("e1", "Pho")])
                .with_detail(detail("e1")),
            FakeStore::default(),
        );

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!((stats.fetched, stats.created, stats.updated), (1, 1, 0));

        let rec = record(&h.path, "e1").await.unwrap();
        assert_eq!(rec.status, SyncStatus::New);
        assert_eq!(rec.destination_id.as_deref(), Some("page-1"));
        assert_eq!(rec.image_type, ImageType::FileUpload);
        assert!(rec.is_consistent());
        assert_eq!(h.pipeline.last_run().await, Some(stats));
    }

    #[tokio::test]
    async fn second_run_over_unchanged_catalog_writes_nothing() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("e1", "Pho"), valid_entry("e2", "Ramen")])
                .with_detail(detail("e1"))
                .with_detail(detail("e2")),
            FakeStore::default(),
        );

        h.pipeline.run(normal()).await.unwrap();
        let writes_after_first = h.store.calls().len();
        let stats = h.pipeline.run(normal()).await.unwrap();

        assert_eq!((stats.created, stats.updated, stats.matched), (0, 0, 2));
        assert_eq!(h.store.calls().len(), writes_after_first);
    }

    #[tokio::test]
    async fn phase_one_failure_is_rejected_without_writes() {
        let mut entry = valid_entry("g1", "Toast");
        entry.ingredients.clear();
        let h = harness(FakeCatalog::default().with_page(vec![entry]), FakeStore::default());

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rejections[0].reason, "Missing Ingredients");
        assert_eq!(stats.rejections[0].title, "Toast");
        assert!(h.store.calls().is_empty());
        assert!(!h.catalog.calls().iter().any(|c| c.starts_with("detail")));

        let rec = record(&h.path, "g1").await.unwrap();
        assert_eq!(rec.status, SyncStatus::Rejected);
        assert_eq!(rec.destination_id, None);
        assert_eq!(rec.rejection_reason.as_deref(), Some("Missing Ingredients"));
    }

    #[tokio::test]
    async fn phase_two_failure_is_rejected_without_writes() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("g2", "Soup")])
                .with_detail(SourceEntry {
                    id: "g2".into(),
                    ..Default::default()
                }),
            FakeStore::default(),
        );

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rejections[0].reason, "Missing Instructions");
        assert!(h.store.calls().is_empty());
        assert!(!h.catalog.calls().iter().any(|c| c.starts_with("review")));
        assert_eq!(
            record(&h.path, "g2").await.unwrap().status,
            SyncStatus::Rejected
        );
    }

    #[tokio::test]
    async fn external_image_is_migrated_to_upload() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("f1", "Focaccia")])
                .with_detail(detail("f1")),
            FakeStore::default(),
        );
        seed(
            &h.path,
            "f1",
            RecordUpdate::default()
                .destination("page-f")
                .image_type(ImageType::External),
        )
        .await;

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!((stats.updated, stats.created), (1, 0));
        assert_eq!(
            h.store.calls(),
            vec![
                "upload:https://img.example.com/f1.jpg".to_string(),
                "update:page-f:image".to_string(),
            ]
        );

        let rec = record(&h.path, "f1").await.unwrap();
        assert_eq!(rec.image_type, ImageType::FileUpload);
        assert_eq!(rec.status, SyncStatus::Updated);
        assert_eq!(rec.destination_id.as_deref(), Some("page-f"));
    }

    #[tokio::test]
    async fn video_and_review_upgrades_apply_together() {
        let mut entry = valid_entry("v1", "Pho");
        entry.videos = vec![VideoRef {
            provider: VideoProvider::TikTok,
            url: "https://tiktok.example/v1".into(),
        }];
        let mut catalog = FakeCatalog::default()
            .with_page(vec![entry])
            .with_detail(detail("v1"));
        catalog.reviewed.insert("v1".into());
        let h = harness(catalog, FakeStore::default());
        seed(&h.path, "v1", RecordUpdate::default().destination("page-v")).await;

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(
            h.store.calls(),
            vec![
                "update:page-v:video".to_string(),
                "append:page-v:1".to_string(),
                "update:page-v:reviewed".to_string(),
            ]
        );
        let rec = record(&h.path, "v1").await.unwrap();
        assert!(rec.has_video);
        assert!(rec.was_reviewed);
    }

    #[tokio::test]
    async fn instruction_media_replaces_document_and_supersedes_other_upgrades() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("d1", "Naan")])
                .with_detail(detail_with_media("d1")),
            FakeStore::default(),
        );
        seed(
            &h.path,
            "d1",
            RecordUpdate::default()
                .destination("page-old")
                .image_type(ImageType::External),
        )
        .await;

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!((stats.updated, stats.created), (1, 0));
        assert_eq!(
            h.store.calls(),
            vec![
                "upload:https://img.example.com/d1.jpg".to_string(),
                "archive:page-old".to_string(),
                "create:d1".to_string(),
            ]
        );

        let rec = record(&h.path, "d1").await.unwrap();
        assert_eq!(rec.destination_id.as_deref(), Some("page-1"));
        assert!(rec.has_instruction_media);
        assert_eq!(rec.image_type, ImageType::FileUpload);
        assert_eq!(rec.status, SyncStatus::Updated);
    }

    #[tokio::test]
    async fn failed_upgrade_leaves_record_untouched() {
        let mut entry = valid_entry("v2", "Pho");
        entry.videos = vec![VideoRef {
            provider: VideoProvider::YouTube,
            url: "https://youtube.example/v2".into(),
        }];
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![entry])
                .with_detail(detail("v2")),
            FakeStore {
                fail_append: true,
                ..Default::default()
            },
        );
        seed(&h.path, "v2", RecordUpdate::default().destination("page-v2")).await;
        let before = record(&h.path, "v2").await.unwrap();

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!((stats.errors, stats.updated), (1, 0));
        assert_eq!(record(&h.path, "v2").await.unwrap(), before);
    }

    #[tokio::test]
    async fn failed_cover_import_falls_back_to_external_link() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("e3", "Pho")])
                .with_detail(detail("e3")),
            FakeStore {
                fail_uploads: true,
                ..Default::default()
            },
        );

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!(stats.created, 1);
        assert_eq!(
            record(&h.path, "e3").await.unwrap().image_type,
            ImageType::External
        );
    }

    #[tokio::test]
    async fn mirrored_entry_failing_validation_is_left_in_place() {
        let mut entry = valid_entry("m1", "Pho");
        entry.images.clear();
        let h = harness(FakeCatalog::default().with_page(vec![entry]), FakeStore::default());
        seed(&h.path, "m1", RecordUpdate::default().destination("page-m")).await;
        let before = record(&h.path, "m1").await.unwrap();

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!(stats.rejected, 1);
        assert!(h.store.calls().is_empty());
        assert_eq!(record(&h.path, "m1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn full_sync_archives_missing_mirrored_entries_only() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("c1", "Pho")])
                .with_detail(detail("c1")),
            FakeStore::default(),
        );
        seed(
            &h.path,
            "a1",
            RecordUpdate::default()
                .destination("page-a")
                .status(SyncStatus::Updated),
        )
        .await;
        seed(&h.path, "b1", RecordUpdate::rejected(None, "Missing Image")).await;

        let stats = h
            .pipeline
            .run(RunMode::Normal { full_sync: true })
            .await
            .unwrap();
        assert_eq!(stats.deleted, 1);
        assert!(h.store.calls().contains(&"archive:page-a".to_string()));
        assert!(record(&h.path, "a1").await.is_none());

        let b = record(&h.path, "b1").await.unwrap();
        assert_eq!(b.status, SyncStatus::Rejected);
        assert_eq!(b.rejection_reason.as_deref(), Some("Missing Image"));
    }

    #[tokio::test]
    async fn normal_run_leaves_absent_entries_alone() {
        let h = harness(FakeCatalog::default().with_page(Vec::new()), FakeStore::default());
        seed(&h.path, "a1", RecordUpdate::default().destination("page-a")).await;

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!(stats.deleted, 0);
        assert!(record(&h.path, "a1").await.is_some());
    }

    #[tokio::test]
    async fn retry_rejected_touches_only_rejected_records() {
        let h = harness(
            FakeCatalog::default().with_detail(SourceEntry {
                instructions: vec![InstructionStep::new("Bake")],
                ..valid_entry("r1", "Scones")
            }),
            FakeStore::default(),
        );
        seed(&h.path, "n1", RecordUpdate::default().destination("page-n")).await;
        seed(
            &h.path,
            "r1",
            RecordUpdate::rejected(Some("Scones".into()), "Missing Instructions"),
        )
        .await;
        let untouched = record(&h.path, "n1").await.unwrap();

        let stats = h.pipeline.run(RunMode::RetryRejected).await.unwrap();
        assert_eq!(stats.created, 1);
        assert!(h.catalog.calls().iter().all(|c| c.ends_with(":r1")));
        assert_eq!(record(&h.path, "n1").await.unwrap(), untouched);

        let r = record(&h.path, "r1").await.unwrap();
        assert_eq!(r.status, SyncStatus::New);
        assert!(r.destination_id.is_some());
        assert_eq!(r.rejection_reason, None);
    }

    #[tokio::test]
    async fn retry_that_still_fails_keeps_record_rejected_with_new_reason() {
        let mut still_invalid = valid_entry("r2", "Scones");
        still_invalid.title = None;
        still_invalid.images.clear();
        still_invalid.instructions = vec![InstructionStep::new("Bake")];
        let h = harness(
            FakeCatalog::default().with_detail(still_invalid),
            FakeStore::default(),
        );
        seed(
            &h.path,
            "r2",
            RecordUpdate::rejected(Some("Scones".into()), "Missing Instructions"),
        )
        .await;

        let stats = h.pipeline.run(RunMode::RetryRejected).await.unwrap();
        assert_eq!((stats.rejected, stats.created), (1, 0));
        assert_eq!(stats.rejections[0].reason, "Missing Image");
        assert!(h.store.calls().is_empty());
        assert_eq!(h.catalog.calls(), vec!["detail:r2".to_string()]);

        let r = record(&h.path, "r2").await.unwrap();
        assert_eq!(r.status, SyncStatus::Rejected);
        assert_eq!(r.destination_id, None);
        assert_eq!(r.rejection_reason.as_deref(), Some("Missing Image"));
        assert_eq!(r.title.as_deref(), Some("Scones"));
    }

    #[tokio::test]
    async fn fatal_source_error_aborts_run() {
        let mut catalog = FakeCatalog::default()
            .with_page(vec![valid_entry("e1", "Pho"), valid_entry("e2", "Ramen")])
            .with_detail(detail("e1"))
            .with_detail(detail("e2"));
        catalog.unauthorized = true;
        let h = harness(catalog, FakeStore::default());

        let err = h.pipeline.run(normal()).await.unwrap_err();
        assert!(matches!(err, SyncError::Fatal(SourceError::Unauthorized { .. })));
        assert!(h.store.calls().is_empty());
        assert_eq!(h.pipeline.last_run().await, None);
    }

    #[tokio::test]
    async fn transient_detail_failure_counts_as_entry_error() {
        let h = harness(
            FakeCatalog::default()
                .with_page(vec![valid_entry("e1", "Pho"), valid_entry("e2", "Ramen")])
                .with_detail(detail("e2")),
            FakeStore::default(),
        );

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!((stats.errors, stats.created), (1, 1));
        assert!(record(&h.path, "e1").await.is_none());
    }

    #[tokio::test]
    async fn page_threshold_applies_to_normal_runs_only() {
        let catalog = FakeCatalog::default()
            .with_page(vec![valid_entry("p1", "Pho")])
            .with_page(vec![valid_entry("p2", "Ramen")])
            .with_detail(detail("p1"))
            .with_detail(detail("p2"));
        let mut h = harness(catalog, FakeStore::default());
        h.pipeline.options.max_pages = Some(1);

        let stats = h.pipeline.run(normal()).await.unwrap();
        assert_eq!(stats.fetched, 1);

        let stats = h
            .pipeline
            .run(RunMode::Normal { full_sync: true })
            .await
            .unwrap();
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.matched, 1);
    }

    #[tokio::test]
    async fn concurrent_run_is_refused() {
        let h = harness(FakeCatalog::default(), FakeStore::default());
        let permit = h.pipeline.try_acquire().unwrap();
        assert!(h.pipeline.is_running());
        assert!(matches!(h.pipeline.run(normal()).await, Err(SyncError::Busy)));
        drop(permit);
        assert!(h.pipeline.run(normal()).await.is_ok());
    }

    #[test]
    fn config_reads_overrides_and_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WHISK_MAX_PAGES", "3"),
            ("LARDER_SCHEDULER_ENABLED", "true"),
            ("LARDER_WEB_PORT", "9100"),
            ("WHISK_TOKEN_CACHE", ""),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.whisk_max_pages, 3);
        assert!(config.scheduler_enabled);
        assert_eq!(config.web_port, 9100);
        assert_eq!(config.whisk_token_cache, None);
        assert_eq!(config.whisk_fetch_limit, 100);
        assert_eq!(config.notion_version, "2025-09-03");
        assert_eq!(config.sync_cron, "0 0 6 * * *");
        assert!(config.ensure_credentials().is_err());
        assert_eq!(config.pipeline_options().max_pages, Some(3));
    }
}
