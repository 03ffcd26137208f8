//! Refresh pipeline, feed resolution and the caller-facing `FeedService`.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use kwatera_adapters::{
    build_extractor, AdapterContext, ExtractionPatterns, ExtractionStrategy, ListingTarget,
    MarkupSourceAdapter, SourceAdapter, OTODOM_BASE_URL, OTODOM_POZNAN_LISTING_URLS,
    OTODOM_SOURCE_ID,
};
use kwatera_core::{Clock, InteractionFlags, Listing, ListingDraft, SystemClock};
use kwatera_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, InteractionStore, ListingStore,
    PageSnapshotStore, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kwatera-sync";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub extraction: ExtractionStrategy,
    #[serde(default)]
    pub patterns: ExtractionPatterns,
    #[serde(default)]
    pub listing_urls: Vec<String>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        Self {
            sources: vec![SourceConfig {
                source_id: OTODOM_SOURCE_ID.to_string(),
                display_name: "Otodom - Poznań rentals".to_string(),
                enabled: true,
                base_url: OTODOM_BASE_URL.to_string(),
                extraction: ExtractionStrategy::default(),
                patterns: ExtractionPatterns::default(),
                listing_urls: OTODOM_POZNAN_LISTING_URLS.iter().map(|u| u.to_string()).collect(),
            }],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// Reads `<root>/sources.yaml`, falling back to the built-in registry when absent.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            info!(path = %path.display(), "no source registry on disk, using built-in sources");
            return Ok(Self::builtin());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled_adapters(&self) -> Result<Vec<Arc<dyn SourceAdapter>>> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| -> Result<Arc<dyn SourceAdapter>> {
                let extractor = build_extractor(s.extraction, &s.base_url, &s.patterns)
                    .with_context(|| format!("building extractor for {}", s.source_id))?;
                Ok(Arc::new(MarkupSourceAdapter::new(
                    s.source_id.clone(),
                    s.listing_urls.clone(),
                    extractor,
                )))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub page_concurrency: usize,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://kwatera.db".to_string(),
            artifacts_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            http_max_retries: BackoffPolicy::default().max_retries,
            page_concurrency: 2,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            artifacts_dir: std::env::var("KWATERA_ARTIFACTS_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: std::env::var("KWATERA_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("KWATERA_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            http_max_retries: env_parse("KWATERA_HTTP_MAX_RETRIES")
                .unwrap_or(defaults.http_max_retries),
            page_concurrency: env_parse("KWATERA_PAGE_CONCURRENCY")
                .unwrap_or(defaults.page_concurrency),
            workspace_root: std::env::var("KWATERA_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            max_in_flight: self.page_concurrency.max(1),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFailure {
    pub source_id: String,
    pub url: String,
    pub reason: String,
}

/// Everything one scrape pass produced, before it touches the store.
#[derive(Debug, Clone, Default)]
pub struct ScrapeBatch {
    pub pages_attempted: usize,
    pub failures: Vec<PageFailure>,
    pub drafts: Vec<ListingDraft>,
}

impl ScrapeBatch {
    pub fn all_pages_failed(&self) -> bool {
        self.pages_attempted > 0 && self.failures.len() == self.pages_attempted
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_attempted: usize,
    pub page_failures: Vec<PageFailure>,
    pub extracted: usize,
    pub latest: Vec<Listing>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no enabled listing sources")]
    NoEnabledSources,
    #[error("all {attempted} listing pages failed")]
    AllPagesFailed {
        attempted: usize,
        failures: Vec<PageFailure>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Collapses repeated external ids: the first sighting fixes the position, the last
/// sighting supplies the field values.
pub fn dedupe_batch(drafts: Vec<ListingDraft>) -> Vec<ListingDraft> {
    let mut position: HashMap<String, usize> = HashMap::with_capacity(drafts.len());
    let mut out: Vec<ListingDraft> = Vec::with_capacity(drafts.len());
    for draft in drafts {
        match position.get(&draft.external_id) {
            Some(&idx) => out[idx] = draft,
            None => {
                position.insert(draft.external_id.clone(), out.len());
                out.push(draft);
            }
        }
    }
    out
}

/// Builds the latest and liked feeds from the listing cache and one user's interactions.
#[derive(Debug, Clone)]
pub struct FeedResolver {
    listings: ListingStore,
    interactions: InteractionStore,
}

impl FeedResolver {
    pub fn new(listings: ListingStore, interactions: InteractionStore) -> Self {
        Self {
            listings,
            interactions,
        }
    }

    pub fn for_user(&self, user_id: Option<String>) -> Self {
        Self {
            listings: self.listings.clone(),
            interactions: self.interactions.scoped(user_id),
        }
    }

    /// Candidates minus anything viewed or liked, in candidate order. Ids without a
    /// cached listing are dropped.
    pub async fn resolve_latest(
        &self,
        candidate_ids: &[String],
    ) -> Result<Vec<Listing>, StoreError> {
        let excluded = self.interactions.excluded_ids().await?;
        let keep: Vec<String> = candidate_ids
            .iter()
            .filter(|id| !excluded.contains(id.as_str()))
            .cloned()
            .collect();
        self.listings.get_by_ids(&keep).await
    }

    /// Liked listings, most recently liked first. Equal or missing `liked_at` keeps the
    /// order in which the interactions were first recorded.
    pub async fn resolve_liked(&self) -> Result<Vec<Listing>, StoreError> {
        let mut liked = self.interactions.get_liked().await?;
        liked.sort_by_key(|i| Reverse(i.liked_at.unwrap_or(0)));
        let ids: Vec<String> = liked.into_iter().map(|i| i.listing_id).collect();
        self.listings.get_by_ids(&ids).await
    }
}

pub struct RefreshPipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    listings: ListingStore,
    snapshots: Option<PageSnapshotStore>,
    page_concurrency: usize,
}

impl RefreshPipeline {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http: HttpFetcher,
        listings: ListingStore,
    ) -> Self {
        Self {
            adapters,
            http: Arc::new(http),
            listings,
            snapshots: None,
            page_concurrency: 2,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Option<PageSnapshotStore>) -> Self {
        self.snapshots = snapshots;
        self
    }

    pub fn with_page_concurrency(mut self, page_concurrency: usize) -> Self {
        self.page_concurrency = page_concurrency.max(1);
        self
    }

    /// Fetches every target with bounded concurrency, keeping target order. A failed page
    /// is recorded and skipped.
    pub async fn scrape(&self, run_id: Uuid) -> ScrapeBatch {
        let ctx = AdapterContext {
            run_id,
            fetched_at: Utc::now(),
        };
        let jobs: Vec<(Arc<dyn SourceAdapter>, ListingTarget)> = self
            .adapters
            .iter()
            .flat_map(|adapter| {
                adapter
                    .listing_targets()
                    .into_iter()
                    .map(move |target| (Arc::clone(adapter), target))
            })
            .collect();

        let mut batch = ScrapeBatch {
            pages_attempted: jobs.len(),
            ..ScrapeBatch::default()
        };

        let fetches: Vec<_> = jobs
            .into_iter()
            .map(|(adapter, target)| {
                let http = Arc::clone(&self.http);
                let ctx = ctx.clone();
                async move {
                    let page = adapter.fetch_listing(&http, &ctx, &target).await;
                    (adapter, target, page)
                }
            })
            .collect();
        let results: Vec<_> = stream::iter(fetches)
            .buffered(self.page_concurrency)
            .collect()
            .await;

        let mut drafts = Vec::new();
        for (adapter, target, page) in results {
            let page = match page {
                Ok(page) => page,
                Err(err) => {
                    warn!(
                        %run_id,
                        source_id = adapter.source_id(),
                        url = %target.url,
                        error = %err,
                        "skipping listing page"
                    );
                    batch.failures.push(PageFailure {
                        source_id: adapter.source_id().to_string(),
                        url: target.url,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            if let Some(store) = &self.snapshots {
                if let Err(err) = store
                    .save_page(page.fetched_at, &page.source_id, page.body.as_bytes())
                    .await
                {
                    warn!(
                        %run_id,
                        url = %page.url,
                        error = %err,
                        "could not snapshot listing page"
                    );
                }
            }

            let parsed = adapter.parse_listing(&page);
            info!(
                %run_id,
                source_id = adapter.source_id(),
                url = %page.url,
                listings = parsed.len(),
                "parsed listing page"
            );
            drafts.extend(parsed);
        }

        batch.drafts = dedupe_batch(drafts);
        batch
    }

    /// Scrape, cache and resolve the latest feed for the fresh batch. Nothing is written
    /// when every page failed.
    pub async fn run_once(&self, resolver: &FeedResolver) -> Result<RefreshOutcome, RefreshError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = self.adapters.len(), "refresh started");

        let batch = self.scrape(run_id).await;
        if batch.pages_attempted == 0 {
            return Err(RefreshError::NoEnabledSources);
        }
        if batch.all_pages_failed() {
            warn!(
                %run_id,
                attempted = batch.pages_attempted,
                "refresh aborted, no page could be fetched"
            );
            return Err(RefreshError::AllPagesFailed {
                attempted: batch.pages_attempted,
                failures: batch.failures,
            });
        }

        self.listings.upsert(&batch.drafts).await?;
        let ids: Vec<String> = batch.drafts.iter().map(|d| d.external_id.clone()).collect();
        let latest = resolver.resolve_latest(&ids).await?;

        let finished_at = Utc::now();
        info!(
            %run_id,
            extracted = batch.drafts.len(),
            latest = latest.len(),
            failed_pages = batch.failures.len(),
            "refresh finished"
        );
        Ok(RefreshOutcome {
            run_id,
            started_at,
            finished_at,
            pages_attempted: batch.pages_attempted,
            page_failures: batch.failures,
            extracted: batch.drafts.len(),
            latest,
        })
    }
}

/// The operations offered to presentation layers. Cheap to clone; `scoped` returns a
/// view bound to another user partition.
#[derive(Clone)]
pub struct FeedService {
    pipeline: Arc<RefreshPipeline>,
    resolver: FeedResolver,
    listings: ListingStore,
    interactions: InteractionStore,
}

impl FeedService {
    pub fn new(
        pipeline: Arc<RefreshPipeline>,
        listings: ListingStore,
        interactions: InteractionStore,
    ) -> Self {
        Self {
            pipeline,
            resolver: FeedResolver::new(listings.clone(), interactions.clone()),
            listings,
            interactions,
        }
    }

    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn from_config_with_clock(
        config: &SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let pool = kwatera_storage::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        kwatera_storage::migrate(&pool).await.context("running migrations")?;

        let registry = SourceRegistry::load(&config.workspace_root).await?;
        let adapters = registry.enabled_adapters()?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let listings = ListingStore::new(pool.clone(), Arc::clone(&clock));
        let interactions = InteractionStore::new(pool, clock);

        let pipeline = RefreshPipeline::new(adapters, http, listings.clone())
            .with_snapshots(config.artifacts_dir.clone().map(PageSnapshotStore::new))
            .with_page_concurrency(config.page_concurrency);
        Ok(Self::new(Arc::new(pipeline), listings, interactions))
    }

    pub fn scoped(&self, user_id: Option<String>) -> Self {
        let interactions = self.interactions.scoped(user_id.clone());
        Self {
            pipeline: Arc::clone(&self.pipeline),
            resolver: self.resolver.for_user(user_id),
            listings: self.listings.clone(),
            interactions,
        }
    }

    pub fn listings(&self) -> &ListingStore {
        &self.listings
    }

    pub async fn scrape_and_refresh(&self) -> Result<RefreshOutcome, RefreshError> {
        self.pipeline.run_once(&self.resolver).await
    }

    pub async fn get_latest(&self, candidate_ids: &[String]) -> Result<Vec<Listing>, StoreError> {
        self.resolver.resolve_latest(candidate_ids).await
    }

    pub async fn get_liked(&self) -> Result<Vec<Listing>, StoreError> {
        self.resolver.resolve_liked().await
    }

    pub async fn mark_viewed(&self, listing_id: &str) -> Result<(), StoreError> {
        self.interactions.mark_viewed(listing_id).await
    }

    pub async fn set_liked(&self, listing_id: &str, liked: bool) -> Result<(), StoreError> {
        self.interactions.set_liked(listing_id, liked).await
    }

    pub async fn get_flags(
        &self,
        listing_ids: &[String],
    ) -> Result<BTreeMap<String, InteractionFlags>, StoreError> {
        self.interactions.get_flags(listing_ids).await
    }
}
