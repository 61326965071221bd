//! K-apt source adapter: list page parsing and multi-page catalog assembly.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kapt_core::{cmp_post_date_desc, BidRecord, BidSnapshot, DateWindow};
use kapt_storage::{FetchError, PageFetcher, PageRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

mod parser;

pub use parser::{
    classify_category, clean_text, extract_region, parse_page, parse_timestamp, LinkBase,
    ParseWarning, ParsedPage, RowParser, SkipReason, PAGE_SIZE,
};

pub const CRATE_NAME: &str = "kapt-adapters";
pub const PROFILE_FILE: &str = "kapt.yaml";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Site constants. Every field may be overridden from `kapt.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceProfile {
    pub list_url: String,
    pub referer: String,
    pub origin: String,
    pub detail_base: String,
    pub region_codes: Vec<String>,
    pub category_codes: Vec<String>,
    pub page_size: usize,
    pub max_pages: u32,
    pub page_delay_ms: u64,
}

impl Default for SourceProfile {
    fn default() -> Self {
        let request = PageRequest::default();
        let links = LinkBase::default();
        Self {
            list_url: request.list_url,
            referer: request.referer,
            origin: links.origin,
            detail_base: links.relative_base,
            region_codes: request.region_codes,
            category_codes: request.category_codes,
            page_size: PAGE_SIZE,
            max_pages: 10,
            page_delay_ms: 1000,
        }
    }
}

impl SourceProfile {
    /// Reads `<workspace_root>/kapt.yaml`, falling back to defaults when absent.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(PROFILE_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn page_request(&self) -> PageRequest {
        PageRequest {
            list_url: self.list_url.clone(),
            referer: self.referer.clone(),
            region_codes: self.region_codes.clone(),
            category_codes: self.category_codes.clone(),
        }
    }

    pub fn row_parser(&self) -> Result<RowParser, AdapterError> {
        RowParser::new(
            LinkBase {
                origin: self.origin.clone(),
                relative_base: self.detail_base.clone(),
            },
            self.page_size,
        )
    }

    pub fn assembler_config(&self) -> AssemblerConfig {
        AssemblerConfig {
            max_pages: self.max_pages,
            page_delay: Duration::from_millis(self.page_delay_ms),
        }
    }
}

/// Anything that can hand back the raw HTML of one list page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, page: u32, window: &DateWindow) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for PageFetcher {
    async fn fetch_page(&self, page: u32, window: &DateWindow) -> Result<String, FetchError> {
        PageFetcher::fetch_page(self, page, window).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerConfig {
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_pages: 10,
            page_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug)]
pub enum StopReason {
    /// The page came back with fewer rows than a full page.
    LastPage { page: u32 },
    /// The page had no valid rows at all.
    EmptyPage { page: u32 },
    PageCap,
    FetchFailed { page: u32, error: FetchError },
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("first list page could not be fetched: {source}")]
    FirstPageFailed {
        #[source]
        source: FetchError,
    },
}

#[derive(Debug)]
pub struct CatalogRun {
    pub snapshot: BidSnapshot,
    pub pages_fetched: u32,
    pub raw_records: usize,
    pub stop: StopReason,
}

impl CatalogRun {
    /// Failing on page one means nothing was learned about the board.
    pub fn is_fatal(&self) -> bool {
        matches!(self.stop, StopReason::FetchFailed { page: 1, .. })
    }

    pub fn into_snapshot(self) -> Result<BidSnapshot, AssemblyError> {
        match self.stop {
            StopReason::FetchFailed { page: 1, error } => {
                Err(AssemblyError::FirstPageFailed { source: error })
            }
            _ => Ok(self.snapshot),
        }
    }
}

/// Drop later duplicates of an id, then order newest post date first.
pub fn build_snapshot(records: Vec<BidRecord>) -> BidSnapshot {
    let mut seen = HashSet::with_capacity(records.len());
    let mut unique: Vec<BidRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect();
    unique.sort_by(cmp_post_date_desc);
    BidSnapshot::new(unique)
}

pub struct CatalogAssembler<P> {
    source: P,
    parser: RowParser,
    config: AssemblerConfig,
}

impl<P: PageSource> CatalogAssembler<P> {
    pub fn new(source: P, parser: RowParser, config: AssemblerConfig) -> Self {
        Self {
            source,
            parser,
            config,
        }
    }

    pub fn from_profile(source: P, profile: &SourceProfile) -> Result<Self, AdapterError> {
        Ok(Self::new(
            source,
            profile.row_parser()?,
            profile.assembler_config(),
        ))
    }

    pub fn source(&self) -> &P {
        &self.source
    }

    pub async fn assemble(&self, run_at: DateTime<Utc>) -> CatalogRun {
        let window = DateWindow::month_ending(run_at);
        let max_pages = self.config.max_pages.max(1);
        info!(start = %window.start, end = %window.end, max_pages, "assembling bid catalog");

        let mut accumulated = Vec::new();
        let mut pages_fetched = 0;
        let mut page = 1;

        let stop = loop {
            let html = match self.source.fetch_page(page, &window).await {
                Ok(html) => html,
                Err(error) => {
                    warn!(page, error = %error, "page fetch failed; keeping earlier pages");
                    break StopReason::FetchFailed { page, error };
                }
            };
            pages_fetched += 1;

            let parsed = self.parser.parse(&html, run_at);
            for skipped in &parsed.warnings {
                debug!(page, row = skipped.row, reason = ?skipped.reason, "row skipped");
            }
            if parsed.records.is_empty() {
                info!(page, "no rows on page");
                break StopReason::EmptyPage { page };
            }

            info!(page, rows = parsed.records.len(), "page parsed");
            let has_next = parsed.has_next;
            accumulated.extend(parsed.records);

            if !has_next {
                break StopReason::LastPage { page };
            }
            if page >= max_pages {
                break StopReason::PageCap;
            }
            page += 1;
            tokio::time::sleep(self.config.page_delay).await;
        };

        let raw_records = accumulated.len();
        let snapshot = build_snapshot(accumulated);
        log_tallies(&snapshot);
        info!(
            pages_fetched,
            raw_records,
            unique = snapshot.len(),
            stop = ?stop,
            "catalog assembled"
        );

        CatalogRun {
            snapshot,
            pages_fetched,
            raw_records,
            stop,
        }
    }
}

fn log_tallies(snapshot: &BidSnapshot) {
    let mut by_category: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut by_region: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in &snapshot.records {
        *by_category.entry(record.category.label()).or_default() += 1;
        *by_region.entry(record.region.label()).or_default() += 1;
    }
    info!(?by_category, ?by_region, "catalog tallies");
}
