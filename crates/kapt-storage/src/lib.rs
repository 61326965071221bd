//! Bid board page fetching + key/value persistence for the K-apt tracker.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use kapt_core::DateWindow;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, REFERER};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kapt-storage";

pub const SNAPSHOT_KEY: &str = "bids.json";
pub const SELECTION_KEY: &str = "selected-bids.json";
pub const EVENT_LOG_KEY: &str = "logs.json";

pub const EVENT_LOG_CAP: usize = 1000;
pub const BACKUP_RETENTION: usize = 5;

/// Key/value blob storage shared by the sync orchestrator and its readers.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn save(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()>;
    /// Deleting a missing key is not an error.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

pub async fn load_json<T: DeserializeOwned, S: Store + ?Sized>(
    store: &S,
    key: &str,
) -> anyhow::Result<Option<T>> {
    let Some(bytes) = store.load(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes).with_context(|| format!("parsing {key}"))?;
    Ok(Some(value))
}

pub async fn save_json<T: Serialize + ?Sized, S: Store + ?Sized>(
    store: &S,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).with_context(|| format!("serializing {key}"))?;
    store.save(key, &bytes).await
}

/// Append one event to a JSON array log, keeping the newest `cap` entries.
///
/// A log that is missing or not an array starts over.
pub async fn append_event<T, S>(
    store: &S,
    key: &str,
    event: T,
    cap: usize,
) -> anyhow::Result<()>
where
    T: Serialize + DeserializeOwned,
    S: Store + ?Sized,
{
    let mut events: Vec<T> = match load_json::<Vec<T>, S>(store, key).await {
        Ok(Some(events)) => events,
        Ok(None) => Vec::new(),
        Err(err) => {
            warn!(key, error = %err, "event log unreadable; starting a new one");
            Vec::new()
        }
    };
    events.push(event);
    if events.len() > cap {
        let excess = events.len() - cap;
        events.drain(..excess);
    }
    save_json(store, key, &events).await
}

/// JSON files under one data directory, written atomically with rolling backups.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    unversioned: Vec<String>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            unversioned: vec![EVENT_LOG_KEY.to_string()],
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn backup_prefix(key: &str) -> (String, String) {
        let path = Path::new(key);
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| key.to_string());
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        (format!("{stem}.backup."), ext)
    }

    async fn backup_existing(&self, key: &str, current: &Path) -> anyhow::Result<()> {
        let (prefix, ext) = Self::backup_prefix(key);
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let backup = self.root.join(format!("{prefix}{stamp}{ext}"));
        fs::copy(current, &backup)
            .await
            .with_context(|| format!("backing up {} -> {}", current.display(), backup.display()))?;
        self.prune_backups(&prefix, &ext).await
    }

    async fn prune_backups(&self, prefix: &str, ext: &str) -> anyhow::Result<()> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        let mut backups = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(prefix) && name.ends_with(ext) {
                backups.push(name);
            }
        }
        // Stamps sort lexicographically in time order.
        backups.sort();
        backups.reverse();
        for stale in backups.into_iter().skip(BACKUP_RETENTION) {
            let path = self.root.join(&stale);
            if let Err(err) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %err, "failed to remove stale backup");
            }
        }
        Ok(())
    }

    pub async fn backups_for(&self, key: &str) -> anyhow::Result<Vec<PathBuf>> {
        let (prefix, ext) = Self::backup_prefix(key);
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err).with_context(|| format!("listing {}", self.root.display())),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(&prefix) && name.ends_with(&ext) {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(bytes) => {
                debug!(key, bytes = bytes.len(), "loaded");
                Ok(Some(bytes))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Replace `key` atomically via temp-file rename, backing up the previous version.
    async fn save(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating data directory {}", self.root.display()))?;

        let path = self.path_for(key);
        let versioned = !self.unversioned.iter().any(|k| k == key);
        if versioned
            && fs::try_exists(&path)
                .await
                .with_context(|| format!("checking {}", path.display()))?
        {
            if let Err(err) = self.backup_existing(key, &path).await {
                warn!(key, error = %err, "backup failed; saving anyway");
            }
        }

        let temp_path = self.root.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            });
        }
        debug!(key, bytes = bytes.len(), "saved");
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

/// In-process store; state lives as long as the value.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(key).cloned())
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
        self.blobs.lock().await.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.blobs.lock().await.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                    .to_string(),
            ),
        }
    }
}

/// Fixed shape of a bid list request. Only the page and window vary per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub list_url: String,
    pub referer: String,
    pub region_codes: Vec<String>,
    pub category_codes: Vec<String>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            list_url: "https://www.k-apt.go.kr/bid/bidList.do".to_string(),
            referer: "https://www.k-apt.go.kr/".to_string(),
            region_codes: ["11", "28", "41", "42", "43", "44"]
                .into_iter()
                .map(String::from)
                .collect(),
            category_codes: ["02", "03", "04"].into_iter().map(String::from).collect(),
        }
    }
}

impl PageRequest {
    pub fn query_pairs(
        &self,
        page: u32,
        window: &DateWindow,
        cache_buster: i64,
    ) -> Vec<(&'static str, String)> {
        let category = |i: usize| self.category_codes.get(i).cloned().unwrap_or_default();
        vec![
            ("searchBidGb", "bid_gb_1".to_string()),
            ("bidTitle", String::new()),
            ("aptName", String::new()),
            ("searchDateGb", "reg".to_string()),
            ("dateStart", window.start.format("%Y-%m-%d").to_string()),
            ("dateEnd", window.end.format("%Y-%m-%d").to_string()),
            ("dateArea", "1".to_string()),
            ("bidState", String::new()),
            ("codeAuth", String::new()),
            ("codeWay", String::new()),
            ("codeAuthSub", String::new()),
            ("codeSucWay", String::new()),
            ("codeClassifyType1", category(0)),
            ("codeClassifyType2", category(1)),
            ("codeClassifyType3", category(2)),
            ("pageNo", page.to_string()),
            ("type", "4".to_string()),
            ("bidArea", self.region_codes.join("|")),
            ("bidNum", String::new()),
            ("bidNo", String::new()),
            ("dTime", cache_buster.to_string()),
            ("mainKaptCode", String::new()),
            ("aptCode", String::new()),
        ]
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One GET per bid list page. Failures are returned as-is; callers decide on retries.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    request: PageRequest,
}

impl PageFetcher {
    pub fn new(config: HttpClientConfig, request: PageRequest) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("ko-KR,ko;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&request.referer).context("invalid referer header")?,
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, request })
    }

    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    pub async fn fetch_page(&self, page: u32, window: &DateWindow) -> Result<String, FetchError> {
        let query = self
            .request
            .query_pairs(page, window, Utc::now().timestamp_millis());
        let span = info_span!("page_fetch", page, url = %self.request.list_url);

        async {
            let resp = self
                .client
                .get(&self.request.list_url)
                .query(&query)
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "page fetched");
            Ok::<_, FetchError>(body)
        }
        .instrument(span)
        .await
    }
}
