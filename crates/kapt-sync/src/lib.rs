//! Sync orchestration: assemble the catalog, reconcile selections, persist.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kapt_adapters::{AssemblyError, CatalogAssembler, PageSource, SourceProfile};
use kapt_core::{BidSnapshot, SelectionSet, SyncReport};
use kapt_storage::{
    append_event, load_json, save_json, FileStore, HttpClientConfig, PageFetcher, Store,
    EVENT_LOG_CAP, EVENT_LOG_KEY, SELECTION_KEY, SNAPSHOT_KEY,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod reconcile;

pub use reconcile::{reconcile, Reconciliation, ReconciliationIntegrityWarning};

pub const CRATE_NAME: &str = "kapt-sync";

/// 09:00 and 17:00 in Korea (UTC+9), as sec min hour dom mon dow.
const DEFAULT_CRON_1: &str = "0 0 0 * * *";
const DEFAULT_CRON_2: &str = "0 0 8 * * *";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup("KAPT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            scheduler_enabled: lookup("KAPT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: lookup("SYNC_CRON_1").unwrap_or_else(|| DEFAULT_CRON_1.to_string()),
            sync_cron_2: lookup("SYNC_CRON_2").unwrap_or_else(|| DEFAULT_CRON_2.to_string()),
            user_agent: lookup("KAPT_USER_AGENT"),
            http_timeout_secs: lookup("KAPT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            workspace_root: lookup("KAPT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone().or(defaults.user_agent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Scheduled,
}

/// One entry of the persisted sync log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub trigger: Trigger,
    pub success: bool,
    pub report: SyncReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already in progress")]
    Busy,
    #[error("catalog assembly failed: {source}")]
    Assembly {
        #[source]
        source: AssemblyError,
        report: SyncReport,
    },
    #[error("storage failed: {source:#}")]
    Storage {
        #[source]
        source: anyhow::Error,
        report: SyncReport,
    },
}

impl SyncError {
    /// Whatever counts were known when the run stopped.
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Busy => None,
            Self::Assembly { report, .. } | Self::Storage { report, .. } => Some(report),
        }
    }
}

pub trait SyncNotifier: Send + Sync {
    fn sync_succeeded(&self, trigger: Trigger, report: &SyncReport);
    fn sync_failed(&self, trigger: Trigger, error: &SyncError);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl SyncNotifier for LogNotifier {
    fn sync_succeeded(&self, trigger: Trigger, report: &SyncReport) {
        if report.newly_added > 0 {
            info!(
                ?trigger,
                newly_added = report.newly_added,
                total = report.total_bids,
                "new bid notices listed"
            );
        }
    }

    fn sync_failed(&self, trigger: Trigger, error: &SyncError) {
        error!(?trigger, error = %error, "bid sync failed");
    }
}

/// Holds the in-progress flag; clears it when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator<S, P> {
    store: S,
    assembler: CatalogAssembler<P>,
    notifier: Box<dyn SyncNotifier>,
    in_progress: AtomicBool,
    last_completed_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncOrchestrator<FileStore, PageFetcher> {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let profile = SourceProfile::load(&config.workspace_root)?;
        let fetcher = PageFetcher::new(config.http_client_config(), profile.page_request())?;
        let assembler = CatalogAssembler::from_profile(fetcher, &profile)
            .context("building catalog assembler")?;
        Ok(Self::new(FileStore::new(config.data_dir.clone()), assembler))
    }
}

impl<S: Store, P: PageSource> SyncOrchestrator<S, P> {
    pub fn new(store: S, assembler: CatalogAssembler<P>) -> Self {
        Self {
            store,
            assembler,
            notifier: Box::new(LogNotifier),
            in_progress: AtomicBool::new(false),
            last_completed_at: Mutex::new(None),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn SyncNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn last_completed_at(&self) -> Option<DateTime<Utc>> {
        self.last_completed_at.lock().ok().and_then(|guard| *guard)
    }

    /// Returns `SyncError::Busy` at once when another run holds the flag.
    pub async fn run_sync(&self, trigger: Trigger) -> Result<SyncReport, SyncError> {
        let Some(_in_flight) = InFlight::claim(&self.in_progress) else {
            warn!(?trigger, "sync requested while another is running");
            return Err(SyncError::Busy);
        };

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("sync_run", %run_id, ?trigger);
        let outcome = self.sync_once(started_at).instrument(span.clone()).await;

        async {
            match outcome {
                Ok(report) => {
                    let finished_at = Utc::now();
                    if let Ok(mut last) = self.last_completed_at.lock() {
                        *last = Some(finished_at);
                    }
                    info!(?report, "sync complete");
                    self.record_event(SyncEvent {
                        run_id,
                        timestamp: finished_at,
                        trigger,
                        success: true,
                        report,
                        error: None,
                    })
                    .await;
                    self.notifier.sync_succeeded(trigger, &report);
                    Ok(report)
                }
                Err(err) => {
                    self.record_event(SyncEvent {
                        run_id,
                        timestamp: Utc::now(),
                        trigger,
                        success: false,
                        report: err.report().copied().unwrap_or_default(),
                        error: Some(err.to_string()),
                    })
                    .await;
                    self.notifier.sync_failed(trigger, &err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn sync_once(&self, run_at: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        let storage = |source: anyhow::Error, report: SyncReport| SyncError::Storage { source, report };

        let old_snapshot: BidSnapshot = load_json(&self.store, SNAPSHOT_KEY)
            .await
            .map_err(|e| storage(e, SyncReport::default()))?
            .unwrap_or_default();
        let old_selection: SelectionSet = load_json(&self.store, SELECTION_KEY)
            .await
            .map_err(|e| storage(e, SyncReport::default()))?
            .unwrap_or_default();
        info!(
            previous_bids = old_snapshot.len(),
            selected = old_selection.len(),
            "loaded previous state"
        );

        let new_snapshot = self
            .assembler
            .assemble(run_at)
            .await
            .into_snapshot()
            .map_err(|source| SyncError::Assembly {
                source,
                report: SyncReport::default(),
            })?;

        let Reconciliation {
            selection, report, ..
        } = reconcile(&old_snapshot, &new_snapshot, &old_selection);

        let previous_snapshot = self
            .store
            .load(SNAPSHOT_KEY)
            .await
            .map_err(|e| storage(e, report))?;
        save_json(&self.store, SNAPSHOT_KEY, &new_snapshot)
            .await
            .map_err(|e| storage(e, report))?;
        if let Err(err) = save_json(&self.store, SELECTION_KEY, &selection).await {
            self.restore_snapshot(previous_snapshot.as_deref()).await;
            return Err(storage(err, report));
        }
        Ok(report)
    }

    /// Puts the snapshot back the way it was before a half-finished commit.
    async fn restore_snapshot(&self, previous: Option<&[u8]>) {
        let restored = match previous {
            Some(bytes) => self.store.save(SNAPSHOT_KEY, bytes).await,
            None => self.store.remove(SNAPSHOT_KEY).await,
        };
        match restored {
            Ok(()) => warn!("selection save failed; snapshot rolled back"),
            Err(err) => error!(error = %format!("{err:#}"), "snapshot rollback failed"),
        }
    }

    async fn record_event(&self, event: SyncEvent) {
        if let Err(err) = append_event(&self.store, EVENT_LOG_KEY, event, EVENT_LOG_CAP).await {
            warn!(error = %format!("{err:#}"), "could not append sync event");
        }
    }
}

/// Cron jobs calling `run_sync(Trigger::Scheduled)`, or `None` when disabled.
pub async fn maybe_build_scheduler<S, P>(
    orchestrator: Arc<SyncOrchestrator<S, P>>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>>
where
    S: Store + 'static,
    P: PageSource + 'static,
{
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in [&config.sync_cron_1, &config.sync_cron_2] {
        let orchestrator = Arc::clone(&orchestrator);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                match orchestrator.run_sync(Trigger::Scheduled).await {
                    Ok(report) => info!(?report, "scheduled sync finished"),
                    Err(SyncError::Busy) => warn!("scheduled sync skipped; previous run still active"),
                    Err(err) => warn!(error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(cron = %cron, "scheduled bid sync");
    }
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncReport> {
    let config = SyncConfig::from_env();
    let orchestrator = SyncOrchestrator::from_config(&config)?;
    Ok(orchestrator.run_sync(Trigger::Manual).await?)
}

/// What is on disk right now, for status reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    pub total_bids: usize,
    pub selected: usize,
    pub recent_events: Vec<SyncEvent>,
}

pub async fn read_status<S: Store + ?Sized>(store: &S, events: usize) -> Result<SyncStatus> {
    let snapshot: BidSnapshot = load_json(store, SNAPSHOT_KEY).await?.unwrap_or_default();
    let selection: SelectionSet = load_json(store, SELECTION_KEY).await?.unwrap_or_default();
    let log: Vec<SyncEvent> = load_json(store, EVENT_LOG_KEY).await?.unwrap_or_default();
    let skip = log.len().saturating_sub(events);
    Ok(SyncStatus {
        total_bids: snapshot.len(),
        selected: selection.len(),
        recent_events: log.into_iter().skip(skip).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kapt_adapters::AssemblerConfig;
    use kapt_core::{DateWindow, SelectionAnnotation, SelectionEntry};
    use kapt_storage::{FetchError, MemoryStore};
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn fixture(name: &str) -> String {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/kapt");
        std::fs::read_to_string(root.join(name)).unwrap()
    }

    fn outage() -> FetchError {
        FetchError::HttpStatus {
            status: 502,
            url: "https://www.k-apt.go.kr/bid/bidList.do".into(),
        }
    }

    struct Pages(std::sync::Mutex<VecDeque<Result<String, FetchError>>>);

    impl Pages {
        fn new(pages: Vec<Result<String, FetchError>>) -> Self {
            Self(std::sync::Mutex::new(pages.into()))
        }
    }

    #[async_trait]
    impl PageSource for Pages {
        async fn fetch_page(&self, _page: u32, _window: &DateWindow) -> Result<String, FetchError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(fixture("list_page_empty.html")))
        }
    }

    /// Blocks every fetch until released.
    struct Gated {
        release: Notify,
    }

    #[async_trait]
    impl PageSource for Gated {
        async fn fetch_page(&self, _page: u32, _window: &DateWindow) -> Result<String, FetchError> {
            self.release.notified().await;
            Ok(fixture("list_page_partial.html"))
        }
    }

    #[derive(Default)]
    struct Counting {
        succeeded: AtomicUsize,
        failed: AtomicUsize,
    }

    impl SyncNotifier for Arc<Counting> {
        fn sync_succeeded(&self, _trigger: Trigger, _report: &SyncReport) {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }

        fn sync_failed(&self, _trigger: Trigger, _error: &SyncError) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn assembler<P: PageSource>(source: P) -> CatalogAssembler<P> {
        CatalogAssembler::new(
            source,
            SourceProfile::default().row_parser().unwrap(),
            AssemblerConfig {
                max_pages: 10,
                page_delay: Duration::ZERO,
            },
        )
    }

    fn orchestrator(pages: Vec<Result<String, FetchError>>) -> SyncOrchestrator<MemoryStore, Pages> {
        SyncOrchestrator::new(MemoryStore::new(), assembler(Pages::new(pages)))
    }

    async fn events(store: &MemoryStore) -> Vec<SyncEvent> {
        load_json(store, EVENT_LOG_KEY).await.unwrap().unwrap_or_default()
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::from_lookup(|_| None);
        assert_eq!(defaults.data_dir, PathBuf::from("./data"));
        assert!(!defaults.scheduler_enabled);
        assert_eq!(defaults.sync_cron_1, "0 0 0 * * *");
        assert_eq!(defaults.sync_cron_2, "0 0 8 * * *");
        assert_eq!(defaults.http_timeout_secs, 30);
        assert!(defaults.http_client_config().user_agent.is_some());

        let vars: HashMap<&str, &str> = HashMap::from([
            ("KAPT_DATA_DIR", "/var/lib/kapt"),
            ("KAPT_SCHEDULER_ENABLED", "true"),
            ("KAPT_HTTP_TIMEOUT_SECS", "5"),
            ("KAPT_USER_AGENT", "kapt-test"),
        ]);
        let config = SyncConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/kapt"));
        assert!(config.scheduler_enabled);
        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(5));
        assert_eq!(http.user_agent.as_deref(), Some("kapt-test"));
    }

    #[tokio::test]
    async fn successful_sync_persists_snapshot_selection_and_event() {
        let orch = orchestrator(vec![
            Ok(fixture("list_page_full.html")),
            Ok(fixture("list_page_partial.html")),
        ]);
        assert!(orch.last_completed_at().is_none());

        let report = orch.run_sync(Trigger::Manual).await.unwrap();

        assert_eq!(report.total_bids, 13);
        assert_eq!(report.newly_added, 13);
        let snapshot: BidSnapshot = load_json(orch.store(), SNAPSHOT_KEY).await.unwrap().unwrap();
        assert_eq!(snapshot.len(), 13);
        let selection: SelectionSet = load_json(orch.store(), SELECTION_KEY).await.unwrap().unwrap();
        assert!(selection.is_empty());

        let log = events(orch.store()).await;
        assert_eq!(log.len(), 1);
        assert!(log[0].success);
        assert_eq!(log[0].trigger, Trigger::Manual);
        assert_eq!(log[0].report, report);
        assert!(orch.last_completed_at().is_some());
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn selection_survives_a_second_sync() {
        let full = fixture("list_page_full.html");
        let orch = orchestrator(vec![
            Ok(full.clone()),
            Ok(fixture("list_page_empty.html")),
            Ok(full),
        ]);
        orch.run_sync(Trigger::Manual).await.unwrap();

        let snapshot: BidSnapshot = load_json(orch.store(), SNAPSHOT_KEY).await.unwrap().unwrap();
        let mut selection = SelectionSet::default();
        for record in snapshot.records.iter().take(2).rev() {
            selection.insert(SelectionEntry {
                record: record.clone(),
                annotation: SelectionAnnotation {
                    bid_time: Some("10:30".into()),
                    ..SelectionAnnotation::default()
                },
            });
        }
        save_json(orch.store(), SELECTION_KEY, &selection).await.unwrap();

        let report = orch.run_sync(Trigger::Scheduled).await.unwrap();

        assert_eq!(report.newly_added, 0);
        assert_eq!(report.unchanged_in_selection, 2);
        let after: SelectionSet = load_json(orch.store(), SELECTION_KEY).await.unwrap().unwrap();
        assert_eq!(after.check_order, selection.check_order);
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn first_page_failure_leaves_state_untouched() {
        let counting = Arc::new(Counting::default());
        let orch = orchestrator(vec![Err(outage())]).with_notifier(Box::new(Arc::clone(&counting)));

        let seeded_snapshot = r#"[{"id":"1","type":"","method":"","title":"t","aptName":"a","status":"","region":"기타","category":"기타","postDate":null,"deadline":null,"detailLink":"","scrapedAt":"2025-06-01T00:00:00Z"}]"#.as_bytes();
        let seeded_selection = r#"{"selectedBids":{},"checkOrder":[]}"#.as_bytes();
        orch.store().save(SNAPSHOT_KEY, seeded_snapshot).await.unwrap();
        orch.store().save(SELECTION_KEY, seeded_selection).await.unwrap();

        let err = orch.run_sync(Trigger::Manual).await.unwrap_err();

        assert!(matches!(err, SyncError::Assembly { .. }));
        assert_eq!(err.report().map(|r| r.total_bids), Some(0));
        assert_eq!(
            orch.store().load(SNAPSHOT_KEY).await.unwrap().as_deref(),
            Some(seeded_snapshot)
        );
        assert_eq!(
            orch.store().load(SELECTION_KEY).await.unwrap().as_deref(),
            Some(seeded_selection)
        );

        let log = events(orch.store()).await;
        assert_eq!(log.len(), 1);
        assert!(!log[0].success);
        assert!(log[0].error.as_deref().unwrap_or_default().contains("first list page"));
        assert_eq!(counting.failed.load(Ordering::SeqCst), 1);
        assert_eq!(counting.succeeded.load(Ordering::SeqCst), 0);
        assert!(orch.last_completed_at().is_none());
    }

    #[tokio::test]
    async fn flag_is_released_after_failure() {
        let orch = orchestrator(vec![Err(outage()), Ok(fixture("list_page_partial.html"))]);
        assert!(orch.run_sync(Trigger::Manual).await.is_err());
        assert!(!orch.is_running());
        let report = orch.run_sync(Trigger::Manual).await.unwrap();
        assert_eq!(report.total_bids, 3);
    }

    #[tokio::test]
    async fn concurrent_request_is_rejected_as_busy() {
        let orch = Arc::new(SyncOrchestrator::new(
            MemoryStore::new(),
            assembler(Gated {
                release: Notify::new(),
            }),
        ));

        let running = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.run_sync(Trigger::Scheduled).await })
        };
        while !orch.is_running() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(orch.run_sync(Trigger::Manual).await, Err(SyncError::Busy)));

        orch.assembler.source().release.notify_one();
        let report = running.await.unwrap().unwrap();
        assert_eq!(report.total_bids, 3);
        assert!(!orch.is_running());

        // the rejected call left no trace in the log
        assert_eq!(events(orch.store()).await.len(), 1);
    }

    #[tokio::test]
    async fn status_reads_latest_events() {
        let orch = orchestrator(vec![
            Ok(fixture("list_page_partial.html")),
            Err(outage()),
            Ok(fixture("list_page_partial.html")),
        ]);
        orch.run_sync(Trigger::Manual).await.unwrap();
        orch.run_sync(Trigger::Manual).await.unwrap_err();
        orch.run_sync(Trigger::Manual).await.unwrap();

        let status = read_status(orch.store(), 2).await.unwrap();
        assert_eq!(status.total_bids, 3);
        assert_eq!(status.selected, 0);
        assert_eq!(status.recent_events.len(), 2);
        assert!(!status.recent_events[0].success);
        assert!(status.recent_events[1].success);
    }

    /// Memory store whose selection writes always fail.
    #[derive(Default)]
    struct SelectionWriteFails(MemoryStore);

    #[async_trait]
    impl Store for SelectionWriteFails {
        async fn load(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.0.load(key).await
        }

        async fn save(&self, key: &str, bytes: &[u8]) -> anyhow::Result<()> {
            if key == SELECTION_KEY {
                anyhow::bail!("disk full");
            }
            self.0.save(key, bytes).await
        }

        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.0.remove(key).await
        }
    }

    #[tokio::test]
    async fn failed_selection_save_rolls_back_snapshot() {
        let orch = SyncOrchestrator::new(
            SelectionWriteFails::default(),
            assembler(Pages::new(vec![Ok(fixture("list_page_partial.html"))])),
        );
        let seeded = b"[]";
        orch.store().save(SNAPSHOT_KEY, seeded).await.unwrap();

        let err = orch.run_sync(Trigger::Manual).await.unwrap_err();

        assert!(matches!(err, SyncError::Storage { .. }));
        assert_eq!(err.report().map(|r| r.total_bids), Some(3));
        assert_eq!(
            orch.store().load(SNAPSHOT_KEY).await.unwrap().as_deref(),
            Some(&seeded[..])
        );
        assert!(orch.store().load(SELECTION_KEY).await.unwrap().is_none());
        assert!(orch.last_completed_at().is_none());
    }

    #[tokio::test]
    async fn failed_first_commit_leaves_no_snapshot_behind() {
        let orch = SyncOrchestrator::new(
            SelectionWriteFails::default(),
            assembler(Pages::new(vec![Ok(fixture("list_page_partial.html"))])),
        );

        assert!(orch.run_sync(Trigger::Manual).await.is_err());

        assert!(orch.store().load(SNAPSHOT_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn scheduler_is_built_only_when_enabled() {
        let orch = Arc::new(orchestrator(Vec::new()));
        let disabled = SyncConfig::from_lookup(|_| None);
        assert!(maybe_build_scheduler(Arc::clone(&orch), &disabled)
            .await
            .unwrap()
            .is_none());

        let enabled = SyncConfig {
            scheduler_enabled: true,
            ..disabled
        };
        let sched = maybe_build_scheduler(orch, &enabled).await.unwrap();
        let mut sched = sched.expect("scheduler when enabled");
        sched.start().await.unwrap();
        sched.shutdown().await.unwrap();
    }
}
