//! Sync pipeline orchestration: refresh open records, import new ones, save once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use pncp_adapters::{PncpClient, ProcurementSource};
use pncp_core::{parse_compact_day, DateWindow};
use pncp_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, PersistedStore, RefreshCursor};
use serde::Deserialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod import;
pub mod reconcile;
pub mod window;

#[cfg(test)]
mod test_support;

pub use import::{import_window, ImportStats};
pub use reconcile::{append_unique, RefreshEngine, RefreshOptions, RefreshOutcome};
pub use window::{plan_window, WindowPlan, WindowPolicy};

pub const CRATE_NAME: &str = "pncp-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_path: PathBuf,
    pub settings_path: PathBuf,
    pub tax_id: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cooldown_ms: u64,
    pub max_retries: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            store_path: std::env::var("PNCP_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("dados.json")),
            settings_path: std::env::var("PNCP_SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("pncp.yaml")),
            tax_id: std::env::var("PNCP_CNPJ").unwrap_or_else(|_| "13650403000128".to_string()),
            user_agent: std::env::var("PNCP_USER_AGENT")
                .unwrap_or_else(|_| "pncp-mirror/0.1 (+sincronizador)".to_string()),
            http_timeout_secs: env_number("PNCP_HTTP_TIMEOUT_SECS").unwrap_or(30),
            cooldown_ms: env_number("PNCP_COOLDOWN_MS").unwrap_or(500),
            max_retries: env_number("PNCP_MAX_RETRIES").unwrap_or(5),
            scheduler_enabled: std::env::var("PNCP_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
        }
    }

    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            cooldown: Duration::from_millis(self.cooldown_ms),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Tunables read from the optional YAML settings file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub modalities: Vec<u32>,
    pub window: WindowPolicy,
    /// `YYYYMMDD`; first day requested when the mirror has no parsable publication date.
    pub epoch_start: String,
    pub chunk_days: u32,
    pub refresh: RefreshSettings,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            modalities: window::DEFAULT_MODALITIES.to_vec(),
            window: WindowPolicy::default(),
            epoch_start: "20240101".to_string(),
            chunk_days: window::DEFAULT_CHUNK_DAYS,
            refresh: RefreshSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    /// `None` means the current and previous year; an empty list admits every year.
    pub years: Option<Vec<i64>>,
    pub max_records: Option<usize>,
}

impl RefreshSettings {
    pub fn years_for(&self, today: NaiveDate) -> Vec<i64> {
        match &self.years {
            Some(years) => years.clone(),
            None => {
                let year = i64::from(today.year());
                vec![year - 1, year]
            }
        }
    }
}

impl SyncSettings {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no settings file; using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let settings: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        settings.epoch()?;
        Ok(settings)
    }

    pub fn epoch(&self) -> Result<NaiveDate> {
        parse_compact_day(&self.epoch_start)
            .with_context(|| format!("epoch_start {:?} is not a YYYYMMDD date", self.epoch_start))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    RefreshOnly,
    ImportOnly,
}

impl RunMode {
    fn refreshes(self) -> bool {
        matches!(self, Self::Full | Self::RefreshOnly)
    }

    fn imports(self) -> bool {
        matches!(self, Self::Full | Self::ImportOnly)
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub records: usize,
    pub refresh: Option<RefreshOutcome>,
    pub window: Option<DateWindow>,
    pub import: Option<ImportStats>,
    pub appended: usize,
    pub saved: bool,
}

impl SyncRunSummary {
    pub fn refreshed_changes(&self) -> usize {
        self.refresh.map(|r| r.changed).unwrap_or(0)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    settings: SyncSettings,
    source: Box<dyn ProcurementSource>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, settings: SyncSettings) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let source = PncpClient::new(http, config.tax_id.clone());
        Ok(Self {
            config,
            settings,
            source: Box::new(source),
        })
    }

    pub fn with_source(mut self, source: Box<dyn ProcurementSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Computes the next import window from the store on disk, without network access.
    pub async fn plan(&self, today: NaiveDate) -> Result<WindowPlan> {
        let store = PersistedStore::load(&self.config.store_path).await;
        Ok(plan_window(
            store.records(),
            self.settings.window,
            self.settings.epoch()?,
            today,
        ))
    }

    pub async fn run_once(&self, mode: RunMode) -> Result<SyncRunSummary> {
        self.run_once_on(mode, Local::now().date_naive()).await
    }

    pub async fn run_once_on(&self, mode: RunMode, today: NaiveDate) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, ?mode);
        self.run_phases(run_id, mode, today).instrument(span).await
    }

    async fn run_phases(&self, run_id: Uuid, mode: RunMode, today: NaiveDate) -> Result<SyncRunSummary> {
        let store_path = &self.config.store_path;
        let mut store = PersistedStore::load(store_path).await;
        info!(path = %store_path.display(), records = store.records().len(), "store loaded");

        let mut summary = SyncRunSummary {
            run_id,
            mode,
            records: 0,
            refresh: None,
            window: None,
            import: None,
            appended: 0,
            saved: false,
        };

        if mode.refreshes() {
            let cursor = RefreshCursor::load(store_path).await;
            let options = RefreshOptions {
                years: self.settings.refresh.years_for(today),
                max_records: self.settings.refresh.max_records,
                cursor: cursor.offset,
            };
            let outcome = RefreshEngine::new(self.source.as_ref())
                .run(store.records_mut(), &options)
                .await;
            if options.max_records.is_some() {
                let next = RefreshCursor { offset: outcome.next_cursor };
                if let Err(err) = next.save(store_path).await {
                    warn!(error = %err, "could not persist refresh cursor");
                }
            }
            summary.refresh = Some(outcome);
        }

        if mode.imports() {
            match plan_window(store.records(), self.settings.window, self.settings.epoch()?, today) {
                WindowPlan::Fetch(window) => {
                    let (fetched, stats) = import_window(
                        self.source.as_ref(),
                        window,
                        &self.settings.modalities,
                        self.settings.chunk_days,
                    )
                    .await;
                    summary.appended = append_unique(store.records_mut(), fetched);
                    summary.window = Some(window);
                    summary.import = Some(stats);
                    info!(window = %window, appended = summary.appended, "import merged");
                }
                WindowPlan::UpToDate { next_start } => {
                    info!(next_start = %next_start, "mirror is up to date; nothing to import");
                }
            }
        }

        summary.records = store.records().len();
        if summary.refreshed_changes() + summary.appended > 0 {
            store
                .save(store_path)
                .await
                .with_context(|| format!("saving {}", store_path.display()))?;
            summary.saved = true;
            info!(records = summary.records, "store saved");
        } else {
            info!("no changes; store left untouched");
        }
        Ok(summary)
    }

    /// Builds cron jobs that each run one full sync; overlapping triggers are skipped.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let running = Arc::new(Mutex::new(()));
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(&self);
            let running = Arc::clone(&running);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                let running = Arc::clone(&running);
                Box::pin(async move {
                    let Ok(_guard) = running.try_lock_owned() else {
                        warn!("previous sync still running; skipping trigger");
                        return;
                    };
                    match pipeline.run_once(RunMode::Full).await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            changed = summary.refreshed_changes(),
                            appended = summary.appended,
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let settings = SyncSettings::load(&config.settings_path).await?;
    let pipeline = SyncPipeline::new(config, settings)?;
    pipeline.run_once(RunMode::Full).await
}
