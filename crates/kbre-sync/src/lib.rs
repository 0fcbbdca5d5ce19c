//! Sync pipeline orchestration: mapping sync, workbook fetch, reshape, incremental load.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use kbre_adapters::{
    reshape_weekly_sheets, DownloadedWorkbook, GoogleSheetsMappingSource, KbFetchError,
    KbStatisticsClient, MappingSource, SpreadsheetLocator, KB_API_BASE,
};
use kbre_core::LongTable;
use kbre_storage::{HttpClientConfig, HttpFetcher, PgSink, Sink, WorkbookArchive};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

mod loader;

pub use loader::{
    collapse_duplicates, correct_region_keys, join_mapped, merge_long_tables, retain_after,
    sync_region_mapping, IncrementalLoader, LoadOutcome, LoadReport,
};

pub const CRATE_NAME: &str = "kbre-sync";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),
    #[error("setting {key} has invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("credential file {0} does not exist")]
    MissingCredentialFile(PathBuf),
}

#[derive(Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub database_password: String,
    pub credentials_path: PathBuf,
    pub mapping_spreadsheet: String,
    pub mapping_spreadsheet_id: Option<String>,
    pub mapping_worksheet: String,
    pub kb_api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
    pub artifacts_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub max_failed_batches: Option<usize>,
    pub apply_migrations: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("database_url", &self.database_url)
            .field("database_password", &"<redacted>")
            .field("credentials_path", &self.credentials_path)
            .field("mapping_spreadsheet", &self.mapping_spreadsheet)
            .field("mapping_worksheet", &self.mapping_worksheet)
            .field("kb_api_base", &self.kb_api_base)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .finish_non_exhaustive()
    }
}

fn setting(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Destination connection settings. Enough on their own for `migrate`.
#[derive(Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub password: String,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("url", &self.url)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl DatabaseSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            url: setting(&lookup, "DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            password: setting(&lookup, "DATABASE_PASSWORD")
                .ok_or(ConfigError::Missing("DATABASE_PASSWORD"))?,
        })
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. Required settings and the credential file are
    /// checked here, before anything touches the network.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| setting(&lookup, key);
        let parsed = |key: &'static str| -> Result<Option<u64>, ConfigError> {
            get(key)
                .map(|v| v.parse::<u64>().map_err(|_| ConfigError::Invalid { key, value: v }))
                .transpose()
        };

        let DatabaseSettings {
            url: database_url,
            password: database_password,
        } = DatabaseSettings::from_lookup(&lookup)?;
        let credentials_path = get("GOOGLE_CREDENTIALS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("credentials.json"));
        if !credentials_path.exists() {
            return Err(ConfigError::MissingCredentialFile(credentials_path));
        }

        Ok(Self {
            database_url,
            database_password,
            credentials_path,
            mapping_spreadsheet: get("KBRE_MAPPING_SPREADSHEET")
                .unwrap_or_else(|| "KB부동산".to_string()),
            mapping_spreadsheet_id: get("KBRE_MAPPING_SPREADSHEET_ID"),
            mapping_worksheet: get("KBRE_MAPPING_WORKSHEET")
                .unwrap_or_else(|| "지역맵핑".to_string()),
            kb_api_base: get("KBRE_KB_API_BASE").unwrap_or_else(|| KB_API_BASE.to_string()),
            user_agent: get("KBRE_USER_AGENT").unwrap_or_else(|| "Mozilla/5.0".to_string()),
            http_timeout_secs: parsed("KBRE_HTTP_TIMEOUT_SECS")?,
            artifacts_dir: get("KBRE_ARTIFACTS_DIR").map(PathBuf::from),
            reports_dir: get("KBRE_REPORTS_DIR").map(PathBuf::from),
            max_failed_batches: parsed("KBRE_MAX_FAILED_BATCHES")?.map(|n| n as usize),
            apply_migrations: get("KBRE_APPLY_MIGRATIONS").is_some_and(|v| is_truthy(&v)),
            scheduler_enabled: get("KBRE_SCHEDULER_ENABLED").is_some_and(|v| is_truthy(&v)),
            sync_cron: get("KBRE_SYNC_CRON").unwrap_or_else(|| "0 0 9 * * Fri".to_string()),
        })
    }
}

/// The reshaped weekly workbook, one table per metric.
#[derive(Debug, Clone)]
pub struct WeeklyTables {
    pub source_file: Option<String>,
    pub tables: Vec<LongTable>,
}

#[async_trait]
pub trait StatisticsSource: Send + Sync {
    async fn fetch_weekly_tables(&self, today: NaiveDate) -> Result<WeeklyTables, KbFetchError>;
}

/// Downloads the latest KB workbook, optionally archives it, and reshapes its sheets.
pub struct KbWorkbookSource {
    client: KbStatisticsClient,
    archive: Option<WorkbookArchive>,
}

impl KbWorkbookSource {
    pub fn new(client: KbStatisticsClient, archive: Option<WorkbookArchive>) -> Self {
        Self { client, archive }
    }
}

#[async_trait]
impl StatisticsSource for KbWorkbookSource {
    async fn fetch_weekly_tables(&self, today: NaiveDate) -> Result<WeeklyTables, KbFetchError> {
        let (file, bytes, tables) = {
            let DownloadedWorkbook {
                file,
                bytes,
                mut workbook,
            } = self.client.fetch_latest_workbook(today).await?;
            info!("reshaping worksheets");
            let tables = reshape_weekly_sheets(&mut workbook);
            (file, bytes, tables)
        };

        if let Some(archive) = &self.archive {
            match archive.store(Utc::now(), &file.original_file_name, &bytes).await {
                Ok(stored) => info!(
                    path = %stored.absolute_path.display(),
                    deduplicated = stored.deduplicated,
                    "workbook archived"
                ),
                Err(err) => warn!("workbook archive failed: {err:#}"),
            }
        }

        Ok(WeeklyTables {
            source_file: Some(file.original_file_name),
            tables,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Aborted { reason: String },
    Completed(LoadReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mapping_regions: usize,
    pub source_file: Option<String>,
    pub sheet_rows: BTreeMap<String, usize>,
    pub outcome: RunOutcome,
}

impl SyncRunSummary {
    pub fn failed_batches(&self) -> usize {
        match &self.outcome {
            RunOutcome::Completed(LoadReport {
                outcome: LoadOutcome::Uploaded(upload),
                ..
            }) => upload.failed_batches(),
            _ => 0,
        }
    }

    pub fn one_line(&self) -> String {
        match &self.outcome {
            RunOutcome::Aborted { reason } => {
                format!("sync aborted: run_id={} reason={reason}", self.run_id)
            }
            RunOutcome::Completed(report) => {
                let result = match &report.outcome {
                    LoadOutcome::UpToDate => "up-to-date".to_string(),
                    LoadOutcome::NoMatchingRegions => "no-matching-regions".to_string(),
                    LoadOutcome::Uploaded(upload) => format!(
                        "uploaded rows={} batches={} failed_batches={}",
                        upload.uploaded_rows(),
                        upload.total_batches(),
                        upload.failed_batches()
                    ),
                };
                format!(
                    "sync complete: run_id={} regions={} merged={} new={} {result}",
                    self.run_id, self.mapping_regions, report.merged_records, report.candidates
                )
            }
        }
    }

    /// Fails for aborted runs, and for partial uploads above `max_failed_batches` when set.
    pub fn ensure_success(&self, max_failed_batches: Option<usize>) -> Result<()> {
        if let RunOutcome::Aborted { reason } = &self.outcome {
            anyhow::bail!("run {} aborted: {reason}", self.run_id);
        }
        let failed = self.failed_batches();
        if let Some(limit) = max_failed_batches {
            if failed > limit {
                anyhow::bail!("run {}: {failed} batches failed (limit {limit})", self.run_id);
            }
        }
        Ok(())
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    mapping_source: Box<dyn MappingSource>,
    statistics: Box<dyn StatisticsSource>,
    sink: Arc<dyn Sink>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        mapping_source: Box<dyn MappingSource>,
        statistics: Box<dyn StatisticsSource>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            config,
            mapping_source,
            statistics,
            sink,
        }
    }

    /// Wires the production collaborators: Google Sheets, KB Land, Postgres.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout_secs.map(Duration::from_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;

        let sink = PgSink::connect(&config.database_url, &config.database_password)
            .await
            .context("connecting to destination database")?;
        if config.apply_migrations {
            sink.apply_migrations().await.context("applying migrations")?;
        }

        let mapping_source = GoogleSheetsMappingSource::new(
            http.clone(),
            config.credentials_path.clone(),
            SpreadsheetLocator {
                spreadsheet_name: config.mapping_spreadsheet.clone(),
                spreadsheet_id: config.mapping_spreadsheet_id.clone(),
                worksheet: config.mapping_worksheet.clone(),
            },
        );
        let statistics = KbWorkbookSource::new(
            KbStatisticsClient::new(http, config.kb_api_base.clone()),
            config.artifacts_dir.clone().map(WorkbookArchive::new),
        );

        Ok(Self::new(
            config,
            Box::new(mapping_source),
            Box::new(statistics),
            Arc::new(sink),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            mapping_regions: 0,
            source_file: None,
            sheet_rows: BTreeMap::new(),
            outcome: RunOutcome::Aborted {
                reason: String::new(),
            },
        };

        let mapping = sync_region_mapping(self.mapping_source.as_ref(), self.sink.as_ref()).await;
        summary.mapping_regions = mapping.len();
        if mapping.is_empty() {
            error!("no region mapping available; stopping");
            return self.finish(summary, abort("no region mapping available")).await;
        }

        info!("[step 2] downloading KB weekly workbook");
        let weekly = match self.statistics.fetch_weekly_tables(Local::now().date_naive()).await {
            Ok(weekly) => weekly,
            Err(err) => {
                error!("workbook download failed: {err}");
                return self.finish(summary, abort(&format!("no workbook: {err}"))).await;
            }
        };
        summary.source_file = weekly.source_file.clone();
        summary.sheet_rows = weekly
            .tables
            .iter()
            .map(|t| (t.metric.column_name().to_string(), t.len()))
            .collect();

        let report = IncrementalLoader::new(self.sink.as_ref())
            .load(&weekly.tables, &mapping)
            .await;
        self.finish(summary, RunOutcome::Completed(report)).await
    }

    async fn finish(
        &self,
        mut summary: SyncRunSummary,
        outcome: RunOutcome,
    ) -> Result<SyncRunSummary> {
        summary.outcome = outcome;
        summary.finished_at = Utc::now();
        if let Some(dir) = &self.config.reports_dir {
            let path = write_summary(dir, &summary).await?;
            info!(path = %path.display(), "run summary written");
        }
        Ok(summary)
    }
}

fn abort(reason: &str) -> RunOutcome {
    RunOutcome::Aborted {
        reason: reason.to_string(),
    }
}

async fn write_summary(reports_root: &Path, summary: &SyncRunSummary) -> Result<PathBuf> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Registers the pipeline on the configured cron. A firing that overlaps a run still in
/// progress in this process is skipped.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<JobScheduler> {
    let cron = pipeline.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let running = Arc::new(Mutex::new(()));

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous scheduled sync still running; skipping this one");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!("{}", summary.one_line()),
                Err(err) => error!("scheduled sync failed: {err:#}"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn apply_migrations(database: &DatabaseSettings) -> Result<()> {
    let sink = PgSink::connect(&database.url, &database.password)
        .await
        .context("connecting to destination database")?;
    sink.apply_migrations().await.context("applying migrations")?;
    Ok(())
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kbre_adapters::MappingSourceError;
    use kbre_core::{LongRow, MappingSet, Metric, RegionMapping, StatRecord};
    use kbre_storage::MemorySink;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn day(m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, d).unwrap()
    }

    fn config_with(vars: &[(&str, &str)]) -> Result<SyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    fn test_config(reports_dir: Option<PathBuf>) -> SyncConfig {
        SyncConfig {
            database_url: "postgres://localhost/kbre".into(),
            database_password: "secret".into(),
            credentials_path: PathBuf::from("credentials.json"),
            mapping_spreadsheet: "KB부동산".into(),
            mapping_spreadsheet_id: None,
            mapping_worksheet: "지역맵핑".into(),
            kb_api_base: KB_API_BASE.into(),
            user_agent: "Mozilla/5.0".into(),
            http_timeout_secs: None,
            artifacts_dir: None,
            reports_dir,
            max_failed_batches: None,
            apply_migrations: false,
            scheduler_enabled: false,
            sync_cron: "0 0 9 * * Fri".into(),
        }
    }

    struct FixedMapping(Vec<&'static str>);

    #[async_trait]
    impl MappingSource for FixedMapping {
        async fn load_mapping(&self) -> Result<MappingSet, MappingSourceError> {
            Ok(self.0.iter().map(|k| RegionMapping::new(*k)).collect())
        }
    }

    struct FixedTables(Option<Vec<LongTable>>);

    #[async_trait]
    impl StatisticsSource for FixedTables {
        async fn fetch_weekly_tables(
            &self,
            _today: NaiveDate,
        ) -> Result<WeeklyTables, KbFetchError> {
            match &self.0 {
                Some(tables) => Ok(WeeklyTables {
                    source_file: Some("주간시계열.xlsx".into()),
                    tables: tables.clone(),
                }),
                None => Err(KbFetchError::NoPublishedFiles),
            }
        }
    }

    fn sale_index(rows: &[(NaiveDate, &str, f64)]) -> LongTable {
        LongTable {
            metric: Metric::SaleIndex,
            rows: rows
                .iter()
                .map(|(date, key, value)| LongRow {
                    date: *date,
                    kb_region_id: key.to_string(),
                    value: Some(*value),
                })
                .collect(),
        }
    }

    #[test]
    fn required_settings_are_fatal_when_missing() {
        assert_eq!(
            config_with(&[]).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
        assert_eq!(
            config_with(&[("DATABASE_URL", "postgres://db")]).unwrap_err(),
            ConfigError::Missing("DATABASE_PASSWORD")
        );
        assert!(matches!(
            config_with(&[
                ("DATABASE_URL", "postgres://db"),
                ("DATABASE_PASSWORD", "pw"),
                ("GOOGLE_CREDENTIALS_PATH", "/nonexistent/credentials.json"),
            ]),
            Err(ConfigError::MissingCredentialFile(_))
        ));
    }

    #[test]
    fn optional_settings_have_defaults_and_are_validated() {
        let dir = tempdir().expect("tempdir");
        let creds = dir.path().join("credentials.json");
        std::fs::write(&creds, r#"{"access_token": "t"}"#).unwrap();
        let creds = creds.to_string_lossy().to_string();

        let config = config_with(&[
            ("DATABASE_URL", "postgres://db"),
            ("DATABASE_PASSWORD", "pw"),
            ("GOOGLE_CREDENTIALS_PATH", &creds),
            ("KBRE_SCHEDULER_ENABLED", "true"),
            ("KBRE_MAX_FAILED_BATCHES", "2"),
        ])
        .expect("config");
        assert_eq!(config.mapping_spreadsheet, "KB부동산");
        assert_eq!(config.mapping_worksheet, "지역맵핑");
        assert_eq!(config.kb_api_base, KB_API_BASE);
        assert_eq!(config.http_timeout_secs, None);
        assert_eq!(config.max_failed_batches, Some(2));
        assert!(config.scheduler_enabled);
        assert!(!config.apply_migrations);
        assert!(!format!("{config:?}").contains("pw\""));

        let err = config_with(&[
            ("DATABASE_URL", "postgres://db"),
            ("DATABASE_PASSWORD", "pw"),
            ("GOOGLE_CREDENTIALS_PATH", &creds),
            ("KBRE_HTTP_TIMEOUT_SECS", "soon"),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "KBRE_HTTP_TIMEOUT_SECS",
                value: "soon".into()
            }
        );
    }

    #[test]
    fn database_settings_do_not_need_sheet_credentials() {
        let vars = [
            ("DATABASE_URL", "postgres://db"),
            ("DATABASE_PASSWORD", "pw"),
            ("GOOGLE_CREDENTIALS_PATH", "/nonexistent/credentials.json"),
        ];
        let lookup = |key: &str| {
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        };

        let database = DatabaseSettings::from_lookup(lookup).expect("database settings");
        assert_eq!(database.url, "postgres://db");
        assert_eq!(database.password, "pw");
        assert!(!format!("{database:?}").contains("\"pw\""));
        assert!(matches!(
            SyncConfig::from_lookup(lookup),
            Err(ConfigError::MissingCredentialFile(_))
        ));
        assert_eq!(
            DatabaseSettings::from_lookup(|_| None).unwrap_err(),
            ConfigError::Missing("DATABASE_URL")
        );
    }

    #[tokio::test]
    async fn empty_mapping_aborts_before_download() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = SyncPipeline::new(
            test_config(None),
            Box::new(FixedMapping(vec![])),
            Box::new(FixedTables(Some(vec![sale_index(&[(day(6, 17), "서울", 1.0)])]))),
            sink.clone(),
        );
        let summary = pipeline.run_once().await.expect("run");
        assert!(matches!(summary.outcome, RunOutcome::Aborted { .. }));
        assert!(summary.ensure_success(None).is_err());
        assert!(sink.stats().is_empty());
    }

    #[tokio::test]
    async fn missing_workbook_aborts_run() {
        let sink = Arc::new(MemorySink::new());
        let pipeline = SyncPipeline::new(
            test_config(None),
            Box::new(FixedMapping(vec!["서울"])),
            Box::new(FixedTables(None)),
            sink.clone(),
        );
        let summary = pipeline.run_once().await.expect("run");
        assert_eq!(summary.mapping_regions, 1);
        assert!(matches!(
            &summary.outcome,
            RunOutcome::Aborted { reason } if reason.contains("no workbook")
        ));
        assert_eq!(sink.mappings().len(), 1);
    }

    #[tokio::test]
    async fn full_run_writes_summary_report() {
        let dir = tempdir().expect("tempdir");
        let sink = Arc::new(MemorySink::with_stats(vec![StatRecord::new(day(6, 10), "서울")]));
        let pipeline = SyncPipeline::new(
            test_config(Some(dir.path().to_path_buf())),
            Box::new(FixedMapping(vec!["서울", "강원특별자치도"])),
            Box::new(FixedTables(Some(vec![sale_index(&[
                (day(6, 10), "서울", 100.0),
                (day(6, 17), "서울", 101.0),
                (day(6, 17), "강원특별자치도도", 100.0),
                (day(6, 17), "강원특별자치도", 105.0),
                (day(6, 17), "미등록", 1.0),
            ])]))),
            sink.clone(),
        );

        let summary = pipeline.run_once().await.expect("run");
        summary.ensure_success(Some(0)).expect("success");
        assert_eq!(summary.sheet_rows.get("sale_index"), Some(&5));
        let RunOutcome::Completed(report) = &summary.outcome else {
            panic!("expected completed run, got {:?}", summary.outcome);
        };
        assert_eq!(report.high_water_mark, Some(day(6, 10)));
        assert_eq!(report.candidates, 3);
        assert_eq!(report.mapped_records, 2);

        let gangwon = sink
            .stats()
            .into_iter()
            .find(|r| r.kb_region_id == "강원특별자치도")
            .expect("gangwon row");
        assert_eq!(gangwon.sale_index, Some(105.0));

        let report_path = dir
            .path()
            .join(summary.run_id.to_string())
            .join("summary.json");
        let report_json = std::fs::read_to_string(report_path).expect("report");
        let written: serde_json::Value = serde_json::from_str(&report_json).expect("json");
        assert_eq!(written["outcome"]["status"], "completed");
        assert_eq!(written["outcome"]["outcome"]["status"], "uploaded");
    }

    #[test]
    fn failed_batch_threshold_controls_exit_status() {
        let upload = kbre_storage::UploadSummary {
            batches: vec![
                kbre_storage::BatchOutcome {
                    index: 0,
                    rows: 1000,
                    error: None,
                },
                kbre_storage::BatchOutcome {
                    index: 1,
                    rows: 10,
                    error: Some("timeout".into()),
                },
            ],
        };
        let summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            mapping_regions: 1,
            source_file: None,
            sheet_rows: BTreeMap::new(),
            outcome: RunOutcome::Completed(LoadReport {
                merged_records: 1010,
                high_water_mark: None,
                candidates: 1010,
                mapped_records: 1010,
                outcome: LoadOutcome::Uploaded(upload),
            }),
        };
        assert_eq!(summary.failed_batches(), 1);
        assert!(summary.ensure_success(None).is_ok());
        assert!(summary.ensure_success(Some(1)).is_ok());
        assert!(summary.ensure_success(Some(0)).is_err());
        assert!(summary.one_line().contains("failed_batches=1"));
    }
}
