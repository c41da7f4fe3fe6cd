//! Execution tracking: templates, status records, importance results and artifacts.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, Template};
use crate::importance::ImportanceReport;
use crate::loader::{AssetCatalog, AssetMetadata, LoadError};
use crate::observability::LogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "RUNNING" => Some(Self::Running),
            "FINISHED" => Some(Self::Finished),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub template_id: String,
    #[serde(rename = "processingStepStatus")]
    pub status: ExecutionStatus,
    #[serde(rename = "processingStepLogs")]
    pub logs: Vec<LogEntry>,
    pub updated_at: i64,
}

#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to encode or decode stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stored template is invalid: {0}")]
    Template(#[from] ConfigError),
    #[error("execution {0} not found")]
    UnknownExecution(String),
    #[error("template {template_id} referenced by execution {exec_id} not found")]
    UnknownTemplate { exec_id: String, template_id: String },
    #[error("stored status {0:?} is not recognised")]
    UnknownStatus(String),
    #[error("tracking store lock poisoned")]
    LockPoisoned,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact key {0:?}")]
    InvalidKey(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait TemplateStore {
    fn template_for(&self, exec_id: &str) -> Result<Template, TrackingError>;
}

pub trait StatusSink {
    fn update_status(
        &self,
        exec_id: &str,
        status: ExecutionStatus,
        logs: &[LogEntry],
    ) -> Result<(), TrackingError>;
}

pub trait ImportanceSink {
    fn put_importance(&self, exec_id: &str, report: &ImportanceReport)
        -> Result<(), TrackingError>;
}

pub trait ArtifactSink {
    fn upload(&self, exec_id: &str, key: &str, bytes: &[u8]) -> Result<(), ArtifactError>;
}

/// Read side used by the status API.
pub trait ExecutionReader: Send + Sync + 'static {
    fn execution(&self, exec_id: &str) -> Result<Option<ExecutionRecord>, TrackingError>;
    fn feature_importance(&self, exec_id: &str)
        -> Result<Option<ImportanceReport>, TrackingError>;
}

/// SQLite-backed tracking store shared between the step and the status API.
pub struct SqliteTrackingStore {
    conn: Mutex<Connection>,
}

impl SqliteTrackingStore {
    pub fn open(path: &Path) -> Result<Self, TrackingError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Self::with_schema(conn)
    }

    pub fn open_in_memory() -> Result<Self, TrackingError> {
        Self::with_schema(Connection::open_in_memory()?)
    }

    fn with_schema(conn: Connection) -> Result<Self, TrackingError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS assets (
                ticker TEXT PRIMARY KEY,
                asset_class TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                bucket_key TEXT
            );
            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL,
                status TEXT NOT NULL,
                logs TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS feature_importance (
                exec_id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TrackingError> {
        self.conn.lock().map_err(|_| TrackingError::LockPoisoned)
    }

    pub fn upsert_asset(&self, asset: &AssetMetadata) -> Result<(), TrackingError> {
        self.conn()?.execute(
            "
            INSERT INTO assets (ticker, asset_class, company, bucket_key)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(ticker) DO UPDATE SET
                asset_class = excluded.asset_class,
                company = excluded.company,
                bucket_key = excluded.bucket_key
            ",
            params![
                asset.ticker,
                asset.asset_class,
                asset.company,
                asset.bucket_key
            ],
        )?;
        Ok(())
    }

    /// Imports a JSON array of asset metadata documents.
    pub fn import_catalog_json(&self, raw: &str) -> Result<usize, TrackingError> {
        let assets: Vec<AssetMetadata> = serde_json::from_str(raw)?;
        for asset in &assets {
            self.upsert_asset(asset)?;
        }
        info!(
            component = "tracking",
            event = "tracking.catalog_import",
            assets = assets.len()
        );
        Ok(assets.len())
    }

    /// Stores a template after checking it parses.
    pub fn put_template(&self, template_id: &str, raw: &str) -> Result<(), TrackingError> {
        Template::from_json(raw)?;
        self.conn()?.execute(
            "
            INSERT INTO templates (id, body) VALUES (?1, ?2)
            ON CONFLICT(id) DO UPDATE SET body = excluded.body
            ",
            params![template_id, raw],
        )?;
        Ok(())
    }

    pub fn create_execution(&self, exec_id: &str, template_id: &str) -> Result<(), TrackingError> {
        self.conn()?.execute(
            "
            INSERT INTO executions (id, template_id, status, logs, updated_at)
            VALUES (?1, ?2, ?3, '[]', ?4)
            ",
            params![
                exec_id,
                template_id,
                ExecutionStatus::Pending.as_str(),
                Utc::now().timestamp_millis()
            ],
        )?;
        debug!(
            component = "tracking",
            event = "tracking.execution_created",
            exec_id,
            template_id
        );
        Ok(())
    }
}

impl AssetCatalog for SqliteTrackingStore {
    fn assets(&self) -> Result<Vec<AssetMetadata>, LoadError> {
        let catalog_err = |err: rusqlite::Error| LoadError::Catalog(err.to_string());
        let conn = self
            .conn()
            .map_err(|err| LoadError::Catalog(err.to_string()))?;
        let mut stmt = conn
            .prepare(
                "
                SELECT ticker, asset_class, company, bucket_key
                FROM assets
                ORDER BY rowid ASC
                ",
            )
            .map_err(catalog_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AssetMetadata {
                    ticker: row.get(0)?,
                    asset_class: row.get(1)?,
                    company: row.get(2)?,
                    bucket_key: row.get(3)?,
                })
            })
            .map_err(catalog_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(catalog_err)
    }
}

impl TemplateStore for SqliteTrackingStore {
    fn template_for(&self, exec_id: &str) -> Result<Template, TrackingError> {
        let conn = self.conn()?;
        let template_id: String = conn
            .query_row(
                "SELECT template_id FROM executions WHERE id = ?1",
                params![exec_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| TrackingError::UnknownExecution(exec_id.to_string()))?;
        let body: String = conn
            .query_row(
                "SELECT body FROM templates WHERE id = ?1",
                params![template_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| TrackingError::UnknownTemplate {
                exec_id: exec_id.to_string(),
                template_id: template_id.clone(),
            })?;
        Ok(Template::from_json(&body)?)
    }
}

impl StatusSink for SqliteTrackingStore {
    fn update_status(
        &self,
        exec_id: &str,
        status: ExecutionStatus,
        logs: &[LogEntry],
    ) -> Result<(), TrackingError> {
        let encoded = serde_json::to_string(logs)?;
        let changed = self.conn()?.execute(
            "
            UPDATE executions
            SET status = ?2, logs = ?3, updated_at = ?4
            WHERE id = ?1
            ",
            params![
                exec_id,
                status.as_str(),
                encoded,
                Utc::now().timestamp_millis()
            ],
        )?;
        if changed == 0 {
            return Err(TrackingError::UnknownExecution(exec_id.to_string()));
        }

        info!(
            component = "tracking",
            event = "tracking.status",
            exec_id,
            status = status.as_str(),
            log_entries = logs.len()
        );
        Ok(())
    }
}

impl ImportanceSink for SqliteTrackingStore {
    fn put_importance(
        &self,
        exec_id: &str,
        report: &ImportanceReport,
    ) -> Result<(), TrackingError> {
        let body = serde_json::to_string(report)?;
        self.conn()?.execute(
            "
            INSERT INTO feature_importance (exec_id, body, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(exec_id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            ",
            params![exec_id, body, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }
}

impl ExecutionReader for SqliteTrackingStore {
    fn execution(&self, exec_id: &str) -> Result<Option<ExecutionRecord>, TrackingError> {
        let row: Option<(String, String, String, i64)> = self
            .conn()?
            .query_row(
                "
                SELECT template_id, status, logs, updated_at
                FROM executions
                WHERE id = ?1
                ",
                params![exec_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let Some((template_id, status, logs, updated_at)) = row else {
            return Ok(None);
        };
        let status = ExecutionStatus::parse(&status).ok_or(TrackingError::UnknownStatus(status))?;
        Ok(Some(ExecutionRecord {
            id: exec_id.to_string(),
            template_id,
            status,
            logs: serde_json::from_str(&logs)?,
            updated_at,
        }))
    }

    fn feature_importance(
        &self,
        exec_id: &str,
    ) -> Result<Option<ImportanceReport>, TrackingError> {
        let body: Option<String> = self
            .conn()?
            .query_row(
                "SELECT body FROM feature_importance WHERE exec_id = ?1",
                params![exec_id],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(TrackingError::from)
    }
}

/// Writes artifacts to `{root}/execution/{exec_id}/{key}`.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, exec_id: &str, key: &str) -> Result<PathBuf, ArtifactError> {
        for part in [exec_id, key] {
            let relative = Path::new(part);
            let plain = !part.is_empty()
                && relative
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)));
            if !plain {
                return Err(ArtifactError::InvalidKey(part.to_string()));
            }
        }
        Ok(self.root.join("execution").join(exec_id).join(key))
    }
}

impl ArtifactSink for LocalArtifactStore {
    fn upload(&self, exec_id: &str, key: &str, bytes: &[u8]) -> Result<(), ArtifactError> {
        let path = self.path_for(exec_id, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, bytes)?;
        debug!(
            component = "artifacts",
            event = "artifacts.upload",
            exec_id,
            key,
            bytes = bytes.len(),
            path = %path.display()
        );
        Ok(())
    }
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ArtifactError::InvalidKey(path.display().to_string()))?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
