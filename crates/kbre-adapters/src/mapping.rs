//! Region mapping read from the `지역맵핑` worksheet of the shared spreadsheet.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kbre_core::{MappingSet, RegionMapping};
use kbre_storage::{FetchError, FetchRequest, HttpFetcher};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const SOURCE_ID: &str = "google-sheets";
pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com";

/// Worksheet headers, in sheet order. Only these ten columns are read.
pub const MAPPING_COLUMNS: [&str; 10] = [
    "지역",
    "지역구분1",
    "지역구분2",
    "지역구분3",
    "지역명",
    "전국뷰",
    "수도권뷰",
    "개별뷰",
    "개별뷰상세",
    "개별뷰내순서",
];

const KEY_COLUMN: &str = "지역";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

#[derive(Debug, Error)]
pub enum MappingSourceError {
    #[error("credential file {0} not found")]
    MissingCredentials(PathBuf),
    #[error("reading credential file {path}: {message}")]
    InvalidCredentials { path: PathBuf, message: String },
    #[error("spreadsheet {0:?} not found")]
    SpreadsheetNotFound(String),
    #[error("worksheet has no header row")]
    EmptyWorksheet,
    #[error("worksheet is missing the {0:?} column")]
    MissingKeyColumn(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Anything that can produce the current region mapping.
#[async_trait]
pub trait MappingSource: Send + Sync {
    async fn load_mapping(&self) -> Result<MappingSet, MappingSourceError>;
}

/// Contents of the local credential artifact. Tokens are issued outside this program.
///
/// An `access_token` is short-lived and never refreshed here; a long-running `schedule`
/// process starts failing the mapping step once it expires. An `api_key` does not expire
/// but only reads spreadsheets shared publicly.
#[derive(Debug, Clone, Deserialize)]
pub struct SheetsCredentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl SheetsCredentials {
    pub fn load(path: &Path) -> Result<Self, MappingSourceError> {
        if !path.exists() {
            return Err(MappingSourceError::MissingCredentials(path.to_path_buf()));
        }
        let invalid = |message: String| MappingSourceError::InvalidCredentials {
            path: path.to_path_buf(),
            message,
        };
        let text = fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let creds: SheetsCredentials =
            serde_json::from_str(&text).map_err(|e| invalid(e.to_string()))?;
        if creds.access_token.is_none() && creds.api_key.is_none() {
            return Err(invalid("neither access_token nor api_key is set".into()));
        }
        Ok(creds)
    }
}

#[derive(Debug, Clone)]
pub struct SpreadsheetLocator {
    pub spreadsheet_name: String,
    /// When set, the by-name Drive lookup is skipped.
    pub spreadsheet_id: Option<String>,
    pub worksheet: String,
}

#[derive(Debug, Deserialize)]
struct DriveFileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

pub struct GoogleSheetsMappingSource {
    http: HttpFetcher,
    credentials_path: PathBuf,
    locator: SpreadsheetLocator,
    sheets_base: String,
    drive_base: String,
}

impl GoogleSheetsMappingSource {
    pub fn new(
        http: HttpFetcher,
        credentials_path: impl Into<PathBuf>,
        locator: SpreadsheetLocator,
    ) -> Self {
        Self {
            http,
            credentials_path: credentials_path.into(),
            locator,
            sheets_base: SHEETS_API_BASE.to_string(),
            drive_base: DRIVE_API_BASE.to_string(),
        }
    }

    async fn resolve_spreadsheet_id(
        &self,
        creds: &SheetsCredentials,
    ) -> Result<String, MappingSourceError> {
        if let Some(id) = &self.locator.spreadsheet_id {
            return Ok(id.clone());
        }

        let url = format!("{}/drive/v3/files", self.drive_base);
        let name = self.locator.spreadsheet_name.replace('\'', "\\'");
        let mut request = FetchRequest::get(&url)
            .query(
                "q",
                format!("name = '{name}' and mimeType = '{SPREADSHEET_MIME}' and trashed = false"),
            )
            .query("fields", "files(id)")
            .bearer(creds.access_token.as_deref());
        if let Some(key) = &creds.api_key {
            request = request.query("key", key.clone());
        }

        let listing: DriveFileList = self.http.fetch_json(SOURCE_ID, request).await?;
        listing
            .files
            .into_iter()
            .next()
            .map(|f| f.id)
            .ok_or_else(|| {
                MappingSourceError::SpreadsheetNotFound(self.locator.spreadsheet_name.clone())
            })
    }
}

#[async_trait]
impl MappingSource for GoogleSheetsMappingSource {
    async fn load_mapping(&self) -> Result<MappingSet, MappingSourceError> {
        let creds = SheetsCredentials::load(&self.credentials_path)?;
        let spreadsheet_id = self.resolve_spreadsheet_id(&creds).await?;
        debug!(%spreadsheet_id, worksheet = %self.locator.worksheet, "reading mapping worksheet");

        let range = format!("'{}'!A:J", self.locator.worksheet.replace('\'', "''"));
        let url = format!(
            "{}/v4/spreadsheets/{}/values/{}",
            self.sheets_base, spreadsheet_id, range
        );
        let mut request = FetchRequest::get(&url)
            .query("valueRenderOption", "UNFORMATTED_VALUE")
            .query("majorDimension", "ROWS")
            .bearer(creds.access_token.as_deref());
        if let Some(key) = &creds.api_key {
            request = request.query("key", key.clone());
        }

        let values: ValueRange = self.http.fetch_json(SOURCE_ID, request).await?;
        let mapping = mapping_from_rows(&values.values)?;
        info!(regions = mapping.len(), "mapping worksheet read");
        Ok(mapping)
    }
}

/// Builds the mapping from raw worksheet rows (first row = headers).
///
/// Columns are located by header; blank cells become `None`; rows without a key are dropped.
pub fn mapping_from_rows(rows: &[Vec<JsonValue>]) -> Result<MappingSet, MappingSourceError> {
    let (header, data) = rows.split_first().ok_or(MappingSourceError::EmptyWorksheet)?;
    let columns: Vec<Option<usize>> = MAPPING_COLUMNS
        .iter()
        .map(|name| {
            header
                .iter()
                .take(MAPPING_COLUMNS.len())
                .position(|cell| cell_text(cell).as_deref() == Some(*name))
        })
        .collect();
    if columns[0].is_none() {
        return Err(MappingSourceError::MissingKeyColumn(KEY_COLUMN));
    }

    let mut set = MappingSet::new();
    for row in data {
        let cell = |field: usize| columns[field].and_then(|i| row.get(i));
        let text = |field: usize| cell(field).and_then(cell_text);
        let int = |field: usize| cell(field).and_then(cell_int);

        let Some(key) = text(0) else {
            continue;
        };
        set.insert(RegionMapping {
            kb_region_id: key,
            division_1: text(1),
            division_2: text(2),
            division_3: text(3),
            display_name: text(4),
            view_nation: int(5),
            view_capital: int(6),
            view_individual: int(7),
            view_group_name: text(8),
            view_order: int(9),
        });
    }
    Ok(set)
}

fn cell_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Some(i.to_string()),
            None => n.as_f64().map(|f| {
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            }),
        },
        JsonValue::Bool(b) => Some(if *b { "TRUE" } else { "FALSE" }.to_string()),
        JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

fn cell_int(value: &JsonValue) -> Option<i32> {
    match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .and_then(|i| i32::try_from(i).ok()),
        JsonValue::Bool(b) => Some(i32::from(*b)),
        JsonValue::String(s) => {
            let s = s.trim();
            match s.to_ascii_lowercase().as_str() {
                "true" => Some(1),
                "false" => Some(0),
                _ => s
                    .parse::<i32>()
                    .ok()
                    .or_else(|| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|f| f.fract() == 0.0 && f.abs() <= i32::MAX as f64)
                            .map(|f| f as i32)
                    }),
            }
        }
        _ => None,
    }
}
