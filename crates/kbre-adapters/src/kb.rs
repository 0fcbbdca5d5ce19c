//! KB Land statistics API: resolve the latest weekly time-series workbook and download it.

use chrono::NaiveDate;
use kbre_storage::{FetchError, FetchRequest, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::reshape::{ReshapeError, Workbook};

pub const SOURCE_ID: &str = "kbland";
pub const KB_API_BASE: &str = "https://api.kbland.kr";

/// First week covered by the published series.
pub const SERIES_START_DATE: &str = "2008-01-01";
/// `주월간구분` value selecting the weekly series.
const WEEKLY_FLAG: &str = "0";
const WEEKLY_FILE_DIR: &str = "/kbstar/land/statc/tmsr/weekly/";

#[derive(Debug, Error)]
pub enum KbFetchError {
    #[error("reference endpoint returned no published files")]
    NoPublishedFiles,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Workbook(#[from] ReshapeError),
}

/// One entry of the reference listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedFile {
    /// Server-side file name.
    #[serde(rename = "파일명")]
    pub file_name: String,
    /// Display file name, echoed back on download.
    #[serde(rename = "원본파일명")]
    pub original_file_name: String,
}

#[derive(Debug, Deserialize)]
struct ReferenceResponse {
    #[serde(rename = "dataBody")]
    data_body: Option<ReferenceBody>,
}

#[derive(Debug, Deserialize)]
struct ReferenceBody {
    data: Option<ReferenceData>,
}

#[derive(Debug, Deserialize)]
struct ReferenceData {
    #[serde(rename = "시계열", default)]
    series: Vec<PublishedFile>,
}

/// The most recent published file in a reference response body (entries are newest first).
pub fn latest_from_reference(body: &[u8]) -> Result<Option<PublishedFile>, serde_json::Error> {
    let response: ReferenceResponse = serde_json::from_slice(body)?;
    Ok(response
        .data_body
        .and_then(|b| b.data)
        .and_then(|d| d.series.into_iter().next()))
}

pub struct DownloadedWorkbook {
    pub file: PublishedFile,
    pub bytes: Vec<u8>,
    pub workbook: Workbook,
}

pub struct KbStatisticsClient {
    http: HttpFetcher,
    base_url: String,
}

impl KbStatisticsClient {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn latest_published_file(
        &self,
        today: NaiveDate,
    ) -> Result<PublishedFile, KbFetchError> {
        let url = format!("{}/land-extra/statistics/reference", self.base_url);
        let request = FetchRequest::get(&url)
            .query("주월간구분", WEEKLY_FLAG)
            .query("기준년월시작일", SERIES_START_DATE)
            .query("기준년월종료일", today.format("%Y-%m-%d").to_string());

        let fetched = self.http.fetch_bytes(SOURCE_ID, request).await?;
        latest_from_reference(&fetched.body)
            .map_err(|source| FetchError::Decode {
                url: fetched.final_url,
                source,
            })?
            .ok_or(KbFetchError::NoPublishedFiles)
    }

    pub async fn download(&self, file: &PublishedFile) -> Result<Vec<u8>, KbFetchError> {
        let url = format!("{}/land-extra/statistics/getfiledown", self.base_url);
        let request = FetchRequest::get(&url)
            .query("urlpath", format!("{WEEKLY_FILE_DIR}{}", file.file_name))
            .query("filename", file.original_file_name.clone());
        let fetched = self.http.fetch_bytes(SOURCE_ID, request).await?;
        Ok(fetched.body)
    }

    /// Reference lookup, download, and workbook open. One attempt each.
    pub async fn fetch_latest_workbook(
        &self,
        today: NaiveDate,
    ) -> Result<DownloadedWorkbook, KbFetchError> {
        let file = self.latest_published_file(today).await?;
        info!(file = %file.original_file_name, "target workbook");
        let bytes = self.download(&file).await?;
        let workbook = Workbook::from_bytes(bytes.clone())?;
        Ok(DownloadedWorkbook {
            file,
            bytes,
            workbook,
        })
    }
}
