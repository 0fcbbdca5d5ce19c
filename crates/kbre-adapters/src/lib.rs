//! Source adapters: the spreadsheet-maintained region mapping, the KB weekly statistics
//! workbook, and the wide-to-long sheet reshaper.

pub mod kb;
pub mod mapping;
pub mod reshape;

pub use kb::{
    latest_from_reference, DownloadedWorkbook, KbFetchError, KbStatisticsClient, PublishedFile,
    KB_API_BASE,
};
pub use mapping::{
    mapping_from_rows, GoogleSheetsMappingSource, MappingSource, MappingSourceError,
    SheetsCredentials, SpreadsheetLocator,
};
pub use reshape::{
    reshape, reshape_range, reshape_weekly_sheets, ReshapeError, SheetSpec, Workbook,
    KB_WEEKLY_SHEETS,
};

pub const CRATE_NAME: &str = "kbre-adapters";
