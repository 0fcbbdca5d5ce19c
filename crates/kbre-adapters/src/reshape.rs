//! Wide weekly worksheets (one row per date, one column per region) to long rows.

use std::collections::HashMap;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Range, Reader, Sheets};
use chrono::NaiveDate;
use kbre_core::{canonical_region_key, LongRow, LongTable, Metric};
use thiserror::Error;
use tracing::{info, warn};

/// Header of the date column when the sheet labels it.
const DATE_HEADER: &str = "구분";
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%Y%m%d"];

#[derive(Debug, Error)]
pub enum ReshapeError {
    #[error("opening workbook: {0}")]
    Open(#[source] calamine::Error),
    #[error("worksheet {0:?} not found")]
    MissingSheet(String),
    #[error("reading worksheet {sheet:?}: {source}")]
    Read {
        sheet: String,
        #[source]
        source: calamine::Error,
    },
    #[error("worksheet {0:?} has no header row")]
    NoHeader(String),
}

/// Layout of one worksheet in the weekly workbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetSpec {
    pub sheet_name: &'static str,
    pub metric: Metric,
    /// Absolute sheet row indices dropped before the header is read.
    pub skip_rows: &'static [usize],
    /// Trailing rows dropped from the data block.
    pub footer_rows: usize,
}

pub const KB_WEEKLY_SHEETS: [SheetSpec; 4] = [
    SheetSpec {
        sheet_name: "3.매매지수",
        metric: Metric::SaleIndex,
        skip_rows: &[0, 2],
        footer_rows: 0,
    },
    SheetSpec {
        sheet_name: "4.전세지수",
        metric: Metric::JeonseIndex,
        skip_rows: &[0, 2],
        footer_rows: 0,
    },
    SheetSpec {
        sheet_name: "1.매매증감",
        metric: Metric::SaleChange,
        skip_rows: &[0, 2],
        footer_rows: 9,
    },
    SheetSpec {
        sheet_name: "2.전세증감",
        metric: Metric::JeonseChange,
        skip_rows: &[0, 2],
        footer_rows: 0,
    },
];

/// A downloaded workbook held in memory.
pub struct Workbook {
    sheets: Sheets<Cursor<Vec<u8>>>,
}

impl Workbook {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ReshapeError> {
        let sheets = open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(ReshapeError::Open)?;
        Ok(Self { sheets })
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names()
    }

    pub fn sheet(&mut self, name: &str) -> Result<Range<Data>, ReshapeError> {
        if !self.sheet_names().iter().any(|n| n == name) {
            return Err(ReshapeError::MissingSheet(name.to_string()));
        }
        self.sheets
            .worksheet_range(name)
            .map_err(|source| ReshapeError::Read {
                sheet: name.to_string(),
                source,
            })
    }
}

/// Reshapes one worksheet. Any failure is logged and yields an empty table.
pub fn reshape(workbook: &mut Workbook, spec: &SheetSpec) -> LongTable {
    let result = workbook
        .sheet(spec.sheet_name)
        .and_then(|range| reshape_range(&range, spec));
    match result {
        Ok(table) => table,
        Err(err) => {
            warn!(sheet = spec.sheet_name, "sheet skipped: {err}");
            LongTable::empty(spec.metric)
        }
    }
}

/// Reshapes every sheet in [`KB_WEEKLY_SHEETS`], in that order.
pub fn reshape_weekly_sheets(workbook: &mut Workbook) -> Vec<LongTable> {
    KB_WEEKLY_SHEETS
        .iter()
        .map(|spec| {
            let table = reshape(workbook, spec);
            info!(sheet = spec.sheet_name, rows = table.len(), "sheet reshaped");
            table
        })
        .collect()
}

pub fn reshape_range(range: &Range<Data>, spec: &SheetSpec) -> Result<LongTable, ReshapeError> {
    // Skip indices are absolute sheet rows; the range begins at the first used row.
    let first_row = range.start().map_or(0, |(row, _)| row as usize);
    let mut rows = range
        .rows()
        .enumerate()
        .filter(|(i, _)| !spec.skip_rows.contains(&(first_row + i)))
        .map(|(_, row)| row);

    let header = rows
        .next()
        .ok_or_else(|| ReshapeError::NoHeader(spec.sheet_name.to_string()))?;
    let mut data: Vec<&[Data]> = rows.collect();
    data.truncate(data.len().saturating_sub(spec.footer_rows));

    let headers = dedupe_headers(header.iter().map(header_text));
    let date_col = headers
        .iter()
        .position(|h| h.as_deref().map(str::trim) == Some(DATE_HEADER))
        .unwrap_or(0);
    let region_cols: Vec<(usize, String)> = headers
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != date_col)
        .filter_map(|(i, h)| h.map(|h| (i, canonical_region_key(&h))))
        .filter(|(_, key)| !key.is_empty())
        .collect();

    let mut table = LongTable::empty(spec.metric);
    for row in data {
        let Some(date) = row.get(date_col).and_then(cell_date) else {
            continue;
        };
        for (col, key) in &region_cols {
            table.rows.push(LongRow {
                date,
                kb_region_id: key.clone(),
                value: row.get(*col).and_then(cell_number),
            });
        }
    }
    Ok(table)
}

fn header_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) if s.trim().is_empty() => None,
        Data::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Repeated names get `.1`, `.2`, ... suffixes so distinct columns never merge silently.
fn dedupe_headers(headers: impl Iterator<Item = Option<String>>) -> Vec<Option<String>> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .map(|h| {
            h.map(|name| {
                let count = seen.entry(name.clone()).or_insert(0);
                let out = if *count == 0 {
                    name
                } else {
                    format!("{name}.{count}")
                };
                *count += 1;
                out
            })
        })
        .collect()
}

fn cell_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(dt) => dt.as_datetime().map(|d| d.date()),
        Data::DateTimeIso(s) | Data::String(s) => parse_date_text(s),
        _ => None,
    }
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let day_part = text
        .trim()
        .split(|c: char| c.is_whitespace() || c == 'T')
        .next()?
        .trim_end_matches('.');
    let year_digits = day_part.bytes().take_while(u8::is_ascii_digit).count();
    if year_digits != 4 && year_digits != 8 {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(day_part, fmt).ok())
}

fn cell_number(cell: &Data) -> Option<f64> {
    let value = match cell {
        Data::Float(f) => *f,
        Data::Int(i) => *i as f64,
        Data::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}
