//! Core domain model for the KB real-estate statistics sync.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "kbre-core";

/// Known misspellings in vendor region names and their canonical form.
pub const REGION_KEY_CORRECTIONS: &[(&str, &str)] = &[("강원특별자치도도", "강원특별자치도")];

/// Normalizes a region key so the same region matches across sheets and the mapping table.
///
/// Idempotent: `canonical_region_key(&canonical_region_key(k)) == canonical_region_key(k)`.
pub fn canonical_region_key(raw: &str) -> String {
    let trimmed = raw.trim();
    REGION_KEY_CORRECTIONS
        .iter()
        .find(|(from, _)| *from == trimmed)
        .map(|(_, to)| *to)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

/// Larger of two optional values; `None` means absent, never zero.
pub fn max_non_null(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// One row of the spreadsheet-maintained region mapping table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionMapping {
    pub kb_region_id: String,
    pub division_1: Option<String>,
    pub division_2: Option<String>,
    pub division_3: Option<String>,
    pub display_name: Option<String>,
    pub view_nation: Option<i32>,
    pub view_capital: Option<i32>,
    pub view_individual: Option<i32>,
    pub view_group_name: Option<String>,
    pub view_order: Option<i32>,
}

impl RegionMapping {
    pub fn new(kb_region_id: impl Into<String>) -> Self {
        Self {
            kb_region_id: kb_region_id.into(),
            division_1: None,
            division_2: None,
            division_3: None,
            display_name: None,
            view_nation: None,
            view_capital: None,
            view_individual: None,
            view_group_name: None,
            view_order: None,
        }
    }
}

/// Region mappings indexed by region key. Later inserts replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingSet {
    by_key: BTreeMap<String, RegionMapping>,
}

impl MappingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a mapping; rows with an empty key are ignored.
    pub fn insert(&mut self, mapping: RegionMapping) -> bool {
        if mapping.kb_region_id.trim().is_empty() {
            return false;
        }
        self.by_key.insert(mapping.kb_region_id.clone(), mapping);
        true
    }

    pub fn contains(&self, kb_region_id: &str) -> bool {
        self.by_key.contains_key(kb_region_id)
    }

    pub fn get(&self, kb_region_id: &str) -> Option<&RegionMapping> {
        self.by_key.get(kb_region_id)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &RegionMapping> {
        self.by_key.values()
    }
}

impl FromIterator<RegionMapping> for MappingSet {
    fn from_iter<I: IntoIterator<Item = RegionMapping>>(iter: I) -> Self {
        let mut set = MappingSet::new();
        for mapping in iter {
            set.insert(mapping);
        }
        set
    }
}

/// The four weekly series published in the vendor workbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    SaleIndex,
    JeonseIndex,
    SaleChange,
    JeonseChange,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::SaleIndex,
        Metric::JeonseIndex,
        Metric::SaleChange,
        Metric::JeonseChange,
    ];

    pub fn column_name(self) -> &'static str {
        match self {
            Metric::SaleIndex => "sale_index",
            Metric::JeonseIndex => "jeonse_index",
            Metric::SaleChange => "sale_change",
            Metric::JeonseChange => "jeonse_change",
        }
    }
}

/// One observation of a single metric, the output of reshaping a wide sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRow {
    pub date: NaiveDate,
    pub kb_region_id: String,
    pub value: Option<f64>,
}

/// All observations of one metric from one worksheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongTable {
    pub metric: Metric,
    pub rows: Vec<LongRow>,
}

impl LongTable {
    pub fn empty(metric: Metric) -> Self {
        Self {
            metric,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A row of `real_estate_stats`, keyed by `(date, kb_region_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatRecord {
    pub date: NaiveDate,
    pub kb_region_id: String,
    pub sale_index: Option<f64>,
    pub jeonse_index: Option<f64>,
    pub sale_change: Option<f64>,
    pub jeonse_change: Option<f64>,
}

impl StatRecord {
    pub fn new(date: NaiveDate, kb_region_id: impl Into<String>) -> Self {
        Self {
            date,
            kb_region_id: kb_region_id.into(),
            sale_index: None,
            jeonse_index: None,
            sale_change: None,
            jeonse_change: None,
        }
    }

    pub fn key(&self) -> (NaiveDate, &str) {
        (self.date, self.kb_region_id.as_str())
    }

    pub fn metric(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::SaleIndex => self.sale_index,
            Metric::JeonseIndex => self.jeonse_index,
            Metric::SaleChange => self.sale_change,
            Metric::JeonseChange => self.jeonse_change,
        }
    }

    fn metric_mut(&mut self, metric: Metric) -> &mut Option<f64> {
        match metric {
            Metric::SaleIndex => &mut self.sale_index,
            Metric::JeonseIndex => &mut self.jeonse_index,
            Metric::SaleChange => &mut self.sale_change,
            Metric::JeonseChange => &mut self.jeonse_change,
        }
    }

    /// Folds `value` into the metric column, keeping the larger non-null value.
    pub fn absorb_metric(&mut self, metric: Metric, value: Option<f64>) {
        let slot = self.metric_mut(metric);
        *slot = max_non_null(*slot, value);
    }

    /// Column-wise max of two records that share a key.
    pub fn absorb(&mut self, other: &StatRecord) {
        for metric in Metric::ALL {
            self.absorb_metric(metric, other.metric(metric));
        }
    }

    pub fn has_any_metric(&self) -> bool {
        Metric::ALL.iter().any(|m| self.metric(*m).is_some())
    }
}
