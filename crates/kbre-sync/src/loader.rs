//! Mapping sync and the incremental statistics load.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use kbre_core::{canonical_region_key, LongTable, MappingSet, RegionMapping, StatRecord};
use kbre_adapters::MappingSource;
use kbre_storage::{upload_stats_in_batches, Sink, UploadSummary, STATS_BATCH_SIZE};
use serde::Serialize;
use tracing::{error, info, warn};

/// Reads the mapping worksheet and upserts every row. Returns an empty set on any failure.
pub async fn sync_region_mapping(source: &dyn MappingSource, sink: &dyn Sink) -> MappingSet {
    info!("[step 1] syncing region mapping");
    let mapping = match source.load_mapping().await {
        Ok(mapping) => mapping,
        Err(err) => {
            error!("mapping sync failed: {err}");
            return MappingSet::new();
        }
    };
    if mapping.is_empty() {
        warn!("mapping worksheet has no keyed rows");
        return mapping;
    }

    let records: Vec<RegionMapping> = mapping.records().cloned().collect();
    match sink.upsert_mapping(&records).await {
        Ok(_) => {
            info!("mapping table synced ({} regions)", records.len());
            mapping
        }
        Err(err) => {
            error!("mapping upsert failed: {err}");
            MappingSet::new()
        }
    }
}

/// Outer join of the per-metric tables on `(date, region)`.
pub fn merge_long_tables(tables: &[LongTable]) -> Vec<StatRecord> {
    let mut merged: BTreeMap<(NaiveDate, String), StatRecord> = BTreeMap::new();
    for table in tables {
        for row in &table.rows {
            merged
                .entry((row.date, row.kb_region_id.clone()))
                .or_insert_with(|| StatRecord::new(row.date, row.kb_region_id.clone()))
                .absorb_metric(table.metric, row.value);
        }
    }
    merged.into_values().collect()
}

pub fn correct_region_keys(mut records: Vec<StatRecord>) -> Vec<StatRecord> {
    for record in &mut records {
        record.kb_region_id = canonical_region_key(&record.kb_region_id);
    }
    records
}

/// One record per `(date, region)`; each metric keeps the largest non-null value.
pub fn collapse_duplicates(records: Vec<StatRecord>) -> Vec<StatRecord> {
    let mut collapsed: BTreeMap<(NaiveDate, String), StatRecord> = BTreeMap::new();
    for record in records {
        match collapsed.get_mut(&(record.date, record.kb_region_id.clone())) {
            Some(existing) => existing.absorb(&record),
            None => {
                collapsed.insert((record.date, record.kb_region_id.clone()), record);
            }
        }
    }
    collapsed.into_values().collect()
}

/// Keeps records strictly newer than `high_water_mark`; everything when it is `None`.
pub fn retain_after(
    records: Vec<StatRecord>,
    high_water_mark: Option<NaiveDate>,
) -> Vec<StatRecord> {
    match high_water_mark {
        Some(latest) => records.into_iter().filter(|r| r.date > latest).collect(),
        None => records,
    }
}

/// Inner join against the mapping keys. Unmapped regions are dropped silently.
pub fn join_mapped(records: Vec<StatRecord>, mapping: &MappingSet) -> Vec<StatRecord> {
    records
        .into_iter()
        .filter(|r| mapping.contains(&r.kb_region_id))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// Nothing newer than the stored high-water-mark.
    UpToDate,
    /// New rows exist but none belong to a mapped region.
    NoMatchingRegions,
    Uploaded(UploadSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub merged_records: usize,
    pub high_water_mark: Option<NaiveDate>,
    pub candidates: usize,
    pub mapped_records: usize,
    pub outcome: LoadOutcome,
}

pub struct IncrementalLoader<'a> {
    sink: &'a dyn Sink,
    batch_size: usize,
}

impl<'a> IncrementalLoader<'a> {
    pub fn new(sink: &'a dyn Sink) -> Self {
        Self {
            sink,
            batch_size: STATS_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub async fn load(&self, tables: &[LongTable], mapping: &MappingSet) -> LoadReport {
        let merged = merge_long_tables(tables);
        let records = collapse_duplicates(correct_region_keys(merged));
        let merged_records = records.len();
        info!("merged {merged_records} records across {} sheets", tables.len());

        let high_water_mark = match self.sink.latest_stat_date().await {
            Ok(latest) => latest,
            Err(err) => {
                warn!("latest stored date lookup failed, loading everything: {err}");
                None
            }
        };
        match high_water_mark {
            Some(latest) => info!("latest stored date: {latest}"),
            None => info!("destination is empty: full load"),
        }

        let candidates = retain_after(records, high_water_mark);
        info!("{} of {merged_records} records are new", candidates.len());
        let mut report = LoadReport {
            merged_records,
            high_water_mark,
            candidates: candidates.len(),
            mapped_records: 0,
            outcome: LoadOutcome::UpToDate,
        };
        if candidates.is_empty() {
            info!("nothing to update; destination is current");
            return report;
        }

        let upload = join_mapped(candidates, mapping);
        report.mapped_records = upload.len();
        if upload.is_empty() {
            warn!("no new rows match a mapped region");
            report.outcome = LoadOutcome::NoMatchingRegions;
            return report;
        }

        info!("[step 3] uploading {} rows", upload.len());
        let summary = upload_stats_in_batches(self.sink, &upload, self.batch_size).await;
        report.outcome = LoadOutcome::Uploaded(summary);
        report
    }
}
