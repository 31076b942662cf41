//! Date-window planning for incremental imports.

use chrono::{Duration, NaiveDate};
use pncp_core::{DateWindow, ProcurementItemRecord};
use serde::Deserialize;

pub const DEFAULT_CHUNK_DAYS: u32 = 15;
pub const DEFAULT_LOOKBACK_DAYS: u32 = 3;

/// Procurement modality codes queried on every import.
pub const DEFAULT_MODALITIES: [u32; 12] = [1, 2, 3, 4, 5, 6, 8, 9, 10, 11, 12, 13];

pub fn default_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Start the day after the newest publication date already mirrored.
    #[default]
    HighWaterMark,
    /// Always re-request the trailing `days`; deduplication discards known records.
    Lookback { days: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowPlan {
    Fetch(DateWindow),
    /// Nothing to request; the mirror is current through `next_start - 1`.
    UpToDate { next_start: NaiveDate },
}

pub fn high_water_mark(records: &[ProcurementItemRecord]) -> Option<NaiveDate> {
    records
        .iter()
        .filter_map(ProcurementItemRecord::publication_day)
        .max()
}

pub fn plan_window(
    records: &[ProcurementItemRecord],
    policy: WindowPolicy,
    epoch: NaiveDate,
    today: NaiveDate,
) -> WindowPlan {
    let start = match policy {
        WindowPolicy::HighWaterMark => high_water_mark(records)
            .and_then(|day| day.succ_opt())
            .unwrap_or(epoch),
        WindowPolicy::Lookback { days } => today - Duration::days(i64::from(days)),
    };
    if start > today {
        WindowPlan::UpToDate { next_start: start }
    } else {
        WindowPlan::Fetch(DateWindow { start, end: today })
    }
}

/// Splits an inclusive window into consecutive inclusive blocks of at most `span_days`.
pub fn chunk_window(window: DateWindow, span_days: u32) -> Vec<DateWindow> {
    let span = i64::from(span_days.max(1));
    let mut blocks = Vec::new();
    let mut start = window.start;
    while start <= window.end {
        let end = (start + Duration::days(span - 1)).min(window.end);
        blocks.push(DateWindow { start, end });
        match end.succ_opt() {
            Some(next) => start = next,
            None => break,
        }
    }
    blocks
}
