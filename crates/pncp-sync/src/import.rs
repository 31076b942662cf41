//! Incremental import: walks a date window and turns every listed contract item into a record.

use pncp_adapters::{contract_key_of, format_record, ProcurementSource};
use pncp_core::{DateWindow, ProcurementItemRecord};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::window::chunk_window;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub pages: usize,
    pub contracts: usize,
    pub items: usize,
    pub formatted: usize,
    pub skipped: usize,
}

pub async fn import_window(
    source: &dyn ProcurementSource,
    window: DateWindow,
    modalities: &[u32],
    chunk_days: u32,
) -> (Vec<ProcurementItemRecord>, ImportStats) {
    let mut records = Vec::new();
    let mut stats = ImportStats::default();

    for block in chunk_window(window, chunk_days) {
        info!(window = %block, "importing period");
        for &modality in modalities {
            let mut page = 1u32;
            loop {
                let Some(listing) = source.list_contracts(&block, modality, page).await else {
                    break;
                };
                if listing.contracts.is_empty() {
                    break;
                }
                stats.pages += 1;
                for contract in &listing.contracts {
                    records.extend(import_contract(source, contract, &mut stats).await);
                }
                if u64::from(page) >= listing.total_pages {
                    break;
                }
                page += 1;
            }
        }
    }

    info!(
        records = records.len(),
        contracts = stats.contracts,
        skipped = stats.skipped,
        "import finished"
    );
    (records, stats)
}

/// Formats every item of one listed contract, fetching each item's award results.
pub async fn import_contract(
    source: &dyn ProcurementSource,
    contract: &JsonValue,
    stats: &mut ImportStats,
) -> Vec<ProcurementItemRecord> {
    let Some(key) = contract_key_of(contract) else {
        warn!("listed contract has no usable key; skipping");
        stats.skipped += 1;
        return Vec::new();
    };
    stats.contracts += 1;
    debug!(contract = %key, "detailing contract");

    let items = source.list_items(&key).await;
    let mut records = Vec::with_capacity(items.len());
    for item in &items {
        stats.items += 1;
        let results = match item.get("numeroItem").and_then(JsonValue::as_i64) {
            Some(number) => match source.item_results(&key, number).await {
                Some(results) => results,
                None => {
                    warn!(contract = %key, item = number, "award lookup failed; skipping item");
                    stats.skipped += 1;
                    continue;
                }
            },
            None => Vec::new(),
        };
        match format_record(contract, item, &results) {
            Ok(record) => {
                stats.formatted += 1;
                records.push(record);
            }
            Err(err) => {
                warn!(contract = %key, error = %err, "dropping unformattable item");
                stats.skipped += 1;
            }
        }
    }
    records
}
