//! Merging fetched records into the mirror and re-checking records that are still open.

use std::collections::{HashMap, HashSet};

use pncp_adapters::{format_record, ProcurementSource};
use pncp_core::{ContractKey, ProcurementItemRecord};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

/// Appends candidates whose identity is not yet present, keeping fetch order.
///
/// Returns how many records were appended. Within one batch the first occurrence wins.
pub fn append_unique(
    existing: &mut Vec<ProcurementItemRecord>,
    candidates: Vec<ProcurementItemRecord>,
) -> usize {
    let mut seen: HashSet<_> = existing.iter().map(ProcurementItemRecord::identity).collect();
    let before = existing.len();
    for candidate in candidates {
        if seen.insert(candidate.identity()) {
            existing.push(candidate);
        }
    }
    existing.len() - before
}

/// True when one of the fields that signal an award decision moved.
pub fn has_tracked_change(old: &ProcurementItemRecord, new: &ProcurementItemRecord) -> bool {
    old.status != new.status
        || old.winner_name != new.winner_name
        || !old.awarded_total_value.same_value(&new.awarded_total_value)
}

/// Indices of records worth re-checking. An empty year list admits every year.
pub fn refresh_candidates(records: &[ProcurementItemRecord], years: &[i64]) -> Vec<usize> {
    records
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_final())
        .filter(|(_, r)| years.is_empty() || r.year.is_some_and(|y| years.contains(&y)))
        .map(|(i, _)| i)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RefreshOptions {
    pub years: Vec<i64>,
    pub max_records: Option<usize>,
    pub cursor: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub eligible: usize,
    pub checked: usize,
    pub changed: usize,
    pub skipped: usize,
    pub next_cursor: usize,
}

/// Picks which eligible positions to process this pass and where the next pass starts.
fn select_window(eligible: &[usize], max_records: Option<usize>, cursor: usize) -> (Vec<usize>, usize) {
    match max_records {
        Some(cap) if cap < eligible.len() => {
            let start = cursor % eligible.len();
            let picked = eligible
                .iter()
                .cycle()
                .skip(start)
                .take(cap)
                .copied()
                .collect();
            (picked, (start + cap) % eligible.len())
        }
        _ => (eligible.to_vec(), 0),
    }
}

pub struct RefreshEngine<'a> {
    source: &'a dyn ProcurementSource,
}

impl<'a> RefreshEngine<'a> {
    pub fn new(source: &'a dyn ProcurementSource) -> Self {
        Self { source }
    }

    pub async fn run(
        &self,
        records: &mut [ProcurementItemRecord],
        options: &RefreshOptions,
    ) -> RefreshOutcome {
        let eligible = refresh_candidates(records, &options.years);
        let (selected, next_cursor) = select_window(&eligible, options.max_records, options.cursor);
        let mut outcome = RefreshOutcome {
            eligible: eligible.len(),
            next_cursor,
            ..Default::default()
        };
        info!(
            eligible = outcome.eligible,
            selected = selected.len(),
            "refreshing open records"
        );

        let mut contracts: HashMap<ContractKey, Option<JsonValue>> = HashMap::new();
        for index in selected {
            outcome.checked += 1;
            let Some(fresh) = self.fetch_fresh(&records[index], &mut contracts).await else {
                outcome.skipped += 1;
                continue;
            };
            let current = &mut records[index];
            if !has_tracked_change(current, &fresh) {
                continue;
            }
            info!(
                link = %current.detail_link,
                item = ?current.item_number,
                from = %current.status,
                to = %fresh.status,
                winner = %fresh.winner_name,
                "record changed upstream"
            );
            let extra = std::mem::take(&mut current.extra);
            *current = ProcurementItemRecord { extra, ..fresh };
            outcome.changed += 1;
        }

        info!(
            checked = outcome.checked,
            changed = outcome.changed,
            skipped = outcome.skipped,
            "refresh finished"
        );
        outcome
    }

    async fn fetch_fresh(
        &self,
        record: &ProcurementItemRecord,
        contracts: &mut HashMap<ContractKey, Option<JsonValue>>,
    ) -> Option<ProcurementItemRecord> {
        let key = match record.contract_key() {
            Ok(key) => key,
            Err(err) => {
                warn!(link = %record.detail_link, error = %err, "cannot refresh record");
                return None;
            }
        };
        let Some(item_number) = record.item_number else {
            debug!(contract = %key, "record has no item number");
            return None;
        };

        if !contracts.contains_key(&key) {
            let detail = self.source.contract_detail(&key).await;
            contracts.insert(key.clone(), detail);
        }
        let contract = contracts.get(&key).and_then(Option::as_ref)?;

        let Some(item) = self.source.item_detail(&key, item_number).await else {
            debug!(contract = %key, item = item_number, "item detail unavailable");
            return None;
        };
        let Some(results) = self.source.item_results(&key, item_number).await else {
            debug!(contract = %key, item = item_number, "award results unavailable");
            return None;
        };

        match format_record(contract, &item, &results) {
            Ok(fresh) => Some(fresh),
            Err(err) => {
                warn!(contract = %key, item = item_number, error = %err, "refreshed item is unformattable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::import::{import_contract, ImportStats};
    use crate::test_support::StubSource;
    use pncp_core::{Amount, NO_RESULT_WINNER};
    use serde_json::json;

    fn record(year: i64, contract: &str, item: i64, status: &str) -> ProcurementItemRecord {
        ProcurementItemRecord {
            year: Some(year),
            contract_number: contract.to_string(),
            item_number: Some(item),
            status: status.to_string(),
            ..Default::default()
        }
    }

    async fn mirrored(stub: &StubSource, sequences: &[i64]) -> Vec<ProcurementItemRecord> {
        let mut records = Vec::new();
        let mut stats = ImportStats::default();
        for seq in sequences {
            let contract = stub.contracts[&StubSource::key(*seq)].clone();
            records.extend(import_contract(stub, &contract, &mut stats).await);
        }
        records
    }

    #[test]
    fn append_is_idempotent_and_dedups_within_batch() {
        let mut existing = vec![record(2025, "9001", 1, "Em andamento")];
        let batch = vec![
            record(2025, "9001", 1, "Homologado"),
            record(2025, "9001", 2, "Em andamento"),
            record(2025, "9001", 2, "Fracassado"),
            record(2024, "9001", 2, "Em andamento"),
        ];

        assert_eq!(append_unique(&mut existing, batch.clone()), 2);
        assert_eq!(existing.len(), 3);
        assert_eq!(existing[0].status, "Em andamento");
        assert_eq!(existing[1].status, "Em andamento");
        assert_eq!(existing[2].year, Some(2024));

        assert_eq!(append_unique(&mut existing, batch), 0);
        assert_eq!(existing.len(), 3);

        let identities: HashSet<_> = existing.iter().map(ProcurementItemRecord::identity).collect();
        assert_eq!(identities.len(), existing.len());
    }

    #[test]
    fn final_statuses_are_never_candidates() {
        let records = vec![
            record(2025, "1", 1, "Homologado"),
            record(2019, "2", 1, "Revogado"),
            record(2025, "3", 1, "Em andamento"),
            record(2023, "4", 1, "Em andamento"),
        ];
        assert_eq!(refresh_candidates(&records, &[2025, 2026]), vec![2]);
        assert_eq!(refresh_candidates(&records, &[]), vec![2, 3]);
    }

    #[test]
    fn tracked_change_compares_amounts_by_value() {
        let mut old = record(2025, "1", 1, "Em andamento");
        old.awarded_total_value = Amount::from(100_i64);
        let mut new = old.clone();
        new.awarded_total_value = Amount::from(100.0_f64);
        new.item_description = "different text is not tracked".to_string();
        assert!(!has_tracked_change(&old, &new));

        new.winner_name = "FORNECEDOR".to_string();
        assert!(has_tracked_change(&old, &new));
    }

    #[tokio::test]
    async fn refresh_applies_award_then_settles() {
        let mut stub = StubSource::default();
        let key = stub.add_contract(10, "2025-12-02T09:00:00");
        stub.add_item(&key, 1, "Em andamento");
        let mut records = mirrored(&stub, &[10]).await;
        records[0].extra.insert("nota".to_string(), json!("manual"));
        assert_eq!(records[0].winner_name, NO_RESULT_WINNER);

        stub.set_status(&key, 1, "Homologado");
        stub.award(&key, 1, "FORNECEDOR UM", 250.0);

        let engine = RefreshEngine::new(&stub);
        let options = RefreshOptions { years: vec![2025], ..Default::default() };
        let outcome = engine.run(&mut records, &options).await;
        assert_eq!(outcome.changed, 1);
        assert_eq!(records[0].status, "Homologado");
        assert_eq!(records[0].winner_name, "FORNECEDOR UM");
        assert_eq!(records[0].extra.get("nota"), Some(&json!("manual")));

        // the record is final now, so nothing is even checked
        let again = engine.run(&mut records, &options).await;
        assert_eq!(again.checked, 0);
        assert_eq!(again.changed, 0);
    }

    #[tokio::test]
    async fn second_refresh_against_same_upstream_changes_nothing() {
        let mut stub = StubSource::default();
        let key = stub.add_contract(10, "2025-12-02T09:00:00");
        stub.add_item(&key, 1, "Em andamento");
        let mut records = mirrored(&stub, &[10]).await;

        // winner published while the item is still open
        stub.award(&key, 1, "FORNECEDOR UM", 80.0);
        let engine = RefreshEngine::new(&stub);
        let options = RefreshOptions::default();

        let first = engine.run(&mut records, &options).await;
        assert_eq!(first.changed, 1);
        assert_eq!(records[0].status, "Em andamento");
        assert_eq!(records[0].winner_name, "FORNECEDOR UM");
        let after_first = records.clone();

        let second = engine.run(&mut records, &options).await;
        assert_eq!(second.checked, 1);
        assert_eq!(second.changed, 0);
        assert_eq!(records, after_first);
    }

    #[tokio::test]
    async fn unchanged_upstream_is_a_no_op() {
        let mut stub = StubSource::default();
        let key = stub.add_contract(10, "2025-12-02T09:00:00");
        stub.add_item(&key, 1, "Em andamento");
        stub.add_item(&key, 2, "Em andamento");
        let mut records = mirrored(&stub, &[10]).await;
        let before = records.clone();

        let outcome = RefreshEngine::new(&stub)
            .run(&mut records, &RefreshOptions::default())
            .await;
        assert_eq!(outcome.checked, 2);
        assert_eq!(outcome.changed, 0);
        assert_eq!(records, before);
    }

    #[tokio::test]
    async fn contract_detail_is_fetched_once_per_contract() {
        let mut stub = StubSource::default();
        let key = stub.add_contract(10, "2025-12-02T09:00:00");
        for n in 1..=4 {
            stub.add_item(&key, n, "Em andamento");
        }
        let mut records = mirrored(&stub, &[10]).await;

        RefreshEngine::new(&stub)
            .run(&mut records, &RefreshOptions::default())
            .await;
        assert_eq!(stub.contract_calls(), 1);
    }

    #[tokio::test]
    async fn missing_upstream_pieces_leave_records_untouched() {
        let mut stub = StubSource::default();
        let key = stub.add_contract(10, "2025-12-02T09:00:00");
        stub.add_item(&key, 1, "Em andamento");
        stub.add_item(&key, 2, "Em andamento");
        let mut records = mirrored(&stub, &[10]).await;
        records.push(record(2025, "broken", 1, "Em andamento"));
        let before = records.clone();

        stub.items.remove(&(key.clone(), 1));
        stub.set_status(&key, 2, "Fracassado");
        stub.results.remove(&(key.clone(), 2));

        let outcome = RefreshEngine::new(&stub)
            .run(&mut records, &RefreshOptions::default())
            .await;
        assert_eq!(outcome.checked, 3);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(records, before);
    }

    #[tokio::test]
    async fn cap_rotates_through_eligible_records() {
        let mut stub = StubSource::default();
        let key = stub.add_contract(10, "2025-12-02T09:00:00");
        for n in 1..=5 {
            stub.add_item(&key, n, "Em andamento");
        }
        let mut records = mirrored(&stub, &[10]).await;
        let engine = RefreshEngine::new(&stub);

        let first = engine
            .run(&mut records, &RefreshOptions { max_records: Some(2), ..Default::default() })
            .await;
        assert_eq!((first.eligible, first.checked, first.next_cursor), (5, 2, 2));

        let second = engine
            .run(
                &mut records,
                &RefreshOptions { max_records: Some(2), cursor: 4, ..Default::default() },
            )
            .await;
        assert_eq!(second.next_cursor, 1);
        assert_eq!(stub.item_calls.load(std::sync::atomic::Ordering::SeqCst), 4);

        let (picked, next) = select_window(&[3, 5, 8, 13, 21], Some(2), 4);
        assert_eq!((picked, next), (vec![21, 3], 1));
        let (all, next) = select_window(&[3, 5], Some(10), 7);
        assert_eq!((all, next), (vec![3, 5], 0));
    }
}
