//! In-memory upstream used by the sync tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::NaiveDate;
use pncp_adapters::{ContractPage, ProcurementSource};
use pncp_core::{ContractKey, DateWindow};
use serde_json::{json, Value as JsonValue};

pub const TAX_ID: &str = "13650403000128";

#[derive(Default)]
pub struct StubSource {
    pub pages: HashMap<(u32, u32), ContractPage>,
    pub contracts: HashMap<ContractKey, JsonValue>,
    pub items: HashMap<(ContractKey, i64), JsonValue>,
    pub results: HashMap<(ContractKey, i64), Vec<JsonValue>>,
    pub contract_calls: AtomicUsize,
    pub item_calls: AtomicUsize,
    pub listing_windows: Mutex<Vec<DateWindow>>,
}

impl StubSource {
    pub fn key(sequence: i64) -> ContractKey {
        ContractKey::new(TAX_ID, 2025, sequence)
    }

    pub fn add_contract(&mut self, sequence: i64, published: &str) -> ContractKey {
        let key = Self::key(sequence);
        self.contracts.insert(key.clone(), contract_payload(sequence, published));
        key
    }

    pub fn add_item(&mut self, key: &ContractKey, number: i64, status: &str) {
        self.items.insert((key.clone(), number), item_payload(number, status));
        self.results.insert((key.clone(), number), Vec::new());
    }

    pub fn award(&mut self, key: &ContractKey, number: i64, winner: &str, total: f64) {
        self.results.insert(
            (key.clone(), number),
            vec![json!({
                "nomeRazaoSocialFornecedor": winner,
                "niFornecedor": "44555666000177",
                "valorUnitarioHomologado": total,
                "valorTotalHomologado": total,
                "quantidadeHomologada": 1,
                "dataResultado": "2025-12-18T10:00:00"
            })],
        );
    }

    pub fn set_status(&mut self, key: &ContractKey, number: i64, status: &str) {
        self.items.insert((key.clone(), number), item_payload(number, status));
    }

    pub fn list_page(&mut self, modality: u32, page: u32, sequences: &[i64], total_pages: u64) {
        let contracts = sequences
            .iter()
            .filter_map(|s| self.contracts.get(&Self::key(*s)).cloned())
            .collect();
        self.pages.insert(
            (modality, page),
            ContractPage {
                contracts,
                total_pages,
            },
        );
    }

    pub fn contract_calls(&self) -> usize {
        self.contract_calls.load(Ordering::SeqCst)
    }
}

pub fn contract_payload(sequence: i64, published: &str) -> JsonValue {
    json!({
        "orgaoEntidade": {"cnpj": TAX_ID, "razaoSocial": "MUNICIPIO DE EXEMPLO"},
        "anoCompra": 2025,
        "sequencialCompra": sequence,
        "numeroCompra": format!("900{sequence}"),
        "modalidadeNome": "Pregão - Eletrônico",
        "objetoCompra": "Aquisição de materiais",
        "processo": format!("{sequence}/2025"),
        "dataPublicacaoPncp": published
    })
}

fn published_day(contract: &JsonValue) -> Option<NaiveDate> {
    let text = contract.get("dataPublicacaoPncp")?.as_str()?;
    NaiveDate::parse_from_str(text.get(..10)?, "%Y-%m-%d").ok()
}

pub fn item_payload(number: i64, status: &str) -> JsonValue {
    json!({
        "numeroItem": number,
        "descricao": format!("Item {number}"),
        "quantidade": 10,
        "unidadeMedida": "UN",
        "valorUnitarioEstimado": 5.0,
        "valorTotal": 50.0,
        "situacaoCompraItemNome": status
    })
}

#[async_trait]
impl ProcurementSource for StubSource {
    async fn list_contracts(
        &self,
        window: &DateWindow,
        modality: u32,
        page: u32,
    ) -> Option<ContractPage> {
        self.listing_windows
            .lock()
            .expect("listing windows lock")
            .push(*window);
        let mut listing = self.pages.get(&(modality, page)).cloned()?;
        listing.contracts.retain(|c| {
            published_day(c).is_some_and(|day| day >= window.start && day <= window.end)
        });
        Some(listing)
    }

    async fn contract_detail(&self, key: &ContractKey) -> Option<JsonValue> {
        self.contract_calls.fetch_add(1, Ordering::SeqCst);
        self.contracts.get(key).cloned()
    }

    async fn list_items(&self, key: &ContractKey) -> Vec<JsonValue> {
        let mut items: Vec<(i64, JsonValue)> = self
            .items
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|((_, n), v)| (*n, v.clone()))
            .collect();
        items.sort_by_key(|(n, _)| *n);
        items.into_iter().map(|(_, v)| v).collect()
    }

    async fn item_detail(&self, key: &ContractKey, item_number: i64) -> Option<JsonValue> {
        self.item_calls.fetch_add(1, Ordering::SeqCst);
        self.items.get(&(key.clone(), item_number)).cloned()
    }

    async fn item_results(&self, key: &ContractKey, item_number: i64) -> Option<Vec<JsonValue>> {
        self.results.get(&(key.clone(), item_number)).cloned()
    }
}
