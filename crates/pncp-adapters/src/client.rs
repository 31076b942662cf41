//! Upstream PNCP API access.
//!
//! Every call degrades to absence (`None` / empty) on failure; callers skip the unit
//! of work instead of aborting the run.

use async_trait::async_trait;
use pncp_core::{ContractKey, DateWindow};
use pncp_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

pub const BASE_URL_CONSULTA: &str = "https://pncp.gov.br/api/consulta";
pub const BASE_URL_INTEGRACAO: &str = "https://pncp.gov.br/api/pncp";

pub const CONTRACT_PAGE_SIZE: u32 = 10;
pub const ITEM_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ContractPage {
    pub contracts: Vec<JsonValue>,
    pub total_pages: u64,
}

impl ContractPage {
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        let obj = value.as_object()?;
        let contracts = obj
            .get("data")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let total_pages = obj
            .get("totalPaginas")
            .and_then(JsonValue::as_u64)
            .unwrap_or(1);
        Some(Self {
            contracts,
            total_pages,
        })
    }
}

/// Items from one page of the item listing, whatever envelope the endpoint used.
pub fn items_from_json(value: &JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Object(obj) => {
            let listed = ["data", "resultado"]
                .iter()
                .filter_map(|k| obj.get(*k).and_then(JsonValue::as_array))
                .find(|items| !items.is_empty());
            match listed {
                Some(items) => items.clone(),
                None if obj.contains_key("numeroItem") => vec![value.clone()],
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

/// Award results; a single object is one result, `null` is none.
pub fn results_from_json(value: &JsonValue) -> Option<Vec<JsonValue>> {
    match value {
        JsonValue::Array(results) => Some(results.clone()),
        JsonValue::Object(_) => Some(vec![value.clone()]),
        JsonValue::Null => Some(Vec::new()),
        _ => None,
    }
}

#[async_trait]
pub trait ProcurementSource: Send + Sync {
    async fn list_contracts(
        &self,
        window: &DateWindow,
        modality: u32,
        page: u32,
    ) -> Option<ContractPage>;

    async fn contract_detail(&self, key: &ContractKey) -> Option<JsonValue>;

    /// All items of a contract, every page.
    async fn list_items(&self, key: &ContractKey) -> Vec<JsonValue>;

    async fn item_detail(&self, key: &ContractKey, item_number: i64) -> Option<JsonValue>;

    /// `Some(vec![])` when no result is published yet, `None` when the lookup failed.
    async fn item_results(&self, key: &ContractKey, item_number: i64) -> Option<Vec<JsonValue>>;
}

#[derive(Debug, Clone)]
pub struct PncpClient {
    http: HttpFetcher,
    tax_id: String,
    consulta_base: String,
    integracao_base: String,
}

impl PncpClient {
    /// `tax_id` filters contract listings to one organization.
    pub fn new(http: HttpFetcher, tax_id: impl Into<String>) -> Self {
        Self {
            http,
            tax_id: tax_id.into(),
            consulta_base: BASE_URL_CONSULTA.to_string(),
            integracao_base: BASE_URL_INTEGRACAO.to_string(),
        }
    }

    pub fn with_base_urls(mut self, consulta: &str, integracao: &str) -> Self {
        self.consulta_base = consulta.trim_end_matches('/').to_string();
        self.integracao_base = integracao.trim_end_matches('/').to_string();
        self
    }

    fn contract_url(&self, key: &ContractKey) -> String {
        format!(
            "{}/v1/orgaos/{}/compras/{}/{}",
            self.integracao_base, key.tax_id, key.year, key.sequence
        )
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let resp = self.http.fetch(url, query).await?;
        match resp.json() {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!(url, error = %err, "upstream returned invalid JSON");
                Ok(JsonValue::Null)
            }
        }
    }

    async fn get_optional(&self, url: &str, query: &[(&str, String)]) -> Option<JsonValue> {
        match self.get_json(url, query).await {
            Ok(JsonValue::Null) => None,
            Ok(value) => Some(value),
            Err(err) => {
                warn!(url, error = %err, "upstream request gave up");
                None
            }
        }
    }
}

#[async_trait]
impl ProcurementSource for PncpClient {
    async fn list_contracts(
        &self,
        window: &DateWindow,
        modality: u32,
        page: u32,
    ) -> Option<ContractPage> {
        let url = format!("{}/v1/contratacoes/publicacao", self.consulta_base);
        let query = [
            ("dataInicial", window.start_param()),
            ("dataFinal", window.end_param()),
            ("pagina", page.to_string()),
            ("tamanhoPagina", CONTRACT_PAGE_SIZE.to_string()),
            ("cnpj", self.tax_id.clone()),
            ("codigoModalidadeContratacao", modality.to_string()),
        ];
        let value = self.get_optional(&url, &query).await?;
        ContractPage::from_json(&value)
    }

    async fn contract_detail(&self, key: &ContractKey) -> Option<JsonValue> {
        self.get_optional(&self.contract_url(key), &[])
            .await
            .filter(JsonValue::is_object)
    }

    async fn list_items(&self, key: &ContractKey) -> Vec<JsonValue> {
        let url = format!("{}/itens", self.contract_url(key));
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [
                ("pagina", page.to_string()),
                ("tamanhoPagina", ITEM_PAGE_SIZE.to_string()),
            ];
            let Some(value) = self.get_optional(&url, &query).await else {
                break;
            };
            let items = items_from_json(&value);
            let count = items.len();
            all.extend(items);
            if count < ITEM_PAGE_SIZE {
                break;
            }
            page += 1;
        }
        debug!(contract = %key, items = all.len(), "listed items");
        all
    }

    async fn item_detail(&self, key: &ContractKey, item_number: i64) -> Option<JsonValue> {
        let url = format!("{}/itens/{}", self.contract_url(key), item_number);
        self.get_optional(&url, &[])
            .await
            .filter(JsonValue::is_object)
    }

    async fn item_results(&self, key: &ContractKey, item_number: i64) -> Option<Vec<JsonValue>> {
        let url = format!(
            "{}/itens/{}/resultados",
            self.contract_url(key),
            item_number
        );
        match self.get_json(&url, &[]).await {
            Ok(value) => results_from_json(&value),
            Err(err) if err.is_not_found() => Some(Vec::new()),
            Err(err) => {
                warn!(url, error = %err, "upstream request gave up");
                None
            }
        }
    }
}
