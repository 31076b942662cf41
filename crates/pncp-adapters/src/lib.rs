//! Upstream source contract, the PNCP API client and the record formatter.

pub mod client;
pub mod format;

pub use client::{
    items_from_json, results_from_json, ContractPage, PncpClient, ProcurementSource,
    BASE_URL_CONSULTA, BASE_URL_INTEGRACAO, CONTRACT_PAGE_SIZE, ITEM_PAGE_SIZE,
};
pub use format::{contract_key_of, format_record, FormatError};

pub const CRATE_NAME: &str = "pncp-adapters";
