//! Core procurement record model, identity keys and rendering helpers for the PNCP mirror.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "pncp-core";

/// Winner name written when an item has no published award.
pub const NO_RESULT_WINNER: &str = "SEM RESULTADO";

/// Item statuses after which no further change is expected upstream.
pub const FINAL_STATUSES: [&str; 4] = ["Homologado", "Fracassado", "Anulado", "Revogado"];

pub const DETAIL_LINK_BASE: &str = "https://pncp.gov.br/app/editais";

/// Rendering used by downstream consumers of the JSON file. The zone label is fixed text.
const RENDERED_TIMESTAMP_FORMAT: &str = "%a %b %d %Y %H:%M:%S GMT-0300 (Brasilia Standard Time)";

static DETAIL_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/editais/(\d+)/(\d+)/(\d+)/?$").expect("detail link regex is valid")
});

pub fn is_final_status(status: &str) -> bool {
    FINAL_STATUSES.contains(&status.trim())
}

/// JSON number that keeps its original integer/float representation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Amount(pub Number);

impl Amount {
    pub fn zero() -> Self {
        Self(Number::from(0))
    }

    pub fn as_f64(&self) -> f64 {
        self.0.as_f64().unwrap_or(0.0)
    }

    /// Compares by numeric value, so `0` and `0.0` are the same amount.
    pub fn same_value(&self, other: &Amount) -> bool {
        match (self.0.as_i64(), other.0.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        lenient::number(de).map(Self)
    }
}

impl Default for Amount {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<Number> for Amount {
    fn from(value: Number) -> Self {
        Self(value)
    }
}

impl From<i64> for Amount {
    fn from(value: i64) -> Self {
        Self(Number::from(value))
    }
}

impl From<f64> for Amount {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map(Self).unwrap_or_default()
    }
}

/// One flattened contract item, as persisted in the mirror file.
///
/// Field order and JSON names are a compatibility contract with the consumers of the
/// file. Fields the model does not know about are kept in `extra` and written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcurementItemRecord {
    #[serde(rename = "orgao", default, deserialize_with = "lenient::text")]
    pub organization: String,
    #[serde(rename = "ano", default, deserialize_with = "lenient::integer")]
    pub year: Option<i64>,
    #[serde(rename = "compra", default, deserialize_with = "lenient::text")]
    pub contract_number: String,
    #[serde(rename = "modalidade", default, deserialize_with = "lenient::text")]
    pub modality: String,
    #[serde(rename = "objeto", default, deserialize_with = "lenient::text")]
    pub object: String,
    #[serde(rename = "itemNo", default, deserialize_with = "lenient::integer")]
    pub item_number: Option<i64>,
    #[serde(rename = "descricao", default, deserialize_with = "lenient::text")]
    pub item_description: String,
    #[serde(rename = "quantidade", default)]
    pub quantity: Amount,
    #[serde(rename = "unidade", default, deserialize_with = "lenient::text")]
    pub unit: String,
    #[serde(rename = "valorUnitEstimado", default)]
    pub estimated_unit_value: Amount,
    #[serde(rename = "valorTotalEstimado", default)]
    pub estimated_total_value: Amount,
    #[serde(rename = "vencedor", default, deserialize_with = "lenient::text")]
    pub winner_name: String,
    #[serde(rename = "cnpjVencedor", default, deserialize_with = "lenient::text")]
    pub winner_tax_id: String,
    #[serde(rename = "valorUnitHomologado", default)]
    pub awarded_unit_value: Amount,
    #[serde(rename = "valorTotalHomologado", default)]
    pub awarded_total_value: Amount,
    #[serde(rename = "qtdHomologada", default)]
    pub awarded_quantity: Amount,
    #[serde(rename = "situacaoItem", default, deserialize_with = "lenient::text")]
    pub status: String,
    #[serde(rename = "linkPNCP", default, deserialize_with = "lenient::text")]
    pub detail_link: String,
    #[serde(rename = "processo", default, deserialize_with = "lenient::text")]
    pub process_number: String,
    #[serde(rename = "dataPublicacao", default, deserialize_with = "lenient::text")]
    pub published_at: String,
    #[serde(rename = "dataResultado", default, deserialize_with = "lenient::text")]
    pub result_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProcurementItemRecord {
    pub fn identity(&self) -> IdentityKey {
        IdentityKey {
            year: self.year,
            contract_number: self.contract_number.clone(),
            item_number: self.item_number,
        }
    }

    pub fn is_final(&self) -> bool {
        is_final_status(&self.status)
    }

    pub fn contract_key(&self) -> Result<ContractKey, LinkError> {
        ContractKey::from_detail_link(&self.detail_link)
    }

    /// Day of publication, recovered from the rendered `dataPublicacao` text.
    pub fn publication_day(&self) -> Option<NaiveDate> {
        parse_rendered_day(&self.published_at)
    }
}

/// Identity of a record inside the mirror: `(ano, compra, itemNo)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub year: Option<i64>,
    pub contract_number: String,
    pub item_number: Option<i64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("detail link does not carry a contract key: {0:?}")]
    Unrecognized(String),
    #[error("detail link component out of range: {0:?}")]
    OutOfRange(String),
}

/// Addressing unit for the contract, item and result endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContractKey {
    /// Organization tax ID (CNPJ), digits only.
    pub tax_id: String,
    pub year: i64,
    pub sequence: i64,
}

impl ContractKey {
    pub fn new(tax_id: &str, year: i64, sequence: i64) -> Self {
        Self {
            tax_id: digits_only(tax_id),
            year,
            sequence,
        }
    }

    pub fn detail_link(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            DETAIL_LINK_BASE, self.tax_id, self.year, self.sequence
        )
    }

    pub fn from_detail_link(link: &str) -> Result<Self, LinkError> {
        let caps = DETAIL_LINK_RE
            .captures(link.trim())
            .ok_or_else(|| LinkError::Unrecognized(link.to_string()))?;
        let year = caps[2]
            .parse()
            .map_err(|_| LinkError::OutOfRange(link.to_string()))?;
        let sequence = caps[3]
            .parse()
            .map_err(|_| LinkError::OutOfRange(link.to_string()))?;
        Ok(Self {
            tax_id: caps[1].to_string(),
            year,
            sequence,
        })
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tax_id, self.year, self.sequence)
    }
}

/// Inclusive publication-date range, as the upstream `dataInicial`/`dataFinal` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn start_param(&self) -> String {
        compact_day(self.start)
    }

    pub fn end_param(&self) -> String {
        compact_day(self.end)
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start_param(), self.end_param())
    }
}

/// `YYYYMMDD`, the date format of the upstream query parameters.
pub fn compact_day(day: NaiveDate) -> String {
    day.format("%Y%m%d").to_string()
}

pub fn parse_compact_day(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text.trim(), "%Y%m%d").ok()
}

pub fn digits_only(input: &str) -> String {
    input.chars().filter(char::is_ascii_digit).collect()
}

/// Parses an upstream ISO-8601 timestamp into its wall-clock time.
///
/// A trailing `Z` is read as `+00:00`. Offsets are not converted away: the wall-clock
/// time written by the source is what gets rendered.
pub fn parse_source_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let normalized = match raw.strip_suffix('Z') {
        Some(stripped) => format!("{stripped}+00:00"),
        None => raw.to_string(),
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.naive_local());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%dT%H:%M%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(&normalized, fmt) {
            return Some(dt.naive_local());
        }
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(&normalized, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(&normalized, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn render_timestamp(ts: NaiveDateTime) -> String {
    ts.format(RENDERED_TIMESTAMP_FORMAT).to_string()
}

/// Renders an upstream timestamp for the mirror file; unusable input renders as `""`.
pub fn render_source_timestamp(raw: &str) -> String {
    parse_source_timestamp(raw)
        .map(render_timestamp)
        .unwrap_or_default()
}

/// Reads the calendar day back out of a rendered timestamp (`"Mon Dec 01 2025 ..."`).
pub fn parse_rendered_day(rendered: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = rendered.split_whitespace().collect();
    if parts.len() < 4 {
        return None;
    }
    let day = format!("{} {} {}", parts[1], parts[2], parts[3]);
    NaiveDate::parse_from_str(&day, "%b %d %Y").ok()
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::{Number, Value};

    pub fn text<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(de)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => other.to_string(),
        })
    }

    pub fn integer<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
        Ok(match Value::deserialize(de)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn number<'de, D: Deserializer<'de>>(de: D) -> Result<Number, D::Error> {
        Ok(match Value::deserialize(de)? {
            Value::Number(n) => n,
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .unwrap_or_else(|| Number::from(0)),
            _ => Number::from(0),
        })
    }
}
