//! Flattens an upstream contract + item + award triple into one mirror record.

use pncp_core::{
    digits_only, render_source_timestamp, Amount, ContractKey, ProcurementItemRecord,
    DETAIL_LINK_BASE, NO_RESULT_WINNER,
};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("contract payload has no `orgaoEntidade` object")]
    MissingOrganization,
    #[error("item payload is not an object")]
    MissingItem,
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

/// Text field; absent or `null` reads as `""`, numbers are written out.
fn json_text(value: &JsonValue, path: &[&str]) -> String {
    match json_at(value, path) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

/// Numeric field; absent, `null` or non-numeric reads as `0`.
fn json_amount(value: &JsonValue, path: &[&str]) -> Amount {
    match json_at(value, path) {
        Some(JsonValue::Number(n)) => Amount::from(n.clone()),
        _ => Amount::zero(),
    }
}

fn json_int(value: &JsonValue, path: &[&str]) -> Option<i64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Contract key carried by a contract payload (`orgaoEntidade.cnpj`, `anoCompra`, `sequencialCompra`).
pub fn contract_key_of(contract: &JsonValue) -> Option<ContractKey> {
    let tax_id = json_text(contract, &["orgaoEntidade", "cnpj"]);
    let year = json_int(contract, &["anoCompra"])?;
    let sequence = json_int(contract, &["sequencialCompra"])?;
    let key = ContractKey::new(&tax_id, year, sequence);
    if key.tax_id.is_empty() {
        None
    } else {
        Some(key)
    }
}

fn detail_link_of(contract: &JsonValue) -> String {
    match contract_key_of(contract) {
        Some(key) => key.detail_link(),
        None => format!(
            "{}/{}/{}/{}",
            DETAIL_LINK_BASE,
            digits_only(&json_text(contract, &["orgaoEntidade", "cnpj"])),
            json_text(contract, &["anoCompra"]),
            json_text(contract, &["sequencialCompra"])
        ),
    }
}

struct Award {
    winner_name: String,
    winner_tax_id: String,
    unit_value: Amount,
    total_value: Amount,
    quantity: Amount,
    result_at: String,
}

impl Award {
    fn none() -> Self {
        Self {
            winner_name: NO_RESULT_WINNER.to_string(),
            winner_tax_id: String::new(),
            unit_value: Amount::zero(),
            total_value: Amount::zero(),
            quantity: Amount::zero(),
            result_at: String::new(),
        }
    }

    // Only the first result is kept; multi-winner items are not modeled.
    fn from_results(results: &[JsonValue]) -> Self {
        let Some(first) = results.first() else {
            return Self::none();
        };
        let winner_name = match json_at(first, &["nomeRazaoSocialFornecedor"]) {
            Some(_) => json_text(first, &["nomeRazaoSocialFornecedor"]),
            None => NO_RESULT_WINNER.to_string(),
        };
        Self {
            winner_name,
            winner_tax_id: json_text(first, &["niFornecedor"]),
            unit_value: json_amount(first, &["valorUnitarioHomologado"]),
            total_value: json_amount(first, &["valorTotalHomologado"]),
            quantity: json_amount(first, &["quantidadeHomologada"]),
            result_at: render_source_timestamp(&json_text(first, &["dataResultado"])),
        }
    }
}

pub fn format_record(
    contract: &JsonValue,
    item: &JsonValue,
    results: &[JsonValue],
) -> Result<ProcurementItemRecord, FormatError> {
    if !json_at(contract, &["orgaoEntidade"]).is_some_and(JsonValue::is_object) {
        return Err(FormatError::MissingOrganization);
    }
    if !item.is_object() {
        return Err(FormatError::MissingItem);
    }

    let award = Award::from_results(results);

    Ok(ProcurementItemRecord {
        organization: json_text(contract, &["orgaoEntidade", "razaoSocial"]),
        year: json_int(contract, &["anoCompra"]),
        contract_number: json_text(contract, &["numeroCompra"]),
        modality: json_text(contract, &["modalidadeNome"]),
        object: json_text(contract, &["objetoCompra"]),
        item_number: json_int(item, &["numeroItem"]),
        item_description: json_text(item, &["descricao"]),
        quantity: json_amount(item, &["quantidade"]),
        unit: json_text(item, &["unidadeMedida"]),
        estimated_unit_value: json_amount(item, &["valorUnitarioEstimado"]),
        estimated_total_value: json_amount(item, &["valorTotal"]),
        winner_name: award.winner_name,
        winner_tax_id: award.winner_tax_id,
        awarded_unit_value: award.unit_value,
        awarded_total_value: award.total_value,
        awarded_quantity: award.quantity,
        status: json_text(item, &["situacaoCompraItemNome"]),
        detail_link: detail_link_of(contract),
        process_number: json_text(contract, &["processo"]),
        published_at: render_source_timestamp(&json_text(contract, &["dataPublicacaoPncp"])),
        result_at: award.result_at,
        extra: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn contract() -> JsonValue {
        json!({
            "orgaoEntidade": {"cnpj": "12.345.678/0001-99", "razaoSocial": "MUNICIPIO DE EXEMPLO"},
            "anoCompra": 2025,
            "sequencialCompra": 42,
            "numeroCompra": "90017",
            "modalidadeNome": "Pregão - Eletrônico",
            "objetoCompra": "Aquisição de material de expediente",
            "processo": "1234/2025",
            "dataPublicacaoPncp": "2025-12-01T10:15:30"
        })
    }

    fn item() -> JsonValue {
        json!({
            "numeroItem": 3,
            "descricao": "Caneta esferográfica azul",
            "quantidade": 500,
            "unidadeMedida": "UN",
            "valorUnitarioEstimado": 1.25,
            "valorTotal": 625.0,
            "situacaoCompraItemNome": "Em andamento"
        })
    }

    #[test]
    fn empty_award_list_renders_sentinel() {
        let record = format_record(&contract(), &item(), &[]).unwrap();
        assert_eq!(record.winner_name, NO_RESULT_WINNER);
        assert_eq!(record.winner_tax_id, "");
        assert_eq!(record.result_at, "");
        assert_eq!(record.awarded_unit_value.as_f64(), 0.0);
        assert_eq!(record.awarded_total_value.as_f64(), 0.0);
        assert_eq!(record.awarded_quantity.as_f64(), 0.0);
        assert_eq!(record.awarded_total_value, Amount::zero());
    }

    #[test]
    fn first_award_populates_winner_fields() {
        let results = vec![
            json!({
                "nomeRazaoSocialFornecedor": "PAPELARIA CENTRAL LTDA",
                "niFornecedor": "11222333000144",
                "valorUnitarioHomologado": 1.1,
                "valorTotalHomologado": 550.0,
                "quantidadeHomologada": 500,
                "dataResultado": "2025-12-15T14:00:00Z"
            }),
            json!({"nomeRazaoSocialFornecedor": "SEGUNDA COLOCADA"}),
        ];
        let record = format_record(&contract(), &item(), &results).unwrap();
        assert_eq!(record.winner_name, "PAPELARIA CENTRAL LTDA");
        assert_eq!(record.winner_tax_id, "11222333000144");
        assert_eq!(record.awarded_total_value, Amount::from(550.0_f64));
        assert_eq!(record.awarded_quantity, Amount::from(500_i64));
        assert_eq!(
            record.result_at,
            "Mon Dec 15 2025 14:00:00 GMT-0300 (Brasilia Standard Time)"
        );
    }

    #[test]
    fn contract_and_item_fields_are_flattened() {
        let record = format_record(&contract(), &item(), &[]).unwrap();
        assert_eq!(record.organization, "MUNICIPIO DE EXEMPLO");
        assert_eq!(record.year, Some(2025));
        assert_eq!(record.contract_number, "90017");
        assert_eq!(record.item_number, Some(3));
        assert_eq!(record.quantity, Amount::from(500_i64));
        assert_eq!(record.estimated_total_value, Amount::from(625.0_f64));
        assert_eq!(record.status, "Em andamento");
        assert_eq!(record.process_number, "1234/2025");
        assert_eq!(
            record.published_at,
            "Mon Dec 01 2025 10:15:30 GMT-0300 (Brasilia Standard Time)"
        );
        assert_eq!(
            record.detail_link,
            "https://pncp.gov.br/app/editais/12345678000199/2025/42"
        );
        assert_eq!(
            record.contract_key().unwrap(),
            ContractKey::new("12345678000199", 2025, 42)
        );
    }

    #[test]
    fn missing_organization_or_item_fails() {
        let mut no_org = contract();
        no_org["orgaoEntidade"] = JsonValue::Null;
        assert_eq!(
            format_record(&no_org, &item(), &[]),
            Err(FormatError::MissingOrganization)
        );

        let mut no_org = contract();
        no_org.as_object_mut().unwrap().remove("orgaoEntidade");
        assert_eq!(
            format_record(&no_org, &item(), &[]),
            Err(FormatError::MissingOrganization)
        );

        assert_eq!(
            format_record(&contract(), &JsonValue::Null, &[]),
            Err(FormatError::MissingItem)
        );
    }

    #[test]
    fn missing_optional_fields_take_defaults() {
        let contract = json!({"orgaoEntidade": {}, "anoCompra": 2025, "sequencialCompra": 7});
        let record = format_record(&contract, &json!({"numeroItem": 1}), &[]).unwrap();
        assert_eq!(record.organization, "");
        assert_eq!(record.published_at, "");
        assert_eq!(record.quantity, Amount::zero());
        assert!(record.contract_key().is_err());
    }
}
