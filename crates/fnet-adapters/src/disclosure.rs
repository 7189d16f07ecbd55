//! `DadosEconomicoFinanceiros` XML disclosures.
//!
//! Elements are read as optional text first and validated afterwards, so an
//! empty `<Rendimento/>` or one holding only blank children decodes as absent
//! instead of failing on its first required field.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use fnet_core::{
    clean_text, parse_date, Amortization, EconomicFinancialData, GeneralData, IncomeDistribution,
    IncomeReport,
};
use serde::Deserialize;

use crate::records::parse_lax_bool;
use crate::SchemaError;

#[derive(Debug, Deserialize)]
struct XmlRoot {
    #[serde(rename = "DadosGerais")]
    general: Option<XmlGeneral>,
    #[serde(rename = "InformeRendimentos")]
    income_report: Option<XmlIncomeReport>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct XmlGeneral {
    #[serde(rename = "NomeFundo")]
    fund_name: Option<String>,
    #[serde(rename = "CNPJFundo")]
    fund_cnpj: Option<String>,
    #[serde(rename = "NomeAdministrador")]
    administrator_name: Option<String>,
    #[serde(rename = "CNPJAdministrador")]
    administrator_cnpj: Option<String>,
    #[serde(rename = "ResponsavelInformacao")]
    contact_person: Option<String>,
    #[serde(rename = "TelefoneContato")]
    contact_phone: Option<String>,
    #[serde(rename = "CodISINCota")]
    quota_isin_code: Option<String>,
    #[serde(rename = "CodNegociacaoCota")]
    quota_ticker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct XmlIncomeReport {
    #[serde(rename = "Rendimento")]
    income: Option<XmlDistribution>,
    #[serde(rename = "Amortizacao")]
    amortization: Option<XmlDistribution>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct XmlDistribution {
    #[serde(rename = "AtoSocietarioAprovacao")]
    approval_act: Option<String>,
    #[serde(rename = "DataAprovacao")]
    approval_date: Option<String>,
    #[serde(rename = "DataBase")]
    base_date: Option<String>,
    #[serde(rename = "DataPagamento")]
    payment_date: Option<String>,
    #[serde(rename = "ValorProventoCota")]
    amount_per_quota: Option<String>,
    #[serde(rename = "PeriodoReferencia")]
    reference_period: Option<String>,
    #[serde(rename = "Ano")]
    year: Option<String>,
    #[serde(rename = "RendimentoIsentoIR")]
    income_tax_exempt: Option<String>,
}

impl XmlDistribution {
    fn is_blank(&self) -> bool {
        [
            &self.approval_act,
            &self.approval_date,
            &self.base_date,
            &self.payment_date,
            &self.amount_per_quota,
            &self.reference_period,
            &self.year,
            &self.income_tax_exempt,
        ]
        .into_iter()
        .all(|field| text(field).is_none())
    }
}

/// Decode an economic-financial disclosure document.
pub fn decode_disclosure(xml: &str) -> Result<EconomicFinancialData, SchemaError> {
    let root: XmlRoot = quick_xml::de::from_str(xml).map_err(|err| SchemaError::Xml(err.to_string()))?;

    let general = root
        .general
        .ok_or(SchemaError::MissingElement("DadosGerais"))
        .and_then(general_data)?;
    let report = root
        .income_report
        .ok_or(SchemaError::MissingElement("InformeRendimentos"))?;

    let income = match report.income {
        Some(raw) if !raw.is_blank() => Some(income_distribution(raw)?),
        _ => None,
    };
    let amortization = match report.amortization {
        Some(raw) if !raw.is_blank() => Some(amortization_data(raw)?),
        _ => None,
    };

    Ok(EconomicFinancialData {
        general,
        income_report: IncomeReport {
            amortization,
            income,
        },
    })
}

/// Read and decode a disclosure file.
pub fn load_disclosure(path: impl AsRef<Path>) -> anyhow::Result<EconomicFinancialData> {
    let path = path.as_ref();
    let xml = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    decode_disclosure(&xml).with_context(|| format!("decoding {}", path.display()))
}

fn general_data(raw: XmlGeneral) -> Result<GeneralData, SchemaError> {
    Ok(GeneralData {
        fund_name: required(&raw.fund_name, "NomeFundo")?,
        fund_cnpj: clean_text(&required(&raw.fund_cnpj, "CNPJFundo")?),
        administrator_name: required(&raw.administrator_name, "NomeAdministrador")?,
        administrator_cnpj: clean_text(&required(&raw.administrator_cnpj, "CNPJAdministrador")?),
        contact_person: required(&raw.contact_person, "ResponsavelInformacao")?,
        contact_phone: required(&raw.contact_phone, "TelefoneContato")?,
        quota_isin_code: required(&raw.quota_isin_code, "CodISINCota")?,
        quota_ticker: required(&raw.quota_ticker, "CodNegociacaoCota")?,
    })
}

fn income_distribution(raw: XmlDistribution) -> Result<IncomeDistribution, SchemaError> {
    let exempt = required(&raw.income_tax_exempt, "RendimentoIsentoIR")?;
    Ok(IncomeDistribution {
        approval_act: text(&raw.approval_act).map(str::to_string),
        approval_date: optional_date(&raw.approval_date, "DataAprovacao")?,
        base_date: date(&raw.base_date, "DataBase")?,
        payment_date: date(&raw.payment_date, "DataPagamento")?,
        amount_per_quota: decimal(&raw.amount_per_quota, "ValorProventoCota")?,
        reference_period: required(&raw.reference_period, "PeriodoReferencia")?,
        year: required(&raw.year, "Ano")?,
        income_tax_exempt: parse_lax_bool(&exempt).ok_or_else(|| SchemaError::InvalidValue {
            field: "RendimentoIsentoIR",
            reason: format!("invalid boolean: {exempt:?}"),
        })?,
    })
}

fn amortization_data(raw: XmlDistribution) -> Result<Amortization, SchemaError> {
    if raw.income_tax_exempt.is_some() {
        return Err(SchemaError::InvalidValue {
            field: "RendimentoIsentoIR",
            reason: "not allowed in Amortizacao".into(),
        });
    }
    let year = required(&raw.year, "Ano")?;
    Ok(Amortization {
        approval_act: text(&raw.approval_act).map(str::to_string),
        approval_date: optional_date(&raw.approval_date, "DataAprovacao")?,
        base_date: date(&raw.base_date, "DataBase")?,
        payment_date: date(&raw.payment_date, "DataPagamento")?,
        amount_per_quota: decimal(&raw.amount_per_quota, "ValorProventoCota")?,
        reference_period: required(&raw.reference_period, "PeriodoReferencia")?,
        year: year.parse().map_err(|_| SchemaError::InvalidValue {
            field: "Ano",
            reason: format!("invalid integer: {year:?}"),
        })?,
    })
}

fn text(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn required(field: &Option<String>, name: &'static str) -> Result<String, SchemaError> {
    text(field)
        .map(str::to_string)
        .ok_or(SchemaError::MissingElement(name))
}

fn optional_date(field: &Option<String>, name: &'static str) -> Result<Option<NaiveDate>, SchemaError> {
    text(field)
        .map(|value| {
            parse_date(value).map_err(|err| SchemaError::InvalidValue {
                field: name,
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn date(field: &Option<String>, name: &'static str) -> Result<NaiveDate, SchemaError> {
    optional_date(field, name)?.ok_or(SchemaError::MissingElement(name))
}

fn decimal(field: &Option<String>, name: &'static str) -> Result<BigDecimal, SchemaError> {
    let value = required(field, name)?;
    BigDecimal::from_str(&value).map_err(|err| SchemaError::InvalidValue {
        field: name,
        reason: err.to_string(),
    })
}
