//! Page response decoding: strict envelope, lenient records.

use fnet_core::{parse_date_string, DocumentRecord, PageEnvelope};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::SchemaError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireEnvelope {
    #[serde(default)]
    #[allow(dead_code)]
    draw: Option<Value>,
    #[serde(rename = "recordsTotal", deserialize_with = "lax_u64")]
    records_total: u64,
    #[serde(rename = "recordsFiltered", deserialize_with = "lax_u64")]
    records_filtered: u64,
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(deserialize_with = "lax_i64")]
    id: i64,
    #[serde(rename = "descricaoFundo")]
    descricao_fundo: String,
    #[serde(rename = "categoriaDocumento")]
    categoria_documento: String,
    #[serde(rename = "tipoDocumento")]
    tipo_documento: String,
    #[serde(rename = "dataReferencia", deserialize_with = "lax_datetime")]
    data_referencia: chrono::NaiveDateTime,
    #[serde(rename = "dataEntrega", deserialize_with = "lax_datetime")]
    data_entrega: chrono::NaiveDateTime,
    status: String,
    #[serde(rename = "descricaoStatus")]
    descricao_status: String,
    analisado: String,
    #[serde(rename = "situacaoDocumento")]
    situacao_documento: String,
    #[serde(rename = "altaPrioridade", deserialize_with = "lax_bool")]
    alta_prioridade: bool,
    #[serde(rename = "formatoDataReferencia")]
    formato_data_referencia: String,
    #[serde(deserialize_with = "lax_i32")]
    versao: i32,
    modalidade: String,
    #[serde(rename = "descricaoModalidade")]
    descricao_modalidade: String,
    #[serde(rename = "nomePregao")]
    nome_pregao: String,
    #[serde(rename = "informacoesAdicionais")]
    informacoes_adicionais: String,
    #[serde(rename = "idTemplate", deserialize_with = "lax_i32")]
    id_template: i32,
    #[serde(rename = "idSelectItemConvenio", deserialize_with = "lax_i32")]
    id_select_item_convenio: i32,
    #[serde(rename = "indicadorFundoAtivoB3", deserialize_with = "lax_bool")]
    indicador_fundo_ativo_b3: bool,
}

impl From<WireRecord> for DocumentRecord {
    fn from(wire: WireRecord) -> Self {
        DocumentRecord {
            document_id: wire.id,
            fund_description: wire.descricao_fundo,
            document_category: wire.categoria_documento,
            document_type: wire.tipo_documento,
            reference_date: wire.data_referencia.date(),
            delivery_timestamp: wire.data_entrega,
            status: wire.status,
            status_description: wire.descricao_status,
            review_flag: wire.analisado,
            situation: wire.situacao_documento,
            high_priority: wire.alta_prioridade,
            reference_date_format: wire.formato_data_referencia,
            version: wire.versao,
            modality: wire.modalidade,
            modality_description: wire.descricao_modalidade,
            auction_name: wire.nome_pregao,
            extra_info: wire.informacoes_adicionais,
            template_id: wire.id_template,
            convenio_item_id: wire.id_select_item_convenio,
            active_on_exchange: wire.indicador_fundo_ativo_b3,
        }
    }
}

/// Decode one page response.
///
/// Envelope violations fail the whole page. A record that fails validation is
/// logged, counted in [`PageEnvelope::skipped`] and left out; the rest of the
/// page is kept.
pub fn decode_page(json: Value) -> Result<PageEnvelope, SchemaError> {
    let envelope: WireEnvelope =
        serde_json::from_value(json).map_err(|err| SchemaError::Envelope(err.to_string()))?;

    let mut records = Vec::with_capacity(envelope.data.len());
    let mut skipped = 0;
    for (index, raw) in envelope.data.into_iter().enumerate() {
        match decode_record(index, raw) {
            Ok(record) => records.push(record),
            Err(err) => {
                skipped += 1;
                if let SchemaError::Record {
                    index,
                    document_id,
                    reason,
                } = &err
                {
                    warn!(index, ?document_id, %reason, "skipping malformed record");
                }
            }
        }
    }

    Ok(PageEnvelope {
        records_total: envelope.records_total,
        records_filtered: envelope.records_filtered,
        records,
        skipped,
    })
}

/// Decode a single raw record. `index` is its position in the page.
pub fn decode_record(index: usize, raw: Value) -> Result<DocumentRecord, SchemaError> {
    let document_id = raw.get("id").and_then(peek_id);
    serde_json::from_value::<WireRecord>(raw)
        .map(DocumentRecord::from)
        .map_err(|err| SchemaError::Record {
            index,
            document_id,
            reason: err.to_string(),
        })
}

fn peek_id(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// Boolean coercion shared with the XML decoder.
pub fn parse_lax_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn lax_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => match n.as_f64() {
                Some(f) if f == 0.0 => Ok(false),
                Some(f) if f == 1.0 => Ok(true),
                _ => Err(de::Error::custom(format!("invalid boolean: {n}"))),
            },
        },
        Value::String(s) => {
            parse_lax_bool(&s).ok_or_else(|| de::Error::custom(format!("invalid boolean: {s:?}")))
        }
        other => Err(de::Error::custom(format!("expected boolean, got {other}"))),
    }
}

fn lax_integer(value: Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
                    Ok(f as i64)
                }
                _ => Err(format!("invalid integer: {n}")),
            }
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("invalid integer: {s:?}")),
        other => Err(format!("expected integer, got {other}")),
    }
}

fn lax_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    lax_integer(Value::deserialize(deserializer)?).map_err(de::Error::custom)
}

fn lax_i32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    let value = lax_integer(Value::deserialize(deserializer)?).map_err(de::Error::custom)?;
    i32::try_from(value).map_err(|_| de::Error::custom(format!("integer out of range: {value}")))
}

fn lax_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = lax_integer(Value::deserialize(deserializer)?).map_err(de::Error::custom)?;
    u64::try_from(value).map_err(|_| de::Error::custom(format!("negative count: {value}")))
}

fn lax_datetime<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<chrono::NaiveDateTime, D::Error> {
    let text = String::deserialize(deserializer)?;
    parse_date_string(&text).map_err(de::Error::custom)
}
