use std::str::FromStr;
use std::sync::OnceLock;

use receipt_core::ExtractedRecord;
use regex::Regex;
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::llm::{LlmBackend, LlmError};

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

re!(re_amount_noise, r"[^\d.,\-]");
re!(re_decimal_comma, r"^-?\d+,\d{2}$");

// ── Prompt ───────────────────────────────────────────────────────────────────

/// Instruction sent ahead of the OCR text.
pub fn build_prompt(text: &str) -> String {
    format!(
        r#"You are a receipt parser. Extract these fields from the receipt text below:

- merchant
- item
- amount (use the printed total if the receipt shows one; otherwise the sum of all item prices)
- date (ISO format: YYYY-MM-DD)

Use the context of the whole receipt to decide each value and leave any field you cannot find as null.
Return **only** a JSON object with exactly the keys: merchant, item, amount, date.

Receipt:
{text}
"#
    )
}

// ── Field parser ─────────────────────────────────────────────────────────────

/// Turns OCR text into an [`ExtractedRecord`] via a language model.
///
/// Model output that cannot be interpreted never fails the call: it degrades
/// to an all-null record and the raw response is logged at `warn`.
pub struct FieldParser<L: LlmBackend> {
    llm: L,
}

impl<L: LlmBackend> FieldParser<L> {
    pub fn new(llm: L) -> Self {
        Self { llm }
    }

    pub fn backend(&self) -> &L {
        &self.llm
    }

    /// Errors only when the model call itself fails.
    pub async fn parse(&self, text: &str) -> Result<ExtractedRecord, LlmError> {
        if text.trim().is_empty() {
            tracing::info!("No recognized text; emitting empty record");
            return Ok(ExtractedRecord::empty());
        }
        let raw = self.llm.complete(&build_prompt(text)).await?;
        Ok(parse_response(&raw))
    }
}

/// Interpret a raw model completion.
///
/// Only the first balanced `{…}` span is considered. If it is missing or is
/// not a JSON object the record is all-null; later spans are never tried.
pub fn parse_response(raw: &str) -> ExtractedRecord {
    let parsed = extract_first_json_object(raw).map(serde_json::from_str::<Map<String, Value>>);
    match parsed {
        Some(Ok(obj)) => record_from_object(&obj),
        Some(Err(e)) => {
            tracing::warn!("Model returned malformed JSON ({e}); saving nulls\n{raw}");
            ExtractedRecord::empty()
        }
        None => {
            tracing::warn!("Model returned no JSON object; saving nulls\n{raw}");
            ExtractedRecord::empty()
        }
    }
}

/// The first balanced `{…}` span in `raw`, if any.
///
/// Braces inside JSON strings (including escaped quotes) do not count toward
/// the depth, so nested objects and arrays are kept whole.
fn extract_first_json_object(raw: &str) -> Option<&str> {
    let mut from = 0;
    while let Some(offset) = raw[from..].find('{') {
        let start = from + offset;
        if let Some(end) = balanced_end(raw, start) {
            return Some(&raw[start..end]);
        }
        from = start + 1;
    }
    None
}

/// Byte index just past the `}` closing the `{` at `start`.
fn balanced_end(s: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn record_from_object(obj: &Map<String, Value>) -> ExtractedRecord {
    ExtractedRecord {
        merchant: text_field(obj, "merchant"),
        date: text_field(obj, "date"),
        item: text_field(obj, "item"),
        amount: amount_field(obj, "amount"),
    }
}

fn text_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::Null => None,
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        other => {
            tracing::warn!("Ignoring {key}: unexpected value {other}");
            None
        }
    }
}

fn amount_field(obj: &Map<String, Value>, key: &str) -> Option<Decimal> {
    let amount = match obj.get(key)? {
        Value::Null => return None,
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) if s.trim().is_empty() => return None,
        Value::String(s) => parse_amount_str(s),
        _ => None,
    };
    if amount.is_none() {
        tracing::warn!("Ignoring {key}: unusable value {}", obj[key]);
    }
    amount
}

/// Lenient parse of a money string: `"$1,234.56"`, `"12,50"`, `" 7 "`.
fn parse_amount_str(s: &str) -> Option<Decimal> {
    let clean = re_amount_noise().replace_all(s.trim(), "");
    let clean = if re_decimal_comma().is_match(&clean) {
        clean.replace(',', ".")
    } else {
        clean.replace(',', "")
    };
    parse_decimal(&clean)
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
