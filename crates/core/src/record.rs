use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Column order of every per-image and combined artifact.
pub const CSV_HEADER: [&str; 4] = ["merchant", "date", "item", "amount"];

/// The four fields pulled out of one receipt.
///
/// Every field is optional: a receipt the model could not read still yields a
/// record, with all four fields `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub merchant: Option<String>,
    /// ISO-8601 date (`YYYY-MM-DD`) as produced by the model.
    pub date: Option<String>,
    pub item: Option<String>,
    pub amount: Option<Decimal>,
}

impl ExtractedRecord {
    /// The degraded record used when a response cannot be parsed.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.merchant.is_none() && self.date.is_none() && self.item.is_none() && self.amount.is_none()
    }
}

impl std::fmt::Display for ExtractedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn show(v: Option<&str>) -> &str {
            v.unwrap_or("-")
        }
        let amount = self.amount.map(|a| a.to_string());
        write!(
            f,
            "merchant={} date={} item={} amount={}",
            show(self.merchant.as_deref()),
            show(self.date.as_deref()),
            show(self.item.as_deref()),
            show(amount.as_deref()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_record_has_all_fields_null() {
        let r = ExtractedRecord::empty();
        assert!(r.is_empty());
        assert_eq!(r.merchant, None);
        assert_eq!(r.amount, None);
    }

    #[test]
    fn any_field_makes_record_non_empty() {
        let r = ExtractedRecord { date: Some("2024-01-05".into()), ..Default::default() };
        assert!(!r.is_empty());
    }

    #[test]
    fn display_marks_missing_fields() {
        let r = ExtractedRecord {
            merchant: Some("STORE X".into()),
            date: None,
            item: Some("Apples".into()),
            amount: Some(Decimal::from_str("2.50").unwrap()),
        };
        assert_eq!(r.to_string(), "merchant=STORE X date=- item=Apples amount=2.50");
    }

    #[test]
    fn header_order_is_fixed() {
        assert_eq!(CSV_HEADER.join(","), "merchant,date,item,amount");
    }
}
