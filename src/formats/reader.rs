use chrono::NaiveDate;
use csv::StringRecord;

/// Layout of the date column in trade files
pub const TRADE_DATE_FORMAT: &str = "%Y-%m-%d";

// Zero-indexed positions of the fields we keep from each trade line
pub const INSTRUMENT_CODE_FIELD: usize = 1;
pub const PRICE_FIELD: usize = 3;
pub const QUANTITY_FIELD: usize = 4;
pub const CLOSING_TIME_FIELD: usize = 5;
pub const NEGOTIATION_ID_FIELD: usize = 6;
pub const TRADE_DATE_FIELD: usize = 8;

/// A data row must reach at least the trade date column
pub const MIN_FIELDS: usize = TRADE_DATE_FIELD + 1;

/// One trade as it is staged and merged
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub trade_date: NaiveDate,
    pub instrument_code: String,
    pub price: f64,
    pub quantity: i64,
    pub closing_time_code: i64,
    /// Kept as text; the store coerces it into the integer column
    pub negotiation_id: String,
}

/// Configuration for delimited file reading
#[derive(Debug, Clone)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub has_header: bool,
    pub quote: u8,
}

impl DelimitedConfig {
    /// Layout of the B3 daily trade files
    pub fn b3() -> Self {
        Self {
            delimiter: b';',
            has_header: true,
            quote: b'"',
        }
    }
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self::b3()
    }
}

/// How raw text fields become typed trade values
///
/// This is the only place where a malformed field is either tolerated or
/// rejected; readers and loaders do not look at field contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FieldCoercion {
    /// Unparseable numbers become zero and unparseable dates become
    /// `placeholder_date()`; the row is still loaded.
    #[default]
    Lenient,
    /// Any unparseable numeric or date field rejects the row.
    Strict,
}

/// Date stored for rows whose date field cannot be parsed in lenient mode
///
/// A concrete value rather than NULL so the row still takes part in the
/// uniqueness key and re-ingestion stays idempotent.
pub fn placeholder_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN)
}

impl FieldCoercion {
    /// Map a raw record to a trade. Fails only for short rows or, in strict
    /// mode, for malformed fields.
    pub fn to_trade(self, record: &StringRecord) -> Result<TradeRecord, String> {
        if record.len() < MIN_FIELDS {
            return Err(format!(
                "expected at least {} fields, found {}",
                MIN_FIELDS,
                record.len()
            ));
        }

        let field = |idx: usize| record.get(idx).unwrap_or_default();

        Ok(TradeRecord {
            trade_date: self.date(field(TRADE_DATE_FIELD))?,
            instrument_code: field(INSTRUMENT_CODE_FIELD).to_string(),
            price: self.price(field(PRICE_FIELD))?,
            quantity: self.integer(field(QUANTITY_FIELD), "quantity")?,
            closing_time_code: self.integer(field(CLOSING_TIME_FIELD), "closing time")?,
            negotiation_id: field(NEGOTIATION_ID_FIELD).to_string(),
        })
    }

    fn price(self, raw: &str) -> Result<f64, String> {
        // Source files use a decimal comma
        let parsed = raw
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .filter(|p| p.is_finite());
        match (parsed, self) {
            (Some(price), _) => Ok(price),
            (None, FieldCoercion::Lenient) => Ok(0.0),
            (None, FieldCoercion::Strict) => Err(format!("invalid price '{}'", raw)),
        }
    }

    fn integer(self, raw: &str, name: &str) -> Result<i64, String> {
        match (raw.parse::<i64>(), self) {
            (Ok(value), _) => Ok(value),
            (Err(_), FieldCoercion::Lenient) => Ok(0),
            (Err(e), FieldCoercion::Strict) => Err(format!("invalid {} '{}': {}", name, raw, e)),
        }
    }

    fn date(self, raw: &str) -> Result<NaiveDate, String> {
        match (NaiveDate::parse_from_str(raw, TRADE_DATE_FORMAT), self) {
            (Ok(date), _) => Ok(date),
            (Err(_), FieldCoercion::Lenient) => Ok(placeholder_date()),
            (Err(e), FieldCoercion::Strict) => Err(format!("invalid trade date '{}': {}", raw, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    fn b3_line(price: &str, qty: &str, date: &str) -> StringRecord {
        record(&[
            "2025-07-29", "WDOQ25", "0", price, qty, "90000123", "10", "1", date,
        ])
    }

    #[test]
    fn test_maps_fixed_positions() {
        let trade = FieldCoercion::Lenient
            .to_trade(&b3_line("100,5", "15", "2025-07-29"))
            .unwrap();

        assert_eq!(trade.instrument_code, "WDOQ25");
        assert_eq!(trade.price, 100.5);
        assert_eq!(trade.quantity, 15);
        assert_eq!(trade.closing_time_code, 90000123);
        assert_eq!(trade.negotiation_id, "10");
        assert_eq!(trade.trade_date, NaiveDate::from_ymd_opt(2025, 7, 29).unwrap());
    }

    #[test]
    fn test_decimal_comma_is_normalized() {
        let trade = FieldCoercion::Lenient
            .to_trade(&b3_line("5432,5", "1", "2025-07-29"))
            .unwrap();
        assert_eq!(trade.price, 5432.5);
    }

    #[test]
    fn test_lenient_mode_zeroes_malformed_fields() {
        let trade = FieldCoercion::Lenient
            .to_trade(&b3_line("abc", "x1", "29/07/2025"))
            .unwrap();

        assert_eq!(trade.price, 0.0);
        assert_eq!(trade.quantity, 0);
        assert_eq!(trade.trade_date, placeholder_date());
    }

    #[test]
    fn test_strict_mode_rejects_malformed_fields() {
        let err = FieldCoercion::Strict
            .to_trade(&b3_line("abc", "1", "2025-07-29"))
            .unwrap_err();
        assert!(err.contains("invalid price 'abc'"));

        let err = FieldCoercion::Strict
            .to_trade(&b3_line("1,5", "1", "2025-13-01"))
            .unwrap_err();
        assert!(err.contains("invalid trade date"));
    }

    #[test]
    fn test_short_row_is_rejected_in_both_modes() {
        let short = record(&["a", "b", "c"]);
        for mode in [FieldCoercion::Lenient, FieldCoercion::Strict] {
            let err = mode.to_trade(&short).unwrap_err();
            assert!(err.contains("at least 9 fields"), "{}", err);
        }
    }
}
