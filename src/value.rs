//! Field values stored in the job record.
//!
//! Numbers are kept as canonical decimal text so the packet hash never depends
//! on binary floating point formatting or on how the number was written.
use crate::error::{RejectCode, RejectContext, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest exponent magnitude accepted in scientific notation.
pub const MAX_DECIMAL_EXPONENT: u32 = 1024;

/// Exact decimal number in canonical textual form.
///
/// Canonical form: optional leading `-`, no leading zeros in the integer part,
/// no trailing zeros in the fractional part, no exponent, and `-0` collapsed
/// to `0`. Scientific input such as `1.5e3` is expanded to `1500`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Decimal(String);

impl Decimal {
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let invalid = |detail: &str| {
            StoreError::reject(
                RejectCode::InvalidNumber,
                RejectContext::new(format!("{detail}: {input:?}")),
            )
        };
        let text = input.trim();
        let (negative, unsigned) = match text.as_bytes().first() {
            Some(b'-') => (true, &text[1..]),
            Some(b'+') => (false, &text[1..]),
            _ => (false, text),
        };
        let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
            Some(at) => (&unsigned[..at], Some(&unsigned[at + 1..])),
            None => (unsigned, None),
        };
        let (int_part, frac_part) = match mantissa.split_once('.') {
            Some((int_part, frac_part)) => (int_part, frac_part),
            None => (mantissa, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid("decimal has no digits"));
        }
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(int_part) || !all_digits(frac_part) {
            return Err(invalid("decimal must contain only digits and one point"));
        }
        let exponent = match exponent {
            Some(exp) => parse_exponent(exp).ok_or_else(|| invalid("malformed exponent"))?,
            None => 0,
        };

        let digits = format!("{int_part}{frac_part}");
        let point = int_part.len() as i64 + exponent;
        let (int_digits, frac_digits) = if point <= 0 {
            let pad = "0".repeat(point.unsigned_abs() as usize);
            (String::new(), format!("{pad}{digits}"))
        } else if point as usize >= digits.len() {
            let pad = "0".repeat(point as usize - digits.len());
            (format!("{digits}{pad}"), String::new())
        } else {
            let (int_digits, frac_digits) = digits.split_at(point as usize);
            (int_digits.to_string(), frac_digits.to_string())
        };

        let int_digits = int_digits.trim_start_matches('0');
        let frac_digits = frac_digits.trim_end_matches('0');
        let mut canonical = String::new();
        let is_zero = int_digits.is_empty() && frac_digits.is_empty();
        if negative && !is_zero {
            canonical.push('-');
        }
        canonical.push_str(if int_digits.is_empty() { "0" } else { int_digits });
        if !frac_digits.is_empty() {
            canonical.push('.');
            canonical.push_str(frac_digits);
        }
        Ok(Decimal(canonical))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn parse_exponent(text: &str) -> Option<i64> {
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let magnitude: u32 = digits.parse().ok()?;
    if magnitude > MAX_DECIMAL_EXPONENT {
        return None;
    }
    let magnitude = i64::from(magnitude);
    Some(if negative { -magnitude } else { magnitude })
}

impl TryFrom<String> for Decimal {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Decimal::parse(&value)
    }
}

impl From<Decimal> for String {
    fn from(value: Decimal) -> Self {
        value.0
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One value in `fields` or a measurement row.
///
/// Every number is a `Decimal`, so `5`, `5.0`, and `5e0` hash the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Decimal(Decimal),
    Bool(bool),
    Null,
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn decimal(value: &str) -> Result<Self, StoreError> {
        Ok(FieldValue::Decimal(Decimal::parse(value)?))
    }

    /// Convert untyped JSON (CLI input, extraction proposals) into a field value.
    ///
    /// Numbers are parsed from their source text (serde_json keeps it with
    /// `arbitrary_precision`), so no digit is lost to a binary float. Nested
    /// objects and arrays are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, StoreError> {
        match value {
            serde_json::Value::Null => Ok(FieldValue::Null),
            serde_json::Value::Bool(flag) => Ok(FieldValue::Bool(*flag)),
            serde_json::Value::String(text) => Ok(FieldValue::Text(text.clone())),
            serde_json::Value::Number(number) => FieldValue::decimal(&number.to_string()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => Err(StoreError::reject(
                RejectCode::InvalidValue,
                RejectContext::new("nested values are not allowed in fields"),
            )),
        }
    }

    /// Short human-readable rendering for logs and CLI output.
    pub fn display_text(&self) -> String {
        match self {
            FieldValue::Text(text) => text.clone(),
            FieldValue::Decimal(decimal) => decimal.to_string(),
            FieldValue::Bool(flag) => flag.to_string(),
            FieldValue::Null => "null".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_equivalent_decimals() {
        for (input, expected) in [
            ("1.50", "1.5"),
            ("001.500", "1.5"),
            ("+2", "2"),
            ("-0.000", "0"),
            (".5", "0.5"),
            ("5.", "5"),
            ("-12.3400", "-12.34"),
            ("0", "0"),
            ("1.5e3", "1500"),
            ("1E-3", "0.001"),
            ("-2.50e+1", "-25"),
            ("0e99", "0"),
        ] {
            assert_eq!(Decimal::parse(input).expect(input).as_str(), expected);
        }
    }

    #[test]
    fn rejects_non_finite_and_malformed_forms() {
        for input in [
            "NaN", "inf", "-inf", "", ".", "1.2.3", "1,5", "--1", "1e", "e5", "1e+", "1e2.5",
            "1e99999",
        ] {
            let err = Decimal::parse(input).expect_err(input);
            assert_eq!(err.reject_code(), Some(RejectCode::InvalidNumber));
        }
    }

    #[test]
    fn serde_uses_tagged_canonical_text() {
        let value = FieldValue::decimal("3.140").expect("decimal");
        let json = serde_json::to_value(&value).expect("serialize");
        assert_eq!(json, serde_json::json!({"type": "decimal", "value": "3.14"}));
        let back: FieldValue = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, value);
    }

    #[test]
    fn deserializing_bad_decimal_fails() {
        let json = serde_json::json!({"type": "decimal", "value": "NaN"});
        assert!(serde_json::from_value::<FieldValue>(json).is_err());
    }

    #[test]
    fn from_json_maps_scalars_and_rejects_nesting() {
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(7)).expect("int"),
            FieldValue::decimal("7").expect("decimal")
        );
        assert_eq!(
            FieldValue::from_json(&serde_json::json!(0.25)).expect("decimal"),
            FieldValue::decimal("0.25").expect("decimal")
        );
        let err = FieldValue::from_json(&serde_json::json!({"a": 1})).expect_err("object");
        assert_eq!(err.reject_code(), Some(RejectCode::InvalidValue));
    }

    fn from_json_text(text: &str) -> FieldValue {
        let value: serde_json::Value = serde_json::from_str(text).expect(text);
        FieldValue::from_json(&value).expect(text)
    }

    #[test]
    fn from_json_keeps_every_digit() {
        assert_eq!(
            from_json_text("123456789.123456789"),
            FieldValue::decimal("123456789.123456789").expect("decimal")
        );
        assert_eq!(
            from_json_text("0.1000000000000000055511151231257827"),
            FieldValue::decimal("0.1000000000000000055511151231257827").expect("decimal")
        );
    }

    #[test]
    fn from_json_expands_exponents() {
        assert_eq!(
            from_json_text("1e21"),
            FieldValue::decimal("1000000000000000000000").expect("decimal")
        );
        assert_eq!(from_json_text("2.5E-2"), FieldValue::decimal("0.025").expect("decimal"));
    }

    #[test]
    fn equal_numbers_share_one_representation() {
        let typed = FieldValue::decimal("5").expect("decimal");
        for text in ["5", "5.0", "5e0", "50e-1"] {
            assert_eq!(from_json_text(text), typed, "{text}");
        }
    }
}
