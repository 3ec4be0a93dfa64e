use crate::ArcStr;
use chrono::NaiveDate;
use serde::{de, Deserialize, Deserializer};

// Helpers for serde to parse fields with quirks.

/// Parse a string, but map "null" to `None` (in addition to the default "" -> None mapping)
pub fn optional_string<'de, D>(d: D) -> Result<Option<ArcStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(d)?;
    if s.eq_ignore_ascii_case("null") || s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(s.into()))
    }
}

/// parse a '1' to `true` and a '0' to `false`
pub fn bool_01<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let s: u8 = Deserialize::deserialize(d)?;
    match s {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(de::Error::custom("expected '0' or '1'")),
    }
}

/// Like `bool_01`, but maps the empty string to `None`.
pub fn opt_bool_01<'de, D>(d: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    match s.trim() {
        "" => Ok(None),
        "0" => Ok(Some(false)),
        "1" => Ok(Some(true)),
        _ => Err(de::Error::custom("expected '0', '1' or empty")),
    }
}

/// Parse an ISO date (yyyy-mm-dd), mapping the empty string to `None`.
pub fn optional_date<'de, D>(d: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    if s.trim().is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map(Some)
        .map_err(|e| de::Error::custom(format!("{}", e)))
}

/// Parse an integer field, mapping the empty string to `None`.
pub fn optional_i64<'de, D>(d: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    if s.trim().is_empty() {
        return Ok(None);
    }
    s.trim()
        .parse::<i64>()
        .map(Some)
        .map_err(|e| de::Error::custom(format!("{}", e)))
}

/// Parse a float field, mapping the empty string to `None`.
pub fn optional_f64<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: &str = Deserialize::deserialize(d)?;
    if s.trim().is_empty() {
        return Ok(None);
    }
    s.trim()
        .parse::<f64>()
        .map(Some)
        .map_err(|e| de::Error::custom(format!("{}", e)))
}
