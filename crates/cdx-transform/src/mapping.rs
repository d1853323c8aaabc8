//! Per-cycle registry of search-index field types: translate source
//! datatypes to a destination type, validate values against it, and coerce
//! values into their stored form.
//!
//! The registry is intentionally cheap to build and discard — a fresh one
//! is constructed at the start of every pipeline cycle (see the pipeline
//! controller) rather than persisted, so a concurrent mapping change made
//! by another replica is picked up on the next cycle instead of drifting.

use chrono::TimeZone;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchFieldType {
    String,
    Long,
    Double,
    Date,
    Boolean,
    GeoPoint,
}

impl SearchFieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchFieldType::String => "string",
            SearchFieldType::Long => "long",
            SearchFieldType::Double => "double",
            SearchFieldType::Date => "date",
            SearchFieldType::Boolean => "boolean",
            SearchFieldType::GeoPoint => "geo_point",
        }
    }
}

/// Translate a declared Gremlin/SPARQL source type name to a search-index
/// field type. Unrecognized source types fall back to `String`.
pub fn es_type_for_source_type(source_type: &str) -> SearchFieldType {
    match source_type.trim().to_ascii_lowercase().as_str() {
        "bool" | "boolean" => SearchFieldType::Boolean,
        "int" | "integer" | "byte" | "short" | "nonnegativeinteger" | "nonpositiveinteger" | "negativeinteger"
        | "unsignedbyte" | "unsignedint" | "unsignedlong" | "unsignedshort" | "long" => SearchFieldType::Long,
        "decimal" | "float" | "double" => SearchFieldType::Double,
        "datetime" | "date" => SearchFieldType::Date,
        "geo_point" => SearchFieldType::GeoPoint,
        _ => SearchFieldType::String,
    }
}

fn lang_tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z]{1,8}(-[A-Za-z0-9]{1,8})*$").unwrap())
}

pub fn validate_language_tag(tag: &str) -> bool {
    lang_tag_regex().is_match(tag)
}

fn is_str_integer_valued(s: &str) -> bool {
    s.trim().parse::<f64>().map(|f| f.fract() == 0.0).unwrap_or(false)
}

const BOOLEAN_TRUTHY_STRINGS: &[&str] = &["true", "\"true\"", "false", "\"false\"", "0", "1", "0.0", "1.0", "-0", "-0.0"];

fn validate_boolean(value: &Value) -> bool {
    match value {
        Value::Bool(_) => true,
        Value::String(s) => BOOLEAN_TRUTHY_STRINGS.contains(&s.to_ascii_lowercase().as_str()),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i == 0 || i == 1
            } else if let Some(f) = n.as_f64() {
                f == 0.0 || f == 1.0
            } else {
                false
            }
        }
        _ => false,
    }
}

fn validate_double(value: &Value) -> bool {
    match value {
        Value::Bool(_) => false,
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

fn validate_long(value: &Value) -> bool {
    match value {
        Value::Bool(_) => false,
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.checked_abs().is_some()
            } else if let Some(f) = n.as_f64() {
                f.fract() == 0.0 && f.abs() < 9.223_372_036_854_776e18
            } else {
                false
            }
        }
        Value::String(s) => is_str_integer_valued(s),
        _ => false,
    }
}

fn validate_date(value: &Value) -> bool {
    match value {
        // integers are interpreted as epoch millis
        Value::Number(n) => n.is_i64() || n.is_u64(),
        Value::String(s) => is_str_integer_valued(s) || chrono::DateTime::parse_from_rfc3339(s).is_ok() || looks_like_date(s),
        _ => false,
    }
}

/// Permissive fallback for non-RFC3339 textual date forms: `YYYY-MM-DD` /
/// `YYYY/MM/DD` first, then a full `dtparse` sweep for the ISO-8601
/// variants, RFC-2822-like forms, and named-month forms (`"Sep-25-2003"`,
/// `"2003 Sep 25"`, `"Wed, July 10, '96"`) that the original's
/// `dateutil.parse`-based validator accepts.
fn looks_like_date(s: &str) -> bool {
    let normalized = s.replace('/', "-");
    if chrono::NaiveDate::parse_from_str(&normalized, "%Y-%m-%d").is_ok() {
        return true;
    }
    dtparse::parse(s).is_ok()
}

pub fn validate_geopoint(value: &str) -> bool {
    let parts: Vec<&str> = value.replace(' ', "").split(',').collect();
    if parts.len() != 2 {
        return false;
    }
    match (parts[0].parse::<f64>(), parts[1].parse::<f64>()) {
        (Ok(lat), Ok(lon)) => lat.abs() <= 90.0 && lon.abs() <= 180.0,
        _ => false,
    }
}

/// Reject = value cannot be safely stored as `es_type`. String/text always accept.
pub fn validate(value: &Value, es_type: SearchFieldType) -> bool {
    match es_type {
        SearchFieldType::String => true,
        SearchFieldType::Boolean => validate_boolean(value),
        SearchFieldType::Double => validate_double(value),
        SearchFieldType::Long => validate_long(value),
        SearchFieldType::Date => validate_date(value),
        SearchFieldType::GeoPoint => value.as_str().map(validate_geopoint).unwrap_or(false),
    }
}

/// Coerce a validated value to its stored form. Falls back to the original
/// value on any parse failure rather than raising — the validator already
/// ran, so a coercion failure here means an edge case the validator missed,
/// not a caller bug.
pub fn coerce(value: &Value, es_type: SearchFieldType) -> Value {
    match es_type {
        SearchFieldType::String | SearchFieldType::GeoPoint => value.clone(),
        SearchFieldType::Boolean => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::String(s) => Value::Bool(matches!(s.to_ascii_lowercase().as_str(), "true" | "\"true\"" | "1" | "1.0")),
            Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            other => other.clone(),
        },
        SearchFieldType::Double => value
            .as_f64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        SearchFieldType::Long => {
            let as_f64 = value
                .as_f64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()));
            match as_f64 {
                Some(f) => Value::Number(serde_json::Number::from(f as i64)),
                None => value.clone(),
            }
        }
        SearchFieldType::Date => coerce_date(value),
    }
}

fn coerce_date(value: &Value) -> Value {
    if let Some(millis) = value.as_i64() {
        return Value::String(millis_to_iso8601(millis));
    }
    if let Some(s) = value.as_str() {
        if is_str_integer_valued(s) {
            if let Ok(millis) = s.trim().parse::<i64>() {
                return Value::String(millis_to_iso8601(millis));
            }
        }
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return Value::String(dt.to_rfc3339());
        }
        if let Some(iso) = dtparse_to_rfc3339(s) {
            return Value::String(iso);
        }
    }
    value.clone()
}

/// Run `s` through `dtparse` and normalize the result to RFC3339, so a
/// permissive form like `"Sep-25-2003"` is stored the same way an RFC3339
/// input would be. A parse with no explicit offset is treated as UTC.
fn dtparse_to_rfc3339(s: &str) -> Option<String> {
    let (naive, offset) = dtparse::parse(s).ok()?;
    match offset {
        Some(offset) => offset.from_local_datetime(&naive).single().map(|dt| dt.to_rfc3339()),
        None => Some(chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(naive, chrono::Utc).to_rfc3339()),
    }
}

fn millis_to_iso8601(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

/// Raised when a field already has a mapping and a record declares a
/// conflicting source type for it (mirrors the ES `illegal_argument_exception`
/// a concurrent, differently-typed `put_mapping` produces).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingConflict {
    pub field_name: String,
    pub existing: &'static str,
    pub requested: &'static str,
}

/// Per-cycle field-name -> search-index-type cache. Construct fresh at the
/// start of every pipeline cycle.
#[derive(Debug, Default)]
pub struct MappingRegistry {
    fields: HashMap<String, SearchFieldType>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed geo-point mappings for configured field names so later
    /// string-encoded coordinates are recognized without a conflict.
    pub fn seed_geo_fields(&mut self, geo_fields: &[String]) {
        for field in geo_fields {
            self.fields.entry(field.clone()).or_insert(SearchFieldType::GeoPoint);
        }
    }

    pub fn get(&self, field_name: &str) -> Option<SearchFieldType> {
        self.fields.get(field_name).copied()
    }

    /// Look up the mapping for `field_name`; if absent, create one from
    /// `source_type`. Returns a conflict when an existing mapping for a
    /// different type is already present — the caller should refresh and
    /// drop the record in that case, not retry.
    pub fn get_or_create(&mut self, field_name: &str, source_type: &str) -> Result<SearchFieldType, MappingConflict> {
        let wanted = es_type_for_source_type(source_type);
        match self.fields.get(field_name) {
            Some(existing) if *existing == wanted => Ok(*existing),
            Some(existing) => Err(MappingConflict {
                field_name: field_name.to_string(),
                existing: existing.as_str(),
                requested: wanted.as_str(),
            }),
            None => {
                self.fields.insert(field_name.to_string(), wanted);
                Ok(wanted)
            }
        }
    }

    /// Drop a field's mapping after a conflict, so a later record under the
    /// same name is free to establish a new one instead of conflicting
    /// against the rejected type forever.
    pub fn invalidate(&mut self, field_name: &str) {
        self.fields.remove(field_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_table_matches_documented_groupings() {
        assert_eq!(es_type_for_source_type("integer"), SearchFieldType::Long);
        assert_eq!(es_type_for_source_type("SHORT"), SearchFieldType::Long);
        assert_eq!(es_type_for_source_type("decimal"), SearchFieldType::Double);
        assert_eq!(es_type_for_source_type("datetime"), SearchFieldType::Date);
        assert_eq!(es_type_for_source_type("time"), SearchFieldType::String);
        assert_eq!(es_type_for_source_type("unknown-type"), SearchFieldType::String);
    }

    #[test]
    fn boolean_validator_accepts_documented_truthy_strings() {
        assert!(validate_boolean(&Value::String("TRUE".to_string())));
        assert!(validate_boolean(&Value::String("0".to_string())));
        assert!(validate_boolean(&Value::String("-0.0".to_string())));
        assert!(!validate_boolean(&Value::String("maybe".to_string())));
    }

    #[test]
    fn long_validator_rejects_fractional_values() {
        assert!(validate_long(&Value::String("111".to_string())));
        assert!(!validate_long(&Value::String("11.1".to_string())));
        assert!(validate_long(&serde_json::json!(111.0)));
    }

    #[test]
    fn geo_point_validator_checks_lat_lon_bounds() {
        assert!(validate_geopoint("45.0,-122.0"));
        assert!(!validate_geopoint("95.0,0.0"));
        assert!(!validate_geopoint("not-a-point"));
    }

    #[test]
    fn registry_detects_conflicting_type_for_same_field() {
        let mut registry = MappingRegistry::new();
        registry.get_or_create("age", "integer").unwrap();
        let err = registry.get_or_create("age", "string").unwrap_err();
        assert_eq!(err.field_name, "age");
    }

    #[test]
    fn registry_reuses_existing_mapping_for_same_type() {
        let mut registry = MappingRegistry::new();
        registry.get_or_create("age", "integer").unwrap();
        let second = registry.get_or_create("age", "int").unwrap();
        assert_eq!(second, SearchFieldType::Long);
    }

    #[test]
    fn coerce_long_handles_decimal_looking_strings() {
        let coerced = coerce(&Value::String("111.00".to_string()), SearchFieldType::Long);
        assert_eq!(coerced, serde_json::json!(111));
    }

    #[test]
    fn coerce_falls_back_to_original_on_unparseable_date() {
        let original = Value::String("not-a-date-at-all-!!".to_string());
        let coerced = coerce(&original, SearchFieldType::Date);
        assert_eq!(coerced, original);
    }

    #[test]
    fn date_validator_accepts_named_month_and_rfc2822_like_forms() {
        assert!(validate_date(&Value::String("Sep-25-2003".to_string())));
        assert!(validate_date(&Value::String("2003 Sep 25".to_string())));
        assert!(validate_date(&Value::String("Wed, 10 Jul 1996 00:00:00".to_string())));
    }

    #[test]
    fn coerce_date_normalizes_named_month_forms_to_rfc3339() {
        let coerced = coerce(&Value::String("Sep-25-2003".to_string()), SearchFieldType::Date);
        let Value::String(iso) = coerced else { panic!("expected a string") };
        assert!(iso.starts_with("2003-09-25"), "got {iso}");
    }

    #[test]
    fn language_tag_regex_matches_documented_examples() {
        assert!(validate_language_tag("en"));
        assert!(validate_language_tag("en-US"));
        assert!(!validate_language_tag("toolongtag12345"));
    }
}
