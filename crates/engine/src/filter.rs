//! Query filter mini-language
//!
//! Filters are semicolon-separated (`;` or the legacy `;:;`) conjunctions of
//! clauses evaluated against a record's encoded form:
//!
//! - `name=value`: equality; `*` affixes turn it into contains
//!   (`*x*`), starts-with (`x*`), or ends-with (`*x`)
//! - `name>value`, `name<value`, `name>=value`, `name<=value`: numeric range
//! - `last minute` / `last hour` / `last day` / `last N seconds`: relative
//!   window on the record's creation time
//!
//! A filter is compiled once per query; compile failures are reported per
//! call as [`Error::FilterCompile`], never propagated as a panic.

use mirror_core::{Error, Result, Timestamp};
use std::time::Duration;

/// Numeric comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
}

#[derive(Debug, Clone)]
enum FilterClause {
    Equals { field: String, value: String },
    Contains { field: String, value: String },
    StartsWith { field: String, value: String },
    EndsWith { field: String, value: String },
    Compare { field: String, op: CompareOp, value: f64 },
    CreatedWithin(Duration),
}

/// A compiled filter: all clauses must hold.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    clauses: Vec<FilterClause>,
}

impl RecordFilter {
    /// Compile a filter expression. An empty expression matches everything.
    pub fn compile(expr: &str) -> Result<Self> {
        let mut clauses = Vec::new();

        for part in expr.split(";:;").flat_map(|chunk| chunk.split(';')) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            clauses.push(Self::compile_clause(part)?);
        }

        Ok(RecordFilter { clauses })
    }

    /// Whether the filter has no clauses (matches everything).
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Evaluate against a record's creation time and encoded form.
    pub fn matches(&self, created_at: Timestamp, encoded: &serde_json::Value, now: Timestamp) -> bool {
        self.clauses.iter().all(|clause| match clause {
            FilterClause::Equals { field, value } => {
                field_as_string(encoded, field).map_or(false, |v| v == *value)
            }
            FilterClause::Contains { field, value } => {
                field_as_string(encoded, field).map_or(false, |v| v.contains(value.as_str()))
            }
            FilterClause::StartsWith { field, value } => {
                field_as_string(encoded, field).map_or(false, |v| v.starts_with(value.as_str()))
            }
            FilterClause::EndsWith { field, value } => {
                field_as_string(encoded, field).map_or(false, |v| v.ends_with(value.as_str()))
            }
            FilterClause::Compare { field, op, value } => {
                field_as_number(encoded, field).map_or(false, |v| match op {
                    CompareOp::Greater => v > *value,
                    CompareOp::GreaterOrEqual => v >= *value,
                    CompareOp::Less => v < *value,
                    CompareOp::LessOrEqual => v <= *value,
                })
            }
            FilterClause::CreatedWithin(window) => {
                created_at.add_duration(*window) >= now
            }
        })
    }

    fn compile_clause(part: &str) -> Result<FilterClause> {
        if let Some(window) = Self::parse_time_macro(part) {
            return Ok(FilterClause::CreatedWithin(window));
        }

        for (token, op) in [
            (">=", Some(CompareOp::GreaterOrEqual)),
            ("<=", Some(CompareOp::LessOrEqual)),
            (">", Some(CompareOp::Greater)),
            ("<", Some(CompareOp::Less)),
            ("=", None),
        ] {
            if let Some(pos) = part.find(token) {
                let field = part[..pos].trim();
                let value = part[pos + token.len()..].trim();
                if field.is_empty() {
                    return Err(Error::FilterCompile(format!(
                        "clause has no field name: {:?}",
                        part
                    )));
                }

                return match op {
                    Some(op) => {
                        let number: f64 = value.parse().map_err(|_| {
                            Error::FilterCompile(format!(
                                "range clause needs a numeric value: {:?}",
                                part
                            ))
                        })?;
                        Ok(FilterClause::Compare {
                            field: field.to_string(),
                            op,
                            value: number,
                        })
                    }
                    None => Ok(Self::equality_clause(field, value)),
                };
            }
        }

        Err(Error::FilterCompile(format!(
            "unrecognized clause: {:?}",
            part
        )))
    }

    fn equality_clause(field: &str, value: &str) -> FilterClause {
        let field = field.to_string();
        let starts = value.starts_with('*');
        let ends = value.ends_with('*') && value.len() > 1;

        match (starts, ends) {
            (true, true) => FilterClause::Contains {
                field,
                value: value[1..value.len() - 1].to_string(),
            },
            (false, true) => FilterClause::StartsWith {
                field,
                value: value[..value.len() - 1].to_string(),
            },
            (true, false) => FilterClause::EndsWith {
                field,
                value: value[1..].to_string(),
            },
            (false, false) => FilterClause::Equals {
                field,
                value: value.to_string(),
            },
        }
    }

    fn parse_time_macro(part: &str) -> Option<Duration> {
        let lowered = part.to_ascii_lowercase();
        match lowered.as_str() {
            "last minute" => Some(Duration::from_secs(60)),
            "last hour" => Some(Duration::from_secs(3_600)),
            "last day" => Some(Duration::from_secs(86_400)),
            _ => {
                let secs = lowered
                    .strip_prefix("last ")?
                    .strip_suffix(" seconds")?
                    .trim()
                    .parse()
                    .ok()?;
                Some(Duration::from_secs(secs))
            }
        }
    }
}

/// Field lookup: exact name first, then case-insensitive.
fn field_value<'a>(encoded: &'a serde_json::Value, field: &str) -> Option<&'a serde_json::Value> {
    let object = encoded.as_object()?;
    object.get(field).or_else(|| {
        object
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(field))
            .map(|(_, value)| value)
    })
}

fn field_as_string(encoded: &serde_json::Value, field: &str) -> Option<String> {
    match field_value(encoded, field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn field_as_number(encoded: &serde_json::Value, field: &str) -> Option<f64> {
    match field_value(encoded, field)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_secs(secs)
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = RecordFilter::compile("").unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(at(0), &json!({}), at(100)));
    }

    #[test]
    fn test_equality() {
        let filter = RecordFilter::compile("name=boiler").unwrap();
        assert!(filter.matches(at(0), &json!({"name": "boiler"}), at(0)));
        assert!(!filter.matches(at(0), &json!({"name": "pump"}), at(0)));
        assert!(!filter.matches(at(0), &json!({}), at(0)));
    }

    #[test]
    fn test_equality_on_numbers_compares_textually() {
        let filter = RecordFilter::compile("zone=3").unwrap();
        assert!(filter.matches(at(0), &json!({"zone": 3}), at(0)));
        assert!(!filter.matches(at(0), &json!({"zone": 4}), at(0)));
    }

    #[test]
    fn test_field_lookup_is_case_insensitive_fallback() {
        let filter = RecordFilter::compile("Name=boiler").unwrap();
        assert!(filter.matches(at(0), &json!({"name": "boiler"}), at(0)));
    }

    #[test]
    fn test_wildcards() {
        let contains = RecordFilter::compile("name=*oil*").unwrap();
        assert!(contains.matches(at(0), &json!({"name": "boiler"}), at(0)));
        assert!(!contains.matches(at(0), &json!({"name": "pump"}), at(0)));

        let starts = RecordFilter::compile("name=boi*").unwrap();
        assert!(starts.matches(at(0), &json!({"name": "boiler"}), at(0)));
        assert!(!starts.matches(at(0), &json!({"name": "turbo-boiler"}), at(0)));

        let ends = RecordFilter::compile("name=*ler").unwrap();
        assert!(ends.matches(at(0), &json!({"name": "boiler"}), at(0)));
        assert!(!ends.matches(at(0), &json!({"name": "boilers"}), at(0)));
    }

    #[test]
    fn test_numeric_ranges() {
        let filter = RecordFilter::compile("value>20;value<=30").unwrap();
        assert!(filter.matches(at(0), &json!({"value": 25}), at(0)));
        assert!(filter.matches(at(0), &json!({"value": 30}), at(0)));
        assert!(!filter.matches(at(0), &json!({"value": 20}), at(0)));
        assert!(!filter.matches(at(0), &json!({"value": 31}), at(0)));
    }

    #[test]
    fn test_numeric_range_against_string_field() {
        let filter = RecordFilter::compile("value>=10").unwrap();
        assert!(filter.matches(at(0), &json!({"value": "12.5"}), at(0)));
        assert!(!filter.matches(at(0), &json!({"value": "not a number"}), at(0)));
    }

    #[test]
    fn test_conjunction_across_both_separators() {
        let filter = RecordFilter::compile("kind=sensor;:;zone=3;value>1").unwrap();
        let record = json!({"kind": "sensor", "zone": 3, "value": 2});
        assert!(filter.matches(at(0), &record, at(0)));

        let wrong_zone = json!({"kind": "sensor", "zone": 4, "value": 2});
        assert!(!filter.matches(at(0), &wrong_zone, at(0)));
    }

    #[test]
    fn test_time_macros() {
        let filter = RecordFilter::compile("last minute").unwrap();
        let now = at(10_000);
        assert!(filter.matches(at(9_970), &json!({}), now));
        assert!(!filter.matches(at(9_900), &json!({}), now));

        let filter = RecordFilter::compile("last 5 seconds").unwrap();
        assert!(filter.matches(at(9_996), &json!({}), now));
        assert!(!filter.matches(at(9_990), &json!({}), now));

        assert!(RecordFilter::compile("last hour").is_ok());
        assert!(RecordFilter::compile("Last Day").is_ok());
    }

    #[test]
    fn test_time_macro_combined_with_field_clause() {
        let filter = RecordFilter::compile("kind=event;last hour").unwrap();
        let now = at(10_000);
        assert!(filter.matches(at(9_000), &json!({"kind": "event"}), now));
        assert!(!filter.matches(at(1_000), &json!({"kind": "event"}), now));
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            RecordFilter::compile("=value"),
            Err(Error::FilterCompile(_))
        ));
        assert!(matches!(
            RecordFilter::compile("value>abc"),
            Err(Error::FilterCompile(_))
        ));
        assert!(matches!(
            RecordFilter::compile("no operator here"),
            Err(Error::FilterCompile(_))
        ));
    }
}
