//! Header-filter DSL used by document listings and chunk search.
//!
//! Filters arrive as a JSON object whose meaning depends on the shape of
//! each value:
//!
//! - `{"field": "v"}` — equality.
//! - `{"field": ["a", "b"]}` — membership.
//! - `{"field": {"$gt": "10", "type": "integer"}}` — typed comparison.
//! - `{"field": [{"$gte": "1"}, {"$lt": "9"}]}` — AND of several conditions
//!   on the same field.
//!
//! The wire shapes are parsed into a tagged AST ([`Clause`]) and validated
//! exhaustively up front; malformed shapes never reach the SQL builder.
//! Serialization emits the canonical shorthand for single-clause fields so
//! that `parse(serialize(f)) == f` for any parseable filter.

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while interpreting a filter document.
#[derive(Debug, Error)]
pub enum FilterError {
    /// The filter string was not valid JSON or used an unsupported shape.
    #[error("invalid filter: {0}")]
    Invalid(String),
}

/// Comparison operators accepted inside condition objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// `$eq`
    Eq,
    /// `$gt`
    Gt,
    /// `$gte`
    Gte,
    /// `$lt`
    Lt,
    /// `$lte`
    Lte,
}

impl Operator {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "$eq" => Some(Self::Eq),
            "$gt" => Some(Self::Gt),
            "$gte" => Some(Self::Gte),
            "$lt" => Some(Self::Lt),
            "$lte" => Some(Self::Lte),
            _ => None,
        }
    }

    fn wire_name(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
        }
    }

    /// SQL comparison token for this operator.
    pub fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }
}

/// How both sides of a comparison are cast before evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cast {
    /// Plain text comparison (default).
    #[default]
    Text,
    /// `CAST(.. AS INTEGER)`
    Integer,
    /// `CAST(.. AS NUMERIC)`
    Numeric,
}

impl Cast {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "text" => Some(Self::Text),
            "integer" => Some(Self::Integer),
            "numeric" => Some(Self::Numeric),
            _ => None,
        }
    }

    fn wire_name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Numeric => "numeric",
        }
    }
}

/// One predicate applied to a single header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Clause {
    /// Header value equals the given string.
    Equals(String),
    /// Header value is one of the given strings. Never empty.
    AnyOf(Vec<String>),
    /// Typed comparison between the header value and a literal.
    Compare {
        /// Comparison operator.
        op: Operator,
        /// Right-hand literal, cast together with the header value.
        value: String,
        /// Cast applied to both sides.
        cast: Cast,
    },
}

/// Parsed filter: header field → AND-ed clause list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DocumentFilter(
    /// Clauses per lowercased header field; all entries AND together.
    pub BTreeMap<String, Vec<Clause>>,
);

impl DocumentFilter {
    /// Parse a filter from its JSON string form. An empty string or `{}`
    /// yields an empty filter.
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| FilterError::Invalid(e.to_string()))
    }

    /// Whether the filter constrains anything at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add an equality clause, builder-style.
    pub fn with_equal(mut self, field: &str, value: &str) -> Self {
        self.0
            .entry(field.to_lowercase())
            .or_default()
            .push(Clause::Equals(value.to_string()));
        self
    }

    /// Add a membership clause, builder-style.
    pub fn with_any_of(mut self, field: &str, values: &[&str]) -> Self {
        self.0
            .entry(field.to_lowercase())
            .or_default()
            .push(Clause::AnyOf(values.iter().map(|v| v.to_string()).collect()));
        self
    }

    /// Add a typed comparison clause, builder-style.
    pub fn with_compare(mut self, field: &str, op: Operator, value: &str, cast: Cast) -> Self {
        self.0.entry(field.to_lowercase()).or_default().push(Clause::Compare {
            op,
            value: value.to_string(),
            cast,
        });
        self
    }
}

fn string_array(field: &str, items: &[Value]) -> Result<Vec<String>, String> {
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| format!("array values must be strings for field '{field}'"))
        })
        .collect()
}

/// Interpret a single condition object such as `{"$gt": "10", "type": "integer"}`.
///
/// `{"$eq": v}` without a cast normalizes to [`Clause::Equals`] and
/// `{"$in": [..]}` to [`Clause::AnyOf`], so the parsed AST has one canonical
/// representation per meaning.
fn parse_condition(field: &str, object: &Map<String, Value>) -> Result<Clause, String> {
    let mut cast = Cast::default();
    let mut operator: Option<(&str, &Value)> = None;

    for (key, value) in object {
        if key == "type" {
            let name = value
                .as_str()
                .ok_or_else(|| format!("'type' must be a string for field '{field}'"))?;
            cast = Cast::parse(name)
                .ok_or_else(|| format!("unsupported type '{name}' for field '{field}'"))?;
            continue;
        }
        if operator.is_some() {
            return Err(format!("multiple operators in one condition for field '{field}'"));
        }
        operator = Some((key, value));
    }

    let (op_name, op_value) = operator
        .ok_or_else(|| format!("filter condition must have an operator for field '{field}'"))?;

    if op_name == "$in" {
        return match op_value {
            Value::Array(items) if items.is_empty() => {
                Err(format!("empty array not allowed for field '{field}'"))
            }
            Value::Array(items) => Ok(Clause::AnyOf(string_array(field, items)?)),
            Value::String(single) => Ok(Clause::Equals(single.clone())),
            _ => Err(format!("'$in' expects an array of strings for field '{field}'")),
        };
    }

    let op = Operator::parse(op_name)
        .ok_or_else(|| format!("unsupported operator '{op_name}' for field '{field}'"))?;
    let value = op_value
        .as_str()
        .ok_or_else(|| format!("operator value must be a string for field '{field}'"))?
        .to_owned();

    if op == Operator::Eq && cast == Cast::Text {
        return Ok(Clause::Equals(value));
    }
    Ok(Clause::Compare { op, value, cast })
}

fn parse_clauses(field: &str, value: &Value) -> Result<Vec<Clause>, String> {
    match value {
        Value::String(s) => Ok(vec![Clause::Equals(s.clone())]),
        Value::Array(items) => {
            if items.is_empty() {
                return Err(format!("empty array not allowed for field '{field}'"));
            }
            match &items[0] {
                Value::String(_) => Ok(vec![Clause::AnyOf(string_array(field, items)?)]),
                Value::Object(_) => items
                    .iter()
                    .map(|item| {
                        let object = item.as_object().ok_or_else(|| {
                            format!("mixed array shapes not allowed for field '{field}'")
                        })?;
                        parse_condition(field, object)
                    })
                    .collect(),
                _ => Err(format!("unsupported array element type for field '{field}'")),
            }
        }
        Value::Object(object) => Ok(vec![parse_condition(field, object)?]),
        _ => Err(format!("unsupported filter value type for field '{field}'")),
    }
}

impl<'de> Deserialize<'de> for DocumentFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        let mut parsed = BTreeMap::new();
        for (field, value) in &raw {
            let clauses = parse_clauses(field, value).map_err(D::Error::custom)?;
            parsed.insert(field.to_lowercase(), clauses);
        }
        Ok(Self(parsed))
    }
}

fn condition_value(clause: &Clause) -> Value {
    match clause {
        Clause::Equals(value) => serde_json::json!({ "$eq": value }),
        Clause::AnyOf(values) => serde_json::json!({ "$in": values }),
        Clause::Compare { op, value, cast } => {
            let mut object = Map::new();
            object.insert(op.wire_name().to_string(), Value::String(value.clone()));
            if *cast != Cast::Text {
                object.insert("type".to_string(), Value::String(cast.wire_name().to_string()));
            }
            Value::Object(object)
        }
    }
}

impl Serialize for DocumentFilter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (field, clauses) in &self.0 {
            let value = match clauses.as_slice() {
                [] => continue,
                [Clause::Equals(v)] => Value::String(v.clone()),
                [Clause::AnyOf(vs)] => {
                    Value::Array(vs.iter().cloned().map(Value::String).collect())
                }
                [single] => condition_value(single),
                many => Value::Array(many.iter().map(condition_value).collect()),
            };
            map.serialize_entry(field, &value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(filter: &DocumentFilter) -> DocumentFilter {
        let encoded = serde_json::to_string(filter).expect("filter serializes");
        DocumentFilter::parse(&encoded).expect("serialized filter parses")
    }

    #[test]
    fn parses_equality_shorthand() {
        let filter = DocumentFilter::parse(r#"{"Status": "active"}"#).unwrap();
        assert_eq!(filter.0["status"], vec![Clause::Equals("active".into())]);
    }

    #[test]
    fn parses_membership_shorthand() {
        let filter = DocumentFilter::parse(r#"{"env": ["prod", "staging"]}"#).unwrap();
        assert_eq!(
            filter.0["env"],
            vec![Clause::AnyOf(vec!["prod".into(), "staging".into()])]
        );
    }

    #[test]
    fn parses_typed_comparison() {
        let filter = DocumentFilter::parse(r#"{"priority": {"$gte": "10", "type": "integer"}}"#)
            .unwrap();
        assert_eq!(
            filter.0["priority"],
            vec![Clause::Compare {
                op: Operator::Gte,
                value: "10".into(),
                cast: Cast::Integer,
            }]
        );
    }

    #[test]
    fn parses_condition_list() {
        let filter =
            DocumentFilter::parse(r#"{"n": [{"$gt": "1", "type": "numeric"}, {"$lt": "9"}]}"#)
                .unwrap();
        assert_eq!(filter.0["n"].len(), 2);
    }

    #[test]
    fn normalizes_eq_and_in_conditions() {
        let filter =
            DocumentFilter::parse(r#"{"a": {"$eq": "x"}, "b": {"$in": ["p", "q"]}}"#).unwrap();
        assert_eq!(filter.0["a"], vec![Clause::Equals("x".into())]);
        assert_eq!(filter.0["b"], vec![Clause::AnyOf(vec!["p".into(), "q".into()])]);
    }

    #[test]
    fn rejects_empty_array() {
        assert!(DocumentFilter::parse(r#"{"f": []}"#).is_err());
        assert!(DocumentFilter::parse(r#"{"f": {"$in": []}}"#).is_err());
    }

    #[test]
    fn rejects_unknown_operator_and_type() {
        assert!(DocumentFilter::parse(r#"{"f": {"$regex": "x"}}"#).is_err());
        assert!(DocumentFilter::parse(r#"{"f": {"$gt": "1", "type": "date"}}"#).is_err());
    }

    #[test]
    fn rejects_mixed_and_ambiguous_shapes() {
        assert!(DocumentFilter::parse(r#"{"f": ["a", {"$gt": "1"}]}"#).is_err());
        assert!(DocumentFilter::parse(r#"{"f": {"$gt": "1", "$lt": "2"}}"#).is_err());
        assert!(DocumentFilter::parse(r#"{"f": {}}"#).is_err());
        assert!(DocumentFilter::parse(r#"{"f": 7}"#).is_err());
    }

    #[test]
    fn empty_input_means_no_filter() {
        assert!(DocumentFilter::parse("").unwrap().is_empty());
        assert!(DocumentFilter::parse("{}").unwrap().is_empty());
    }

    #[test]
    fn roundtrips_every_expressible_shape() {
        let filters = [
            DocumentFilter::default().with_equal("status", "active"),
            DocumentFilter::default().with_any_of("env", &["prod", "staging"]),
            DocumentFilter::default().with_compare("p", Operator::Gt, "10", Cast::Integer),
            DocumentFilter::default().with_compare("p", Operator::Lte, "1.5", Cast::Numeric),
            DocumentFilter::default()
                .with_compare("n", Operator::Gte, "1", Cast::Text)
                .with_compare("n", Operator::Lt, "9", Cast::Text)
                .with_equal("status", "done"),
            DocumentFilter::default().with_compare("eqint", Operator::Eq, "3", Cast::Integer),
        ];
        for filter in filters {
            assert_eq!(roundtrip(&filter), filter);
        }
    }

    #[test]
    fn field_names_are_lowercased() {
        let filter = DocumentFilter::parse(r#"{"X-Source": "feed"}"#).unwrap();
        assert!(filter.0.contains_key("x-source"));
    }
}
