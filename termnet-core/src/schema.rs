//! Request schemas.
//!
//! Schemas travel inside `TerminalInfo` as standard JSON Schema. The keywords the
//! overlap check reasons about are parsed into a small AST; every other keyword is
//! carried verbatim in [`Schema::Keywords`] so nothing is lost on the wire.
//! Validation compiles the rendered document with `jsonschema`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    pub fn matches(self, value: &Value) -> bool {
        match self {
            JsonType::Null => value.is_null(),
            JsonType::Boolean => value.is_boolean(),
            JsonType::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().map_or(false, |f| f.fract() == 0.0)
                }
                _ => false,
            },
            JsonType::Number => value.is_number(),
            JsonType::String => value.is_string(),
            JsonType::Array => value.is_array(),
            JsonType::Object => value.is_object(),
        }
    }

    fn overlaps(self, other: JsonType) -> bool {
        use JsonType::*;
        self == other || matches!((self, other), (Integer, Number) | (Number, Integer))
    }

    fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum Schema {
    Any,
    Const(Value),
    Enum(Vec<Value>),
    Type(JsonType),
    /// `required` + `properties`. Applies to objects only; other values pass.
    Object {
        required: Vec<String>,
        properties: BTreeMap<String, Schema>,
    },
    /// `minimum` / `maximum`, inclusive. Applies to numbers only.
    Range {
        minimum: Option<f64>,
        maximum: Option<f64>,
    },
    /// Exactly one branch must validate.
    OneOf(Vec<Schema>),
    AnyOf(Vec<Schema>),
    AllOf(Vec<Schema>),
    /// Keywords outside the AST (`pattern`, `format`, `items`, ...), kept as written.
    Keywords(Map<String, Value>),
}

const AST_KEYWORDS: [&str; 10] = [
    "type", "const", "enum", "required", "properties", "minimum", "maximum", "oneOf", "anyOf",
    "allOf",
];

impl Default for Schema {
    fn default() -> Self {
        Schema::Any
    }
}

impl Schema {
    pub fn object(required: &[&str], properties: impl IntoIterator<Item = (String, Schema)>) -> Self {
        Schema::Object {
            required: required.iter().map(|s| s.to_string()).collect(),
            properties: properties.into_iter().collect(),
        }
    }

    /// `{type: object, required: [k..], properties: {k: {const: v}}}`
    pub fn pinned<'a>(fields: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let mut required = Vec::new();
        let mut properties = BTreeMap::new();
        for (key, value) in fields {
            required.push(key.to_string());
            properties.insert(key.to_string(), Schema::Const(value));
        }
        Schema::AllOf(vec![
            Schema::Type(JsonType::Object),
            Schema::Object {
                required,
                properties,
            },
        ])
    }

    /// One-off check. Compiles the schema on every call; routers use a [`Validator`].
    pub fn matches(&self, value: &Value) -> bool {
        jsonschema::validator_for(&self.to_json()).map_or(false, |v| v.is_valid(value))
    }

    /// Parse standard JSON Schema keywords. A document with several keywords
    /// becomes `AllOf` of one node per keyword.
    pub fn from_json(doc: &Value) -> Result<Self, SchemaError> {
        let obj = match doc {
            Value::Bool(true) => return Ok(Schema::Any),
            Value::Bool(false) => return Ok(Schema::Enum(Vec::new())),
            Value::Object(obj) => obj,
            _ => return Err(SchemaError::NotAnObject),
        };
        let mut parts = Vec::new();

        if let Some(t) = obj.get("type") {
            parts.push(parse_type(t)?);
        }
        if let Some(v) = obj.get("const") {
            parts.push(Schema::Const(v.clone()));
        }
        if let Some(v) = obj.get("enum") {
            let values = v.as_array().ok_or(SchemaError::Keyword("enum"))?;
            parts.push(Schema::Enum(values.clone()));
        }
        if obj.contains_key("required") || obj.contains_key("properties") {
            let required = match obj.get("required") {
                None => Vec::new(),
                Some(v) => v
                    .as_array()
                    .ok_or(SchemaError::Keyword("required"))?
                    .iter()
                    .map(|k| k.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or(SchemaError::Keyword("required"))?,
            };
            let mut properties = BTreeMap::new();
            if let Some(v) = obj.get("properties") {
                let props = v.as_object().ok_or(SchemaError::Keyword("properties"))?;
                for (key, sub) in props {
                    properties.insert(key.clone(), Schema::from_json(sub)?);
                }
            }
            parts.push(Schema::Object {
                required,
                properties,
            });
        }
        let minimum = number_keyword(obj, "minimum")?;
        let maximum = number_keyword(obj, "maximum")?;
        if minimum.is_some() || maximum.is_some() {
            parts.push(Schema::Range { minimum, maximum });
        }
        let combinators: [(&'static str, fn(Vec<Schema>) -> Schema); 3] = [
            ("oneOf", Schema::OneOf),
            ("anyOf", Schema::AnyOf),
            ("allOf", Schema::AllOf),
        ];
        for (key, make) in combinators {
            if let Some(v) = obj.get(key) {
                let branches = v.as_array().ok_or(SchemaError::Keyword(key))?;
                let branches = branches
                    .iter()
                    .map(Schema::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                parts.push(make(branches));
            }
        }
        let rest: Map<String, Value> = obj
            .iter()
            .filter(|(k, _)| !AST_KEYWORDS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !rest.is_empty() {
            parts.push(Schema::Keywords(rest));
        }

        Ok(match parts.len() {
            0 => Schema::Any,
            1 => parts.remove(0),
            _ => Schema::AllOf(parts),
        })
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.to_map())
    }

    fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Schema::Any => {}
            Schema::Const(v) => {
                map.insert("const".into(), v.clone());
            }
            Schema::Enum(values) => {
                map.insert("enum".into(), Value::Array(values.clone()));
            }
            Schema::Type(t) => {
                map.insert("type".into(), serde_json::to_value(t).unwrap_or(Value::Null));
            }
            Schema::Object {
                required,
                properties,
            } => {
                if !required.is_empty() {
                    map.insert("required".into(), required.clone().into());
                }
                if !properties.is_empty() {
                    let props = properties
                        .iter()
                        .map(|(k, s)| (k.clone(), s.to_json()))
                        .collect();
                    map.insert("properties".into(), Value::Object(props));
                }
            }
            Schema::Range { minimum, maximum } => {
                if let Some(m) = minimum {
                    map.insert("minimum".into(), (*m).into());
                }
                if let Some(m) = maximum {
                    map.insert("maximum".into(), (*m).into());
                }
            }
            Schema::OneOf(b) => {
                map.insert("oneOf".into(), b.iter().map(Schema::to_json).collect());
            }
            Schema::AnyOf(b) => {
                map.insert("anyOf".into(), b.iter().map(Schema::to_json).collect());
            }
            Schema::Keywords(rest) => {
                map.extend(rest.clone());
            }
            Schema::AllOf(parts) => {
                // Flatten back into one document when the parts use distinct keywords.
                let mut merged = Map::new();
                for part in parts {
                    let sub = part.to_map();
                    if sub.keys().any(|k| merged.contains_key(k)) {
                        map.insert("allOf".into(), parts.iter().map(Schema::to_json).collect());
                        return map;
                    }
                    merged.extend(sub);
                }
                return merged;
            }
        }
        map
    }
}

fn parse_type(t: &Value) -> Result<Schema, SchemaError> {
    match t {
        Value::String(s) => JsonType::parse(s)
            .map(Schema::Type)
            .ok_or_else(|| SchemaError::UnknownType(s.clone())),
        Value::Array(list) => {
            let kinds = list
                .iter()
                .map(|v| parse_type(v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Schema::AnyOf(kinds))
        }
        _ => Err(SchemaError::Keyword("type")),
    }
}

fn number_keyword(obj: &Map<String, Value>, key: &'static str) -> Result<Option<f64>, SchemaError> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or(SchemaError::Keyword(key)),
    }
}

impl From<Schema> for Value {
    fn from(schema: Schema) -> Self {
        schema.to_json()
    }
}

impl TryFrom<Value> for Schema {
    type Error = SchemaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Schema::from_json(&value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema must be an object or boolean")]
    NotAnObject,
    #[error("malformed `{0}` keyword")]
    Keyword(&'static str),
    #[error("unknown type `{0}`")]
    UnknownType(String),
}

impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// Pluggable schema check. The engine never depends on a concrete validator.
pub trait Validator: Send + Sync {
    fn validate(&self, schema: &Schema, value: &Value) -> bool;
}

const COMPILED_CACHE_LIMIT: usize = 1024;

/// Compiles each distinct schema once with `jsonschema` and keeps it.
/// A schema that does not compile matches nothing.
#[derive(Default)]
pub struct JsonSchemaValidator {
    compiled: Mutex<HashMap<String, Option<Arc<jsonschema::Validator>>>>,
}

impl JsonSchemaValidator {
    fn compiled(&self, schema: &Schema) -> Option<Arc<jsonschema::Validator>> {
        let doc = schema.to_json();
        let key = doc.to_string();
        let mut cache = self.compiled.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
        let built = match jsonschema::options().build(&doc) {
            Ok(v) => Some(Arc::new(v)),
            Err(e) => {
                tracing::warn!(schema = %key, error = %e, "schema does not compile; nothing will match it");
                None
            }
        };
        if cache.len() >= COMPILED_CACHE_LIMIT {
            cache.clear();
        }
        cache.insert(key, built.clone());
        built
    }
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.compiled.lock().map_or(0, |c| c.len());
        f.debug_struct("JsonSchemaValidator").field("compiled", &n).finish()
    }
}

impl Validator for JsonSchemaValidator {
    fn validate(&self, schema: &Schema, value: &Value) -> bool {
        if matches!(schema, Schema::Any) {
            return true;
        }
        self.compiled(schema).map_or(false, |v| v.is_valid(value))
    }
}

// JSON Schema compares numbers by value: 1 and 1.0 are the same constant.
fn const_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// True when no value can satisfy both schemas. Conservative: `false` means "maybe overlapping".
pub fn disjoint(a: &Schema, b: &Schema) -> bool {
    use Schema::*;
    match (a, b) {
        (AllOf(parts), other) | (other, AllOf(parts)) => parts.iter().any(|p| disjoint(p, other)),
        (OneOf(branches), other)
        | (other, OneOf(branches))
        | (AnyOf(branches), other)
        | (other, AnyOf(branches)) => branches.iter().all(|br| disjoint(br, other)),
        (Const(x), Const(y)) => !const_eq(x, y),
        (Const(x), Enum(ys)) | (Enum(ys), Const(x)) => !ys.iter().any(|y| const_eq(x, y)),
        (Enum(xs), Enum(ys)) => !xs.iter().any(|x| ys.iter().any(|y| const_eq(x, y))),
        (Type(t), Type(u)) => !t.overlaps(*u),
        (Const(x), Type(t)) | (Type(t), Const(x)) => !t.matches(x),
        (Enum(xs), Type(t)) | (Type(t), Enum(xs)) => !xs.iter().any(|x| t.matches(x)),
        (
            Object {
                required: ra,
                properties: pa,
            },
            Object {
                required: rb,
                properties: pb,
            },
        ) => pa.iter().any(|(key, sa)| {
            let Some(sb) = pb.get(key) else {
                return false;
            };
            (ra.contains(key) || rb.contains(key)) && disjoint(sa, sb)
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> Schema {
        Schema::from_json(&v).unwrap()
    }

    #[test]
    fn required_object() {
        let s = parse(json!({"required": ["x"]}));
        assert!(s.matches(&json!({"x": 5})));
        assert!(!s.matches(&json!({"y": 5})));
    }

    #[test]
    fn type_with_properties_is_all_of() {
        let s = parse(json!({
            "type": "object",
            "required": ["channel_id"],
            "properties": {"channel_id": {"const": ""}}
        }));
        assert!(matches!(s, Schema::AllOf(ref parts) if parts.len() == 2));
        assert!(s.matches(&json!({"channel_id": ""})));
        assert!(!s.matches(&json!({"channel_id": "x"})));
        assert!(!s.matches(&json!("channel_id")));
        assert_eq!(parse(s.to_json()), s);
    }

    #[test]
    fn one_of_needs_exactly_one() {
        let s = parse(json!({"oneOf": [{"minimum": 0}, {"maximum": 10}]}));
        assert!(s.matches(&json!(-5)));
        assert!(s.matches(&json!(20)));
        assert!(!s.matches(&json!(5)));
    }

    #[test]
    fn enum_and_integer() {
        let s = parse(json!({"enum": ["OKX", "BINANCE"]}));
        assert!(s.matches(&json!("OKX")));
        assert!(!s.matches(&json!("GATE")));
        let int = parse(json!({"type": "integer"}));
        assert!(int.matches(&json!(3)));
        assert!(!int.matches(&json!(3.5)));
    }

    #[test]
    fn extra_keywords_are_kept_and_enforced() {
        let s = parse(json!({"type": "string", "pattern": "^A"}));
        assert_eq!(
            s,
            Schema::AllOf(vec![
                Schema::Type(JsonType::String),
                Schema::Keywords(json!({"pattern": "^A"}).as_object().unwrap().clone()),
            ])
        );
        assert_eq!(s.to_json(), json!({"type": "string", "pattern": "^A"}));
        let v = JsonSchemaValidator::default();
        assert!(v.validate(&s, &json!("ABC")));
        assert!(!v.validate(&s, &json!("zzz")));
    }

    #[test]
    fn nested_keywords_survive_the_wire() {
        let s = parse(json!({
            "type": "object",
            "required": ["symbol"],
            "properties": {"symbol": {"type": "string", "minLength": 3}},
            "additionalProperties": false
        }));
        let text = serde_json::to_string(&s).unwrap();
        let back: Schema = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
        let v = JsonSchemaValidator::default();
        assert!(v.validate(&back, &json!({"symbol": "BTC"})));
        assert!(!v.validate(&back, &json!({"symbol": "BT"})));
        assert!(!v.validate(&back, &json!({"symbol": "BTC", "side": "buy"})));
    }

    #[test]
    fn uncompilable_schema_matches_nothing() {
        let s = Schema::Keywords(json!({"pattern": "("}).as_object().unwrap().clone());
        assert!(!JsonSchemaValidator::default().validate(&s, &json!("x")));
    }

    #[test]
    fn opaque_keywords_never_prove_disjointness() {
        let a = parse(json!({"pattern": "^A"}));
        let b = parse(json!({"pattern": "^B"}));
        assert!(!disjoint(&a, &b));
    }

    #[test]
    fn malformed_keyword_rejected() {
        assert_eq!(
            Schema::from_json(&json!({"required": "x"})),
            Err(SchemaError::Keyword("required"))
        );
        assert_eq!(
            Schema::from_json(&json!({"type": "float"})),
            Err(SchemaError::UnknownType("float".into()))
        );
    }

    #[test]
    fn serde_goes_through_json_schema() {
        let s = Schema::pinned([("account_id", json!("A"))]);
        let text = serde_json::to_string(&s).unwrap();
        assert!(text.contains("\"const\":\"A\""));
        let back: Schema = serde_json::from_str(&text).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn pinned_constants_are_disjoint() {
        let a = Schema::pinned([("current_tx_account_id", json!("A"))]);
        let b = Schema::pinned([("current_tx_account_id", json!("B"))]);
        assert!(disjoint(&a, &b));
        assert!(!disjoint(&a, &a));
    }

    #[test]
    fn open_schemas_may_overlap() {
        let a = parse(json!({"required": ["x"]}));
        let b = parse(json!({"required": ["y"]}));
        assert!(!disjoint(&a, &b));
        assert!(!disjoint(&Schema::Any, &a));
    }

    #[test]
    fn types_disjoint_except_number_family() {
        let s = Schema::Type(JsonType::String);
        let n = Schema::Type(JsonType::Number);
        let i = Schema::Type(JsonType::Integer);
        assert!(disjoint(&s, &n));
        assert!(!disjoint(&n, &i));
        assert!(disjoint(&Schema::Const(json!(1)), &s));
    }

    #[test]
    fn one_of_disjoint_when_every_branch_is() {
        let routes = Schema::OneOf(vec![
            Schema::pinned([("k", json!("A"))]),
            Schema::pinned([("k", json!("B"))]),
        ]);
        assert!(disjoint(&routes, &Schema::pinned([("k", json!("C"))])));
        assert!(!disjoint(&routes, &Schema::pinned([("k", json!("B"))])));
    }
}
