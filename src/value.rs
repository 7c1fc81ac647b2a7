//! Dynamic values exchanged with the child runtime.
//!
//! [`DynamicValue`] is the host-side typed tree; [`serde_json::Value`] is the
//! generic tree that travels on the wire. Numbers are kept as arbitrary
//! precision decimals on the typed side so nothing is rounded through `f64`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bigdecimal::BigDecimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

/// Rendering used for values that are not known yet (e.g. computed later).
pub const UNKNOWN_PLACEHOLDER: &str = "<unknown>";

#[derive(Debug, Clone, PartialEq)]
pub enum DynamicValue {
    Null,
    String(String),
    Bool(bool),
    Number(BigDecimal),
    List(Vec<DynamicValue>),
    Object(BTreeMap<String, DynamicValue>),
    /// A value the host cannot know yet. Has no JSON shape of its own and is
    /// rendered as [`UNKNOWN_PLACEHOLDER`].
    Unknown,
}

impl DynamicValue {
    /// Convert to the generic JSON tree. Never fails: anything without a JSON
    /// shape is rendered as a string.
    pub fn to_generic(&self) -> Value {
        match self {
            DynamicValue::Null => Value::Null,
            DynamicValue::String(s) => Value::String(s.clone()),
            DynamicValue::Bool(b) => Value::Bool(*b),
            DynamicValue::Number(n) => number_to_generic(n),
            DynamicValue::List(items) => {
                Value::Array(items.iter().map(DynamicValue::to_generic).collect())
            }
            DynamicValue::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_generic()))
                    .collect::<Map<String, Value>>(),
            ),
            DynamicValue::Unknown => Value::String(UNKNOWN_PLACEHOLDER.to_string()),
        }
    }

    /// Convert from the generic JSON tree. Total over every JSON value.
    pub fn from_generic(value: &Value) -> Self {
        match value {
            Value::Null => DynamicValue::Null,
            Value::Bool(b) => DynamicValue::Bool(*b),
            Value::String(s) => DynamicValue::String(s.clone()),
            Value::Number(n) => match BigDecimal::from_str(&n.to_string()) {
                Ok(decimal) => DynamicValue::Number(decimal),
                // JSON numbers always parse; keep the text if that ever changes
                Err(_) => DynamicValue::String(n.to_string()),
            },
            Value::Array(items) => {
                DynamicValue::List(items.iter().map(DynamicValue::from_generic).collect())
            }
            Value::Object(fields) => DynamicValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), DynamicValue::from_generic(v)))
                    .collect(),
            ),
        }
    }

    /// Build a number from a float. NaN and infinities have no decimal form
    /// and fall back to their string rendering.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return DynamicValue::String(value.to_string());
        }
        match BigDecimal::from_str(&value.to_string()) {
            Ok(decimal) => DynamicValue::Number(decimal),
            Err(_) => DynamicValue::String(value.to_string()),
        }
    }

    pub fn object<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, DynamicValue)>,
    {
        DynamicValue::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynamicValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            DynamicValue::Number(n) => Some(n),
            _ => None,
        }
    }

    /// Field lookup on objects.
    pub fn get(&self, key: &str) -> Option<&DynamicValue> {
        match self {
            DynamicValue::Object(fields) => fields.get(key),
            _ => None,
        }
    }
}

fn number_to_generic(n: &BigDecimal) -> Value {
    // BigDecimal の Display は JSON の数値文法に収まる（指数表記を含む）
    let text = n.to_string();
    match Number::from_str(&text) {
        Ok(number) => Value::Number(number),
        Err(_) => Value::String(text),
    }
}

impl fmt::Display for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_generic())
    }
}

impl From<&Value> for DynamicValue {
    fn from(value: &Value) -> Self {
        DynamicValue::from_generic(value)
    }
}

impl From<Value> for DynamicValue {
    fn from(value: Value) -> Self {
        DynamicValue::from_generic(&value)
    }
}

impl From<&DynamicValue> for Value {
    fn from(value: &DynamicValue) -> Self {
        value.to_generic()
    }
}

impl From<DynamicValue> for Value {
    fn from(value: DynamicValue) -> Self {
        value.to_generic()
    }
}

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        DynamicValue::String(value.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(value: String) -> Self {
        DynamicValue::String(value)
    }
}

impl From<bool> for DynamicValue {
    fn from(value: bool) -> Self {
        DynamicValue::Bool(value)
    }
}

impl From<i64> for DynamicValue {
    fn from(value: i64) -> Self {
        DynamicValue::Number(BigDecimal::from(value))
    }
}

impl From<u64> for DynamicValue {
    fn from(value: u64) -> Self {
        DynamicValue::Number(BigDecimal::from(value))
    }
}

impl From<BigDecimal> for DynamicValue {
    fn from(value: BigDecimal) -> Self {
        DynamicValue::Number(value)
    }
}

impl<T: Into<DynamicValue>> From<Vec<T>> for DynamicValue {
    fn from(items: Vec<T>) -> Self {
        DynamicValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl Serialize for DynamicValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_generic().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DynamicValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(|value| DynamicValue::from_generic(&value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dec(s: &str) -> DynamicValue {
        DynamicValue::Number(BigDecimal::from_str(s).unwrap())
    }

    fn sample_tree() -> DynamicValue {
        DynamicValue::object([
            ("name", DynamicValue::from("widget")),
            ("enabled", DynamicValue::Bool(true)),
            ("nothing", DynamicValue::Null),
            ("count", DynamicValue::from(42i64)),
            ("ratio", dec("0.1")),
            (
                "tags",
                DynamicValue::List(vec!["a".into(), "b".into(), DynamicValue::Null]),
            ),
            (
                "nested",
                DynamicValue::object([("deep", DynamicValue::List(vec![dec("-3.25")]))]),
            ),
        ])
    }

    #[test]
    fn test_round_trip_preserves_tree() {
        let tree = sample_tree();
        let generic = tree.to_generic();
        assert_eq!(DynamicValue::from_generic(&generic), tree);
    }

    #[test]
    fn test_round_trip_through_wire_text() {
        let tree = sample_tree();
        let text = serde_json::to_string(&tree).unwrap();
        let back: DynamicValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_large_numbers_keep_precision() {
        let big = "123456789012345678901234567890.000000000000000000001";
        let value = dec(big);
        let generic = value.to_generic();
        assert_eq!(generic.to_string(), big);
        assert_eq!(DynamicValue::from_generic(&generic), value);
    }

    #[test]
    fn test_integer_and_float_forms_converge() {
        let one = DynamicValue::from_generic(&serde_json::from_str::<Value>("1").unwrap());
        let one_point_zero =
            DynamicValue::from_generic(&serde_json::from_str::<Value>("1.0").unwrap());
        assert_eq!(one, one_point_zero);
    }

    #[test]
    fn test_unrepresentable_values_fall_back_to_strings() {
        assert_eq!(DynamicValue::Unknown.to_generic(), json!(UNKNOWN_PLACEHOLDER));
        assert_eq!(DynamicValue::from_f64(f64::NAN), DynamicValue::String("NaN".into()));
        assert_eq!(
            DynamicValue::from_f64(f64::INFINITY),
            DynamicValue::String("inf".into())
        );
        assert_eq!(DynamicValue::from_f64(2.5), dec("2.5"));
    }

    #[test]
    fn test_from_generic_object_access() {
        let value = DynamicValue::from(json!({"value": "x", "n": 7}));
        assert_eq!(value.get("value").and_then(DynamicValue::as_str), Some("x"));
        assert_eq!(
            value.get("n").and_then(DynamicValue::as_decimal),
            Some(&BigDecimal::from(7))
        );
        assert!(value.get("missing").is_none());
    }

    #[test]
    fn test_edge_shapes_round_trip() {
        let mut deep = DynamicValue::from("bottom");
        for depth in 0..64 {
            deep = if depth % 2 == 0 {
                DynamicValue::List(vec![deep])
            } else {
                DynamicValue::object([("next", deep)])
            };
        }

        let cases = vec![
            DynamicValue::List(Vec::new()),
            DynamicValue::Object(BTreeMap::new()),
            DynamicValue::Null,
            DynamicValue::Bool(false),
            DynamicValue::from(""),
            dec("1e-30"),
            dec("6.02E+23"),
            dec("-0.000000000000000000000000000000001"),
            deep,
        ];
        for value in cases {
            let generic = value.to_generic();
            assert_eq!(DynamicValue::from_generic(&generic), value);
            let text = serde_json::to_string(&value).unwrap();
            assert_eq!(serde_json::from_str::<DynamicValue>(&text).unwrap(), value);
        }
    }
}
