//! Configuration document model
//!
//! Collector configuration is a nested document (`receivers`, `processors`,
//! `exporters`, `service.pipelines`, ...). [`ConfigValue`] models it as a
//! recursive tagged value with explicit merge and section access, so callers
//! never have to inspect untyped maps.

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const CONTENT_TYPE_YAML: &str = "text/yaml";
pub const CONTENT_TYPE_JSON: &str = "application/json";

pub type ConfigMap = BTreeMap<String, ConfigValue>;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A configuration value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConfigValue {
    #[default]
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(ConfigMap),
}

impl ConfigValue {
    pub fn empty_map() -> Self {
        ConfigValue::Map(ConfigMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ConfigValue::Null)
    }

    pub fn as_map(&self) -> Option<&ConfigMap> {
        match self {
            ConfigValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Direct child of a map value
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Walk a path of map keys. Any missing or non-map intermediate yields `None`.
    pub fn section<S: AsRef<str>>(&self, path: &[S]) -> Option<&ConfigValue> {
        path.iter()
            .try_fold(self, |value, key| value.get(key.as_ref()))
    }

    /// Walk a path of map keys, creating empty maps along the way.
    ///
    /// A non-map value found where a map is needed (including `self`) is
    /// replaced by an empty map.
    pub fn section_mut_or_insert<S: AsRef<str>>(&mut self, path: &[S]) -> &mut ConfigValue {
        let mut current = self;
        for key in path {
            let map = current.make_map();
            current = map
                .entry(key.as_ref().to_owned())
                .or_insert_with(ConfigValue::empty_map);
        }
        current
    }

    /// Replace the value at `path`, creating intermediate maps as needed
    pub fn set_section<S: AsRef<str>>(&mut self, path: &[S], value: ConfigValue) {
        *self.section_mut_or_insert(path) = value;
    }

    /// Merge `patch` into `self`.
    ///
    /// Maps merge key by key, recursively. A `Null` in the patch removes the
    /// key. Any other patch value replaces the current one. Applying the same
    /// patch twice gives the same result as applying it once.
    pub fn merge(&mut self, patch: &ConfigValue) {
        match patch {
            ConfigValue::Map(patch_map) => {
                let map = self.make_map();
                for (key, patch_value) in patch_map {
                    if patch_value.is_null() {
                        map.remove(key);
                    } else {
                        map.entry(key.clone())
                            .or_insert(ConfigValue::Null)
                            .merge(patch_value);
                    }
                }
            }
            other => *self = other.clone(),
        }
    }

    /// Merged copy of `self` and `patch`
    pub fn merged(&self, patch: &ConfigValue) -> ConfigValue {
        let mut result = self.clone();
        result.merge(patch);
        result
    }

    /// Decode a config file body. JSON when the content type says so,
    /// YAML otherwise. An empty body decodes to `Null`.
    pub fn decode(body: &[u8], content_type: &str) -> Result<Self, DocumentError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ConfigValue::Null);
        }
        if content_type.to_ascii_lowercase().contains("json") {
            Ok(serde_json::from_slice(body)?)
        } else {
            Ok(serde_yaml::from_slice(body)?)
        }
    }

    pub fn to_yaml(&self) -> Result<String, DocumentError> {
        Ok(serde_yaml::to_string(self)?)
    }

    fn make_map(&mut self) -> &mut ConfigMap {
        if !matches!(self, ConfigValue::Map(_)) {
            *self = ConfigValue::empty_map();
        }
        match self {
            ConfigValue::Map(map) => map,
            _ => unreachable!("value was just replaced by a map"),
        }
    }
}

impl Serialize for ConfigValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ConfigValue::Null => serializer.serialize_unit(),
            ConfigValue::Bool(b) => serializer.serialize_bool(*b),
            ConfigValue::Integer(i) => serializer.serialize_i64(*i),
            ConfigValue::Float(f) => serializer.serialize_f64(*f),
            ConfigValue::String(s) => serializer.serialize_str(s),
            ConfigValue::List(items) => items.serialize(serializer),
            ConfigValue::Map(map) => map.serialize(serializer),
        }
    }
}

struct ConfigValueVisitor;

impl<'de> Visitor<'de> for ConfigValueVisitor {
    type Value = ConfigValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a configuration value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ConfigValue, E> {
        Ok(i64::try_from(v)
            .map(ConfigValue::Integer)
            .unwrap_or(ConfigValue::Float(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ConfigValue, E> {
        Ok(ConfigValue::String(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ConfigValue, E> {
        Ok(ConfigValue::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<ConfigValue, D::Error> {
        ConfigValue::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<ConfigValue, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(ConfigValue::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ConfigValue, A::Error> {
        let mut map = ConfigMap::new();
        while let Some((key, value)) = access.next_entry::<String, ConfigValue>()? {
            map.insert(key, value);
        }
        Ok(ConfigValue::Map(map))
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ConfigValueVisitor)
    }
}

impl From<serde_json::Value> for ConfigValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ConfigValue::Null,
            serde_json::Value::Bool(b) => ConfigValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ConfigValue::Integer(i),
                None => ConfigValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => ConfigValue::String(s),
            serde_json::Value::Array(items) => {
                ConfigValue::List(items.into_iter().map(ConfigValue::from).collect())
            }
            serde_json::Value::Object(map) => ConfigValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ConfigValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<ConfigValue> for serde_json::Value {
    fn from(value: ConfigValue) -> Self {
        match value {
            ConfigValue::Null => serde_json::Value::Null,
            ConfigValue::Bool(b) => serde_json::Value::Bool(b),
            ConfigValue::Integer(i) => serde_json::Value::from(i),
            ConfigValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ConfigValue::String(s) => serde_json::Value::String(s),
            ConfigValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            ConfigValue::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_owned())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Float(value)
    }
}

impl From<ConfigMap> for ConfigValue {
    fn from(value: ConfigMap) -> Self {
        ConfigValue::Map(value)
    }
}

impl From<Vec<ConfigValue>> for ConfigValue {
    fn from(value: Vec<ConfigValue>) -> Self {
        ConfigValue::List(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> ConfigValue {
        ConfigValue::from(value)
    }

    #[test]
    fn test_merge_creates_missing_sections() {
        let mut base = doc(json!({"receivers": {"otlp": {}}}));
        base.section_mut_or_insert(&["processors", "tail_sampling"])
            .merge(&doc(json!({"decision_wait": "10s"})));

        assert_eq!(
            base,
            doc(json!({
                "receivers": {"otlp": {}},
                "processors": {"tail_sampling": {"decision_wait": "10s"}}
            }))
        );
    }

    #[test]
    fn test_merge_leaves_unrelated_sections_untouched() {
        let mut base = doc(json!({
            "processors": {
                "batch": {"timeout": "1s"},
                "tail_sampling": {"policies": [{"name": "old"}], "num_traces": 100}
            },
            "exporters": {"otlp": {"endpoint": "collector:4317"}}
        }));
        base.section_mut_or_insert(&["processors", "tail_sampling"])
            .merge(&doc(json!({"policies": [{"name": "new"}]})));

        assert_eq!(
            base,
            doc(json!({
                "processors": {
                    "batch": {"timeout": "1s"},
                    "tail_sampling": {"policies": [{"name": "new"}], "num_traces": 100}
                },
                "exporters": {"otlp": {"endpoint": "collector:4317"}}
            }))
        );
    }

    #[test]
    fn test_merge_null_removes_key() {
        let mut base = doc(json!({"a": 1, "b": 2}));
        base.merge(&doc(json!({"a": null})));
        assert_eq!(base, doc(json!({"b": 2})));
    }

    #[test]
    fn test_malformed_intermediate_is_replaced() {
        let mut base = doc(json!({"processors": "not-a-map"}));
        base.set_section(&["processors", "tail_sampling"], doc(json!({"x": 1})));
        assert_eq!(
            base,
            doc(json!({"processors": {"tail_sampling": {"x": 1}}}))
        );

        let mut scalar = ConfigValue::from("scalar root");
        scalar.set_section(&["a"], ConfigValue::from(true));
        assert_eq!(scalar, doc(json!({"a": true})));
    }

    #[test]
    fn test_section_lookup_tolerates_shape() {
        let value = doc(json!({"processors": ["not", "a", "map"]}));
        assert!(value.section(&["processors", "tail_sampling"]).is_none());
        assert!(ConfigValue::Null.section(&["processors"]).is_none());
        assert_eq!(value.section::<&str>(&[]), Some(&value));
    }

    #[test]
    fn test_decode_yaml_and_json() {
        let yaml = b"processors:\n  tail_sampling:\n    decision_wait: 10s\n    num_traces: 50\n";
        let from_yaml = ConfigValue::decode(yaml, CONTENT_TYPE_YAML).unwrap();
        assert_eq!(
            from_yaml.section(&["processors", "tail_sampling", "num_traces"]),
            Some(&ConfigValue::Integer(50))
        );

        let json_body = br#"{"processors": {"tail_sampling": {"decision_wait": "10s"}}}"#;
        let from_json = ConfigValue::decode(json_body, CONTENT_TYPE_JSON).unwrap();
        assert_eq!(
            from_json.section(&["processors", "tail_sampling", "decision_wait"]),
            Some(&ConfigValue::from("10s"))
        );

        assert_eq!(ConfigValue::decode(b"  \n", "").unwrap(), ConfigValue::Null);
    }

    #[test]
    fn test_decode_malformed_yaml_fails() {
        let result = ConfigValue::decode(b"processors: [unclosed", CONTENT_TYPE_YAML);
        assert!(matches!(result, Err(DocumentError::Yaml(_))));
    }

    #[test]
    fn test_yaml_output_reads_back() {
        let original = doc(json!({
            "processors": {"tail_sampling": {"policies": [{"name": "p", "type": "always_sample"}]}},
            "ratio": 0.5,
            "enabled": true
        }));
        let yaml = original.to_yaml().unwrap();
        let decoded = ConfigValue::decode(yaml.as_bytes(), CONTENT_TYPE_YAML).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_json_conversion_back_and_forth() {
        let value = json!({"a": [1, "two", false, null, 2.5]});
        let config = ConfigValue::from(value.clone());
        assert_eq!(serde_json::Value::from(config), value);
    }

    fn arb_value() -> impl Strategy<Value = ConfigValue> {
        let leaf = prop_oneof![
            Just(ConfigValue::Null),
            any::<bool>().prop_map(ConfigValue::Bool),
            any::<i64>().prop_map(ConfigValue::Integer),
            "[a-z]{0,6}".prop_map(ConfigValue::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..3).prop_map(ConfigValue::List),
                prop::collection::btree_map("[a-d]", inner, 0..4).prop_map(ConfigValue::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_merge_is_idempotent(base in arb_value(), patch in arb_value()) {
            let once = base.merged(&patch);
            let twice = once.merged(&patch);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_section_merge_only_touches_section(base in arb_value(), patch in arb_value()) {
            let mut merged = base.clone();
            merged.section_mut_or_insert(&["processors", "tail_sampling"]).merge(&patch);

            if let (Some(before), Some(after)) = (base.as_map(), merged.as_map()) {
                for (key, value) in before {
                    if key != "processors" {
                        prop_assert_eq!(after.get(key), Some(value));
                    }
                }
            }
        }
    }
}
