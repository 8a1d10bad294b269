use std::collections::BTreeMap;

use serde_json::Value;

/// The fixed trait schema. Keys outside this set are recorded as schema
/// issues during merge, never merged and never fatal.
pub const CANONICAL_TRAIT_KEYS: &[&str] = &[
    "requires_renderer",
    "requires_legacy_telephony",
    "requires_fax_encoding",
    "supports_inbound",
    "inbound_verification",
    "needs_object_storage",
    "outbound_status_only",
];

pub fn is_canonical_trait(key: &str) -> bool {
    CANONICAL_TRAIT_KEYS.contains(&key)
}

/// Lookup direction for trait queries. `Any` is the logical OR of both
/// directions (outbound preferred for value lookups).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
    Any,
}

/// Capability/requirement flags for one provider, restricted to the
/// canonical key set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderTraits {
    values: BTreeMap<String, Value>,
}

impl ProviderTraits {
    /// Builds a trait set from raw JSON, keeping canonical keys and
    /// returning the unknown ones for the caller's schema-issue ledger.
    pub fn from_raw(raw: &serde_json::Map<String, Value>) -> (Self, Vec<String>) {
        let mut values = BTreeMap::new();
        let mut unknown = Vec::new();
        for (key, value) in raw {
            if is_canonical_trait(key) {
                values.insert(key.clone(), value.clone());
            } else {
                unknown.push(key.clone());
            }
        }
        unknown.sort();
        unknown.dedup();
        (Self { values }, unknown)
    }

    /// Overlays `other` on top of self; the overlay wins on conflict.
    pub fn merged_with(&self, other: &ProviderTraits) -> ProviderTraits {
        let mut values = self.values.clone();
        for (key, value) in &other.values {
            values.insert(key.clone(), value.clone());
        }
        ProviderTraits { values }
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.values.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Null) | None => false,
            Some(_) => true,
        }
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One provider row in the merged registry.
#[derive(Debug, Clone, Default)]
pub struct ProviderEntry {
    pub id: String,
    pub kind: Option<String>,
    pub traits: ProviderTraits,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> serde_json::Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn unknown_keys_are_reported_not_merged() {
        let (traits, unknown) = ProviderTraits::from_raw(&raw(json!({
            "supports_inbound": true,
            "frobnicates": true,
            "inbound_verification": "hmac",
        })));
        assert_eq!(unknown, vec!["frobnicates"]);
        assert!(traits.flag("supports_inbound"));
        assert!(!traits.flag("frobnicates"));
    }

    #[test]
    fn overlay_wins_on_conflict() {
        let (base, _) = ProviderTraits::from_raw(&raw(json!({
            "supports_inbound": false,
            "needs_object_storage": true,
        })));
        let (overlay, _) = ProviderTraits::from_raw(&raw(json!({ "supports_inbound": true })));
        let merged = base.merged_with(&overlay);
        assert!(merged.flag("supports_inbound"));
        assert!(merged.flag("needs_object_storage"));
    }

    #[test]
    fn string_valued_traits_are_truthy() {
        let (traits, _) =
            ProviderTraits::from_raw(&raw(json!({ "inbound_verification": "basic" })));
        assert!(traits.flag("inbound_verification"));
        assert_eq!(
            traits.value("inbound_verification"),
            Some(&json!("basic"))
        );
    }
}
