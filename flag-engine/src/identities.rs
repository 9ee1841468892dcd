use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::features::{null_as_default, FeatureState};

/// A trait value as it arrives from the caller or the environment document.
///
/// Condition literals are coerced to the variant of the trait value they are compared
/// against, so the variant matters: `1` and `"1"` are different trait values.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TraitValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Null,
}

impl TraitValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TraitValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TraitValue::Integer(i) => Some(*i as f64),
            TraitValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            TraitValue::Bool(b) => Value::Bool(*b),
            TraitValue::Integer(i) => Value::from(*i),
            TraitValue::Float(f) => Value::from(*f),
            TraitValue::String(s) => Value::String(s.clone()),
            TraitValue::Null => Value::Null,
        }
    }
}

impl fmt::Display for TraitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraitValue::Bool(b) => write!(f, "{b}"),
            TraitValue::Integer(i) => write!(f, "{i}"),
            TraitValue::Float(v) => write!(f, "{v}"),
            TraitValue::String(s) => f.write_str(s),
            TraitValue::Null => Ok(()),
        }
    }
}

impl From<&Value> for TraitValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Bool(b) => TraitValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => TraitValue::Integer(i),
                None => n.as_f64().map_or(TraitValue::Null, TraitValue::Float),
            },
            Value::String(s) => TraitValue::String(s.clone()),
            Value::Null => TraitValue::Null,
            // objects and arrays are not valid trait values, keep their json form
            other => TraitValue::String(other.to_string()),
        }
    }
}

impl From<&str> for TraitValue {
    fn from(value: &str) -> Self {
        TraitValue::String(value.to_string())
    }
}

impl From<String> for TraitValue {
    fn from(value: String) -> Self {
        TraitValue::String(value)
    }
}

impl From<i64> for TraitValue {
    fn from(value: i64) -> Self {
        TraitValue::Integer(value)
    }
}

impl From<i32> for TraitValue {
    fn from(value: i32) -> Self {
        TraitValue::Integer(i64::from(value))
    }
}

impl From<f64> for TraitValue {
    fn from(value: f64) -> Self {
        TraitValue::Float(value)
    }
}

impl From<bool> for TraitValue {
    fn from(value: bool) -> Self {
        TraitValue::Bool(value)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Trait {
    pub trait_key: String,
    #[serde(default = "default_trait_value")]
    pub trait_value: TraitValue,
}

fn default_trait_value() -> TraitValue {
    TraitValue::Null
}

impl Trait {
    pub fn new(trait_key: impl Into<String>, trait_value: impl Into<TraitValue>) -> Self {
        Trait {
            trait_key: trait_key.into(),
            trait_value: trait_value.into(),
        }
    }
}

/// The direct feature state overrides of an identity. At most one per feature.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(try_from = "Vec<FeatureState>", into = "Vec<FeatureState>")]
pub struct IdentityFeatures {
    list: Vec<FeatureState>,
}

impl IdentityFeatures {
    pub fn new(feature_states: Vec<FeatureState>) -> Result<Self, EngineError> {
        let mut features = IdentityFeatures::default();
        for feature_state in feature_states {
            features.push(feature_state)?;
        }
        Ok(features)
    }

    pub fn push(&mut self, feature_state: FeatureState) -> Result<(), EngineError> {
        if self
            .list
            .iter()
            .any(|existing| existing.feature == feature_state.feature)
        {
            return Err(EngineError::DuplicateOverride {
                feature_id: feature_state.feature.id,
            });
        }
        self.list.push(feature_state);
        Ok(())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FeatureState> {
        self.list.iter()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

impl TryFrom<Vec<FeatureState>> for IdentityFeatures {
    type Error = EngineError;

    fn try_from(value: Vec<FeatureState>) -> Result<Self, Self::Error> {
        IdentityFeatures::new(value)
    }
}

impl From<IdentityFeatures> for Vec<FeatureState> {
    fn from(value: IdentityFeatures) -> Self {
        value.list
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Identity {
    pub identifier: String,
    pub environment_api_key: String,
    #[serde(default = "Uuid::new_v4")]
    pub identity_uuid: Uuid,
    #[serde(default)]
    pub django_id: Option<u32>,
    #[serde(default)]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub identity_traits: Vec<Trait>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub identity_features: IdentityFeatures,
}

impl Identity {
    pub fn new(
        identifier: impl Into<String>,
        environment_api_key: impl Into<String>,
        identity_traits: Vec<Trait>,
    ) -> Self {
        Identity {
            identifier: identifier.into(),
            environment_api_key: environment_api_key.into(),
            identity_uuid: Uuid::new_v4(),
            django_id: None,
            created_date: None,
            identity_traits,
            identity_features: IdentityFeatures::default(),
        }
    }

    pub fn composite_key(&self) -> String {
        format!("{}_{}", self.environment_api_key, self.identifier)
    }

    /// The id percentage based decisions are hashed with for this identity.
    pub fn bucketing_id(&self) -> String {
        match self.django_id {
            Some(id) => id.to_string(),
            None => self.composite_key(),
        }
    }

    pub fn get_trait(&self, key: &str) -> Option<&Trait> {
        self.identity_traits.iter().find(|t| t.trait_key == key)
    }

    /// Upserts the given traits. A trait with a null value removes the existing trait.
    pub fn update_traits(&mut self, traits: Vec<Trait>) {
        for new_trait in traits {
            let position = self
                .identity_traits
                .iter()
                .position(|t| t.trait_key == new_trait.trait_key);

            match (position, new_trait.trait_value.is_null()) {
                (Some(index), true) => {
                    self.identity_traits.remove(index);
                }
                (Some(index), false) => self.identity_traits[index] = new_trait,
                (None, true) => {}
                (None, false) => self.identity_traits.push(new_trait),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::Feature;
    use serde_json::json;

    fn feature_state(feature_id: u32, django_id: u32) -> FeatureState {
        FeatureState::new(
            Feature {
                id: feature_id,
                name: format!("feature_{feature_id}"),
                feature_type: None,
            },
            true,
            Some(django_id),
            Value::Null,
        )
    }

    #[test]
    fn test_composite_key() {
        let identity = Identity::new("user_1", "env_key", vec![]);
        assert_eq!(identity.composite_key(), "env_key_user_1");
        assert_eq!(identity.bucketing_id(), "env_key_user_1");
    }

    #[test]
    fn test_bucketing_id_prefers_django_id() {
        let mut identity = Identity::new("user_1", "env_key", vec![]);
        identity.django_id = Some(42);
        assert_eq!(identity.bucketing_id(), "42");
    }

    #[test]
    fn test_duplicate_override_is_rejected() {
        let mut features = IdentityFeatures::default();
        features.push(feature_state(1, 1)).unwrap();
        features.push(feature_state(2, 2)).unwrap();

        match features.push(feature_state(1, 3)) {
            Err(EngineError::DuplicateOverride { feature_id }) => assert_eq!(feature_id, 1),
            other => panic!("Expected DuplicateOverride, got {:?}", other),
        }
        assert_eq!(features.len(), 2);
    }

    #[test]
    fn test_duplicate_override_is_rejected_when_deserializing() {
        let result = serde_json::from_value::<Identity>(json!({
            "identifier": "user_1",
            "environment_api_key": "env_key",
            "identity_features": [
                {"feature": {"id": 1, "name": "a"}, "enabled": true, "django_id": 1},
                {"feature": {"id": 1, "name": "a"}, "enabled": false, "django_id": 2}
            ]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_trait_values_keep_their_type() {
        let traits: Vec<Trait> = serde_json::from_value(json!([
            {"trait_key": "a", "trait_value": 1},
            {"trait_key": "b", "trait_value": 1.5},
            {"trait_key": "c", "trait_value": "1"},
            {"trait_key": "d", "trait_value": false},
            {"trait_key": "e", "trait_value": null}
        ]))
        .unwrap();

        assert_eq!(traits[0].trait_value, TraitValue::Integer(1));
        assert_eq!(traits[1].trait_value, TraitValue::Float(1.5));
        assert_eq!(traits[2].trait_value, TraitValue::String("1".to_string()));
        assert_eq!(traits[3].trait_value, TraitValue::Bool(false));
        assert_eq!(traits[4].trait_value, TraitValue::Null);
    }

    #[test]
    fn test_update_traits_upserts_and_removes() {
        let mut identity = Identity::new(
            "user_1",
            "env_key",
            vec![Trait::new("age", 30), Trait::new("plan", "free")],
        );

        identity.update_traits(vec![
            Trait::new("age", 31),
            Trait::new("plan", TraitValue::Null),
            Trait::new("country", "NZ"),
        ]);

        assert_eq!(identity.identity_traits.len(), 2);
        assert_eq!(
            identity.get_trait("age").map(|t| &t.trait_value),
            Some(&TraitValue::Integer(31))
        );
        assert!(identity.get_trait("plan").is_none());
        assert!(identity.get_trait("country").is_some());
    }
}
