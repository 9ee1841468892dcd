use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::features::{null_as_default, FeatureState};
use crate::identities::Identity;
use crate::segments::Segment;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Organisation {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub feature_analytics: bool,
    #[serde(default)]
    pub stop_serving_flags: bool,
    #[serde(default)]
    pub persist_trait_data: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Project {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub organisation: Option<Organisation>,
    #[serde(default)]
    pub hide_disabled_flags: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub segments: Vec<Segment>,
}

/// Everything needed to evaluate flags for one environment without asking the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Environment {
    pub id: u32,
    pub api_key: String,
    pub project: Project,
    #[serde(default, deserialize_with = "null_as_default")]
    pub feature_states: Vec<FeatureState>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub identity_overrides: Vec<Identity>,
}

impl Environment {
    pub fn from_json(document: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(document)?)
    }

    pub fn from_value(document: serde_json::Value) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(document)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_environment_from_document() {
        let environment = Environment::from_value(json!({
            "id": 1,
            "api_key": "api-key",
            "project": {
                "id": 1,
                "name": "test project",
                "organisation": {
                    "id": 1,
                    "name": "Test Org",
                    "stop_serving_flags": false,
                    "persist_trait_data": true,
                    "feature_analytics": true
                },
                "hide_disabled_flags": false,
                "segments": [{"id": 1, "name": "segment", "rules": []}]
            },
            "feature_states": [{
                "feature": {"id": 1, "name": "some_feature", "type": "STANDARD"},
                "enabled": true,
                "django_id": 1,
                "feature_state_value": "foo"
            }],
            "identity_overrides": [{
                "identifier": "overridden-id",
                "environment_api_key": "api-key",
                "identity_features": [{
                    "feature": {"id": 1, "name": "some_feature", "type": "STANDARD"},
                    "enabled": false,
                    "django_id": 2,
                    "feature_state_value": "bar"
                }]
            }]
        }))
        .unwrap();

        assert_eq!(environment.feature_states.len(), 1);
        assert_eq!(environment.identity_overrides.len(), 1);
        assert_eq!(environment.project.segments.len(), 1);
        assert_eq!(environment.project.segments[0].name, "segment");
        let organisation = environment.project.organisation.unwrap();
        assert_eq!(organisation.name, "Test Org");
        assert!(organisation.persist_trait_data);
        assert!(!organisation.stop_serving_flags);
    }

    #[test]
    fn test_null_lists_are_empty() {
        let environment = Environment::from_json(
            r#"{"id": 1, "api_key": "k", "project": {"id": 1, "name": "p", "segments": null},
               "feature_states": null, "identity_overrides": null}"#,
        )
        .unwrap();

        assert!(environment.project.segments.is_empty());
        assert!(environment.feature_states.is_empty());
        assert!(environment.identity_overrides.is_empty());
    }

    #[test]
    fn test_invalid_document() {
        assert!(matches!(
            Environment::from_json("{\"id\": 1}"),
            Err(EngineError::InvalidDocument(_))
        ));
    }
}
