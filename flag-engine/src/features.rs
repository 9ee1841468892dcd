use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::hashing::hashed_percentage_for_object_ids;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Feature {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type", default)]
    pub feature_type: Option<String>,
}

// Features are the same feature if the ids match, names can be edited
impl PartialEq for Feature {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Feature {}

/// Links a segment override to its segment, carrying its priority. Lower is stronger.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FeatureSegment {
    #[serde(default)]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultivariateFeatureOption {
    #[serde(default)]
    pub id: Option<u32>,
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultivariateFeatureStateValue {
    #[serde(default)]
    pub id: Option<u32>,
    pub multivariate_feature_option: MultivariateFeatureOption,
    pub percentage_allocation: f64,
    #[serde(default = "Uuid::new_v4")]
    pub mv_fs_value_uuid: Uuid,
}

impl MultivariateFeatureStateValue {
    /// Ordering key used to lay out the percentage bands: the persisted id when there
    /// is one, the uuid's integer value otherwise.
    pub fn sort_key(&self) -> u128 {
        match self.id {
            Some(id) => u128::from(id),
            None => self.mv_fs_value_uuid.as_u128(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureState {
    pub feature: Feature,
    pub enabled: bool,
    #[serde(default)]
    pub django_id: Option<u32>,
    #[serde(rename = "feature_state_value", default)]
    pub value: Value,
    #[serde(default = "Uuid::new_v4")]
    pub featurestate_uuid: Uuid,
    #[serde(default)]
    pub feature_segment: Option<FeatureSegment>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub multivariate_feature_state_values: Vec<MultivariateFeatureStateValue>,
}

impl FeatureState {
    pub fn new(feature: Feature, enabled: bool, django_id: Option<u32>, value: Value) -> Self {
        FeatureState {
            feature,
            enabled,
            django_id,
            value,
            featurestate_uuid: Uuid::new_v4(),
            feature_segment: None,
            multivariate_feature_state_values: Vec::new(),
        }
    }

    /// The key this feature state is bucketed under for multivariate selection.
    pub fn stable_key(&self) -> String {
        match self.django_id {
            Some(id) => id.to_string(),
            None => self.featurestate_uuid.to_string(),
        }
    }

    pub fn priority(&self) -> Option<i64> {
        self.feature_segment.as_ref().and_then(|fs| fs.priority)
    }

    /// Returns the value for this feature state. With a bucketing id and multivariate values
    /// present, the value is picked from the band the bucketing id hashes into.
    pub fn get_value(&self, bucketing_id: Option<&str>) -> Value {
        match bucketing_id.and_then(|id| self.get_multivariate_selection(id)) {
            Some(mv_value) => mv_value.multivariate_feature_option.value.clone(),
            None => self.value.clone(),
        }
    }

    /// The multivariate value whose band the bucketing id hashes into, if any. `None` when
    /// there are no variants, or the weights don't add up to 100 and the hash fell through
    /// the gap.
    pub fn get_multivariate_selection(
        &self,
        bucketing_id: &str,
    ) -> Option<&MultivariateFeatureStateValue> {
        if self.multivariate_feature_state_values.is_empty() {
            return None;
        }

        let percentage_value =
            hashed_percentage_for_object_ids(&[self.stable_key().as_str(), bucketing_id]);

        let mut sorted_values: Vec<&MultivariateFeatureStateValue> =
            self.multivariate_feature_state_values.iter().collect();
        sorted_values.sort_by_key(|v| v.sort_key());

        let mut start_percentage = 0.0;
        for mv_value in sorted_values {
            let limit = start_percentage + mv_value.percentage_allocation;
            if start_percentage <= percentage_value && percentage_value < limit {
                return Some(mv_value);
            }
            start_percentage = limit;
        }

        None
    }
}

pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    let opt = Option::<T>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}
