use std::collections::HashMap;
use std::fmt;
use std::ops::Index;
use std::sync::Arc;

use flag_engine::engine::{ResolvedFeatureState, TargetingReason};
use flag_engine::features::FeatureState;
use serde::Serialize;
use serde_json::Value;

use crate::analytics::AnalyticsProcessor;
use crate::api::ApiFlag;
use crate::error::FlagError;
use crate::polling::EnvironmentSnapshot;

/// Builds the flag returned for features that can't be found anywhere else.
pub type DefaultFlagHandler = Arc<dyn Fn(&str) -> Flag + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Flag {
    pub feature_id: Option<u32>,
    pub feature_name: String,
    pub enabled: bool,
    pub value: Value,
    #[serde(rename = "default")]
    pub is_default: bool,
    pub reason: Option<String>,
}

impl Flag {
    /// A flag not backed by any feature, as produced by default flag handlers.
    pub fn default_flag(enabled: bool, value: impl Into<Value>) -> Self {
        Flag {
            feature_id: None,
            feature_name: String::new(),
            enabled,
            value: value.into(),
            is_default: true,
            reason: None,
        }
    }

    fn from_feature_state(
        feature_state: &FeatureState,
        bucketing_id: Option<&str>,
        reason: Option<String>,
    ) -> Self {
        Flag {
            feature_id: Some(feature_state.feature.id),
            feature_name: feature_state.feature.name.clone(),
            enabled: feature_state.enabled,
            value: feature_state.get_value(bucketing_id),
            is_default: false,
            reason,
        }
    }

    fn from_api(flag: ApiFlag) -> Self {
        Flag {
            feature_id: Some(flag.feature.id),
            feature_name: flag.feature.name,
            enabled: flag.enabled,
            value: flag.feature_state_value,
            is_default: false,
            reason: None,
        }
    }
}

/// What a flag collection falls back on, and reports to, beyond its own flags.
#[derive(Clone, Default)]
pub struct FlagsContext {
    pub analytics: Option<Arc<AnalyticsProcessor>>,
    pub default_flag_handler: Option<DefaultFlagHandler>,
    pub offline_environment: Option<Arc<EnvironmentSnapshot>>,
}

fn normalize(feature_name: &str) -> String {
    feature_name.to_lowercase()
}

/// An evaluated set of flags, looked up by case-insensitive feature name.
#[derive(Clone, Default)]
pub struct Flags {
    flags: Vec<Flag>,
    by_name: HashMap<String, usize>,
    context: FlagsContext,
}

impl Flags {
    fn new(flags: impl IntoIterator<Item = Flag>, context: FlagsContext) -> Self {
        let mut collection = Flags {
            context,
            ..Flags::default()
        };

        for flag in flags {
            let key = normalize(&flag.feature_name);
            match collection.by_name.get(&key) {
                Some(&position) => collection.flags[position] = flag,
                None => {
                    collection.by_name.insert(key, collection.flags.len());
                    collection.flags.push(flag);
                }
            }
        }

        collection
    }

    /// No flags at all, so every lookup goes to the fallbacks.
    pub fn empty(context: FlagsContext) -> Self {
        Flags::new(Vec::new(), context)
    }

    /// Environment level feature states, evaluated without an identity.
    pub fn from_feature_states(feature_states: Vec<&FeatureState>, context: FlagsContext) -> Self {
        let reason = TargetingReason::Default.to_string();
        Flags::new(
            feature_states
                .into_iter()
                .map(|fs| Flag::from_feature_state(fs, None, Some(reason.clone()))),
            context,
        )
    }

    /// Feature states resolved for an identity. A multivariate state that picked one of its
    /// variants reports the split that selected it.
    pub fn from_resolved_states(
        resolved: Vec<ResolvedFeatureState<'_>>,
        bucketing_id: &str,
        context: FlagsContext,
    ) -> Self {
        Flags::new(
            resolved.into_iter().map(|resolved| {
                let reason = match resolved.feature_state.get_multivariate_selection(bucketing_id) {
                    Some(mv_value) => format!("SPLIT; weight={}", mv_value.percentage_allocation),
                    None => resolved.reason.to_string(),
                };
                Flag::from_feature_state(resolved.feature_state, Some(bucketing_id), Some(reason))
            }),
            context,
        )
    }

    pub fn from_api_flags(api_flags: Vec<ApiFlag>, context: FlagsContext) -> Self {
        Flags::new(api_flags.into_iter().map(Flag::from_api), context)
    }

    /// Looks the flag up by name. Misses go to the offline environment if there is one, then
    /// to the default flag handler.
    pub fn get_flag(&self, feature_name: &str) -> Result<Flag, FlagError> {
        let key = normalize(feature_name);

        if let Some(&position) = self.by_name.get(&key) {
            let flag = &self.flags[position];
            if let (Some(analytics), Some(_)) = (&self.context.analytics, flag.feature_id) {
                analytics.track_feature(&flag.feature_name);
            }
            return Ok(flag.clone());
        }

        if let Some(snapshot) = &self.context.offline_environment {
            return snapshot
                .environment
                .feature_states
                .iter()
                .find(|fs| normalize(&fs.feature.name) == key)
                .map(|fs| Flag::from_feature_state(fs, None, None))
                .ok_or_else(|| {
                    FlagError::NotFound(format!(
                        "Feature does not exist: {key}, offline_handler did not find a flag in this case."
                    ))
                });
        }

        if let Some(handler) = &self.context.default_flag_handler {
            return Ok(handler(feature_name));
        }

        Err(FlagError::NotFound(format!(
            "Feature does not exist: {key}, implement default_flag_handler to handle this case."
        )))
    }

    pub fn is_feature_enabled(&self, feature_name: &str) -> Result<bool, FlagError> {
        Ok(self.get_flag(feature_name)?.enabled)
    }

    pub fn get_feature_value(&self, feature_name: &str) -> Result<Value, FlagError> {
        Ok(self.get_flag(feature_name)?.value)
    }

    /// The nth flag, in the order the flags were evaluated. Doesn't count towards analytics.
    pub fn get(&self, index: usize) -> Option<&Flag> {
        self.flags.get(index)
    }

    pub fn all_flags(&self) -> &[Flag] {
        &self.flags
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Flag> {
        self.flags.iter()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

impl Index<usize> for Flags {
    type Output = Flag;

    fn index(&self, index: usize) -> &Flag {
        &self.flags[index]
    }
}

impl<'a> IntoIterator for &'a Flags {
    type Item = &'a Flag;
    type IntoIter = std::slice::Iter<'a, Flag>;

    fn into_iter(self) -> Self::IntoIter {
        self.flags.iter()
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flags").field("flags", &self.flags).finish()
    }
}
