use std::collections::HashMap;
use std::fmt;

use crate::environments::Environment;
use crate::error::EngineError;
use crate::features::FeatureState;
use crate::identities::{Identity, Trait};
use crate::segments::evaluator::get_identity_segments;

pub const IDENTITY_OVERRIDE_SEGMENT_NAME: &str = "identity_override";

/// Why a feature state was chosen for an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetingReason {
    Default,
    SegmentOverride { segment_name: String },
    IdentityOverride,
}

impl fmt::Display for TargetingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetingReason::Default => f.write_str("DEFAULT"),
            TargetingReason::SegmentOverride { segment_name } => {
                write!(f, "TARGETING_MATCH; segment={segment_name}")
            }
            TargetingReason::IdentityOverride => {
                write!(f, "TARGETING_MATCH; segment={IDENTITY_OVERRIDE_SEGMENT_NAME}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedFeatureState<'a> {
    pub feature_state: &'a FeatureState,
    pub reason: TargetingReason,
}

impl ResolvedFeatureState<'_> {
    fn overridden_by_segment(&self) -> bool {
        matches!(self.reason, TargetingReason::SegmentOverride { .. })
    }
}

/// The environment's own feature states, without any disabled ones when the project hides them.
pub fn get_environment_feature_states(environment: &Environment) -> Vec<&FeatureState> {
    let hide_disabled_flags = environment.project.hide_disabled_flags;
    environment
        .feature_states
        .iter()
        .filter(|fs| !hide_disabled_flags || fs.enabled)
        .collect()
}

pub fn get_environment_feature_state<'a>(
    environment: &'a Environment,
    feature_name: &str,
) -> Result<&'a FeatureState, EngineError> {
    environment
        .feature_states
        .iter()
        .find(|fs| fs.feature.name == feature_name)
        .ok_or_else(|| EngineError::FeatureStateNotFound(feature_name.to_string()))
}

pub fn get_identity_feature_states<'a>(
    environment: &'a Environment,
    identity: &'a Identity,
    override_traits: Option<&[Trait]>,
) -> Vec<&'a FeatureState> {
    evaluate_identity_feature_states(environment, identity, override_traits)
        .into_iter()
        .map(|resolved| resolved.feature_state)
        .collect()
}

pub fn get_identity_feature_state<'a>(
    environment: &'a Environment,
    identity: &'a Identity,
    feature_name: &str,
    override_traits: Option<&[Trait]>,
) -> Result<&'a FeatureState, EngineError> {
    evaluate_identity_feature_states(environment, identity, override_traits)
        .into_iter()
        .map(|resolved| resolved.feature_state)
        .find(|fs| fs.feature.name == feature_name)
        .ok_or_else(|| EngineError::FeatureStateNotFound(feature_name.to_string()))
}

/// Resolves the feature states an identity sees, along with why each one was picked.
///
/// Starting from the environment defaults, overrides of every segment the identity is in are
/// applied in project order. A segment override only replaces another segment's override when
/// its priority is at least as strong (lower numbers are stronger and a missing priority is the
/// weakest), so on a tie the later segment wins. Direct identity overrides are applied last and
/// always win, but only for features the environment knows about. Disabled states are dropped
/// afterwards when the project hides disabled flags. The result keeps the environment's order.
pub fn evaluate_identity_feature_states<'a>(
    environment: &'a Environment,
    identity: &'a Identity,
    override_traits: Option<&[Trait]>,
) -> Vec<ResolvedFeatureState<'a>> {
    let mut resolved: HashMap<u32, ResolvedFeatureState<'a>> = environment
        .feature_states
        .iter()
        .map(|fs| {
            (
                fs.feature.id,
                ResolvedFeatureState {
                    feature_state: fs,
                    reason: TargetingReason::Default,
                },
            )
        })
        .collect();

    for segment in get_identity_segments(environment, identity, override_traits) {
        for segment_state in &segment.feature_states {
            let Some(current) = resolved.get_mut(&segment_state.feature.id) else {
                continue;
            };

            if current.overridden_by_segment()
                && !is_at_least_as_strong(segment_state.priority(), current.feature_state.priority())
            {
                continue;
            }

            *current = ResolvedFeatureState {
                feature_state: segment_state,
                reason: TargetingReason::SegmentOverride {
                    segment_name: segment.name.clone(),
                },
            };
        }
    }

    for identity_state in identity.identity_features.iter() {
        if let Some(current) = resolved.get_mut(&identity_state.feature.id) {
            *current = ResolvedFeatureState {
                feature_state: identity_state,
                reason: TargetingReason::IdentityOverride,
            };
        }
    }

    let hide_disabled_flags = environment.project.hide_disabled_flags;
    environment
        .feature_states
        .iter()
        .filter_map(|fs| resolved.remove(&fs.feature.id))
        .filter(|r| !hide_disabled_flags || r.feature_state.enabled)
        .collect()
}

fn is_at_least_as_strong(candidate: Option<i64>, current: Option<i64>) -> bool {
    match (candidate, current) {
        (Some(candidate), Some(current)) => candidate <= current,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}
